//! JSON decoding with path-aware error messages.
//!
//! Used for both the durable cache blob and remote GraphQL documents, where a
//! bare `serde_json` error ("invalid type at line 1 column 48213") is useless.

use anyhow::Result;
use serde::de::DeserializeOwned;

/// Characters of surrounding context shown around the failing column.
const SNIPPET_CONTEXT: usize = 20;

/// Parse `body` into `T`. On failure, the error names the serde path, the
/// expected/actual types and a snippet of the offending line.
pub fn parse_json_with_context<T: DeserializeOwned>(body: &str) -> Result<T> {
    let de = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(de).map_err(|err| {
        let inner = err.inner();
        let (line, column) = (inner.line(), inner.column());
        let path = err.path().to_string();

        let msg = inner.to_string();
        let loc = format!(" at line {line} column {column}");
        let msg = msg.strip_suffix(&loc).unwrap_or(&msg);

        let mut out = String::new();
        if !path.is_empty() && path != "." {
            out.push_str(&format!("at path '{path}': "));
        }
        out.push_str(&format!(
            "{} (line {line} col {column})\n{}",
            describe_mismatch(msg),
            snippet(body, line, column)
        ));
        anyhow::anyhow!(out)
    })
}

/// Rewrite `invalid type: X, expected Y` as `expected Y, got X`.
fn describe_mismatch(msg: &str) -> String {
    if let Some(rest) = msg.strip_prefix("invalid type: ")
        && let Some((actual, expected)) = rest.split_once(", expected ")
    {
        return format!("expected {expected}, got {actual}");
    }
    msg.to_string()
}

fn snippet(body: &str, line: usize, column: usize) -> String {
    let target: Vec<char> = body
        .lines()
        .nth(line.saturating_sub(1))
        .unwrap_or("")
        .chars()
        .collect();
    if target.is_empty() {
        return "(empty line)".to_string();
    }

    let error_idx = column.saturating_sub(1).min(target.len());
    let start = error_idx.saturating_sub(SNIPPET_CONTEXT / 2);
    let end = (error_idx + SNIPPET_CONTEXT / 2).min(target.len());
    let slice: String = target[start..end].iter().collect();
    let indicator = " ".repeat(error_idx - start) + "^";

    format!("...{slice}...\n   {indicator}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn describe_mismatch_rewrites_invalid_type() {
        assert_eq!(
            describe_mismatch("invalid type: null, expected a string"),
            "expected a string, got null"
        );
        assert_eq!(describe_mismatch("expected value"), "expected value");
    }

    #[test]
    fn error_names_nested_path() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Record {
            #[serde(rename = "cachedAt")]
            cached_at: i64,
        }

        let json = r#"{"alice": {"cachedAt": "yesterday"}}"#;
        let result: Result<std::collections::HashMap<String, Record>> =
            parse_json_with_context(json);

        let err = result.unwrap_err().to_string();
        assert!(err.contains("alice.cachedAt"), "{err}");
        assert!(err.contains("got string"), "{err}");
    }

    #[test]
    fn snippet_handles_multibyte_lines() {
        let body = "{\"名前\": \"東京\", \"x\": nul}";
        let out = snippet(body, 1, 22);
        assert!(out.contains('^'));
    }
}
