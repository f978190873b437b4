//! GraphQL-backed [`LocationSource`].
//!
//! The query itself is opaque to this crate: the configured endpoint is
//! called with `{"variables": {"screenName": ..}}` and the answer is read
//! from a handful of well-known paths. The whole user document is passed
//! through untouched as the full profile.

use super::{LocationSource, SourceError, SourceReply};
use crate::json::parse_json_with_context;
use crate::utils::unix_seconds;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use std::time::Duration;
use tracing::trace;
use url::Url;

/// Where the user document sits in the response.
const USER_POINTER: &str = "/data/user_result_by_screen_name/result";
/// Relative to the user document.
const LOCATION_POINTER: &str = "/about_profile/account_based_in";
const ACCURATE_POINTER: &str = "/about_profile/location_accurate";

/// Header carrying the throttling window's end, Unix seconds.
const RATE_LIMIT_RESET_HEADER: &str = "x-rate-limit-reset";

/// Reset times further out than this are clamped.
const MAX_RESET_HORIZON_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct GraphqlConfig {
    pub url: Url,
    pub bearer: Option<String>,
    pub csrf_token: Option<String>,
    /// Assumed throttling window when a 429 carries no reset header.
    pub default_rate_limit_wait: Duration,
    pub request_timeout: Duration,
}

pub struct GraphqlSource {
    http: reqwest::Client,
    config: GraphqlConfig,
}

impl GraphqlSource {
    pub fn new(config: GraphqlConfig) -> Result<Self, SourceError> {
        let mut headers = HeaderMap::new();
        if let Some(bearer) = &config.bearer
            && let Ok(value) = HeaderValue::from_str(&format!("Bearer {bearer}"))
        {
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(token) = &config.csrf_token
            && let Ok(value) = HeaderValue::from_str(token)
        {
            headers.insert("x-csrf-token", value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { http, config })
    }

    fn reset_at(&self, headers: &HeaderMap) -> i64 {
        let now = unix_seconds();
        let default_wait =
            i64::try_from(self.config.default_rate_limit_wait.as_secs()).unwrap_or(i64::MAX);
        headers
            .get(RATE_LIMIT_RESET_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|reset| reset.min(now.saturating_add(MAX_RESET_HORIZON_SECS)))
            .unwrap_or_else(|| now.saturating_add(default_wait.min(MAX_RESET_HORIZON_SECS)))
    }
}

/// Pull the location fields out of a GraphQL response document.
pub fn extract_reply(mut document: serde_json::Value) -> SourceReply {
    let Some(user) = document.pointer_mut(USER_POINTER).map(serde_json::Value::take) else {
        return SourceReply::default();
    };
    if user.is_null() {
        return SourceReply::default();
    }

    let location = user
        .pointer(LOCATION_POINTER)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned);
    let location_accurate = user.pointer(ACCURATE_POINTER).and_then(|v| v.as_bool());

    SourceReply {
        location,
        location_accurate,
        full_result: Some(user),
    }
}

#[async_trait]
impl LocationSource for GraphqlSource {
    async fn lookup(&self, screen_name: &str) -> Result<SourceReply, SourceError> {
        let body = serde_json::json!({ "variables": { "screenName": screen_name } });

        let resp = self
            .http
            .post(self.config.url.clone())
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::RateLimited {
                reset_at: self.reset_at(resp.headers()),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let text = resp.text().await?;
        let document: serde_json::Value =
            parse_json_with_context(&text).map_err(SourceError::Parse)?;
        trace!(bytes = text.len(), "GraphQL response received");

        Ok(extract_reply(document))
    }
}
