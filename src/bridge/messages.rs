//! Messages exchanged with the peer context.

use serde::{Deserialize, Serialize};

/// Sent from the bridge to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeRequest {
    #[serde(rename_all = "camelCase")]
    FetchLocation {
        screen_name: String,
        request_id: String,
    },
}

/// Sent from the peer back to the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerMessage {
    LocationResponse(LocationResponse),
    /// Unsolicited notice that the remote endpoint is throttling us.
    #[serde(rename_all = "camelCase")]
    RateLimitInfo {
        /// Absolute reset time, Unix seconds.
        reset_time: i64,
        /// Suggested wait in milliseconds.
        wait_time: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationResponse {
    pub screen_name: String,
    pub request_id: String,
    pub location: Option<String>,
    pub location_accurate: Option<bool>,
    pub full_result: Option<serde_json::Value>,
    #[serde(default)]
    pub is_rate_limited: bool,
    /// Set when the peer's lookup failed outright.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LocationResponse {
    /// An empty response for `request`, to be filled in by the peer.
    pub fn empty(screen_name: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            screen_name: screen_name.into(),
            request_id: request_id.into(),
            location: None,
            location_accurate: None,
            full_result: None,
            is_rate_limited: false,
            error: None,
        }
    }
}
