//! Wire protocol types
//!
//! Frames carry JSON envelopes `{type, id, data}`; responses echo the
//! request id and carry either `data` or `error`. The request set is the
//! complete surface the daemon serves: ping, status, log, suggest,
//! feedback, search, explain, shutdown.

use crate::engine::rerank::Preferences;
use crate::server::error::WireError;
use serde::Deserialize;
use serde_json::{json, Value};

/// A parsed request envelope. `id` is opaque to the daemon and echoed
/// back verbatim.
#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default)]
    pub data: Value,
}

impl RequestEnvelope {
    pub fn parse(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Envelope id as a dedup key, when one was supplied.
    pub fn dedup_key(&self) -> Option<String> {
        if self.id.is_null() {
            return None;
        }
        Some(self.id.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct LogRequest {
    pub command: String,
    pub cwd: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ns: Option<u64>,
    pub session_id: String,
    #[serde(default)]
    pub shell_kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuggestRequest {
    pub partial: String,
    pub cwd: String,
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub preferences: Option<Preferences>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackRequest {
    pub explain_id: String,
    pub accepted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExplainRequest {
    pub explain_id: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Response assembly
// ─────────────────────────────────────────────────────────────────────────────

/// Successful response mirroring the request id.
pub fn ok_response(id: &Value, kind: &str, data: Value) -> Value {
    json!({
        "type": kind,
        "id": id,
        "data": data,
    })
}

/// Error response mirroring the request id.
pub fn error_response(id: &Value, error: &WireError) -> Value {
    json!({
        "id": id,
        "error": error.to_body(),
    })
}
