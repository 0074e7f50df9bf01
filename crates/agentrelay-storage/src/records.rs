//! Snapshot record types.
//!
//! Field names are serialized in camelCase so the snapshot file stays
//! readable by other tooling that inspects it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Recurring heartbeat configuration for one context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub prompt: String,
}

impl HeartbeatSettings {
    pub fn new(interval_ms: u64, prompt: impl Into<String>) -> Self {
        Self {
            enabled: true,
            interval_ms,
            prompt: prompt.into(),
        }
    }
}

/// Persisted state of one conversation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRecord {
    /// Provider session id used for continuation runs
    pub session_id: String,
    /// Backend that issued `session_id`; a session is only resumed by the
    /// backend that created it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_backend: Option<String>,
    /// Number of completed direct (non-autonomous) runs
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub total_input_tokens: u64,
    #[serde(default)]
    pub total_output_tokens: u64,
    /// Per-context model override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Review-before-apply permission mode
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub plan_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatSettings>,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
}

impl ContextRecord {
    /// Create a fresh record with a newly allocated session id.
    pub fn new() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            session_id: Uuid::new_v4().to_string(),
            session_backend: None,
            message_count: 0,
            total_cost_usd: 0.0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            model: None,
            plan_mode: false,
            heartbeat: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the heartbeat is configured and switched on.
    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat.as_ref().is_some_and(|hb| hb.enabled)
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}

impl Default for ContextRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// The whole persisted snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub contexts: BTreeMap<String, ContextRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_model: Option<String>,
}
