use serde::{Deserialize, Serialize};

use crate::model::Email;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Remove,
}

/// One entry on the subscription feed consumed by the UI and the
/// notification system. Removals carry the last known copy of the message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub account_id: String,
    pub kind: ChangeKind,
    pub email: Email,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Idle,
    Connecting,
    Syncing,
    Backoff,
    Disabled,
}

/// Surfaced account status. Only user-actionable conditions travel here:
/// disabled accounts, persistent backoff past the configured threshold,
/// classifier key rejection, and recovery after any of those.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStatusEvent {
    pub account_id: String,
    pub state: EngineState,
    pub consecutive_failures: u32,
    pub detail: Option<String>,
}
