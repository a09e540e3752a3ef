use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one WhatsApp device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unknown,
    /// A QR code is (or is about to be) available for scanning.
    Pending,
    Connecting,
    /// A pairing code was issued instead of a QR.
    PairingCode,
    Connected,
    Disconnected,
    Invalid,
    Error,
    Deleted,
}

impl SessionState {
    /// States that keep the per-session poll loop alive.
    pub fn wants_polling(self) -> bool {
        matches!(
            self,
            SessionState::Pending | SessionState::Connecting | SessionState::PairingCode
        )
    }

    /// A `connected` session never regresses to one of these from a stale
    /// poll snapshot; only an explicit disconnect/error/delete moves it.
    pub fn is_stale_after_connected(self) -> bool {
        matches!(
            self,
            SessionState::Unknown
                | SessionState::Pending
                | SessionState::Connecting
                | SessionState::PairingCode
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistorySyncStatus {
    Idle,
    Running,
    Completed,
    Error,
}

impl Default for HistorySyncStatus {
    fn default() -> Self {
        HistorySyncStatus::Idle
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySyncState {
    pub enabled: bool,
    #[serde(default)]
    pub status: HistorySyncStatus,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

/// Client-side view of one WhatsApp session.
///
/// Invariant: at most one of `qr_payload` / `pairing_code` is set, and only
/// while `state` is `Pending` / `PairingCode` respectively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub session_id: String,
    pub state: SessionState,
    #[serde(default)]
    pub qr_payload: Option<String>,
    #[serde(default)]
    pub pairing_code: Option<String>,
    /// The device has paired before and holds stored keys.
    #[serde(default)]
    pub has_stored_keys: bool,
    /// The session reached `connected` at least once in its lifetime.
    #[serde(default)]
    pub has_connected: bool,
    #[serde(default)]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history_sync: HistorySyncState,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Connection {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: SessionState::Unknown,
            qr_payload: None,
            pairing_code: None,
            has_stored_keys: false,
            has_connected: false,
            last_connected_at: None,
            history_sync: HistorySyncState::default(),
            last_error: None,
        }
    }

    pub fn clear_pairing_artifacts(&mut self) {
        self.qr_payload = None;
        self.pairing_code = None;
    }
}
