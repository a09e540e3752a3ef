use crate::error::{ApiError, AuthWatch};
use crate::types::chat::{Chat, ChatStatus, TabCounts};
use crate::types::connection::{HistorySyncStatus, SessionState};
use crate::types::contact::Contact;
use crate::types::message::{Message, MessageContent};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Snapshot of one session as reported by the status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusResponse {
    pub status: SessionState,
    #[serde(default)]
    pub qr: Option<String>,
    #[serde(default)]
    pub qr_base64: Option<String>,
    #[serde(default)]
    pub pairing_code: Option<String>,
    #[serde(default)]
    pub has_stored_keys: bool,
    #[serde(default)]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_history: bool,
    #[serde(default)]
    pub history_sync_status: HistorySyncStatus,
    #[serde(default)]
    pub history_synced_at: Option<DateTime<Utc>>,
}

impl SessionStatusResponse {
    /// The renderable QR artifact, preferring the raw payload.
    pub fn qr_artifact(&self) -> Option<String> {
        self.qr.clone().or_else(|| self.qr_base64.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrResponse {
    #[serde(default)]
    pub qr: Option<String>,
    #[serde(default)]
    pub qr_base64: Option<String>,
}

impl QrResponse {
    pub fn artifact(&self) -> Option<String> {
        self.qr.clone().or_else(|| self.qr_base64.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponse {
    pub pairing_code: String,
}

/// Filterable, cursor-paginated chat list request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatQuery {
    #[serde(default)]
    pub status: Option<ChatStatus>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPage {
    pub items: Vec<Chat>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    /// Server-side per-tab totals; present on first-page (replace) loads.
    #[serde(default)]
    pub counts: Option<TabCounts>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Cursor for fetching the next (older) page.
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Everything the sync engine needs from the server. The HTTP transport
/// implements this once; tests inject a mock.
#[async_trait]
pub trait ConsoleApi: Send + Sync {
    async fn session_status(&self, id: &str) -> Result<SessionStatusResponse, ApiError>;
    async fn create_session(&self, id: &str) -> Result<SessionStatusResponse, ApiError>;
    async fn delete_session(&self, id: &str) -> Result<(), ApiError>;
    async fn fetch_qr(&self, id: &str) -> Result<QrResponse, ApiError>;
    async fn request_pairing_code(
        &self,
        id: &str,
        phone: &str,
    ) -> Result<PairingResponse, ApiError>;
    async fn reconnect_session(&self, id: &str) -> Result<(), ApiError>;
    async fn disconnect_session(&self, id: &str) -> Result<(), ApiError>;
    async fn set_history_sync(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<SessionStatusResponse, ApiError>;

    async fn list_chats(&self, query: &ChatQuery) -> Result<ChatPage, ApiError>;
    async fn list_messages(
        &self,
        chat_id: &str,
        cursor: Option<&str>,
    ) -> Result<MessagePage, ApiError>;
    async fn assign_chat(&self, chat_id: &str, user_id: &str) -> Result<Chat, ApiError>;
    async fn reassign_chat(
        &self,
        chat_id: &str,
        user_id: Option<&str>,
        queue_id: Option<&str>,
    ) -> Result<Chat, ApiError>;
    async fn close_chat(&self, chat_id: &str) -> Result<Chat, ApiError>;
    /// `local_id` is echoed back on the returned message so the optimistic
    /// placeholder collapses onto the authoritative copy.
    async fn send_message(
        &self,
        chat_id: &str,
        local_id: &str,
        content: &MessageContent,
    ) -> Result<Message, ApiError>;

    async fn resolve_contact(&self, phone: &str) -> Result<Option<Contact>, ApiError>;
    async fn upsert_contact(&self, phone: &str, display_name: &str) -> Result<Contact, ApiError>;
    async fn fetch_avatar(&self, media_ref: &str) -> Result<Bytes, ApiError>;
}

/// Wraps an API call with the configured deadline and escalates 401/403
/// to the client-wide invalidation signal. Every component goes through
/// this; no call may hang past the deadline.
pub(crate) async fn guarded<T, F>(
    auth: &AuthWatch,
    deadline: Duration,
    fut: F,
) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>>,
{
    let res = match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(ApiError::Transport(format!(
            "request timed out after {}s",
            deadline.as_secs()
        ))),
    };
    if matches!(res, Err(ApiError::Auth)) {
        warn!(target: "Api", "authorization rejected by server, revoking client session");
        auth.revoke();
    }
    res
}
