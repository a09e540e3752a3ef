//! Scriptable in-memory `ConsoleApi` implementation plus fixtures, shared
//! by the unit and integration tests.

use crate::api::{
    ChatPage, ChatQuery, ConsoleApi, MessagePage, PairingResponse, QrResponse,
    SessionStatusResponse,
};
use crate::error::ApiError;
use crate::types::chat::{Chat, ChatStatus, Role, Viewer};
use crate::types::connection::{HistorySyncStatus, SessionState};
use crate::types::contact::{Contact, normalize_phone};
use crate::types::message::{Direction, Message, MessageContent, MessageStatus};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct CallCounts {
    pub status: AtomicUsize,
    pub create: AtomicUsize,
    pub qr: AtomicUsize,
    pub resolve: AtomicUsize,
    pub avatar: AtomicUsize,
    pub send: AtomicUsize,
}

/// Mock server. Responses are scripted per endpoint with FIFO queues;
/// endpoints without a scripted response fall back to benign defaults.
#[derive(Default)]
pub struct MockApi {
    pub status_responses: Mutex<HashMap<String, VecDeque<Result<SessionStatusResponse, ApiError>>>>,
    pub create_responses: Mutex<VecDeque<Result<SessionStatusResponse, ApiError>>>,
    pub qr_responses: Mutex<HashMap<String, VecDeque<Result<QrResponse, ApiError>>>>,
    pub pairing_responses: Mutex<VecDeque<Result<PairingResponse, ApiError>>>,
    pub history_responses: Mutex<VecDeque<Result<SessionStatusResponse, ApiError>>>,
    pub chat_pages: Mutex<VecDeque<Result<ChatPage, ApiError>>>,
    pub message_pages: Mutex<HashMap<String, VecDeque<Result<MessagePage, ApiError>>>>,
    pub assign_responses: Mutex<VecDeque<Result<Chat, ApiError>>>,
    pub reassign_responses: Mutex<VecDeque<Result<Chat, ApiError>>>,
    pub close_responses: Mutex<VecDeque<Result<Chat, ApiError>>>,
    pub send_responses: Mutex<VecDeque<Result<Message, ApiError>>>,
    pub contacts: Mutex<HashMap<String, Contact>>,
    pub resolve_delay: Mutex<Duration>,
    pub calls: CallCounts,
}

impl MockApi {
    pub fn push_status(&self, id: &str, resp: Result<SessionStatusResponse, ApiError>) {
        self.status_responses
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(resp);
    }

    pub fn push_qr(&self, id: &str, resp: Result<QrResponse, ApiError>) {
        self.qr_responses
            .lock()
            .unwrap()
            .entry(id.to_string())
            .or_default()
            .push_back(resp);
    }

    pub fn push_chat_page(&self, page: Result<ChatPage, ApiError>) {
        self.chat_pages.lock().unwrap().push_back(page);
    }

    pub fn push_message_page(&self, chat_id: &str, page: Result<MessagePage, ApiError>) {
        self.message_pages
            .lock()
            .unwrap()
            .entry(chat_id.to_string())
            .or_default()
            .push_back(page);
    }

    pub fn push_assign(&self, resp: Result<Chat, ApiError>) {
        self.assign_responses.lock().unwrap().push_back(resp);
    }

    pub fn push_reassign(&self, resp: Result<Chat, ApiError>) {
        self.reassign_responses.lock().unwrap().push_back(resp);
    }

    pub fn push_close(&self, resp: Result<Chat, ApiError>) {
        self.close_responses.lock().unwrap().push_back(resp);
    }

    pub fn push_send(&self, resp: Result<Message, ApiError>) {
        self.send_responses.lock().unwrap().push_back(resp);
    }

    pub fn set_contact(&self, contact: Contact) {
        self.contacts
            .lock()
            .unwrap()
            .insert(contact.phone.clone(), contact);
    }

    pub fn set_resolve_delay(&self, delay: Duration) {
        *self.resolve_delay.lock().unwrap() = delay;
    }
}

#[async_trait]
impl ConsoleApi for MockApi {
    async fn session_status(&self, id: &str) -> Result<SessionStatusResponse, ApiError> {
        self.calls.status.fetch_add(1, Ordering::SeqCst);
        self.status_responses
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Err(ApiError::NotFound(format!("session {id}"))))
    }

    async fn create_session(&self, _id: &str) -> Result<SessionStatusResponse, ApiError> {
        self.calls.create.fetch_add(1, Ordering::SeqCst);
        self.create_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(status_response(SessionState::Pending)))
    }

    async fn delete_session(&self, _id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn fetch_qr(&self, id: &str) -> Result<QrResponse, ApiError> {
        self.calls.qr.fetch_add(1, Ordering::SeqCst);
        self.qr_responses
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Ok(QrResponse {
                    qr: None,
                    qr_base64: None,
                })
            })
    }

    async fn request_pairing_code(
        &self,
        _id: &str,
        _phone: &str,
    ) -> Result<PairingResponse, ApiError> {
        self.pairing_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Ok(PairingResponse {
                    pairing_code: "ABCD-1234".into(),
                })
            })
    }

    async fn reconnect_session(&self, _id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn disconnect_session(&self, _id: &str) -> Result<(), ApiError> {
        Ok(())
    }

    async fn set_history_sync(
        &self,
        _id: &str,
        enabled: bool,
    ) -> Result<SessionStatusResponse, ApiError> {
        self.history_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                let mut resp = status_response(SessionState::Connected);
                resp.sync_history = enabled;
                Ok(resp)
            })
    }

    async fn list_chats(&self, _query: &ChatQuery) -> Result<ChatPage, ApiError> {
        self.chat_pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ChatPage::default()))
    }

    async fn list_messages(
        &self,
        chat_id: &str,
        _cursor: Option<&str>,
    ) -> Result<MessagePage, ApiError> {
        self.message_pages
            .lock()
            .unwrap()
            .get_mut(chat_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(MessagePage::default()))
    }

    async fn assign_chat(&self, chat_id: &str, _user_id: &str) -> Result<Chat, ApiError> {
        self.assign_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::NotFound(format!("chat {chat_id}"))))
    }

    async fn reassign_chat(
        &self,
        chat_id: &str,
        _user_id: Option<&str>,
        _queue_id: Option<&str>,
    ) -> Result<Chat, ApiError> {
        self.reassign_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::NotFound(format!("chat {chat_id}"))))
    }

    async fn close_chat(&self, chat_id: &str) -> Result<Chat, ApiError> {
        self.close_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ApiError::NotFound(format!("chat {chat_id}"))))
    }

    async fn send_message(
        &self,
        chat_id: &str,
        local_id: &str,
        content: &MessageContent,
    ) -> Result<Message, ApiError> {
        let n = self.calls.send.fetch_add(1, Ordering::SeqCst);
        self.send_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                let now = Utc::now();
                Ok(Message {
                    wa_message_id: Some(format!("wamid-{n}")),
                    id: Some(local_id.to_string()),
                    chat_id: chat_id.to_string(),
                    direction: Direction::Out,
                    content: content.clone(),
                    status: MessageStatus::Sent,
                    timestamp: now,
                    created_at: Some(now),
                })
            })
    }

    async fn resolve_contact(&self, phone: &str) -> Result<Option<Contact>, ApiError> {
        self.calls.resolve.fetch_add(1, Ordering::SeqCst);
        let delay = *self.resolve_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .get(&normalize_phone(phone))
            .cloned())
    }

    async fn upsert_contact(&self, phone: &str, display_name: &str) -> Result<Contact, ApiError> {
        let contact = Contact {
            phone: normalize_phone(phone),
            display_name: Some(display_name.to_string()),
            avatar_ref: None,
            metadata: HashMap::new(),
            updated_at: Utc::now(),
        };
        self.set_contact(contact.clone());
        Ok(contact)
    }

    async fn fetch_avatar(&self, _media_ref: &str) -> Result<Bytes, ApiError> {
        self.calls.avatar.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from_static(b"avatar-bytes"))
    }
}

// --- Fixtures ---

pub fn viewer_agent(user_id: &str) -> Viewer {
    Viewer {
        user_id: user_id.to_string(),
        role: Role::Agent,
    }
}

pub fn viewer_supervisor(user_id: &str) -> Viewer {
    Viewer {
        user_id: user_id.to_string(),
        role: Role::Supervisor,
    }
}

pub fn status_response(status: SessionState) -> SessionStatusResponse {
    SessionStatusResponse {
        status,
        qr: None,
        qr_base64: None,
        pairing_code: None,
        has_stored_keys: false,
        last_connected_at: None,
        sync_history: false,
        history_sync_status: HistorySyncStatus::Idle,
        history_synced_at: None,
    }
}

pub fn chat_fixture(chat_id: &str, status: ChatStatus, assigned: Option<&str>) -> Chat {
    Chat {
        chat_id: chat_id.to_string(),
        status,
        queue_id: None,
        assigned_user_id: assigned.map(str::to_string),
        connection_id: "s1".into(),
        remote_phone: "5215512345678".into(),
        contact_display: None,
        connection_status: None,
        last_activity_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    }
}

pub fn message_fixture(wa_id: &str, chat_id: &str, ts: i64, status: MessageStatus) -> Message {
    Message {
        wa_message_id: Some(wa_id.to_string()),
        id: None,
        chat_id: chat_id.to_string(),
        direction: Direction::In,
        content: MessageContent::Text { body: "hola".into() },
        status,
        timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
        created_at: Some(Utc.timestamp_opt(ts, 0).unwrap()),
    }
}

pub fn contact_fixture(phone: &str, display_name: &str) -> Contact {
    Contact {
        phone: normalize_phone(phone),
        display_name: Some(display_name.to_string()),
        avatar_ref: None,
        metadata: HashMap::new(),
        updated_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    }
}
