mod merge;

pub use merge::merge_messages;

use crate::api::{self, ChatQuery, ConsoleApi};
use crate::config::Config;
use crate::error::{ApiError, AuthWatch};
use crate::types::chat::{Chat, ChatStatus, TabCounts, Viewer};
use crate::types::connection::SessionState;
use crate::types::contact::{Contact, normalize_phone};
use crate::types::message::{
    Direction, Message, MessageContent, MessageKey, MessageStatus,
};
use chrono::Utc;
use log::{debug, info};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Owns the chat roster, per-chat message lists and the tab counters for
/// one viewer. All mutation goes through one lock, so merges for a given
/// chat apply in the order they are handed in.
pub struct ConversationSync {
    api: Arc<dyn ConsoleApi>,
    config: Config,
    auth: AuthWatch,
    viewer: Viewer,
    state: Mutex<RosterState>,
    local_seq: AtomicU64,
}

#[derive(Default)]
struct RosterState {
    /// Visible set only; chats failing the viewer's role filter are
    /// removed, never stored hidden.
    chats: HashMap<String, Chat>,
    counts: TabCounts,
    roster_cursor: Option<String>,
    messages: HashMap<String, Vec<Message>>,
    /// "Fetch older" cursor per chat; `None` entry means exhausted.
    older_cursors: HashMap<String, Option<String>>,
    active_chat_id: Option<String>,
}

impl ConversationSync {
    pub fn new(api: Arc<dyn ConsoleApi>, viewer: Viewer, config: Config, auth: AuthWatch) -> Self {
        Self {
            api,
            config,
            auth,
            viewer,
            state: Mutex::new(RosterState::default()),
            local_seq: AtomicU64::new(1),
        }
    }

    pub fn viewer(&self) -> &Viewer {
        &self.viewer
    }

    // --- Roster ---

    /// Loads a roster page. `append = false` replaces the visible set and
    /// seeds the tab counters from the server totals; `append = true`
    /// merges the page into the existing entries using the stored cursor.
    pub async fn load_roster(&self, query: &ChatQuery, append: bool) -> Result<(), ApiError> {
        let mut effective = query.clone();
        if append {
            effective.cursor = self.state.lock().await.roster_cursor.clone();
        } else {
            effective.cursor = None;
        }

        let page = self.call(self.api.list_chats(&effective)).await?;

        let mut st = self.state.lock().await;
        if !append {
            st.chats.clear();
            if let Some(counts) = page.counts {
                st.counts = counts;
            }
        }
        for chat in page.items {
            if !self.viewer.can_see(&chat) {
                continue;
            }
            match st.chats.entry(chat.chat_id.clone()) {
                Entry::Occupied(mut slot) => merge_chat_fields(slot.get_mut(), chat),
                Entry::Vacant(slot) => {
                    slot.insert(chat);
                }
            }
        }
        st.roster_cursor = page.next_cursor;

        if !append
            && let Some(active) = st.active_chat_id.clone()
            && !st.chats.contains_key(&active)
        {
            debug!(target: "Roster", "active chat {active} gone after reload, clearing selection");
            st.active_chat_id = None;
        }
        Ok(())
    }

    /// Applies one server-authoritative chat object: the single reconcile
    /// path shared by push events and the responses of the viewer's own
    /// assign/reassign/close actions. Re-checks visibility and keeps the
    /// tab counters in sync with the transition.
    pub async fn apply_chat(&self, incoming: Chat) {
        let mut st = self.state.lock().await;
        let chat_id = incoming.chat_id.clone();
        let previous_status = st.chats.get(&chat_id).map(|c| c.status);
        let visible = self.viewer.can_see(&incoming);

        match (previous_status, visible) {
            (Some(prev), true) => {
                if prev != incoming.status {
                    st.counts.dec(prev.tab());
                    st.counts.inc(incoming.status.tab());
                }
                if let Some(existing) = st.chats.get_mut(&chat_id) {
                    merge_chat_fields(existing, incoming);
                }
            }
            (None, true) => {
                st.counts.inc(incoming.status.tab());
                st.chats.insert(chat_id.clone(), incoming);
            }
            (Some(prev), false) => {
                st.counts.dec(prev.tab());
                st.chats.remove(&chat_id);
                if st.active_chat_id.as_deref() == Some(chat_id.as_str()) {
                    info!(target: "Roster", "chat {chat_id} left visibility, clearing active selection");
                    st.active_chat_id = None;
                }
            }
            (None, false) => {}
        }
    }

    /// Marks a chat closed by the server's inactivity timer.
    pub async fn apply_auto_closed(&self, chat_id: &str) {
        let updated = {
            let st = self.state.lock().await;
            st.chats.get(chat_id).map(|chat| {
                let mut updated = chat.clone();
                updated.status = ChatStatus::Closed;
                updated
            })
        };
        match updated {
            Some(chat) => self.apply_chat(chat).await,
            None => debug!(target: "Roster", "auto-close for unknown chat {chat_id}, ignoring"),
        }
    }

    /// Fan-out target for connection status changes: re-tags every chat
    /// riding on that connection in one pass.
    pub async fn set_connection_status(&self, connection_id: &str, status: SessionState) {
        let mut st = self.state.lock().await;
        for chat in st.chats.values_mut() {
            if chat.connection_id == connection_id {
                chat.connection_status = Some(status);
            }
        }
    }

    /// Refreshes the denormalized display identity after a contact update.
    pub async fn apply_contact(&self, contact: &Contact) {
        let mut st = self.state.lock().await;
        for chat in st.chats.values_mut() {
            if normalize_phone(&chat.remote_phone) == contact.phone {
                chat.contact_display = contact.display_name.clone();
            }
        }
    }

    // --- Assignment actions (request, then reconcile like any push) ---

    /// Claims an unassigned chat for the viewer. A `Conflict` error means
    /// the chat is already attended by someone else; callers refresh the
    /// roster instead of retrying.
    pub async fn claim(&self, chat_id: &str) -> Result<Chat, ApiError> {
        let chat = self
            .call(self.api.assign_chat(chat_id, &self.viewer.user_id))
            .await?;
        self.apply_chat(chat.clone()).await;
        Ok(chat)
    }

    pub async fn reassign(
        &self,
        chat_id: &str,
        user_id: Option<&str>,
        queue_id: Option<&str>,
    ) -> Result<Chat, ApiError> {
        let chat = self
            .call(self.api.reassign_chat(chat_id, user_id, queue_id))
            .await?;
        self.apply_chat(chat.clone()).await;
        Ok(chat)
    }

    pub async fn close(&self, chat_id: &str) -> Result<Chat, ApiError> {
        let chat = self.call(self.api.close_chat(chat_id)).await?;
        self.apply_chat(chat.clone()).await;
        Ok(chat)
    }

    // --- Messages ---

    /// Merges a batch into a chat's message list. Safe for late pages of
    /// an inactive chat: the merge is idempotent and chat-scoped.
    pub async fn apply_messages(&self, chat_id: &str, batch: Vec<Message>) {
        let mut st = self.state.lock().await;
        let list = st.messages.entry(chat_id.to_string()).or_default();
        *list = merge_messages(std::mem::take(list), &batch);
        let newest = list.last().map(|m| m.timestamp);
        if let Some(ts) = newest
            && let Some(chat) = st.chats.get_mut(chat_id)
            && ts > chat.last_activity_at
        {
            chat.last_activity_at = ts;
        }
    }

    /// Fetches the newest page for a chat and resets its older-page
    /// cursor, discarding any gap.
    pub async fn load_latest_messages(&self, chat_id: &str) -> Result<(), ApiError> {
        let page = self.call(self.api.list_messages(chat_id, None)).await?;
        let cursor = page.next_cursor.clone();
        self.apply_messages(chat_id, page.messages).await;
        self.state
            .lock()
            .await
            .older_cursors
            .insert(chat_id.to_string(), cursor);
        Ok(())
    }

    /// Fetches one older page using the retained cursor. Returns `false`
    /// when history is exhausted.
    pub async fn load_older_messages(&self, chat_id: &str) -> Result<bool, ApiError> {
        let cursor = match self.state.lock().await.older_cursors.get(chat_id) {
            Some(Some(cursor)) => cursor.clone(),
            _ => return Ok(false),
        };
        let page = self
            .call(self.api.list_messages(chat_id, Some(&cursor)))
            .await?;
        let next = page.next_cursor.clone();
        self.apply_messages(chat_id, page.messages).await;
        self.state
            .lock()
            .await
            .older_cursors
            .insert(chat_id.to_string(), next);
        Ok(true)
    }

    /// Switches the active chat; the newly active chat's older-page cursor
    /// is cleared so the next history fetch starts gap-free.
    pub async fn set_active_chat(&self, chat_id: Option<String>) {
        let mut st = self.state.lock().await;
        if let Some(id) = &chat_id {
            st.older_cursors.remove(id);
        }
        st.active_chat_id = chat_id;
    }

    /// Sends a message with an optimistic placeholder. The placeholder is
    /// inserted immediately; the authoritative echo supersedes it by key,
    /// and a transport failure re-marks it as failed for retry.
    pub async fn send_message(
        &self,
        chat_id: &str,
        content: MessageContent,
    ) -> Result<Message, ApiError> {
        let local_id = self.next_local_id();
        let now = Utc::now();
        let placeholder = Message {
            wa_message_id: None,
            id: Some(local_id.clone()),
            chat_id: chat_id.to_string(),
            direction: Direction::Out,
            content: content.clone(),
            status: MessageStatus::Pending,
            timestamp: now,
            created_at: Some(now),
        };
        self.apply_messages(chat_id, vec![placeholder.clone()]).await;

        match self
            .call(self.api.send_message(chat_id, &local_id, &content))
            .await
        {
            Ok(echo) => {
                self.apply_send_echo(chat_id, echo.clone()).await;
                Ok(echo)
            }
            Err(e) => {
                let mut failed = placeholder;
                failed.status = MessageStatus::Failed;
                self.apply_messages(chat_id, vec![failed]).await;
                Err(e)
            }
        }
    }

    /// Quick replies share the optimistic send pipeline; the body arrives
    /// pre-expanded.
    pub async fn send_quick_reply(&self, chat_id: &str, body: &str) -> Result<Message, ApiError> {
        self.send_message(chat_id, MessageContent::Text { body: body.to_string() })
            .await
    }

    async fn apply_send_echo(&self, chat_id: &str, echo: Message) {
        {
            let mut st = self.state.lock().await;
            // The echo carries the authoritative key plus the local id it
            // supersedes; drop the placeholder before merging so the two
            // never coexist.
            if let (Some(local_id), Some(_)) = (&echo.id, &echo.wa_message_id)
                && let Some(list) = st.messages.get_mut(chat_id)
            {
                let placeholder_key = MessageKey::Local(local_id.clone());
                list.retain(|m| m.key() != placeholder_key);
            }
        }
        self.apply_messages(chat_id, vec![echo]).await;
    }

    fn next_local_id(&self) -> String {
        let seq = self.local_seq.fetch_add(1, Ordering::Relaxed);
        format!("local-{:08x}-{seq}", rand::random::<u32>())
    }

    // --- Snapshots ---

    /// Visible chats ordered by most recent activity first.
    pub async fn visible_chats(&self) -> Vec<Chat> {
        let st = self.state.lock().await;
        let mut chats: Vec<Chat> = st.chats.values().cloned().collect();
        chats.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        chats
    }

    pub async fn chat(&self, chat_id: &str) -> Option<Chat> {
        self.state.lock().await.chats.get(chat_id).cloned()
    }

    pub async fn counts(&self) -> TabCounts {
        self.state.lock().await.counts
    }

    pub async fn messages_of(&self, chat_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .await
            .messages
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn active_chat(&self) -> Option<String> {
        self.state.lock().await.active_chat_id.clone()
    }

    pub async fn roster_cursor(&self) -> Option<String> {
        self.state.lock().await.roster_cursor.clone()
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        api::guarded(&self.auth, self.config.request_timeout, fut).await
    }
}

/// Field-level last-write-wins, except locally derived fields survive when
/// the incoming copy does not carry them.
fn merge_chat_fields(existing: &mut Chat, incoming: Chat) {
    let contact_display = incoming
        .contact_display
        .or_else(|| existing.contact_display.take());
    let connection_status = incoming.connection_status.or(existing.connection_status);
    *existing = Chat {
        contact_display,
        connection_status,
        ..incoming
    };
}
