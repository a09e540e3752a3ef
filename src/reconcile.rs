use crate::api::SessionStatusResponse;
use crate::connection::ConnectionManager;
use crate::conversation::ConversationSync;
use crate::resolver::ContactResolver;
use crate::types::chat::{Chat, is_group_remote};
use crate::types::events::PushEvent;
use crate::types::message::MessageKey;
use log::{debug, warn};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Every external signal funnels into this one queue: push frames from
/// the transport and status snapshots from the poll loops. The dispatcher
/// consumes it serially, which is what makes the per-chat and per-session
/// ordering guarantees hold.
#[derive(Debug)]
pub enum EngineEvent {
    Push(PushEvent),
    SessionReport {
        session_id: String,
        response: Box<SessionStatusResponse>,
    },
}

/// Bounded FIFO set of recently-seen message keys for one chat. Push
/// delivery is at-least-once, so `message:new` frames can repeat.
struct SeenKeys {
    set: HashSet<MessageKey>,
    order: VecDeque<MessageKey>,
}

impl SeenKeys {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `false` when the key was already seen. Oldest entries are
    /// evicted first once the cap is reached.
    fn insert(&mut self, key: MessageKey, cap: usize) -> bool {
        if !self.set.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

/// Single entry point for all external signals. Classifies each one and
/// routes it into the connection manager, the conversation synchronizer
/// and the contact resolver; never mutates their state directly.
pub struct Reconciler {
    connections: Arc<ConnectionManager>,
    conversations: Arc<ConversationSync>,
    resolver: Arc<ContactResolver>,
    seen: HashMap<String, SeenKeys>,
    seen_cap: usize,
}

impl Reconciler {
    pub fn new(
        connections: Arc<ConnectionManager>,
        conversations: Arc<ConversationSync>,
        resolver: Arc<ContactResolver>,
        seen_cap: usize,
    ) -> Self {
        Self {
            connections,
            conversations,
            resolver,
            seen: HashMap::new(),
            seen_cap,
        }
    }

    /// Serial dispatch loop. Runs until the queue closes or shutdown is
    /// signaled.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<EngineEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!(target: "Reconcile", "dispatcher started");
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.process(event).await,
                    None => break,
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        debug!(target: "Reconcile", "dispatcher stopped");
    }

    /// Applies one signal to completion against current in-memory state.
    pub async fn process(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::SessionReport {
                session_id,
                response,
            } => {
                if let Some(state) = self.connections.apply_report(&session_id, &response).await {
                    self.conversations
                        .set_connection_status(&session_id, state)
                        .await;
                }
            }
            EngineEvent::Push(push) => self.process_push(push).await,
        }
    }

    async fn process_push(&mut self, push: PushEvent) {
        match push {
            PushEvent::MessageNew { chat, message } => {
                if is_group_remote(&message.chat_id)
                    || chat
                        .as_ref()
                        .is_some_and(|c| is_group_remote(&c.remote_phone))
                {
                    debug!(target: "Reconcile", "dropping group message for {}", message.chat_id);
                    return;
                }
                let chat_id = message.chat_id.clone();
                let newly_seen = self
                    .seen
                    .entry(chat_id.clone())
                    .or_insert_with(SeenKeys::new)
                    .insert(message.key(), self.seen_cap);
                if !newly_seen {
                    debug!(target: "Reconcile", "duplicate message:new {} for {chat_id}", message.key());
                    return;
                }
                if let Some(chat) = chat {
                    self.ingest_chat(chat).await;
                }
                self.conversations.apply_messages(&chat_id, vec![message]).await;
            }
            PushEvent::MessageUpdate { message } => {
                // Status updates legitimately repeat a key; they go
                // straight to the merge, which unions them.
                if is_group_remote(&message.chat_id) {
                    return;
                }
                let chat_id = message.chat_id.clone();
                self.conversations.apply_messages(&chat_id, vec![message]).await;
            }
            PushEvent::ChatNew(chat) | PushEvent::ChatUpdate(chat) => {
                if is_group_remote(&chat.remote_phone) {
                    debug!(target: "Reconcile", "dropping group chat {}", chat.chat_id);
                    return;
                }
                self.ingest_chat(chat).await;
            }
            PushEvent::ChatAutoClosed { chat_id } => {
                self.conversations.apply_auto_closed(&chat_id).await;
            }
            PushEvent::ConnectionStatus {
                session_id,
                status,
                qr,
                pairing_code,
            } => {
                if let Some(state) = self
                    .connections
                    .apply_push_status(&session_id, status, qr, pairing_code)
                    .await
                {
                    // Fan-out: every chat riding on this connection gets
                    // its denormalized status in the same pass.
                    self.conversations
                        .set_connection_status(&session_id, state)
                        .await;
                }
            }
            PushEvent::ContactUpdated(contact) => {
                self.resolver.insert_cache(contact.clone());
                self.conversations.apply_contact(&contact).await;
            }
        }
    }

    /// Applies a chat mutation and, when the contact is still unknown,
    /// kicks off a background resolution without blocking the visibility
    /// decision.
    async fn ingest_chat(&self, chat: Chat) {
        if self.resolver.peek(&chat.remote_phone).is_none() {
            let resolver = self.resolver.clone();
            let phone = chat.remote_phone.clone();
            tokio::spawn(async move {
                if let Err(e) = resolver.resolve(&phone).await {
                    warn!(target: "Reconcile", "background contact resolution for {phone} failed: {e}");
                }
            });
        }
        self.conversations.apply_chat(chat).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: usize) -> MessageKey {
        MessageKey::Remote(format!("m{n}"))
    }

    #[test]
    fn seen_keys_reject_duplicates() {
        let mut seen = SeenKeys::new();
        assert!(seen.insert(key(1), 10));
        assert!(!seen.insert(key(1), 10));
        assert!(seen.insert(key(2), 10));
    }

    #[test]
    fn seen_keys_evict_oldest_first() {
        let mut seen = SeenKeys::new();
        for n in 0..4 {
            assert!(seen.insert(key(n), 3));
        }
        // key(0) fell out of the window, so it counts as new again.
        assert!(seen.insert(key(0), 3));
        // key(3) is still inside the window.
        assert!(!seen.insert(key(3), 3));
    }
}
