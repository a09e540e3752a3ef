use crate::api::ConsoleApi;
use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::conversation::ConversationSync;
use crate::error::AuthWatch;
use crate::reconcile::{EngineEvent, Reconciler};
use crate::resolver::ContactResolver;
use crate::types::chat::Viewer;
use crate::types::events::PushEvent;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const EVENT_QUEUE_CAPACITY: usize = 256;

/// Composition root: one `Engine` per authenticated console session,
/// constructed at login and torn down at logout. Owns the reconciliation
/// dispatcher and the background refresh; the components are reachable
/// for direct user actions.
pub struct Engine {
    pub connections: Arc<ConnectionManager>,
    pub conversations: Arc<ConversationSync>,
    pub contacts: Arc<ContactResolver>,
    auth: AuthWatch,
    events_tx: mpsc::Sender<EngineEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl Engine {
    /// Builds the engine and spawns its background tasks. Must be called
    /// from within a tokio runtime.
    pub fn new(api: Arc<dyn ConsoleApi>, viewer: Viewer, config: Config) -> Arc<Self> {
        let auth = AuthWatch::new();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let connections = ConnectionManager::new(
            api.clone(),
            config.clone(),
            auth.clone(),
            events_tx.clone(),
        );
        let conversations = Arc::new(ConversationSync::new(
            api.clone(),
            viewer,
            config.clone(),
            auth.clone(),
        ));
        let contacts = Arc::new(ContactResolver::new(api, config.clone(), auth.clone()));

        let reconciler = Reconciler::new(
            connections.clone(),
            conversations.clone(),
            contacts.clone(),
            config.seen_keys_cap,
        );
        tokio::spawn(reconciler.run(events_rx, shutdown_rx.clone()));
        connections.spawn_global_refresh(shutdown_rx);

        Arc::new(Self {
            connections,
            conversations,
            contacts,
            auth,
            events_tx,
            shutdown_tx,
        })
    }

    /// Entry point for the push transport: parses a raw frame and queues
    /// it behind whatever the poll loops already produced. Unknown or
    /// malformed frames are dropped by the parser.
    pub async fn handle_push(&self, name: &str, payload: serde_json::Value) {
        let Some(event) = PushEvent::parse(name, payload) else {
            return;
        };
        if self.events_tx.send(EngineEvent::Push(event)).await.is_err() {
            warn!(target: "Engine", "event queue closed, dropping push {name}");
        }
    }

    /// Fires when any component hits a 401/403; the caller tears the
    /// whole client down.
    pub fn auth_revoked(&self) -> watch::Receiver<bool> {
        self.auth.subscribe()
    }

    /// Stops the dispatcher, the global refresh and every per-session
    /// poll loop.
    pub async fn shutdown(&self) {
        debug!(target: "Engine", "shutting down");
        let _ = self.shutdown_tx.send(true);
        self.connections.shutdown().await;
    }
}
