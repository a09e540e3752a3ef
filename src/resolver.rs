use crate::api::{self, ConsoleApi};
use crate::config::Config;
use crate::error::{ApiError, AuthWatch};
use crate::types::contact::{Contact, normalize_phone};
use bytes::Bytes;
use dashmap::DashMap;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};

type ResolveOutcome = Result<Option<Contact>, ApiError>;

/// Resolves phone identifiers to display identities.
///
/// The cache is process-wide and keyed by normalized phone; "not found"
/// is cached too, so contacts without a record are not hammered.
/// Concurrent resolutions of the same phone coalesce onto one lookup.
pub struct ContactResolver {
    api: Arc<dyn ConsoleApi>,
    config: Config,
    auth: AuthWatch,
    cache: DashMap<String, Option<Contact>>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<ResolveOutcome>>>,
    /// Avatar binaries keyed by opaque media reference. No invalidation;
    /// references change when the picture does.
    avatars: DashMap<String, Bytes>,
}

enum LookupRole {
    Leader(broadcast::Sender<ResolveOutcome>),
    Follower(broadcast::Receiver<ResolveOutcome>),
}

impl ContactResolver {
    pub fn new(api: Arc<dyn ConsoleApi>, config: Config, auth: AuthWatch) -> Self {
        Self {
            api,
            config,
            auth,
            cache: DashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
            avatars: DashMap::new(),
        }
    }

    /// Cached entry for a phone, without triggering a lookup. The outer
    /// `None` means "never resolved"; `Some(None)` is a cached miss.
    pub fn peek(&self, phone: &str) -> Option<Option<Contact>> {
        self.cache.get(&normalize_phone(phone)).map(|e| e.clone())
    }

    pub async fn resolve(&self, phone: &str) -> ResolveOutcome {
        let key = normalize_phone(phone);
        if key.is_empty() {
            return Err(ApiError::Validation(format!(
                "phone {phone:?} has no digits"
            )));
        }
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }

        let role = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(tx) => LookupRole::Follower(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    in_flight.insert(key.clone(), tx.clone());
                    LookupRole::Leader(tx)
                }
            }
        };

        match role {
            LookupRole::Follower(mut rx) => {
                debug!(target: "Resolver", "coalescing lookup for {key}");
                rx.recv().await.map_err(|_| {
                    ApiError::Transport("coalesced contact lookup was dropped".into())
                })?
            }
            LookupRole::Leader(tx) => {
                let outcome = api::guarded(
                    &self.auth,
                    self.config.request_timeout,
                    self.api.resolve_contact(&key),
                )
                .await;
                if let Ok(found) = &outcome {
                    self.cache.insert(key.clone(), found.clone());
                }
                // Unregister before broadcasting so late callers hit the
                // cache instead of a closed channel.
                self.in_flight.lock().await.remove(&key);
                let _ = tx.send(outcome.clone());
                outcome
            }
        }
    }

    /// Writes through to the server and updates the cache with the
    /// authoritative response.
    pub async fn upsert(&self, phone: &str, display_name: &str) -> Result<Contact, ApiError> {
        let key = normalize_phone(phone);
        if key.is_empty() {
            return Err(ApiError::Validation(format!(
                "phone {phone:?} has no digits"
            )));
        }
        let contact = api::guarded(
            &self.auth,
            self.config.request_timeout,
            self.api.upsert_contact(&key, display_name),
        )
        .await?;
        self.cache.insert(key, Some(contact.clone()));
        Ok(contact)
    }

    /// Seeds the cache from a push-delivered contact update.
    pub fn insert_cache(&self, contact: Contact) {
        let key = normalize_phone(&contact.phone);
        self.cache.insert(key, Some(contact));
    }

    /// Fetches avatar bytes, returning the cached copy when present.
    pub async fn avatar(&self, media_ref: &str) -> Result<Bytes, ApiError> {
        if let Some(cached) = self.avatars.get(media_ref) {
            return Ok(cached.clone());
        }
        let bytes = api::guarded(
            &self.auth,
            self.config.request_timeout,
            self.api.fetch_avatar(media_ref),
        )
        .await?;
        self.avatars.insert(media_ref.to_string(), bytes.clone());
        Ok(bytes)
    }
}
