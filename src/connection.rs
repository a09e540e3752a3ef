use crate::api::{self, ConsoleApi, SessionStatusResponse};
use crate::config::Config;
use crate::error::{ApiError, AuthWatch};
use crate::reconcile::EngineEvent;
use crate::types::connection::{Connection, HistorySyncState, SessionState};
use crate::types::contact::{is_plausible_msisdn, normalize_phone};
use dashmap::DashMap;
use log::{debug, info, warn};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};

/// Owns one state machine per WhatsApp session: QR and pairing-code
/// handshakes, status polling and reconciliation with push-reported
/// state.
///
/// Poll results are not applied here directly; the poll loops push
/// [`EngineEvent::SessionReport`] onto the engine queue so that polls and
/// push events reach session state in one serialized stream.
pub struct ConnectionManager {
    api: Arc<dyn ConsoleApi>,
    config: Config,
    auth: AuthWatch,
    events_tx: mpsc::Sender<EngineEvent>,
    sessions: Mutex<HashMap<String, Connection>>,
    /// Locally deleted sessions, remembered so a background refresh does
    /// not resurrect them before the server confirms the deletion.
    tombstones: Mutex<HashSet<String>>,
    /// Stop handle per running poll loop.
    pollers: Mutex<HashMap<String, watch::Sender<bool>>>,
    /// Sessions with a status query currently on the wire. The per-session
    /// timer and the global refresh share this so they never duplicate a
    /// request for the same session.
    in_flight: DashMap<String, ()>,
    /// At most one session is the UI's QR / pairing target at a time.
    active_qr_target: Mutex<Option<String>>,
    active_pairing_target: Mutex<Option<String>>,
}

impl ConnectionManager {
    pub fn new(
        api: Arc<dyn ConsoleApi>,
        config: Config,
        auth: AuthWatch,
        events_tx: mpsc::Sender<EngineEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            config,
            auth,
            events_tx,
            sessions: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(HashSet::new()),
            pollers: Mutex::new(HashMap::new()),
            in_flight: DashMap::new(),
            active_qr_target: Mutex::new(None),
            active_pairing_target: Mutex::new(None),
        })
    }

    // --- Lifecycle operations ---

    /// Queries a session's status, creating it first when the server does
    /// not know it (or reports it deleted) and `allow_create` is set.
    /// Fetches the QR artifact when the resulting state needs one, and
    /// starts or stops the poll loop to match.
    pub async fn sync_session(
        self: &Arc<Self>,
        id: &str,
        allow_create: bool,
    ) -> Result<Connection, ApiError> {
        let resp = match self.call(self.api.session_status(id)).await {
            Ok(resp) if resp.status == SessionState::Deleted && allow_create => {
                self.call(self.api.create_session(id)).await?;
                self.call(self.api.session_status(id)).await?
            }
            Err(ApiError::NotFound(_)) if allow_create => {
                self.call(self.api.create_session(id)).await?;
                self.call(self.api.session_status(id)).await?
            }
            Ok(resp) => resp,
            Err(e) => {
                if matches!(e, ApiError::NotFound(_)) {
                    // Server confirmed the session is gone; the tombstone
                    // has done its job.
                    self.tombstones.lock().await.remove(id);
                } else {
                    self.note_error(id, &e).await;
                }
                return Err(e);
            }
        };
        if allow_create {
            // An explicit create overrides a pending local deletion.
            self.tombstones.lock().await.remove(id);
        }

        let mut conn = {
            let mut sessions = self.sessions.lock().await;
            let conn = sessions
                .entry(id.to_string())
                .or_insert_with(|| Connection::new(id));
            apply_reported(conn, &resp);
            conn.clone()
        };

        // A handshake state without a transport-pushed artifact needs an
        // explicit QR fetch.
        if conn.state.wants_polling() && conn.qr_payload.is_none() && conn.pairing_code.is_none() {
            match self.call(self.api.fetch_qr(id)).await {
                Ok(qr) => {
                    if let Some(artifact) = qr.artifact() {
                        conn = self.set_qr_artifact(id, artifact).await;
                    }
                }
                Err(e) => {
                    warn!(target: "Connection", "QR fetch for {id} failed: {e}")
                }
            }
        }

        self.reconcile_polling(id, conn.state).await;
        Ok(conn)
    }

    /// Forces a QR fetch and marks this session as the UI's QR target.
    /// Idempotent no-op while the session is already connected.
    pub async fn show_qr(self: &Arc<Self>, id: &str) -> Result<Connection, ApiError> {
        if let Some(conn) = self.get(id).await
            && conn.state == SessionState::Connected
        {
            return Ok(conn);
        }
        let qr = match self.call(self.api.fetch_qr(id)).await {
            Ok(qr) => qr,
            Err(e) => {
                self.note_error(id, &e).await;
                return Err(e);
            }
        };
        let conn = match qr.artifact() {
            Some(artifact) => self.set_qr_artifact(id, artifact).await,
            None => self.get_or_default(id).await,
        };
        *self.active_qr_target.lock().await = Some(id.to_string());
        self.start_polling(id).await;
        Ok(conn)
    }

    /// Requests a pairing code for the phone. The phone must arrive as a
    /// normalized E.164-like digit string; anything else is rejected
    /// before it reaches the wire. No-op while connected.
    pub async fn request_pairing(
        self: &Arc<Self>,
        id: &str,
        phone: &str,
    ) -> Result<Connection, ApiError> {
        let digits = normalize_phone(phone);
        if digits != phone || !is_plausible_msisdn(&digits) {
            return Err(ApiError::Validation(format!(
                "phone must be a normalized digit string, got {phone:?}"
            )));
        }
        if let Some(conn) = self.get(id).await
            && conn.state == SessionState::Connected
        {
            return Ok(conn);
        }
        let resp = match self.call(self.api.request_pairing_code(id, &digits)).await {
            Ok(resp) => resp,
            Err(e) => {
                self.note_error(id, &e).await;
                return Err(e);
            }
        };
        let conn = {
            let mut sessions = self.sessions.lock().await;
            let conn = sessions
                .entry(id.to_string())
                .or_insert_with(|| Connection::new(id));
            conn.state = SessionState::PairingCode;
            conn.qr_payload = None;
            conn.pairing_code = Some(resp.pairing_code);
            conn.last_error = None;
            conn.clone()
        };
        *self.active_pairing_target.lock().await = Some(id.to_string());
        self.start_polling(id).await;
        Ok(conn)
    }

    /// Triggers a fresh handshake and moves the session to `connecting`
    /// until the server reports otherwise.
    pub async fn reconnect(self: &Arc<Self>, id: &str) -> Result<Connection, ApiError> {
        if let Err(e) = self.call(self.api.reconnect_session(id)).await {
            self.note_error(id, &e).await;
            return Err(e);
        }
        let conn = {
            let mut sessions = self.sessions.lock().await;
            let conn = sessions
                .entry(id.to_string())
                .or_insert_with(|| Connection::new(id));
            conn.state = SessionState::Connecting;
            conn.last_error = None;
            conn.clone()
        };
        self.start_polling(id).await;
        Ok(conn)
    }

    /// Like [`reconnect`](Self::reconnect), but drops the previous QR
    /// payload up front so a stale code is never shown while the new one
    /// is on its way.
    pub async fn renew_qr(self: &Arc<Self>, id: &str) -> Result<Connection, ApiError> {
        {
            let mut sessions = self.sessions.lock().await;
            let conn = sessions
                .entry(id.to_string())
                .or_insert_with(|| Connection::new(id));
            conn.clear_pairing_artifacts();
            conn.state = SessionState::Pending;
        }
        if let Err(e) = self.call(self.api.reconnect_session(id)).await {
            self.note_error(id, &e).await;
            return Err(e);
        }
        let conn = match self.call(self.api.fetch_qr(id)).await {
            Ok(qr) => match qr.artifact() {
                Some(artifact) => self.set_qr_artifact(id, artifact).await,
                None => self.get_or_default(id).await,
            },
            Err(e) => {
                self.note_error(id, &e).await;
                return Err(e);
            }
        };
        *self.active_qr_target.lock().await = Some(id.to_string());
        self.start_polling(id).await;
        Ok(conn)
    }

    pub async fn disconnect(&self, id: &str) -> Result<Connection, ApiError> {
        self.stop_polling(id).await;
        if let Err(e) = self.call(self.api.disconnect_session(id)).await {
            self.note_error(id, &e).await;
            return Err(e);
        }
        let conn = {
            let mut sessions = self.sessions.lock().await;
            let conn = sessions
                .entry(id.to_string())
                .or_insert_with(|| Connection::new(id));
            conn.clear_pairing_artifacts();
            conn.state = SessionState::Disconnected;
            conn.clone()
        };
        self.clear_targets(id).await;
        Ok(conn)
    }

    /// Removes the session from the active set and tombstones it locally.
    /// The tombstone holds until the server confirms the absence, so an
    /// overlapping background refresh cannot resurrect the entry.
    pub async fn delete_session(&self, id: &str) -> Result<(), ApiError> {
        self.stop_polling(id).await;
        self.tombstones.lock().await.insert(id.to_string());
        self.sessions.lock().await.remove(id);
        self.clear_targets(id).await;
        info!(target: "Connection", "session {id} removed locally, awaiting server confirmation");
        self.call(self.api.delete_session(id)).await
    }

    /// Toggles history sync. A failure leaves the local flag untouched and
    /// surfaces the error to the caller.
    pub async fn update_history_sync(
        &self,
        id: &str,
        enabled: bool,
    ) -> Result<Connection, ApiError> {
        let resp = self.call(self.api.set_history_sync(id, enabled)).await?;
        let mut sessions = self.sessions.lock().await;
        let conn = sessions
            .entry(id.to_string())
            .or_insert_with(|| Connection::new(id));
        conn.history_sync = HistorySyncState {
            enabled: resp.sync_history,
            status: resp.history_sync_status,
            synced_at: resp.history_synced_at,
        };
        Ok(conn.clone())
    }

    // --- Reconciliation entry points (called by the dispatcher) ---

    /// Applies a poll snapshot. Returns the resulting state when the
    /// report was applied, `None` when it was stale or the session is
    /// tombstoned. A report for a connected session claiming a handshake
    /// state is stale by definition and rejected.
    pub async fn apply_report(
        self: &Arc<Self>,
        id: &str,
        resp: &SessionStatusResponse,
    ) -> Option<SessionState> {
        if self.tombstones.lock().await.contains(id) {
            debug!(target: "Connection", "dropping report for tombstoned session {id}");
            return None;
        }
        let state = {
            let mut sessions = self.sessions.lock().await;
            let conn = sessions
                .entry(id.to_string())
                .or_insert_with(|| Connection::new(id));
            if !apply_reported(conn, resp) {
                return None;
            }
            conn.state
        };
        self.reconcile_polling(id, state).await;
        if state == SessionState::Connected {
            self.clear_targets(id).await;
        }
        Some(state)
    }

    /// Applies a push-reported status change. Push events are
    /// authoritative in receipt order and bypass the staleness check.
    pub async fn apply_push_status(
        self: &Arc<Self>,
        id: &str,
        status: SessionState,
        qr: Option<String>,
        pairing_code: Option<String>,
    ) -> Option<SessionState> {
        if self.tombstones.lock().await.contains(id) {
            return None;
        }
        if status == SessionState::Deleted {
            self.stop_polling(id).await;
            self.sessions.lock().await.remove(id);
            self.clear_targets(id).await;
            return Some(status);
        }
        {
            let mut sessions = self.sessions.lock().await;
            let conn = sessions
                .entry(id.to_string())
                .or_insert_with(|| Connection::new(id));
            let prev = conn.state;
            conn.state = status;
            match status {
                SessionState::Connected => {
                    conn.clear_pairing_artifacts();
                    conn.has_connected = true;
                    conn.last_error = None;
                    if conn.last_connected_at.is_none() {
                        conn.last_connected_at = Some(chrono::Utc::now());
                    }
                }
                SessionState::Pending | SessionState::Connecting => {
                    if let Some(qr) = qr {
                        conn.qr_payload = Some(qr);
                        conn.state = SessionState::Pending;
                    } else if conn.state == SessionState::Connecting {
                        conn.qr_payload = None;
                    }
                    conn.pairing_code = None;
                }
                SessionState::PairingCode => {
                    conn.qr_payload = None;
                    if let Some(code) = pairing_code {
                        conn.pairing_code = Some(code);
                    }
                }
                _ => conn.clear_pairing_artifacts(),
            }
            if prev != conn.state {
                info!(target: "Connection", "session {id} {prev:?} -> {:?} (push)", conn.state);
            }
        }
        self.reconcile_polling(id, status).await;
        if status == SessionState::Connected {
            self.clear_targets(id).await;
        }
        Some(status)
    }

    // --- Polling ---

    /// One status query with in-flight suppression. Outcomes travel
    /// through the engine queue; transient transport failures are logged
    /// and swallowed so a flaky network does not tear the session down.
    pub async fn poll_once(&self, id: &str) {
        if self.in_flight.insert(id.to_string(), ()).is_some() {
            debug!(target: "Connection/Poll", "session {id} already mid-poll, skipping");
            return;
        }
        let _guard = scopeguard::guard((), |_| {
            self.in_flight.remove(id);
        });

        match self.call(self.api.session_status(id)).await {
            Ok(resp) => {
                let report = EngineEvent::SessionReport {
                    session_id: id.to_string(),
                    response: Box::new(resp),
                };
                if self.events_tx.send(report).await.is_err() {
                    debug!(target: "Connection/Poll", "engine queue closed, dropping report for {id}");
                }
            }
            Err(ApiError::Auth) => {
                // Already escalated by the call guard; nothing per-session
                // to record.
            }
            Err(e) => {
                warn!(target: "Connection/Poll", "status poll for {id} failed: {e}");
            }
        }
    }

    async fn start_polling(self: &Arc<Self>, id: &str) {
        let mut pollers = self.pollers.lock().await;
        if pollers.contains_key(id) {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        pollers.insert(id.to_string(), stop_tx);
        drop(pollers);

        debug!(target: "Connection/Poll", "starting poll loop for {id}");
        let manager = self.clone();
        let session_id = id.to_string();
        tokio::spawn(async move {
            manager.poll_loop(session_id, stop_rx).await;
        });
    }

    pub async fn stop_polling(&self, id: &str) {
        if let Some(stop_tx) = self.pollers.lock().await.remove(id) {
            debug!(target: "Connection/Poll", "stopping poll loop for {id}");
            let _ = stop_tx.send(true);
        }
    }

    pub async fn is_polling(&self, id: &str) -> bool {
        self.pollers.lock().await.contains_key(id)
    }

    async fn poll_loop(self: Arc<Self>, id: String, mut stop_rx: watch::Receiver<bool>) {
        loop {
            // Jitter keeps many handshaking sessions from lining up their
            // requests on the same tick.
            let factor = rand::rng().random_range(0.9..=1.1);
            let interval = self.config.session_poll_interval.mul_f64(factor);
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if !self.wants_polling(&id).await {
                        break;
                    }
                    self.poll_once(&id).await;
                }
                _ = stop_rx.changed() => {
                    debug!(target: "Connection/Poll", "poll loop for {id} got stop signal");
                    return;
                }
            }
        }
        self.pollers.lock().await.remove(&id);
        debug!(target: "Connection/Poll", "poll loop for {id} exited");
    }

    /// Slow background pass over every tracked session, whatever its
    /// state, to catch externally-driven changes such as a device being
    /// unpaired from the phone. Runs until the engine shuts down.
    pub fn spawn_global_refresh(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(manager.config.global_refresh_interval) => {
                        let ids: Vec<String> =
                            manager.sessions.lock().await.keys().cloned().collect();
                        for id in ids {
                            manager.poll_once(&id).await;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(target: "Connection/Poll", "global refresh loop shutting down");
                        return;
                    }
                }
            }
        });
    }

    pub async fn shutdown(&self) {
        let mut pollers = self.pollers.lock().await;
        for (id, stop_tx) in pollers.drain() {
            debug!(target: "Connection/Poll", "stopping poll loop for {id} on shutdown");
            let _ = stop_tx.send(true);
        }
    }

    // --- Snapshots ---

    pub async fn get(&self, id: &str) -> Option<Connection> {
        self.sessions.lock().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Connection> {
        let mut all: Vec<Connection> = self.sessions.lock().await.values().cloned().collect();
        all.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        all
    }

    pub async fn active_qr_target(&self) -> Option<String> {
        self.active_qr_target.lock().await.clone()
    }

    pub async fn active_pairing_target(&self) -> Option<String> {
        self.active_pairing_target.lock().await.clone()
    }

    // --- Internals ---

    async fn wants_polling(&self, id: &str) -> bool {
        self.sessions
            .lock()
            .await
            .get(id)
            .map(|c| c.state.wants_polling())
            .unwrap_or(false)
    }

    async fn reconcile_polling(self: &Arc<Self>, id: &str, state: SessionState) {
        if state.wants_polling() {
            self.start_polling(id).await;
        } else {
            self.stop_polling(id).await;
        }
    }

    async fn set_qr_artifact(&self, id: &str, artifact: String) -> Connection {
        let mut sessions = self.sessions.lock().await;
        let conn = sessions
            .entry(id.to_string())
            .or_insert_with(|| Connection::new(id));
        conn.qr_payload = Some(artifact);
        conn.pairing_code = None;
        conn.state = SessionState::Pending;
        conn.last_error = None;
        conn.clone()
    }

    async fn get_or_default(&self, id: &str) -> Connection {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(id.to_string())
            .or_insert_with(|| Connection::new(id))
            .clone()
    }

    /// Records a lifecycle failure on the session itself; the entry is
    /// never dropped, so the UI can retry from where it stands.
    async fn note_error(&self, id: &str, error: &ApiError) {
        let mut sessions = self.sessions.lock().await;
        let conn = sessions
            .entry(id.to_string())
            .or_insert_with(|| Connection::new(id));
        conn.state = SessionState::Error;
        conn.last_error = Some(error.to_string());
    }

    async fn clear_targets(&self, id: &str) {
        let mut qr_target = self.active_qr_target.lock().await;
        if qr_target.as_deref() == Some(id) {
            *qr_target = None;
        }
        drop(qr_target);
        let mut pairing_target = self.active_pairing_target.lock().await;
        if pairing_target.as_deref() == Some(id) {
            *pairing_target = None;
        }
    }

    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, ApiError>>,
    ) -> Result<T, ApiError> {
        api::guarded(&self.auth, self.config.request_timeout, fut).await
    }
}

/// Merges a status snapshot into the session, refusing stale regressions:
/// once connected, only an explicit disconnect/error/delete moves the
/// state, never a lagging poll response.
fn apply_reported(conn: &mut Connection, resp: &SessionStatusResponse) -> bool {
    if conn.state == SessionState::Connected && resp.status.is_stale_after_connected() {
        debug!(
            target: "Connection",
            "ignoring stale {:?} report for connected session {}",
            resp.status, conn.session_id
        );
        return false;
    }

    let prev = conn.state;
    conn.state = resp.status;
    conn.has_stored_keys = resp.has_stored_keys;
    if resp.last_connected_at.is_some() {
        conn.last_connected_at = resp.last_connected_at;
    }
    conn.history_sync = HistorySyncState {
        enabled: resp.sync_history,
        status: resp.history_sync_status,
        synced_at: resp.history_synced_at,
    };

    match conn.state {
        SessionState::Connected => {
            conn.clear_pairing_artifacts();
            conn.has_connected = true;
            conn.last_error = None;
            if conn.last_connected_at.is_none() {
                conn.last_connected_at = Some(chrono::Utc::now());
            }
        }
        SessionState::Pending | SessionState::Connecting => {
            if let Some(artifact) = resp.qr_artifact() {
                conn.qr_payload = Some(artifact);
                conn.state = SessionState::Pending;
            } else if conn.state == SessionState::Connecting {
                // A QR artifact is only valid while pending; a handshake
                // that moved on invalidates the displayed code.
                conn.qr_payload = None;
            }
            conn.pairing_code = None;
        }
        SessionState::PairingCode => {
            conn.qr_payload = None;
            if resp.pairing_code.is_some() {
                conn.pairing_code = resp.pairing_code.clone();
            }
        }
        _ => conn.clear_pairing_artifacts(),
    }

    if prev != conn.state {
        info!(
            target: "Connection",
            "session {} {prev:?} -> {:?}", conn.session_id, conn.state
        );
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::connection::HistorySyncStatus;

    fn report(status: SessionState) -> SessionStatusResponse {
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

    #[test]
    fn connected_rejects_stale_handshake_reports() {
        let mut conn = Connection::new("s1");
        assert!(apply_reported(&mut conn, &report(SessionState::Connected)));
        assert!(!apply_reported(&mut conn, &report(SessionState::Pending)));
        assert_eq!(conn.state, SessionState::Connected);
        // An explicit disconnect still applies.
        assert!(apply_reported(&mut conn, &report(SessionState::Disconnected)));
        assert_eq!(conn.state, SessionState::Disconnected);
    }

    #[test]
    fn connecting_report_with_qr_becomes_pending() {
        let mut conn = Connection::new("s1");
        let mut resp = report(SessionState::Connecting);
        resp.qr = Some("XYZ".into());
        assert!(apply_reported(&mut conn, &resp));
        assert_eq!(conn.state, SessionState::Pending);
        assert_eq!(conn.qr_payload.as_deref(), Some("XYZ"));
        assert!(conn.pairing_code.is_none());
    }

    #[test]
    fn connecting_report_without_qr_drops_the_displayed_code() {
        let mut conn = Connection::new("s1");
        conn.qr_payload = Some("XYZ".into());
        conn.state = SessionState::Pending;
        assert!(apply_reported(&mut conn, &report(SessionState::Connecting)));
        assert_eq!(conn.state, SessionState::Connecting);
        assert!(conn.qr_payload.is_none());
        // A pending report without a fresh artifact keeps the one already
        // on screen.
        conn.qr_payload = Some("XYZ".into());
        conn.state = SessionState::Pending;
        assert!(apply_reported(&mut conn, &report(SessionState::Pending)));
        assert_eq!(conn.qr_payload.as_deref(), Some("XYZ"));
    }

    #[test]
    fn reaching_connected_clears_artifacts() {
        let mut conn = Connection::new("s1");
        conn.qr_payload = Some("XYZ".into());
        conn.state = SessionState::Pending;
        assert!(apply_reported(&mut conn, &report(SessionState::Connected)));
        assert!(conn.qr_payload.is_none());
        assert!(conn.has_connected);
        assert!(conn.last_connected_at.is_some());
    }
}
