use std::time::Duration;

// Defaults match the web console: sessions in a handshake state are polled
// every 4s, the whole tracked set is refreshed every 6s.
const SESSION_POLL_INTERVAL: Duration = Duration::from_secs(4);
const GLOBAL_REFRESH_INTERVAL: Duration = Duration::from_secs(6);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const SEEN_KEYS_CAP: usize = 500;

/// Tunables for the sync engine. One instance per authenticated session.
#[derive(Debug, Clone)]
pub struct Config {
    /// Interval of the per-session poll loop while the session is in a
    /// handshake state (pending / connecting / pairing_code).
    pub session_poll_interval: Duration,
    /// Interval of the slow refresh that re-queries every tracked session
    /// regardless of state, to catch externally-driven changes.
    pub global_refresh_interval: Duration,
    /// Hard deadline applied to every outbound API call.
    pub request_timeout: Duration,
    /// Per-chat cap on the recently-seen message key set used to
    /// de-duplicate at-least-once push delivery.
    pub seen_keys_cap: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_poll_interval: SESSION_POLL_INTERVAL,
            global_refresh_interval: GLOBAL_REFRESH_INTERVAL,
            request_timeout: REQUEST_TIMEOUT,
            seen_keys_cap: SEEN_KEYS_CAP,
        }
    }
}
