use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Failure taxonomy for every call that crosses the API seam.
///
/// Timeouts are reported as [`ApiError::Transport`]; they share the same
/// recovery path (user-initiated retry) as other network failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    /// Malformed input (e.g. a phone number that is not a normalized digit
    /// string). Never retried, surfaced immediately.
    #[error("invalid input: {0}")]
    Validation(String),

    /// The server rejected the action because another writer got there
    /// first (e.g. the chat is already attended by someone else).
    #[error("conflict: {0}")]
    Conflict(String),

    /// 401/403-class rejection. Escalated to a client-wide session
    /// invalidation via [`AuthWatch`]; never attached to a single entity.
    #[error("authorization rejected")]
    Auth,

    /// Network failure or timeout. Background polling swallows these;
    /// direct user actions surface them.
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("not found: {0}")]
    NotFound(String),
}

/// What the caller should do about an error. The console maps these to
/// different UI affordances, so a conflict must stay distinguishable from
/// a plain network failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// Fix the input; retrying the same request cannot succeed.
    FixInput,
    /// Refresh the roster; the local view is behind another writer.
    RefreshRoster,
    /// Re-authenticate; every other error is secondary to this.
    Relogin,
    /// Retry the same request.
    Retry,
}

impl ApiError {
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ApiError::Validation(_) => RecoveryHint::FixInput,
            ApiError::Conflict(_) => RecoveryHint::RefreshRoster,
            ApiError::Auth => RecoveryHint::Relogin,
            ApiError::Transport(_) | ApiError::NotFound(_) => RecoveryHint::Retry,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_))
    }
}

/// Client-wide session invalidation signal.
///
/// Any component observing [`ApiError::Auth`] calls [`AuthWatch::revoke`];
/// the presentation layer subscribes once and tears the whole client down
/// when the flag flips.
#[derive(Clone, Debug)]
pub struct AuthWatch {
    tx: Arc<watch::Sender<bool>>,
}

impl AuthWatch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn revoke(&self) {
        // send_replace updates the flag even while nobody subscribes yet;
        // a plain send would error out without a live receiver and the
        // revocation would be lost.
        self.tx.send_replace(true);
    }

    pub fn is_revoked(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for AuthWatch {
    fn default() -> Self {
        Self::new()
    }
}
