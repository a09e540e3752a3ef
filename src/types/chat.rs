use crate::types::connection::SessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Suffix identifying a group conversation on the remote identifier. The
/// console only manages 1:1 conversations; group events are dropped at the
/// reconciliation boundary.
pub const GROUP_SUFFIX: &str = "@g.us";

pub fn is_group_remote(remote: &str) -> bool {
    remote.ends_with(GROUP_SUFFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatStatus {
    Unassigned,
    Open,
    Closed,
}

/// Roster partition a chat belongs to; derived purely from its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tab {
    Unassigned,
    Open,
    Closed,
}

impl ChatStatus {
    pub fn tab(self) -> Tab {
        match self {
            ChatStatus::Unassigned => Tab::Unassigned,
            ChatStatus::Open => Tab::Open,
            ChatStatus::Closed => Tab::Closed,
        }
    }
}

/// Per-tab badge counters.
///
/// These track server-known totals, not loaded-page lengths: the roster is
/// paginated, so array lengths under-count. They are seeded from the list
/// query's totals on a replace load and maintained incrementally from
/// there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabCounts {
    pub unassigned: u64,
    pub open: u64,
    pub closed: u64,
}

impl TabCounts {
    pub fn get(&self, tab: Tab) -> u64 {
        match tab {
            Tab::Unassigned => self.unassigned,
            Tab::Open => self.open,
            Tab::Closed => self.closed,
        }
    }

    pub fn inc(&mut self, tab: Tab) {
        match tab {
            Tab::Unassigned => self.unassigned += 1,
            Tab::Open => self.open += 1,
            Tab::Closed => self.closed += 1,
        }
    }

    pub fn dec(&mut self, tab: Tab) {
        match tab {
            Tab::Unassigned => self.unassigned = self.unassigned.saturating_sub(1),
            Tab::Open => self.open = self.open.saturating_sub(1),
            Tab::Closed => self.closed = self.closed.saturating_sub(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub chat_id: String,
    pub status: ChatStatus,
    #[serde(default)]
    pub queue_id: Option<String>,
    #[serde(default)]
    pub assigned_user_id: Option<String>,
    pub connection_id: String,
    pub remote_phone: String,
    /// Display identity derived through the contact resolver.
    #[serde(default)]
    pub contact_display: Option<String>,
    /// Denormalized state of the owning connection, fanned out by the
    /// reconciliation layer on every connection status change.
    #[serde(default)]
    pub connection_status: Option<SessionState>,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Agent,
    Supervisor,
    Admin,
}

/// The authenticated user a sync engine instance renders for.
#[derive(Debug, Clone)]
pub struct Viewer {
    pub user_id: String,
    pub role: Role,
}

impl Viewer {
    /// Role-based visibility: supervisors and admins see everything; an
    /// agent sees a chat iff it is unassigned or assigned to them. This is
    /// re-applied on every chat mutation, not just at load time.
    pub fn can_see(&self, chat: &Chat) -> bool {
        match self.role {
            Role::Supervisor | Role::Admin => true,
            Role::Agent => chat
                .assigned_user_id
                .as_deref()
                .is_none_or(|assignee| assignee == self.user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(assigned: Option<&str>) -> Chat {
        Chat {
            chat_id: "c1".into(),
            status: ChatStatus::Open,
            queue_id: None,
            assigned_user_id: assigned.map(str::to_string),
            connection_id: "s1".into(),
            remote_phone: "5215512345678".into(),
            contact_display: None,
            connection_status: None,
            last_activity_at: Utc::now(),
        }
    }

    #[test]
    fn agent_sees_unassigned_and_own_chats_only() {
        let viewer = Viewer {
            user_id: "agent-a".into(),
            role: Role::Agent,
        };
        assert!(viewer.can_see(&chat(None)));
        assert!(viewer.can_see(&chat(Some("agent-a"))));
        assert!(!viewer.can_see(&chat(Some("agent-b"))));
    }

    #[test]
    fn supervisor_sees_everything() {
        let viewer = Viewer {
            user_id: "sup".into(),
            role: Role::Supervisor,
        };
        assert!(viewer.can_see(&chat(Some("agent-b"))));
    }

    #[test]
    fn counters_saturate_at_zero() {
        let mut counts = TabCounts::default();
        counts.dec(Tab::Open);
        assert_eq!(counts.open, 0);
        counts.inc(Tab::Open);
        counts.inc(Tab::Open);
        counts.dec(Tab::Open);
        assert_eq!(counts.get(Tab::Open), 1);
    }

    #[test]
    fn group_suffix_is_detected() {
        assert!(is_group_remote("5215512345678-163244@g.us"));
        assert!(!is_group_remote("5215512345678"));
    }
}
