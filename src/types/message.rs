use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// Delivery status. Variant order is meaningful: the derived `Ord` is the
/// advancement ranking used when two copies of the same message union
/// their metadata (a `delivered` ack never downgrades a `read` entry, a
/// `deleted` tombstone wins over everything).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
    Deleted,
}

impl MessageStatus {
    /// Statuses that keep a content-less item alive through the merge.
    /// Empty `pending`/`sent` placeholders are the ones worth discarding;
    /// acks and tombstones must survive so their status can be unioned
    /// into the existing entry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Delivered
                | MessageStatus::Read
                | MessageStatus::Failed
                | MessageStatus::Deleted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Media {
        media_ref: String,
        #[serde(default)]
        caption: Option<String>,
    },
    /// Structured payload (buttons, lists, templates) passed through
    /// opaquely to the renderer.
    Structured {
        payload: serde_json::Value,
    },
    Empty,
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Empty
    }
}

impl MessageContent {
    pub fn is_renderable(&self) -> bool {
        match self {
            MessageContent::Text { body } => !body.is_empty(),
            MessageContent::Media { .. } | MessageContent::Structured { .. } => true,
            MessageContent::Empty => false,
        }
    }
}

/// Deduplication identity of a message.
///
/// The remote WhatsApp id is authoritative; a local persistence id covers
/// optimistic sends that have not been echoed yet; the digest form is a
/// fallback for malformed events carrying neither. Two genuinely
/// distinct ID-less messages with identical direction, content and
/// timestamp collapse onto one digest key; that ambiguity is inherent to
/// the fallback and is not disambiguated further.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKey {
    Remote(String),
    Local(String),
    Digest(String),
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKey::Remote(id) => write!(f, "wa:{id}"),
            MessageKey::Local(id) => write!(f, "local:{id}"),
            MessageKey::Digest(d) => write!(f, "digest:{d}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Authoritative WhatsApp message id, when known.
    #[serde(default)]
    pub wa_message_id: Option<String>,
    /// Local persistence id (also used for optimistic placeholders).
    #[serde(default)]
    pub id: Option<String>,
    pub chat_id: String,
    pub direction: Direction,
    #[serde(default)]
    pub content: MessageContent,
    pub status: MessageStatus,
    /// Authoritative send/receive time.
    pub timestamp: DateTime<Utc>,
    /// Local persistence time, used only as an ordering tiebreak.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn key(&self) -> MessageKey {
        if let Some(id) = &self.wa_message_id
            && !id.is_empty()
        {
            return MessageKey::Remote(id.clone());
        }
        if let Some(id) = &self.id
            && !id.is_empty()
        {
            return MessageKey::Local(id.clone());
        }
        let seed = format!(
            "{:?}|{}|{}",
            self.direction,
            self.content_digest_input(),
            self.timestamp.timestamp_millis()
        );
        MessageKey::Digest(format!("{:x}", md5::compute(seed.as_bytes())))
    }

    fn content_digest_input(&self) -> String {
        match &self.content {
            MessageContent::Text { body } => body.clone(),
            MessageContent::Media { media_ref, .. } => media_ref.clone(),
            MessageContent::Structured { payload } => payload.to_string(),
            MessageContent::Empty => String::new(),
        }
    }

    /// Total order within a chat: `(timestamp, created_at, key)` ascending.
    /// Three levels because timestamps collide in same-second batches and
    /// `created_at` collides in import/backfill scenarios; the key makes
    /// the order deterministic.
    pub fn chat_order(&self, other: &Message) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.created_at.cmp(&other.created_at))
            .then_with(|| self.key().cmp(&other.key()))
    }
}
