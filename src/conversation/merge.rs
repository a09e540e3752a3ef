use crate::types::message::{Message, MessageKey, MessageStatus};
use std::collections::HashMap;

/// Merges a batch of incoming messages (push event, page fetch or local
/// optimistic send) into an existing ordered list and returns the complete
/// new list.
///
/// Idempotent, and commutative for batches that do not share a key. For a
/// shared key the copy with the greater timestamp provides the content and
/// the status/metadata fields are unioned, so a late-arriving delivery ack
/// is never lost to timestamp comparison.
pub fn merge_messages(existing: Vec<Message>, incoming: &[Message]) -> Vec<Message> {
    let mut by_key: HashMap<MessageKey, Message> = existing
        .into_iter()
        .map(|message| (message.key(), message))
        .collect();

    for item in incoming {
        // Empty placeholders without a terminal status pollute the view;
        // deleted tombstones must stay visible as "deleted".
        if !item.content.is_renderable() && !item.status.is_terminal() {
            continue;
        }
        match by_key.entry(item.key()) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(item.clone());
            }
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                let merged = resolve_conflict(slot.get(), item);
                slot.insert(merged);
            }
        }
    }

    let mut out: Vec<Message> = by_key.into_values().collect();
    out.sort_by(|a, b| a.chat_order(b));
    out
}

fn resolve_conflict(current: &Message, incoming: &Message) -> Message {
    let (mut base, other) = if incoming.timestamp > current.timestamp {
        (incoming.clone(), current)
    } else {
        (current.clone(), incoming)
    };

    // Union metadata the base is missing or that advanced on the other
    // copy. Status advancement is one-way (see MessageStatus ordering).
    if other.status > base.status {
        base.status = other.status;
    }
    if !base.content.is_renderable()
        && base.status != MessageStatus::Deleted
        && other.content.is_renderable()
    {
        base.content = other.content.clone();
    }
    if base.created_at.is_none() {
        base.created_at = other.created_at;
    }
    if base.wa_message_id.is_none() {
        base.wa_message_id = other.wa_message_id.clone();
    }
    if base.id.is_none() {
        base.id = other.id.clone();
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::message::{Direction, MessageContent};
    use chrono::{TimeZone, Utc};

    fn msg(wa_id: &str, ts: i64, status: MessageStatus, body: &str) -> Message {
        Message {
            wa_message_id: Some(wa_id.to_string()),
            id: None,
            chat_id: "c1".into(),
            direction: Direction::In,
            content: if body.is_empty() {
                MessageContent::Empty
            } else {
                MessageContent::Text { body: body.into() }
            },
            status,
            timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
            created_at: Some(Utc.timestamp_opt(ts, 0).unwrap()),
        }
    }

    fn keys(list: &[Message]) -> Vec<MessageKey> {
        list.iter().map(Message::key).collect()
    }

    #[test]
    fn merge_is_idempotent() {
        let batch = vec![
            msg("m1", 100, MessageStatus::Sent, "a"),
            msg("m2", 101, MessageStatus::Delivered, "b"),
        ];
        let once = merge_messages(Vec::new(), &batch);
        let twice = merge_messages(once.clone(), &batch);
        assert_eq!(once, twice);
    }

    #[test]
    fn disjoint_batches_commute() {
        let b1 = vec![msg("m1", 100, MessageStatus::Sent, "a")];
        let b2 = vec![msg("m2", 101, MessageStatus::Sent, "b")];
        let ab = merge_messages(merge_messages(Vec::new(), &b1), &b2);
        let ba = merge_messages(merge_messages(Vec::new(), &b2), &b1);
        assert_eq!(ab, ba);
    }

    #[test]
    fn no_duplicate_keys_after_merge() {
        let batch = vec![
            msg("m1", 100, MessageStatus::Sent, "a"),
            msg("m1", 100, MessageStatus::Sent, "a"),
            msg("m2", 101, MessageStatus::Sent, "b"),
        ];
        let merged = merge_messages(Vec::new(), &batch);
        let mut seen = keys(&merged);
        seen.dedup();
        assert_eq!(seen.len(), merged.len());
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn output_is_sorted_by_timestamp_created_at_key() {
        let mut a = msg("b-key", 100, MessageStatus::Sent, "same second");
        let mut b = msg("a-key", 100, MessageStatus::Sent, "same second");
        a.created_at = Some(Utc.timestamp_opt(100, 0).unwrap());
        b.created_at = Some(Utc.timestamp_opt(100, 0).unwrap());
        let merged = merge_messages(Vec::new(), &[a, b]);
        // Identical timestamp and created_at: the key decides.
        assert_eq!(
            keys(&merged),
            vec![
                MessageKey::Remote("a-key".into()),
                MessageKey::Remote("b-key".into())
            ]
        );
    }

    #[test]
    fn later_copy_wins_and_status_unions() {
        // Scenario: m1 arrives as "sent", then again later as "delivered".
        let first = msg("m1", 100, MessageStatus::Sent, "hola");
        let second = msg("m1", 105, MessageStatus::Delivered, "hola");
        let merged = merge_messages(merge_messages(Vec::new(), &[first]), &[second]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, MessageStatus::Delivered);
    }

    #[test]
    fn stale_ack_still_contributes_status() {
        // The ack carries an older timestamp than the stored copy but a
        // more advanced status; the union must keep it.
        let stored = msg("m1", 105, MessageStatus::Sent, "hola");
        let ack = msg("m1", 100, MessageStatus::Read, "");
        let merged = merge_messages(vec![stored], &[ack]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, MessageStatus::Read);
        assert!(merged[0].content.is_renderable());
    }

    #[test]
    fn empty_placeholders_are_discarded_but_tombstones_kept() {
        let placeholder = msg("m1", 100, MessageStatus::Pending, "");
        let tombstone = msg("m2", 101, MessageStatus::Deleted, "");
        let merged = merge_messages(Vec::new(), &[placeholder, tombstone]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].status, MessageStatus::Deleted);
    }

    #[test]
    fn ack_never_downgrades_a_read_entry() {
        let stored = msg("m1", 100, MessageStatus::Read, "hola");
        let late_ack = msg("m1", 102, MessageStatus::Delivered, "");
        let merged = merge_messages(vec![stored], &[late_ack]);
        assert_eq!(merged[0].status, MessageStatus::Read);
    }
}
