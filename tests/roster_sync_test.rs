use std::sync::Arc;
use waconsole::api::{ChatPage, ChatQuery, MessagePage};
use waconsole::config::Config;
use waconsole::conversation::ConversationSync;
use waconsole::error::{ApiError, AuthWatch, RecoveryHint};
use waconsole::test_utils::{
    MockApi, chat_fixture, message_fixture, viewer_agent, viewer_supervisor,
};
use waconsole::types::chat::{ChatStatus, Tab, TabCounts, Viewer};
use waconsole::types::message::{MessageContent, MessageKey, MessageStatus};

fn sync_for(api: &Arc<MockApi>, viewer: Viewer) -> ConversationSync {
    ConversationSync::new(api.clone(), viewer, Config::default(), AuthWatch::new())
}

fn seeded_counts(unassigned: u64, open: u64, closed: u64) -> TabCounts {
    TabCounts {
        unassigned,
        open,
        closed,
    }
}

#[tokio::test]
async fn roster_load_filters_by_role_and_seeds_counters() {
    let api = Arc::new(MockApi::default());
    api.push_chat_page(Ok(ChatPage {
        items: vec![
            chat_fixture("c1", ChatStatus::Unassigned, None),
            chat_fixture("c2", ChatStatus::Open, Some("agent-a")),
            chat_fixture("c3", ChatStatus::Open, Some("agent-b")),
        ],
        next_cursor: Some("page2".into()),
        counts: Some(seeded_counts(4, 7, 2)),
    }));

    let sync = sync_for(&api, viewer_agent("agent-a"));
    sync.load_roster(&ChatQuery::default(), false).await.unwrap();

    let visible = sync.visible_chats().await;
    let ids: Vec<_> = visible.iter().map(|c| c.chat_id.as_str()).collect();
    assert!(ids.contains(&"c1"));
    assert!(ids.contains(&"c2"));
    assert!(!ids.contains(&"c3"), "another agent's chat must be filtered");

    // Counters come from the server totals, not the filtered page length.
    let counts = sync.counts().await;
    assert_eq!(counts.get(Tab::Unassigned), 4);
    assert_eq!(counts.get(Tab::Open), 7);
    assert_eq!(counts.get(Tab::Closed), 2);
    assert_eq!(sync.roster_cursor().await.as_deref(), Some("page2"));
}

#[tokio::test]
async fn supervisor_sees_every_assignment() {
    let api = Arc::new(MockApi::default());
    api.push_chat_page(Ok(ChatPage {
        items: vec![
            chat_fixture("c1", ChatStatus::Open, Some("agent-a")),
            chat_fixture("c2", ChatStatus::Open, Some("agent-b")),
        ],
        next_cursor: None,
        counts: None,
    }));

    let sync = sync_for(&api, viewer_supervisor("sup-1"));
    sync.load_roster(&ChatQuery::default(), false).await.unwrap();
    assert_eq!(sync.visible_chats().await.len(), 2);
}

#[tokio::test]
async fn append_pages_never_reseed_counters() {
    let api = Arc::new(MockApi::default());
    api.push_chat_page(Ok(ChatPage {
        items: vec![chat_fixture("c1", ChatStatus::Open, None)],
        next_cursor: Some("page2".into()),
        counts: Some(seeded_counts(0, 9, 0)),
    }));
    api.push_chat_page(Ok(ChatPage {
        items: vec![chat_fixture("c2", ChatStatus::Open, None)],
        next_cursor: None,
        counts: Some(seeded_counts(0, 1, 0)),
    }));

    let sync = sync_for(&api, viewer_supervisor("sup-1"));
    sync.load_roster(&ChatQuery::default(), false).await.unwrap();
    sync.load_roster(&ChatQuery::default(), true).await.unwrap();

    assert_eq!(sync.visible_chats().await.len(), 2);
    assert_eq!(sync.counts().await.get(Tab::Open), 9);
    assert!(sync.roster_cursor().await.is_none());
}

#[tokio::test]
async fn chat_claimed_by_someone_else_leaves_the_agents_view() {
    let api = Arc::new(MockApi::default());
    api.push_chat_page(Ok(ChatPage {
        items: vec![chat_fixture("c1", ChatStatus::Unassigned, None)],
        next_cursor: None,
        counts: Some(seeded_counts(1, 0, 0)),
    }));

    let sync = sync_for(&api, viewer_agent("agent-b"));
    sync.load_roster(&ChatQuery::default(), false).await.unwrap();
    sync.set_active_chat(Some("c1".into())).await;

    // Another agent wins the claim; the push-reported chat is no longer
    // visible to this viewer.
    sync.apply_chat(chat_fixture("c1", ChatStatus::Open, Some("agent-a")))
        .await;

    assert!(sync.chat("c1").await.is_none());
    assert_eq!(sync.counts().await.get(Tab::Unassigned), 0);
    assert_eq!(sync.counts().await.get(Tab::Open), 0);
    assert!(
        sync.active_chat().await.is_none(),
        "selection must not point at an invisible chat"
    );
}

#[tokio::test]
async fn claim_conflict_maps_to_a_roster_refresh() {
    let api = Arc::new(MockApi::default());
    api.push_assign(Err(ApiError::Conflict("already attended".into())));

    let sync = sync_for(&api, viewer_agent("agent-b"));
    let err = sync.claim("c1").await.unwrap_err();
    assert!(matches!(err, ApiError::Conflict(_)));
    assert_eq!(err.recovery_hint(), RecoveryHint::RefreshRoster);
}

#[tokio::test]
async fn claim_success_moves_the_chat_between_tabs() {
    let api = Arc::new(MockApi::default());
    api.push_chat_page(Ok(ChatPage {
        items: vec![chat_fixture("c1", ChatStatus::Unassigned, None)],
        next_cursor: None,
        counts: Some(seeded_counts(1, 0, 0)),
    }));
    api.push_assign(Ok(chat_fixture("c1", ChatStatus::Open, Some("agent-a"))));

    let sync = sync_for(&api, viewer_agent("agent-a"));
    sync.load_roster(&ChatQuery::default(), false).await.unwrap();

    let chat = sync.claim("c1").await.unwrap();
    assert_eq!(chat.status, ChatStatus::Open);
    assert_eq!(sync.counts().await.get(Tab::Unassigned), 0);
    assert_eq!(sync.counts().await.get(Tab::Open), 1);
    assert_eq!(sync.chat("c1").await.unwrap().status, ChatStatus::Open);
}

#[tokio::test]
async fn auto_close_moves_an_open_chat_to_closed() {
    let api = Arc::new(MockApi::default());
    api.push_chat_page(Ok(ChatPage {
        items: vec![chat_fixture("c1", ChatStatus::Open, Some("agent-a"))],
        next_cursor: None,
        counts: Some(seeded_counts(0, 1, 0)),
    }));

    let sync = sync_for(&api, viewer_agent("agent-a"));
    sync.load_roster(&ChatQuery::default(), false).await.unwrap();

    sync.apply_auto_closed("c1").await;
    assert_eq!(sync.chat("c1").await.unwrap().status, ChatStatus::Closed);
    assert_eq!(sync.counts().await.get(Tab::Open), 0);
    assert_eq!(sync.counts().await.get(Tab::Closed), 1);

    // Unknown chats are ignored without touching the counters.
    sync.apply_auto_closed("nope").await;
    assert_eq!(sync.counts().await.get(Tab::Closed), 1);
}

#[tokio::test]
async fn reload_without_the_active_chat_clears_the_selection() {
    let api = Arc::new(MockApi::default());
    api.push_chat_page(Ok(ChatPage {
        items: vec![chat_fixture("c1", ChatStatus::Open, None)],
        next_cursor: None,
        counts: None,
    }));
    api.push_chat_page(Ok(ChatPage {
        items: vec![chat_fixture("c2", ChatStatus::Open, None)],
        next_cursor: None,
        counts: None,
    }));

    let sync = sync_for(&api, viewer_supervisor("sup-1"));
    sync.load_roster(&ChatQuery::default(), false).await.unwrap();
    sync.set_active_chat(Some("c1".into())).await;

    sync.load_roster(&ChatQuery::default(), false).await.unwrap();
    assert!(sync.chat("c1").await.is_none());
    assert!(sync.active_chat().await.is_none());
}

#[tokio::test]
async fn optimistic_send_collapses_into_the_server_echo() {
    let api = Arc::new(MockApi::default());
    let sync = sync_for(&api, viewer_agent("agent-a"));

    let echo = sync
        .send_message("c1", MessageContent::Text { body: "hola".into() })
        .await
        .unwrap();
    assert_eq!(echo.status, MessageStatus::Sent);
    assert!(echo.wa_message_id.is_some());

    let messages = sync.messages_of("c1").await;
    assert_eq!(messages.len(), 1, "placeholder and echo must not coexist");
    assert!(matches!(messages[0].key(), MessageKey::Remote(_)));
    assert_eq!(messages[0].status, MessageStatus::Sent);
}

#[tokio::test]
async fn failed_send_leaves_a_retryable_placeholder() {
    let api = Arc::new(MockApi::default());
    api.push_send(Err(ApiError::Transport("connection reset".into())));

    let sync = sync_for(&api, viewer_agent("agent-a"));
    let err = sync
        .send_message("c1", MessageContent::Text { body: "hola".into() })
        .await
        .unwrap_err();
    assert!(err.is_transport());

    let messages = sync.messages_of("c1").await;
    assert_eq!(messages.len(), 1);
    assert!(matches!(messages[0].key(), MessageKey::Local(_)));
    assert_eq!(messages[0].status, MessageStatus::Failed);
}

#[tokio::test]
async fn quick_replies_ride_the_same_send_pipeline() {
    let api = Arc::new(MockApi::default());
    let sync = sync_for(&api, viewer_agent("agent-a"));

    let echo = sync.send_quick_reply("c1", "Be right with you").await.unwrap();
    assert_eq!(
        echo.content,
        MessageContent::Text { body: "Be right with you".into() }
    );
    assert_eq!(sync.messages_of("c1").await.len(), 1);
}

#[tokio::test]
async fn older_pages_merge_behind_the_retained_cursor() {
    let api = Arc::new(MockApi::default());
    api.push_message_page(
        "c1",
        Ok(MessagePage {
            messages: vec![
                message_fixture("w2", "c1", 2_000, MessageStatus::Delivered),
                message_fixture("w3", "c1", 3_000, MessageStatus::Delivered),
            ],
            next_cursor: Some("older".into()),
        }),
    );
    api.push_message_page(
        "c1",
        Ok(MessagePage {
            messages: vec![message_fixture("w1", "c1", 1_000, MessageStatus::Read)],
            next_cursor: None,
        }),
    );

    let sync = sync_for(&api, viewer_supervisor("sup-1"));
    sync.load_latest_messages("c1").await.unwrap();
    assert!(sync.load_older_messages("c1").await.unwrap());

    let messages = sync.messages_of("c1").await;
    let ids: Vec<_> = messages
        .iter()
        .filter_map(|m| m.wa_message_id.as_deref())
        .collect();
    assert_eq!(ids, vec!["w1", "w2", "w3"], "ascending timestamp order");

    // History is exhausted; a further fetch is a no-op.
    assert!(!sync.load_older_messages("c1").await.unwrap());
}

#[tokio::test]
async fn incoming_messages_bump_chat_recency_ordering() {
    let api = Arc::new(MockApi::default());
    api.push_chat_page(Ok(ChatPage {
        items: vec![
            chat_fixture("c1", ChatStatus::Open, None),
            chat_fixture("c2", ChatStatus::Open, None),
        ],
        next_cursor: None,
        counts: None,
    }));

    let sync = sync_for(&api, viewer_supervisor("sup-1"));
    sync.load_roster(&ChatQuery::default(), false).await.unwrap();

    sync.apply_messages(
        "c2",
        vec![message_fixture("w1", "c2", 1_800_000_000, MessageStatus::Delivered)],
    )
    .await;

    let visible = sync.visible_chats().await;
    assert_eq!(visible[0].chat_id, "c2", "newest activity sorts first");
}
