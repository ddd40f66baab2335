use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::Instant;

use hearth_shared::models::{ConversationUpdate, UserProfile};
use hearth_shared::protocol::{MediaUpload, ServerEvent};
use hearth_shared::types::{
    ConnectionId, ConversationId, ConversationKind, MessageKind, MessageStatus, ParticipantRole,
    PresenceStatus, SecurityStatus, UserType,
};

use super::*;
use crate::cache::MessageCache;
use crate::hub::{Evicted, Hub, OUTBOUND_QUEUE};
use crate::media::tests::{png, test_store};
use crate::moderation::tests::{flagged, ScriptedModeration};
use crate::moderation::{ModerationError, ModerationService, ModerationSettings};
use crate::notifier::tests::RecordingNotifier;
use crate::store::tests::{drop_table, seed_user, temp_store};
use crate::store::SqliteStore;

pub(crate) struct Client {
    pub(crate) caller: Caller,
    pub(crate) rx: mpsc::Receiver<Arc<ServerEvent>>,
    pub(crate) evicted: Evicted,
}

impl Client {
    /// Everything queued for this connection so far.
    pub(crate) fn events(&mut self) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event.as_ref().clone());
        }
        out
    }
}

pub(crate) struct Harness {
    pub(crate) engine: MessagingEngine,
    pub(crate) store: SqliteStore,
    pub(crate) moderation: Arc<ScriptedModeration>,
    notifier: Arc<RecordingNotifier>,
    _db: TempDir,
    _media: TempDir,
}

impl Harness {
    pub(crate) async fn new() -> Self {
        Self::build(true, true).await
    }

    pub(crate) async fn build(moderation_enabled: bool, fail_open: bool) -> Self {
        let (store, db) = temp_store();
        let (media, media_dir) = test_store().await;
        let moderation = Arc::new(ScriptedModeration::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let service: Arc<dyn ModerationService> = moderation.clone();
        let engine = MessagingEngine::new(EngineParts {
            store: Arc::new(store.clone()),
            moderation: ModerationGateway::new(
                Some(service),
                ModerationSettings {
                    timeout: Duration::from_secs(1),
                    fail_open,
                    scan_max_attempts: 2,
                    scan_backoff: Duration::from_millis(1),
                },
            ),
            media: Arc::new(media),
            notifier: notifier.clone(),
            presence: Arc::new(PresenceRegistry::new()),
            typing: Arc::new(TypingTracker::new(Duration::from_secs(5))),
            cache: Arc::new(MessageCache::new(3)),
            hub: Arc::new(Hub::new()),
            settings: EngineSettings {
                max_media_size: 1024 * 1024,
                default_moderation_enabled: moderation_enabled,
                default_ai_scan_enabled: true,
                media_scan_delay: Duration::ZERO,
            },
        });

        Self {
            engine,
            store,
            moderation,
            notifier,
            _db: db,
            _media: media_dir,
        }
    }

    pub(crate) async fn user(&self, name: &str) -> UserProfile {
        seed_user(&self.store, name, UserType::Tenant).await
    }

    pub(crate) async fn connect(&self, user: &UserProfile) -> Client {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let connection = ConnectionId::new();
        let evicted = self.engine.hub().register(connection, tx);
        let (caller, _) = self
            .engine
            .connect(connection, user.id, &format!("{}-token", user.display_name))
            .await
            .unwrap();
        Client {
            caller,
            rx,
            evicted,
        }
    }

    pub(crate) async fn direct(&self, caller: &Client, other: &UserProfile) -> ConversationId {
        self.engine
            .create_conversation(&caller.caller, create(ConversationKind::Direct, &[other]))
            .await
            .unwrap()
            .conversation
            .id
    }

    pub(crate) async fn group(&self, admin: &Client, members: &[&UserProfile]) -> ConversationId {
        self.engine
            .create_conversation(&admin.caller, create(ConversationKind::Group, members))
            .await
            .unwrap()
            .conversation
            .id
    }

    /// Wait for background work to land.
    async fn eventually(&self, mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("background work did not complete");
    }
}

fn create(kind: ConversationKind, members: &[&UserProfile]) -> CreateConversation {
    CreateConversation {
        kind,
        participant_ids: members.iter().map(|u| u.id).collect(),
        title: (kind == ConversationKind::Group).then(|| "Flat 4B".to_string()),
        description: None,
        avatar_url: None,
        is_public: None,
        is_encrypted: None,
    }
}

fn text(conversation_id: ConversationId, body: &str) -> SendMessage {
    SendMessage {
        conversation_id,
        content: Some(body.to_string()),
        ..Default::default()
    }
}

fn image(conversation_id: ConversationId) -> SendMessage {
    SendMessage {
        conversation_id,
        media: Some(MediaUpload {
            mime_type: "image/png".into(),
            file_name: "kitchen.png".into(),
            data: base64::engine::general_purpose::STANDARD.encode(png(64, 48)),
            duration_secs: None,
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn direct_conversation_is_created_once_per_pair() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let ca = h.connect(&a).await;
    let cb = h.connect(&b).await;

    let first = h.direct(&ca, &b).await;
    let second = h.direct(&ca, &b).await;
    let reversed = h.direct(&cb, &a).await;
    assert_eq!(first, second);
    assert_eq!(first, reversed);
    assert_eq!(h.engine.conversations(a.id).await.unwrap().len(), 1);

    let to_self = h
        .engine
        .create_conversation(&ca.caller, create(ConversationKind::Direct, &[&a]))
        .await;
    assert!(matches!(to_self, Err(ServerError::Validation(_))));
}

#[tokio::test]
async fn direct_message_reaches_partner_read_by_sender() {
    let h = Harness::build(false, true).await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let mut ca = h.connect(&a).await;
    let mut cb = h.connect(&b).await;
    let conv = h.direct(&ca, &b).await;
    ca.events();
    cb.events();

    let mut request = text(conv, "hello");
    request.client_ref = Some("c-1".into());
    let view = h.engine.send_message(&ca.caller, request).await.unwrap();
    assert_eq!(view.status, MessageStatus::Sent);
    assert_eq!(view.security_status, SecurityStatus::Pending);
    assert_eq!(view.read_by.len(), 1);
    assert_eq!(view.read_by[0].user_id, a.id);

    let delivered: Vec<_> = cb
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::NewMessage { message } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].content.as_deref(), Some("hello"));
    assert_eq!(delivered[0].sender.display_name, "alice");

    // The sender is acknowledged instead of receiving a copy.
    let acks = ca.events();
    assert!(acks.iter().any(|e| matches!(
        e,
        ServerEvent::MessageSent { client_ref: Some(r), .. } if r == "c-1"
    )));
    assert!(!acks.iter().any(|e| matches!(e, ServerEvent::NewMessage { .. })));

    let (feed, has_more) = h.engine.messages(&cb.caller, conv, None, None).await.unwrap();
    assert!(!has_more);
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].read_by[0].user_id, a.id);
}

#[tokio::test]
async fn high_risk_text_is_rejected_and_not_persisted() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let ca = h.connect(&a).await;
    let mut cb = h.connect(&b).await;
    let conv = h.group(&ca, &[&b]).await;
    cb.events();

    h.moderation.push_text(Ok(flagged("hate", 0.95)));
    let outcome = h.engine.send_message(&ca.caller, text(conv, "...")).await;
    match outcome {
        Err(ServerError::ModerationBlocked { categories }) => assert_eq!(categories, vec!["hate"]),
        other => panic!("expected a moderation block, got {other:?}"),
    }

    let stored = h.store.list_recent_messages(conv, 50, None).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].kind, MessageKind::System);
    assert!(!cb
        .events()
        .iter()
        .any(|e| matches!(e, ServerEvent::NewMessage { .. })));
}

#[tokio::test]
async fn flagged_text_is_delivered_with_audit_details() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let ca = h.connect(&a).await;
    let conv = h.direct(&ca, &b).await;

    h.moderation.push_text(Ok(flagged("harassment", 0.8)));
    let view = h
        .engine
        .send_message(&ca.caller, text(conv, "borderline"))
        .await
        .unwrap();
    assert_eq!(view.security_status, SecurityStatus::Flagged);

    let stored = h.store.get_message(view.id).await.unwrap();
    let details = stored.security_details.unwrap();
    assert!(details.flagged);
    assert!(details.high_risk.is_empty());
}

#[tokio::test]
async fn moderation_outage_follows_fail_policy() {
    let open = Harness::new().await;
    let (a, b) = (open.user("alice").await, open.user("bob").await);
    let ca = open.connect(&a).await;
    let conv = open.direct(&ca, &b).await;
    open.moderation
        .push_text(Err(ModerationError::Unavailable("down".into())));
    let view = open.engine.send_message(&ca.caller, text(conv, "hi")).await.unwrap();
    assert_eq!(view.security_status, SecurityStatus::Pending);

    let closed = Harness::build(true, false).await;
    let (a, b) = (closed.user("alice").await, closed.user("bob").await);
    let ca = closed.connect(&a).await;
    let conv = closed.direct(&ca, &b).await;
    closed
        .moderation
        .push_text(Err(ModerationError::Unavailable("down".into())));
    let outcome = closed.engine.send_message(&ca.caller, text(conv, "hi")).await;
    assert!(matches!(outcome, Err(ServerError::Dependency(_))));
    assert!(closed
        .store
        .list_recent_messages(conv, 50, None)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn invalid_sends_are_rejected_before_any_io() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let ca = h.connect(&a).await;
    let conv = h.direct(&ca, &b).await;

    let empty = SendMessage {
        conversation_id: conv,
        content: Some("   ".into()),
        ..Default::default()
    };
    assert!(matches!(
        h.engine.send_message(&ca.caller, empty).await,
        Err(ServerError::Validation(_))
    ));

    let mut exe = image(conv);
    if let Some(media) = exe.media.as_mut() {
        media.mime_type = "application/x-msdownload".into();
    }
    assert!(matches!(
        h.engine.send_message(&ca.caller, exe).await,
        Err(ServerError::Validation(_))
    ));

    let outsider = h.connect(&h.user("mallory").await).await;
    assert!(matches!(
        h.engine.send_message(&outsider.caller, text(conv, "hi")).await,
        Err(ServerError::Authorization(_))
    ));
    assert!(matches!(
        h.engine
            .send_message(&ca.caller, text(ConversationId::new(), "hi"))
            .await,
        Err(ServerError::Authorization(_))
    ));
}

#[tokio::test]
async fn send_only_member_cannot_add_participants() {
    let h = Harness::new().await;
    let (a, b, c) = (h.user("alice").await, h.user("bob").await, h.user("carol").await);
    let ca = h.connect(&a).await;
    let cb = h.connect(&b).await;
    let conv = h.group(&ca, &[&b]).await;

    let outcome = h.engine.add_participants(&cb.caller, conv, vec![c.id]).await;
    assert!(matches!(outcome, Err(ServerError::Authorization(_))));
    assert_eq!(h.store.list_participants(conv).await.unwrap().len(), 2);

    let added = h.engine.add_participants(&ca.caller, conv, vec![b.id, c.id]).await.unwrap();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0].user_id, c.id);
    assert_eq!(h.store.list_participants(conv).await.unwrap().len(), 3);

    let direct = h.direct(&ca, &b).await;
    assert!(matches!(
        h.engine.add_participants(&ca.caller, direct, vec![c.id]).await,
        Err(ServerError::Validation(_))
    ));
}

#[tokio::test]
async fn media_scan_blocks_delivered_image() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let ca = h.connect(&a).await;
    let mut cb = h.connect(&b).await;
    let conv = h.direct(&ca, &b).await;

    h.moderation.push_media(Ok(flagged("violence", 0.95)));
    let view = h.engine.send_message(&ca.caller, image(conv)).await.unwrap();
    assert_eq!(view.kind, MessageKind::Image);
    let media = view.media.clone().unwrap();
    assert!(media.thumbnail_url.is_some());
    assert_eq!((media.width, media.height), (Some(64), Some(48)));

    let id = view.id;
    let mut blocked = false;
    for _ in 0..200 {
        if h.store.get_message(id).await.unwrap().is_blocked() {
            blocked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(blocked, "media scan never applied");

    assert_eq!(h.moderation.media_calls.lock().len(), 1);
    assert_eq!(h.store.list_recent_messages(conv, 50, None).await.unwrap().len(), 1);
    assert!(cb.events().iter().any(|e| matches!(
        e,
        ServerEvent::MessageSecurityUpdated { message_id, security_status: SecurityStatus::Blocked, .. }
            if *message_id == id
    )));

    // Hidden from everyone but the sender.
    let (others, _) = h.engine.messages(&cb.caller, conv, None, None).await.unwrap();
    assert!(others.is_empty());
    let (own, _) = h.engine.messages(&ca.caller, conv, None, None).await.unwrap();
    assert_eq!(own.len(), 1);
    assert_eq!(own[0].security_status, SecurityStatus::Blocked);
    assert_eq!(h.store.unread_count(conv, b.id).await.unwrap(), 0);
}

#[tokio::test]
async fn repeated_verdict_is_a_no_op() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let ca = h.connect(&a).await;
    let conv = h.direct(&ca, &b).await;
    let view = h.engine.send_message(&ca.caller, text(conv, "hi")).await.unwrap();

    let verdict = |score| {
        let (status, details) = crate::moderation::evaluate(
            &flagged("sexual", score),
            hearth_shared::models::ModerationSource::Media,
            0.9,
            chrono::Utc::now(),
        );
        crate::moderation::Verdict { status, details }
    };
    assert!(h.engine.apply_media_verdict(conv, view.id, verdict(0.95)).await.unwrap());
    assert!(!h.engine.apply_media_verdict(conv, view.id, verdict(0.95)).await.unwrap());
    // A milder verdict never downgrades.
    assert!(!h.engine.apply_media_verdict(conv, view.id, verdict(0.5)).await.unwrap());
    assert!(h.store.get_message(view.id).await.unwrap().is_blocked());
}

#[tokio::test]
async fn mark_read_clears_unread_and_is_idempotent() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let mut ca = h.connect(&a).await;
    let cb = h.connect(&b).await;
    let conv = h.direct(&ca, &b).await;
    for body in ["one", "two", "three"] {
        h.engine.send_message(&ca.caller, text(conv, body)).await.unwrap();
    }
    assert_eq!(h.store.unread_count(conv, b.id).await.unwrap(), 3);
    ca.events();

    let read = h.engine.mark_read(&cb.caller, conv).await.unwrap();
    assert_eq!(read.len(), 3);
    assert_eq!(h.store.unread_count(conv, b.id).await.unwrap(), 0);
    assert!(ca.events().iter().any(|e| matches!(
        e,
        ServerEvent::MessagesRead { user_id, message_ids, .. }
            if *user_id == b.id && message_ids.len() == 3
    )));

    let before = h.store.list_recent_messages(conv, 50, None).await.unwrap();
    assert!(h.engine.mark_read(&cb.caller, conv).await.unwrap().is_empty());
    let after = h.store.list_recent_messages(conv, 50, None).await.unwrap();
    assert_eq!(before, after);
    assert!(ca.events().is_empty());
}

#[tokio::test]
async fn history_pages_backwards_through_cache_and_store() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let ca = h.connect(&a).await;
    let cb = h.connect(&b).await;
    let conv = h.direct(&ca, &b).await;
    let mut sent = Vec::new();
    for i in 0..5 {
        let view = h
            .engine
            .send_message(&ca.caller, text(conv, &format!("m{i}")))
            .await
            .unwrap();
        sent.push(view.id);
    }

    let (page, has_more) = h.engine.messages(&cb.caller, conv, Some(2), None).await.unwrap();
    assert!(has_more);
    assert_eq!(page.iter().map(|m| m.id).collect::<Vec<_>>(), sent[3..]);
    // Fetching history marked everything read.
    assert!(page.iter().all(|m| m.read_by.iter().any(|r| r.user_id == b.id)));

    let (page, has_more) = h.engine.messages(&cb.caller, conv, Some(10), None).await.unwrap();
    assert!(!has_more);
    assert_eq!(page.len(), 5);

    let (older, has_more) = h
        .engine
        .messages(&cb.caller, conv, Some(10), Some(sent[3]))
        .await
        .unwrap();
    assert!(!has_more);
    assert_eq!(older.iter().map(|m| m.id).collect::<Vec<_>>(), sent[..3]);
}

#[tokio::test]
async fn edit_and_delete_follow_ownership() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let ca = h.connect(&a).await;
    let mut cb = h.connect(&b).await;
    let conv = h.direct(&ca, &b).await;
    let view = h.engine.send_message(&ca.caller, text(conv, "draft")).await.unwrap();
    cb.events();

    assert!(matches!(
        h.engine.edit_message(&cb.caller, conv, view.id, "mine now".into()).await,
        Err(ServerError::Authorization(_))
    ));

    h.moderation.push_text(Ok(flagged("violence", 0.97)));
    assert!(matches!(
        h.engine.edit_message(&ca.caller, conv, view.id, "threat".into()).await,
        Err(ServerError::ModerationBlocked { .. })
    ));
    assert_eq!(
        h.store.get_message(view.id).await.unwrap().content.as_deref(),
        Some("draft")
    );

    let edited = h
        .engine
        .edit_message(&ca.caller, conv, view.id, "final".into())
        .await
        .unwrap();
    assert_eq!(edited.content.as_deref(), Some("final"));
    assert_eq!(edited.security_status, SecurityStatus::Passed);

    assert!(matches!(
        h.engine.delete_message(&cb.caller, conv, view.id).await,
        Err(ServerError::Authorization(_))
    ));
    h.engine.delete_message(&ca.caller, conv, view.id).await.unwrap();
    h.engine.delete_message(&ca.caller, conv, view.id).await.unwrap();

    let events = cb.events();
    assert!(events.iter().any(|e| matches!(e, ServerEvent::MessageUpdated { .. })));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::MessageDeleted { .. }))
            .count(),
        1
    );

    let (feed, _) = h.engine.messages(&cb.caller, conv, None, None).await.unwrap();
    assert_eq!(feed[0].status, MessageStatus::Deleted);
    assert!(feed[0].content.is_none());
}

#[tokio::test]
async fn typing_expires_without_stop() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let ca = h.connect(&a).await;
    let mut cb = h.connect(&b).await;
    let conv = h.direct(&ca, &b).await;
    cb.events();

    h.engine.typing_start(&ca.caller, conv).await.unwrap();
    h.engine.typing_start(&ca.caller, conv).await.unwrap();
    let typing = cb
        .events()
        .into_iter()
        .filter(|e| matches!(e, ServerEvent::UserTyping { .. }))
        .count();
    assert_eq!(typing, 1);

    assert_eq!(h.engine.sweep_typing(Instant::now() + Duration::from_secs(1)), 0);
    assert_eq!(h.engine.sweep_typing(Instant::now() + Duration::from_secs(6)), 1);
    assert!(cb.events().iter().any(|e| matches!(
        e,
        ServerEvent::UserTypingStopped { user_id, .. } if *user_id == a.id
    )));

    // Sending a message ends typing too.
    h.engine.typing_start(&ca.caller, conv).await.unwrap();
    h.engine.send_message(&ca.caller, text(conv, "done")).await.unwrap();
    assert!(cb
        .events()
        .iter()
        .any(|e| matches!(e, ServerEvent::UserTypingStopped { .. })));
    assert_eq!(h.engine.sweep_typing(Instant::now() + Duration::from_secs(60)), 0);
}

#[tokio::test]
async fn reaction_round_trip_leaves_nothing() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let ca = h.connect(&a).await;
    let mut cb = h.connect(&b).await;
    let conv = h.direct(&ca, &b).await;
    let view = h.engine.send_message(&ca.caller, text(conv, "rent paid")).await.unwrap();
    cb.events();

    h.engine.add_reaction(&cb.caller, conv, view.id, "👍").await.unwrap();
    h.engine.add_reaction(&cb.caller, conv, view.id, "👍").await.unwrap();
    let (feed, _) = h.engine.messages(&ca.caller, conv, None, None).await.unwrap();
    assert_eq!(feed[0].reactions.len(), 1);
    assert_eq!(feed[0].reactions[0].count, 1);

    h.engine.remove_reaction(&cb.caller, conv, view.id, "👍").await.unwrap();
    assert!(h.store.list_reactions(&[view.id]).await.unwrap().is_empty());

    let events = cb.events();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ServerEvent::ReactionAdded { .. }))
            .count(),
        1
    );
    assert!(events.iter().any(|e| matches!(e, ServerEvent::ReactionRemoved { .. })));
}

#[tokio::test]
async fn last_admin_leaving_promotes_earliest_member() {
    let h = Harness::new().await;
    let (a, b, c) = (h.user("alice").await, h.user("bob").await, h.user("carol").await);
    let mut ca = h.connect(&a).await;
    let mut cb = h.connect(&b).await;
    let cc = h.connect(&c).await;
    let conv = h.group(&ca, &[&b, &c]).await;
    cb.events();

    h.engine.leave_conversation(&ca.caller, conv).await.unwrap();
    let heir = h.store.get_participant(conv, b.id).await.unwrap().unwrap();
    assert_eq!(heir.role, ParticipantRole::Admin);
    assert!(cb.events().iter().any(|e| matches!(
        e,
        ServerEvent::ParticipantLeft { user_id, .. } if *user_id == a.id
    )));

    ca.events();
    h.engine.send_message(&cc.caller, text(conv, "still here")).await.unwrap();
    assert!(ca.events().is_empty());
    assert!(matches!(
        h.engine.messages(&ca.caller, conv, None, None).await,
        Err(ServerError::Authorization(_))
    ));

    let direct = h.direct(&cb, &c).await;
    assert!(matches!(
        h.engine.leave_conversation(&cb.caller, direct).await,
        Err(ServerError::Validation(_))
    ));
}

#[tokio::test]
async fn removed_participant_is_told_and_unsubscribed() {
    let h = Harness::new().await;
    let (a, b, c) = (h.user("alice").await, h.user("bob").await, h.user("carol").await);
    let ca = h.connect(&a).await;
    let mut cb = h.connect(&b).await;
    let conv = h.group(&ca, &[&b, &c]).await;

    h.engine.remove_participant(&ca.caller, conv, b.id).await.unwrap();
    assert!(cb.events().iter().any(|e| matches!(
        e,
        ServerEvent::RemovedFromConversation { conversation_id } if *conversation_id == conv
    )));
    h.engine.send_message(&ca.caller, text(conv, "bye")).await.unwrap();
    assert!(cb.events().is_empty());
    assert!(matches!(
        h.engine.remove_participant(&ca.caller, conv, b.id).await,
        Err(ServerError::NotFound(_))
    ));
}

#[tokio::test]
async fn settings_updates_need_capability() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let ca = h.connect(&a).await;
    let mut cb = h.connect(&b).await;
    let conv = h.group(&ca, &[&b]).await;
    cb.events();

    let rename = ConversationUpdate {
        title: Some("Flat 4C".into()),
        ..Default::default()
    };
    assert!(matches!(
        h.engine.update_conversation(&cb.caller, conv, rename.clone()).await,
        Err(ServerError::Authorization(_))
    ));

    let updated = h.engine.update_conversation(&ca.caller, conv, rename).await.unwrap();
    assert_eq!(updated.title.as_deref(), Some("Flat 4C"));
    let events = cb.events();
    assert!(events.iter().any(|e| matches!(e, ServerEvent::ConversationUpdated { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::NewMessage { message } if message.kind == MessageKind::System
    )));

    assert!(matches!(
        h.engine
            .update_conversation(&ca.caller, conv, ConversationUpdate::default())
            .await,
        Err(ServerError::Validation(_))
    ));
}

#[tokio::test]
async fn group_creation_reaches_connected_invitees() {
    let h = Harness::new().await;
    let (a, b, c) = (h.user("alice").await, h.user("bob").await, h.user("carol").await);
    let ca = h.connect(&a).await;
    let mut cb = h.connect(&b).await;
    cb.events();

    let summary = h
        .engine
        .create_conversation(&ca.caller, create(ConversationKind::Group, &[&b, &c]))
        .await
        .unwrap();
    assert_eq!(summary.participants.len(), 3);
    assert_eq!(
        summary.last_message.as_ref().map(|m| m.kind),
        Some(MessageKind::System)
    );
    assert!(cb.events().iter().any(|e| matches!(
        e,
        ServerEvent::ConversationCreated { conversation } if conversation.unread_count == 1
    )));

    let untitled = CreateConversation {
        title: None,
        ..create(ConversationKind::Group, &[&b])
    };
    assert!(matches!(
        h.engine.create_conversation(&ca.caller, untitled).await,
        Err(ServerError::Validation(_))
    ));
}

#[tokio::test]
async fn offline_participants_get_push_notifications() {
    let h = Harness::new().await;
    let (a, b, c) = (h.user("alice").await, h.user("bob").await, h.user("carol").await);
    let ca = h.connect(&a).await;
    let _cb = h.connect(&b).await;
    let conv = h.group(&ca, &[&b, &c]).await;

    h.engine.send_message(&ca.caller, text(conv, "viewing at 5")).await.unwrap();
    let notifier = h.notifier.clone();
    h.eventually(|| !notifier.sent.lock().is_empty()).await;

    let sent = h.notifier.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, vec![c.id]);
    assert_eq!(sent[0].1.preview, "viewing at 5");
}

#[tokio::test]
async fn disconnect_goes_offline_and_stops_typing() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let ca = h.connect(&a).await;
    let mut cb = h.connect(&b).await;
    let conv = h.direct(&ca, &b).await;
    h.engine.typing_start(&ca.caller, conv).await.unwrap();
    cb.events();

    // A superseded connection closing leaves the user online.
    let newer = h.connect(&a).await;
    assert_eq!(h.engine.hub().connections_of(a.id), vec![newer.caller.connection]);
    h.engine.disconnect(ca.caller.connection, Some(a.id)).await;
    assert!(h.engine.presence().is_online(a.id));

    h.engine.disconnect(newer.caller.connection, Some(a.id)).await;
    assert!(!h.engine.presence().is_online(a.id));
    let events = cb.events();
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::UserTypingStopped { user_id, .. } if *user_id == a.id
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        ServerEvent::PresenceChanged { presence }
            if presence.user_id == a.id && presence.status == PresenceStatus::Offline
    )));
}

#[tokio::test]
async fn status_changes_reach_contacts() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let ca = h.connect(&a).await;
    let mut cb = h.connect(&b).await;
    h.direct(&ca, &b).await;
    cb.events();

    h.engine
        .set_status(&ca.caller, PresenceStatus::Busy, Some("at a viewing".into()))
        .await
        .unwrap();
    assert!(cb.events().iter().any(|e| matches!(
        e,
        ServerEvent::PresenceChanged { presence }
            if presence.status == PresenceStatus::Busy
                && presence.custom_status.as_deref() == Some("at a viewing")
    )));

    assert!(matches!(
        h.engine.set_status(&ca.caller, PresenceStatus::Offline, None).await,
        Err(ServerError::Validation(_))
    ));
    assert!(matches!(
        h.engine
            .set_status(&ca.caller, PresenceStatus::Away, Some("x".repeat(101)))
            .await,
        Err(ServerError::Validation(_))
    ));
}

#[tokio::test]
async fn bad_credentials_are_refused() {
    let h = Harness::new().await;
    let a = h.user("alice").await;
    let connection = ConnectionId::new();
    let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE);
    h.engine.hub().register(connection, tx);

    let outcome = h.engine.connect(connection, a.id, "wrong").await;
    assert!(matches!(outcome, Err(ServerError::Authentication(_))));
    assert!(!h.engine.presence().is_online(a.id));
}

#[tokio::test]
async fn reconnect_evicts_the_older_connection() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let mut old = h.connect(&a).await;
    let cb = h.connect(&b).await;
    let conv = h.direct(&cb, &a).await;
    old.events();

    let mut newer = h.connect(&a).await;
    assert!(matches!(
        old.events().first(),
        Some(ServerEvent::AuthenticationError { reason }) if reason.contains("another connection")
    ));
    assert!(old.evicted.try_recv().is_ok());
    assert_eq!(h.engine.hub().connections_of(a.id), vec![newer.caller.connection]);

    h.engine.send_message(&cb.caller, text(conv, "still there?")).await.unwrap();
    assert!(old.events().is_empty());
    assert!(newer
        .events()
        .iter()
        .any(|e| matches!(e, ServerEvent::NewMessage { .. })));

    // The evicted session's own teardown arrives late and changes nothing.
    h.engine.disconnect(old.caller.connection, Some(a.id)).await;
    assert!(h.engine.presence().is_online(a.id));

    h.engine.disconnect(newer.caller.connection, Some(a.id)).await;
    assert!(!h.engine.presence().is_online(a.id));
    assert!(h.engine.hub().connections_of(a.id).is_empty());
}

#[tokio::test]
async fn failed_connect_leaves_no_subscription() {
    let h = Harness::new().await;
    let (a, b) = (h.user("alice").await, h.user("bob").await);
    let ca = h.connect(&a).await;
    let conv = h.direct(&ca, &b).await;

    // Summaries count unread messages against the receipts table.
    drop_table(&h.store, "read_receipts");

    let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE);
    let connection = ConnectionId::new();
    let _evicted = h.engine.hub().register(connection, tx);
    let outcome = h.engine.connect(connection, b.id, "bob-token").await;
    assert!(matches!(outcome, Err(ServerError::Store(_))));

    assert!(!h.engine.presence().is_online(b.id));
    assert!(h.engine.hub().connections_of(b.id).is_empty());
    assert!(h.engine.hub().room_members(conv).iter().all(|c| *c != connection));

    h.engine.typing_start(&ca.caller, conv).await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_senders_are_observed_in_stored_order() {
    let h = Harness::build(false, true).await;
    let (a, b, c) = (
        h.user("alice").await,
        h.user("bob").await,
        h.user("carol").await,
    );
    let ca = h.connect(&a).await;
    let cb = h.connect(&b).await;
    let mut observer = h.connect(&c).await;
    let conv = h.group(&ca, &[&b, &c]).await;
    observer.events();

    let mut sends = Vec::new();
    for i in 0..10 {
        for (sender, name) in [(&ca, "alice"), (&cb, "bob")] {
            let engine = h.engine.clone();
            let caller = sender.caller.clone();
            let body = format!("{name} {i}");
            sends.push(tokio::spawn(async move {
                engine.send_message(&caller, text(conv, &body)).await
            }));
        }
    }
    for send in sends {
        send.await.unwrap().unwrap();
    }

    let observed: Vec<_> = observer
        .events()
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::NewMessage { message } if message.conversation_id == conv => {
                Some(message.id)
            }
            _ => None,
        })
        .collect();
    let stored: Vec<_> = h
        .store
        .list_recent_messages(conv, 50, None)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.kind != MessageKind::System)
        .map(|m| m.id)
        .collect();

    assert_eq!(observed.len(), 20);
    assert_eq!(observed, stored);
}
