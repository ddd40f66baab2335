//! The messaging engine: every client operation, orchestrated over the
//! store, the live-state services and the external collaborators.
//!
//! Writes that must be seen in acceptance order (new messages, system
//! notices, verdict changes) run under a per-conversation lock, and their
//! broadcasts are enqueued before the lock is released.

mod activity;
mod connections;
mod conversations;
mod messages;

#[cfg(test)]
pub(crate) mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use hearth_shared::models::{Conversation, Message, UserProfile};
use hearth_shared::protocol::{ConversationSummary, MessageView, PresenceView, ServerEvent};
use hearth_shared::types::{ConnectionId, ConversationId, MessageId, UserId};

use crate::cache::MessageCache;
use crate::directory::ConversationDirectory;
use crate::error::ServerError;
use crate::hub::Hub;
use crate::locks::KeyedLocks;
use crate::media::MediaStorage;
use crate::moderation::ModerationGateway;
use crate::notifier::Notifier;
use crate::presence::PresenceRegistry;
use crate::render;
use crate::store::Store;
use crate::typing::TypingTracker;

pub use conversations::CreateConversation;
pub use messages::SendMessage;

/// The authenticated side of a connection.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user: UserProfile,
    pub connection: ConnectionId,
}

impl Caller {
    pub fn id(&self) -> UserId {
        self.user.id
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_media_size: usize,
    pub default_moderation_enabled: bool,
    pub default_ai_scan_enabled: bool,
    pub media_scan_delay: Duration,
}

/// Collaborators and live-state services handed to the engine.
pub struct EngineParts {
    pub store: Arc<dyn Store>,
    pub moderation: ModerationGateway,
    pub media: Arc<dyn MediaStorage>,
    pub notifier: Arc<dyn Notifier>,
    pub presence: Arc<PresenceRegistry>,
    pub typing: Arc<TypingTracker>,
    pub cache: Arc<MessageCache>,
    pub hub: Arc<Hub>,
    pub settings: EngineSettings,
}

struct Inner {
    store: Arc<dyn Store>,
    directory: ConversationDirectory,
    moderation: ModerationGateway,
    media: Arc<dyn MediaStorage>,
    notifier: Arc<dyn Notifier>,
    presence: Arc<PresenceRegistry>,
    typing: Arc<TypingTracker>,
    cache: Arc<MessageCache>,
    hub: Arc<Hub>,
    conversation_locks: KeyedLocks<ConversationId>,
    pair_locks: KeyedLocks<(UserId, UserId)>,
    settings: EngineSettings,
}

/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct MessagingEngine {
    inner: Arc<Inner>,
}

impl MessagingEngine {
    pub fn new(parts: EngineParts) -> Self {
        let directory = ConversationDirectory::new(parts.store.clone());
        Self {
            inner: Arc::new(Inner {
                store: parts.store,
                directory,
                moderation: parts.moderation,
                media: parts.media,
                notifier: parts.notifier,
                presence: parts.presence,
                typing: parts.typing,
                cache: parts.cache,
                hub: parts.hub,
                conversation_locks: KeyedLocks::new(),
                pair_locks: KeyedLocks::new(),
                settings: parts.settings,
            }),
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.inner.presence
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn media(&self) -> &Arc<dyn MediaStorage> {
        &self.inner.media
    }

    /// Drop idle ordering locks. Returns how many were removed.
    pub fn prune_locks(&self) -> usize {
        self.inner.conversation_locks.prune() + self.inner.pair_locks.prune()
    }

    // ------------------------------------------------------------------
    // Rendering helpers
    // ------------------------------------------------------------------

    async fn profiles(
        &self,
        ids: impl IntoIterator<Item = UserId>,
    ) -> Result<HashMap<UserId, UserProfile>, ServerError> {
        let mut ids: Vec<UserId> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        Ok(self.inner.store.get_users(&ids).await?)
    }

    /// Render messages with sender profiles and reactions.
    async fn render_messages(&self, messages: &[Message]) -> Result<Vec<MessageView>, ServerError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let users = self.profiles(messages.iter().map(|m| m.sender_id)).await?;
        let ids: Vec<MessageId> = messages.iter().map(|m| m.id).collect();
        let reactions = self.inner.store.list_reactions(&ids).await?;

        Ok(messages
            .iter()
            .map(|m| {
                let reactions = reactions.get(&m.id).map(Vec::as_slice).unwrap_or_default();
                render::message_view(m, &users, reactions)
            })
            .collect())
    }

    async fn render_message(&self, message: &Message) -> Result<MessageView, ServerError> {
        self.render_messages(std::slice::from_ref(message))
            .await?
            .pop()
            .ok_or_else(|| ServerError::Internal("rendering produced no view".into()))
    }

    /// A conversation as seen by `viewer`.
    async fn summary(
        &self,
        conversation: Conversation,
        viewer: UserId,
    ) -> Result<ConversationSummary, ServerError> {
        let participants = self.inner.directory.active_participants(conversation.id).await?;
        let users = self.profiles(participants.iter().map(|p| p.user_id)).await?;
        let participants = participants
            .iter()
            .map(|p| render::participant_view(p, &users, self.inner.presence.is_online(p.user_id)))
            .collect();

        let last_message = match self.inner.store.last_message(conversation.id).await? {
            Some(m) => Some(self.render_message(&m).await?),
            None => None,
        };
        let unread_count = self.inner.store.unread_count(conversation.id, viewer).await?;

        Ok(ConversationSummary {
            conversation,
            participants,
            last_message,
            unread_count,
        })
    }

    /// Summaries of every active conversation of `user`, most recent
    /// activity first.
    pub async fn conversations(&self, user: UserId) -> Result<Vec<ConversationSummary>, ServerError> {
        let conversations = self.inner.directory.conversations_for(user).await?;
        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            summaries.push(self.summary(conversation, user).await?);
        }
        Ok(summaries)
    }

    // ------------------------------------------------------------------
    // Delivery helpers
    // ------------------------------------------------------------------

    fn broadcast(&self, conversation: ConversationId, event: ServerEvent, exclude: Option<ConnectionId>) {
        self.inner.hub.broadcast(conversation, event, exclude);
    }

    /// Send a presence change to everyone sharing a conversation with the
    /// user, and to the user's own connections when `include_self`.
    async fn broadcast_presence(&self, view: PresenceView, include_self: bool) {
        let user = view.user_id;
        let recipients = match self.inner.directory.co_participants(user).await {
            Ok(users) => users,
            Err(e) => {
                warn!(user = %user, error = %e, "Could not resolve presence audience");
                return;
            }
        };

        let event = ServerEvent::PresenceChanged { presence: view };
        for recipient in recipients {
            self.inner.hub.send_to_user(recipient, event.clone());
        }
        if include_self {
            self.inner.hub.send_to_user(user, event);
        }
    }

    /// Persist-free part of accepting a system notice: cache and fan out.
    /// Call with the conversation lock held, after the notice is stored.
    fn publish_notice(&self, notice: &Message, author: &UserProfile) {
        self.inner.cache.push(notice);
        let users = HashMap::from([(author.id, author.clone())]);
        let view = render::message_view(notice, &users, &[]);
        self.broadcast(
            notice.conversation_id,
            ServerEvent::NewMessage { message: view },
            None,
        );
    }

    /// Advance `last_message_at`. The message is already delivered, so a
    /// failure here is only logged.
    async fn touch(&self, conversation: ConversationId, at: DateTime<Utc>) {
        if let Err(e) = self.inner.store.touch_conversation(conversation, at).await {
            warn!(conversation = %conversation, error = %e, "Failed to update last activity");
        }
    }
}
