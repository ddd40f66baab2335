use chrono::Utc;
use tokio::time::Instant;
use tracing::debug;

use hearth_shared::constants::{MAX_CUSTOM_STATUS_LENGTH, MAX_REACTION_LENGTH};
use hearth_shared::models::Reaction;
use hearth_shared::protocol::ServerEvent;
use hearth_shared::types::{ConversationId, MessageId, PresenceStatus};

use super::{Caller, MessagingEngine};
use crate::error::ServerError;
use crate::render;

fn validate_reaction(reaction: &str) -> Result<&str, ServerError> {
    let reaction = reaction.trim();
    if reaction.is_empty() {
        return Err(ServerError::Validation("reaction is empty".into()));
    }
    if reaction.chars().count() > MAX_REACTION_LENGTH {
        return Err(ServerError::Validation(format!(
            "reaction exceeds {MAX_REACTION_LENGTH} characters"
        )));
    }
    Ok(reaction)
}

impl MessagingEngine {
    // ------------------------------------------------------------------
    // Typing
    // ------------------------------------------------------------------

    /// Only the idle to typing transition is broadcast; repeats just keep
    /// the entry alive.
    pub async fn typing_start(
        &self,
        caller: &Caller,
        conversation_id: ConversationId,
    ) -> Result<(), ServerError> {
        self.inner
            .directory
            .active_participant(conversation_id, caller.id())
            .await?;
        if self
            .inner
            .typing
            .start(conversation_id, caller.id(), Instant::now())
        {
            self.broadcast(
                conversation_id,
                ServerEvent::UserTyping {
                    conversation_id,
                    user_id: caller.id(),
                    display_name: caller.user.display_name.clone(),
                },
                Some(caller.connection),
            );
        }
        Ok(())
    }

    pub async fn typing_stop(
        &self,
        caller: &Caller,
        conversation_id: ConversationId,
    ) -> Result<(), ServerError> {
        self.inner
            .directory
            .active_participant(conversation_id, caller.id())
            .await?;
        if self.inner.typing.stop(conversation_id, caller.id()) {
            self.broadcast(
                conversation_id,
                ServerEvent::UserTypingStopped {
                    conversation_id,
                    user_id: caller.id(),
                },
                Some(caller.connection),
            );
        }
        Ok(())
    }

    /// Expire stale typing entries. Returns how many were dropped.
    pub fn sweep_typing(&self, now: Instant) -> usize {
        let expired = self.inner.typing.sweep(now);
        for (conversation_id, user_id) in &expired {
            self.broadcast(
                *conversation_id,
                ServerEvent::UserTypingStopped {
                    conversation_id: *conversation_id,
                    user_id: *user_id,
                },
                None,
            );
        }
        if !expired.is_empty() {
            debug!(expired = expired.len(), "Typing indicators expired");
        }
        expired.len()
    }

    // ------------------------------------------------------------------
    // Read receipts
    // ------------------------------------------------------------------

    /// Record the caller as a reader of everything others sent. The room
    /// hears about it only when at least one message changed.
    pub async fn mark_read(
        &self,
        caller: &Caller,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessageId>, ServerError> {
        self.inner
            .directory
            .active_participant(conversation_id, caller.id())
            .await?;

        let read_at = Utc::now();
        let message_ids = self
            .inner
            .store
            .mark_conversation_read(conversation_id, caller.id(), read_at)
            .await?;
        if message_ids.is_empty() {
            return Ok(message_ids);
        }

        self.inner
            .cache
            .apply_receipts(conversation_id, caller.id(), &message_ids, read_at);
        self.broadcast(
            conversation_id,
            ServerEvent::MessagesRead {
                conversation_id,
                user_id: caller.id(),
                read_at,
                message_ids: message_ids.clone(),
            },
            None,
        );
        Ok(message_ids)
    }

    // ------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------

    pub async fn add_reaction(
        &self,
        caller: &Caller,
        conversation_id: ConversationId,
        message_id: MessageId,
        reaction: &str,
    ) -> Result<(), ServerError> {
        let reaction = validate_reaction(reaction)?;
        self.inner
            .directory
            .active_participant(conversation_id, caller.id())
            .await?;

        let message = self.message_in(conversation_id, message_id).await?;
        if !render::visible_to(&message, caller.id()) {
            return Err(ServerError::NotFound("message not found".into()));
        }
        if message.is_deleted() {
            return Err(ServerError::Validation("message was deleted".into()));
        }

        let added = self
            .inner
            .store
            .add_reaction(&Reaction {
                message_id,
                user_id: caller.id(),
                reaction: reaction.to_string(),
                created_at: Utc::now(),
            })
            .await?;
        if added {
            self.broadcast(
                conversation_id,
                ServerEvent::ReactionAdded {
                    conversation_id,
                    message_id,
                    user_id: caller.id(),
                    reaction: reaction.to_string(),
                },
                None,
            );
        }
        Ok(())
    }

    pub async fn remove_reaction(
        &self,
        caller: &Caller,
        conversation_id: ConversationId,
        message_id: MessageId,
        reaction: &str,
    ) -> Result<(), ServerError> {
        let reaction = validate_reaction(reaction)?;
        self.inner
            .directory
            .active_participant(conversation_id, caller.id())
            .await?;
        self.message_in(conversation_id, message_id).await?;

        if self
            .inner
            .store
            .remove_reaction(message_id, caller.id(), reaction)
            .await?
        {
            self.broadcast(
                conversation_id,
                ServerEvent::ReactionRemoved {
                    conversation_id,
                    message_id,
                    user_id: caller.id(),
                    reaction: reaction.to_string(),
                },
                None,
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Set an explicit status. `offline` is derived from connections and
    /// cannot be chosen.
    pub async fn set_status(
        &self,
        caller: &Caller,
        status: PresenceStatus,
        custom_status: Option<String>,
    ) -> Result<(), ServerError> {
        if status == PresenceStatus::Offline {
            return Err(ServerError::Validation(
                "offline cannot be set explicitly".into(),
            ));
        }
        let custom_status = custom_status
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(custom) = &custom_status {
            if custom.chars().count() > MAX_CUSTOM_STATUS_LENGTH {
                return Err(ServerError::Validation(format!(
                    "custom status exceeds {MAX_CUSTOM_STATUS_LENGTH} characters"
                )));
            }
        }

        let view = self
            .inner
            .presence
            .set_status(caller.id(), status, custom_status, Utc::now())
            .ok_or_else(|| ServerError::Authentication("connection is no longer live".into()))?;
        self.broadcast_presence(view, true).await;
        Ok(())
    }
}
