//! Conversation and participant lookups with permission checks.
//!
//! Every privileged operation goes through here; membership is read from
//! the store on each call, never from connection state.

use std::collections::HashSet;
use std::sync::Arc;

use hearth_shared::models::{Conversation, Participant};
use hearth_shared::types::{Capability, ConversationId, UserId};

use crate::error::ServerError;
use crate::store::Store;

#[derive(Clone)]
pub struct ConversationDirectory {
    store: Arc<dyn Store>,
}

impl ConversationDirectory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The caller's active membership. Unknown conversations and former
    /// members get the same answer.
    pub async fn active_participant(
        &self,
        conversation: ConversationId,
        user: UserId,
    ) -> Result<Participant, ServerError> {
        match self.store.get_participant(conversation, user).await? {
            Some(p) if p.is_active() => Ok(p),
            _ => Err(ServerError::Authorization(
                "not a participant of this conversation".into(),
            )),
        }
    }

    /// Membership plus the conversation itself.
    pub async fn member_view(
        &self,
        conversation: ConversationId,
        user: UserId,
    ) -> Result<(Conversation, Participant), ServerError> {
        let participant = self.active_participant(conversation, user).await?;
        let conversation = self.store.get_conversation(conversation).await?;
        Ok((conversation, participant))
    }

    /// Membership with `capability`.
    pub async fn require(
        &self,
        conversation: ConversationId,
        user: UserId,
        capability: Capability,
    ) -> Result<(Conversation, Participant), ServerError> {
        let (conversation, participant) = self.member_view(conversation, user).await?;
        if !participant.permissions.allows(capability) {
            return Err(ServerError::Authorization(format!(
                "missing capability {capability}"
            )));
        }
        Ok((conversation, participant))
    }

    /// Like [`require`](Self::require), restricted to group conversations.
    pub async fn require_group(
        &self,
        conversation: ConversationId,
        user: UserId,
        capability: Option<Capability>,
    ) -> Result<(Conversation, Participant), ServerError> {
        let (conversation, participant) = match capability {
            Some(capability) => self.require(conversation, user, capability).await?,
            None => self.member_view(conversation, user).await?,
        };
        if conversation.is_direct() {
            return Err(ServerError::Validation(
                "direct conversations cannot be changed".into(),
            ));
        }
        Ok((conversation, participant))
    }

    /// Active participants, earliest joiner first.
    pub async fn active_participants(
        &self,
        conversation: ConversationId,
    ) -> Result<Vec<Participant>, ServerError> {
        Ok(self
            .store
            .list_participants(conversation)
            .await?
            .into_iter()
            .filter(Participant::is_active)
            .collect())
    }

    pub async fn conversations_for(&self, user: UserId) -> Result<Vec<Conversation>, ServerError> {
        Ok(self.store.list_conversations_for_user(user).await?)
    }

    /// Everyone sharing at least one active conversation with `user`,
    /// excluding `user`.
    pub async fn co_participants(&self, user: UserId) -> Result<HashSet<UserId>, ServerError> {
        let mut users = HashSet::new();
        for conversation in self.conversations_for(user).await? {
            for p in self.active_participants(conversation.id).await? {
                if p.user_id != user {
                    users.insert(p.user_id);
                }
            }
        }
        Ok(users)
    }
}
