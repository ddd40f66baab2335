use std::collections::HashSet;

use chrono::Utc;
use tracing::info;

use hearth_shared::constants::{MAX_DESCRIPTION_LENGTH, MAX_GROUP_PARTICIPANTS, MAX_TITLE_LENGTH};
use hearth_shared::models::{Conversation, ConversationUpdate, Message, Participant, UserProfile};
use hearth_shared::protocol::{ConversationSummary, ParticipantView, ServerEvent};
use hearth_shared::types::{Capability, ConversationId, ConversationKind, ParticipantRole, UserId};
use hearth_store::StoreError;

use super::{Caller, MessagingEngine};
use crate::error::ServerError;
use crate::render;

/// A `create_conversation` request.
#[derive(Debug, Clone)]
pub struct CreateConversation {
    pub kind: ConversationKind,
    pub participant_ids: Vec<UserId>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub is_public: Option<bool>,
    pub is_encrypted: Option<bool>,
}

fn validate_title(title: &str) -> Result<(), ServerError> {
    if title.trim().is_empty() {
        return Err(ServerError::Validation("group title is empty".into()));
    }
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err(ServerError::Validation(format!(
            "group title exceeds {MAX_TITLE_LENGTH} characters"
        )));
    }
    Ok(())
}

fn validate_description(description: &str) -> Result<(), ServerError> {
    if description.chars().count() > MAX_DESCRIPTION_LENGTH {
        return Err(ServerError::Validation(format!(
            "description exceeds {MAX_DESCRIPTION_LENGTH} characters"
        )));
    }
    Ok(())
}

/// Requested members minus the caller, deduplicated, first mention first.
fn invitees(requested: &[UserId], caller: UserId) -> Vec<UserId> {
    let mut seen = HashSet::new();
    requested
        .iter()
        .copied()
        .filter(|u| *u != caller && seen.insert(*u))
        .collect()
}

fn join_names(users: &[&UserProfile]) -> String {
    users
        .iter()
        .map(|u| u.display_name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl MessagingEngine {
    /// Create a direct or group conversation.
    ///
    /// A direct conversation between the same two users is reused rather
    /// than duplicated; the existing one is returned without events.
    pub async fn create_conversation(
        &self,
        caller: &Caller,
        request: CreateConversation,
    ) -> Result<ConversationSummary, ServerError> {
        let others = invitees(&request.participant_ids, caller.id());
        match request.kind {
            ConversationKind::Direct => self.create_direct(caller, &others, request).await,
            ConversationKind::Group => self.create_group(caller, &others, request).await,
        }
    }

    async fn create_direct(
        &self,
        caller: &Caller,
        others: &[UserId],
        request: CreateConversation,
    ) -> Result<ConversationSummary, ServerError> {
        let [other] = others else {
            return Err(ServerError::Validation(
                "a direct conversation needs exactly one other user".into(),
            ));
        };
        let other = *other;
        match self.inner.store.get_user(other).await {
            Ok(_) => {}
            Err(StoreError::NotFound) => return Err(ServerError::Validation("unknown user".into())),
            Err(e) => return Err(e.into()),
        }

        let pair = if caller.id() < other {
            (caller.id(), other)
        } else {
            (other, caller.id())
        };
        let _pair_guard = self.inner.pair_locks.lock(pair).await;

        if let Some(existing) = self
            .inner
            .store
            .find_direct_conversation(caller.id(), other)
            .await?
        {
            self.inner.hub.join(existing.id, caller.connection);
            return self.summary(existing, caller.id()).await;
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::new(),
            kind: ConversationKind::Direct,
            title: None,
            description: None,
            avatar_url: None,
            is_public: false,
            is_encrypted: request.is_encrypted.unwrap_or(false),
            moderation_enabled: self.inner.settings.default_moderation_enabled,
            ai_scan_enabled: self.inner.settings.default_ai_scan_enabled,
            created_by: caller.id(),
            created_at: now,
            updated_at: now,
            last_message_at: None,
        };
        let participants = [
            Participant::admin(conversation.id, caller.id(), now),
            Participant::member(conversation.id, other, now),
        ];
        self.inner
            .store
            .insert_conversation(&conversation, &participants, None)
            .await?;
        self.inner.cache.prime(conversation.id, Vec::new(), true);

        self.announce_conversation(caller, &conversation, &[other]).await
    }

    async fn create_group(
        &self,
        caller: &Caller,
        others: &[UserId],
        request: CreateConversation,
    ) -> Result<ConversationSummary, ServerError> {
        let title = request
            .title
            .as_deref()
            .map(str::trim)
            .ok_or_else(|| ServerError::Validation("a group needs a title".into()))?;
        validate_title(title)?;
        if let Some(description) = &request.description {
            validate_description(description)?;
        }
        if others.is_empty() {
            return Err(ServerError::Validation(
                "a group needs at least one other participant".into(),
            ));
        }
        if others.len() + 1 > MAX_GROUP_PARTICIPANTS {
            return Err(ServerError::Validation(format!(
                "a group holds at most {MAX_GROUP_PARTICIPANTS} participants"
            )));
        }
        let users = self.inner.store.get_users(others).await?;
        if users.len() != others.len() {
            return Err(ServerError::Validation("unknown user".into()));
        }

        let now = Utc::now();
        let conversation = Conversation {
            id: ConversationId::new(),
            kind: ConversationKind::Group,
            title: Some(title.to_string()),
            description: request.description,
            avatar_url: request.avatar_url,
            is_public: request.is_public.unwrap_or(false),
            is_encrypted: request.is_encrypted.unwrap_or(false),
            moderation_enabled: self.inner.settings.default_moderation_enabled,
            ai_scan_enabled: self.inner.settings.default_ai_scan_enabled,
            created_by: caller.id(),
            created_at: now,
            updated_at: now,
            last_message_at: Some(now),
        };

        let mut participants = vec![Participant::admin(conversation.id, caller.id(), now)];
        participants.extend(others.iter().map(|u| Participant::member(conversation.id, *u, now)));

        let opening = Message::system(
            conversation.id,
            caller.id(),
            format!("{} created the group \"{}\"", caller.user.display_name, title),
            now,
        );
        self.inner
            .store
            .insert_conversation(&conversation, &participants, Some(&opening))
            .await?;
        self.inner.cache.prime(conversation.id, vec![opening], true);

        self.announce_conversation(caller, &conversation, others).await
    }

    /// Subscribe everyone connected and send each invitee their own
    /// summary. Returns the caller's.
    async fn announce_conversation(
        &self,
        caller: &Caller,
        conversation: &Conversation,
        invitees: &[UserId],
    ) -> Result<ConversationSummary, ServerError> {
        self.inner.hub.join_user(conversation.id, caller.id());
        for user in invitees {
            if self.inner.hub.join_user(conversation.id, *user) > 0 {
                let summary = self.summary(conversation.clone(), *user).await?;
                self.inner
                    .hub
                    .send_to_user(*user, ServerEvent::ConversationCreated { conversation: summary });
            }
        }

        info!(
            conversation = %conversation.id,
            kind = %conversation.kind,
            creator = %caller.id(),
            participants = invitees.len() + 1,
            "Conversation created"
        );
        self.summary(conversation.clone(), caller.id()).await
    }

    /// Add users to a group. Users already active are skipped; when none
    /// remain the call succeeds without events.
    pub async fn add_participants(
        &self,
        caller: &Caller,
        conversation_id: ConversationId,
        user_ids: Vec<UserId>,
    ) -> Result<Vec<ParticipantView>, ServerError> {
        let (conversation, _) = self
            .inner
            .directory
            .require_group(conversation_id, caller.id(), Some(Capability::AddParticipants))
            .await?;

        let requested = invitees(&user_ids, caller.id());
        if requested.is_empty() {
            return Err(ServerError::Validation("no users to add".into()));
        }
        let users = self.inner.store.get_users(&requested).await?;
        if users.len() != requested.len() {
            return Err(ServerError::Validation("unknown user".into()));
        }

        let ordered = self.inner.conversation_locks.lock(conversation_id).await;
        let active: HashSet<UserId> = self
            .inner
            .directory
            .active_participants(conversation_id)
            .await?
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        let added: Vec<UserId> = requested.into_iter().filter(|u| !active.contains(u)).collect();
        if added.is_empty() {
            return Ok(Vec::new());
        }
        if active.len() + added.len() > MAX_GROUP_PARTICIPANTS {
            return Err(ServerError::Validation(format!(
                "a group holds at most {MAX_GROUP_PARTICIPANTS} participants"
            )));
        }

        let now = Utc::now();
        let participants: Vec<Participant> = added
            .iter()
            .map(|u| Participant::member(conversation_id, *u, now))
            .collect();
        let names: Vec<&UserProfile> = added.iter().filter_map(|u| users.get(u)).collect();
        let notice = Message::system(
            conversation_id,
            caller.id(),
            format!("{} added {}", caller.user.display_name, join_names(&names)),
            now,
        );
        self.inner
            .store
            .insert_participants(&participants, Some(&notice))
            .await?;

        // New members learn about the conversation before its events reach them.
        let conversation = Conversation {
            last_message_at: Some(now),
            ..conversation
        };
        for user in &added {
            if self.inner.hub.join_user(conversation_id, *user) > 0 {
                let summary = self.summary(conversation.clone(), *user).await?;
                self.inner
                    .hub
                    .send_to_user(*user, ServerEvent::ConversationCreated { conversation: summary });
            }
        }

        self.publish_notice(&notice, &caller.user);
        let views: Vec<ParticipantView> = participants
            .iter()
            .map(|p| render::participant_view(p, &users, self.inner.presence.is_online(p.user_id)))
            .collect();
        self.broadcast(
            conversation_id,
            ServerEvent::ParticipantsAdded {
                conversation_id,
                participants: views.clone(),
            },
            None,
        );
        drop(ordered);

        self.touch(conversation_id, now).await;
        info!(conversation = %conversation_id, added = added.len(), "Participants added");
        Ok(views)
    }

    /// Remove another participant from a group.
    pub async fn remove_participant(
        &self,
        caller: &Caller,
        conversation_id: ConversationId,
        target: UserId,
    ) -> Result<(), ServerError> {
        self.inner
            .directory
            .require_group(conversation_id, caller.id(), Some(Capability::RemoveParticipants))
            .await?;
        if target == caller.id() {
            return Err(ServerError::Validation(
                "use leave_conversation to leave".into(),
            ));
        }
        let target_profile = self.inner.store.get_user(target).await?;

        let now = Utc::now();
        let notice = Message::system(
            conversation_id,
            caller.id(),
            format!(
                "{} removed {}",
                caller.user.display_name, target_profile.display_name
            ),
            now,
        );

        let ordered = self.inner.conversation_locks.lock(conversation_id).await;
        if !self
            .inner
            .store
            .soft_remove_participant(conversation_id, target, now, Some(&notice))
            .await?
        {
            return Err(ServerError::NotFound(
                "user is not an active participant".into(),
            ));
        }

        self.inner.hub.leave_user(conversation_id, target);
        self.inner.hub.send_to_user(
            target,
            ServerEvent::RemovedFromConversation { conversation_id },
        );
        self.publish_departure(conversation_id, target, &notice, &caller.user);
        self.ensure_admin(conversation_id, &caller.user).await?;
        drop(ordered);

        self.touch(conversation_id, now).await;
        info!(conversation = %conversation_id, removed = %target, by = %caller.id(), "Participant removed");
        Ok(())
    }

    /// Leave a group. When the last admin leaves, the earliest remaining
    /// member is promoted.
    pub async fn leave_conversation(
        &self,
        caller: &Caller,
        conversation_id: ConversationId,
    ) -> Result<(), ServerError> {
        self.inner
            .directory
            .require_group(conversation_id, caller.id(), None)
            .await?;

        let now = Utc::now();
        let notice = Message::system(
            conversation_id,
            caller.id(),
            format!("{} left the conversation", caller.user.display_name),
            now,
        );

        let ordered = self.inner.conversation_locks.lock(conversation_id).await;
        if !self
            .inner
            .store
            .soft_remove_participant(conversation_id, caller.id(), now, Some(&notice))
            .await?
        {
            return Err(ServerError::Authorization(
                "not a participant of this conversation".into(),
            ));
        }

        self.inner.hub.leave_user(conversation_id, caller.id());
        self.publish_departure(conversation_id, caller.id(), &notice, &caller.user);
        self.ensure_admin(conversation_id, &caller.user).await?;
        drop(ordered);

        self.touch(conversation_id, now).await;
        info!(conversation = %conversation_id, user = %caller.id(), "Participant left");
        Ok(())
    }

    /// Fan out a departure. Call with the conversation lock held.
    fn publish_departure(
        &self,
        conversation_id: ConversationId,
        user: UserId,
        notice: &Message,
        author: &UserProfile,
    ) {
        if self.inner.typing.stop(conversation_id, user) {
            self.broadcast(
                conversation_id,
                ServerEvent::UserTypingStopped {
                    conversation_id,
                    user_id: user,
                },
                None,
            );
        }
        self.publish_notice(notice, author);
        self.broadcast(
            conversation_id,
            ServerEvent::ParticipantLeft {
                conversation_id,
                user_id: user,
            },
            None,
        );
    }

    /// Promote the earliest active member if no admin remains. Call with
    /// the conversation lock held.
    async fn ensure_admin(
        &self,
        conversation_id: ConversationId,
        author: &UserProfile,
    ) -> Result<Option<UserId>, ServerError> {
        let active = self
            .inner
            .directory
            .active_participants(conversation_id)
            .await?;
        if active.iter().any(|p| p.role == ParticipantRole::Admin) {
            return Ok(None);
        }
        let Some(heir) = active.first() else {
            return Ok(None);
        };
        if !self
            .inner
            .store
            .promote_participant(conversation_id, heir.user_id)
            .await?
        {
            return Ok(None);
        }

        let heir_profile = self.inner.store.get_user(heir.user_id).await?;
        let notice = Message::system(
            conversation_id,
            author.id,
            format!("{} is now an admin", heir_profile.display_name),
            Utc::now(),
        );
        self.inner.store.insert_message(&notice).await?;
        self.publish_notice(&notice, author);

        info!(conversation = %conversation_id, user = %heir.user_id, "Promoted to admin");
        Ok(Some(heir.user_id))
    }

    /// Change group settings and announce them with a system notice.
    pub async fn update_conversation(
        &self,
        caller: &Caller,
        conversation_id: ConversationId,
        mut changes: ConversationUpdate,
    ) -> Result<Conversation, ServerError> {
        if changes.is_empty() {
            return Err(ServerError::Validation("no changes given".into()));
        }
        if let Some(title) = changes.title.as_mut() {
            *title = title.trim().to_string();
            validate_title(title)?;
        }
        if let Some(description) = &changes.description {
            validate_description(description)?;
        }
        self.inner
            .directory
            .require_group(conversation_id, caller.id(), Some(Capability::EditSettings))
            .await?;

        let now = Utc::now();
        let notice = Message::system(
            conversation_id,
            caller.id(),
            format!(
                "{} updated the {}",
                caller.user.display_name,
                changes.changed_fields().join(", ")
            ),
            now,
        );

        let updated = {
            let _ordered = self.inner.conversation_locks.lock(conversation_id).await;
            let updated = self
                .inner
                .store
                .update_conversation(conversation_id, &changes, now, Some(&notice))
                .await?;
            self.publish_notice(&notice, &caller.user);
            self.broadcast(
                conversation_id,
                ServerEvent::ConversationUpdated {
                    conversation: updated.clone(),
                },
                None,
            );
            updated
        };

        self.touch(conversation_id, now).await;
        info!(
            conversation = %conversation_id,
            fields = ?changes.changed_fields(),
            "Conversation updated"
        );
        Ok(updated)
    }
}
