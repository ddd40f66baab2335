use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use hearth_shared::constants::{DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, MAX_TEXT_LENGTH};
use hearth_shared::models::{MediaDescriptor, Message};
use hearth_shared::protocol::{MediaUpload, MessageView, ServerEvent};
use hearth_shared::types::{
    Capability, ConversationId, MediaKind, MessageId, MessageKind, SecurityStatus, UserId,
};

use super::{Caller, MessagingEngine};
use crate::error::ServerError;
use crate::moderation::Verdict;
use crate::notifier::PushSummary;
use crate::render;

/// A `send_message` request.
#[derive(Debug, Clone, Default)]
pub struct SendMessage {
    pub conversation_id: ConversationId,
    pub content: Option<String>,
    pub media: Option<MediaUpload>,
    pub reply_to: Option<MessageId>,
    pub client_ref: Option<String>,
}

fn validate_text(text: &str) -> Result<(), ServerError> {
    if text.trim().is_empty() {
        return Err(ServerError::Validation("message text is empty".into()));
    }
    if text.chars().count() > MAX_TEXT_LENGTH {
        return Err(ServerError::Validation(format!(
            "message text exceeds {MAX_TEXT_LENGTH} characters"
        )));
    }
    Ok(())
}

impl MessagingEngine {
    /// Accept a message: validate, moderate, store media, persist, fan out.
    ///
    /// The sender's connection gets `message_sent`; every other connection
    /// in the room gets `new_message`. Nothing is persisted or broadcast
    /// when moderation blocks the text.
    pub async fn send_message(
        &self,
        caller: &Caller,
        request: SendMessage,
    ) -> Result<MessageView, ServerError> {
        let conversation_id = request.conversation_id;
        let content = request.content.filter(|c| !c.trim().is_empty());
        if let Some(text) = &content {
            validate_text(text)?;
        }

        let upload = match request.media {
            Some(upload) => {
                let kind = MediaKind::from_mime(&upload.mime_type).ok_or_else(|| {
                    ServerError::Validation(format!("unsupported media type {}", upload.mime_type))
                })?;
                let data = upload.decode()?;
                if data.is_empty() {
                    return Err(ServerError::Validation("media payload is empty".into()));
                }
                if data.len() > self.inner.settings.max_media_size {
                    return Err(ServerError::Validation(format!(
                        "media exceeds {} bytes",
                        self.inner.settings.max_media_size
                    )));
                }
                Some((kind, upload, data))
            }
            None => None,
        };
        if content.is_none() && upload.is_none() {
            return Err(ServerError::Validation(
                "message needs text or media".into(),
            ));
        }

        let (conversation, _) = self
            .inner
            .directory
            .require(conversation_id, caller.id(), Capability::SendMessages)
            .await?;

        if let Some(reply_to) = request.reply_to {
            let target = self.inner.store.get_message(reply_to).await.map_err(|_| {
                ServerError::Validation("reply target does not exist".into())
            })?;
            if target.conversation_id != conversation_id {
                return Err(ServerError::Validation(
                    "reply target belongs to another conversation".into(),
                ));
            }
        }

        let verdict = match (&content, conversation.moderation_enabled) {
            (Some(text), true) => self.inner.moderation.check_text(text).await?,
            _ => None,
        };

        let (kind, media) = match upload {
            Some((kind, upload, data)) => {
                let descriptor = self.store_media(kind, &upload, data).await?;
                (kind.message_kind(), Some(descriptor))
            }
            None => (MessageKind::Text, None),
        };

        let (message, view) = {
            let _ordered = self.inner.conversation_locks.lock(conversation_id).await;

            let mut message = Message::new(conversation_id, caller.id(), kind, content, Utc::now());
            message.reply_to = request.reply_to;
            message.media = media;
            if let Some(Verdict { status, details }) = verdict {
                message.security_status = status;
                message.security_details = Some(details);
            }

            self.inner.store.insert_message(&message).await?;
            self.inner.cache.push(&message);

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

            let users = HashMap::from([(caller.id(), caller.user.clone())]);
            let view = render::message_view(&message, &users, &[]);
            self.broadcast(
                conversation_id,
                ServerEvent::NewMessage {
                    message: view.clone(),
                },
                Some(caller.connection),
            );
            self.inner.hub.send_to(
                caller.connection,
                Arc::new(ServerEvent::MessageSent {
                    client_ref: request.client_ref,
                    message: view.clone(),
                }),
            );
            (message, view)
        };

        debug!(
            conversation = %conversation_id,
            message = %message.id,
            kind = %message.kind,
            security = %message.security_status,
            "Message accepted"
        );

        self.touch(conversation_id, message.sent_at).await;
        self.notify_offline(&message, caller.user.display_name.clone());
        if conversation.ai_scan_enabled && message.media_kind().is_some() {
            self.schedule_media_scan(&message);
        }
        Ok(view)
    }

    /// Persist an upload and, for images, a thumbnail.
    async fn store_media(
        &self,
        kind: MediaKind,
        upload: &MediaUpload,
        data: bytes::Bytes,
    ) -> Result<MediaDescriptor, ServerError> {
        let stored = self
            .inner
            .media
            .store(data, &upload.mime_type, &upload.file_name)
            .await?;

        let mut descriptor = MediaDescriptor {
            url: Some(stored.url.clone()),
            mime_type: Some(upload.mime_type.clone()),
            file_name: Some(upload.file_name.clone()),
            size: Some(stored.size),
            duration_secs: upload.duration_secs,
            ..Default::default()
        };

        if kind == MediaKind::Image {
            match self.inner.media.thumbnail(&stored.url).await {
                Ok(thumb) => {
                    descriptor.thumbnail_url = Some(thumb.url);
                    descriptor.width = Some(thumb.width);
                    descriptor.height = Some(thumb.height);
                }
                Err(e) => warn!(url = %stored.url, error = %e, "Thumbnail generation failed"),
            }
        }
        Ok(descriptor)
    }

    /// Push a summary to participants without a live connection. Runs in
    /// the background; failures are logged only.
    fn notify_offline(&self, message: &Message, sender_name: String) {
        let engine = self.clone();
        let message = message.clone();
        tokio::spawn(async move {
            let participants = match engine
                .inner
                .directory
                .active_participants(message.conversation_id)
                .await
            {
                Ok(participants) => participants,
                Err(e) => {
                    warn!(message = %message.id, error = %e, "Could not resolve push recipients");
                    return;
                }
            };

            let offline: Vec<UserId> = participants
                .iter()
                .map(|p| p.user_id)
                .filter(|u| *u != message.sender_id && !engine.inner.presence.is_online(*u))
                .collect();
            if offline.is_empty() {
                return;
            }

            let summary = PushSummary::for_message(&message, &sender_name);
            if let Err(e) = engine.inner.notifier.notify(&offline, &summary).await {
                warn!(message = %message.id, recipients = offline.len(), error = %e, "Push notification failed");
            }
        });
    }

    /// Scan stored media after the configured delay and apply the verdict.
    fn schedule_media_scan(&self, message: &Message) {
        let Some(url) = message.media.as_ref().and_then(|m| m.url.clone()) else {
            return;
        };
        let engine = self.clone();
        let (conversation, id) = (message.conversation_id, message.id);

        tokio::spawn(async move {
            tokio::time::sleep(engine.inner.settings.media_scan_delay).await;
            let verdict = match engine.inner.moderation.scan_media(&url).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    warn!(message = %id, error = %e, "Media scan gave up; security status unchanged");
                    return;
                }
            };
            if let Err(e) = engine.apply_media_verdict(conversation, id, verdict).await {
                warn!(message = %id, error = %e, "Failed to record media verdict");
            }
        });
    }

    /// Escalate a message's security status and tell the room. Returns
    /// whether anything changed; a repeated or milder verdict is a no-op.
    pub(crate) async fn apply_media_verdict(
        &self,
        conversation_id: ConversationId,
        id: MessageId,
        verdict: Verdict,
    ) -> Result<bool, ServerError> {
        let _ordered = self.inner.conversation_locks.lock(conversation_id).await;

        let changed = self
            .inner
            .store
            .escalate_security_status(id, verdict.status, &verdict.details, Utc::now())
            .await?;
        if !changed {
            debug!(message = %id, status = %verdict.status, "Media verdict left status unchanged");
            return Ok(false);
        }

        let message = self.inner.store.get_message(id).await?;
        self.inner.cache.update(&message);
        self.broadcast(
            conversation_id,
            ServerEvent::MessageSecurityUpdated {
                conversation_id,
                message_id: id,
                security_status: message.security_status,
            },
            None,
        );

        if message.security_status == SecurityStatus::Blocked {
            info!(
                message = %id,
                categories = ?verdict.details.high_risk,
                "Media blocked by moderation"
            );
        }
        Ok(true)
    }

    /// Replace the text of one of the caller's own text messages.
    pub async fn edit_message(
        &self,
        caller: &Caller,
        conversation_id: ConversationId,
        message_id: MessageId,
        content: String,
    ) -> Result<MessageView, ServerError> {
        validate_text(&content)?;
        let (conversation, _) = self
            .inner
            .directory
            .member_view(conversation_id, caller.id())
            .await?;

        let message = self.message_in(conversation_id, message_id).await?;
        if message.sender_id != caller.id() {
            return Err(ServerError::Authorization(
                "only the sender can edit a message".into(),
            ));
        }
        if message.kind != MessageKind::Text {
            return Err(ServerError::Validation("only text messages can be edited".into()));
        }
        if message.is_deleted() {
            return Err(ServerError::Validation("message was deleted".into()));
        }

        let verdict = if conversation.moderation_enabled {
            self.inner.moderation.check_text(&content).await?
        } else {
            None
        };
        let (status, details) = match verdict {
            Some(Verdict { status, details }) => (status, Some(details)),
            None => (SecurityStatus::Pending, None),
        };

        let _ordered = self.inner.conversation_locks.lock(conversation_id).await;
        let updated = self
            .inner
            .store
            .update_message_content(message_id, &content, status, details.as_ref(), Utc::now())
            .await?;
        if !updated {
            return Err(ServerError::Validation("message was deleted".into()));
        }

        let message = self.inner.store.get_message(message_id).await?;
        self.inner.cache.update(&message);
        let view = self.render_message(&message).await?;
        self.broadcast(
            conversation_id,
            ServerEvent::MessageUpdated {
                message: view.clone(),
            },
            Some(caller.connection),
        );
        Ok(view)
    }

    /// Soft-delete a message. Senders may delete their own; participants
    /// allowed to remove others may delete anyone's in a group. Deleting an
    /// already deleted message succeeds without an event.
    pub async fn delete_message(
        &self,
        caller: &Caller,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<(), ServerError> {
        let (conversation, participant) = self
            .inner
            .directory
            .member_view(conversation_id, caller.id())
            .await?;
        let message = self.message_in(conversation_id, message_id).await?;

        let moderator = !conversation.is_direct()
            && participant.permissions.allows(Capability::RemoveParticipants);
        if message.sender_id != caller.id() && !moderator {
            return Err(ServerError::Authorization(
                "cannot delete another participant's message".into(),
            ));
        }
        if message.is_deleted() {
            return Ok(());
        }

        let _ordered = self.inner.conversation_locks.lock(conversation_id).await;
        if !self.inner.store.soft_delete_message(message_id, Utc::now()).await? {
            return Ok(());
        }
        let message = self.inner.store.get_message(message_id).await?;
        self.inner.cache.update(&message);
        self.broadcast(
            conversation_id,
            ServerEvent::MessageDeleted {
                conversation_id,
                message_id,
            },
            Some(caller.connection),
        );
        Ok(())
    }

    /// A page of history, oldest first, plus whether older messages exist.
    /// Fetching history marks the conversation read for the caller.
    pub async fn messages(
        &self,
        caller: &Caller,
        conversation_id: ConversationId,
        limit: Option<u32>,
        before: Option<MessageId>,
    ) -> Result<(Vec<MessageView>, bool), ServerError> {
        self.inner
            .directory
            .active_participant(conversation_id, caller.id())
            .await?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        self.mark_read(caller, conversation_id).await?;

        let (page, has_more) = match before {
            Some(before) => {
                self.message_in(conversation_id, before).await?;
                self.page_from_store(conversation_id, limit, Some(before)).await?
            }
            None => self.latest_page(conversation_id, limit).await?,
        };

        let visible: Vec<Message> = page
            .into_iter()
            .filter(|m| render::visible_to(m, caller.id()))
            .collect();
        Ok((self.render_messages(&visible).await?, has_more))
    }

    async fn page_from_store(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<(Vec<Message>, bool), ServerError> {
        let mut messages = self
            .inner
            .store
            .list_recent_messages(conversation_id, limit + 1, before)
            .await?;
        let has_more = messages.len() > limit as usize;
        if has_more {
            messages.remove(0);
        }
        Ok((messages, has_more))
    }

    /// Newest page, served from the cache when its window can answer.
    async fn latest_page(
        &self,
        conversation_id: ConversationId,
        limit: u32,
    ) -> Result<(Vec<Message>, bool), ServerError> {
        if let Some(hit) = self.inner.cache.latest(conversation_id, limit as usize) {
            return Ok(hit);
        }

        // Priming must not interleave with a send, or the window could miss
        // the message being accepted.
        let _ordered = self.inner.conversation_locks.lock(conversation_id).await;
        if let Some(hit) = self.inner.cache.latest(conversation_id, limit as usize) {
            return Ok(hit);
        }

        let window = limit.max(self.inner.cache.capacity() as u32);
        let (messages, has_more) = self.page_from_store(conversation_id, window, None).await?;
        self.inner
            .cache
            .prime(conversation_id, messages.clone(), !has_more);

        let skip = messages.len().saturating_sub(limit as usize);
        Ok((messages.into_iter().skip(skip).collect(), has_more || skip > 0))
    }

    /// Load a message and check it belongs to the conversation.
    pub(super) async fn message_in(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<Message, ServerError> {
        let message = self.inner.store.get_message(message_id).await?;
        if message.conversation_id != conversation_id {
            return Err(ServerError::NotFound("message not found".into()));
        }
        Ok(message)
    }
}
