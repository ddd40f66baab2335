//! Logical entities the messaging core depends on.
//!
//! These are what the store persists and what the engine reasons about;
//! client-facing shapes live in [`crate::protocol`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    Capability, ConversationId, ConversationKind, MediaKind, MessageId, MessageKind,
    MessageStatus, ParticipantRole, SecurityStatus, UserId, UserType,
};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A marketplace user as resolved by the upstream user store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    pub user_type: UserType,
    pub avatar_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    /// Group only.
    pub title: Option<String>,
    /// Group only.
    pub description: Option<String>,
    /// Group only.
    pub avatar_url: Option<String>,
    pub is_public: bool,
    pub is_encrypted: bool,
    /// Governs synchronous text moderation on send.
    pub moderation_enabled: bool,
    /// Governs the asynchronous media scan.
    pub ai_scan_enabled: bool,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn is_direct(&self) -> bool {
        self.kind == ConversationKind::Direct
    }
}

/// Partial update of a group conversation's settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_encrypted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderation_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_scan_enabled: Option<bool>,
}

impl ConversationUpdate {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Names of the fields this update touches, in a stable order.
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.title.is_some() {
            fields.push("title");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        if self.avatar_url.is_some() {
            fields.push("avatar");
        }
        if self.is_public.is_some() {
            fields.push("visibility");
        }
        if self.is_encrypted.is_some() {
            fields.push("encryption");
        }
        if self.moderation_enabled.is_some() {
            fields.push("moderation");
        }
        if self.ai_scan_enabled.is_some() {
            fields.push("media scanning");
        }
        fields
    }

    pub fn apply_to(&self, conversation: &mut Conversation) {
        if let Some(title) = &self.title {
            conversation.title = Some(title.clone());
        }
        if let Some(description) = &self.description {
            conversation.description = Some(description.clone());
        }
        if let Some(avatar) = &self.avatar_url {
            conversation.avatar_url = Some(avatar.clone());
        }
        if let Some(v) = self.is_public {
            conversation.is_public = v;
        }
        if let Some(v) = self.is_encrypted {
            conversation.is_encrypted = v;
        }
        if let Some(v) = self.moderation_enabled {
            conversation.moderation_enabled = v;
        }
        if let Some(v) = self.ai_scan_enabled {
            conversation.ai_scan_enabled = v;
        }
    }
}

// ---------------------------------------------------------------------------
// Participant
// ---------------------------------------------------------------------------

/// Capability flags carried by every participant row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Permissions {
    pub can_send_messages: bool,
    pub can_add_participants: bool,
    pub can_remove_participants: bool,
    pub can_edit_settings: bool,
}

impl Permissions {
    pub fn admin() -> Self {
        Self {
            can_send_messages: true,
            can_add_participants: true,
            can_remove_participants: true,
            can_edit_settings: true,
        }
    }

    pub fn send_only() -> Self {
        Self {
            can_send_messages: true,
            can_add_participants: false,
            can_remove_participants: false,
            can_edit_settings: false,
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::SendMessages => self.can_send_messages,
            Capability::AddParticipants => self.can_add_participants,
            Capability::RemoveParticipants => self.can_remove_participants,
            Capability::EditSettings => self.can_edit_settings,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub role: ParticipantRole,
    pub permissions: Permissions,
    pub joined_at: DateTime<Utc>,
    /// `None` while the participant is active.
    pub left_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn admin(conversation_id: ConversationId, user_id: UserId, at: DateTime<Utc>) -> Self {
        Self {
            conversation_id,
            user_id,
            role: ParticipantRole::Admin,
            permissions: Permissions::admin(),
            joined_at: at,
            left_at: None,
        }
    }

    pub fn member(conversation_id: ConversationId, user_id: UserId, at: DateTime<Utc>) -> Self {
        Self {
            conversation_id,
            user_id,
            role: ParticipantRole::Member,
            permissions: Permissions::send_only(),
            joined_at: at,
            left_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.left_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Stored media attached to a message. Every field is optional because
/// availability depends on the media kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaDescriptor {
    pub url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub size: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<u32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModerationSource {
    Text,
    Media,
}

/// Structured moderation result persisted with the message for audit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecurityDetails {
    pub source: ModerationSource,
    pub flagged: bool,
    pub categories: Vec<String>,
    pub scores: BTreeMap<String, f64>,
    /// Categories that crossed the blocking bound.
    pub high_risk: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadReceipt {
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub reply_to: Option<MessageId>,
    pub kind: MessageKind,
    /// `None` for pure-media messages.
    pub content: Option<String>,
    pub media: Option<MediaDescriptor>,
    pub security_status: SecurityStatus,
    pub security_details: Option<SecurityDetails>,
    pub status: MessageStatus,
    /// Ordered by `read_at`; the sender is always first.
    pub read_by: Vec<ReadReceipt>,
    pub sent_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// A freshly accepted message with the sender as first reader.
    pub fn new(
        conversation_id: ConversationId,
        sender_id: UserId,
        kind: MessageKind,
        content: Option<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender_id,
            reply_to: None,
            kind,
            content,
            media: None,
            security_status: SecurityStatus::Pending,
            security_details: None,
            status: MessageStatus::Sent,
            read_by: vec![ReadReceipt {
                user_id: sender_id,
                read_at: at,
            }],
            sent_at: at,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn system(
        conversation_id: ConversationId,
        actor: UserId,
        text: String,
        at: DateTime<Utc>,
    ) -> Self {
        let mut message = Self::new(conversation_id, actor, MessageKind::System, Some(text), at);
        message.security_status = SecurityStatus::Passed;
        message
    }

    pub fn is_deleted(&self) -> bool {
        self.status == MessageStatus::Deleted
    }

    pub fn is_blocked(&self) -> bool {
        self.security_status == SecurityStatus::Blocked
    }

    pub fn media_kind(&self) -> Option<MediaKind> {
        self.kind.media_kind()
    }

    pub fn is_read_by(&self, user: UserId) -> bool {
        self.read_by.iter().any(|r| r.user_id == user)
    }

    /// Counts toward `user`'s unread total.
    pub fn is_unread_for(&self, user: UserId) -> bool {
        self.sender_id != user && !self.is_deleted() && !self.is_blocked() && !self.is_read_by(user)
    }
}

// ---------------------------------------------------------------------------
// Reaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reaction {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub reaction: String,
    pub created_at: DateTime<Utc>,
}
