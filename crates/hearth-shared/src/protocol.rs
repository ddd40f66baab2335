//! JSON events exchanged over a live connection.
//!
//! Every frame is a JSON object tagged by `"type"`. Clients send
//! [`ClientEvent`]s; the server answers and broadcasts [`ServerEvent`]s.

use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::models::{Conversation, ConversationUpdate, MediaDescriptor, UserProfile};
use crate::types::{
    ConversationId, ConversationKind, MessageId, MessageKind, MessageStatus, ParticipantRole,
    PresenceStatus, SecurityStatus, UserId, UserType,
};

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Events a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Must be the first event on every connection.
    Authenticate { user_id: UserId, credential: String },

    GetConversations,

    GetMessages {
        conversation_id: ConversationId,
        #[serde(default)]
        limit: Option<u32>,
        /// Page backwards from this message.
        #[serde(default)]
        before: Option<MessageId>,
    },

    SendMessage {
        conversation_id: ConversationId,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        media: Option<MediaUpload>,
        #[serde(default)]
        reply_to: Option<MessageId>,
        /// Opaque client token echoed in `message_sent`.
        #[serde(default)]
        client_ref: Option<String>,
    },

    EditMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
        content: String,
    },

    DeleteMessage {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    CreateConversation {
        kind: ConversationKind,
        participant_ids: Vec<UserId>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        avatar_url: Option<String>,
        #[serde(default)]
        is_public: Option<bool>,
        #[serde(default)]
        is_encrypted: Option<bool>,
    },

    AddParticipants {
        conversation_id: ConversationId,
        user_ids: Vec<UserId>,
    },

    RemoveParticipant {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    UpdateConversation {
        conversation_id: ConversationId,
        changes: ConversationUpdate,
    },

    LeaveConversation { conversation_id: ConversationId },

    TypingStart { conversation_id: ConversationId },

    TypingStop { conversation_id: ConversationId },

    MarkRead { conversation_id: ConversationId },

    AddReaction {
        conversation_id: ConversationId,
        message_id: MessageId,
        reaction: String,
    },

    RemoveReaction {
        conversation_id: ConversationId,
        message_id: MessageId,
        reaction: String,
    },

    SetStatus {
        status: PresenceStatus,
        #[serde(default)]
        custom_status: Option<String>,
    },
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire name of the event, echoed in error replies.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::GetConversations => "get_conversations",
            Self::GetMessages { .. } => "get_messages",
            Self::SendMessage { .. } => "send_message",
            Self::EditMessage { .. } => "edit_message",
            Self::DeleteMessage { .. } => "delete_message",
            Self::CreateConversation { .. } => "create_conversation",
            Self::AddParticipants { .. } => "add_participants",
            Self::RemoveParticipant { .. } => "remove_participant",
            Self::UpdateConversation { .. } => "update_conversation",
            Self::LeaveConversation { .. } => "leave_conversation",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::MarkRead { .. } => "mark_read",
            Self::AddReaction { .. } => "add_reaction",
            Self::RemoveReaction { .. } => "remove_reaction",
            Self::SetStatus { .. } => "set_status",
        }
    }

    /// The conversation the event acts on, if it targets exactly one.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            Self::GetMessages { conversation_id, .. }
            | Self::SendMessage { conversation_id, .. }
            | Self::EditMessage { conversation_id, .. }
            | Self::DeleteMessage { conversation_id, .. }
            | Self::AddParticipants { conversation_id, .. }
            | Self::RemoveParticipant { conversation_id, .. }
            | Self::UpdateConversation { conversation_id, .. }
            | Self::LeaveConversation { conversation_id }
            | Self::TypingStart { conversation_id }
            | Self::TypingStop { conversation_id }
            | Self::MarkRead { conversation_id }
            | Self::AddReaction { conversation_id, .. }
            | Self::RemoveReaction { conversation_id, .. } => Some(*conversation_id),
            Self::Authenticate { .. }
            | Self::GetConversations
            | Self::CreateConversation { .. }
            | Self::SetStatus { .. } => None,
        }
    }
}

/// A single media attachment, base64-encoded inside the JSON frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaUpload {
    pub mime_type: String,
    pub file_name: String,
    pub data: String,
    #[serde(default)]
    pub duration_secs: Option<u32>,
}

impl MediaUpload {
    pub fn decode(&self) -> Result<Bytes, ProtocolError> {
        let raw = base64::engine::general_purpose::STANDARD.decode(self.data.as_bytes())?;
        Ok(Bytes::from(raw))
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Events the server sends: direct replies and room broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Authenticated {
        user: UserProfile,
        conversations: Vec<ConversationSummary>,
    },

    AuthenticationError { reason: String },

    Error {
        /// Name of the inbound event that failed.
        event: String,
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        categories: Vec<String>,
        retryable: bool,
    },

    Conversations { conversations: Vec<ConversationSummary> },

    Messages {
        conversation_id: ConversationId,
        messages: Vec<MessageView>,
        has_more: bool,
    },

    /// Acknowledgement to the sender of an accepted message.
    MessageSent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_ref: Option<String>,
        message: MessageView,
    },

    NewMessage { message: MessageView },

    MessageUpdated { message: MessageView },

    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
    },

    MessageSecurityUpdated {
        conversation_id: ConversationId,
        message_id: MessageId,
        security_status: SecurityStatus,
    },

    MessagesRead {
        conversation_id: ConversationId,
        user_id: UserId,
        read_at: DateTime<Utc>,
        message_ids: Vec<MessageId>,
    },

    ConversationCreated { conversation: ConversationSummary },

    ConversationUpdated { conversation: Conversation },

    ParticipantsAdded {
        conversation_id: ConversationId,
        participants: Vec<ParticipantView>,
    },

    ParticipantLeft {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    RemovedFromConversation { conversation_id: ConversationId },

    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        display_name: String,
    },

    UserTypingStopped {
        conversation_id: ConversationId,
        user_id: UserId,
    },

    ReactionAdded {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
        reaction: String,
    },

    ReactionRemoved {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
        reaction: String,
    },

    PresenceChanged { presence: PresenceView },
}

impl ServerEvent {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Sender display fields embedded in every rendered message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderView {
    pub id: UserId,
    pub display_name: String,
    pub user_type: Option<UserType>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionSummary {
    pub reaction: String,
    pub count: usize,
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadByView {
    pub user_id: UserId,
    pub read_at: DateTime<Utc>,
}

/// A message as rendered for one viewer. Deleted messages carry neither
/// content nor media.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageView {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: SenderView,
    pub reply_to: Option<MessageId>,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub media: Option<MediaDescriptor>,
    pub security_status: SecurityStatus,
    pub status: MessageStatus,
    pub read_by: Vec<ReadByView>,
    pub reactions: Vec<ReactionSummary>,
    pub sent_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantView {
    pub user_id: UserId,
    pub display_name: String,
    pub user_type: Option<UserType>,
    pub avatar_url: Option<String>,
    pub role: ParticipantRole,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationSummary {
    pub conversation: Conversation,
    pub participants: Vec<ParticipantView>,
    pub last_message: Option<MessageView>,
    pub unread_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceView {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_active: DateTime<Utc>,
    pub custom_status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_client_events() {
        let user = UserId::new();
        let raw = format!(
            r#"{{"type":"authenticate","user_id":"{}","credential":"tok"}}"#,
            user
        );
        match ClientEvent::parse(&raw).unwrap() {
            ClientEvent::Authenticate { user_id, credential } => {
                assert_eq!(user_id, user);
                assert_eq!(credential, "tok");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let conv = ConversationId::new();
        let raw = format!(r#"{{"type":"send_message","conversation_id":"{}","content":"hello"}}"#, conv);
        let event = ClientEvent::parse(&raw).unwrap();
        assert_eq!(event.name(), "send_message");
        assert_eq!(event.conversation_id(), Some(conv));
        assert!(matches!(
            event,
            ClientEvent::SendMessage { media: None, reply_to: None, .. }
        ));

        assert_eq!(
            ClientEvent::parse(r#"{"type":"get_conversations"}"#).unwrap().conversation_id(),
            None
        );
        assert!(matches!(
            ClientEvent::parse(r#"{"type":"get_conversations"}"#).unwrap(),
            ClientEvent::GetConversations
        ));
    }

    #[test]
    fn rejects_unknown_event_type() {
        assert!(ClientEvent::parse(r#"{"type":"self_destruct"}"#).is_err());
        assert!(ClientEvent::parse("not json").is_err());
    }

    #[test]
    fn decodes_media_payload() {
        let upload = MediaUpload {
            mime_type: "text/plain".into(),
            file_name: "lease.txt".into(),
            data: "aGVsbG8=".into(),
            duration_secs: None,
        };
        assert_eq!(&upload.decode().unwrap()[..], b"hello");

        let bad = MediaUpload {
            data: "!!!".into(),
            ..upload
        };
        assert!(bad.decode().is_err());
    }

    #[test]
    fn error_event_omits_empty_categories() {
        let json = ServerEvent::Error {
            event: "send_message".into(),
            code: "validation_error".into(),
            message: "empty message".into(),
            categories: vec![],
            retryable: false,
        }
        .to_json()
        .unwrap();
        assert!(json.contains(r#""type":"error""#));
        assert!(!json.contains("categories"));
    }
}
