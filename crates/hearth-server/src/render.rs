//! Client-facing views of stored records.

use std::collections::HashMap;

use hearth_shared::models::{Message, Participant, Reaction, UserProfile};
use hearth_shared::protocol::{
    MessageView, ParticipantView, ReactionSummary, ReadByView, SenderView,
};
use hearth_shared::types::UserId;

/// Whether `viewer` may see `message` at all. Blocked messages are visible
/// to their sender only.
pub fn visible_to(message: &Message, viewer: UserId) -> bool {
    !message.is_blocked() || message.sender_id == viewer
}

pub fn sender_view(id: UserId, users: &HashMap<UserId, UserProfile>) -> SenderView {
    match users.get(&id) {
        Some(user) => SenderView {
            id,
            display_name: user.display_name.clone(),
            user_type: Some(user.user_type),
            avatar_url: user.avatar_url.clone(),
        },
        None => SenderView {
            id,
            display_name: "Unknown user".to_string(),
            user_type: None,
            avatar_url: None,
        },
    }
}

/// Group reactions by symbol, in order of first use.
pub fn reaction_summaries(reactions: &[Reaction]) -> Vec<ReactionSummary> {
    let mut summaries: Vec<ReactionSummary> = Vec::new();
    for reaction in reactions {
        match summaries.iter_mut().find(|s| s.reaction == reaction.reaction) {
            Some(summary) => {
                summary.count += 1;
                summary.user_ids.push(reaction.user_id);
            }
            None => summaries.push(ReactionSummary {
                reaction: reaction.reaction.clone(),
                count: 1,
                user_ids: vec![reaction.user_id],
            }),
        }
    }
    summaries
}

/// Deleted messages render without content or media.
pub fn message_view(
    message: &Message,
    users: &HashMap<UserId, UserProfile>,
    reactions: &[Reaction],
) -> MessageView {
    let (content, media) = if message.is_deleted() {
        (None, None)
    } else {
        (message.content.clone(), message.media.clone())
    };

    MessageView {
        id: message.id,
        conversation_id: message.conversation_id,
        sender: sender_view(message.sender_id, users),
        reply_to: message.reply_to,
        kind: message.kind,
        content,
        media,
        security_status: message.security_status,
        status: message.status,
        read_by: message
            .read_by
            .iter()
            .map(|r| ReadByView {
                user_id: r.user_id,
                read_at: r.read_at,
            })
            .collect(),
        reactions: reaction_summaries(reactions),
        sent_at: message.sent_at,
        updated_at: message.updated_at,
    }
}

pub fn participant_view(
    participant: &Participant,
    users: &HashMap<UserId, UserProfile>,
    online: bool,
) -> ParticipantView {
    let sender = sender_view(participant.user_id, users);
    ParticipantView {
        user_id: participant.user_id,
        display_name: sender.display_name,
        user_type: sender.user_type,
        avatar_url: sender.avatar_url,
        role: participant.role,
        online,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use hearth_shared::models::MediaDescriptor;
    use hearth_shared::types::{
        ConversationId, MessageId, MessageKind, MessageStatus, SecurityStatus,
    };

    use super::*;

    #[test]
    fn deleted_messages_hide_content_and_media() {
        let mut m = Message::new(
            ConversationId::new(),
            UserId::new(),
            MessageKind::Image,
            Some("caption".into()),
            Utc::now(),
        );
        m.media = Some(MediaDescriptor {
            url: Some("/media/x.png".into()),
            ..Default::default()
        });
        m.status = MessageStatus::Deleted;

        let view = message_view(&m, &HashMap::new(), &[]);
        assert!(view.content.is_none());
        assert!(view.media.is_none());
        assert_eq!(view.sender.display_name, "Unknown user");
    }

    #[test]
    fn blocked_messages_only_visible_to_sender() {
        let sender = UserId::new();
        let mut m = Message::new(ConversationId::new(), sender, MessageKind::Text, None, Utc::now());
        m.security_status = SecurityStatus::Blocked;
        assert!(visible_to(&m, sender));
        assert!(!visible_to(&m, UserId::new()));
    }

    #[test]
    fn reactions_group_by_symbol() {
        let message_id = MessageId::new();
        let (a, b) = (UserId::new(), UserId::new());
        let reaction = |user, symbol: &str| Reaction {
            message_id,
            user_id: user,
            reaction: symbol.to_string(),
            created_at: Utc::now(),
        };
        let summaries =
            reaction_summaries(&[reaction(a, "👍"), reaction(b, "🏠"), reaction(b, "👍")]);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].reaction, "👍");
        assert_eq!(summaries[0].count, 2);
        assert_eq!(summaries[0].user_ids, vec![a, b]);
    }
}
