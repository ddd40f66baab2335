//! Bounded in-process window over each conversation's newest messages.
//!
//! A window always holds a contiguous run of the newest messages. It is
//! `complete` when it also holds the conversation's very first message, so
//! a short window can still answer a large page.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use hearth_shared::models::{Message, ReadReceipt};
use hearth_shared::types::{ConversationId, MessageId, UserId};

struct Window {
    messages: VecDeque<Message>,
    complete: bool,
}

pub struct MessageCache {
    capacity: usize,
    windows: Mutex<HashMap<ConversationId, Window>>,
}

impl MessageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Seed a window from storage. `messages` are oldest first and must be
    /// the newest of the conversation; `complete` when nothing older exists.
    pub fn prime(&self, conversation: ConversationId, messages: Vec<Message>, complete: bool) {
        if self.capacity == 0 {
            return;
        }
        let mut messages: VecDeque<Message> = messages.into();
        let mut complete = complete;
        while messages.len() > self.capacity {
            messages.pop_front();
            complete = false;
        }
        self.windows
            .lock()
            .insert(conversation, Window { messages, complete });
    }

    /// Append a newly accepted message. Only warm windows are extended; a
    /// cold conversation is primed on its next read.
    pub fn push(&self, message: &Message) {
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(&message.conversation_id) else {
            return;
        };
        window.messages.push_back(message.clone());
        while window.messages.len() > self.capacity {
            window.messages.pop_front();
            window.complete = false;
        }
    }

    /// Replace a cached copy after an edit, delete or verdict change.
    pub fn update(&self, message: &Message) {
        let mut windows = self.windows.lock();
        if let Some(slot) = windows
            .get_mut(&message.conversation_id)
            .and_then(|w| w.messages.iter_mut().find(|m| m.id == message.id))
        {
            *slot = message.clone();
        }
    }

    /// Record receipts written by a `mark_read`.
    pub fn apply_receipts(
        &self,
        conversation: ConversationId,
        user: UserId,
        ids: &[MessageId],
        read_at: DateTime<Utc>,
    ) {
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(&conversation) else {
            return;
        };
        for message in window.messages.iter_mut() {
            if ids.contains(&message.id) && !message.is_read_by(user) {
                message.read_by.push(ReadReceipt { user_id: user, read_at });
            }
        }
    }

    /// The newest `limit` messages, oldest first, plus whether older ones
    /// exist. `None` when the window cannot answer.
    pub fn latest(&self, conversation: ConversationId, limit: usize) -> Option<(Vec<Message>, bool)> {
        let windows = self.windows.lock();
        let window = windows.get(&conversation)?;
        let len = window.messages.len();

        if len >= limit {
            let page = window.messages.iter().skip(len - limit).cloned().collect();
            Some((page, len > limit || !window.complete))
        } else if window.complete {
            Some((window.messages.iter().cloned().collect(), false))
        } else {
            None
        }
    }

    #[cfg(test)]
    pub fn get(&self, conversation: ConversationId, id: MessageId) -> Option<Message> {
        self.windows
            .lock()
            .get(&conversation)?
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub fn is_warm(&self, conversation: ConversationId) -> bool {
        self.windows.lock().contains_key(&conversation)
    }
}

#[cfg(test)]
mod tests {
    use hearth_shared::types::MessageKind;

    use super::*;

    fn text(conv: ConversationId, body: &str) -> Message {
        Message::new(conv, UserId::new(), MessageKind::Text, Some(body.into()), Utc::now())
    }

    #[test]
    fn window_is_bounded_and_loses_completeness() {
        let cache = MessageCache::new(3);
        let conv = ConversationId::new();
        cache.prime(conv, vec![text(conv, "a")], true);

        assert_eq!(cache.latest(conv, 10).unwrap().0.len(), 1);

        for body in ["b", "c", "d"] {
            cache.push(&text(conv, body));
        }
        let (page, has_more) = cache.latest(conv, 3).unwrap();
        assert_eq!(
            page.iter().map(|m| m.content.clone().unwrap()).collect::<Vec<_>>(),
            vec!["b", "c", "d"]
        );
        assert!(has_more);
        // Evicted history must come from storage.
        assert!(cache.latest(conv, 4).is_none());
    }

    #[test]
    fn cold_conversations_are_not_extended() {
        let cache = MessageCache::new(3);
        let conv = ConversationId::new();
        cache.push(&text(conv, "lost"));
        assert!(!cache.is_warm(conv));
        assert!(cache.latest(conv, 1).is_none());
    }

    #[test]
    fn updates_and_receipts_apply_in_place() {
        let cache = MessageCache::new(5);
        let conv = ConversationId::new();
        let mut m = text(conv, "draft");
        cache.prime(conv, vec![m.clone()], true);

        m.content = Some("final".into());
        cache.update(&m);
        assert_eq!(cache.get(conv, m.id).unwrap().content.as_deref(), Some("final"));

        let reader = UserId::new();
        cache.apply_receipts(conv, reader, &[m.id], Utc::now());
        cache.apply_receipts(conv, reader, &[m.id], Utc::now());
        assert_eq!(cache.get(conv, m.id).unwrap().read_by.len(), 2);
    }
}
