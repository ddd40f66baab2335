//! Ephemeral "is typing" state with timed expiry.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use hearth_shared::types::{ConversationId, UserId};

pub struct TypingTracker {
    timeout: Duration,
    active: Mutex<HashMap<ConversationId, HashMap<UserId, Instant>>>,
}

impl TypingTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Record a typing signal. Returns `true` on the idle -> typing
    /// transition; repeated signals only refresh the instant.
    pub fn start(&self, conversation: ConversationId, user: UserId, now: Instant) -> bool {
        self.active
            .lock()
            .entry(conversation)
            .or_default()
            .insert(user, now)
            .is_none()
    }

    /// Returns `true` if the user was typing.
    pub fn stop(&self, conversation: ConversationId, user: UserId) -> bool {
        let mut active = self.active.lock();
        let Some(users) = active.get_mut(&conversation) else {
            return false;
        };
        let was_typing = users.remove(&user).is_some();
        if users.is_empty() {
            active.remove(&conversation);
        }
        was_typing
    }

    /// Drop every entry of `user`, returning the conversations they were
    /// typing in.
    pub fn purge_user(&self, user: UserId) -> Vec<ConversationId> {
        let mut active = self.active.lock();
        let mut purged = Vec::new();
        active.retain(|conversation, users| {
            if users.remove(&user).is_some() {
                purged.push(*conversation);
            }
            !users.is_empty()
        });
        purged
    }

    /// Evict entries whose last signal is older than the timeout.
    pub fn sweep(&self, now: Instant) -> Vec<(ConversationId, UserId)> {
        let mut active = self.active.lock();
        let mut expired = Vec::new();
        active.retain(|conversation, users| {
            users.retain(|user, last| {
                let stale = now.saturating_duration_since(*last) > self.timeout;
                if stale {
                    expired.push((*conversation, *user));
                }
                !stale
            });
            !users.is_empty()
        });
        expired
    }

    #[cfg(test)]
    pub fn is_typing(&self, conversation: ConversationId, user: UserId) -> bool {
        self.active
            .lock()
            .get(&conversation)
            .is_some_and(|users| users.contains_key(&user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_first_signal_is_a_transition() {
        let tracker = TypingTracker::new(Duration::from_secs(5));
        let (conv, user) = (ConversationId::new(), UserId::new());
        let t0 = Instant::now();

        assert!(tracker.start(conv, user, t0));
        assert!(!tracker.start(conv, user, t0 + Duration::from_secs(1)));
        assert!(tracker.stop(conv, user));
        assert!(!tracker.stop(conv, user));
        assert!(tracker.start(conv, user, t0 + Duration::from_secs(2)));
    }

    #[test]
    fn sweep_expires_after_timeout_from_last_signal() {
        let timeout = Duration::from_secs(5);
        let sweep_every = Duration::from_secs(1);
        let tracker = TypingTracker::new(timeout);
        let (conv, user) = (ConversationId::new(), UserId::new());
        let t0 = Instant::now();

        tracker.start(conv, user, t0);
        tracker.start(conv, user, t0 + Duration::from_secs(3));

        assert!(tracker.sweep(t0 + Duration::from_secs(7)).is_empty());
        assert!(tracker.is_typing(conv, user));

        // Worst case: a sweep lands one interval after the timeout elapsed.
        let expired = tracker.sweep(t0 + Duration::from_secs(3) + timeout + sweep_every);
        assert_eq!(expired, vec![(conv, user)]);
        assert!(!tracker.is_typing(conv, user));
    }

    #[test]
    fn purge_user_reports_conversations() {
        let tracker = TypingTracker::new(Duration::from_secs(5));
        let user = UserId::new();
        let other = UserId::new();
        let (a, b) = (ConversationId::new(), ConversationId::new());
        let now = Instant::now();
        tracker.start(a, user, now);
        tracker.start(b, user, now);
        tracker.start(b, other, now);

        let mut purged = tracker.purge_user(user);
        purged.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(purged, expected);
        assert!(tracker.is_typing(b, other));
    }
}
