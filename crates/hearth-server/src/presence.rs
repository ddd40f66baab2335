//! Live connectivity per user.
//!
//! Each user is bound to at most one connection. A newer connection replaces
//! the binding, and a late disconnect of the replaced connection must not
//! mark the user offline.

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use hearth_shared::protocol::PresenceView;
use hearth_shared::types::{ConnectionId, PresenceStatus, UserId};

#[derive(Debug, Clone)]
struct PresenceEntry {
    connection: Option<ConnectionId>,
    status: PresenceStatus,
    last_active: DateTime<Utc>,
    custom_status: Option<String>,
}

impl PresenceEntry {
    fn view(&self, user_id: UserId) -> PresenceView {
        PresenceView {
            user_id,
            status: self.status,
            last_active: self.last_active,
            custom_status: self.custom_status.clone(),
        }
    }
}

#[derive(Default)]
pub struct PresenceRegistry {
    entries: DashMap<UserId, PresenceEntry>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `connection` to `user` and mark them online. Returns the
    /// connection that was bound before, if any.
    pub fn register(
        &self,
        user: UserId,
        connection: ConnectionId,
        at: DateTime<Utc>,
    ) -> (Option<ConnectionId>, PresenceView) {
        let mut entry = self.entries.entry(user).or_insert_with(|| PresenceEntry {
            connection: None,
            status: PresenceStatus::Online,
            last_active: at,
            custom_status: None,
        });
        let previous = entry.connection.replace(connection);
        entry.status = PresenceStatus::Online;
        entry.last_active = at;
        (previous, entry.view(user))
    }

    /// Mark `user` offline if `connection` is still their bound connection.
    pub fn unregister(
        &self,
        user: UserId,
        connection: ConnectionId,
        at: DateTime<Utc>,
    ) -> Option<PresenceView> {
        let mut entry = self.entries.get_mut(&user)?;
        if entry.connection != Some(connection) {
            return None;
        }
        entry.connection = None;
        entry.status = PresenceStatus::Offline;
        entry.last_active = at;
        Some(entry.view(user))
    }

    /// Update a connected user's status. `None` when the user has no live
    /// connection.
    pub fn set_status(
        &self,
        user: UserId,
        status: PresenceStatus,
        custom_status: Option<String>,
        at: DateTime<Utc>,
    ) -> Option<PresenceView> {
        let mut entry = self.entries.get_mut(&user)?;
        entry.connection?;
        entry.status = status;
        entry.custom_status = custom_status;
        entry.last_active = at;
        Some(entry.view(user))
    }

    pub fn touch(&self, user: UserId, at: DateTime<Utc>) {
        if let Some(mut entry) = self.entries.get_mut(&user) {
            entry.last_active = at;
        }
    }

    pub fn connection_of(&self, user: UserId) -> Option<ConnectionId> {
        self.entries.get(&user).and_then(|e| e.connection)
    }

    pub fn is_online(&self, user: UserId) -> bool {
        self.connection_of(user).is_some()
    }

    pub fn online_count(&self) -> usize {
        self.entries.iter().filter(|e| e.connection.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_connection_replaces_binding() {
        let presence = PresenceRegistry::new();
        let user = UserId::new();
        let (first, second) = (ConnectionId::new(), ConnectionId::new());

        assert_eq!(presence.register(user, first, Utc::now()).0, None);
        assert_eq!(presence.register(user, second, Utc::now()).0, Some(first));

        // The stale connection closing must not take the user offline.
        assert!(presence.unregister(user, first, Utc::now()).is_none());
        assert!(presence.is_online(user));

        let view = presence.unregister(user, second, Utc::now()).unwrap();
        assert_eq!(view.status, PresenceStatus::Offline);
        assert!(!presence.is_online(user));
        assert_eq!(presence.online_count(), 0);
    }

    #[test]
    fn status_requires_live_connection() {
        let presence = PresenceRegistry::new();
        let user = UserId::new();
        assert!(presence
            .set_status(user, PresenceStatus::Busy, None, Utc::now())
            .is_none());

        let conn = ConnectionId::new();
        presence.register(user, conn, Utc::now());
        let view = presence
            .set_status(user, PresenceStatus::Away, Some("viewing flats".into()), Utc::now())
            .unwrap();
        assert_eq!(view.status, PresenceStatus::Away);
        assert_eq!(view.custom_status.as_deref(), Some("viewing flats"));

        presence.unregister(user, conn, Utc::now());
        assert!(presence
            .set_status(user, PresenceStatus::Online, None, Utc::now())
            .is_none());
    }
}
