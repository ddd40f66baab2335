use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use hearth_shared::protocol::ServerEvent;
use hearth_shared::types::{ConnectionId, ConversationId, UserId};

/// Outbound queue of one connection. Bounded: a full queue drops events.
pub type Outbound = mpsc::Sender<Arc<ServerEvent>>;

/// Per-connection outbound queue depth.
pub const OUTBOUND_QUEUE: usize = 256;

/// Resolves when the hub drops a connection that is still open, i.e. it was
/// superseded by a newer sign-in. The transport should close the socket.
pub type Evicted = oneshot::Receiver<()>;

struct ConnectionHandle {
    user: Option<UserId>,
    tx: Outbound,
    evict: Option<oneshot::Sender<()>>,
}

/// Live connections and the per-conversation rooms they are subscribed to.
///
/// Every send is a non-blocking `try_send`, so callers may broadcast while
/// holding an ordering lock.
#[derive(Default)]
pub struct Hub {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    rooms: RwLock<HashMap<ConversationId, HashSet<ConnectionId>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: ConnectionId, tx: Outbound) -> Evicted {
        let (evict, evicted) = oneshot::channel();
        self.connections.insert(
            connection,
            ConnectionHandle {
                user: None,
                tx,
                evict: Some(evict),
            },
        );
        evicted
    }

    pub fn bind_user(&self, connection: ConnectionId, user: UserId) {
        if let Some(mut handle) = self.connections.get_mut(&connection) {
            handle.user = Some(user);
        }
    }

    /// Forget a connection and leave every room. Returns the rooms it was in.
    pub fn unregister(&self, connection: ConnectionId) -> Vec<ConversationId> {
        self.connections.remove(&connection);
        self.leave_all(connection)
    }

    /// Drop a connection that is still open and signal its transport.
    /// Returns `false` if it was already gone.
    pub fn evict(&self, connection: ConnectionId) -> bool {
        let Some((_, mut handle)) = self.connections.remove(&connection) else {
            return false;
        };
        self.leave_all(connection);
        if let Some(evict) = handle.evict.take() {
            let _ = evict.send(());
        }
        debug!(connection = %connection, "Connection evicted");
        true
    }

    /// Undo `bind_user` and every room join. The connection stays registered.
    pub fn unbind(&self, connection: ConnectionId) {
        if let Some(mut handle) = self.connections.get_mut(&connection) {
            handle.user = None;
        }
        self.leave_all(connection);
    }

    fn leave_all(&self, connection: ConnectionId) -> Vec<ConversationId> {
        let mut rooms = self.rooms.write();
        let mut left = Vec::new();
        rooms.retain(|conversation, members| {
            if members.remove(&connection) {
                left.push(*conversation);
            }
            !members.is_empty()
        });
        left
    }

    pub fn join(&self, conversation: ConversationId, connection: ConnectionId) {
        let mut rooms = self.rooms.write();
        let members = rooms.entry(conversation).or_default();
        if members.insert(connection) {
            debug!(
                conversation = %conversation,
                connection = %connection,
                members = members.len(),
                "Connection joined room"
            );
        }
    }

    pub fn leave(&self, conversation: ConversationId, connection: ConnectionId) {
        let mut rooms = self.rooms.write();
        let now_empty = match rooms.get_mut(&conversation) {
            Some(members) => {
                members.remove(&connection);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            rooms.remove(&conversation);
        }
    }

    /// Subscribe every live connection of `user` to the room.
    pub fn join_user(&self, conversation: ConversationId, user: UserId) -> usize {
        let connections = self.connections_of(user);
        for connection in &connections {
            self.join(conversation, *connection);
        }
        connections.len()
    }

    pub fn leave_user(&self, conversation: ConversationId, user: UserId) {
        for connection in self.connections_of(user) {
            self.leave(conversation, connection);
        }
    }

    pub fn connections_of(&self, user: UserId) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .filter(|entry| entry.value().user == Some(user))
            .map(|entry| *entry.key())
            .collect()
    }

    /// Enqueue for one connection. Returns `false` if it is gone or its
    /// queue is full.
    pub fn send_to(&self, connection: ConnectionId, event: Arc<ServerEvent>) -> bool {
        let Some(handle) = self.connections.get(&connection) else {
            return false;
        };
        if handle.tx.try_send(event).is_err() {
            debug!(connection = %connection, "Dropping event for slow connection");
            return false;
        }
        true
    }

    pub fn send_to_user(&self, user: UserId, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        self.connections_of(user)
            .into_iter()
            .filter(|connection| self.send_to(*connection, event.clone()))
            .count()
    }

    /// Fan out to every connection in the room except `exclude`.
    pub fn broadcast(
        &self,
        conversation: ConversationId,
        event: ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let members: Vec<ConnectionId> = match self.rooms.read().get(&conversation) {
            Some(members) => members.iter().copied().collect(),
            None => return 0,
        };

        let event = Arc::new(event);
        members
            .into_iter()
            .filter(|connection| Some(*connection) != exclude)
            .filter(|connection| self.send_to(*connection, event.clone()))
            .count()
    }

    #[cfg(test)]
    pub fn room_members(&self, conversation: ConversationId) -> Vec<ConnectionId> {
        self.rooms
            .read()
            .get(&conversation)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn log_stats(&self) {
        info!(
            connections = self.connections.len(),
            rooms = self.rooms.read().len(),
            "Hub stats"
        );
    }
}
