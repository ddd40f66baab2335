use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use hearth_shared::protocol::{ConversationSummary, ServerEvent};
use hearth_shared::types::{ConnectionId, UserId};

use super::{Caller, MessagingEngine};
use crate::error::ServerError;

impl MessagingEngine {
    /// Authenticate a registered connection: bind it to the user, mark
    /// them online and subscribe it to every active conversation. A
    /// connection the user had open before is told why and evicted.
    pub async fn connect(
        &self,
        connection: ConnectionId,
        user_id: UserId,
        credential: &str,
    ) -> Result<(Caller, Vec<ConversationSummary>), ServerError> {
        let user = self
            .inner
            .store
            .verify_credential(user_id, credential)
            .await?
            .ok_or_else(|| ServerError::Authentication("invalid credentials".into()))?;

        self.inner.hub.bind_user(connection, user.id);
        let (previous, presence) = self.inner.presence.register(user.id, connection, Utc::now());
        if let Some(previous) = previous.filter(|p| *p != connection) {
            self.inner.hub.send_to(
                previous,
                Arc::new(ServerEvent::AuthenticationError {
                    reason: "signed in from another connection".into(),
                }),
            );
            self.inner.hub.evict(previous);
            info!(user = %user.id, previous = %previous, "Superseded connection evicted");
        }

        let summaries = match self.subscribe(connection, user.id).await {
            Ok(summaries) => summaries,
            Err(e) => {
                // The connection stays unauthenticated: not online, in no room.
                self.inner.hub.unbind(connection);
                self.inner.presence.unregister(user.id, connection, Utc::now());
                return Err(e);
            }
        };

        self.broadcast_presence(presence, false).await;

        info!(
            user = %user.id,
            connection = %connection,
            conversations = summaries.len(),
            "User connected"
        );
        Ok((Caller { user, connection }, summaries))
    }

    /// Join the connection to every active conversation's room.
    async fn subscribe(
        &self,
        connection: ConnectionId,
        user: UserId,
    ) -> Result<Vec<ConversationSummary>, ServerError> {
        let conversations = self.inner.directory.conversations_for(user).await?;
        for conversation in &conversations {
            self.inner.hub.join(conversation.id, connection);
        }

        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            summaries.push(self.summary(conversation, user).await?);
        }
        Ok(summaries)
    }

    /// Tear down a connection. Presence and typing state are only cleared
    /// when this was the user's bound connection.
    pub async fn disconnect(&self, connection: ConnectionId, user: Option<UserId>) {
        self.inner.hub.unregister(connection);
        let Some(user) = user else {
            debug!(connection = %connection, "Unauthenticated connection closed");
            return;
        };

        let Some(presence) = self.inner.presence.unregister(user, connection, Utc::now()) else {
            debug!(user = %user, connection = %connection, "Superseded connection closed");
            return;
        };

        for conversation in self.inner.typing.purge_user(user) {
            self.broadcast(
                conversation,
                ServerEvent::UserTypingStopped {
                    conversation_id: conversation,
                    user_id: user,
                },
                None,
            );
        }
        self.broadcast_presence(presence, false).await;

        info!(user = %user, connection = %connection, "User disconnected");
    }
}
