//! Live connections: authentication, per-event dispatch and the WebSocket
//! transport.
//!
//! Events are dispatched on lanes keyed by the conversation they target.
//! Events on one lane run in arrival order, so a client sees replies for a
//! conversation in request order, while a slow operation in one
//! conversation never holds up another. Every operation runs on its own
//! task and completes even if the connection drops mid-flight.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use hearth_shared::protocol::{ClientEvent, ServerEvent};
use hearth_shared::types::{ConnectionId, ConversationId, UserId};

use crate::api::AppState;
use crate::engine::{Caller, CreateConversation, MessagingEngine, SendMessage};
use crate::error::ServerError;
use crate::hub::{Evicted, Outbound, OUTBOUND_QUEUE};
use crate::rate_limit::RateLimiter;

/// Events that target no single conversation share the `None` lane.
type Lane = Option<ConversationId>;

/// One live connection's protocol state.
pub struct Session {
    engine: MessagingEngine,
    limiter: RateLimiter<UserId>,
    connection: ConnectionId,
    tx: Outbound,
    caller: Option<Caller>,
    lanes: HashMap<Lane, JoinHandle<()>>,
}

impl Session {
    /// Register a new connection with the hub. It receives nothing but
    /// direct replies until it authenticates.
    pub fn open(
        engine: MessagingEngine,
        limiter: RateLimiter<UserId>,
        tx: Outbound,
    ) -> (Self, Evicted) {
        let connection = ConnectionId::new();
        let evicted = engine.hub().register(connection, tx.clone());
        let session = Self {
            engine,
            limiter,
            connection,
            tx,
            caller: None,
            lanes: HashMap::new(),
        };
        (session, evicted)
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn is_authenticated(&self) -> bool {
        self.caller.is_some()
    }

    /// Handle one raw text frame.
    pub async fn handle_text(&mut self, text: &str) {
        match ClientEvent::parse(text) {
            Ok(event) => self.handle(event).await,
            Err(e) => {
                debug!(connection = %self.connection, error = %e, "Malformed event");
                self.reply(ServerError::from(e).to_event("unknown"));
            }
        }
    }

    /// Authentication completes before this returns. Any other event is
    /// queued on its lane and answered through the outbound queue.
    pub async fn handle(&mut self, event: ClientEvent) {
        let name = event.name();

        if let ClientEvent::Authenticate {
            user_id,
            credential,
        } = event
        {
            self.authenticate(user_id, credential).await;
            return;
        }

        let Some(caller) = self.caller.clone() else {
            self.reply(
                ServerError::Authentication("authenticate first".into()).to_event(name),
            );
            return;
        };

        if !self.limiter.check(caller.id()) {
            warn!(user = %caller.id(), event = name, "Event rate limit exceeded");
            self.reply(ServerError::RateLimited.to_event(name));
            return;
        }
        self.engine.presence().touch(caller.id(), Utc::now());

        self.lanes.retain(|_, task| !task.is_finished());
        let lane = event.conversation_id();
        let ahead = self.lanes.remove(&lane);
        let engine = self.engine.clone();
        let tx = self.tx.clone();
        let connection = self.connection;

        let task = tokio::spawn(async move {
            if let Some(ahead) = ahead {
                // Its outcome was already delivered; only the ordering matters.
                let _ = ahead.await;
            }
            let outcome = AssertUnwindSafe(dispatch(&engine, &caller, event))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ServerError::Internal("event handler panicked".into())));
            deliver(&tx, connection, name, outcome);
        });
        self.lanes.insert(lane, task);
    }

    async fn authenticate(&mut self, user_id: UserId, credential: String) {
        if self.caller.is_some() {
            self.reply(
                ServerError::Validation("connection is already authenticated".into())
                    .to_event("authenticate"),
            );
            return;
        }

        let engine = self.engine.clone();
        let connection = self.connection;
        let task =
            tokio::spawn(async move { engine.connect(connection, user_id, &credential).await });
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(ServerError::Internal(format!("authentication task failed: {e}"))),
        };

        match outcome {
            Ok((caller, conversations)) => {
                self.reply(ServerEvent::Authenticated {
                    user: caller.user.clone(),
                    conversations,
                });
                self.caller = Some(caller);
            }
            Err(ServerError::Authentication(reason)) => {
                debug!(connection = %connection, user = %user_id, "Authentication refused");
                self.reply(ServerEvent::AuthenticationError { reason });
            }
            Err(e) => {
                warn!(connection = %connection, user = %user_id, error = %e, "Authentication failed");
                self.reply(e.to_event("authenticate"));
            }
        }
    }

    pub fn reply(&self, event: ServerEvent) {
        queue(&self.tx, self.connection, event);
    }

    /// Tear the connection down: presence, typing and room membership.
    /// Operations still on a lane run to completion.
    pub async fn close(self) {
        let user = self.caller.as_ref().map(Caller::id);
        self.engine.disconnect(self.connection, user).await;
    }
}

/// Queue a direct reply. Dropped if the outbound queue is full.
fn queue(tx: &Outbound, connection: ConnectionId, event: ServerEvent) {
    if tx.try_send(Arc::new(event)).is_err() {
        debug!(connection = %connection, "Reply dropped");
    }
}

fn deliver(
    tx: &Outbound,
    connection: ConnectionId,
    name: &'static str,
    outcome: Result<Option<ServerEvent>, ServerError>,
) {
    match outcome {
        Ok(Some(reply)) => queue(tx, connection, reply),
        Ok(None) => {}
        Err(e) => {
            match &e {
                ServerError::Store(_) | ServerError::Internal(_) | ServerError::Dependency(_) => {
                    warn!(connection = %connection, event = name, error = %e, "Event failed")
                }
                _ => debug!(connection = %connection, event = name, error = %e, "Event rejected"),
            }
            queue(tx, connection, e.to_event(name));
        }
    }
}

/// Route an authenticated event. Returns the direct reply, if the
/// operation has one beyond its broadcasts.
async fn dispatch(
    engine: &MessagingEngine,
    caller: &Caller,
    event: ClientEvent,
) -> Result<Option<ServerEvent>, ServerError> {
    match event {
        ClientEvent::Authenticate { .. } => Err(ServerError::Validation(
            "connection is already authenticated".into(),
        )),

        ClientEvent::GetConversations => Ok(Some(ServerEvent::Conversations {
            conversations: engine.conversations(caller.id()).await?,
        })),

        ClientEvent::GetMessages {
            conversation_id,
            limit,
            before,
        } => {
            let (messages, has_more) = engine
                .messages(caller, conversation_id, limit, before)
                .await?;
            Ok(Some(ServerEvent::Messages {
                conversation_id,
                messages,
                has_more,
            }))
        }

        ClientEvent::SendMessage {
            conversation_id,
            content,
            media,
            reply_to,
            client_ref,
        } => {
            // The engine acknowledges with `message_sent` itself.
            engine
                .send_message(
                    caller,
                    SendMessage {
                        conversation_id,
                        content,
                        media,
                        reply_to,
                        client_ref,
                    },
                )
                .await?;
            Ok(None)
        }

        ClientEvent::EditMessage {
            conversation_id,
            message_id,
            content,
        } => {
            let message = engine
                .edit_message(caller, conversation_id, message_id, content)
                .await?;
            Ok(Some(ServerEvent::MessageUpdated { message }))
        }

        ClientEvent::DeleteMessage {
            conversation_id,
            message_id,
        } => {
            engine
                .delete_message(caller, conversation_id, message_id)
                .await?;
            Ok(Some(ServerEvent::MessageDeleted {
                conversation_id,
                message_id,
            }))
        }

        ClientEvent::CreateConversation {
            kind,
            participant_ids,
            title,
            description,
            avatar_url,
            is_public,
            is_encrypted,
        } => {
            let conversation = engine
                .create_conversation(
                    caller,
                    CreateConversation {
                        kind,
                        participant_ids,
                        title,
                        description,
                        avatar_url,
                        is_public,
                        is_encrypted,
                    },
                )
                .await?;
            Ok(Some(ServerEvent::ConversationCreated { conversation }))
        }

        ClientEvent::AddParticipants {
            conversation_id,
            user_ids,
        } => {
            engine
                .add_participants(caller, conversation_id, user_ids)
                .await?;
            Ok(None)
        }

        ClientEvent::RemoveParticipant {
            conversation_id,
            user_id,
        } => {
            engine
                .remove_participant(caller, conversation_id, user_id)
                .await?;
            Ok(None)
        }

        ClientEvent::UpdateConversation {
            conversation_id,
            changes,
        } => {
            engine
                .update_conversation(caller, conversation_id, changes)
                .await?;
            Ok(None)
        }

        // The caller has left the room, so confirm directly.
        ClientEvent::LeaveConversation { conversation_id } => {
            engine.leave_conversation(caller, conversation_id).await?;
            Ok(Some(ServerEvent::ParticipantLeft {
                conversation_id,
                user_id: caller.id(),
            }))
        }

        ClientEvent::TypingStart { conversation_id } => {
            engine.typing_start(caller, conversation_id).await?;
            Ok(None)
        }

        ClientEvent::TypingStop { conversation_id } => {
            engine.typing_stop(caller, conversation_id).await?;
            Ok(None)
        }

        ClientEvent::MarkRead { conversation_id } => {
            engine.mark_read(caller, conversation_id).await?;
            Ok(None)
        }

        ClientEvent::AddReaction {
            conversation_id,
            message_id,
            reaction,
        } => {
            engine
                .add_reaction(caller, conversation_id, message_id, &reaction)
                .await?;
            Ok(None)
        }

        ClientEvent::RemoveReaction {
            conversation_id,
            message_id,
            reaction,
        } => {
            engine
                .remove_reaction(caller, conversation_id, message_id, &reaction)
                .await?;
            Ok(None)
        }

        ClientEvent::SetStatus {
            status,
            custom_status,
        } => {
            engine.set_status(caller, status, custom_status).await?;
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let auth_timeout = state.config.auth_timeout;
    ws.on_upgrade(move |socket| {
        run_socket(socket, state.engine.clone(), state.event_limiter.clone(), auth_timeout)
    })
}

/// Drive one socket until the client leaves, fails to authenticate in
/// time or is superseded by a newer connection of the same user.
async fn run_socket(
    socket: WebSocket,
    engine: MessagingEngine,
    limiter: RateLimiter<UserId>,
    auth_timeout: Duration,
) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<ServerEvent>>(OUTBOUND_QUEUE);
    let (mut session, mut evicted) = Session::open(engine, limiter, tx);
    let connection = session.connection();
    debug!(connection = %connection, "Socket opened");

    // Ends once every sender is gone: the session's and the hub's.
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode event");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let deadline = tokio::time::sleep(auth_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline, if !session.is_authenticated() => {
                debug!(connection = %connection, "Authentication timed out");
                session.reply(ServerEvent::AuthenticationError {
                    reason: "authentication timed out".into(),
                });
                break;
            }
            _ = &mut evicted => {
                debug!(connection = %connection, "Connection superseded by a newer sign-in");
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => session.handle_text(&text).await,
                Some(Ok(WsMessage::Binary(_))) => session.reply(
                    ServerError::Validation("binary frames are not supported".into())
                        .to_event("unknown"),
                ),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %connection, error = %e, "Socket error");
                    break;
                }
            },
        }
    }

    session.close().await;
    let _ = writer.await;
    debug!(connection = %connection, "Socket closed");
}
