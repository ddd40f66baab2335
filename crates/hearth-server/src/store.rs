//! Async persistence seam used by the engine, plus the SQLite adapter.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use hearth_shared::models::{
    Conversation, ConversationUpdate, Message, Participant, Reaction,
    SecurityDetails, UserProfile,
};
use hearth_shared::types::{ConversationId, MessageId, SecurityStatus, UserId};
use hearth_store::{Database, StoreError};

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything the messaging core reads from or writes to durable storage.
///
/// Multi-row writes (a record plus its system notice) are atomic.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // -- users --
    async fn verify_credential(&self, user: UserId, credential: &str)
        -> StoreResult<Option<UserProfile>>;
    async fn get_user(&self, user: UserId) -> StoreResult<UserProfile>;
    async fn get_users(&self, users: &[UserId]) -> StoreResult<HashMap<UserId, UserProfile>>;
    async fn upsert_user(&self, user: &UserProfile, credential: &str) -> StoreResult<()>;

    // -- conversations --
    async fn get_conversation(&self, id: ConversationId) -> StoreResult<Conversation>;
    async fn insert_conversation(
        &self,
        conversation: &Conversation,
        participants: &[Participant],
        opening: Option<&Message>,
    ) -> StoreResult<()>;
    async fn update_conversation(
        &self,
        id: ConversationId,
        update: &ConversationUpdate,
        at: DateTime<Utc>,
        notice: Option<&Message>,
    ) -> StoreResult<Conversation>;
    async fn touch_conversation(&self, id: ConversationId, at: DateTime<Utc>) -> StoreResult<()>;
    async fn find_direct_conversation(&self, a: UserId, b: UserId)
        -> StoreResult<Option<Conversation>>;
    async fn list_conversations_for_user(&self, user: UserId) -> StoreResult<Vec<Conversation>>;

    // -- participants --
    async fn list_participants(&self, id: ConversationId) -> StoreResult<Vec<Participant>>;
    async fn get_participant(&self, id: ConversationId, user: UserId)
        -> StoreResult<Option<Participant>>;
    async fn insert_participants(
        &self,
        participants: &[Participant],
        notice: Option<&Message>,
    ) -> StoreResult<()>;
    async fn soft_remove_participant(
        &self,
        id: ConversationId,
        user: UserId,
        at: DateTime<Utc>,
        notice: Option<&Message>,
    ) -> StoreResult<bool>;
    async fn promote_participant(&self, id: ConversationId, user: UserId) -> StoreResult<bool>;

    // -- messages --
    async fn insert_message(&self, message: &Message) -> StoreResult<()>;
    async fn get_message(&self, id: MessageId) -> StoreResult<Message>;
    async fn list_recent_messages(
        &self,
        id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> StoreResult<Vec<Message>>;
    async fn last_message(&self, id: ConversationId) -> StoreResult<Option<Message>>;
    async fn update_message_content(
        &self,
        id: MessageId,
        content: &str,
        status: SecurityStatus,
        details: Option<&SecurityDetails>,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;
    async fn soft_delete_message(&self, id: MessageId, at: DateTime<Utc>) -> StoreResult<bool>;
    async fn escalate_security_status(
        &self,
        id: MessageId,
        status: SecurityStatus,
        details: &SecurityDetails,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    // -- receipts --
    async fn mark_conversation_read(
        &self,
        id: ConversationId,
        user: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<MessageId>>;
    async fn unread_count(&self, id: ConversationId, user: UserId) -> StoreResult<u64>;

    // -- reactions --
    async fn add_reaction(&self, reaction: &Reaction) -> StoreResult<bool>;
    async fn remove_reaction(&self, id: MessageId, user: UserId, reaction: &str)
        -> StoreResult<bool>;
    async fn list_reactions(&self, ids: &[MessageId])
        -> StoreResult<HashMap<MessageId, Vec<Reaction>>>;
}

/// [`Store`] over a single SQLite connection. Calls run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock();
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store worker failed: {e}")))?
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn verify_credential(
        &self,
        user: UserId,
        credential: &str,
    ) -> StoreResult<Option<UserProfile>> {
        let credential = credential.to_owned();
        self.run(move |db| db.verify_credential(user, &credential)).await
    }

    async fn get_user(&self, user: UserId) -> StoreResult<UserProfile> {
        self.run(move |db| db.get_user(user)).await
    }

    async fn get_users(&self, users: &[UserId]) -> StoreResult<HashMap<UserId, UserProfile>> {
        let users = users.to_vec();
        self.run(move |db| db.get_users(&users)).await
    }

    async fn upsert_user(&self, user: &UserProfile, credential: &str) -> StoreResult<()> {
        let (user, credential) = (user.clone(), credential.to_owned());
        self.run(move |db| db.upsert_user(&user, &credential)).await
    }

    async fn get_conversation(&self, id: ConversationId) -> StoreResult<Conversation> {
        self.run(move |db| db.get_conversation(id)).await
    }

    async fn insert_conversation(
        &self,
        conversation: &Conversation,
        participants: &[Participant],
        opening: Option<&Message>,
    ) -> StoreResult<()> {
        let conversation = conversation.clone();
        let participants = participants.to_vec();
        let opening = opening.cloned();
        self.run(move |db| db.create_conversation(&conversation, &participants, opening.as_ref()))
            .await
    }

    async fn update_conversation(
        &self,
        id: ConversationId,
        update: &ConversationUpdate,
        at: DateTime<Utc>,
        notice: Option<&Message>,
    ) -> StoreResult<Conversation> {
        let update = update.clone();
        let notice = notice.cloned();
        self.run(move |db| db.update_conversation(id, &update, at, notice.as_ref()))
            .await
    }

    async fn touch_conversation(&self, id: ConversationId, at: DateTime<Utc>) -> StoreResult<()> {
        self.run(move |db| db.touch_conversation(id, at)).await
    }

    async fn find_direct_conversation(
        &self,
        a: UserId,
        b: UserId,
    ) -> StoreResult<Option<Conversation>> {
        self.run(move |db| db.find_direct_conversation(a, b)).await
    }

    async fn list_conversations_for_user(&self, user: UserId) -> StoreResult<Vec<Conversation>> {
        self.run(move |db| db.list_conversations_for_user(user)).await
    }

    async fn list_participants(&self, id: ConversationId) -> StoreResult<Vec<Participant>> {
        self.run(move |db| db.list_participants(id)).await
    }

    async fn get_participant(
        &self,
        id: ConversationId,
        user: UserId,
    ) -> StoreResult<Option<Participant>> {
        self.run(move |db| db.get_participant(id, user)).await
    }

    async fn insert_participants(
        &self,
        participants: &[Participant],
        notice: Option<&Message>,
    ) -> StoreResult<()> {
        let participants = participants.to_vec();
        let notice = notice.cloned();
        self.run(move |db| db.add_participants(&participants, notice.as_ref()))
            .await
    }

    async fn soft_remove_participant(
        &self,
        id: ConversationId,
        user: UserId,
        at: DateTime<Utc>,
        notice: Option<&Message>,
    ) -> StoreResult<bool> {
        let notice = notice.cloned();
        self.run(move |db| db.soft_remove_participant(id, user, at, notice.as_ref()))
            .await
    }

    async fn promote_participant(&self, id: ConversationId, user: UserId) -> StoreResult<bool> {
        self.run(move |db| db.promote_participant(id, user)).await
    }

    async fn insert_message(&self, message: &Message) -> StoreResult<()> {
        let message = message.clone();
        self.run(move |db| db.insert_message(&message)).await
    }

    async fn get_message(&self, id: MessageId) -> StoreResult<Message> {
        self.run(move |db| db.get_message(id)).await
    }

    async fn list_recent_messages(
        &self,
        id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> StoreResult<Vec<Message>> {
        self.run(move |db| db.list_recent_messages(id, limit, before))
            .await
    }

    async fn last_message(&self, id: ConversationId) -> StoreResult<Option<Message>> {
        self.run(move |db| db.last_message(id)).await
    }

    async fn update_message_content(
        &self,
        id: MessageId,
        content: &str,
        status: SecurityStatus,
        details: Option<&SecurityDetails>,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let content = content.to_owned();
        let details = details.cloned();
        self.run(move |db| db.update_message_content(id, &content, status, details.as_ref(), at))
            .await
    }

    async fn soft_delete_message(&self, id: MessageId, at: DateTime<Utc>) -> StoreResult<bool> {
        self.run(move |db| db.soft_delete_message(id, at)).await
    }

    async fn escalate_security_status(
        &self,
        id: MessageId,
        status: SecurityStatus,
        details: &SecurityDetails,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let details = details.clone();
        self.run(move |db| db.escalate_security_status(id, status, &details, at))
            .await
    }

    async fn mark_conversation_read(
        &self,
        id: ConversationId,
        user: UserId,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<MessageId>> {
        self.run(move |db| db.mark_conversation_read(id, user, at))
            .await
    }

    async fn unread_count(&self, id: ConversationId, user: UserId) -> StoreResult<u64> {
        self.run(move |db| db.unread_count(id, user)).await
    }

    async fn add_reaction(&self, reaction: &Reaction) -> StoreResult<bool> {
        let reaction = reaction.clone();
        self.run(move |db| db.add_reaction(&reaction)).await
    }

    async fn remove_reaction(
        &self,
        id: MessageId,
        user: UserId,
        reaction: &str,
    ) -> StoreResult<bool> {
        let reaction = reaction.to_owned();
        self.run(move |db| db.remove_reaction(id, user, &reaction))
            .await
    }

    async fn list_reactions(
        &self,
        ids: &[MessageId],
    ) -> StoreResult<HashMap<MessageId, Vec<Reaction>>> {
        let ids = ids.to_vec();
        self.run(move |db| db.list_reactions(&ids)).await
    }
}
