//! CRUD operations for [`Conversation`] records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use hearth_shared::models::{Conversation, ConversationUpdate, Message, Participant};
use hearth_shared::types::{ConversationId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::messages::insert_message_in;
use crate::participants::upsert_participant_in;
use crate::rows::{enum_col, not_found, opt_ts, opt_ts_col, ts, ts_col, uuid_col};

const CONVERSATION_COLUMNS: &str = "c.id, c.kind, c.title, c.description, c.avatar_url, \
     c.is_public, c.is_encrypted, c.moderation_enabled, c.ai_scan_enabled, c.created_by, \
     c.created_at, c.updated_at, c.last_message_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a conversation together with its initial participants and an
    /// optional opening message, atomically.
    pub fn create_conversation(
        &self,
        conversation: &Conversation,
        participants: &[Participant],
        opening: Option<&Message>,
    ) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;

        tx.execute(
            "INSERT INTO conversations (id, kind, title, description, avatar_url, is_public,
                 is_encrypted, moderation_enabled, ai_scan_enabled, created_by, created_at,
                 updated_at, last_message_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                conversation.id.to_string(),
                conversation.kind.as_ref(),
                conversation.title,
                conversation.description,
                conversation.avatar_url,
                conversation.is_public,
                conversation.is_encrypted,
                conversation.moderation_enabled,
                conversation.ai_scan_enabled,
                conversation.created_by.to_string(),
                ts(&conversation.created_at),
                ts(&conversation.updated_at),
                opt_ts(&conversation.last_message_at),
            ],
        )?;

        for participant in participants {
            upsert_participant_in(&tx, participant)?;
        }
        if let Some(message) = opening {
            insert_message_in(&tx, message)?;
        }

        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single conversation by id.
    pub fn get_conversation(&self, id: ConversationId) -> Result<Conversation> {
        self.conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"),
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(not_found)
    }

    /// The direct conversation in which both users are active, if any.
    /// The pair is unordered.
    pub fn find_direct_conversation(&self, a: UserId, b: UserId) -> Result<Option<Conversation>> {
        let found = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {CONVERSATION_COLUMNS}
                     FROM conversations c
                     JOIN participants pa ON pa.conversation_id = c.id
                          AND pa.user_id = ?1 AND pa.left_at IS NULL
                     JOIN participants pb ON pb.conversation_id = c.id
                          AND pb.user_id = ?2 AND pb.left_at IS NULL
                     WHERE c.kind = 'direct'
                     ORDER BY c.created_at ASC
                     LIMIT 1"
                ),
                params![a.to_string(), b.to_string()],
                row_to_conversation,
            )
            .optional()?;
        Ok(found)
    }

    /// Conversations `user` actively participates in, most recent activity
    /// first.
    pub fn list_conversations_for_user(&self, user: UserId) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS}
             FROM conversations c
             JOIN participants p ON p.conversation_id = c.id
             WHERE p.user_id = ?1 AND p.left_at IS NULL
             ORDER BY COALESCE(c.last_message_at, c.created_at) DESC"
        ))?;

        let rows = stmt.query_map(params![user.to_string()], row_to_conversation)?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Apply a partial settings update and return the updated row. The
    /// optional message (usually a system notice) is written in the same
    /// transaction.
    pub fn update_conversation(
        &self,
        id: ConversationId,
        update: &ConversationUpdate,
        at: DateTime<Utc>,
        notice: Option<&Message>,
    ) -> Result<Conversation> {
        let tx = self.conn().unchecked_transaction()?;

        let mut conversation = tx
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"),
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(not_found)?;

        update.apply_to(&mut conversation);
        conversation.updated_at = at;

        tx.execute(
            "UPDATE conversations SET title = ?2, description = ?3, avatar_url = ?4,
                 is_public = ?5, is_encrypted = ?6, moderation_enabled = ?7,
                 ai_scan_enabled = ?8, updated_at = ?9
             WHERE id = ?1",
            params![
                id.to_string(),
                conversation.title,
                conversation.description,
                conversation.avatar_url,
                conversation.is_public,
                conversation.is_encrypted,
                conversation.moderation_enabled,
                conversation.ai_scan_enabled,
                ts(&at),
            ],
        )?;

        if let Some(message) = notice {
            insert_message_in(&tx, message)?;
        }

        tx.commit()?;
        Ok(conversation)
    }

    /// Record that a message was just accepted. Never moves the
    /// timestamp backwards.
    pub fn touch_conversation(&self, id: ConversationId, at: DateTime<Utc>) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE conversations
             SET last_message_at = ?2
             WHERE id = ?1 AND (last_message_at IS NULL OR last_message_at < ?2)",
            params![id.to_string(), ts(&at)],
        )?;
        if affected == 0 {
            // Either unknown or already newer; distinguish for the caller.
            self.get_conversation(id)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Conversation`].
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: ConversationId(uuid_col(row, 0)?),
        kind: enum_col(row, 1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        avatar_url: row.get(4)?,
        is_public: row.get(5)?,
        is_encrypted: row.get(6)?,
        moderation_enabled: row.get(7)?,
        ai_scan_enabled: row.get(8)?,
        created_by: UserId(uuid_col(row, 9)?),
        created_at: ts_col(row, 10)?,
        updated_at: ts_col(row, 11)?,
        last_message_at: opt_ts_col(row, 12)?,
    })
}
