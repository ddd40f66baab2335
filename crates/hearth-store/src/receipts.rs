//! Per-message read receipts. Receipts are only ever added, so replaying a
//! `mark_read` can never lose read state.

use chrono::{DateTime, Utc};
use rusqlite::params;

use hearth_shared::models::{Message, ReadReceipt};
use hearth_shared::types::{ConversationId, MessageId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::rows::{ts, ts_col, uuid_col};

impl Database {
    /// Append `receipt` to a message's read-by list. Returns `false` if the
    /// user had already read it.
    pub fn append_read_by(&self, message_id: MessageId, receipt: &ReadReceipt) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at)
             VALUES (?1, ?2, ?3)",
            params![
                message_id.to_string(),
                receipt.user_id.to_string(),
                ts(&receipt.read_at)
            ],
        )?;
        Ok(affected > 0)
    }

    /// Mark every message in the conversation that `user` did not send and
    /// has not read yet. Returns the ids that gained a receipt, oldest first.
    pub fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        user: UserId,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>> {
        let tx = self.conn().unchecked_transaction()?;

        let ids = {
            let mut stmt = tx.prepare(
                "SELECT m.id FROM messages m
                 WHERE m.conversation_id = ?1 AND m.sender_id != ?2
                   AND NOT EXISTS (
                       SELECT 1 FROM read_receipts r
                       WHERE r.message_id = m.id AND r.user_id = ?2)
                 ORDER BY m.seq ASC",
            )?;
            let rows = stmt.query_map(
                params![conversation_id.to_string(), user.to_string()],
                |row| uuid_col(row, 0).map(MessageId),
            )?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at)
                 VALUES (?1, ?2, ?3)",
            )?;
            let read_at = ts(&at);
            for id in &ids {
                insert.execute(params![id.to_string(), user.to_string(), read_at])?;
            }
        }

        tx.commit()?;
        Ok(ids)
    }

    /// Messages `user` has not read, not counting their own, deleted or
    /// blocked messages.
    pub fn unread_count(&self, conversation_id: ConversationId, user: UserId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages m
             WHERE m.conversation_id = ?1 AND m.sender_id != ?2
               AND m.status = 'sent' AND m.security_status != 'blocked'
               AND NOT EXISTS (
                   SELECT 1 FROM read_receipts r
                   WHERE r.message_id = m.id AND r.user_id = ?2)",
            params![conversation_id.to_string(), user.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Fill `read_by` for each message, in read order.
    pub(crate) fn attach_receipts(&self, messages: &mut [Message]) -> Result<()> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT user_id, read_at FROM read_receipts
             WHERE message_id = ?1
             ORDER BY read_at ASC, rowid ASC",
        )?;

        for message in messages.iter_mut() {
            let rows = stmt.query_map(params![message.id.to_string()], |row| {
                Ok(ReadReceipt {
                    user_id: UserId(uuid_col(row, 0)?),
                    read_at: ts_col(row, 1)?,
                })
            })?;
            let mut read_by = Vec::new();
            for row in rows {
                read_by.push(row?);
            }
            message.read_by = read_by;
        }
        Ok(())
    }
}
