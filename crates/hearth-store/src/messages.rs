use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use hearth_shared::models::{MediaDescriptor, Message, SecurityDetails};
use hearth_shared::types::{ConversationId, MessageId, MessageStatus, SecurityStatus, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::rows::{enum_col, not_found, opt_u32_col, opt_uuid_col, ts, ts_col, uuid_col};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, reply_to_id, kind, content, \
     media_url, thumbnail_url, mime_type, file_name, file_size, width, height, duration_secs, \
     security_status, security_details, status, sent_at, created_at, updated_at";

/// Insert a message row and its initial read receipts.
pub(crate) fn insert_message_in(conn: &Connection, message: &Message) -> Result<()> {
    let media = message.media.clone().unwrap_or_default();
    let details = message
        .security_details
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, reply_to_id, kind, content,
             media_url, thumbnail_url, mime_type, file_name, file_size, width, height,
             duration_secs, security_status, security_details, status, sent_at, created_at,
             updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19, ?20)",
        params![
            message.id.to_string(),
            message.conversation_id.to_string(),
            message.sender_id.to_string(),
            message.reply_to.map(|r| r.to_string()),
            message.kind.as_ref(),
            message.content,
            media.url,
            media.thumbnail_url,
            media.mime_type,
            media.file_name,
            media.size.map(|s| s as i64),
            media.width,
            media.height,
            media.duration_secs,
            message.security_status.as_ref(),
            details,
            message.status.as_ref(),
            ts(&message.sent_at),
            ts(&message.created_at),
            ts(&message.updated_at),
        ],
    )?;

    for receipt in &message.read_by {
        conn.execute(
            "INSERT OR IGNORE INTO read_receipts (message_id, user_id, read_at)
             VALUES (?1, ?2, ?3)",
            params![
                message.id.to_string(),
                receipt.user_id.to_string(),
                ts(&receipt.read_at),
            ],
        )?;
    }
    Ok(())
}

impl Database {
    pub fn insert_message(&self, message: &Message) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        insert_message_in(&tx, message)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        let mut message = self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(not_found)?;
        self.attach_receipts(std::slice::from_mut(&mut message))?;
        Ok(message)
    }

    /// The newest `limit` messages of a conversation, returned oldest
    /// first. With `before`, only messages accepted before that message.
    pub fn list_recent_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE conversation_id = ?1
               AND (?2 IS NULL OR seq < (SELECT seq FROM messages WHERE id = ?2))
             ORDER BY seq DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![
                conversation_id.to_string(),
                before.map(|b| b.to_string()),
                limit
            ],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        self.attach_receipts(&mut messages)?;
        Ok(messages)
    }

    /// Latest message that is not blocked, for conversation summaries.
    pub fn last_message(&self, conversation_id: ConversationId) -> Result<Option<Message>> {
        let message = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE conversation_id = ?1 AND security_status != 'blocked'
                     ORDER BY seq DESC LIMIT 1"
                ),
                params![conversation_id.to_string()],
                row_to_message,
            )
            .optional()?;

        match message {
            Some(mut m) => {
                self.attach_receipts(std::slice::from_mut(&mut m))?;
                Ok(Some(m))
            }
            None => Ok(None),
        }
    }

    /// Replace the text of a live message. Returns `false` if the message
    /// is missing or deleted.
    pub fn update_message_content(
        &self,
        id: MessageId,
        content: &str,
        security_status: SecurityStatus,
        details: Option<&SecurityDetails>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let details = details.map(serde_json::to_string).transpose()?;
        let affected = self.conn().execute(
            "UPDATE messages SET content = ?2, security_status = ?3, security_details = ?4,
                 updated_at = ?5
             WHERE id = ?1 AND status = 'sent'",
            params![
                id.to_string(),
                content,
                security_status.as_ref(),
                details,
                ts(&at)
            ],
        )?;
        Ok(affected > 0)
    }

    /// Mark a message deleted. The row and its receipts stay.
    pub fn soft_delete_message(&self, id: MessageId, at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status = 'sent'",
            params![id.to_string(), MessageStatus::Deleted.as_ref(), ts(&at)],
        )?;
        Ok(affected > 0)
    }

    /// Apply a moderation verdict only if it is more severe than the
    /// current one and the message is still live. Safe to repeat.
    pub fn escalate_security_status(
        &self,
        id: MessageId,
        status: SecurityStatus,
        details: &SecurityDetails,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let replaceable = status.replaceable();
        if replaceable.is_empty() {
            return Ok(false);
        }

        let placeholders = (0..replaceable.len())
            .map(|i| format!("?{}", i + 5))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE messages SET security_status = ?2, security_details = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'sent' AND security_status IN ({placeholders})"
        );

        let mut values: Vec<String> = vec![
            id.to_string(),
            status.as_ref().to_string(),
            serde_json::to_string(details)?,
            ts(&at),
        ];
        values.extend(replaceable.iter().map(|s| s.as_ref().to_string()));

        let affected = self
            .conn()
            .execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        Ok(affected > 0)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let media = MediaDescriptor {
        url: row.get(6)?,
        thumbnail_url: row.get(7)?,
        mime_type: row.get(8)?,
        file_name: row.get(9)?,
        size: row.get::<_, Option<i64>>(10)?.and_then(|s| u64::try_from(s).ok()),
        width: opt_u32_col(row, 11)?,
        height: opt_u32_col(row, 12)?,
        duration_secs: opt_u32_col(row, 13)?,
    };
    let media = (media != MediaDescriptor::default()).then_some(media);

    let details: Option<String> = row.get(15)?;
    let security_details = details
        .map(|raw| serde_json::from_str::<SecurityDetails>(&raw))
        .transpose()
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(15, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Message {
        id: MessageId(uuid_col(row, 0)?),
        conversation_id: ConversationId(uuid_col(row, 1)?),
        sender_id: UserId(uuid_col(row, 2)?),
        reply_to: opt_uuid_col(row, 3)?.map(MessageId),
        kind: enum_col(row, 4)?,
        content: row.get(5)?,
        media,
        security_status: enum_col(row, 14)?,
        security_details,
        status: enum_col(row, 16)?,
        read_by: Vec::new(),
        sent_at: ts_col(row, 17)?,
        created_at: ts_col(row, 18)?,
        updated_at: ts_col(row, 19)?,
    })
}
