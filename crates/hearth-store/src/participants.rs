//! Participant rows. Leaving is a soft operation: `left_at` is set and the
//! row stays for history.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use hearth_shared::models::{Message, Participant, Permissions};
use hearth_shared::types::{ConversationId, ParticipantRole, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::messages::insert_message_in;
use crate::rows::{enum_col, opt_ts, opt_ts_col, ts, ts_col, uuid_col};

const PARTICIPANT_COLUMNS: &str = "conversation_id, user_id, role, can_send_messages, \
     can_add_participants, can_remove_participants, can_edit_settings, joined_at, left_at";

/// Insert a participant, reactivating a previous row for the same user.
pub(crate) fn upsert_participant_in(conn: &Connection, p: &Participant) -> Result<()> {
    conn.execute(
        "INSERT INTO participants (conversation_id, user_id, role, can_send_messages,
             can_add_participants, can_remove_participants, can_edit_settings, joined_at, left_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(conversation_id, user_id) DO UPDATE SET
             role                    = excluded.role,
             can_send_messages       = excluded.can_send_messages,
             can_add_participants    = excluded.can_add_participants,
             can_remove_participants = excluded.can_remove_participants,
             can_edit_settings       = excluded.can_edit_settings,
             joined_at               = excluded.joined_at,
             left_at                 = excluded.left_at",
        params![
            p.conversation_id.to_string(),
            p.user_id.to_string(),
            p.role.as_ref(),
            p.permissions.can_send_messages,
            p.permissions.can_add_participants,
            p.permissions.can_remove_participants,
            p.permissions.can_edit_settings,
            ts(&p.joined_at),
            opt_ts(&p.left_at),
        ],
    )?;
    Ok(())
}

impl Database {
    /// Add (or re-add) participants, with an optional notice written in the
    /// same transaction.
    pub fn add_participants(
        &self,
        participants: &[Participant],
        notice: Option<&Message>,
    ) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        for participant in participants {
            upsert_participant_in(&tx, participant)?;
        }
        if let Some(message) = notice {
            insert_message_in(&tx, message)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<Participant>> {
        let found = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {PARTICIPANT_COLUMNS} FROM participants
                     WHERE conversation_id = ?1 AND user_id = ?2"
                ),
                params![conversation_id.to_string(), user_id.to_string()],
                row_to_participant,
            )
            .optional()?;
        Ok(found)
    }

    /// All participant rows (active and former), earliest joiner first.
    pub fn list_participants(&self, conversation_id: ConversationId) -> Result<Vec<Participant>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants
             WHERE conversation_id = ?1
             ORDER BY joined_at ASC, rowid ASC"
        ))?;

        let rows = stmt.query_map(params![conversation_id.to_string()], row_to_participant)?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(row?);
        }
        Ok(participants)
    }

    /// Set `left_at` for an active participant. Returns `false` when the user
    /// was not active. The notice is only written when a row changed.
    pub fn soft_remove_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        at: DateTime<Utc>,
        notice: Option<&Message>,
    ) -> Result<bool> {
        let tx = self.conn().unchecked_transaction()?;
        let affected = tx.execute(
            "UPDATE participants SET left_at = ?3
             WHERE conversation_id = ?1 AND user_id = ?2 AND left_at IS NULL",
            params![conversation_id.to_string(), user_id.to_string(), ts(&at)],
        )?;
        if affected > 0 {
            if let Some(message) = notice {
                insert_message_in(&tx, message)?;
            }
        }
        tx.commit()?;
        Ok(affected > 0)
    }

    /// Make an active participant an admin with every capability.
    pub fn promote_participant(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<bool> {
        let all = Permissions::admin();
        let affected = self.conn().execute(
            "UPDATE participants SET role = ?3, can_send_messages = ?4,
                 can_add_participants = ?5, can_remove_participants = ?6, can_edit_settings = ?7
             WHERE conversation_id = ?1 AND user_id = ?2 AND left_at IS NULL",
            params![
                conversation_id.to_string(),
                user_id.to_string(),
                ParticipantRole::Admin.as_ref(),
                all.can_send_messages,
                all.can_add_participants,
                all.can_remove_participants,
                all.can_edit_settings,
            ],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_participant(row: &rusqlite::Row<'_>) -> rusqlite::Result<Participant> {
    Ok(Participant {
        conversation_id: ConversationId(uuid_col(row, 0)?),
        user_id: UserId(uuid_col(row, 1)?),
        role: enum_col(row, 2)?,
        permissions: Permissions {
            can_send_messages: row.get(3)?,
            can_add_participants: row.get(4)?,
            can_remove_participants: row.get(5)?,
            can_edit_settings: row.get(6)?,
        },
        joined_at: ts_col(row, 7)?,
        left_at: opt_ts_col(row, 8)?,
    })
}
