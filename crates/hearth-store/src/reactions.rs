use std::collections::HashMap;

use rusqlite::params;

use hearth_shared::models::Reaction;
use hearth_shared::types::{MessageId, UserId};

use crate::database::Database;
use crate::error::Result;
use crate::rows::{ts, ts_col, uuid_col};

impl Database {
    /// Returns `false` when the (message, user, reaction) triple already
    /// existed.
    pub fn add_reaction(&self, reaction: &Reaction) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO reactions (message_id, user_id, reaction, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                reaction.message_id.to_string(),
                reaction.user_id.to_string(),
                reaction.reaction,
                ts(&reaction.created_at),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn remove_reaction(&self, message_id: MessageId, user_id: UserId, reaction: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND reaction = ?3",
            params![message_id.to_string(), user_id.to_string(), reaction],
        )?;
        Ok(affected > 0)
    }

    /// Reactions for several messages at once, oldest first per message.
    /// Messages without reactions are absent from the map.
    pub fn list_reactions(&self, message_ids: &[MessageId]) -> Result<HashMap<MessageId, Vec<Reaction>>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT message_id, user_id, reaction, created_at
             FROM reactions WHERE message_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;

        let mut map = HashMap::new();
        for id in message_ids {
            let rows = stmt.query_map(params![id.to_string()], |row| {
                Ok(Reaction {
                    message_id: MessageId(uuid_col(row, 0)?),
                    user_id: UserId(uuid_col(row, 1)?),
                    reaction: row.get(2)?,
                    created_at: ts_col(row, 3)?,
                })
            })?;

            let mut reactions = Vec::new();
            for row in rows {
                reactions.push(row?);
            }
            if !reactions.is_empty() {
                map.insert(*id, reactions);
            }
        }
        Ok(map)
    }
}
