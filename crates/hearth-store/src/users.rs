//! User records mirrored from the upstream user store, plus credential
//! verification for connection authentication.

use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use subtle::ConstantTimeEq;

use hearth_shared::models::UserProfile;
use hearth_shared::types::UserId;

use crate::database::Database;
use crate::error::Result;
use crate::rows::{enum_col, not_found, ts, uuid_col};

/// Credentials are never stored in clear; only their BLAKE3 digest.
fn credential_hash(credential: &str) -> String {
    hex::encode(blake3::hash(credential.as_bytes()).as_bytes())
}

impl Database {
    /// Insert or refresh a user together with its credential.
    pub fn upsert_user(&self, user: &UserProfile, credential: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, user_type, avatar_url, token_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 display_name = excluded.display_name,
                 user_type    = excluded.user_type,
                 avatar_url   = excluded.avatar_url,
                 token_hash   = excluded.token_hash",
            params![
                user.id.to_string(),
                user.display_name,
                user.user_type.as_ref(),
                user.avatar_url,
                credential_hash(credential),
                ts(&Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: UserId) -> Result<UserProfile> {
        self.conn()
            .query_row(
                "SELECT id, display_name, user_type, avatar_url FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .map_err(not_found)
    }

    /// Fetch several users at once. Unknown ids are simply absent.
    pub fn get_users(&self, ids: &[UserId]) -> Result<HashMap<UserId, UserProfile>> {
        let mut stmt = self.conn().prepare_cached(
            "SELECT id, display_name, user_type, avatar_url FROM users WHERE id = ?1",
        )?;

        let mut users = HashMap::with_capacity(ids.len());
        for id in ids {
            if users.contains_key(id) {
                continue;
            }
            if let Some(user) = stmt
                .query_row(params![id.to_string()], row_to_user)
                .optional()?
            {
                users.insert(*id, user);
            }
        }
        Ok(users)
    }

    /// Resolve `credential` for `id`. Returns `None` for unknown users and
    /// for mismatching credentials alike.
    pub fn verify_credential(&self, id: UserId, credential: &str) -> Result<Option<UserProfile>> {
        let stored: Option<String> = self
            .conn()
            .query_row(
                "SELECT token_hash FROM users WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(stored) = stored else {
            return Ok(None);
        };

        let presented = credential_hash(credential);
        if presented.as_bytes().ct_eq(stored.as_bytes()).unwrap_u8() != 1 {
            return Ok(None);
        }

        self.get_user(id).map(Some)
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<UserProfile> {
    Ok(UserProfile {
        id: UserId(uuid_col(row, 0)?),
        display_name: row.get(1)?,
        user_type: enum_col(row, 2)?,
        avatar_url: row.get(3)?,
    })
}
