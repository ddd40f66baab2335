//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `users`, `conversations`, `participants`
//! and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (mirror of the upstream user store)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID
    display_name TEXT NOT NULL,
    user_type    TEXT NOT NULL,               -- tenant | landlord | employer | admin
    avatar_url   TEXT,
    token_hash   TEXT NOT NULL,               -- hex BLAKE3 of the credential
    created_at   TEXT NOT NULL                -- ISO-8601 / RFC-3339
);

-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id                 TEXT PRIMARY KEY NOT NULL,  -- UUID v4
    kind               TEXT NOT NULL,              -- direct | group
    title              TEXT,
    description        TEXT,
    avatar_url         TEXT,
    is_public          INTEGER NOT NULL DEFAULT 0,
    is_encrypted       INTEGER NOT NULL DEFAULT 0,
    moderation_enabled INTEGER NOT NULL DEFAULT 1,
    ai_scan_enabled    INTEGER NOT NULL DEFAULT 1,
    created_by         TEXT NOT NULL,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL,
    last_message_at    TEXT
);

-- ----------------------------------------------------------------
-- Participants (soft-leave via left_at, never deleted)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS participants (
    conversation_id         TEXT NOT NULL,
    user_id                 TEXT NOT NULL,
    role                    TEXT NOT NULL,         -- admin | member
    can_send_messages       INTEGER NOT NULL,
    can_add_participants    INTEGER NOT NULL,
    can_remove_participants INTEGER NOT NULL,
    can_edit_settings       INTEGER NOT NULL,
    joined_at               TEXT NOT NULL,
    left_at                 TEXT,                  -- NULL while active

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id, left_at);

-- ----------------------------------------------------------------
-- Messages (seq gives a total order per insert)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq              INTEGER PRIMARY KEY AUTOINCREMENT,
    id               TEXT NOT NULL UNIQUE,        -- UUID v4
    conversation_id  TEXT NOT NULL,
    sender_id        TEXT NOT NULL,
    reply_to_id      TEXT,
    kind             TEXT NOT NULL,               -- text | image | video | audio | document | system
    content          TEXT,
    media_url        TEXT,
    thumbnail_url    TEXT,
    mime_type        TEXT,
    file_name        TEXT,
    file_size        INTEGER,
    width            INTEGER,
    height           INTEGER,
    duration_secs    INTEGER,
    security_status  TEXT NOT NULL,               -- pending | passed | flagged | blocked
    security_details TEXT,                        -- JSON
    status           TEXT NOT NULL,               -- sent | deleted
    sent_at          TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
    ON messages(conversation_id, seq DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
