use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Per-message read receipts (monotonic, never deleted)
CREATE TABLE IF NOT EXISTS read_receipts (
    message_id TEXT NOT NULL,              -- FK -> messages(id)
    user_id    TEXT NOT NULL,
    read_at    TEXT NOT NULL,              -- ISO-8601

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_read_receipts_user ON read_receipts(user_id);

-- Reactions table
CREATE TABLE IF NOT EXISTS reactions (
    message_id TEXT NOT NULL,              -- FK -> messages(id)
    user_id    TEXT NOT NULL,
    reaction   TEXT NOT NULL,              -- emoji or short code
    created_at TEXT NOT NULL,              -- ISO-8601

    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_reactions_message ON reactions(message_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_reactions_unique ON reactions(message_id, user_id, reaction);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
