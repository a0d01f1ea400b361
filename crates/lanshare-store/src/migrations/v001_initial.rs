//! v001 -- Initial schema creation.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Transfer log
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS transfers (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name  TEXT NOT NULL,
    direction  TEXT NOT NULL,                -- 'sent' | 'received'
    size       INTEGER NOT NULL,
    metadata   TEXT NOT NULL,
    timestamp  TEXT NOT NULL                 -- RFC-3339, UTC, millis
);

CREATE INDEX IF NOT EXISTS idx_transfers_ts ON transfers(timestamp);

CREATE TABLE IF NOT EXISTS tags (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name  TEXT NOT NULL,
    tags       TEXT NOT NULL,                -- comma separated, as typed
    timestamp  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS downloads (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name  TEXT NOT NULL,
    path       TEXT NOT NULL,
    size       INTEGER NOT NULL,
    timestamp  TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Chat log
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    peer_id    TEXT NOT NULL,                -- UUID of the other side
    message    TEXT NOT NULL,
    direction  TEXT NOT NULL,
    timestamp  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chats_ts ON chats(timestamp);

-- ----------------------------------------------------------------
-- Activity log
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS activities (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id    TEXT NOT NULL,
    action     TEXT NOT NULL,
    timestamp  TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Versions of received files, append-only
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS file_versions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name     TEXT NOT NULL,
    version_label TEXT NOT NULL UNIQUE,      -- '<name>.v<epoch-millis>'
    size          INTEGER NOT NULL,
    hash          TEXT NOT NULL,             -- SHA-256 hex of the old content
    timestamp     TEXT NOT NULL
);

-- ----------------------------------------------------------------
-- Per-peer policies, one row per peer id
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS block_policies (
    peer_id        TEXT PRIMARY KEY NOT NULL,
    block_files    INTEGER NOT NULL DEFAULT 0,
    block_messages INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS contacts (
    peer_id     TEXT PRIMARY KEY NOT NULL,
    trust_grade TEXT NOT NULL DEFAULT 'Green'
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
