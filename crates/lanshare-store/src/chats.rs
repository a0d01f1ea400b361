use lanshare_shared::types::Direction;
use rusqlite::params;

use crate::database::{now_ts, parse_ts, Database};
use crate::error::Result;
use crate::models::{ChatRecord, DirectionCounts};
use crate::transfers::{count_by_direction, like_pattern, parse_direction};

impl Database {
    pub fn insert_chat(&self, peer_id: &str, message: &str, direction: Direction) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO chats (peer_id, message, direction, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![peer_id, message, direction.as_str(), now_ts()],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn list_chats(&self) -> Result<Vec<ChatRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, peer_id, message, direction, timestamp FROM chats ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_chat)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn search_chats(&self, keyword: &str) -> Result<Vec<ChatRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, peer_id, message, direction, timestamp FROM chats
             WHERE message LIKE ?1 ESCAPE '\\'
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![like_pattern(keyword)], row_to_chat)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn chat_counts_by_direction(&self) -> Result<DirectionCounts> {
        count_by_direction(self, "chats")
    }
}

fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRecord> {
    let direction: String = row.get(3)?;
    let ts: String = row.get(4)?;
    Ok(ChatRecord {
        id: row.get(0)?,
        peer_id: row.get(1)?,
        message: row.get(2)?,
        direction: parse_direction(3, &direction)?,
        timestamp: parse_ts(4, &ts)?,
    })
}
