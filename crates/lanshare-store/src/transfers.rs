use lanshare_shared::types::Direction;
use rusqlite::params;

use crate::database::{conversion_error, now_ts, parse_ts, Database};
use crate::error::Result;
use crate::models::{DirectionCounts, DownloadRecord, TagRecord, TransferRecord};

impl Database {
    pub fn insert_transfer(
        &self,
        file_name: &str,
        direction: Direction,
        size: u64,
        metadata: &str,
    ) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO transfers (file_name, direction, size, metadata, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![file_name, direction.as_str(), size as i64, metadata, now_ts()],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn list_transfers(&self) -> Result<Vec<TransferRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, file_name, direction, size, metadata, timestamp
             FROM transfers ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_transfer)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Transfers whose file name or metadata contains `keyword`.
    pub fn search_transfers(&self, keyword: &str) -> Result<Vec<TransferRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, file_name, direction, size, metadata, timestamp
             FROM transfers
             WHERE file_name LIKE ?1 ESCAPE '\\' OR metadata LIKE ?1 ESCAPE '\\'
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![like_pattern(keyword)], row_to_transfer)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn transfer_counts_by_direction(&self) -> Result<DirectionCounts> {
        count_by_direction(self, "transfers")
    }

    pub fn insert_tag(&self, file_name: &str, tags: &str) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO tags (file_name, tags, timestamp) VALUES (?1, ?2, ?3)",
            params![file_name, tags, now_ts()],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn list_tags(&self) -> Result<Vec<TagRecord>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, file_name, tags, timestamp FROM tags ORDER BY id")?;
        let rows = stmt.query_map([], row_to_tag)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn search_tags(&self, keyword: &str) -> Result<Vec<TagRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, file_name, tags, timestamp FROM tags
             WHERE tags LIKE ?1 ESCAPE '\\' OR file_name LIKE ?1 ESCAPE '\\'
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![like_pattern(keyword)], row_to_tag)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn insert_download(&self, file_name: &str, path: &str, size: u64) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO downloads (file_name, path, size, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![file_name, path, size as i64, now_ts()],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn list_downloads(&self) -> Result<Vec<DownloadRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, file_name, path, size, timestamp FROM downloads ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            let ts: String = row.get(4)?;
            Ok(DownloadRecord {
                id: row.get(0)?,
                file_name: row.get(1)?,
                path: row.get(2)?,
                size: row.get::<_, i64>(3)? as u64,
                timestamp: parse_ts(4, &ts)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

pub(crate) fn like_pattern(keyword: &str) -> String {
    let escaped = keyword
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

pub(crate) fn parse_direction(idx: usize, s: &str) -> rusqlite::Result<Direction> {
    Direction::from_db(s).ok_or_else(|| conversion_error(idx, format!("unknown direction {s:?}")))
}

pub(crate) fn count_by_direction(db: &Database, table: &str) -> Result<DirectionCounts> {
    // `table` is one of our own table names, never user input.
    let sql = format!("SELECT direction, COUNT(*) FROM {table} GROUP BY direction");
    let mut stmt = db.conn().prepare(&sql)?;
    let mut rows = stmt.query([])?;

    let mut counts = DirectionCounts::default();
    while let Some(row) = rows.next()? {
        let direction: String = row.get(0)?;
        let n: i64 = row.get(1)?;
        match Direction::from_db(&direction) {
            Some(Direction::Sent) => counts.sent = n as u64,
            Some(Direction::Received) => counts.received = n as u64,
            None => {}
        }
    }
    Ok(counts)
}

fn row_to_transfer(row: &rusqlite::Row<'_>) -> rusqlite::Result<TransferRecord> {
    let direction: String = row.get(2)?;
    let ts: String = row.get(5)?;
    Ok(TransferRecord {
        id: row.get(0)?,
        file_name: row.get(1)?,
        direction: parse_direction(2, &direction)?,
        size: row.get::<_, i64>(3)? as u64,
        metadata: row.get(4)?,
        timestamp: parse_ts(5, &ts)?,
    })
}

fn row_to_tag(row: &rusqlite::Row<'_>) -> rusqlite::Result<TagRecord> {
    let ts: String = row.get(3)?;
    Ok(TagRecord {
        id: row.get(0)?,
        file_name: row.get(1)?,
        tags: row.get(2)?,
        timestamp: parse_ts(3, &ts)?,
    })
}
