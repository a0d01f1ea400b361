use rusqlite::params;

use crate::database::{now_ts, parse_ts, Database};
use crate::error::Result;
use crate::models::FileVersionRecord;

const SELECT_VERSION: &str =
    "SELECT id, file_name, version_label, size, hash, timestamp FROM file_versions";

impl Database {
    pub fn insert_file_version(
        &self,
        file_name: &str,
        version_label: &str,
        size: u64,
        hash: &str,
    ) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO file_versions (file_name, version_label, size, hash, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![file_name, version_label, size as i64, hash, now_ts()],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    pub fn list_file_versions(&self) -> Result<Vec<FileVersionRecord>> {
        let mut stmt = self.conn().prepare(&format!("{SELECT_VERSION} ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_version)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn find_file_version(&self, version_label: &str) -> Result<Option<FileVersionRecord>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("{SELECT_VERSION} WHERE version_label = ?1"))?;
        let mut rows = stmt.query_map(params![version_label], row_to_version)?;
        Ok(rows.next().transpose()?)
    }
}

fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileVersionRecord> {
    let ts: String = row.get(5)?;
    Ok(FileVersionRecord {
        id: row.get(0)?,
        file_name: row.get(1)?,
        version_label: row.get(2)?,
        size: row.get::<_, i64>(3)? as u64,
        hash: row.get(4)?,
        timestamp: parse_ts(5, &ts)?,
    })
}
