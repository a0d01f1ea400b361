use rusqlite::params;

use crate::database::{now_ts, parse_ts, Database};
use crate::error::Result;
use crate::models::ActivityRecord;

impl Database {
    pub fn insert_activity(&self, node_id: &str, action: &str) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO activities (node_id, action, timestamp) VALUES (?1, ?2, ?3)",
            params![node_id, action, now_ts()],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Activity entry for an update check, apply or rollback.
    pub fn insert_update_activity(
        &self,
        node_id: &str,
        action: &str,
        version: &str,
        developer_id: &str,
        success: bool,
    ) -> Result<i64> {
        let status = if success { "Success" } else { "Failed" };
        let text = format!(
            "Update: {action} (Version: {version}, Developer: {developer_id}, Status: {status})"
        );
        self.insert_activity(node_id, &text)
    }

    pub fn list_activities(&self) -> Result<Vec<ActivityRecord>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, node_id, action, timestamp FROM activities ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            let ts: String = row.get(3)?;
            Ok(ActivityRecord {
                id: row.get(0)?,
                node_id: row.get(1)?,
                action: row.get(2)?,
                timestamp: parse_ts(3, &ts)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
