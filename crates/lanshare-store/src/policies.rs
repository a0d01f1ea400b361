use lanshare_shared::types::TrustGrade;
use rusqlite::params;

use crate::database::{conversion_error, Database};
use crate::error::Result;
use crate::models::{BlockPolicyRecord, ContactRecord};

impl Database {
    /// Insert or replace the block flags for `peer_id`.
    pub fn upsert_block_policy(
        &self,
        peer_id: &str,
        block_files: bool,
        block_messages: bool,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO block_policies (peer_id, block_files, block_messages)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(peer_id) DO UPDATE SET
                 block_files = excluded.block_files,
                 block_messages = excluded.block_messages",
            params![peer_id, block_files, block_messages],
        )?;
        Ok(())
    }

    pub fn list_block_policies(&self) -> Result<Vec<BlockPolicyRecord>> {
        let mut stmt = self.conn().prepare(
            "SELECT peer_id, block_files, block_messages FROM block_policies ORDER BY peer_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BlockPolicyRecord {
                peer_id: row.get(0)?,
                block_files: row.get(1)?,
                block_messages: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn upsert_contact_policy(&self, peer_id: &str, grade: TrustGrade) -> Result<()> {
        self.conn().execute(
            "INSERT INTO contacts (peer_id, trust_grade) VALUES (?1, ?2)
             ON CONFLICT(peer_id) DO UPDATE SET trust_grade = excluded.trust_grade",
            params![peer_id, grade.as_str()],
        )?;
        Ok(())
    }

    pub fn list_contacts(&self) -> Result<Vec<ContactRecord>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT peer_id, trust_grade FROM contacts ORDER BY peer_id")?;
        let rows = stmt.query_map([], |row| {
            let grade: String = row.get(1)?;
            Ok(ContactRecord {
                peer_id: row.get(0)?,
                trust_grade: TrustGrade::from_db(&grade)
                    .ok_or_else(|| conversion_error(1, format!("unknown grade {grade:?}")))?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
