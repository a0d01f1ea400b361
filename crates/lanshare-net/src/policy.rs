//! Per-peer block flags and trust grades.

use dashmap::DashMap;
use lanshare_shared::types::TrustGrade;
use lanshare_store::{Journal, StoreError};
use tracing::{info, warn};

/// What a user decided about one peer id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContactPolicy {
    pub block_files: bool,
    pub block_messages: bool,
    pub trust_grade: TrustGrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Files,
    Messages,
}

/// In-memory policy table with write-through to the journal.
pub struct PolicyBook {
    policies: DashMap<String, ContactPolicy>,
    journal: Journal,
}

impl PolicyBook {
    /// Load the persisted policies.
    pub fn load(journal: Journal) -> Result<Self, StoreError> {
        let policies = DashMap::new();
        let (blocks, contacts) =
            journal.with(|db| Ok((db.list_block_policies()?, db.list_contacts()?)))?;

        for b in blocks {
            let mut entry = policies.entry(b.peer_id).or_insert_with(ContactPolicy::default);
            entry.block_files = b.block_files;
            entry.block_messages = b.block_messages;
        }
        for c in contacts {
            policies
                .entry(c.peer_id)
                .or_insert_with(ContactPolicy::default)
                .trust_grade = c.trust_grade;
        }

        info!(count = policies.len(), "Loaded contact policies");
        Ok(Self { policies, journal })
    }

    pub fn policy(&self, peer_id: &str) -> ContactPolicy {
        self.policies
            .get(peer_id)
            .map(|p| *p)
            .unwrap_or_default()
    }

    pub fn is_blocked(&self, peer_id: &str, kind: BlockKind) -> bool {
        let policy = self.policy(peer_id);
        match kind {
            BlockKind::Files => policy.block_files,
            BlockKind::Messages => policy.block_messages,
        }
    }

    pub fn set_blocks(&self, peer_id: &str, block_files: bool, block_messages: bool) {
        {
            let mut entry = self.policies.entry(peer_id.to_string()).or_default();
            entry.block_files = block_files;
            entry.block_messages = block_messages;
        }
        if let Err(e) = self
            .journal
            .with(|db| db.upsert_block_policy(peer_id, block_files, block_messages))
        {
            warn!(peer = %peer_id, error = %e, "Failed to persist block policy");
        }
    }

    pub fn set_trust_grade(&self, peer_id: &str, grade: TrustGrade) {
        self.policies
            .entry(peer_id.to_string())
            .or_default()
            .trust_grade = grade;
        if let Err(e) = self
            .journal
            .with(|db| db.upsert_contact_policy(peer_id, grade))
        {
            warn!(peer = %peer_id, error = %e, "Failed to persist trust grade");
        }
    }

    pub fn blocked_peers(&self) -> Vec<(String, ContactPolicy)> {
        self.policies
            .iter()
            .filter(|p| p.block_files || p.block_messages)
            .map(|p| (p.key().clone(), *p.value()))
            .collect()
    }
}
