use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Cloneable handle on the database shared by every component of a node.
///
/// Calls are short and synchronous, so a plain mutex is enough; callers on
/// the async side hold it only for the duration of one statement.
#[derive(Clone)]
pub struct Journal {
    db: Arc<Mutex<Database>>,
}

impl Journal {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::open_at(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Run `f` against the database.
    pub fn with<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        f(&db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanshare_shared::types::Direction;

    #[test]
    fn test_shared_between_clones() {
        let journal = Journal::in_memory().unwrap();
        let other = journal.clone();

        let handle = std::thread::spawn(move || {
            other
                .with(|db| db.insert_chat("peer", "from thread", Direction::Sent))
                .unwrap();
        });
        handle.join().unwrap();

        let chats = journal.with(|db| db.list_chats()).unwrap();
        assert_eq!(chats.len(), 1);
    }
}
