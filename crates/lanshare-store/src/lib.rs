//! # lanshare-store
//!
//! Local journal of everything the node does: transfers, tags, chats,
//! downloads, activity, received-file versions and per-peer policies.
//!
//! The crate exposes a synchronous `Database` handle over a
//! `rusqlite::Connection` with typed insert/query helpers per table, and a
//! cloneable [`Journal`] that async code shares between tasks.

pub mod activity;
pub mod backup;
pub mod chats;
pub mod database;
pub mod journal;
pub mod migrations;
pub mod models;
pub mod policies;
pub mod transfers;
pub mod versions;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use journal::Journal;
pub use models::*;
