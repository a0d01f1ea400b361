pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod noise;
pub mod protocol;
pub mod retry;
pub mod types;

pub use types::NodeId;
