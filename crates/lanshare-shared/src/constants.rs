/// Protocol version string for libp2p identify
pub const PROTOCOL_VERSION: &str = "/lanshare/1.0.0";

/// Prefix of the identify agent string carrying our service advert
pub const AGENT_PREFIX: &str = "lanshare";

/// Application name
pub const APP_NAME: &str = "LanShare";

/// Version of this build, compared against peers during update checks
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity of the main developer. Packages claiming it must carry a valid signature.
pub const MAIN_DEVELOPER_ID: &str = "lanshare-main";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Default TCP port for the secure listener
pub const DEFAULT_PORT: u16 = 12345;

/// Multicast group shared by group chat and notifications
pub const MULTICAST_GROUP: [u8; 4] = [239, 255, 0, 1];

/// Multicast port
pub const MULTICAST_PORT: u16 = 4446;

/// Largest datagram accepted by the multicast listener
pub const MAX_DATAGRAM_SIZE: usize = 8192;

/// Transfer chunk size (8 KiB)
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Upper bound for a single length-prefixed string field (1 MiB)
pub const MAX_FIELD_LEN: usize = 1024 * 1024;

/// Largest Noise transport message
pub const NOISE_MAX_MESSAGE: usize = 65_535;

/// Poly1305 tag appended to every Noise transport message
pub const NOISE_TAG_LEN: usize = 16;

/// Attempts made by the shared retry policy
pub const MAX_RETRIES: u32 = 3;

/// Fixed delay between retry attempts in milliseconds
pub const RETRY_DELAY_MS: u64 = 1000;

/// Interval between liveness probes in seconds
pub const PROBE_INTERVAL_SECS: u64 = 10;

/// Connect timeout for liveness probes in milliseconds
pub const PROBE_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Concurrent outbound transfers
pub const TRANSFER_WORKERS: usize = 4;

/// Concurrent outbound chat sends
pub const CHAT_WORKERS: usize = 2;

/// Floor applied by the adaptive bandwidth governor (1 KiB/s)
pub const ADAPTIVE_FLOOR_BPS: u64 = 1024;

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_MESSAGE_KEY: &str = "lanshare-message-key-v1";
