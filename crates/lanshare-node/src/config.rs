//! Node configuration loaded from environment variables.
//!
//! Every setting has a default so a node can join the LAN with zero
//! configuration.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use lanshare_shared::constants::{DEFAULT_PORT, MULTICAST_GROUP, MULTICAST_PORT};
use lanshare_shared::identity::parse_public_key_hex;
use lanshare_shared::types::NodeId;

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// TCP port of the secure listener.
    /// Env: `LANSHARE_PORT`
    /// Default: `12345`
    pub port: u16,

    /// Stable id announced to peers.
    /// Env: `LANSHARE_NODE_ID`
    /// Default: random v4 UUID
    pub node_id: NodeId,

    /// Name shown to other users.
    /// Env: `LANSHARE_DISPLAY_NAME`
    /// Default: `User_<first 8 chars of the node id>`
    pub display_name: String,

    /// Where received files and auto-backups land.
    /// Env: `LANSHARE_SAVE_DIR`
    /// Default: the user's download directory
    pub save_dir: PathBuf,

    /// Journal database and keystore location.
    /// Env: `LANSHARE_DATA_DIR`
    /// Default: platform data directory
    pub data_dir: PathBuf,

    /// Env: `LANSHARE_KEYSTORE`
    /// Default: `<data dir>/keystore.json`
    pub keystore_path: PathBuf,

    /// Transfer ceiling in bytes per second (0 = unlimited).
    /// Env: `LANSHARE_SPEED_LIMIT`
    /// Default: `0`
    pub speed_limit: u64,

    /// Derive the ceiling from observed interface throughput instead.
    /// Env: `LANSHARE_ADAPTIVE_BANDWIDTH` (true/false)
    /// Default: `false`
    pub adaptive_bandwidth: bool,

    /// Env: `LANSHARE_MULTICAST_GROUP`
    /// Default: `239.255.0.1`
    pub multicast_group: Ipv4Addr,

    /// Env: `LANSHARE_MULTICAST_PORT`
    /// Default: `4446`
    pub multicast_port: u16,

    /// Seconds between journal backups (0 disables them).
    /// Env: `LANSHARE_AUTO_BACKUP_SECS`
    /// Default: `3600`
    pub auto_backup_secs: u64,

    /// Age in days after which log rows are purged (0 keeps everything).
    /// Env: `LANSHARE_LOG_RETENTION_DAYS`
    /// Default: `30`
    pub log_retention_days: u32,

    /// Package offered to peers asking for an update.
    /// Env: `LANSHARE_UPDATE_PACKAGE`
    /// Default: none (peers get an empty offer)
    pub update_package: Option<PathBuf>,

    /// Env: `LANSHARE_UPDATE_NOTES`
    pub update_notes: String,

    /// Base64 Ed25519 signature of the offered package.
    /// Env: `LANSHARE_UPDATE_SIGNATURE`
    pub update_signature: String,

    /// Hex Ed25519 public key of the main developer.
    /// Env: `LANSHARE_MAIN_DEVELOPER_KEY`
    /// Default: none (no package can be trusted)
    pub main_developer_key: Option<[u8; 32]>,

    /// Advertise and browse over mDNS.
    /// Env: `LANSHARE_DISCOVERY` (true/false)
    /// Default: `true`
    pub discovery: bool,

    /// Store inbound files without confirmation. With no one to ask, a
    /// node with this off declines every file.
    /// Env: `LANSHARE_AUTO_ACCEPT` (true/false)
    /// Default: `true`
    pub auto_accept: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let node_id = NodeId::new();
        let data_dir = lanshare_store::database::default_data_dir()
            .unwrap_or_else(|_| PathBuf::from("./data"));
        Self {
            port: DEFAULT_PORT,
            display_name: default_display_name(&node_id),
            node_id,
            save_dir: default_save_dir(),
            keystore_path: data_dir.join("keystore.json"),
            data_dir,
            speed_limit: 0,
            adaptive_bandwidth: false,
            multicast_group: Ipv4Addr::from(MULTICAST_GROUP),
            multicast_port: MULTICAST_PORT,
            auto_backup_secs: 3600,
            log_retention_days: 30,
            update_package: None,
            update_notes: String::new(),
            update_signature: String::new(),
            main_developer_key: None,
            discovery: true,
            auto_accept: true,
        }
    }
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        parse_into(&var, "LANSHARE_PORT", &mut config.port);

        if let Some(id) = var("LANSHARE_NODE_ID") {
            match id.parse::<NodeId>() {
                Ok(parsed) => {
                    config.node_id = parsed;
                    config.display_name = default_display_name(&parsed);
                }
                Err(e) => {
                    tracing::warn!(value = %id, error = %e, "Invalid LANSHARE_NODE_ID, using default");
                }
            }
        }

        if let Some(name) = var("LANSHARE_DISPLAY_NAME") {
            if !name.trim().is_empty() {
                config.display_name = name.trim().to_string();
            }
        }

        if let Some(path) = var("LANSHARE_SAVE_DIR") {
            config.save_dir = PathBuf::from(path);
        }

        if let Some(path) = var("LANSHARE_DATA_DIR") {
            config.data_dir = PathBuf::from(path);
            config.keystore_path = config.data_dir.join("keystore.json");
        }

        if let Some(path) = var("LANSHARE_KEYSTORE") {
            config.keystore_path = PathBuf::from(path);
        }

        parse_into(&var, "LANSHARE_SPEED_LIMIT", &mut config.speed_limit);

        if let Some(val) = var("LANSHARE_ADAPTIVE_BANDWIDTH") {
            config.adaptive_bandwidth = val != "false" && val != "0";
        }

        parse_into(&var, "LANSHARE_MULTICAST_GROUP", &mut config.multicast_group);
        if !config.multicast_group.is_multicast() {
            tracing::warn!(
                value = %config.multicast_group,
                "LANSHARE_MULTICAST_GROUP is not a multicast address, using default"
            );
            config.multicast_group = Ipv4Addr::from(MULTICAST_GROUP);
        }
        parse_into(&var, "LANSHARE_MULTICAST_PORT", &mut config.multicast_port);

        parse_into(&var, "LANSHARE_AUTO_BACKUP_SECS", &mut config.auto_backup_secs);
        parse_into(&var, "LANSHARE_LOG_RETENTION_DAYS", &mut config.log_retention_days);

        // -- Update distribution --

        if let Some(path) = var("LANSHARE_UPDATE_PACKAGE") {
            if !path.is_empty() {
                config.update_package = Some(PathBuf::from(path));
            }
        }

        if let Some(notes) = var("LANSHARE_UPDATE_NOTES") {
            config.update_notes = notes;
        }

        if let Some(sig) = var("LANSHARE_UPDATE_SIGNATURE") {
            config.update_signature = sig.trim().to_string();
        }

        if let Some(hex_key) = var("LANSHARE_MAIN_DEVELOPER_KEY") {
            match parse_public_key_hex(&hex_key) {
                Some(key) => config.main_developer_key = Some(key),
                None => {
                    tracing::warn!("Invalid LANSHARE_MAIN_DEVELOPER_KEY, signed updates disabled");
                }
            }
        }

        if let Some(val) = var("LANSHARE_DISCOVERY") {
            config.discovery = val != "false" && val != "0";
        }

        if let Some(val) = var("LANSHARE_AUTO_ACCEPT") {
            config.auto_accept = val != "false" && val != "0";
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("lanshare.db")
    }
}

fn parse_into<T>(var: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T)
where
    T: FromStr,
{
    let Some(raw) = var(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(value = %raw, "Invalid {key}, using default"),
    }
}

fn default_display_name(id: &NodeId) -> String {
    format!("User_{}", id.short())
}

fn default_save_dir() -> PathBuf {
    directories::UserDirs::new()
        .and_then(|dirs| {
            dirs.download_dir()
                .map(|d| d.to_path_buf())
                .or_else(|| Some(dirs.home_dir().join("Downloads")))
        })
        .unwrap_or_else(|| PathBuf::from("./downloads"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> NodeConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.port, 12345);
        assert_eq!(config.multicast_group, Ipv4Addr::new(239, 255, 0, 1));
        assert_eq!(config.multicast_port, 4446);
        assert_eq!(config.auto_backup_secs, 3600);
        assert_eq!(config.log_retention_days, 30);
        assert!(config.discovery);
        assert!(config.auto_accept);
        assert!(!config.adaptive_bandwidth);
        assert!(config.main_developer_key.is_none());
        assert_eq!(config.display_name, format!("User_{}", config.node_id.short()));
        assert_eq!(config.keystore_path, config.data_dir.join("keystore.json"));
    }

    #[test]
    fn test_env_overrides() {
        let config = load(&[
            ("LANSHARE_PORT", "4000"),
            ("LANSHARE_DISPLAY_NAME", "Alice"),
            ("LANSHARE_DATA_DIR", "/tmp/lanshare-test"),
            ("LANSHARE_SPEED_LIMIT", "65536"),
            ("LANSHARE_ADAPTIVE_BANDWIDTH", "true"),
            ("LANSHARE_DISCOVERY", "0"),
            ("LANSHARE_AUTO_ACCEPT", "false"),
            ("LANSHARE_UPDATE_PACKAGE", "/opt/lanshare.bin"),
        ]);
        assert_eq!(config.port, 4000);
        assert_eq!(config.display_name, "Alice");
        assert_eq!(config.keystore_path, PathBuf::from("/tmp/lanshare-test/keystore.json"));
        assert_eq!(config.database_path(), PathBuf::from("/tmp/lanshare-test/lanshare.db"));
        assert_eq!(config.speed_limit, 65536);
        assert!(config.adaptive_bandwidth);
        assert!(!config.discovery);
        assert!(!config.auto_accept);
        assert_eq!(config.update_package, Some(PathBuf::from("/opt/lanshare.bin")));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = load(&[
            ("LANSHARE_PORT", "not-a-port"),
            ("LANSHARE_NODE_ID", "nope"),
            ("LANSHARE_MULTICAST_GROUP", "10.0.0.1"),
            ("LANSHARE_MAIN_DEVELOPER_KEY", "abcd"),
        ]);
        assert_eq!(config.port, 12345);
        assert_eq!(config.multicast_group, Ipv4Addr::new(239, 255, 0, 1));
        assert!(config.main_developer_key.is_none());
        assert!(config.display_name.starts_with("User_"));
    }

    #[test]
    fn test_node_id_drives_default_name() {
        let id = "0123abcd-0000-4000-8000-000000000000";
        let config = load(&[("LANSHARE_NODE_ID", id)]);
        assert_eq!(config.node_id.to_string(), id);
        assert_eq!(config.display_name, "User_0123abcd");
    }

    #[test]
    fn test_developer_key_parsed() {
        let config = load(&[("LANSHARE_MAIN_DEVELOPER_KEY", &"ab".repeat(32))]);
        assert_eq!(config.main_developer_key, Some([0xab; 32]));
    }
}
