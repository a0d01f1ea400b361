//! # lanshare-node
//!
//! Headless LAN peer.
//!
//! This binary provides:
//! - **mDNS discovery** of other nodes plus liveness probing
//! - **Noise-encrypted TCP listener** for chat, files, status and update
//!   requests
//! - **Multicast group chat** and relay of local notifications
//! - **Journal maintenance**: periodic backups and log retention
//!
//! Any front end drives the same `lanshare-net` components this binary wires
//! together.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use lanshare_net::notify::Notification;
use lanshare_net::{
    run_adaptive_sampler, spawn_mdns, BandwidthMode, DiscoveryCommand, ExecutableInstaller, Node,
    NodeOptions, PackageSource, TransferConfig,
};
use lanshare_shared::identity::Keystore;
use lanshare_store::Journal;

use crate::config::NodeConfig;

const LOG_PURGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const ADAPTIVE_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Trial runs of a freshly received build only ask for the version.
    if std::env::args().nth(1).as_deref() == Some("--version") {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lanshare_net=debug,lanshare_store=info")),
        )
        .init();

    info!("Starting LanShare node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");

    std::fs::create_dir_all(&config.data_dir)?;
    std::fs::create_dir_all(&config.save_dir)?;

    // -----------------------------------------------------------------------
    // 3. Open the keystore and journal
    // -----------------------------------------------------------------------
    let keystore = Keystore::load_or_create(&config.keystore_path)?;
    let journal = Journal::open_at(&config.database_path())?;
    info!(
        keystore = %config.keystore_path.display(),
        db = %config.database_path().display(),
        "Persistent state opened"
    );

    // -----------------------------------------------------------------------
    // 4. Start the node
    // -----------------------------------------------------------------------
    let mut transfer = TransferConfig::new(&config.save_dir);
    transfer.auto_accept = config.auto_accept;
    if !config.auto_accept {
        info!("Auto-accept off, inbound files will be declined");
    }
    let mut options = NodeOptions::new(
        config.display_name.clone(),
        keystore,
        journal.clone(),
        transfer,
    );
    options.node_id = config.node_id;
    options.port = config.port;
    options.bandwidth = if config.adaptive_bandwidth {
        BandwidthMode::Adaptive
    } else {
        BandwidthMode::Fixed(config.speed_limit)
    };
    options.chat.group = config.multicast_group;
    options.chat.port = config.multicast_port;
    options.update.main_developer_key = config.main_developer_key;
    options.update.package = config.update_package.clone().map(|path| PackageSource {
        path,
        patch_notes: config.update_notes.clone(),
        signature: config.update_signature.clone(),
    });
    options.installer = Some(Arc::new(ExecutableInstaller::for_current_exe()?));

    let node = Node::start(options).await?;

    // -----------------------------------------------------------------------
    // 5. Spawn background tasks
    // -----------------------------------------------------------------------

    // Journal backups next to the received files
    if config.auto_backup_secs > 0 {
        let journal = journal.clone();
        let notifier = node.notifier.clone();
        let save_dir = config.save_dir.clone();
        let period = Duration::from_secs(config.auto_backup_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let path = backup_path(&save_dir);
                match write_backup(journal.clone(), path.clone()).await {
                    Ok(()) => notifier.emit(Notification::BackupCompleted {
                        path: path.display().to_string(),
                    }),
                    Err(e) => {
                        warn!(error = %e, "Auto-backup failed");
                        notifier.emit(Notification::BackupFailed {
                            reason: e.to_string(),
                        });
                    }
                }
            }
        });
    }

    // Log retention
    if config.log_retention_days > 0 {
        let journal = journal.clone();
        let days = config.log_retention_days;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(LOG_PURGE_INTERVAL);
            loop {
                interval.tick().await;
                match journal.with(|db| db.purge_logs_older_than(days)) {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, days, "Purged old log rows"),
                    Err(e) => warn!(error = %e, "Log purge failed"),
                }
            }
        });
    }

    if config.adaptive_bandwidth {
        tokio::spawn(run_adaptive_sampler(
            node.governor.clone(),
            ADAPTIVE_SAMPLE_INTERVAL,
        ));
    }

    // Group chat
    let chat = node.chat.clone();
    tokio::spawn(async move {
        if let Err(e) = chat.listen_multicast().await {
            error!(error = %e, "Multicast listener stopped");
        }
    });

    // -----------------------------------------------------------------------
    // 6. Announce on the LAN and browse for peers
    // -----------------------------------------------------------------------
    let discovery = if config.discovery {
        let advert = node.devices.register_self(&config.display_name);
        let (events_tx, events_rx) = mpsc::channel(256);
        match spawn_mdns(advert, events_tx) {
            Ok(commands) => {
                tokio::spawn(node.devices.clone().run_discovery(events_rx));
                Some(commands)
            }
            Err(e) => {
                warn!(error = %e, "mDNS discovery unavailable, manual peers only");
                None
            }
        }
    } else {
        info!("Discovery disabled");
        None
    };

    // -----------------------------------------------------------------------
    // 7. Relay notifications until shutdown
    // -----------------------------------------------------------------------
    let mut notifications = node.notifier.subscribe();
    let chat = node.chat.clone();
    let relay = async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => {
                    info!(notification = %notification, "Notification");
                    if chat.relay_notification(&notification).await {
                        debug!("Notification relayed to group");
                    }
                    if let Notification::UpdateInstalled { version } = notification {
                        return version;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Notification relay lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    std::future::pending::<()>().await;
                }
            }
        }
    };

    tokio::select! {
        version = relay => {
            info!(version = %version, "Update installed, handing over to the new build");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    if let Some(commands) = discovery {
        let _ = commands.send(DiscoveryCommand::Shutdown).await;
    }
    node.shutdown();

    Ok(())
}

/// Export the journal off the async workers; the export holds the journal
/// lock while it writes the file.
async fn write_backup(journal: Journal, path: PathBuf) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || journal.with(|db| db.export_backup_to(&path))).await??;
    Ok(())
}

fn backup_path(dir: &Path) -> PathBuf {
    dir.join(format!(
        "backup_{}.json",
        chrono::Utc::now().timestamp_millis()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_path_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = backup_path(dir.path());
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("backup_"));
        assert!(name.ends_with(".json"));
        let millis = &name["backup_".len()..name.len() - ".json".len()];
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(path.parent(), Some(dir.path()));
    }

    #[tokio::test]
    async fn test_write_backup_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::in_memory().unwrap();
        journal
            .with(|db| db.insert_activity("node", "Started"))
            .unwrap();

        let path = backup_path(dir.path());
        write_backup(journal, path.clone()).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.trim_start().starts_with('{'));
        assert!(written.contains("Started"));
    }
}
