#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tempfile::TempDir;

use lanshare_net::notify::Notification;
use lanshare_net::{
    Dialer, Installer, Node, NodeOptions, ReceiveConfirmer, SecureStream, SecureTransport,
    TransferConfig, TransportError,
};
use lanshare_shared::protocol::FileHeader;
use lanshare_shared::identity::Keystore;
use lanshare_shared::retry::RetryPolicy;
use lanshare_store::Journal;

/// Installer that only counts calls.
#[derive(Default)]
pub struct FakeInstaller {
    pub backups: AtomicUsize,
    pub installs: AtomicUsize,
    pub restores: AtomicUsize,
}

impl Installer for FakeInstaller {
    fn backup(&self) -> BoxFuture<'_, io::Result<()>> {
        self.backups.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn trial<'a>(&'a self, _package: &'a Path) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn install_and_restart<'a>(&'a self, _package: &'a Path) -> BoxFuture<'a, io::Result<()>> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }

    fn restore(&self) -> BoxFuture<'_, io::Result<()>> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
}

/// Fails the first `failures` dials, then connects for real.
pub struct FlakyDialer {
    inner: SecureTransport,
    failures: AtomicUsize,
    pub dials: AtomicUsize,
}

impl FlakyDialer {
    pub fn new(keystore: Keystore, failures: usize) -> Self {
        Self {
            inner: SecureTransport::new(keystore),
            failures: AtomicUsize::new(failures),
            dials: AtomicUsize::new(0),
        }
    }
}

impl Dialer for FlakyDialer {
    fn dial(&self, addr: SocketAddr) -> BoxFuture<'_, Result<SecureStream, TransportError>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Box::pin(async move {
            if fail {
                return Err(TransportError::Connect {
                    addr,
                    source: io::Error::new(io::ErrorKind::ConnectionRefused, "flaky"),
                });
            }
            self.inner.connect(addr).await
        })
    }
}

/// Answers every inbound file offer with `accept` and remembers who asked.
pub struct ScriptedConfirmer {
    accept: bool,
    pub asked: std::sync::Mutex<Vec<(String, String)>>,
}

impl ScriptedConfirmer {
    pub fn new(accept: bool) -> Self {
        Self {
            accept,
            asked: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl ReceiveConfirmer for ScriptedConfirmer {
    fn confirm<'a>(&'a self, from: &'a str, offer: &'a FileHeader) -> BoxFuture<'a, bool> {
        self.asked
            .lock()
            .unwrap()
            .push((from.to_string(), offer.file_name.clone()));
        let accept = self.accept;
        Box::pin(async move { accept })
    }
}

pub struct TestNode {
    pub node: Node,
    pub keystore: Keystore,
    pub installer: Arc<FakeInstaller>,
    pub dir: TempDir,
}

impl TestNode {
    pub fn save_dir(&self) -> PathBuf {
        self.dir.path().join("save")
    }

    pub fn id(&self) -> String {
        self.node.devices.local_id().to_string()
    }

    /// Register `other` as a manual peer on loopback and return its name.
    pub fn add_peer(&self, other: &TestNode) -> String {
        self.node
            .devices
            .add_manual_with_port("127.0.0.1", other.node.port())
            .unwrap()
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(50))
}

/// Start a loopback node on the network of `network`.
pub async fn start_node(
    name: &str,
    network: &Keystore,
    tweak: impl FnOnce(&mut NodeOptions),
) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let keystore = network.join();
    let installer = Arc::new(FakeInstaller::default());

    let mut transfer = TransferConfig::new(dir.path().join("save"));
    transfer.staging_dir = dir.path().join("staging");
    transfer.retry = fast_retry();

    let mut options = NodeOptions::new(
        name,
        keystore.clone(),
        Journal::in_memory().unwrap(),
        transfer,
    );
    options.update.staging_dir = dir.path().join("updates");
    options.update.retry = fast_retry();
    options.chat.retry = fast_retry();
    options.installer = Some(installer.clone());
    tweak(&mut options);

    let node = Node::start(options).await.unwrap();
    TestNode {
        node,
        keystore,
        installer,
        dir,
    }
}

/// Wait for the first notification matching `pred`.
pub async fn wait_for(
    rx: &mut tokio::sync::broadcast::Receiver<Notification>,
    pred: impl Fn(&Notification) -> bool,
) -> Notification {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(n) if pred(&n) => return n,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("notification channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}

/// Poll `cond` every 20ms for up to 5s.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Names of leftover partial files in `dir`.
pub fn part_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name.ends_with(".part"))
                .collect()
        })
        .unwrap_or_default()
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}
