//! Known peers, their presence and liveness probing.
//!
//! Peers are keyed by their advertised instance name (`<display>_<uuid>`).
//! Each resolved peer gets a prober task that sends a STATUS frame every
//! interval. Removal is terminal: only a new resolve brings a peer back.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use lanshare_shared::constants::{PROBE_CONNECT_TIMEOUT_MS, PROBE_INTERVAL_SECS};
use lanshare_shared::error::ValidationError;
use lanshare_shared::protocol::{FrameKind, Preamble, StatusFrame};
use lanshare_shared::retry::RetryPolicy;
use lanshare_shared::types::{NodeId, PresenceState};

use crate::discovery::{DiscoveryEvent, ServiceAdvert};
use crate::error::{NetError, TransportError};
use crate::notify::{Notification, Notifier};
use crate::transport::{Dialer, SecureStream};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Peer {
    pub display_name: String,
    pub stable_id: Option<NodeId>,
    pub address: SocketAddr,
    pub presence: PresenceState,
    pub user_status: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    pub interval: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(PROBE_INTERVAL_SECS),
            connect_timeout: Duration::from_millis(PROBE_CONNECT_TIMEOUT_MS),
            retry: RetryPolicy::default(),
        }
    }
}

/// Stable id carried in an instance name, if it has one.
fn stable_id_of(instance_name: &str) -> Option<NodeId> {
    instance_name
        .rsplit_once('_')
        .and_then(|(_, id)| NodeId::parse(id).ok())
}

pub struct DeviceManager {
    local_id: NodeId,
    port: u16,
    display_name: RwLock<String>,
    user_status: RwLock<String>,
    peers: DashMap<String, Peer>,
    probers: DashMap<String, AbortHandle>,
    dialer: Arc<dyn Dialer>,
    notifier: Notifier,
    config: ProbeConfig,
}

impl DeviceManager {
    pub fn new(
        local_id: NodeId,
        display_name: impl Into<String>,
        port: u16,
        dialer: Arc<dyn Dialer>,
        notifier: Notifier,
        config: ProbeConfig,
    ) -> Self {
        Self {
            local_id,
            port,
            display_name: RwLock::new(display_name.into()),
            user_status: RwLock::new(String::new()),
            peers: DashMap::new(),
            probers: DashMap::new(),
            dialer,
            notifier,
            config,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn display_name(&self) -> String {
        self.display_name.read().map(|n| n.clone()).unwrap_or_default()
    }

    pub fn user_status(&self) -> String {
        self.user_status.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// `<display name>_<node id>`, the name other nodes know us by.
    pub fn instance_name(&self) -> String {
        format!("{}_{}", self.display_name(), self.local_id)
    }

    /// Record our display name and return what discovery should publish.
    pub fn register_self(&self, display_name: &str) -> ServiceAdvert {
        self.rename_self(display_name);
        let advert = ServiceAdvert {
            instance_name: self.instance_name(),
            port: self.port,
        };
        info!(instance = %advert.instance_name, port = advert.port, "Registered local service");
        advert
    }

    pub fn rename_self(&self, display_name: &str) {
        if let Ok(mut name) = self.display_name.write() {
            *name = display_name.to_string();
        }
    }

    pub fn set_user_status(&self, status: &str) {
        if let Ok(mut current) = self.user_status.write() {
            *current = status.to_string();
        }
    }

    // ------------------------------------------------------------------
    // Discovery events
    // ------------------------------------------------------------------

    /// Upsert a resolved peer as Online and (re)start its prober.
    pub fn on_peer_resolved(self: &Arc<Self>, name: &str, address: SocketAddr) {
        if name == self.instance_name() {
            return;
        }

        let user_status = self
            .peers
            .get(name)
            .map(|p| p.user_status.clone())
            .unwrap_or_default();
        self.peers.insert(
            name.to_string(),
            Peer {
                display_name: name.to_string(),
                stable_id: stable_id_of(name),
                address,
                presence: PresenceState::Online,
                user_status,
            },
        );
        info!(peer = %name, addr = %address, "Peer online");

        self.start_prober(name);
        self.notifier.emit(Notification::PeerOnline {
            peer: name.to_string(),
        });
    }

    /// Evict a peer and stop probing it.
    pub fn on_peer_removed(&self, name: &str) {
        if let Some((_, handle)) = self.probers.remove(name) {
            handle.abort();
        }
        if self.peers.remove(name).is_some() {
            info!(peer = %name, "Peer removed");
            self.notifier.emit(Notification::PeerRemoved {
                peer: name.to_string(),
            });
        }
    }

    /// Consume discovery events until the channel closes.
    pub async fn run_discovery(self: Arc<Self>, mut events: mpsc::Receiver<DiscoveryEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                DiscoveryEvent::Found { name } => debug!(peer = %name, "Service found"),
                DiscoveryEvent::Resolved { name, address } => self.on_peer_resolved(&name, address),
                DiscoveryEvent::Lost { name } => self.on_peer_removed(&name),
            }
        }
        debug!("Discovery channel closed");
    }

    /// Add a peer by IPv4 address on the default port.
    pub fn add_manual(self: &Arc<Self>, ip: &str) -> Result<String, ValidationError> {
        self.add_manual_with_port(ip, self.port)
    }

    pub fn add_manual_with_port(
        self: &Arc<Self>,
        ip: &str,
        port: u16,
    ) -> Result<String, ValidationError> {
        let addr: Ipv4Addr = ip
            .trim()
            .parse()
            .map_err(|_| ValidationError::InvalidAddress(ip.to_string()))?;
        let [a, b, c, d] = addr.octets();
        let name = format!("Manual_{a}_{b}_{c}_{d}");
        self.on_peer_resolved(&name, SocketAddr::from((addr, port)));
        Ok(name)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().map(|p| p.value().clone()).collect();
        peers.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        peers
    }

    pub fn peer(&self, name: &str) -> Option<Peer> {
        self.peers.get(name).map(|p| p.value().clone())
    }

    pub fn address_of(&self, name: &str) -> Option<SocketAddr> {
        self.peers.get(name).map(|p| p.address)
    }

    /// Peer name whose stable id is `id`.
    pub fn name_for_id(&self, id: &str) -> Option<String> {
        let id = NodeId::parse(id).ok()?;
        self.peers
            .iter()
            .find(|p| p.stable_id == Some(id))
            .map(|p| p.key().clone())
    }

    /// Address of a known peer, or `UnknownPeer`.
    pub fn resolve(&self, name: &str) -> Result<SocketAddr, NetError> {
        self.address_of(name)
            .ok_or_else(|| NetError::UnknownPeer(name.to_string()))
    }

    pub fn user_statuses(&self) -> Vec<(String, String)> {
        let mut statuses: Vec<_> = self
            .peers
            .iter()
            .filter(|p| !p.user_status.is_empty())
            .map(|p| (p.key().clone(), p.user_status.clone()))
            .collect();
        statuses.sort();
        statuses
    }

    // ------------------------------------------------------------------
    // STATUS
    // ------------------------------------------------------------------

    /// Inbound STATUS from `sender_id`, connected from `source`.
    ///
    /// The entry is found by the sender's stable id: the advertised name
    /// when it carries that id, else a peer already bound to it, else a
    /// manual peer at the source address. Unknown senders are ignored so
    /// removed peers stay gone.
    pub fn handle_status(&self, sender_id: &str, source: IpAddr, frame: &StatusFrame) {
        let Ok(sender) = NodeId::parse(sender_id) else {
            debug!(sender = %sender_id, "Status with invalid sender id ignored");
            return;
        };

        let Some(name) = self.status_target(sender, source, &frame.display_name) else {
            debug!(peer = %frame.display_name, "Status from unknown peer ignored");
            return;
        };
        if let Some(mut peer) = self.peers.get_mut(&name) {
            peer.presence = PresenceState::Online;
            peer.user_status = frame.user_status.clone();
            peer.stable_id = Some(sender);
            debug!(peer = %name, status = %frame.user_status, "Status received");
        }
    }

    fn status_target(&self, sender: NodeId, source: IpAddr, display_name: &str) -> Option<String> {
        if stable_id_of(display_name) == Some(sender) && self.peers.contains_key(display_name) {
            return Some(display_name.to_string());
        }
        if let Some(name) = self.name_for_id(&sender.to_string()) {
            return Some(name);
        }
        self.peers
            .iter()
            .find(|p| p.stable_id.is_none() && p.address.ip() == source)
            .map(|p| p.key().clone())
    }

    async fn dial_with_timeout(&self, addr: SocketAddr) -> Result<SecureStream, TransportError> {
        tokio::time::timeout(self.config.connect_timeout, self.dialer.dial(addr))
            .await
            .map_err(|_| TransportError::Timeout(addr))?
    }

    /// One STATUS frame to `addr`.
    pub async fn send_status(&self, addr: SocketAddr) -> Result<(), NetError> {
        let mut stream = self.dial_with_timeout(addr).await?;
        let sender = self.local_id.to_string();
        Preamble::write_to(&mut stream, &sender, FrameKind::Status).await?;
        StatusFrame {
            display_name: self.instance_name(),
            user_status: self.user_status(),
        }
        .write_to(&mut stream)
        .await?;
        stream.flush().await?;
        stream.finish().await?;
        Ok(())
    }

    /// Set our status and push it to every known peer. Returns how many
    /// peers accepted it.
    pub async fn broadcast_status(&self, status: &str) -> usize {
        self.set_user_status(status);
        let targets: Vec<(String, SocketAddr)> = self
            .peers
            .iter()
            .map(|p| (p.key().clone(), p.address))
            .collect();

        let sends = targets.into_iter().map(|(name, addr)| async move {
            match self.send_status(addr).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(peer = %name, error = %e, "Status broadcast failed");
                    false
                }
            }
        });
        let delivered = futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        info!(status = %status, delivered, "Status broadcast");
        delivered
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    fn start_prober(self: &Arc<Self>, name: &str) {
        let manager = self.clone();
        let peer = name.to_string();
        let task = tokio::spawn(async move { manager.probe_loop(peer).await });
        if let Some(previous) = self.probers.insert(name.to_string(), task.abort_handle()) {
            previous.abort();
        }
    }

    async fn probe_loop(self: Arc<Self>, name: String) {
        let start = tokio::time::Instant::now() + self.config.interval;
        let mut ticker = tokio::time::interval_at(start, self.config.interval);

        loop {
            ticker.tick().await;
            let Some(addr) = self.address_of(&name) else {
                debug!(peer = %name, "Prober stopping, peer gone");
                return;
            };

            let result = self
                .config
                .retry
                .run("probe", |_| self.send_status(addr))
                .await;

            match result {
                Ok(()) => {
                    self.set_presence(&name, PresenceState::Online);
                }
                Err(e) => {
                    warn!(peer = %name, error = %e, "Peer unreachable");
                    if self.set_presence(&name, PresenceState::Offline) {
                        self.notifier.emit(Notification::PeerUnreachable { peer: name.clone() });
                    }
                }
            }
        }
    }

    /// Update presence of a still-known peer. Returns false if it was removed.
    fn set_presence(&self, name: &str, presence: PresenceState) -> bool {
        match self.peers.get_mut(name) {
            Some(mut peer) => {
                peer.presence = presence;
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        for entry in self.probers.iter() {
            entry.value().abort();
        }
        self.probers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;

    /// Dialer for a network where nobody answers.
    struct Unreachable;

    impl Dialer for Unreachable {
        fn dial(&self, addr: SocketAddr) -> BoxFuture<'_, Result<SecureStream, TransportError>> {
            Box::pin(async move { Err(TransportError::Timeout(addr)) })
        }
    }

    fn manager(config: ProbeConfig) -> Arc<DeviceManager> {
        Arc::new(DeviceManager::new(
            NodeId::new(),
            "Alice",
            12345,
            Arc::new(Unreachable),
            Notifier::new(),
            config,
        ))
    }

    fn addr() -> SocketAddr {
        "192.168.1.20:12345".parse().unwrap()
    }

    #[tokio::test]
    async fn test_resolve_then_remove() {
        let devices = manager(ProbeConfig::default());
        let name = format!("Bob_{}", NodeId::new());

        devices.on_peer_resolved(&name, addr());
        let peer = devices.peer(&name).unwrap();
        assert_eq!(peer.presence, PresenceState::Online);
        assert!(peer.stable_id.is_some());

        devices.on_peer_removed(&name);
        assert!(devices.peer(&name).is_none());
        assert!(devices.probers.is_empty());
    }

    #[tokio::test]
    async fn test_status_does_not_resurrect() {
        let devices = manager(ProbeConfig::default());
        let id = NodeId::new();
        let name = format!("Bob_{id}");
        devices.on_peer_resolved(&name, addr());
        devices.on_peer_removed(&name);

        devices.handle_status(
            &id.to_string(),
            addr().ip(),
            &StatusFrame {
                display_name: name.clone(),
                user_status: "busy".into(),
            },
        );
        assert!(devices.peers().is_empty());
    }

    #[tokio::test]
    async fn test_status_cannot_speak_for_another_peer() {
        let devices = manager(ProbeConfig::default());
        let (bob_id, carol_id) = (NodeId::new(), NodeId::new());
        let bob = format!("Bob_{bob_id}");
        let carol = format!("Carol_{carol_id}");
        devices.on_peer_resolved(&bob, addr());
        devices.on_peer_resolved(&carol, "192.168.1.21:12345".parse().unwrap());

        // Carol claims Bob's name
        devices.handle_status(
            &carol_id.to_string(),
            "192.168.1.21".parse().unwrap(),
            &StatusFrame {
                display_name: bob.clone(),
                user_status: "gone fishing".into(),
            },
        );

        assert_eq!(devices.peer(&bob).unwrap().user_status, "");
        assert_eq!(devices.peer(&carol).unwrap().user_status, "gone fishing");
        devices.shutdown();
    }

    #[tokio::test]
    async fn test_manual_peer_binds_on_first_status() {
        let devices = manager(ProbeConfig::default());
        let name = devices.add_manual("192.168.1.20").unwrap();
        let id = NodeId::new();
        let frame = StatusFrame {
            display_name: format!("Bob_{id}"),
            user_status: "lunch".into(),
        };

        // a different address does not match the manual entry
        devices.handle_status(&id.to_string(), "10.9.9.9".parse().unwrap(), &frame);
        assert_eq!(devices.peer(&name).unwrap().user_status, "");

        devices.handle_status(&id.to_string(), addr().ip(), &frame);
        let peer = devices.peer(&name).unwrap();
        assert_eq!(peer.user_status, "lunch");
        assert_eq!(peer.stable_id, Some(id));
        assert_eq!(devices.name_for_id(&id.to_string()), Some(name));
        devices.shutdown();
    }

    #[tokio::test]
    async fn test_own_advert_ignored() {
        let devices = manager(ProbeConfig::default());
        let advert = devices.register_self("Alice");
        devices.on_peer_resolved(&advert.instance_name, addr());
        assert!(devices.peers().is_empty());
    }

    #[tokio::test]
    async fn test_manual_add_validates() {
        let devices = manager(ProbeConfig::default());
        assert_eq!(
            devices.add_manual("192.168.1.300"),
            Err(ValidationError::InvalidAddress("192.168.1.300".into()))
        );
        assert!(devices.add_manual("not-an-ip").is_err());
        assert!(devices.peers().is_empty());

        let name = devices.add_manual("192.168.1.20").unwrap();
        assert_eq!(name, "Manual_192_168_1_20");
        assert_eq!(devices.address_of(&name), Some(addr()));
    }

    #[tokio::test]
    async fn test_unreachable_peer_goes_offline() {
        let devices = manager(ProbeConfig {
            interval: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(20),
            retry: RetryPolicy::new(2, Duration::from_millis(5)),
        });
        let mut rx = devices.notifier.subscribe();
        devices.on_peer_resolved("Bob_x", addr());

        let unreachable = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(Notification::PeerUnreachable { peer }) = rx.recv().await {
                    return peer;
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(unreachable, "Bob_x");
        assert_eq!(devices.peer("Bob_x").unwrap().presence, PresenceState::Offline);
        devices.shutdown();
    }

    #[tokio::test]
    async fn test_broadcast_failures_are_independent() {
        let devices = manager(ProbeConfig::default());
        devices.add_manual("10.0.0.1").unwrap();
        devices.add_manual("10.0.0.2").unwrap();

        assert_eq!(devices.broadcast_status("away").await, 0);
        assert_eq!(devices.user_status(), "away");
        devices.shutdown();
    }
}
