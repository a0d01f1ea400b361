//! Zero-configuration discovery.
//!
//! The core only sees [`DiscoveryEvent`]s on a channel. The adapter here
//! runs a libp2p swarm with mDNS (who is on the LAN) and Identify (what
//! service each node advertises). A node's advert travels in its identify
//! agent string as `lanshare/<instance name>/<port>`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::StreamExt;
use libp2p::{identify, mdns, multiaddr::Protocol, swarm::NetworkBehaviour, swarm::SwarmEvent};
use libp2p::{Multiaddr, PeerId, SwarmBuilder};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use lanshare_shared::constants::{AGENT_PREFIX, PROTOCOL_VERSION};

/// Signals pushed by a discovery adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found { name: String },
    Resolved { name: String, address: SocketAddr },
    Lost { name: String },
}

/// What this node publishes about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAdvert {
    pub instance_name: String,
    pub port: u16,
}

impl ServiceAdvert {
    pub fn agent_version(&self) -> String {
        format!("{AGENT_PREFIX}/{}/{}", self.instance_name, self.port)
    }
}

/// Parse `lanshare/<instance>/<port>` back into an advert.
pub fn parse_agent(agent: &str) -> Option<ServiceAdvert> {
    let rest = agent.strip_prefix(AGENT_PREFIX)?.strip_prefix('/')?;
    let (instance_name, port) = rest.rsplit_once('/')?;
    if instance_name.is_empty() {
        return None;
    }
    Some(ServiceAdvert {
        instance_name: instance_name.to_string(),
        port: port.parse().ok()?,
    })
}

fn ip_of(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        _ => None,
    })
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "LanBehaviourEvent")]
pub struct LanBehaviour {
    pub mdns: mdns::tokio::Behaviour,
    pub identify: identify::Behaviour,
}

#[derive(Debug)]
pub enum LanBehaviourEvent {
    Mdns(mdns::Event),
    Identify(identify::Event),
}

impl From<mdns::Event> for LanBehaviourEvent {
    fn from(event: mdns::Event) -> Self {
        LanBehaviourEvent::Mdns(event)
    }
}

impl From<identify::Event> for LanBehaviourEvent {
    fn from(event: identify::Event) -> Self {
        LanBehaviourEvent::Identify(event)
    }
}

/// Commands sent into the discovery task.
#[derive(Debug)]
pub enum DiscoveryCommand {
    /// Instance names resolved so far.
    KnownServices(oneshot::Sender<Vec<String>>),
    Shutdown,
}

fn build_swarm(advert: &ServiceAdvert) -> anyhow::Result<libp2p::Swarm<LanBehaviour>> {
    let agent = advert.agent_version();
    let swarm = SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::default(),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )?
        .with_behaviour(
            |key| -> std::result::Result<LanBehaviour, Box<dyn std::error::Error + Send + Sync>> {
                let local_peer_id = key.public().to_peer_id();
                let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?;
                let identify = identify::Behaviour::new(
                    identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                        .with_agent_version(agent),
                );
                Ok(LanBehaviour { mdns, identify })
            },
        )?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();
    Ok(swarm)
}

/// Spawn the mDNS adapter. Events for other nodes are pushed to `events`.
pub fn spawn_mdns(
    advert: ServiceAdvert,
    events: mpsc::Sender<DiscoveryEvent>,
) -> anyhow::Result<mpsc::Sender<DiscoveryCommand>> {
    let mut swarm = build_swarm(&advert)?;
    swarm.listen_on("/ip4/0.0.0.0/tcp/0".parse()?)?;
    info!(
        peer_id = %swarm.local_peer_id(),
        instance = %advert.instance_name,
        "Discovery started"
    );

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<DiscoveryCommand>(256);

    tokio::spawn(async move {
        let mut addresses: HashMap<PeerId, IpAddr> = HashMap::new();
        let mut services: HashMap<PeerId, String> = HashMap::new();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(DiscoveryCommand::KnownServices(reply)) => {
                            let _ = reply.send(services.values().cloned().collect());
                        }
                        Some(DiscoveryCommand::Shutdown) | None => {
                            info!("Discovery shutting down");
                            break;
                        }
                    }
                }

                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::Behaviour(LanBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
                            for (peer_id, addr) in list {
                                if let Some(ip) = ip_of(&addr) {
                                    addresses.entry(peer_id).or_insert(ip);
                                }
                                if !swarm.is_connected(&peer_id) {
                                    debug!(peer = %peer_id, addr = %addr, "mDNS: dialing");
                                    if let Err(e) = swarm.dial(addr) {
                                        debug!(peer = %peer_id, error = %e, "mDNS dial failed");
                                    }
                                }
                            }
                        }

                        SwarmEvent::Behaviour(LanBehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
                            for (peer_id, _) in list {
                                let still_seen = swarm
                                    .behaviour()
                                    .mdns
                                    .discovered_nodes()
                                    .any(|p| *p == peer_id);
                                if still_seen {
                                    continue;
                                }
                                addresses.remove(&peer_id);
                                if let Some(name) = services.remove(&peer_id) {
                                    info!(name = %name, "Service lost");
                                    let _ = events.send(DiscoveryEvent::Lost { name }).await;
                                }
                            }
                        }

                        SwarmEvent::Behaviour(LanBehaviourEvent::Identify(
                            identify::Event::Received { peer_id, info, .. },
                        )) => {
                            let Some(remote) = parse_agent(&info.agent_version) else {
                                debug!(peer = %peer_id, agent = %info.agent_version, "Not a lanshare node");
                                continue;
                            };
                            let Some(ip) = addresses.get(&peer_id).copied() else {
                                warn!(peer = %peer_id, "Identify before any address is known");
                                continue;
                            };
                            if services.get(&peer_id) == Some(&remote.instance_name) {
                                continue;
                            }
                            services.insert(peer_id, remote.instance_name.clone());
                            let name = remote.instance_name;
                            let address = SocketAddr::new(ip, remote.port);
                            info!(name = %name, addr = %address, "Service resolved");
                            let _ = events.send(DiscoveryEvent::Found { name: name.clone() }).await;
                            let _ = events.send(DiscoveryEvent::Resolved { name, address }).await;
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                            if let Some(ip) = ip_of(endpoint.get_remote_address()) {
                                addresses.entry(peer_id).or_insert(ip);
                            }
                        }

                        SwarmEvent::NewListenAddr { address, .. } => {
                            debug!(addr = %address, "Discovery listening");
                        }

                        _ => {}
                    }
                }
            }
        }
    });

    Ok(cmd_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_roundtrip() {
        let advert = ServiceAdvert {
            instance_name: "Alice_a1b2c3d4-0000-4000-8000-000000000000".into(),
            port: 12345,
        };
        assert_eq!(parse_agent(&advert.agent_version()), Some(advert));
    }

    #[test]
    fn test_foreign_agents_ignored() {
        assert_eq!(parse_agent("rust-libp2p/0.54"), None);
        assert_eq!(parse_agent("lanshare/Alice"), None);
        assert_eq!(parse_agent("lanshare//12345"), None);
        assert_eq!(parse_agent("lanshare/Alice/notaport"), None);
    }

    #[test]
    fn test_ip_from_multiaddr() {
        let addr: Multiaddr = "/ip4/192.168.1.20/tcp/4001".parse().unwrap();
        assert_eq!(ip_of(&addr), Some("192.168.1.20".parse().unwrap()));
        let v6: Multiaddr = "/ip6/::1/tcp/4001".parse().unwrap();
        assert_eq!(ip_of(&v6), None);
    }
}
