//! Direct and group chat.
//!
//! Direct messages go over the secure transport as CHAT frames. Group
//! messages are single encrypted UDP datagrams of the form
//! `<display name>_<sender id>: <body>` sent to a multicast group.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use lanshare_shared::constants::{CHAT_WORKERS, MAX_DATAGRAM_SIZE, MULTICAST_GROUP, MULTICAST_PORT};
use lanshare_shared::crypto::MessageCipher;
use lanshare_shared::protocol::{ChatFrame, FrameKind, Preamble};
use lanshare_shared::retry::RetryPolicy;
use lanshare_shared::types::{is_valid_node_id, Direction};
use lanshare_store::{ChatRecord, Journal};

use crate::devices::DeviceManager;
use crate::error::{NetError, TransportError};
use crate::notify::{Notification, Notifier};
use crate::policy::{BlockKind, PolicyBook};
use crate::pool::WorkerPool;
use crate::transport::Dialer;

/// Journal peer name for messages sent to the multicast group.
const GROUP_PEER: &str = "group";

#[derive(Debug, Clone, Copy)]
pub struct ChatConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub retry: RetryPolicy,
    pub workers: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::from(MULTICAST_GROUP),
            port: MULTICAST_PORT,
            retry: RetryPolicy::default(),
            workers: CHAT_WORKERS,
        }
    }
}

/// A parsed group datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    /// `<display name>_<sender id>`
    pub from: String,
    pub sender_id: String,
    pub body: String,
}

/// Split `<display>_<id>: <body>`. The id must have the node id shape.
pub fn parse_group_message(text: &str) -> Option<GroupMessage> {
    let (from, body) = text.split_once(": ")?;
    let (_, sender_id) = from.rsplit_once('_')?;
    if !is_valid_node_id(sender_id) {
        return None;
    }
    Some(GroupMessage {
        from: from.to_string(),
        sender_id: sender_id.to_string(),
        body: body.to_string(),
    })
}

/// UDP socket bound to the group port with address reuse, so several
/// nodes on one host can listen.
fn multicast_socket(group: Ipv4Addr, port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

pub struct ChatTransport {
    local_id: String,
    devices: Arc<DeviceManager>,
    dialer: Arc<dyn Dialer>,
    cipher: MessageCipher,
    journal: Journal,
    notifier: Notifier,
    policies: Arc<PolicyBook>,
    pool: WorkerPool,
    config: ChatConfig,
}

impl ChatTransport {
    pub fn new(
        devices: Arc<DeviceManager>,
        dialer: Arc<dyn Dialer>,
        cipher: MessageCipher,
        journal: Journal,
        notifier: Notifier,
        policies: Arc<PolicyBook>,
        config: ChatConfig,
    ) -> Self {
        Self {
            local_id: devices.local_id().to_string(),
            devices,
            dialer,
            cipher,
            journal,
            notifier,
            policies,
            pool: WorkerPool::new(config.workers),
            config,
        }
    }

    // ------------------------------------------------------------------
    // Direct
    // ------------------------------------------------------------------

    /// Encrypt and deliver `message` to a known peer.
    pub async fn send_direct(&self, peer: &str, message: &str) -> Result<(), NetError> {
        let encrypted = self.cipher.encrypt(message)?;
        let frame = &ChatFrame {
            encrypted_message: encrypted,
        };

        self.pool
            .run(self.config.retry.run("send_chat", |_| async move {
                let addr = self.devices.resolve(peer)?;
                let mut stream = self.dialer.dial(addr).await?;
                Preamble::write_to(&mut stream, &self.local_id, FrameKind::Chat).await?;
                frame.write_to(&mut stream).await?;
                stream.flush().await?;
                stream.finish().await?;
                Ok::<_, NetError>(())
            }))
            .await?;

        self.record(peer, message, Direction::Sent);
        debug!(peer = %peer, "Chat sent");
        self.notifier.emit(Notification::ChatSent {
            text: format!("{peer}: {message}"),
        });
        Ok(())
    }

    /// Inbound CHAT frame that already passed the dispatcher's gate.
    pub fn handle_inbound(&self, sender_id: &str, frame: &ChatFrame) -> String {
        let text = self.cipher.decrypt(&frame.encrypted_message);
        let from = self
            .devices
            .name_for_id(sender_id)
            .unwrap_or_else(|| sender_id.to_string());
        self.record(&from, &text, Direction::Received);
        self.notifier.emit(Notification::ChatReceived {
            from,
            text: text.clone(),
        });
        text
    }

    // ------------------------------------------------------------------
    // Group
    // ------------------------------------------------------------------

    /// Receive group datagrams until the socket fails.
    pub async fn listen_multicast(self: Arc<Self>) -> Result<(), NetError> {
        let port = self.config.port;
        let socket = multicast_socket(self.config.group, port)
            .map_err(|source| TransportError::Bind { port, source })?;
        info!(group = %self.config.group, port, "Listening for group messages");

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await?;
            if self.process_datagram(&buf[..n]).is_none() {
                debug!(from = %from, "Group datagram skipped");
            }
        }
    }

    /// Decrypt, parse and record one datagram. Returns `None` for our own,
    /// malformed or blocked messages.
    pub fn process_datagram(&self, raw: &[u8]) -> Option<GroupMessage> {
        let text = self.cipher.decrypt(&String::from_utf8_lossy(raw));
        let Some(message) = parse_group_message(&text) else {
            warn!(len = raw.len(), "Unparseable group message");
            return None;
        };
        if message.sender_id == self.local_id {
            return None;
        }
        if self
            .policies
            .is_blocked(&message.sender_id, BlockKind::Messages)
        {
            debug!(sender = %message.sender_id, "Group message from blocked sender dropped");
            return None;
        }

        self.record(&message.from, &message.body, Direction::Received);
        self.notifier.emit(Notification::GroupMessage {
            from: message.from.clone(),
            text: message.body.clone(),
        });
        Some(message)
    }

    async fn send_datagram(&self, body: &str) -> Result<(), NetError> {
        let text = format!("{}: {body}", self.devices.instance_name());
        let encrypted = self.cipher.encrypt(&text)?;
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket
            .send_to(encrypted.as_bytes(), (self.config.group, self.config.port))
            .await?;
        Ok(())
    }

    pub async fn broadcast_multicast(&self, message: &str) -> Result<(), NetError> {
        self.send_datagram(message).await?;
        self.record(GROUP_PEER, message, Direction::Sent);
        debug!("Group message sent");
        Ok(())
    }

    /// Echo a local notification to the group. Chat notifications are not
    /// relayed, otherwise group messages would bounce between nodes.
    pub async fn relay_notification(&self, notification: &Notification) -> bool {
        let relayed = !matches!(
            notification,
            Notification::ChatSent { .. }
                | Notification::ChatReceived { .. }
                | Notification::GroupMessage { .. }
                | Notification::PeerOnline { .. }
        );
        if !relayed {
            return false;
        }
        if let Err(e) = self.send_datagram(&notification.to_string()).await {
            warn!(error = %e, "Failed to relay notification");
            return false;
        }
        true
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub fn history(&self) -> Result<Vec<ChatRecord>, NetError> {
        Ok(self.journal.with(|db| db.list_chats())?)
    }

    pub fn search(&self, keyword: &str) -> Result<Vec<ChatRecord>, NetError> {
        Ok(self.journal.with(|db| db.search_chats(keyword))?)
    }

    fn record(&self, peer: &str, message: &str, direction: Direction) {
        if let Err(e) = self
            .journal
            .with(|db| db.insert_chat(peer, message, direction))
        {
            warn!(peer = %peer, error = %e, "Failed to log chat");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::ProbeConfig;
    use crate::transport::SecureStream;
    use futures::future::BoxFuture;
    use lanshare_shared::types::NodeId;

    struct NoNetwork;

    impl Dialer for NoNetwork {
        fn dial(&self, addr: SocketAddr) -> BoxFuture<'_, Result<SecureStream, TransportError>> {
            Box::pin(async move { Err(TransportError::Timeout(addr)) })
        }
    }

    fn chat(cipher: MessageCipher) -> (ChatTransport, Journal, Arc<PolicyBook>) {
        let journal = Journal::in_memory().unwrap();
        let dialer: Arc<dyn Dialer> = Arc::new(NoNetwork);
        let devices = Arc::new(DeviceManager::new(
            NodeId::new(),
            "Alice",
            12345,
            dialer.clone(),
            Notifier::new(),
            ProbeConfig::default(),
        ));
        let policies = Arc::new(PolicyBook::load(journal.clone()).unwrap());
        let chat = ChatTransport::new(
            devices,
            dialer,
            cipher,
            journal.clone(),
            Notifier::new(),
            policies.clone(),
            ChatConfig::default(),
        );
        (chat, journal, policies)
    }

    #[test]
    fn test_parse_group_message() {
        let id = NodeId::new().to_string();
        let parsed = parse_group_message(&format!("Bob_Smith_{id}: hi: there")).unwrap();
        assert_eq!(parsed.from, format!("Bob_Smith_{id}"));
        assert_eq!(parsed.sender_id, id);
        assert_eq!(parsed.body, "hi: there");

        assert!(parse_group_message("no separator").is_none());
        assert!(parse_group_message("Bob_notanid: hi").is_none());
    }

    #[test]
    fn test_datagram_from_peer_is_recorded() {
        let secret = [7u8; 32];
        let (chat, journal, _) = chat(MessageCipher::from_network_secret(&secret));
        let peer_cipher = MessageCipher::from_network_secret(&secret);
        let id = NodeId::new();
        let datagram = peer_cipher.encrypt(&format!("Bob_{id}: hello group")).unwrap();

        let msg = chat.process_datagram(datagram.as_bytes()).unwrap();
        assert_eq!(msg.body, "hello group");

        let rows = journal.with(|db| db.list_chats()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].direction, Direction::Received);
    }

    #[test]
    fn test_own_and_blocked_datagrams_dropped() {
        let cipher = MessageCipher::from_network_secret(&[1u8; 32]);
        let (chat, journal, policies) = chat(cipher.clone());

        let own = cipher
            .encrypt(&format!("{}: echo", chat.devices.instance_name()))
            .unwrap();
        assert!(chat.process_datagram(own.as_bytes()).is_none());

        let blocked = NodeId::new().to_string();
        policies.set_blocks(&blocked, false, true);
        let spam = cipher.encrypt(&format!("Mallory_{blocked}: buy now")).unwrap();
        assert!(chat.process_datagram(spam.as_bytes()).is_none());

        assert!(journal.with(|db| db.list_chats()).unwrap().is_empty());
    }

    #[test]
    fn test_plaintext_datagram_still_parses() {
        let (chat, _, _) = chat(MessageCipher::ephemeral());
        let id = NodeId::new();
        let raw = format!("Bob_{id}: unencrypted");
        let msg = chat.process_datagram(raw.as_bytes()).unwrap();
        assert_eq!(msg.body, "unencrypted");
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let (chat, _, _) = chat(MessageCipher::ephemeral());
        let err = chat.send_direct("Nobody_1", "hi").await.unwrap_err();
        assert!(matches!(err, NetError::UnknownPeer(_)));
    }
}
