//! Inbound connection handling.
//!
//! Each accepted connection gets its own task: handshake, then a loop of
//! frames routed by their type tag. CHAT and FILE frames are gated on the
//! sender id before their body is read.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use lanshare_shared::protocol::{ChatFrame, FrameKind, Preamble, StatusFrame};
use lanshare_shared::types::is_valid_node_id;

use crate::chat::ChatTransport;
use crate::devices::DeviceManager;
use crate::error::NetError;
use crate::policy::{BlockKind, PolicyBook};
use crate::transfer::TransferEngine;
use crate::transport::{IncomingConnection, SecureListener};
use crate::update::UpdateCoordinator;

/// Whether a frame may be processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    InvalidSender,
    Blocked,
}

pub struct Dispatcher {
    devices: Arc<DeviceManager>,
    transfers: Arc<TransferEngine>,
    chat: Arc<ChatTransport>,
    updates: Arc<UpdateCoordinator>,
    policies: Arc<PolicyBook>,
}

impl Dispatcher {
    pub fn new(
        devices: Arc<DeviceManager>,
        transfers: Arc<TransferEngine>,
        chat: Arc<ChatTransport>,
        updates: Arc<UpdateCoordinator>,
        policies: Arc<PolicyBook>,
    ) -> Self {
        Self {
            devices,
            transfers,
            chat,
            updates,
            policies,
        }
    }

    /// Accept connections forever, one task per connection.
    pub async fn serve(self: Arc<Self>, listener: SecureListener) {
        loop {
            match listener.accept().await {
                Ok(incoming) => {
                    let dispatcher = self.clone();
                    tokio::spawn(async move { dispatcher.handle_connection(incoming).await });
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, incoming: IncomingConnection) {
        let peer = incoming.peer_addr();
        let mut stream = match incoming.handshake().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Inbound handshake failed");
                return;
            }
        };

        if let Err(e) = self.handle_stream(peer.ip(), &mut stream).await {
            debug!(peer = %peer, error = %e, "Connection ended with error");
        }
        let _ = stream.finish().await;
    }

    /// Authorization gate for one frame.
    pub fn admit(&self, sender_id: &str, kind: FrameKind) -> Admission {
        let block = match kind {
            FrameKind::Chat => BlockKind::Messages,
            FrameKind::File => BlockKind::Files,
            _ => return Admission::Accept,
        };
        if !is_valid_node_id(sender_id) {
            return Admission::InvalidSender;
        }
        if self.policies.is_blocked(sender_id, block) {
            return Admission::Blocked;
        }
        Admission::Accept
    }

    /// Route frames from a peer connected from `source` until it closes.
    /// A rejected frame ends the connection without its body being read.
    pub async fn handle_stream<S>(&self, source: IpAddr, stream: &mut S) -> Result<(), NetError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let preamble = match Preamble::read_from(stream).await {
                Ok(p) => p,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let kind = FrameKind::from_tag(&preamble.tag)?;
            let sender = preamble.sender_id;

            match self.admit(&sender, kind) {
                Admission::Accept => {}
                verdict => {
                    info!(sender = %sender, kind = %kind, verdict = ?verdict, "Frame dropped");
                    return Ok(());
                }
            }

            match kind {
                FrameKind::Chat => {
                    let frame = ChatFrame::read_from(stream).await?;
                    self.chat.handle_inbound(&sender, &frame);
                }
                FrameKind::File => {
                    self.transfers.receive(&sender, stream).await?;
                }
                FrameKind::Status => {
                    let frame = StatusFrame::read_from(stream).await?;
                    self.devices.handle_status(&sender, source, &frame);
                }
                FrameKind::Version => {
                    self.updates.handle_version_query(&sender, stream).await?;
                }
                FrameKind::Update => {
                    self.updates.serve_package(stream).await?;
                }
            }
        }
    }
}
