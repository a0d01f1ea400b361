//! Authenticated TCP transport.
//!
//! Every connection runs a Noise `XXpsk3` handshake: both ends present a
//! static X25519 key and prove knowledge of the network secret. After the
//! handshake a pair of pump tasks seal and open length-prefixed Noise
//! messages, and the application sees a plain byte stream.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use snow::{HandshakeState, TransportState};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lanshare_shared::constants::{NOISE_MAX_MESSAGE, NOISE_TAG_LEN};
use lanshare_shared::error::NoiseError;
use lanshare_shared::identity::Keystore;
use lanshare_shared::noise;

use crate::error::TransportError;

/// Largest plaintext carried by one Noise transport message.
const MAX_PLAINTEXT: usize = NOISE_MAX_MESSAGE - NOISE_TAG_LEN;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Upper bound for an inbound handshake, so an idle client cannot pin a task.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &[u8]) -> io::Result<()> {
    w.write_u16(msg.len() as u16).await?;
    w.write_all(msg).await
}

async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Vec<u8>> {
    let len = r.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

fn handshake_error(e: snow::Error) -> TransportError {
    TransportError::Handshake(NoiseError::Handshake(e.to_string()))
}

async fn run_handshake(
    tcp: &mut TcpStream,
    mut state: HandshakeState,
    keystore: &Keystore,
) -> Result<(TransportState, Vec<u8>), TransportError> {
    let mut buf = vec![0u8; NOISE_MAX_MESSAGE];
    let mut scratch = vec![0u8; NOISE_MAX_MESSAGE];

    // The initiator speaks first; turns alternate until the pattern is done.
    let mut our_turn = state.is_initiator();
    while !state.is_handshake_finished() {
        if our_turn {
            let len = state.write_message(&[], &mut buf).map_err(handshake_error)?;
            write_message(tcp, &buf[..len]).await?;
        } else {
            let msg = read_message(tcp).await?;
            state
                .read_message(&msg, &mut scratch)
                .map_err(handshake_error)?;
        }
        our_turn = !our_turn;
    }

    let (transport, remote_static) = noise::into_transport(state)?;
    if !keystore.is_trusted(&remote_static) {
        return Err(TransportError::UntrustedPeer);
    }
    Ok((transport, remote_static))
}

/// Factory for authenticated listeners and connections.
#[derive(Clone)]
pub struct SecureTransport {
    keystore: Arc<Keystore>,
}

impl SecureTransport {
    pub fn new(keystore: Keystore) -> Self {
        Self {
            keystore: Arc::new(keystore),
        }
    }

    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    /// Bind `0.0.0.0:port`. Port 0 picks a free port.
    pub async fn listen(&self, port: u16) -> Result<SecureListener, TransportError> {
        let inner = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| TransportError::Bind { port, source })?;
        let local = inner.local_addr()?;
        info!(addr = %local, "Secure listener bound");
        Ok(SecureListener {
            inner,
            keystore: self.keystore.clone(),
        })
    }

    /// Connect and complete the handshake before returning.
    pub async fn connect(&self, addr: SocketAddr) -> Result<SecureStream, TransportError> {
        let mut tcp = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect { addr, source })?;
        tcp.set_nodelay(true)?;

        let state = noise::build_initiator(&self.keystore.static_secret, &self.keystore.network_psk)?;
        let (transport, remote_static) = run_handshake(&mut tcp, state, &self.keystore).await?;
        debug!(peer = %addr, "Outbound handshake complete");
        Ok(SecureStream::establish(tcp, transport, remote_static, addr))
    }

    pub async fn connect_timeout(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<SecureStream, TransportError> {
        tokio::time::timeout(timeout, self.connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(addr))?
    }
}

/// Opens outbound connections. Components take `Arc<dyn Dialer>` so tests
/// can inject failures.
pub trait Dialer: Send + Sync {
    fn dial(&self, addr: SocketAddr) -> BoxFuture<'_, Result<SecureStream, TransportError>>;
}

impl Dialer for SecureTransport {
    fn dial(&self, addr: SocketAddr) -> BoxFuture<'_, Result<SecureStream, TransportError>> {
        Box::pin(self.connect(addr))
    }
}

pub struct SecureListener {
    inner: TcpListener,
    keystore: Arc<Keystore>,
}

impl SecureListener {
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept a TCP connection. The handshake runs in
    /// [`IncomingConnection::handshake`] so the accept loop never waits on it.
    pub async fn accept(&self) -> Result<IncomingConnection, TransportError> {
        let (tcp, peer_addr) = self.inner.accept().await?;
        Ok(IncomingConnection {
            tcp,
            peer_addr,
            keystore: self.keystore.clone(),
        })
    }
}

pub struct IncomingConnection {
    tcp: TcpStream,
    peer_addr: SocketAddr,
    keystore: Arc<Keystore>,
}

impl IncomingConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn handshake(self) -> Result<SecureStream, TransportError> {
        let Self {
            mut tcp,
            peer_addr,
            keystore,
        } = self;
        tcp.set_nodelay(true)?;
        let state = noise::build_responder(&keystore.static_secret, &keystore.network_psk)?;
        let (transport, remote_static) =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, run_handshake(&mut tcp, state, &keystore))
                .await
                .map_err(|_| TransportError::Timeout(peer_addr))??;
        debug!(peer = %peer_addr, "Inbound handshake complete");
        Ok(SecureStream::establish(tcp, transport, remote_static, peer_addr))
    }
}

/// Plain byte stream over an established Noise session.
pub struct SecureStream {
    inner: DuplexStream,
    outbound: Option<JoinHandle<()>>,
    inbound: JoinHandle<()>,
    peer_addr: SocketAddr,
    remote_static: Vec<u8>,
}

impl SecureStream {
    fn establish(
        tcp: TcpStream,
        transport: TransportState,
        remote_static: Vec<u8>,
        peer_addr: SocketAddr,
    ) -> Self {
        let (tcp_read, tcp_write) = tcp.into_split();
        let (app, pump) = tokio::io::duplex(PIPE_CAPACITY);
        let (pump_read, pump_write) = tokio::io::split(pump);
        let state = Arc::new(Mutex::new(transport));

        let outbound = tokio::spawn(pump_outbound(pump_read, tcp_write, state.clone()));
        let inbound = tokio::spawn(pump_inbound(tcp_read, pump_write, state));

        Self {
            inner: app,
            outbound: Some(outbound),
            inbound,
            peer_addr,
            remote_static,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn remote_static(&self) -> &[u8] {
        &self.remote_static
    }

    /// Close our sending side and wait until everything written so far has
    /// left the socket.
    pub async fn finish(&mut self) -> io::Result<()> {
        self.inner.shutdown().await?;
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.await;
        }
        Ok(())
    }
}

impl Drop for SecureStream {
    fn drop(&mut self) {
        self.inbound.abort();
    }
}

impl AsyncRead for SecureStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SecureStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

async fn pump_outbound(
    mut plain: ReadHalf<DuplexStream>,
    mut tcp: OwnedWriteHalf,
    state: Arc<Mutex<TransportState>>,
) {
    let mut buf = vec![0u8; MAX_PLAINTEXT];
    loop {
        let n = match plain.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Outbound pipe closed");
                break;
            }
        };
        let sealed = {
            let Ok(mut transport) = state.lock() else {
                break;
            };
            match noise::transport_encrypt(&mut transport, &buf[..n]) {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!(error = %e, "Failed to seal outbound message");
                    break;
                }
            }
        };
        if let Err(e) = write_message(&mut tcp, &sealed).await {
            debug!(error = %e, "Outbound socket closed");
            break;
        }
    }
    let _ = tcp.shutdown().await;
}

async fn pump_inbound(
    mut tcp: OwnedReadHalf,
    mut plain: WriteHalf<DuplexStream>,
    state: Arc<Mutex<TransportState>>,
) {
    loop {
        let sealed = match read_message(&mut tcp).await {
            Ok(m) => m,
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    debug!(error = %e, "Inbound socket error");
                }
                break;
            }
        };
        let opened = {
            let Ok(mut transport) = state.lock() else {
                break;
            };
            match noise::transport_decrypt(&mut transport, &sealed) {
                Ok(opened) => opened,
                Err(e) => {
                    warn!(error = %e, "Dropping connection after undecryptable message");
                    break;
                }
            }
        };
        if plain.write_all(&opened).await.is_err() {
            break;
        }
    }
    let _ = plain.shutdown().await;
}
