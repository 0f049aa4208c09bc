//! One remote peer: connection, version handshake, and the typed
//! message pump feeding the group's event loop.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::chain::unix_time;
use crate::params::NetworkParameters;
use crate::primitives::encode::ProtocolError;

use super::codec::{decode_envelope, decode_payload, frame_message, ENVELOPE_LEN};
use super::messages::{NetAddr, NetworkMessage, VersionMessage, NODE_NETWORK, PROTOCOL_VERSION};

pub type PeerId = u64;

/// Connection lifecycle:
/// `DISCONNECTED -> CONNECTING -> HANDSHAKE -> READY -> CLOSING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    Handshake,
    Ready,
    Closing,
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connected to ourselves (nonce match)")]
    SelfConnection,

    #[error("peer broke the handshake sequence")]
    HandshakeOutOfOrder,

    #[error("timed out")]
    Timeout,
}

impl PeerError {
    /// Misbehavior (as opposed to plain connectivity loss) earns a ban.
    pub fn is_misbehavior(&self) -> bool {
        matches!(
            self,
            PeerError::Protocol(_) | PeerError::HandshakeOutOfOrder
        )
    }
}

/// Events every peer task feeds into the single chain+wallet worker.
#[derive(Debug)]
pub enum PeerEvent {
    Connected {
        peer: PeerId,
        version: VersionMessage,
    },
    Message {
        peer: PeerId,
        message: NetworkMessage,
    },
    Disconnected {
        peer: PeerId,
        misbehaved: bool,
        reason: String,
    },
}

/// The group's grip on a live peer: the outbound queue plus the
/// bookkeeping used for download-peer election.
#[derive(Debug)]
pub struct PeerHandle {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub sender: mpsc::UnboundedSender<NetworkMessage>,
    pub state: PeerState,
    pub best_height: i32,
    pub latency: Option<Duration>,
    pub filter_loaded: bool,
    pub ping_sent: Option<(u64, Instant)>,
}

impl PeerHandle {
    pub fn send(&self, message: NetworkMessage) {
        // A closed channel means the peer task is already winding down;
        // the Disconnected event will clean this handle up.
        let _ = self.sender.send(message);
    }
}

/// Handshake parameters shared by every outbound connection.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub user_agent: String,
    pub start_height: i32,
    /// Our random nonce, for self-connection detection.
    pub nonce: u64,
    pub handshake_timeout: Duration,
}

fn local_version(config: &HandshakeConfig, remote: SocketAddr) -> VersionMessage {
    VersionMessage {
        version: PROTOCOL_VERSION,
        services: 0,
        timestamp: unix_time() as i64,
        receiver: NetAddr::new(remote, NODE_NETWORK),
        sender: NetAddr::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            0,
        ),
        nonce: config.nonce,
        user_agent: config.user_agent.clone(),
        start_height: config.start_height,
        // BIP37: no relay until our filter is loaded.
        relay: false,
    }
}

pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    magic: u32,
) -> Result<NetworkMessage, PeerError> {
    let mut head = [0u8; ENVELOPE_LEN];
    reader.read_exact(&mut head).await?;
    let envelope = decode_envelope(magic, &head)?;
    let mut payload = vec![0u8; envelope.length as usize];
    reader.read_exact(&mut payload).await?;
    Ok(decode_payload(&envelope, &payload)?)
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    magic: u32,
    message: &NetworkMessage,
) -> Result<(), PeerError> {
    writer.write_all(&frame_message(magic, message)).await?;
    writer.flush().await?;
    Ok(())
}

/// Exchange version/verack. Returns the remote's version message.
async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    params: &NetworkParameters,
    config: &HandshakeConfig,
    remote: SocketAddr,
) -> Result<VersionMessage, PeerError> {
    write_message(
        stream,
        params.magic,
        &NetworkMessage::Version(local_version(config, remote)),
    )
    .await?;

    let mut remote_version: Option<VersionMessage> = None;
    let mut got_verack = false;
    while remote_version.is_none() || !got_verack {
        match read_message(stream, params.magic).await? {
            NetworkMessage::Version(v) => {
                if v.nonce == config.nonce {
                    return Err(PeerError::SelfConnection);
                }
                if remote_version.replace(v).is_some() {
                    return Err(PeerError::HandshakeOutOfOrder);
                }
                write_message(stream, params.magic, &NetworkMessage::Verack).await?;
            }
            NetworkMessage::Verack => {
                if got_verack {
                    return Err(PeerError::HandshakeOutOfOrder);
                }
                got_verack = true;
            }
            // Nodes may send reject/alert mid-handshake; skip them.
            NetworkMessage::Reject(r) => {
                log::debug!("reject during handshake from {}: {}", remote, r.reason);
            }
            NetworkMessage::Alert | NetworkMessage::Unknown { .. } => {}
            _ => return Err(PeerError::HandshakeOutOfOrder),
        }
    }
    Ok(remote_version.expect("loop exits only when set"))
}

/// Drive an established stream: handshake, then pump messages both
/// ways until either side ends. Emits `Connected` once READY and a
/// final `Disconnected` on the way out.
pub async fn run_peer_on<S: AsyncRead + AsyncWrite + Unpin + Send + 'static>(
    id: PeerId,
    remote: SocketAddr,
    stream: S,
    params: Arc<NetworkParameters>,
    config: HandshakeConfig,
    mut outbound: mpsc::UnboundedReceiver<NetworkMessage>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let result = async {
        let mut stream = stream;
        let version = tokio::time::timeout(
            config.handshake_timeout,
            handshake(&mut stream, &params, &config, remote),
        )
        .await
        .map_err(|_| PeerError::Timeout)??;

        log::info!(
            "peer {} ready: {} height {} ({})",
            remote,
            version.user_agent,
            version.start_height,
            version.version
        );
        let _ = events.send(PeerEvent::Connected { peer: id, version });

        // Writes get their own task so a half-read inbound frame is
        // never abandoned mid-parse. The write task also doubles as
        // the close signal: the group evicts a peer by dropping its
        // outbound sender.
        let (mut reader, mut writer) = tokio::io::split(stream);
        let magic = params.magic;
        let mut write_task = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                if write_message(&mut writer, magic, &message).await.is_err() {
                    break;
                }
            }
        });

        let outcome = loop {
            tokio::select! {
                inbound = read_message(&mut reader, params.magic) => {
                    match inbound {
                        Ok(message) => {
                            if events.send(PeerEvent::Message { peer: id, message }).is_err() {
                                break Ok(()); // group shut down
                            }
                        }
                        Err(e) => break Err(e),
                    }
                }
                // Outbound channel closed: the connection is being
                // discarded whole, so cancelling a partial read is fine.
                _ = &mut write_task => break Ok(()),
            }
        };
        write_task.abort();
        outcome
    }
    .await;

    let (misbehaved, reason) = match result {
        Ok(()) => (false, "closed".to_string()),
        Err(e) => (e.is_misbehavior(), e.to_string()),
    };
    let _ = events.send(PeerEvent::Disconnected {
        peer: id,
        misbehaved,
        reason,
    });
}

/// Connect over TCP and run the peer to completion.
pub async fn run_peer(
    id: PeerId,
    addr: SocketAddr,
    connect_timeout: Duration,
    params: Arc<NetworkParameters>,
    config: HandshakeConfig,
    outbound: mpsc::UnboundedReceiver<NetworkMessage>,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            stream
        }
        Ok(Err(e)) => {
            let _ = events.send(PeerEvent::Disconnected {
                peer: id,
                misbehaved: false,
                reason: format!("connect failed: {}", e),
            });
            return;
        }
        Err(_) => {
            let _ = events.send(PeerEvent::Disconnected {
                peer: id,
                misbehaved: false,
                reason: "connect timed out".to_string(),
            });
            return;
        }
    };
    run_peer_on(id, addr, stream, params, config, outbound, events).await;
}
