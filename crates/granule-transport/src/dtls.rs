//! DTLS-over-UDP channel (openssl-backed)
//!
//! One UDP socket carries many peers. A reader thread demultiplexes
//! inbound datagrams by peer address: handshake records route into the
//! peer's handshake driver, application records into its established
//! stream. A fresh epoch-0 ClientHello from a known peer replaces that
//! peer's session immediately. (RFC 6347 §4.2.8 wants the new handshake
//! to complete first; replacing eagerly is a known deviation.)
//!
//! CoAP does not rely on DTLS ordering or reliability, so the channel
//! still reports `is_reliable() == false`.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use openssl::ex_data::Index;
use openssl::pkey::PKey;
use openssl::ssl::{
    HandshakeError, Ssl, SslContext, SslContextBuilder, SslMethod, SslStream, SslVerifyMode,
};
use openssl::x509::X509;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::{Channel, ChannelEvent, ChannelReceiver, Datagram, Session, SessionId};

/// DTLS record content type for handshake messages
const CONTENT_TYPE_HANDSHAKE: u8 = 22;
/// Handshake message type for ClientHello
const HANDSHAKE_CLIENT_HELLO: u8 = 1;
/// DTLS record header length
const RECORD_HEADER_LEN: usize = 13;

/// How long a blocked SSL read sleeps before retrying
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

fn psk_identity_index() -> Index<Ssl, String> {
    static INDEX: OnceLock<Index<Ssl, String>> = OnceLock::new();
    *INDEX.get_or_init(|| Ssl::new_ex_index().expect("ssl ex-data index"))
}

/// Pre-shared-key credentials
#[derive(Clone)]
pub struct PskConfig {
    pub identity: String,
    pub key: Vec<u8>,
}

/// DTLS channel configuration
#[derive(Clone, Default)]
pub struct DtlsConfig {
    /// PSK credentials (client offers them, server validates them)
    pub psk: Option<PskConfig>,
    /// PEM certificate + PEM private key; enables the server role and
    /// certificate authentication
    pub certificate: Option<(Vec<u8>, Vec<u8>)>,
    /// Verify the peer's certificate chain (off by default; PSK setups
    /// and tests run without a CA)
    pub verify_peer: bool,
    /// Largest datagram accepted on receive
    pub receive_packet_size: usize,
}

impl DtlsConfig {
    pub fn with_psk(identity: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        DtlsConfig {
            psk: Some(PskConfig {
                identity: identity.into(),
                key: key.into(),
            }),
            certificate: None,
            verify_peer: false,
            receive_packet_size: 4096,
        }
    }
}

/// io adapter: reads come from the demultiplexer's per-peer queue,
/// writes go straight out the shared socket as one datagram per record
struct PeerTransport {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbound: std_mpsc::Receiver<Vec<u8>>,
    /// Prefix of the current datagram not yet consumed by openssl
    pending: Vec<u8>,
}

impl Read for PeerTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.inbound.recv_timeout(RETRY_INTERVAL) {
                Ok(datagram) => self.pending = datagram,
                Err(std_mpsc::RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::WouldBlock, "no datagram"));
                }
                Err(std_mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Write for PeerTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send_to(buf, self.peer)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum PeerState {
    Handshaking,
    Established(Arc<Mutex<SslStream<PeerTransport>>>),
}

struct Peer {
    session: Mutex<Session>,
    inbound_tx: std_mpsc::Sender<Vec<u8>>,
    state: Mutex<PeerState>,
}

/// DTLS channel over one UDP socket
pub struct DtlsChannel {
    socket: Arc<UdpSocket>,
    context: SslContext,
    config: DtlsConfig,
    peers: Arc<DashMap<SocketAddr, Arc<Peer>>>,
    events: Mutex<Option<mpsc::Sender<ChannelEvent>>>,
    reader: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl DtlsChannel {
    /// Bind a DTLS channel. With a certificate it accepts inbound
    /// handshakes; with or without one it can initiate them on send.
    pub fn bind(addr: SocketAddr, config: DtlsConfig) -> Result<Self> {
        let socket = UdpSocket::bind(addr).map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let context = build_context(&config)?;
        info!("dtls channel bound to {}", socket.local_addr()?);
        Ok(DtlsChannel {
            socket: Arc::new(socket),
            context,
            config,
            peers: Arc::new(DashMap::new()),
            events: Mutex::new(None),
            reader: Mutex::new(None),
        })
    }

    fn new_peer(&self, remote: SocketAddr) -> (Arc<Peer>, PeerTransport) {
        let (tx, rx) = std_mpsc::channel();
        let peer = Arc::new(Peer {
            session: Mutex::new(Session::plain(SessionId::new())),
            inbound_tx: tx,
            state: Mutex::new(PeerState::Handshaking),
        });
        let transport = PeerTransport {
            socket: self.socket.clone(),
            peer: remote,
            inbound: rx,
            pending: Vec::new(),
        };
        (peer, transport)
    }

    /// Spawn the post-handshake read loop for an established peer
    fn spawn_reader(
        peers: Arc<DashMap<SocketAddr, Arc<Peer>>>,
        peer: Arc<Peer>,
        remote: SocketAddr,
        stream: Arc<Mutex<SslStream<PeerTransport>>>,
        events: mpsc::Sender<ChannelEvent>,
        max_packet: usize,
    ) {
        std::thread::spawn(move || {
            let mut buf = vec![0u8; max_packet];
            loop {
                let outcome = {
                    let mut stream = stream.lock();
                    stream.ssl_read(&mut buf)
                };
                match outcome {
                    Ok(0) => break,
                    Ok(n) => {
                        let datagram = Datagram {
                            data: Bytes::copy_from_slice(&buf[..n]),
                            source: remote,
                            destination: None,
                            session: peer.session.lock().clone(),
                        };
                        if events.blocking_send(ChannelEvent::Data(datagram)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.code() == openssl::ssl::ErrorCode::WANT_READ => {
                        std::thread::sleep(RETRY_INTERVAL);
                    }
                    Err(e) => {
                        debug!("dtls read from {} ended: {}", remote, e);
                        break;
                    }
                }
            }
            peers.remove(&remote);
        });
    }

    /// Initiate a client handshake toward `remote`, blocking the caller
    /// until it finishes
    async fn connect(&self, remote: SocketAddr) -> Result<Arc<Peer>> {
        let (peer, transport) = self.new_peer(remote);
        self.peers.insert(remote, peer.clone());

        let ssl = Ssl::new(&self.context)?;
        let peer_for_task = peer.clone();
        let peers = self.peers.clone();
        let events = self.events.lock().clone();
        let max_packet = self.config.receive_packet_size.max(2048);

        let connected = tokio::task::spawn_blocking(move || {
            match drive_handshake(ssl.connect(transport)) {
                Ok(stream) => {
                    apply_peer_identity(&peer_for_task, &stream);
                    let stream = Arc::new(Mutex::new(stream));
                    *peer_for_task.state.lock() = PeerState::Established(stream.clone());
                    if let Some(events) = events {
                        DtlsChannel::spawn_reader(
                            peers,
                            peer_for_task,
                            remote,
                            stream,
                            events,
                            max_packet,
                        );
                    }
                    Ok(())
                }
                Err(e) => {
                    peers.remove(&remote);
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| TransportError::Other(e.to_string()))?;

        connected?;
        info!("dtls session established with {}", remote);
        Ok(peer)
    }
}

fn build_context(config: &DtlsConfig) -> Result<SslContext> {
    let mut builder = SslContextBuilder::new(SslMethod::dtls())?;

    if let Some((cert_pem, key_pem)) = &config.certificate {
        let cert = X509::from_pem(cert_pem)?;
        let key = PKey::private_key_from_pem(key_pem)?;
        builder.set_certificate(&cert)?;
        builder.set_private_key(&key)?;
        builder.check_private_key()?;
    }

    if config.verify_peer {
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    } else {
        builder.set_verify(SslVerifyMode::NONE);
    }

    if let Some(psk) = config.psk.clone() {
        let server_psk = psk.clone();
        builder.set_psk_server_callback(move |ssl, identity, secret| {
            let offered = identity
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .unwrap_or_default();
            if offered != server_psk.identity {
                debug!("psk identity mismatch: {:?}", offered);
                return Ok(0);
            }
            if secret.len() < server_psk.key.len() {
                return Ok(0);
            }
            secret[..server_psk.key.len()].copy_from_slice(&server_psk.key);
            ssl.set_ex_data(psk_identity_index(), offered);
            Ok(server_psk.key.len())
        });

        builder.set_psk_client_callback(move |_ssl, _hint, identity, secret| {
            let id = psk.identity.as_bytes();
            if identity.len() < id.len() + 1 || secret.len() < psk.key.len() {
                return Ok(0);
            }
            identity[..id.len()].copy_from_slice(id);
            identity[id.len()] = 0;
            secret[..psk.key.len()].copy_from_slice(&psk.key);
            Ok(psk.key.len())
        });
    }

    Ok(builder.build())
}

fn drive_handshake<S: Read + Write>(
    mut outcome: std::result::Result<SslStream<S>, HandshakeError<S>>,
) -> Result<SslStream<S>> {
    loop {
        match outcome {
            Ok(stream) => return Ok(stream),
            Err(HandshakeError::WouldBlock(mid)) => {
                std::thread::sleep(RETRY_INTERVAL);
                outcome = mid.handshake();
            }
            Err(e) => return Err(TransportError::HandshakeFailed(e.to_string())),
        }
    }
}

/// Copy the peer's authenticated identity onto the session
fn apply_peer_identity<S>(peer: &Peer, stream: &SslStream<S>) {
    let mut session = peer.session.lock();
    if let Some(identity) = stream.ssl().ex_data(psk_identity_index()) {
        session.psk_identity = Some(identity.clone());
    }
    if let Some(cert) = stream.ssl().peer_certificate() {
        if let Ok(der) = cert.to_der() {
            session.peer_certificate = Some(der);
        }
    }
}

/// True when the datagram starts with an epoch-0 ClientHello record
fn is_client_hello(data: &[u8]) -> bool {
    data.len() > RECORD_HEADER_LEN
        && data[0] == CONTENT_TYPE_HANDSHAKE
        && data[3] == 0
        && data[4] == 0
        && data[RECORD_HEADER_LEN] == HANDSHAKE_CLIENT_HELLO
}

#[async_trait]
impl Channel for DtlsChannel {
    async fn start(&self) -> Result<ChannelReceiver> {
        if self.reader.lock().is_some() {
            return Err(TransportError::Other("channel already started".to_string()));
        }
        let (tx, rx) = mpsc::channel(128);
        *self.events.lock() = Some(tx.clone());

        let socket = self.socket.clone();
        let peers = self.peers.clone();
        let channel_ptr = DemuxHandle {
            socket: self.socket.clone(),
            context: self.context.clone(),
            config: self.config.clone(),
            peers: self.peers.clone(),
            events: tx,
        };
        let max_packet = self.config.receive_packet_size.max(2048);

        let handle = std::thread::spawn(move || {
            let mut buf = vec![0u8; max_packet];
            loop {
                let (len, from) = match socket.recv_from(&mut buf) {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("dtls socket read failed: {}", e);
                        break;
                    }
                };
                let data = &buf[..len];

                let existing = peers.get(&from).map(|p| p.clone());
                match existing {
                    Some(peer) if is_client_hello(data) => {
                        // peer restarted: replace the session eagerly
                        debug!("new client hello from known peer {}, replacing session", from);
                        peers.remove(&from);
                        drop(peer);
                        channel_ptr.accept_new(from, data);
                    }
                    Some(peer) => {
                        if peer.inbound_tx.send(data.to_vec()).is_err() {
                            peers.remove(&from);
                        }
                    }
                    None if is_client_hello(data) => {
                        channel_ptr.accept_new(from, data);
                    }
                    None => {
                        debug!("dropping non-handshake datagram from unknown {}", from);
                    }
                }
            }
        });
        *self.reader.lock() = Some(handle);
        Ok(rx)
    }

    async fn stop(&self) {
        self.events.lock().take();
        self.peers.clear();
        // the reader thread exits when the socket errors or the process
        // drops the channel; there is no clean cross-thread interrupt
        // for a blocking recv_from, so the socket is left to the Drop
        self.reader.lock().take();
    }

    async fn send(
        &self,
        data: Bytes,
        _session: Option<&Session>,
        remote: SocketAddr,
    ) -> Result<()> {
        let peer = match self.peers.get(&remote).map(|p| p.clone()) {
            Some(peer) => peer,
            None => self.connect(remote).await?,
        };

        let stream = loop {
            match &*peer.state.lock() {
                PeerState::Established(stream) => break stream.clone(),
                PeerState::Handshaking => {}
            }
            // a failed handshake removes the peer; stop waiting for it
            if !self.peers.contains_key(&remote) {
                return Err(TransportError::NoSession(remote));
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        };

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut stream = stream.lock();
            stream
                .ssl_write(&data)
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| TransportError::Other(e.to_string()))?
    }

    fn session(&self, remote: SocketAddr) -> Session {
        self.peers
            .get(&remote)
            .map(|peer| peer.session.lock().clone())
            .unwrap_or_else(|| Session::plain(SessionId::new()))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn add_multicast_group(&self, _group: IpAddr) -> Result<()> {
        Err(TransportError::MulticastJoin(
            "multicast is not defined for dtls".to_string(),
        ))
    }

    fn is_secure(&self) -> bool {
        true
    }
}

/// Everything the demux thread needs to accept a new peer
struct DemuxHandle {
    socket: Arc<UdpSocket>,
    context: SslContext,
    config: DtlsConfig,
    peers: Arc<DashMap<SocketAddr, Arc<Peer>>>,
    events: mpsc::Sender<ChannelEvent>,
}

impl DemuxHandle {
    fn accept_new(&self, from: SocketAddr, first_datagram: &[u8]) {
        let (tx, rx) = std_mpsc::channel();
        let peer = Arc::new(Peer {
            session: Mutex::new(Session::plain(SessionId::new())),
            inbound_tx: tx,
            state: Mutex::new(PeerState::Handshaking),
        });
        let _ = peer.inbound_tx.send(first_datagram.to_vec());
        self.peers.insert(from, peer.clone());

        let transport = PeerTransport {
            socket: self.socket.clone(),
            peer: from,
            inbound: rx,
            pending: Vec::new(),
        };
        let ssl = match Ssl::new(&self.context) {
            Ok(ssl) => ssl,
            Err(e) => {
                warn!("ssl setup for {} failed: {}", from, e);
                self.peers.remove(&from);
                return;
            }
        };
        let peers = self.peers.clone();
        let events = self.events.clone();
        let max_packet = self.config.receive_packet_size.max(2048);
        std::thread::spawn(move || match drive_handshake(ssl.accept(transport)) {
            Ok(stream) => {
                apply_peer_identity(&peer, &stream);
                info!("dtls session established with {}", from);
                let stream = Arc::new(Mutex::new(stream));
                *peer.state.lock() = PeerState::Established(stream.clone());
                DtlsChannel::spawn_reader(peers, peer, from, stream, events, max_packet);
            }
            Err(e) => {
                warn!("dtls accept from {} failed: {}", from, e);
                peers.remove(&from);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_hello_detection() {
        // content type 22, version, epoch 0, seq, len, then msg type 1
        let mut hello = vec![22, 254, 253, 0, 0, 0, 0, 0, 0, 0, 0, 0, 40];
        hello.push(1);
        hello.extend_from_slice(&[0; 16]);
        assert!(is_client_hello(&hello));

        let mut app_data = hello.clone();
        app_data[0] = 23;
        assert!(!is_client_hello(&app_data));

        let mut later_epoch = hello.clone();
        later_epoch[4] = 1;
        assert!(!is_client_hello(&later_epoch));
    }

    #[test]
    fn test_psk_config() {
        let config = DtlsConfig::with_psk("device-1", b"secret".to_vec());
        assert_eq!(config.psk.as_ref().unwrap().identity, "device-1");
        assert!(!config.verify_peer);
    }
}
