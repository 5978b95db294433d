//! TLS transport layer for Raft messages.
//!
//! This module provides the network transport for sending Raft messages
//! between nodes over mutually-reachable, TLS-wrapped TCP streams. The
//! certificate served to inbound handshakes comes from the
//! [`CertificateProvider`](crate::tls::CertificateProvider), so rotating
//! certificates never requires restarting the transport.
//!
//! # Architecture
//!
//! Each node runs:
//! - **1 accept loop**: completes TLS handshakes and forwards decoded
//!   messages to the consensus engine's inbound channel
//! - **N sender tasks**: one per peer, each owning that peer's outbound
//!   connection and queue; connections are dialed lazily and redialed after
//!   failure
//!
//! # Wire format
//!
//! Frames are a u32 big-endian length followed by a bincode envelope
//! `{ from, from_addr, payload }`, the payload being the prost-encoded
//! `eraftpb::Message`. Carrying the sender's advertise address lets a
//! receiver learn how to dial back a node it has never seen, which is what
//! lets a freshly joined member answer its leader without any prior cluster
//! knowledge.

use crate::tls::{load_certs, CertificateProvider};
use maat_common::{Error, NodeId, Result};
use prost::Message as _;
use raft::eraftpb::Message as RaftMessage;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, trace, warn};

/// Upper bound on a single frame; anything larger is a corrupt stream.
const MAX_FRAME_BYTES: u32 = 32 * 1024 * 1024;

/// Frame carried on the consensus stream.
#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    from: NodeId,
    from_addr: String,
    payload: Vec<u8>,
}

/// TLS-wrapped transport for consensus traffic.
pub struct RaftTransport {
    node_id: NodeId,
    bind_addr: String,
    /// Validated effective advertise address.
    advertise: SocketAddr,
    /// Whether an advertise address was supplied explicitly.
    advertise_explicit: bool,
    provider: Arc<CertificateProvider>,
    connector: TlsConnector,
    dial_timeout: Duration,
    inbound_tx: mpsc::Sender<RaftMessage>,
    /// Advertise addresses of known peers.
    peer_addrs: Arc<RwLock<HashMap<NodeId, String>>>,
    /// Outbound queue per peer, feeding that peer's sender task.
    senders: Mutex<HashMap<NodeId, mpsc::UnboundedSender<RaftMessage>>>,
    /// OS-assigned address after bind.
    bound: RwLock<Option<SocketAddr>>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for RaftTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftTransport")
            .field("node_id", &self.node_id)
            .field("bind_addr", &self.bind_addr)
            .field("advertise", &self.advertise)
            .field("advertise_explicit", &self.advertise_explicit)
            .field("dial_timeout", &self.dial_timeout)
            .finish_non_exhaustive()
    }
}

impl RaftTransport {
    /// Creates a transport, validating the advertise address.
    ///
    /// The effective advertise address (explicit `advertise_addr`, else
    /// `bind_addr`) must resolve to a concrete TCP address.
    ///
    /// # Errors
    ///
    /// - [`Error::NotTcp`] if it does not parse/resolve as TCP `host:port`
    /// - [`Error::NotAdvertisable`] if its IP is unspecified
    ///   (`0.0.0.0`-equivalent) and therefore unreachable for peers
    pub fn new(
        node_id: NodeId,
        bind_addr: impl Into<String>,
        advertise_addr: Option<String>,
        provider: Arc<CertificateProvider>,
        ca_file: Option<&Path>,
        dial_timeout: Duration,
        inbound_tx: mpsc::Sender<RaftMessage>,
    ) -> Result<Arc<Self>> {
        let bind_addr = bind_addr.into();
        let advertise_explicit = advertise_addr.is_some();
        let advertise = resolve_advertise(advertise_addr.as_deref().unwrap_or(&bind_addr))?;

        let client_config = build_client_config(ca_file)?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            node_id,
            bind_addr,
            advertise,
            advertise_explicit,
            provider,
            connector: TlsConnector::from(Arc::new(client_config)),
            dial_timeout,
            inbound_tx,
            peer_addrs: Arc::new(RwLock::new(HashMap::new())),
            senders: Mutex::new(HashMap::new()),
            bound: RwLock::new(None),
            shutdown_tx,
        }))
    }

    /// Binds the listener and spawns the accept loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let server_config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_no_client_auth()
            .with_cert_resolver(self.provider.clone());
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| Error::Transport(format!("bind {}: {e}", self.bind_addr)))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::Transport(format!("local addr: {e}")))?;
        *self.bound.write().expect("transport lock poisoned") = Some(local);

        let transport = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                let transport = Arc::clone(&transport);
                                let acceptor = acceptor.clone();
                                let shutdown_rx = transport.shutdown_tx.subscribe();
                                tokio::spawn(async move {
                                    transport.handle_inbound(acceptor, stream, peer, shutdown_rx).await;
                                });
                            }
                            Err(error) => {
                                warn!(%error, "accept failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("transport accept loop stopping");
                        break;
                    }
                }
            }
        });

        debug!(bind = %local, advertise = %self.advertise, "transport listening");
        Ok(())
    }

    /// Handles one inbound connection: TLS handshake, then a frame read loop.
    async fn handle_inbound(
        self: Arc<Self>,
        acceptor: TlsAcceptor,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        // The handshake uses whatever certificate the provider serves right now
        let mut tls = match acceptor.accept(stream).await {
            Ok(tls) => tls,
            Err(error) => {
                warn!(%peer, %error, "inbound TLS handshake failed");
                return;
            }
        };

        loop {
            let frame = tokio::select! {
                frame = read_frame(&mut tls) => frame,
                _ = shutdown_rx.changed() => return,
            };

            let bytes = match frame {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return,
                Err(error) => {
                    debug!(%peer, %error, "inbound stream closed");
                    return;
                }
            };

            let envelope: WireEnvelope = match bincode::deserialize(&bytes) {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!(%peer, %error, "dropping undecodable frame");
                    return;
                }
            };

            // Learn (or refresh) how to dial the sender back
            self.add_peer(envelope.from, envelope.from_addr.clone());

            let message = match RaftMessage::decode(envelope.payload.as_slice()) {
                Ok(message) => message,
                Err(error) => {
                    warn!(%peer, %error, "dropping undecodable raft message");
                    continue;
                }
            };

            if self.inbound_tx.send(message).await.is_err() {
                // Consensus engine is gone; nothing left to deliver to
                return;
            }
        }
    }

    /// Opens a TLS connection to `addr`, bounded by `timeout`.
    pub async fn dial(
        &self,
        addr: &str,
        timeout: Duration,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        dial(&self.connector, addr, timeout).await
    }

    /// Registers (or refreshes) the advertise address of a peer.
    pub fn add_peer(&self, id: NodeId, addr: String) {
        if id == self.node_id {
            return;
        }
        let mut addrs = self.peer_addrs.write().expect("transport lock poisoned");
        let previous = addrs.insert(id, addr.clone());
        if previous.as_deref() != Some(addr.as_str()) {
            debug!(peer = id, %addr, "peer address registered");
        }
    }

    /// Forgets a peer and stops its sender task.
    pub fn remove_peer(&self, id: NodeId) {
        self.peer_addrs
            .write()
            .expect("transport lock poisoned")
            .remove(&id);
        self.senders
            .lock()
            .expect("transport lock poisoned")
            .remove(&id);
    }

    /// Known peer addresses.
    pub fn peers(&self) -> HashMap<NodeId, String> {
        self.peer_addrs
            .read()
            .expect("transport lock poisoned")
            .clone()
    }

    /// Queues messages to their destinations.
    ///
    /// Messages to unknown peers are dropped (raft retries by protocol
    /// design); each known peer's sender task delivers in order.
    pub fn send(&self, messages: Vec<RaftMessage>) {
        for message in messages {
            let to = message.to;
            if !self
                .peer_addrs
                .read()
                .expect("transport lock poisoned")
                .contains_key(&to)
            {
                trace!(peer = to, "dropping message to unknown peer");
                continue;
            }

            let mut senders = self.senders.lock().expect("transport lock poisoned");
            let sender = senders.entry(to).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(peer_sender(
                    to,
                    self.node_id,
                    self.local_addr().to_string(),
                    Arc::clone(&self.peer_addrs),
                    self.connector.clone(),
                    self.dial_timeout,
                    rx,
                ));
                tx
            });

            if sender.send(message).is_err() {
                // Sender task exited; rebuild it on the next send
                senders.remove(&to);
            }
        }
    }

    /// The address peers should use to reach this node: the configured
    /// advertise address if one was supplied, else the OS-assigned bind
    /// address.
    pub fn local_addr(&self) -> SocketAddr {
        if self.advertise_explicit {
            return self.advertise;
        }
        self.bound
            .read()
            .expect("transport lock poisoned")
            .unwrap_or(self.advertise)
    }

    /// Stops the accept loop, connection tasks, and peer senders.
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        self.senders
            .lock()
            .expect("transport lock poisoned")
            .clear();
    }
}

impl Drop for RaftTransport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// One peer's sender task: owns the outbound connection, dialing lazily and
/// redialing on failure. Messages that cannot be delivered are dropped.
async fn peer_sender(
    peer: NodeId,
    from: NodeId,
    from_addr: String,
    peer_addrs: Arc<RwLock<HashMap<NodeId, String>>>,
    connector: TlsConnector,
    dial_timeout: Duration,
    mut rx: mpsc::UnboundedReceiver<RaftMessage>,
) {
    let mut conn: Option<tokio_rustls::client::TlsStream<TcpStream>> = None;

    while let Some(message) = rx.recv().await {
        let envelope = WireEnvelope {
            from,
            from_addr: from_addr.clone(),
            payload: message.encode_to_vec(),
        };
        let bytes = match bincode::serialize(&envelope) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(%error, "failed to encode outbound frame");
                continue;
            }
        };

        if conn.is_none() {
            // Address is re-read on every dial so address moves take effect
            let addr = match peer_addrs
                .read()
                .expect("transport lock poisoned")
                .get(&peer)
                .cloned()
            {
                Some(addr) => addr,
                None => return,
            };

            match dial(&connector, &addr, dial_timeout).await {
                Ok(stream) => conn = Some(stream),
                Err(error) => {
                    debug!(peer, %addr, %error, "dial failed; dropping message");
                    continue;
                }
            }
        }

        if let Some(stream) = conn.as_mut() {
            if let Err(error) = write_frame(stream, &bytes).await {
                debug!(peer, %error, "write failed; dropping connection");
                conn = None;
            }
        }
    }
}

/// Opens a TCP connection bounded by `timeout`, then completes a TLS client
/// handshake. Outbound dials present no client certificate.
async fn dial(
    connector: &TlsConnector,
    addr: &str,
    timeout: Duration,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Transport(format!("dial {addr} timed out after {timeout:?}")))?
        .map_err(|e| Error::Transport(format!("dial {addr}: {e}")))?;
    let _ = tcp.set_nodelay(true);

    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| Error::Transport(format!("invalid server name {host}: {e}")))?;

    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::Transport(format!("TLS handshake with {addr}: {e}")))
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await
}

/// Reads one length-prefixed frame; `Ok(None)` on clean EOF.
async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Transport(format!("read frame length: {e}"))),
    }

    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(Error::Transport(format!("frame of {len} bytes exceeds limit")));
    }

    let mut bytes = vec![0u8; len as usize];
    stream
        .read_exact(&mut bytes)
        .await
        .map_err(|e| Error::Transport(format!("read frame body: {e}")))?;
    Ok(Some(bytes))
}

/// Resolves and validates the effective advertise address.
fn resolve_advertise(candidate: &str) -> Result<SocketAddr> {
    let addr = candidate
        .to_socket_addrs()
        .map_err(|_| Error::NotTcp(candidate.to_string()))?
        .next()
        .ok_or_else(|| Error::NotTcp(candidate.to_string()))?;

    if addr.ip().is_unspecified() {
        return Err(Error::NotAdvertisable(candidate.to_string()));
    }

    Ok(addr)
}

/// Builds the client-side TLS configuration, TLS 1.3 pinned.
///
/// With a CA bundle, peer certificates are verified against it. Without one,
/// peers are accepted at the transport level: traffic is still private to
/// holders of a live TLS endpoint at a voter's advertise address, which is
/// the cluster-internal trust model this transport runs under.
fn build_client_config(ca_file: Option<&Path>) -> Result<ClientConfig> {
    let builder = ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13]);

    let config = match ca_file {
        Some(path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::CertificateLoad(format!("invalid CA certificate: {e}")))?;
            }
            builder
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(ClusterTrust::new()))
            .with_no_client_auth(),
    };

    Ok(config)
}

/// Accepts any peer certificate while still verifying handshake signatures.
#[derive(Debug)]
struct ClusterTrust {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClusterTrust {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for ClusterTrust {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
