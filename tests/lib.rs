//! Shared fixtures for the CleanPath integration tests.
//!
//! - [`ChannelBoundary`]: in-memory client boundary that records everything
//!   the relay sends and how often it was closed
//! - [`PipeDialer`]: dials in-memory pipes and hands the far ends to the test
//! - [`FailingDialer`]: refuses every dial
//! - [`HangupDialer`]: connects to a peer that is already gone
//! - [`TlsFixture`]: CA + leaf chain from `rcgen` with a matching acceptor
//! - [`spawn_echo_server`] / [`spawn_tls_echo_server`]: real TCP servers

use async_trait::async_trait;
use cleanpath_relay::{Boundary, BoundaryError};
use cleanpath_transport::{BoxedStream, Dialer, TransportError, TransportResult};
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_rustls::TlsAcceptor;

/// How long a test waits for any single event
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Client boundary
// ============================================================================

/// Something the relay did to the client boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundaryEvent {
    /// Data delivered to the client
    Data(Vec<u8>),
    /// Boundary closed with code and reason
    Closed(u16, String),
}

/// Client boundary backed by a channel
pub struct ChannelBoundary {
    events: mpsc::UnboundedSender<BoundaryEvent>,
    sends: AtomicUsize,
    closes: AtomicUsize,
}

impl ChannelBoundary {
    /// New boundary and the receiver of its events
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BoundaryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let boundary = Arc::new(Self {
            events: tx,
            sends: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        (boundary, rx)
    }

    /// Number of sends so far
    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Number of closes so far
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Boundary for ChannelBoundary {
    async fn send(&self, data: &[u8]) -> Result<(), BoundaryError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.events
            .send(BoundaryEvent::Data(data.to_vec()))
            .map_err(|_| BoundaryError::Closed)
    }

    async fn close(&self, code: u16, reason: &str) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .events
            .send(BoundaryEvent::Closed(code, reason.to_string()));
    }
}

/// Next boundary event, panicking after [`EVENT_TIMEOUT`]
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<BoundaryEvent>) -> BoundaryEvent {
    tokio::time::timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for boundary event")
        .expect("boundary event channel closed")
}

/// Next boundary event, which must be data
pub async fn next_data(events: &mut mpsc::UnboundedReceiver<BoundaryEvent>) -> Vec<u8> {
    match next_event(events).await {
        BoundaryEvent::Data(data) => data,
        other => panic!("expected data, got {other:?}"),
    }
}

/// Wait until `condition` holds, panicking after [`EVENT_TIMEOUT`]
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Dialers
// ============================================================================

/// Duplex stream that counts completed shutdowns
pub struct CountingStream {
    inner: DuplexStream,
    shutdowns: Arc<AtomicUsize>,
}

impl AsyncRead for CountingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountingStream {
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
        let result = Pin::new(&mut self.inner).poll_shutdown(cx);
        if result.is_ready() {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        result
    }
}

/// The far end of a dialed pipe
pub struct DialedPipe {
    /// Address that was dialed
    pub address: String,
    /// Remote side of the pipe
    pub stream: DuplexStream,
    /// Completed shutdowns of the relay's side
    pub shutdowns: Arc<AtomicUsize>,
}

/// Dialer that connects to in-memory pipes
pub struct PipeDialer {
    dialed: mpsc::UnboundedSender<DialedPipe>,
    dials: AtomicUsize,
}

impl PipeDialer {
    /// New dialer and the receiver of the far ends it creates
    pub fn new() -> (Arc<Self>, PipeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            dialed: tx,
            dials: AtomicUsize::new(0),
        });
        (dialer, PipeReceiver(Mutex::new(rx)))
    }

    /// Number of dials so far
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for PipeDialer {
    async fn dial(&self, _network: &str, address: &str) -> TransportResult<BoxedStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let shutdowns = Arc::new(AtomicUsize::new(0));

        self.dialed
            .send(DialedPipe {
                address: address.to_string(),
                stream: remote,
                shutdowns: shutdowns.clone(),
            })
            .map_err(|_| TransportError::Closed)?;

        Ok(Box::new(CountingStream {
            inner: local,
            shutdowns,
        }))
    }
}

/// Receiver of pipes created by a [`PipeDialer`]
pub struct PipeReceiver(Mutex<mpsc::UnboundedReceiver<DialedPipe>>);

impl PipeReceiver {
    /// Next dialed pipe, panicking after [`EVENT_TIMEOUT`]
    pub async fn next(&self) -> DialedPipe {
        let mut rx = self.0.lock().await;
        tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for a dial")
            .expect("dialer dropped")
    }
}

/// Dialer that refuses every connection
pub struct FailingDialer;

#[async_trait]
impl Dialer for FailingDialer {
    async fn dial(&self, _network: &str, address: &str) -> TransportResult<BoxedStream> {
        Err(TransportError::DialFailed {
            address: address.to_string(),
            reason: "connection refused".to_string(),
        })
    }
}

/// Dialer whose connections lead to a peer that has already hung up
#[derive(Default)]
pub struct HangupDialer {
    /// Completed shutdowns of the relay's side, across all dials
    pub shutdowns: Arc<AtomicUsize>,
}

#[async_trait]
impl Dialer for HangupDialer {
    async fn dial(&self, _network: &str, _address: &str) -> TransportResult<BoxedStream> {
        let (local, remote) = tokio::io::duplex(1024);
        drop(remote);
        Ok(Box::new(CountingStream {
            inner: local,
            shutdowns: self.shutdowns.clone(),
        }))
    }
}

// ============================================================================
// TLS
// ============================================================================

/// A CA, a leaf it issued, and an acceptor presenting `[leaf, ca]`
pub struct TlsFixture {
    /// DER chain as the server presents it, leaf first
    pub chain: Vec<Vec<u8>>,
    /// Acceptor for the chain
    pub acceptor: TlsAcceptor,
}

impl TlsFixture {
    /// Generate a fresh chain for `names`
    pub fn new(names: &[&str]) -> Self {
        let ca_key = KeyPair::generate().expect("CA key");
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).expect("CA cert");

        let leaf_key = KeyPair::generate().expect("leaf key");
        let leaf_params =
            CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .expect("leaf params");
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .expect("leaf cert");

        let certs: Vec<CertificateDer<'static>> =
            vec![leaf_cert.der().clone(), ca_cert.der().clone()];
        let chain = certs.iter().map(|c| c.as_ref().to_vec()).collect();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .expect("protocol versions")
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .expect("server config");

        Self {
            chain,
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }
}

// ============================================================================
// TCP servers
// ============================================================================

async fn echo<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = stream.shutdown().await;
}

/// TCP echo server on an ephemeral port
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(echo(stream));
        }
    });
    addr
}

/// TLS echo server on an ephemeral port
pub async fn spawn_tls_echo_server(fixture: &TlsFixture) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let acceptor = fixture.acceptor.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(stream).await {
                    echo(tls).await;
                }
            });
        }
    });
    addr
}
