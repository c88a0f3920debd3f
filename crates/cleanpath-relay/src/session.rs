//! Relay sessions.
//!
//! A session is one logical tunnel: a client boundary, the destination it
//! resolves to, and (once negotiated) the remote connection. Sessions are
//! owned by the [`SessionRegistry`]; everything else holds them through
//! `Arc` clones or, in the bridge's case, a `Weak`.
//!
//! Cancellation is the single cleanup trigger. Boundary close, remote EOF,
//! relay I/O errors and explicit disconnects all cancel the session's token;
//! [`Session::teardown`] then closes whatever is still open, exactly once.
//! The remote connection is always closed before the bridge reports `Closed`
//! to the boundary.

use crate::boundary::Boundary;
use crate::bridge::TransportBridge;
use crate::registry::SessionRegistry;
use crate::INBOUND_QUEUE_DEPTH;
use cleanpath_transport::RemoteConnection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

/// Negotiation progress of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Waiting for the client's first message
    AwaitingFirstMessage,
    /// Dialing, exchanging the initial payload or handshaking
    Negotiating,
    /// Transparent forwarding
    Established,
    /// Negotiation failed; the session is torn down
    Failed,
}

/// How an established session reaches its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// Raw negotiation bytes, no CleanPath PDU exchanged
    Direct,
    /// CleanPath negotiated, raw TCP to the destination
    Plain,
    /// CleanPath negotiated, TLS terminated at the relay
    Tls,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Direct => write!(f, "direct"),
            SessionMode::Plain => write!(f, "plain"),
            SessionMode::Tls => write!(f, "tls"),
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Proxy id
    pub id: String,
    /// Resolved destination
    pub destination: String,
    /// Negotiation progress
    pub state: NegotiationState,
    /// Transport mode, once established
    pub mode: Option<SessionMode>,
    /// Bytes relayed client → remote
    pub bytes_to_remote: u64,
    /// Bytes relayed remote → client
    pub bytes_to_client: u64,
    /// Time since the session attached
    pub age: Duration,
}

struct SessionInner {
    destination: String,
    negotiation: NegotiationState,
    mode: Option<SessionMode>,
    remote: Option<RemoteConnection>,
    inbound: Option<mpsc::Receiver<Vec<u8>>>,
    remote_lent: bool,
    torn_down: bool,
}

/// One client tunnel
pub struct Session {
    id: String,
    created_at: Instant,
    cancel: CancellationToken,
    remote_closed: CancellationToken,
    bridge: Arc<TransportBridge>,
    registry: Weak<SessionRegistry>,
    inner: Mutex<SessionInner>,
    bytes_to_remote: AtomicU64,
    bytes_to_client: AtomicU64,
}

impl Session {
    pub(crate) fn new(
        id: String,
        destination: String,
        boundary: Arc<dyn Boundary>,
        registry: Weak<SessionRegistry>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        Arc::new_cyclic(|weak| Self {
            id,
            created_at: Instant::now(),
            cancel: CancellationToken::new(),
            remote_closed: CancellationToken::new(),
            bridge: Arc::new(TransportBridge::new(boundary, weak.clone(), tx)),
            registry,
            inner: Mutex::new(SessionInner {
                destination,
                negotiation: NegotiationState::AwaitingFirstMessage,
                mode: None,
                remote: None,
                inbound: Some(rx),
                remote_lent: false,
                torn_down: false,
            }),
            bytes_to_remote: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
        })
    }

    /// Proxy id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The session's transport bridge
    #[must_use]
    pub fn bridge(&self) -> &Arc<TransportBridge> {
        &self.bridge
    }

    /// Cancellation scope shared by every task of this session
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the session's scope
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the scope has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Current destination
    pub async fn destination(&self) -> String {
        self.inner.lock().await.destination.clone()
    }

    pub(crate) async fn set_destination(&self, destination: &str) {
        destination.clone_into(&mut self.inner.lock().await.destination);
    }

    /// Current negotiation state
    pub async fn negotiation_state(&self) -> NegotiationState {
        self.inner.lock().await.negotiation
    }

    pub(crate) async fn set_negotiation_state(&self, state: NegotiationState) {
        self.inner.lock().await.negotiation = state;
    }

    /// Transport mode, once established
    pub async fn mode(&self) -> Option<SessionMode> {
        self.inner.lock().await.mode
    }

    pub(crate) async fn take_inbound(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inner.lock().await.inbound.take()
    }

    /// Install the negotiated remote connection and mark the session
    /// established.
    ///
    /// Hands the connection back if the session was torn down in the
    /// meantime or already has a remote.
    pub(crate) async fn install_remote(
        &self,
        remote: RemoteConnection,
        mode: SessionMode,
    ) -> std::result::Result<(), RemoteConnection> {
        let mut inner = self.inner.lock().await;
        if inner.torn_down || inner.remote.is_some() || self.cancel.is_cancelled() {
            return Err(remote);
        }
        inner.remote = Some(remote);
        inner.mode = Some(mode);
        inner.negotiation = NegotiationState::Established;
        Ok(())
    }

    /// Lend the remote connection to the forwarder.
    ///
    /// The borrower must call [`remote_released`](Self::remote_released)
    /// once the connection is closed; teardown waits for it.
    pub(crate) async fn take_remote(&self) -> Option<RemoteConnection> {
        let mut inner = self.inner.lock().await;
        let remote = inner.remote.take();
        inner.remote_lent = remote.is_some();
        remote
    }

    /// The lent remote connection has been closed
    pub(crate) fn remote_released(&self) {
        self.remote_closed.cancel();
    }

    pub(crate) fn record_to_remote(&self, n: usize) {
        self.bytes_to_remote.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_to_client(&self, n: usize) {
        self.bytes_to_client.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Snapshot for introspection
    pub async fn info(&self) -> SessionInfo {
        let inner = self.inner.lock().await;
        SessionInfo {
            id: self.id.clone(),
            destination: inner.destination.clone(),
            state: inner.negotiation,
            mode: inner.mode,
            bytes_to_remote: self.bytes_to_remote.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            age: self.created_at.elapsed(),
        }
    }

    /// Tear the session down.
    ///
    /// Cancels the scope, removes the registry entry and its destination,
    /// closes the remote connection if the session still holds it (or waits
    /// for the forwarder to close the one it borrowed), then closes the
    /// bridge. Safe to call concurrently and repeatedly; only the
    /// first call has any effect. Returns whether this call did the work.
    pub async fn teardown(&self, code: u16, reason: &str) -> bool {
        let (remote, lent) = {
            let mut inner = self.inner.lock().await;
            if inner.torn_down {
                return false;
            }
            inner.torn_down = true;
            if inner.negotiation != NegotiationState::Established {
                inner.negotiation = NegotiationState::Failed;
            }
            inner.inbound = None;
            (inner.remote.take(), inner.remote_lent)
        };

        self.cancel.cancel();

        if let Some(registry) = self.registry.upgrade() {
            registry.remove_session(self);
        }

        if let Some(mut remote) = remote {
            if let Err(e) = remote.shutdown().await {
                tracing::debug!("Remote shutdown for {} failed: {}", self.id, e);
            }
        } else if lent {
            self.remote_closed.cancelled().await;
        }

        self.bridge.close(code, reason).await;

        tracing::info!(
            proxy_id = %self.id,
            bytes_to_remote = self.bytes_to_remote.load(Ordering::Relaxed),
            bytes_to_client = self.bytes_to_client.load(Ordering::Relaxed),
            "Session closed: {}",
            reason
        );
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoundaryError;
    use async_trait::async_trait;
    use cleanpath_transport::BoxedStream;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct CountingBoundary {
        closes: AtomicUsize,
    }

    #[async_trait]
    impl Boundary for CountingBoundary {
        async fn send(&self, _data: &[u8]) -> std::result::Result<(), BoundaryError> {
            Ok(())
        }

        async fn close(&self, _code: u16, _reason: &str) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let boundary = Arc::new(CountingBoundary::default());
        let session = Session::new(
            "proxy_1".to_string(),
            "host:3389".to_string(),
            boundary.clone(),
            Weak::new(),
        );

        let (client, mut server) = tokio::io::duplex(64);
        let remote = RemoteConnection::from(Box::new(client) as BoxedStream);
        session
            .install_remote(remote, SessionMode::Plain)
            .await
            .unwrap();
        assert_eq!(
            session.negotiation_state().await,
            NegotiationState::Established
        );

        let (first, second) = tokio::join!(
            session.teardown(1000, "remote eof"),
            session.teardown(1000, "client closed")
        );
        assert!(first ^ second);
        assert!(session.is_cancelled());
        assert_eq!(boundary.closes.load(Ordering::SeqCst), 1);

        // Remote was shut down
        let mut buf = [0u8; 1];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_teardown_waits_for_lent_remote() {
        let boundary = Arc::new(CountingBoundary::default());
        let session = Session::new(
            "proxy_4".to_string(),
            "host:22".to_string(),
            boundary.clone(),
            Weak::new(),
        );
        let (client, _server) = tokio::io::duplex(64);
        let remote = RemoteConnection::from(Box::new(client) as BoxedStream);
        session
            .install_remote(remote, SessionMode::Plain)
            .await
            .unwrap();
        let _lent = session.take_remote().await.unwrap();

        let teardown = {
            let session = session.clone();
            tokio::spawn(async move { session.teardown(1001, "Disconnected").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.is_cancelled());
        assert!(!teardown.is_finished());
        assert_eq!(boundary.closes.load(Ordering::SeqCst), 0);

        session.remote_released();
        assert!(teardown.await.unwrap());
        assert_eq!(boundary.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_install_after_teardown_is_refused() {
        let session = Session::new(
            "proxy_2".to_string(),
            "host:22".to_string(),
            Arc::new(CountingBoundary::default()),
            Weak::new(),
        );
        session.teardown(1000, "gone").await;
        assert_eq!(session.negotiation_state().await, NegotiationState::Failed);

        let (client, _server) = tokio::io::duplex(64);
        let remote = RemoteConnection::from(Box::new(client) as BoxedStream);
        assert!(session.install_remote(remote, SessionMode::Plain).await.is_err());
    }

    #[tokio::test]
    async fn test_info_snapshot() {
        let session = Session::new(
            "proxy_3".to_string(),
            "host:3389".to_string(),
            Arc::new(CountingBoundary::default()),
            Weak::new(),
        );
        session.record_to_remote(10);
        session.record_to_client(32);
        session.set_destination("other:3389").await;

        let info = session.info().await;
        assert_eq!(info.id, "proxy_3");
        assert_eq!(info.destination, "other:3389");
        assert_eq!(info.state, NegotiationState::AwaitingFirstMessage);
        assert_eq!(info.mode, None);
        assert_eq!(info.bytes_to_remote, 10);
        assert_eq!(info.bytes_to_client, 32);
    }
}
