//! Raw TCP connections for clients that only need a socket.
//!
//! No CleanPath negotiation: the connection is dialed up front and bytes
//! move untouched. Remote data is delivered to the boundary from a read loop;
//! the boundary's close fires exactly once, on remote EOF, read error or an
//! explicit [`TcpConnection::close`]. Closing cancels any write stuck on a
//! remote that stopped reading.

use crate::boundary::Boundary;
use crate::error::{RelayError, Result};
use crate::{CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, DEFAULT_FORWARD_BUFFER};
use cleanpath_transport::{BoxedStream, Dialer, join_host_port};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

type ConnectionMap = DashMap<String, Arc<TcpConnection>>;

/// Dials raw TCP connections on behalf of clients
pub struct TcpConnectionBridge {
    dialer: Arc<dyn Dialer>,
    connections: Arc<ConnectionMap>,
    next_id: AtomicU64,
    buffer_size: usize,
}

impl TcpConnectionBridge {
    /// Create a bridge dialing through `dialer`
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            connections: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
            buffer_size: DEFAULT_FORWARD_BUFFER,
        }
    }

    /// Dial `host:port` and start delivering its data to `boundary`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DialFailure`] if the destination is unreachable.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        boundary: Arc<dyn Boundary>,
    ) -> Result<Arc<TcpConnection>> {
        let address = join_host_port(host, port);
        tracing::info!(%address, "Creating TCP connection");

        let stream = self
            .dialer
            .dial("tcp", &address)
            .await
            .map_err(|source| RelayError::DialFailure {
                destination: address.clone(),
                source,
            })?;

        let id = format!("conn_{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (reader, writer) = tokio::io::split(stream);
        let connection = Arc::new(TcpConnection {
            id: id.clone(),
            writer: Mutex::new(Some(writer)),
            boundary,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            finished: CancellationToken::new(),
            connections: Arc::downgrade(&self.connections),
        });

        self.connections.insert(id.clone(), connection.clone());
        tokio::spawn(read_loop(connection.clone(), reader, self.buffer_size));

        tracing::info!(%id, %address, "TCP connection established");
        Ok(connection)
    }

    /// Look up an open connection
    #[must_use]
    pub fn connection(&self, id: &str) -> Option<Arc<TcpConnection>> {
        self.connections.get(id).map(|c| c.value().clone())
    }

    /// Number of open connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

/// One raw TCP connection
pub struct TcpConnection {
    id: String,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    boundary: Arc<dyn Boundary>,
    cancel: CancellationToken,
    closed: AtomicBool,
    finished: CancellationToken,
    connections: Weak<ConnectionMap>,
}

impl TcpConnection {
    /// Connection id (`conn_<n>`)
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the connection has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write client data to the remote.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotOpen`] after close (including a close that
    /// interrupts this write), or [`RelayError::RelayIo`] if the write fails.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let write = async {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(RelayError::NotOpen)?;
            writer.write_all(data).await.map_err(RelayError::from)
        };

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RelayError::NotOpen),
            result = write => result,
        };

        match &result {
            Ok(()) => tracing::trace!(id = %self.id, bytes = data.len(), "TCP send"),
            Err(RelayError::NotOpen) => {}
            Err(e) => tracing::warn!(id = %self.id, "TCP write failed: {}", e),
        }
        result
    }

    /// Close the connection.
    ///
    /// Returns once the boundary has been notified, whichever caller did it.
    pub async fn close(&self) {
        self.finish(CLOSE_NORMAL, "Closed by client").await;
    }

    async fn finish(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            self.finished.cancelled().await;
            return;
        }
        // Releases the writer lock held by any in-flight send
        self.cancel.cancel();

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(id = %self.id, "TCP shutdown failed: {}", e);
            }
        }

        if let Some(connections) = self.connections.upgrade() {
            connections.remove(&self.id);
        }

        self.boundary.close(code, reason).await;
        self.finished.cancel();
        tracing::info!(id = %self.id, "TCP connection closed: {}", reason);
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn read_loop(
    connection: Arc<TcpConnection>,
    mut reader: ReadHalf<BoxedStream>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    let (code, reason) = loop {
        let n = tokio::select! {
            _ = connection.cancel.cancelled() => return,
            result = reader.read(&mut buf) => match result {
                Ok(0) => break (CLOSE_NORMAL, "Remote closed"),
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(id = %connection.id, "TCP read failed: {}", e);
                    break (CLOSE_INTERNAL_ERROR, "Read error");
                }
            },
        };

        if let Err(e) = connection.boundary.send(&buf[..n]).await {
            tracing::debug!(id = %connection.id, "Boundary send failed: {}", e);
            break (CLOSE_INTERNAL_ERROR, "Client delivery failed");
        }
    };

    connection.finish(code, reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoundaryError;
    use async_trait::async_trait;
    use cleanpath_transport::{TransportError, TransportResult};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    struct ChannelBoundary {
        data: mpsc::UnboundedSender<Vec<u8>>,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl Boundary for ChannelBoundary {
        async fn send(&self, data: &[u8]) -> std::result::Result<(), BoundaryError> {
            self.data.send(data.to_vec()).map_err(|_| BoundaryError::Closed)
        }

        async fn close(&self, _code: u16, _reason: &str) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PipeDialer {
        remote: std::sync::Mutex<Option<DuplexStream>>,
        capacity: usize,
    }

    #[async_trait]
    impl Dialer for PipeDialer {
        async fn dial(&self, _network: &str, address: &str) -> TransportResult<BoxedStream> {
            let (local, remote) = tokio::io::duplex(self.capacity);
            let mut slot = self.remote.lock().unwrap();
            if slot.is_some() {
                return Err(TransportError::DialFailed {
                    address: address.to_string(),
                    reason: "busy".to_string(),
                });
            }
            *slot = Some(remote);
            Ok(Box::new(local))
        }
    }

    fn setup() -> (
        TcpConnectionBridge,
        Arc<PipeDialer>,
        Arc<ChannelBoundary>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        setup_with_capacity(1024)
    }

    fn setup_with_capacity(
        capacity: usize,
    ) -> (
        TcpConnectionBridge,
        Arc<PipeDialer>,
        Arc<ChannelBoundary>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let dialer = Arc::new(PipeDialer {
            remote: std::sync::Mutex::new(None),
            capacity,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let boundary = Arc::new(ChannelBoundary {
            data: tx,
            closes: AtomicUsize::new(0),
        });
        (
            TcpConnectionBridge::new(dialer.clone()),
            dialer,
            boundary,
            rx,
        )
    }

    #[tokio::test]
    async fn test_connect_send_receive() {
        let (bridge, dialer, boundary, mut rx) = setup();
        let conn = bridge.connect("host", 22, boundary.clone()).await.unwrap();
        assert_eq!(conn.id(), "conn_1");
        assert_eq!(bridge.connection_count(), 1);

        let mut remote = dialer.remote.lock().unwrap().take().unwrap();

        conn.send(b"ssh").await.unwrap();
        let mut buf = [0u8; 3];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ssh");

        remote.write_all(b"banner").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"banner");

        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        assert_eq!(boundary.closes.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.connection_count(), 0);
        assert!(matches!(conn.send(b"late").await, Err(RelayError::NotOpen)));
    }

    #[tokio::test]
    async fn test_remote_eof_closes_once() {
        let (bridge, dialer, boundary, _rx) = setup();
        let conn = bridge.connect("host", 22, boundary.clone()).await.unwrap();

        drop(dialer.remote.lock().unwrap().take());

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !conn.is_closed() || bridge.connection_count() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // Returns only after the read loop's close reached the boundary
        conn.close().await;
        assert_eq!(boundary.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_interrupts_send_to_stalled_remote() {
        let (bridge, dialer, boundary, _rx) = setup_with_capacity(16);
        let conn = bridge.connect("host", 22, boundary.clone()).await.unwrap();
        // Held open but never read
        let _remote = dialer.remote.lock().unwrap().take().unwrap();

        let stuck = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(&[0u8; 4096]).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!stuck.is_finished());

        tokio::time::timeout(std::time::Duration::from_secs(2), conn.close())
            .await
            .expect("close waited on a blocked send");

        assert!(matches!(stuck.await.unwrap(), Err(RelayError::NotOpen)));
        assert_eq!(boundary.closes.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let (bridge, dialer, boundary, _rx) = setup();
        *dialer.remote.lock().unwrap() = Some(tokio::io::duplex(8).0);

        let result = bridge.connect("host", 22, boundary).await;
        assert!(matches!(result, Err(RelayError::DialFailure { .. })));
        assert_eq!(bridge.connection_count(), 0);
    }
}
