//! Dial capability.
//!
//! The relay never opens sockets itself. It is handed a [`Dialer`], which in
//! production is the surrounding mesh network's dial primitive and in tests
//! is whatever scripted stream the test needs.

use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A duplex byte stream to a remote peer.
pub trait RemoteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> RemoteStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Owned, type-erased remote stream
pub type BoxedStream = Box<dyn RemoteStream>;

/// Opens connections to remote destinations.
///
/// Cancellation is the caller's concern: dropping the returned future must
/// abandon the dial.
///
/// # Examples
///
/// ```no_run
/// use cleanpath_transport::{Dialer, TcpDialer};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let dialer = TcpDialer::new();
/// let stream = dialer.dial("tcp", "desktop.internal:3389").await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `address` (`host:port`) over `network` (`"tcp"`).
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the destination cannot be reached.
    async fn dial(&self, network: &str, address: &str) -> TransportResult<BoxedStream>;
}

/// Plain TCP dialer backed by the host network stack.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    /// Keepalive idle time applied to dialed sockets (`None` disables it)
    keepalive: Option<Duration>,
    /// Disable Nagle's algorithm
    nodelay: bool,
}

impl TcpDialer {
    /// Create a dialer with `TCP_NODELAY` and a 60 s keepalive
    #[must_use]
    pub fn new() -> Self {
        Self {
            keepalive: Some(Duration::from_secs(60)),
            nodelay: true,
        }
    }

    /// Override the keepalive idle time
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    fn configure(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        if let Some(idle) = self.keepalive {
            let keepalive = socket2::TcpKeepalive::new().with_time(idle);
            socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, network: &str, address: &str) -> TransportResult<BoxedStream> {
        if !network.starts_with("tcp") {
            return Err(TransportError::InvalidAddress(format!(
                "unsupported network: {network}"
            )));
        }

        let stream =
            TcpStream::connect(address)
                .await
                .map_err(|e| TransportError::DialFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })?;

        if let Err(e) = self.configure(&stream) {
            tracing::debug!("Failed to tune socket for {}: {}", address, e);
        }

        tracing::debug!(
            "Dialed {} (local {:?})",
            address,
            stream.local_addr().ok()
        );
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            sock.read_exact(&mut buf).await.unwrap();
            buf
        });

        let dialer = TcpDialer::new();
        let mut stream = dialer.dial("tcp", &addr.to_string()).await.unwrap();
        stream.write_all(b"ping").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_tcp_dialer_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpDialer::new().dial("tcp", &addr.to_string()).await;
        assert!(matches!(result, Err(TransportError::DialFailed { .. })));
    }

    #[tokio::test]
    async fn test_tcp_dialer_rejects_udp() {
        let result = TcpDialer::new().dial("udp", "127.0.0.1:9").await;
        assert!(matches!(result, Err(TransportError::InvalidAddress(_))));
    }
}
