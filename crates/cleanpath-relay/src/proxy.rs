//! Relay entry points.
//!
//! [`CleanPathProxy`] is the facade the embedding application talks to:
//! endpoint creation, transport attachment, introspection and disconnects.
//! Every attached session runs on its own task:
//!
//! ```text
//! attach_transport ──▶ spawn ──▶ open bridge ──▶ first message
//!                                                    │
//!                                   negotiate ◀──────┘
//!                                       │
//!                      ┌── Ok ──▶ forwarder (2 tasks) ──▶ teardown
//!                      └── Err ─▶ teardown
//! ```

use crate::boundary::Boundary;
use crate::bridge::TransportBridge;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::forwarder;
use crate::negotiation::Negotiator;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionInfo};
use crate::{CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR};
use cleanpath_transport::{Dialer, TlsUpgrader, join_host_port};
use std::sync::Arc;

/// A registered endpoint a client can attach to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    /// Identifier the boundary attaches with
    pub proxy_id: String,
    /// URL the client connects to
    pub url: String,
    /// Destination the endpoint was created for
    pub destination: String,
}

struct ProxyInner {
    config: Arc<RelayConfig>,
    registry: Arc<SessionRegistry>,
    negotiator: Arc<Negotiator>,
}

/// CleanPath relay
///
/// Cheap to clone; clones share the registry.
///
/// # Examples
///
/// ```no_run
/// use cleanpath_relay::{CleanPathProxy, RelayConfig};
/// use cleanpath_transport::TcpDialer;
/// use std::sync::Arc;
///
/// # fn example() -> Result<(), cleanpath_relay::RelayError> {
/// let proxy = CleanPathProxy::new(RelayConfig::default(), Arc::new(TcpDialer::new()))?;
/// let endpoint = proxy.create_proxy_endpoint("desktop.internal", 3389);
/// println!("connect to {}", endpoint.url);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct CleanPathProxy {
    inner: Arc<ProxyInner>,
}

impl CleanPathProxy {
    /// Create a relay that dials through `dialer`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] if `config` does not validate or
    /// the TLS client cannot be built.
    pub fn new(config: RelayConfig, dialer: Arc<dyn Dialer>) -> Result<Self> {
        let upgrader = TlsUpgrader::new()
            .map_err(|e| RelayError::InvalidConfig(format!("TLS client: {e}").into()))?;
        Self::with_upgrader(config, dialer, upgrader)
    }

    /// Create a relay with a specific TLS upgrader.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] if `config` does not validate.
    pub fn with_upgrader(
        config: RelayConfig,
        dialer: Arc<dyn Dialer>,
        upgrader: TlsUpgrader,
    ) -> Result<Self> {
        config.validate()?;

        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new());
        let negotiator = Arc::new(Negotiator::new(
            config.clone(),
            registry.clone(),
            dialer,
            upgrader,
        ));

        Ok(Self {
            inner: Arc::new(ProxyInner {
                config,
                registry,
                negotiator,
            }),
        })
    }

    /// Relay configuration
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Shared session registry
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Register a destination and return the endpoint a client attaches to
    pub fn create_proxy_endpoint(&self, host: &str, port: u16) -> ProxyEndpoint {
        self.register_endpoint(join_host_port(host, port))
    }

    /// Register an endpoint for the configured default destination
    pub fn create_default_endpoint(&self) -> ProxyEndpoint {
        tracing::info!(
            destination = %self.inner.config.default_destination,
            "No destination given, using default"
        );
        self.register_endpoint(self.inner.config.default_destination.clone())
    }

    fn register_endpoint(&self, destination: String) -> ProxyEndpoint {
        let proxy_id = self.inner.registry.next_proxy_id();
        self.inner.registry.set_destination(&proxy_id, &destination);

        let url = self.inner.config.endpoint_url(&proxy_id);
        tracing::info!(%proxy_id, %destination, %url, "Proxy endpoint created");

        ProxyEndpoint {
            proxy_id,
            url,
            destination,
        }
    }

    /// Bind a client boundary to `proxy_id` and start its session.
    ///
    /// The session resolves to the endpoint's destination, or the configured
    /// default if `proxy_id` was never created. The returned bridge is where
    /// the boundary adapter feeds inbound data and reports the client's close.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SessionExists`] if a live session already uses
    /// `proxy_id`.
    pub fn attach_transport(
        &self,
        boundary: Arc<dyn Boundary>,
        proxy_id: &str,
    ) -> Result<Arc<TransportBridge>> {
        let destination = self
            .inner
            .registry
            .destination(proxy_id)
            .unwrap_or_else(|| self.inner.config.default_destination.clone());

        let session = self
            .inner
            .registry
            .register(proxy_id, &destination, boundary)?;
        let bridge = session.bridge().clone();

        tracing::info!(proxy_id, %destination, "Transport attached");

        tokio::spawn(run_session(
            self.inner.negotiator.clone(),
            session,
            self.inner.config.forward_buffer_size,
        ));

        Ok(bridge)
    }

    /// Number of live sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.registry.session_count()
    }

    /// Snapshot of every live session
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::new();
        for session in self.inner.registry.sessions() {
            infos.push(session.info().await);
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Tear down the session attached to `proxy_id`.
    ///
    /// Returns once the remote connection is closed and the boundary has
    /// been notified.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::SessionNotFound`] if no such session is live.
    pub async fn disconnect(&self, proxy_id: &str) -> Result<()> {
        let session = self
            .inner
            .registry
            .lookup(proxy_id)
            .ok_or_else(|| RelayError::SessionNotFound(proxy_id.to_string()))?;
        session.teardown(CLOSE_GOING_AWAY, "Disconnected").await;
        Ok(())
    }
}

impl std::fmt::Debug for CleanPathProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanPathProxy")
            .field("config", &self.inner.config)
            .field("sessions", &self.inner.registry.session_count())
            .finish()
    }
}

fn close_code(err: &RelayError) -> u16 {
    match err {
        RelayError::MalformedPdu(_)
        | RelayError::UnsupportedVersion { .. }
        | RelayError::InvalidRequest(_) => CLOSE_PROTOCOL_ERROR,
        RelayError::Cancelled => CLOSE_NORMAL,
        _ => CLOSE_INTERNAL_ERROR,
    }
}

async fn run_session(negotiator: Arc<Negotiator>, session: Arc<Session>, buffer_size: usize) {
    let Ok(mut backlog) = session.bridge().open().await else {
        session.teardown(CLOSE_NORMAL, "Closed before open").await;
        return;
    };

    let Some(mut inbound) = session.take_inbound().await else {
        session.teardown(CLOSE_NORMAL, "Session already closed").await;
        return;
    };

    let token = session.cancel_token();
    let first = match backlog.pop_front() {
        Some(first) => Some(first),
        None => tokio::select! {
            _ = token.cancelled() => None,
            first = inbound.recv() => first,
        },
    };
    let Some(first) = first else {
        session
            .teardown(CLOSE_NORMAL, "Client closed before negotiation")
            .await;
        return;
    };

    let outcome = tokio::select! {
        _ = token.cancelled() => Err(RelayError::Cancelled),
        outcome = negotiator.negotiate(&session, &first) => outcome,
    };

    match outcome {
        Ok(mode) => {
            tracing::info!(proxy_id = session.id(), %mode, "Session established");
            forwarder::run(session, backlog, inbound, buffer_size).await;
        }
        Err(e) => {
            if e.is_negotiation_error() {
                tracing::warn!(proxy_id = session.id(), "Negotiation failed: {}", e);
            } else {
                tracing::debug!(proxy_id = session.id(), "Negotiation stopped: {}", e);
            }
            session.teardown(close_code(&e), &e.to_string()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoundaryError;
    use async_trait::async_trait;
    use cleanpath_transport::{BoxedStream, TransportError, TransportResult};

    struct NullBoundary;

    #[async_trait]
    impl Boundary for NullBoundary {
        async fn send(&self, _data: &[u8]) -> std::result::Result<(), BoundaryError> {
            Ok(())
        }

        async fn close(&self, _code: u16, _reason: &str) {}
    }

    struct NoDialer;

    #[async_trait]
    impl Dialer for NoDialer {
        async fn dial(&self, _network: &str, _address: &str) -> TransportResult<BoxedStream> {
            Err(TransportError::Closed)
        }
    }

    fn proxy() -> CleanPathProxy {
        CleanPathProxy::new(RelayConfig::default(), Arc::new(NoDialer)).unwrap()
    }

    #[test]
    fn test_create_proxy_endpoint() {
        let proxy = proxy();

        let first = proxy.create_proxy_endpoint("desktop.internal", 3389);
        assert_eq!(first.proxy_id, "proxy_1");
        assert_eq!(first.url, "ws://cleanpath.proxy.local/proxy_1");
        assert_eq!(first.destination, "desktop.internal:3389");
        assert_eq!(
            proxy.registry().destination("proxy_1").as_deref(),
            Some("desktop.internal:3389")
        );

        let second = proxy.create_proxy_endpoint("fe80::1", 3389);
        assert_eq!(second.proxy_id, "proxy_2");
        assert_eq!(second.destination, "[fe80::1]:3389");
    }

    #[test]
    fn test_create_default_endpoint() {
        let proxy = proxy();
        let endpoint = proxy.create_default_endpoint();
        assert_eq!(endpoint.destination, proxy.config().default_destination);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RelayConfig {
            forward_buffer_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            CleanPathProxy::new(config, Arc::new(NoDialer)),
            Err(RelayError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_attach_and_disconnect() {
        let proxy = proxy();
        let endpoint = proxy.create_proxy_endpoint("host", 22);

        let bridge = proxy
            .attach_transport(Arc::new(NullBoundary), &endpoint.proxy_id)
            .unwrap();
        assert_eq!(bridge.session_id().as_deref(), Some("proxy_1"));
        assert_eq!(proxy.session_count(), 1);

        let sessions = proxy.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].destination, "host:22");

        assert!(
            proxy
                .attach_transport(Arc::new(NullBoundary), &endpoint.proxy_id)
                .is_err()
        );

        proxy.disconnect(&endpoint.proxy_id).await.unwrap();
        assert!(matches!(
            proxy.disconnect(&endpoint.proxy_id).await,
            Err(RelayError::SessionNotFound(id)) if id == endpoint.proxy_id
        ));
        assert_eq!(proxy.session_count(), 0);
        assert!(proxy.registry().destination(&endpoint.proxy_id).is_none());
    }

    #[tokio::test]
    async fn test_attach_unknown_id_uses_default() {
        let proxy = proxy();
        proxy
            .attach_transport(Arc::new(NullBoundary), "adhoc")
            .unwrap();

        let session = proxy.registry().lookup("adhoc").unwrap();
        assert_eq!(session.destination().await, "127.0.0.1:3389");
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(
            close_code(&RelayError::UnsupportedVersion { found: 1 }),
            CLOSE_PROTOCOL_ERROR
        );
        assert_eq!(close_code(&RelayError::Cancelled), CLOSE_NORMAL);
        assert_eq!(
            close_code(&RelayError::HandshakeFailure(TransportError::Closed)),
            CLOSE_INTERNAL_ERROR
        );
    }
}
