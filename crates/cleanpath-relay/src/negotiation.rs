//! Negotiation engine.
//!
//! Consumes the first inbound message of a session and brings the session to
//! `Established` or fails it. The steps are individually failable so that
//! each failure reaches the client as a specific error PDU:
//!
//! ```text
//! decode ─┬─ raw marker ──▶ direct: dial → first write → relay answer
//!         │
//!         └─ PDU ─▶ version ─▶ request shape ─▶ resolve destination
//!                   ─▶ dial ─▶ [initial payload] ─▶ [TLS] ─▶ response PDU
//! ```
//!
//! Dial, initial payload exchange and TLS handshake share one deadline.

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::registry::SessionRegistry;
use crate::session::{NegotiationState, Session, SessionMode};
use cleanpath_core::{CLEANPATH_VERSION, CleanPathPdu, PduKind, is_raw_negotiation};
use cleanpath_transport::{
    BoxedStream, Dialer, RemoteConnection, TlsUpgrader, TransportError, split_host_port,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};

/// Drives sessions from their first message to an installed remote connection
pub struct Negotiator {
    config: Arc<RelayConfig>,
    registry: Arc<SessionRegistry>,
    dialer: Arc<dyn Dialer>,
    upgrader: TlsUpgrader,
}

impl Negotiator {
    /// Create a negotiator sharing `registry` with the proxy
    pub fn new(
        config: Arc<RelayConfig>,
        registry: Arc<SessionRegistry>,
        dialer: Arc<dyn Dialer>,
        upgrader: TlsUpgrader,
    ) -> Self {
        Self {
            config,
            registry,
            dialer,
            upgrader,
        }
    }

    /// Negotiate `session` from its first inbound message.
    ///
    /// On success the remote connection is installed in the session and the
    /// response has been delivered to the client. On failure an error PDU is
    /// delivered when the failure is reportable and the session was not in
    /// direct mode; the caller tears the session down.
    ///
    /// # Errors
    ///
    /// Returns the [`RelayError`] of the step that failed.
    pub async fn negotiate(&self, session: &Arc<Session>, first: &[u8]) -> Result<SessionMode> {
        session
            .set_negotiation_state(NegotiationState::Negotiating)
            .await;

        let pdu = match CleanPathPdu::decode(first) {
            Ok(pdu) => pdu,
            Err(e) if is_raw_negotiation(first) => {
                tracing::debug!(
                    proxy_id = session.id(),
                    "First message is not CleanPath ({}), using direct mode",
                    e
                );
                return self.negotiate_direct(session, first).await;
            }
            Err(e) => {
                tracing::warn!(
                    proxy_id = session.id(),
                    bytes = first.len(),
                    "Malformed first message: {}",
                    e
                );
                return Err(e.into());
            }
        };

        match self.negotiate_pdu(session, &pdu).await {
            Ok(mode) => Ok(mode),
            Err(e) => {
                if let Some(text) = e.reply_text() {
                    let reply = CleanPathPdu::error_reply(text).encode();
                    if let Err(send_err) = session.bridge().receive(&reply).await {
                        tracing::debug!(
                            proxy_id = session.id(),
                            "Could not deliver error reply: {}",
                            send_err
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn negotiate_pdu(&self, session: &Arc<Session>, pdu: &CleanPathPdu) -> Result<SessionMode> {
        if pdu.version != CLEANPATH_VERSION {
            tracing::warn!(
                proxy_id = session.id(),
                "Unsupported CleanPath version {} (expected {})",
                pdu.version,
                CLEANPATH_VERSION
            );
            return Err(RelayError::UnsupportedVersion { found: pdu.version });
        }

        let kind = pdu.kind();
        if kind != PduKind::Request {
            return Err(RelayError::InvalidRequest(
                format!("{kind:?} PDU received as request").into(),
            ));
        }

        let destination = self.resolve_destination(session.id(), pdu.destination.as_deref());
        session.set_destination(&destination).await;

        let deadline = Instant::now() + self.config.connect_timeout;
        let mut stream = self.dial(&destination, deadline).await?;

        let initial_response = match &pdu.initial_payload {
            Some(payload) => match self.exchange_initial_payload(&mut stream, payload, deadline).await {
                Ok(answer) => Some(answer),
                Err(e) => {
                    abandon(stream).await;
                    return Err(e);
                }
            },
            None => None,
        };

        let (remote, chain, mode) = if self.config.tls_policy.requires_tls(&destination) {
            let host = match split_host_port(&destination) {
                Ok((host, _)) => host.to_string(),
                Err(e) => {
                    abandon(stream).await;
                    return Err(RelayError::HandshakeFailure(e));
                }
            };

            // The upgrader owns the stream from here; a failed handshake drops it.
            let (tls, chain) = match timeout_at(deadline, self.upgrader.upgrade(stream, &host)).await {
                Ok(Ok(upgraded)) => upgraded,
                Ok(Err(e)) => {
                    tracing::warn!(proxy_id = session.id(), %destination, "TLS handshake failed: {}", e);
                    return Err(RelayError::HandshakeFailure(e));
                }
                Err(_) => {
                    return Err(RelayError::HandshakeFailure(TransportError::Timeout(
                        format!("TLS handshake with {destination}"),
                    )));
                }
            };

            tracing::info!(
                proxy_id = session.id(),
                %destination,
                certificates = chain.len(),
                leaf = %chain.first().map(|c| hex::encode(&c[..c.len().min(16)])).unwrap_or_default(),
                "TLS handshake complete"
            );
            (RemoteConnection::Tls(Box::new(tls)), Some(chain), SessionMode::Tls)
        } else {
            (RemoteConnection::Plain(stream), None, SessionMode::Plain)
        };

        let response = CleanPathPdu {
            initial_payload: initial_response,
            server_cert_chain: chain,
            ..CleanPathPdu::response(destination)
        };

        self.establish(session, remote, mode, &response.encode()).await?;
        Ok(mode)
    }

    async fn negotiate_direct(&self, session: &Arc<Session>, first: &[u8]) -> Result<SessionMode> {
        let destination = self.resolve_destination(session.id(), None);
        session.set_destination(&destination).await;

        let deadline = Instant::now() + self.config.connect_timeout;
        let mut stream = self.dial(&destination, deadline).await?;

        let answer = match self.exchange_initial_payload(&mut stream, first, deadline).await {
            Ok(answer) => answer,
            Err(e) => {
                abandon(stream).await;
                return Err(e);
            }
        };

        session.record_to_remote(first.len());
        session.record_to_client(answer.len());
        self.establish(
            session,
            RemoteConnection::Plain(stream),
            SessionMode::Direct,
            &answer,
        )
        .await?;
        Ok(SessionMode::Direct)
    }

    /// Install `remote` and deliver `reply` to the client.
    ///
    /// Once installed, the remote belongs to the session and is closed by its
    /// teardown if delivery fails.
    async fn establish(
        &self,
        session: &Arc<Session>,
        remote: RemoteConnection,
        mode: SessionMode,
        reply: &[u8],
    ) -> Result<()> {
        if let Err(mut remote) = session.install_remote(remote, mode).await {
            if let Err(e) = remote.shutdown().await {
                tracing::debug!("Remote shutdown failed: {}", e);
            }
            return Err(RelayError::Cancelled);
        }

        session.bridge().receive(reply).await
    }

    /// Explicit destination, else the endpoint's table entry, else the
    /// configured default
    fn resolve_destination(&self, proxy_id: &str, explicit: Option<&str>) -> String {
        if let Some(destination) = explicit.filter(|d| !d.is_empty()) {
            return destination.to_string();
        }
        if let Some(destination) = self.registry.destination(proxy_id) {
            return destination;
        }
        tracing::info!(
            proxy_id,
            destination = %self.config.default_destination,
            "No destination for endpoint, using default"
        );
        self.config.default_destination.clone()
    }

    async fn dial(&self, destination: &str, deadline: Instant) -> Result<BoxedStream> {
        tracing::info!(destination, "Dialing");
        match timeout_at(deadline, self.dialer.dial("tcp", destination)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => {
                tracing::warn!(destination, "Dial failed: {}", source);
                Err(RelayError::DialFailure {
                    destination: destination.to_string(),
                    source,
                })
            }
            Err(_) => {
                tracing::warn!(destination, "Dial timed out");
                Err(RelayError::DialFailure {
                    destination: destination.to_string(),
                    source: TransportError::Timeout(format!("dial {destination}")),
                })
            }
        }
    }

    /// Write `payload` and read the remote's answer in a single bounded read
    async fn exchange_initial_payload(
        &self,
        stream: &mut BoxedStream,
        payload: &[u8],
        deadline: Instant,
    ) -> Result<Vec<u8>> {
        let write = async {
            stream.write_all(payload).await?;
            stream.flush().await
        };
        match timeout_at(deadline, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(RelayError::InitialPayload(e.into())),
            Err(_) => {
                return Err(RelayError::InitialPayload(TransportError::Timeout(
                    "initial payload write".to_string(),
                )));
            }
        }
        tracing::trace!(bytes = payload.len(), "Initial payload forwarded");

        let mut answer = vec![0u8; self.config.initial_response_limit];
        let n = match timeout_at(deadline, stream.read(&mut answer)).await {
            Ok(Ok(0)) => return Err(RelayError::InitialPayloadResponse(TransportError::Closed)),
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(RelayError::InitialPayloadResponse(e.into())),
            Err(_) => {
                return Err(RelayError::InitialPayloadResponse(TransportError::Timeout(
                    "initial payload response".to_string(),
                )));
            }
        };
        answer.truncate(n);
        tracing::trace!(bytes = n, "Initial payload answered");
        Ok(answer)
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn abandon(mut stream: BoxedStream) {
    if let Err(e) = stream.shutdown().await {
        tracing::debug!("Closing abandoned connection failed: {}", e);
    }
}
