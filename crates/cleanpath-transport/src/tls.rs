//! TLS upgrade of a dialed stream.
//!
//! The relay terminates TLS towards the destination but does not decide
//! whether the destination is trustworthy. That decision belongs to the
//! client, which receives the full certificate chain in the negotiation
//! response. The verifier here therefore accepts any chain and any name,
//! while still checking that the handshake signatures were produced by the
//! key in the presented leaf certificate.

use crate::dialer::BoxedStream;
use crate::error::{TransportError, TransportResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

/// Certificate verifier that defers trust decisions to the relay's client.
///
/// Chain building, expiry and name checks are skipped. Handshake signatures
/// are verified against the provider's supported algorithms.
#[derive(Debug)]
pub struct DeferredTrustVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl DeferredTrustVerifier {
    /// Create a verifier using the signature algorithms of `provider`
    #[must_use]
    pub fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for DeferredTrustVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Performs client-side TLS handshakes over dialed streams.
#[derive(Clone)]
pub struct TlsUpgrader {
    connector: TlsConnector,
}

impl TlsUpgrader {
    /// Build an upgrader with the ring provider and [`DeferredTrustVerifier`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if the provider rejects the default
    /// protocol versions.
    pub fn new() -> TransportResult<Self> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = Arc::new(DeferredTrustVerifier::new(&provider));

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();

        Ok(Self::from_config(Arc::new(config)))
    }

    /// Wrap an existing client configuration
    #[must_use]
    pub fn from_config(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
        }
    }

    /// Run the handshake over `stream`, presenting `host` as the SNI name.
    ///
    /// Returns the established session and the server's certificate chain as
    /// DER blobs in the order the server sent them (leaf first).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] if `host` is not a valid
    /// server name, or [`TransportError::Tls`] if the handshake fails.
    pub async fn upgrade(
        &self,
        stream: BoxedStream,
        host: &str,
    ) -> TransportResult<(TlsStream<BoxedStream>, Vec<Vec<u8>>)> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| TransportError::InvalidAddress(format!("{host}: {e}")))?;

        let tls_stream = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| TransportError::Tls(e.to_string()))?;

        let chain: Vec<Vec<u8>> = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
            .unwrap_or_default();

        tracing::debug!(
            "TLS established with {} ({} certificates)",
            host,
            chain.len()
        );

        Ok((tls_stream, chain))
    }
}

impl std::fmt::Debug for TlsUpgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsUpgrader").finish_non_exhaustive()
    }
}
