//! Relay configuration

use crate::error::{RelayError, Result};
use crate::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_FORWARD_BUFFER, INITIAL_RESPONSE_LIMIT};
use cleanpath_transport::split_host_port;
use std::time::Duration;

/// Decides whether a destination is reached over TLS
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsPolicy {
    /// Every destination is upgraded to TLS
    Always,
    /// Bytes are relayed raw, no TLS termination
    Never,
    /// TLS for destinations on these ports
    Ports(Vec<u16>),
}

impl TlsPolicy {
    /// Whether `destination` (`host:port`) requires a TLS handshake.
    ///
    /// A destination without a parseable port only matches [`TlsPolicy::Always`].
    #[must_use]
    pub fn requires_tls(&self, destination: &str) -> bool {
        match self {
            TlsPolicy::Always => true,
            TlsPolicy::Never => false,
            TlsPolicy::Ports(ports) => split_host_port(destination)
                .map(|(_, port)| ports.contains(&port))
                .unwrap_or(false),
        }
    }
}

impl Default for TlsPolicy {
    fn default() -> Self {
        TlsPolicy::Ports(vec![3389])
    }
}

/// Relay engine configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Destination used when neither the PDU nor the endpoint supplies one
    pub default_destination: String,

    /// Budget for dial, initial payload exchange and TLS handshake together
    pub connect_timeout: Duration,

    /// Buffer size of each forwarding loop
    pub forward_buffer_size: usize,

    /// Largest single read of the remote's answer to the initial payload
    pub initial_response_limit: usize,

    /// Plain vs TLS decision
    pub tls_policy: TlsPolicy,

    /// Base URL prepended to proxy ids in endpoint URLs
    pub endpoint_base_url: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            default_destination: "127.0.0.1:3389".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            forward_buffer_size: DEFAULT_FORWARD_BUFFER,
            initial_response_limit: INITIAL_RESPONSE_LIMIT,
            tls_policy: TlsPolicy::default(),
            endpoint_base_url: "ws://cleanpath.proxy.local".to_string(),
        }
    }
}

impl RelayConfig {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidConfig`] if a value is unusable.
    pub fn validate(&self) -> Result<()> {
        split_host_port(&self.default_destination).map_err(|e| {
            RelayError::InvalidConfig(format!("default_destination: {e}").into())
        })?;

        if self.connect_timeout.is_zero() {
            return Err(RelayError::InvalidConfig(
                "connect_timeout must be greater than zero".into(),
            ));
        }

        if self.forward_buffer_size == 0 {
            return Err(RelayError::InvalidConfig(
                "forward_buffer_size must be greater than zero".into(),
            ));
        }

        if self.initial_response_limit == 0 {
            return Err(RelayError::InvalidConfig(
                "initial_response_limit must be greater than zero".into(),
            ));
        }

        if let TlsPolicy::Ports(ports) = &self.tls_policy {
            if ports.contains(&0) {
                return Err(RelayError::InvalidConfig("TLS port 0 is invalid".into()));
            }
        }

        if self.endpoint_base_url.is_empty() || self.endpoint_base_url.ends_with('/') {
            return Err(RelayError::InvalidConfig(
                "endpoint_base_url must be non-empty without a trailing slash".into(),
            ));
        }

        Ok(())
    }

    /// URL a client uses to attach to `proxy_id`
    #[must_use]
    pub fn endpoint_url(&self, proxy_id: &str) -> String {
        format!("{}/{}", self.endpoint_base_url, proxy_id)
    }
}
