//! The CleanPath negotiation PDU.
//!
//! Wire format: a DER SEQUENCE whose fields are explicitly context-tagged.
//!
//! ```text
//! CleanPathPdu ::= SEQUENCE {
//!     version            [0] INTEGER,
//!     error              [1] OCTET STRING OPTIONAL,
//!     destination        [2] UTF8String OPTIONAL,
//!     proxyAuth          [3] UTF8String OPTIONAL,
//!     serverAuth         [4] UTF8String OPTIONAL,
//!     preconnectionBlob  [5] UTF8String OPTIONAL,
//!     initialPayload     [6] OCTET STRING OPTIONAL,
//!     serverCertChain    [7] SEQUENCE OF OCTET STRING OPTIONAL,
//!     serverAddr         [9] UTF8String OPTIONAL
//! }
//! ```
//!
//! Field presence is preserved exactly: `Some(vec![])` and `None` encode
//! differently and decode back to themselves.

use crate::der::{
    self, DerReader, TAG_INTEGER, TAG_OCTET_STRING, TAG_SEQUENCE, TAG_UTF8_STRING,
};
use crate::error::{PduError, Result};
use crate::{CLEANPATH_VERSION, MAX_PDU_SIZE};

/// Context tag numbers of the PDU fields
mod field {
    pub const VERSION: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const DESTINATION: u8 = 2;
    pub const PROXY_AUTH: u8 = 3;
    pub const SERVER_AUTH: u8 = 4;
    pub const PRECONNECTION_BLOB: u8 = 5;
    pub const INITIAL_PAYLOAD: u8 = 6;
    pub const SERVER_CERT_CHAIN: u8 = 7;
    pub const SERVER_ADDR: u8 = 9;
}

/// Which direction a PDU's populated fields belong to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduKind {
    /// Client to relay: destination, credentials, preconnection blob
    Request,
    /// Relay to client: server address and certificate chain
    Response,
    /// Relay to client: failure reply
    Error,
    /// Request-shaped and response-shaped fields are both populated
    Mixed,
}

/// CleanPath control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanPathPdu {
    /// Protocol version
    pub version: i64,
    /// Failure description (error replies only)
    pub error: Option<Vec<u8>>,
    /// Requested `host:port`
    pub destination: Option<String>,
    /// Token authenticating the client to the relay
    pub proxy_auth: Option<String>,
    /// Token for the remote server
    pub server_auth: Option<String>,
    /// Opaque preconnection blob, passed through untouched
    pub preconnection_blob: Option<String>,
    /// First protocol handshake frame (request) or the remote's answer (response)
    pub initial_payload: Option<Vec<u8>>,
    /// DER certificates presented by the remote, leaf first
    pub server_cert_chain: Option<Vec<Vec<u8>>>,
    /// Address the relay actually connected to
    pub server_addr: Option<String>,
}

impl Default for CleanPathPdu {
    fn default() -> Self {
        Self {
            version: CLEANPATH_VERSION,
            error: None,
            destination: None,
            proxy_auth: None,
            server_auth: None,
            preconnection_blob: None,
            initial_payload: None,
            server_cert_chain: None,
            server_addr: None,
        }
    }
}

impl CleanPathPdu {
    /// Request for `destination` at the supported version
    #[must_use]
    pub fn request(destination: impl Into<String>) -> Self {
        Self {
            destination: Some(destination.into()),
            ..Self::default()
        }
    }

    /// Successful negotiation reply
    #[must_use]
    pub fn response(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: Some(server_addr.into()),
            ..Self::default()
        }
    }

    /// Failure reply carrying `message`
    #[must_use]
    pub fn error_reply(message: &str) -> Self {
        Self {
            error: Some(message.as_bytes().to_vec()),
            ..Self::default()
        }
    }

    /// Attach an initial negotiation payload
    #[must_use]
    pub fn with_initial_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.initial_payload = Some(payload.into());
        self
    }

    /// Attach a server certificate chain
    #[must_use]
    pub fn with_cert_chain(mut self, chain: Vec<Vec<u8>>) -> Self {
        self.server_cert_chain = Some(chain);
        self
    }

    /// Whether this PDU is a failure reply
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Error text, lossily decoded as UTF-8
    #[must_use]
    pub fn error_text(&self) -> Option<String> {
        self.error
            .as_deref()
            .map(|e| String::from_utf8_lossy(e).into_owned())
    }

    /// Classify the PDU by its populated fields.
    ///
    /// `initial_payload` travels in both directions and does not count.
    #[must_use]
    pub fn kind(&self) -> PduKind {
        let request = self.destination.is_some()
            || self.proxy_auth.is_some()
            || self.server_auth.is_some()
            || self.preconnection_blob.is_some();
        let response = self.server_addr.is_some() || self.server_cert_chain.is_some();

        match (request, response || self.error.is_some()) {
            (true, true) => PduKind::Mixed,
            (_, true) if self.error.is_some() => PduKind::Error,
            (false, true) => PduKind::Response,
            _ => PduKind::Request,
        }
    }

    /// Encode to DER
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.encoded_hint());

        der::write_explicit(
            &mut body,
            field::VERSION,
            TAG_INTEGER,
            &der::encode_integer(self.version),
        );
        if let Some(error) = &self.error {
            der::write_explicit(&mut body, field::ERROR, TAG_OCTET_STRING, error);
        }
        write_utf8(&mut body, field::DESTINATION, self.destination.as_deref());
        write_utf8(&mut body, field::PROXY_AUTH, self.proxy_auth.as_deref());
        write_utf8(&mut body, field::SERVER_AUTH, self.server_auth.as_deref());
        write_utf8(
            &mut body,
            field::PRECONNECTION_BLOB,
            self.preconnection_blob.as_deref(),
        );
        if let Some(payload) = &self.initial_payload {
            der::write_explicit(&mut body, field::INITIAL_PAYLOAD, TAG_OCTET_STRING, payload);
        }
        if let Some(chain) = &self.server_cert_chain {
            let mut certs = Vec::with_capacity(chain.iter().map(|c| c.len() + 4).sum());
            for cert in chain {
                der::write_element(&mut certs, TAG_OCTET_STRING, cert);
            }
            der::write_explicit(&mut body, field::SERVER_CERT_CHAIN, TAG_SEQUENCE, &certs);
        }
        write_utf8(&mut body, field::SERVER_ADDR, self.server_addr.as_deref());

        let mut out = Vec::with_capacity(body.len() + 6);
        der::write_element(&mut out, TAG_SEQUENCE, &body);
        out
    }

    /// Decode from DER.
    ///
    /// The whole buffer must be exactly one PDU.
    ///
    /// # Errors
    ///
    /// Returns [`PduError`] when the buffer is not a well-formed CleanPath
    /// PDU, the version field is absent, or a declared length exceeds the
    /// remaining buffer.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(PduError::TooLarge {
                size: data.len(),
                limit: MAX_PDU_SIZE,
            });
        }

        let mut outer = DerReader::new(data);
        let body = outer.read_expected(TAG_SEQUENCE)?;
        outer.finish()?;

        let mut pdu = Self::default();
        let mut version = None;
        let mut last_field: Option<u8> = None;
        let mut fields = DerReader::new(body);

        while !fields.is_empty() {
            let (tag, content) = fields.read_any()?;
            let number = der::context_number(tag).ok_or(PduError::UnexpectedTag {
                expected: der::context_tag(0),
                found: tag,
            })?;

            // DER requires SEQUENCE components in declaration order
            if last_field.is_some_and(|last| number <= last) {
                return Err(PduError::UnexpectedField(number));
            }
            last_field = Some(number);

            let mut inner = DerReader::new(content);
            match number {
                field::VERSION => {
                    version = Some(der::decode_integer(inner.read_expected(TAG_INTEGER)?)?);
                }
                field::ERROR => {
                    pdu.error = Some(inner.read_expected(TAG_OCTET_STRING)?.to_vec());
                }
                field::DESTINATION => pdu.destination = Some(read_utf8(&mut inner, number)?),
                field::PROXY_AUTH => pdu.proxy_auth = Some(read_utf8(&mut inner, number)?),
                field::SERVER_AUTH => pdu.server_auth = Some(read_utf8(&mut inner, number)?),
                field::PRECONNECTION_BLOB => {
                    pdu.preconnection_blob = Some(read_utf8(&mut inner, number)?);
                }
                field::INITIAL_PAYLOAD => {
                    pdu.initial_payload = Some(inner.read_expected(TAG_OCTET_STRING)?.to_vec());
                }
                field::SERVER_CERT_CHAIN => {
                    let mut certs = DerReader::new(inner.read_expected(TAG_SEQUENCE)?);
                    let mut chain = Vec::new();
                    while !certs.is_empty() {
                        chain.push(certs.read_expected(TAG_OCTET_STRING)?.to_vec());
                    }
                    pdu.server_cert_chain = Some(chain);
                }
                field::SERVER_ADDR => pdu.server_addr = Some(read_utf8(&mut inner, number)?),
                other => return Err(PduError::UnexpectedField(other)),
            }
            inner.finish()?;
        }

        pdu.version = version.ok_or(PduError::MissingVersion)?;
        Ok(pdu)
    }

    /// Rough encoded size, used to size buffers
    fn encoded_hint(&self) -> usize {
        let strings = [
            &self.destination,
            &self.proxy_auth,
            &self.server_auth,
            &self.preconnection_blob,
            &self.server_addr,
        ]
        .iter()
        .filter_map(|s| s.as_ref().map(|s| s.len() + 8))
        .sum::<usize>();
        let chain = self
            .server_cert_chain
            .as_ref()
            .map_or(0, |c| c.iter().map(|cert| cert.len() + 4).sum::<usize>() + 8);

        16 + strings
            + chain
            + self.error.as_ref().map_or(0, |e| e.len() + 8)
            + self.initial_payload.as_ref().map_or(0, |p| p.len() + 8)
    }
}

fn write_utf8(out: &mut Vec<u8>, number: u8, value: Option<&str>) {
    if let Some(value) = value {
        der::write_explicit(out, number, TAG_UTF8_STRING, value.as_bytes());
    }
}

fn read_utf8(reader: &mut DerReader<'_>, number: u8) -> Result<String> {
    let content = reader.read_expected(TAG_UTF8_STRING)?;
    std::str::from_utf8(content)
        .map(str::to_owned)
        .map_err(|_| PduError::InvalidUtf8(number))
}
