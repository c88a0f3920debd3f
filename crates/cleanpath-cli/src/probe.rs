//! `cleanpath probe`: ask a relay to negotiate a destination and report what
//! came back.

use cleanpath_core::{CleanPathPdu, MAX_PDU_SIZE, detect_pdu_length};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Bytes of each certificate shown in the report
const CERT_PREFIX_LEN: usize = 16;

/// Send a request for `destination` through the relay at `relay` and return
/// the decoded reply.
///
/// # Errors
///
/// Returns an error if the relay is unreachable, closes before replying, or
/// replies with something that is not a CleanPath PDU.
pub async fn probe(
    relay: &str,
    destination: &str,
    initial_payload: Option<Vec<u8>>,
    timeout: Duration,
) -> anyhow::Result<CleanPathPdu> {
    let mut request = CleanPathPdu::request(destination);
    request.initial_payload = initial_payload;

    let exchange = async {
        let mut stream = TcpStream::connect(relay).await?;
        stream.write_all(&request.encode()).await?;
        read_pdu(&mut stream).await
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| anyhow::anyhow!("Relay did not answer within {:?}", timeout))?
}

async fn read_pdu(stream: &mut TcpStream) -> anyhow::Result<CleanPathPdu> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(len) = detect_pdu_length(&buf)? {
            if buf.len() >= len {
                return Ok(CleanPathPdu::decode(&buf[..len])?);
            }
        }
        if buf.len() > MAX_PDU_SIZE {
            anyhow::bail!("Reply exceeds {} bytes", MAX_PDU_SIZE);
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            anyhow::bail!("Relay closed the connection after {} bytes", buf.len());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Human-readable report of a reply
#[must_use]
pub fn describe(reply: &CleanPathPdu) -> String {
    let mut out = String::new();

    if let Some(error) = reply.error_text() {
        out.push_str(&format!("Error: {error}\n"));
        return out;
    }

    out.push_str(&format!(
        "Server address: {}\n",
        reply.server_addr.as_deref().unwrap_or("(none)")
    ));

    if let Some(payload) = &reply.initial_payload {
        out.push_str(&format!(
            "Initial payload response: {} bytes ({})\n",
            payload.len(),
            hex::encode(&payload[..payload.len().min(CERT_PREFIX_LEN)])
        ));
    }

    match &reply.server_cert_chain {
        None => out.push_str("TLS: not used\n"),
        Some(chain) => {
            out.push_str(&format!("TLS: {} certificate(s)\n", chain.len()));
            for (i, cert) in chain.iter().enumerate() {
                out.push_str(&format!(
                    "  [{}] {} bytes {}...\n",
                    i,
                    cert.len(),
                    hex::encode(&cert[..cert.len().min(CERT_PREFIX_LEN)])
                ));
            }
        }
    }

    out
}
