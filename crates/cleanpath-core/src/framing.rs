//! Message boundaries on byte streams.
//!
//! The relay consumes whole messages, but some boundary adapters only see a
//! byte stream. These helpers find where the first message ends: either a
//! CleanPath PDU (DER SEQUENCE) or a raw TPKT-framed desktop protocol packet.

use crate::der::{self, TAG_SEQUENCE};
use crate::error::{PduError, Result};
use crate::{MAX_PDU_SIZE, RAW_NEGOTIATION_MARKER};

/// TPKT header size (version, reserved, 16-bit length)
pub const TPKT_HEADER_SIZE: usize = 4;

/// Total length of the CleanPath PDU at the start of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed to read the header.
///
/// # Errors
///
/// Returns [`PduError`] if the buffer cannot start a PDU or declares a PDU
/// larger than [`MAX_PDU_SIZE`].
pub fn detect_pdu_length(buf: &[u8]) -> Result<Option<usize>> {
    match buf.first() {
        None => return Ok(None),
        Some(&tag) if tag != TAG_SEQUENCE => {
            return Err(PduError::UnexpectedTag {
                expected: TAG_SEQUENCE,
                found: tag,
            });
        }
        Some(_) => {}
    }

    let header = match der::read_header(buf) {
        Ok(header) => header,
        Err(PduError::Truncated { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };

    let total = header.total_len();
    if total > MAX_PDU_SIZE {
        return Err(PduError::TooLarge {
            size: total,
            limit: MAX_PDU_SIZE,
        });
    }
    Ok(Some(total))
}

/// Total length of the TPKT packet at the start of `buf`.
///
/// Returns `None` if `buf` does not start with a complete TPKT header or the
/// declared length is smaller than the header itself.
#[must_use]
pub fn tpkt_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < TPKT_HEADER_SIZE || buf[0] != RAW_NEGOTIATION_MARKER {
        return None;
    }
    let len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
    (len >= TPKT_HEADER_SIZE).then_some(len)
}

/// Whether `buf` looks like a raw desktop protocol packet.
#[must_use]
pub fn is_raw_negotiation(buf: &[u8]) -> bool {
    buf.first() == Some(&RAW_NEGOTIATION_MARKER)
}
