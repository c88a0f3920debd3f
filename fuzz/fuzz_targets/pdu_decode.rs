//! Fuzz target for CleanPath PDU decoding
//!
//! The decoder must return Ok or Err for any input, and anything it accepts
//! must re-encode to a PDU that decodes to the same value.

#![no_main]

use cleanpath_core::CleanPathPdu;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(pdu) = CleanPathPdu::decode(data) {
        let encoded = pdu.encode();
        assert_eq!(CleanPathPdu::decode(&encoded).as_ref(), Ok(&pdu));
        let _ = pdu.kind();
        let _ = pdu.error_text();
    }
});
