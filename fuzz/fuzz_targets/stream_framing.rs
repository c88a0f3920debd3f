//! Fuzz target for first-message framing on byte streams

#![no_main]

use cleanpath_core::{CleanPathPdu, detect_pdu_length, tpkt_length};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(Some(len)) = detect_pdu_length(data) {
        if len <= data.len() {
            let _ = CleanPathPdu::decode(&data[..len]);
        }
    }

    let _ = tpkt_length(data);
});
