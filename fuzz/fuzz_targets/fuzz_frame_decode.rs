//! Fuzz target for wire frame decoding.
//!
//! Arbitrary bytes from a peer must decode to a message or a protocol
//! error, never a panic. Decoded messages re-encode to a frame that
//! decodes to the same message.

#![no_main]

use doc_replication::transport::{decode_frame, encode_frame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(message) = decode_frame("fuzz", data) else {
        return;
    };

    let frame = encode_frame(&message).expect("decoded message must re-encode");
    let again = decode_frame("fuzz", &frame).expect("re-encoded frame must decode");
    assert_eq!(again.kind(), message.kind());

    if let doc_replication::ReplicationMessage::Batch(batch) = &message {
        // Validation may reject, but must not panic.
        let _ = batch.validate("fuzz");
    }
});
