//! Fuzz target for the relay frame decoder
//!
//! Arbitrary bytes must decode to a message or an error, never a panic, and
//! anything that decodes must re-encode within the frame limit.

#![no_main]

use libfuzzer_sys::fuzz_target;
use meshtun_relay::RelayMessage;
use meshtun_relay::protocol::{MAX_FRAME_SIZE, encode_frame};

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_FRAME_SIZE {
        return;
    }
    if let Ok(msg) = RelayMessage::from_bytes(data) {
        let frame = encode_frame(&msg).expect("decoded message re-encodes");
        assert!(frame.len() <= MAX_FRAME_SIZE + 4);
        let again = RelayMessage::from_bytes(&frame[4..]).expect("re-encoded frame decodes");
        assert_eq!(again, msg);
    }
});
