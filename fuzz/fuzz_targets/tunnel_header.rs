//! Fuzz target for the tunnel handshake header parser

#![no_main]

use libfuzzer_sys::fuzz_target;
use meshtun_core::tunnel::SpeakerRole;
use meshtun_core::tunnel::speaker::{Header, MAX_HEADER_LEN};

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_HEADER_LEN {
        return;
    }
    let Ok(line) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(header) = Header::parse(line) {
        let _ = header.negotiate(SpeakerRole::Manager);
        let _ = header.negotiate(SpeakerRole::Tunnel);
    }
});
