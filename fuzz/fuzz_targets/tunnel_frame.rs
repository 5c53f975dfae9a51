//! Fuzz target for tunnel message bodies in both directions

#![no_main]

use libfuzzer_sys::fuzz_target;
use meshtun_core::tunnel::message::decode_body;
use meshtun_core::tunnel::{ManagerMessage, TunnelMessage};

const LIMIT: usize = 1024 * 1024;

fuzz_target!(|data: &[u8]| {
    let _ = decode_body::<ManagerMessage>(data, LIMIT);
    let _ = decode_body::<TunnelMessage>(data, LIMIT);
});
