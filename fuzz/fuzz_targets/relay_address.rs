//! Fuzz target for relay address normalization
//!
//! Whatever parses must print to a form that parses back to itself.

#![no_main]

use libfuzzer_sys::fuzz_target;
use meshtun_relay::RelayAddress;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(address) = RelayAddress::parse(input) {
        let reparsed = RelayAddress::parse(&address.to_string()).expect("normalized form parses");
        assert_eq!(reparsed, address);
    }
});
