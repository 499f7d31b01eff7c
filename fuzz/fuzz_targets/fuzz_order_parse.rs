// Copyright (c) 2026 Zonechain
// Licensed under the Apache License, Version 2.0

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;
use zonechain::core::messages::Order;

// Client datagrams are untrusted; parsing must never panic.
fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<Order>(data);
});
