// Copyright (c) 2026 Zonechain
// Licensed under the Apache License, Version 2.0

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;
use zonechain::core::block::{merkle_root, Block};

fuzz_target!(|data: &[u8]| {
    let Ok(block) = Block::decode(data) else { return };
    // A decodable block must survive re-encoding and Merkle recomputation.
    let _ = block.encode();
    let _ = merkle_root(&block.transactions);
});
