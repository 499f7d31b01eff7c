// Copyright (c) 2026 Zonechain
// Licensed under the Apache License, Version 2.0

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;
use zonechain::core::messages::{Frame, Proposal, ProposalReply, ViewChange, ViewInfo, MAX_PAYLOAD};
use zonechain::core::types::decode_canonical_limited;

// Wire bytes from hostile peers must never panic the demux or the typed
// decoders, and a decodable frame must re-encode to the same bytes.
fuzz_target!(|data: &[u8]| {
    let Ok(frame) = Frame::decode(data) else { return };
    assert_eq!(frame.encode(), data);

    let _ = decode_canonical_limited::<Proposal>(&frame.payload, MAX_PAYLOAD);
    let _ = decode_canonical_limited::<ProposalReply>(&frame.payload, MAX_PAYLOAD);
    let _ = decode_canonical_limited::<ViewChange>(&frame.payload, MAX_PAYLOAD);
    let _ = decode_canonical_limited::<ViewInfo>(&frame.payload, MAX_PAYLOAD);
});
