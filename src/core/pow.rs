// Copyright (c) 2026 Zonechain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Proof-of-work admission control for Add proposals.
//!
//! The search loop is compute-bound and must stay preemptible: the
//! cancellation flag is polled every [`CANCEL_POLL_INTERVAL`] nonces so
//! shutdown never waits on an unbounded burst.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::core::messages::Proposal;
use crate::core::types::{CodecError, H256};

/// Nonces tried between cancellation checks.
const CANCEL_POLL_INTERVAL: u32 = 1024;

/// Admission errors.
#[derive(Debug, Error)]
pub enum PowError {
    /// The cancellation flag fired mid-search.
    #[error("work search cancelled")]
    Cancelled,
    /// The nonce space was exhausted without a hit.
    #[error("nonce space exhausted")]
    Exhausted,
    /// The proposal could not be canonicalised.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Shared flag that aborts an in-flight work search.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Fresh, unfired flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the flag. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether the flag has fired.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Count of leading zero bits in a hash.
pub fn leading_zero_bits(hash: &H256) -> u32 {
    let mut bits = 0u32;
    for byte in hash.as_bytes() {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// Admission predicate: at least `target_bits` leading zero bits.
pub fn meets_target(hash: &H256, target_bits: u8) -> bool {
    leading_zero_bits(hash) >= u32::from(target_bits)
}

/// Search the nonce space until the proposal's work hash meets the target.
/// The nonce is left at the first satisfying value.
pub fn stamp(
    proposal: &mut Proposal,
    target_bits: u8,
    cancel: &CancelFlag,
) -> Result<(), PowError> {
    // The content id is nonce-independent; only the id||nonce digest re-rolls.
    let id = proposal.compute_id()?;
    let mut buf = [0u8; 36];
    buf[..32].copy_from_slice(id.as_bytes());

    proposal.nonce = 0;
    loop {
        if proposal.nonce % CANCEL_POLL_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(PowError::Cancelled);
        }
        buf[32..].copy_from_slice(&proposal.nonce.to_le_bytes());
        if meets_target(&crate::core::types::sha256(&buf), target_bits) {
            return Ok(());
        }
        proposal.nonce = proposal.nonce.checked_add(1).ok_or(PowError::Exhausted)?;
    }
}

/// Validator-side check of a stamped proposal.
pub fn check(proposal: &Proposal, target_bits: u8) -> Result<bool, PowError> {
    Ok(meets_target(&proposal.work_hash()?, target_bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::messages::OperationType;
    use crate::core::types::{CanonicalMap, NodeName};

    fn proposal() -> Proposal {
        Proposal::unsigned(
            NodeName::new("alpha"),
            OperationType::Add,
            "example".to_string(),
            NodeName::new("alpha"),
            CanonicalMap::new(),
        )
    }

    #[test]
    fn leading_zero_bit_counting() {
        assert_eq!(leading_zero_bits(&H256::ZERO), 256);
        let mut b = [0u8; 32];
        b[0] = 0b0000_0001;
        assert_eq!(leading_zero_bits(&H256::from_bytes(b)), 7);
        b[0] = 0b1000_0000;
        assert_eq!(leading_zero_bits(&H256::from_bytes(b)), 0);
        b[0] = 0;
        b[1] = 0b0010_0000;
        assert_eq!(leading_zero_bits(&H256::from_bytes(b)), 10);
    }

    #[test]
    fn stamp_meets_small_target() {
        let mut p = proposal();
        let cancel = CancelFlag::new();
        stamp(&mut p, 8, &cancel).unwrap();
        assert!(check(&p, 8).unwrap());
    }

    #[test]
    fn harder_target_implies_easier_ones() {
        let mut p = proposal();
        stamp(&mut p, 10, &CancelFlag::new()).unwrap();
        for bits in 0..=10 {
            assert!(check(&p, bits).unwrap());
        }
    }

    #[test]
    fn zero_target_accepts_first_nonce() {
        let mut p = proposal();
        stamp(&mut p, 0, &CancelFlag::new()).unwrap();
        assert_eq!(p.nonce, 0);
    }

    #[test]
    fn pre_fired_cancel_stops_search() {
        let mut p = proposal();
        let cancel = CancelFlag::new();
        cancel.cancel();
        // An impossible target would search forever without the flag.
        assert!(matches!(
            stamp(&mut p, 255, &cancel),
            Err(PowError::Cancelled)
        ));
    }
}
