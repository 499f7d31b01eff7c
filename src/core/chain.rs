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

//! Chain service: seals finalised proposals when this node leads, verifies
//! and applies blocks sealed by peers, and raises a view change when a
//! finalised proposal waits too long for a block.
//!
//! Finalisation is local knowledge: a node seals the proposals it finalised
//! itself. A proposer that never gets to seal keeps rotating the view until
//! it leads (or abandons).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::core::block::{transaction_bytes, Block};
use crate::core::messages::{Frame, MessageType, OperationType, Proposal, ViewChangeReason};
use crate::core::pow;
use crate::core::security::authority::Authority;
use crate::core::state::zone_store::{StoreError, ZoneStore};
use crate::core::types::H256;
use crate::core::view::ViewManager;
use crate::monitoring::metrics::Metrics;
use crate::networking::Gossip;

struct ChainState {
    blocks: Vec<Block>,
    next_height: u64,
    last_hash: H256,
    // Locally finalised proposals not yet observed in a block.
    pending: Vec<Proposal>,
    pending_since: Option<Instant>,
}

/// Timing and admission settings for the sealing loop.
#[derive(Clone, Copy, Debug)]
pub struct ChainConfig {
    /// Sweep interval for the leader's sealing tick.
    pub block_interval: Duration,
    /// How long a finalised proposal may wait for a block.
    pub block_overtime: Duration,
    /// Leading-zero-bit target re-checked on claims inside received blocks.
    pub proposal_pow: u8,
}

/// Owns the local copy of the chain and the sealing/application loop.
pub struct Chain {
    authority: Arc<Authority>,
    store: ZoneStore,
    transport: Arc<dyn Gossip>,
    view: Arc<ViewManager>,
    metrics: Arc<Metrics>,
    cfg: ChainConfig,
    state: Mutex<ChainState>,
}

/// Write one committed proposal into the zone store. Relinquished zones keep
/// a record with the dereliction owner so later claims can see the history.
pub fn apply_proposal(store: &ZoneStore, proposal: &Proposal) -> Result<(), StoreError> {
    let bytes = transaction_bytes(proposal).map_err(|_| StoreError::Corrupt)?;
    store.put(&proposal.zone_name, &bytes)
}

impl Chain {
    /// Build the chain service, restoring the previous tip from the store.
    pub fn new(
        authority: Arc<Authority>,
        store: ZoneStore,
        transport: Arc<dyn Gossip>,
        view: Arc<ViewManager>,
        metrics: Arc<Metrics>,
        cfg: ChainConfig,
    ) -> Arc<Self> {
        let (next_height, last_hash) = match store.last_block() {
            Ok(Some((height, bytes))) => match Block::decode(&bytes) {
                Ok(block) => match block.header.hash() {
                    Ok(hash) => (height + 1, hash),
                    Err(_) => (height + 1, H256::ZERO),
                },
                Err(e) => {
                    warn!(err = %e, "stored tip does not decode; starting from genesis");
                    (0, H256::ZERO)
                }
            },
            Ok(None) => (0, H256::ZERO),
            Err(e) => {
                warn!(err = %e, "could not read stored tip; starting from genesis");
                (0, H256::ZERO)
            }
        };
        metrics.block_height.set(next_height as i64);

        Arc::new(Self {
            authority,
            store,
            transport,
            view,
            metrics,
            cfg,
            state: Mutex::new(ChainState {
                blocks: Vec::new(),
                next_height,
                last_hash,
                pending: Vec::new(),
                pending_since: None,
            }),
        })
    }

    /// Height of the next block to be appended.
    pub fn height(&self) -> u64 {
        self.state.lock().expect("chain lock poisoned").next_height
    }

    /// Blocks held in memory this run (diagnostics and tests).
    pub fn block_count(&self) -> usize {
        self.state.lock().expect("chain lock poisoned").blocks.len()
    }

    /// Track a locally finalised proposal; seal immediately when leading.
    pub fn note_finalized(&self, proposal: Proposal) {
        {
            let mut s = self.state.lock().expect("chain lock poisoned");
            if s.pending_since.is_none() {
                s.pending_since = Some(Instant::now());
            }
            s.pending.push(proposal);
        }
        if self.view.local_is_leader() {
            self.seal_pending();
        }
    }

    /// Seal every pending proposal into one block and broadcast it.
    /// No-op when nothing is pending.
    pub fn seal_pending(&self) {
        let (pending, prev) = {
            let mut s = self.state.lock().expect("chain lock poisoned");
            if s.pending.is_empty() {
                return;
            }
            s.pending_since = None;
            (std::mem::take(&mut s.pending), s.last_hash)
        };

        // Sign outside the lock.
        let block = match Block::seal(&self.authority, prev, pending) {
            Ok(b) => b,
            Err(e) => {
                warn!(err = %e, "block sealing failed");
                return;
            }
        };
        let bytes = match block.encode() {
            Ok(b) => b,
            Err(e) => {
                warn!(err = %e, "block encoding failed");
                return;
            }
        };

        if let Err(e) = self.append(block) {
            warn!(err = %e, "could not append own block");
            return;
        }
        self.metrics.blocks_sealed_total.inc();
        info!(height = self.height() - 1, "block sealed");
        self.transport.broadcast(Frame::new(MessageType::Block, bytes));
    }

    /// Verify and apply a block received from the wire.
    pub fn handle_block(&self, payload: &[u8]) {
        let block = match Block::decode(payload) {
            Ok(b) => b,
            Err(e) => {
                debug!(err = %e, "undecodable block; dropping");
                self.metrics.invalid_frames_total.inc();
                return;
            }
        };

        {
            let s = self.state.lock().expect("chain lock poisoned");
            // Signature identity; the newest blocks are the likely repeats.
            if s.blocks.iter().rev().any(|b| b.same_block(&block)) {
                return;
            }
            if block.header.prev_block != s.last_hash {
                warn!(
                    origin = %block.header.origin,
                    "block does not extend the local tip; dropping"
                );
                return;
            }
        }

        let expected = self.view.leader_name();
        if let Err(e) = block.verify(&self.authority, expected.as_ref()) {
            warn!(err = %e, "block rejected");
            self.metrics.invalid_frames_total.inc();
            return;
        }
        for tx in &block.transactions {
            if tx.op == OperationType::Add
                && !pow::check(tx, self.cfg.proposal_pow).unwrap_or(false)
            {
                warn!(id = %tx.id.short(), "block carries an understamped claim; dropping");
                self.metrics.invalid_frames_total.inc();
                return;
            }
        }

        match self.append(block) {
            Ok(()) => {
                self.metrics.blocks_applied_total.inc();
                info!(height = self.height() - 1, "block applied");
            }
            Err(e) => warn!(err = %e, "could not apply block"),
        }
    }

    /// Apply transactions in order, persist the block, advance the tip, and
    /// clear any pending proposals it carried.
    fn append(&self, block: Block) -> Result<(), StoreError> {
        for tx in &block.transactions {
            apply_proposal(&self.store, tx)?;
        }
        let bytes = block.encode().map_err(|_| StoreError::Corrupt)?;
        let hash = block.header.hash().map_err(|_| StoreError::Corrupt)?;

        let mut s = self.state.lock().expect("chain lock poisoned");
        self.store.append_block(s.next_height, &bytes)?;
        s.last_hash = hash;
        s.next_height += 1;
        let sealed: Vec<H256> = block.transactions.iter().map(|t| t.id).collect();
        s.pending.retain(|p| !sealed.contains(&p.id));
        if s.pending.is_empty() {
            s.pending_since = None;
        }
        s.blocks.push(block);
        self.metrics.block_height.set(s.next_height as i64);
        Ok(())
    }

    /// Raise a view change when the oldest pending proposal has waited past
    /// the block deadline. The clock resets so one stall raises one change.
    fn check_overtime(&self) {
        let overdue = {
            let mut s = self.state.lock().expect("chain lock poisoned");
            match s.pending_since {
                Some(since) if since.elapsed() >= self.cfg.block_overtime => {
                    s.pending_since = Some(Instant::now());
                    s.pending.first().map(|p| p.id)
                }
                _ => None,
            }
        };
        if let Some(id) = overdue {
            warn!(id = %id.short(), "finalised proposal missed its block round");
            self.view
                .trigger_view_change(ViewChangeReason::BlockOvertime, Some(id));
        }
    }

    /// Main loop: finalised proposals in, blocks in, sealing tick.
    pub async fn run(
        self: Arc<Self>,
        mut finalized_rx: mpsc::Receiver<Proposal>,
        mut block_rx: mpsc::Receiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(self.cfg.block_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                Some(proposal) = finalized_rx.recv() => self.note_finalized(proposal),
                Some(payload) = block_rx.recv() => self.handle_block(&payload),
                _ = tick.tick() => {
                    if self.view.local_is_leader() {
                        self.seal_pending();
                    }
                    self.check_overtime();
                }
                _ = shutdown.changed() => break,
                else => break,
            }
        }
    }
}
