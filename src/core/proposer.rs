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

//! Proposal origination, dissemination and acknowledgement tallying.
//!
//! One state machine per in-flight proposal id: `Pending` until the first
//! deadline, `Confirming` after the escalation broadcast, then gone - either
//! finalised into the block pipeline or abandoned with a missed-proposal
//! report to the view manager. All tables sit behind one mutex; holds are
//! short and never span signing or transport calls.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::core::messages::{
    Frame, MessageType, OperationType, Order, Proposal, ProposalConfirm, ProposalReply,
    MAX_PAYLOAD,
};
use crate::core::pow::{self, CancelFlag};
use crate::core::security::authority::Authority;
use crate::core::state::zone_store::ZoneStore;
use crate::core::types::{decode_canonical_limited, encode_canonical, H256, NodeName};
use crate::core::view::MissedProposal;
use crate::monitoring::metrics::Metrics;
use crate::networking::Gossip;

/// Rounds an in-flight proposal can be in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Broadcast, first deadline armed.
    Pending,
    /// Escalated; awaiting replies to the confirm round.
    Confirming,
}

#[derive(Default)]
struct Tables {
    proposals: BTreeMap<H256, Proposal>,
    replies: BTreeMap<H256, BTreeSet<NodeName>>,
    phases: BTreeMap<H256, Phase>,
    cancels: BTreeMap<H256, oneshot::Sender<()>>,
}

/// Replication timing and admission settings.
#[derive(Clone, Copy, Debug)]
pub struct ReplicatorConfig {
    /// First-round (and confirm-round) deadline.
    pub proposal_timeout: Duration,
    /// Leading-zero-bit target for Add proposals.
    pub proposal_pow: u8,
}

/// Originates local proposals and tallies acknowledgements; validates and
/// acknowledges proposals from peers.
pub struct Replicator {
    authority: Arc<Authority>,
    store: ZoneStore,
    transport: Arc<dyn Gossip>,
    metrics: Arc<Metrics>,
    cfg: ReplicatorConfig,
    tables: Mutex<Tables>,
    // Replies this node already issued, kept so a confirm round can be
    // answered without re-validating.
    issued: Mutex<BTreeMap<H256, ProposalReply>>,
    finalized_tx: mpsc::Sender<Proposal>,
    missed_tx: mpsc::Sender<MissedProposal>,
    // Timer tasks report expiries back into the main loop through here.
    timeout_tx: mpsc::Sender<H256>,
    timeout_rx: Mutex<Option<mpsc::Receiver<H256>>>,
    stamp_cancel: CancelFlag,
}

impl Replicator {
    /// Build a replicator wired to the block pipeline (`finalized_tx`) and
    /// the view manager (`missed_tx`).
    pub fn new(
        authority: Arc<Authority>,
        store: ZoneStore,
        transport: Arc<dyn Gossip>,
        metrics: Arc<Metrics>,
        cfg: ReplicatorConfig,
        finalized_tx: mpsc::Sender<Proposal>,
        missed_tx: mpsc::Sender<MissedProposal>,
    ) -> Arc<Self> {
        let (timeout_tx, timeout_rx) = mpsc::channel(crate::core::types::CHANNEL_DEPTH);
        Arc::new(Self {
            authority,
            store,
            transport,
            metrics,
            cfg,
            tables: Mutex::new(Tables::default()),
            issued: Mutex::new(BTreeMap::new()),
            finalized_tx,
            missed_tx,
            timeout_tx,
            timeout_rx: Mutex::new(Some(timeout_rx)),
            stamp_cancel: CancelFlag::new(),
        })
    }

    /// Flag that aborts in-flight admission stamping on shutdown.
    pub fn stamp_cancel(&self) -> CancelFlag {
        self.stamp_cancel.clone()
    }

    /// Ids currently in flight (diagnostics and tests).
    pub fn in_flight(&self) -> Vec<H256> {
        self.tables
            .lock()
            .expect("replicator lock poisoned")
            .proposals
            .keys()
            .copied()
            .collect()
    }

    /// Build, admit and disseminate a proposal for a local client order.
    pub async fn handle_order(&self, raw: &[u8]) {
        let order: Order = match serde_json::from_slice(raw) {
            Ok(o) => o,
            Err(e) => {
                debug!(err = %e, "undecodable order; dropping");
                return;
            }
        };
        let Some(proposal) = self.build_proposal(order).await else {
            return;
        };

        let payload = match encode_canonical(&proposal) {
            Ok(p) => p,
            Err(e) => {
                warn!(err = %e, "could not encode proposal");
                return;
            }
        };

        let id = proposal.id;
        {
            let mut t = self.tables.lock().expect("replicator lock poisoned");
            t.proposals.insert(id, proposal);
            t.replies.insert(id, BTreeSet::new());
            t.phases.insert(id, Phase::Pending);
        }
        self.arm_timer(id, self.cfg.proposal_timeout);

        info!(id = %id.short(), "proposal broadcast");
        self.transport
            .broadcast(Frame::new(MessageType::Proposal, payload));
    }

    async fn build_proposal(&self, order: Order) -> Option<Proposal> {
        let local = self.authority.local_name().clone();
        let mut proposal = match order.opt_type {
            OperationType::Add => Proposal::unsigned(
                local.clone(),
                OperationType::Add,
                order.zone_name,
                local,
                order.values,
            ),
            OperationType::Del => {
                // A zone can only be relinquished while someone live owns it.
                match self.store.live_owner(&order.zone_name) {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        warn!(zone = %order.zone_name, "relinquish of unowned zone; order rejected");
                        return None;
                    }
                    Err(e) => {
                        warn!(err = %e, "zone lookup failed; order rejected");
                        return None;
                    }
                }
                Proposal::unsigned(
                    local,
                    OperationType::Del,
                    order.zone_name,
                    NodeName::dereliction(),
                    order.values,
                )
            }
            OperationType::Mod => {
                let existing = match self.store.live_owner(&order.zone_name) {
                    Ok(owner) => owner,
                    Err(e) => {
                        warn!(err = %e, "zone lookup failed; order rejected");
                        return None;
                    }
                };
                match existing {
                    Some(owner) if owner == local => {}
                    Some(_) | None => {
                        warn!(zone = %order.zone_name, "modify of zone not owned here; order rejected");
                        return None;
                    }
                }
                // New values overlay the existing record.
                let mut values = match self.store.current_values(&order.zone_name) {
                    Ok(Some(v)) => v,
                    _ => Default::default(),
                };
                values.extend(order.values);
                Proposal::unsigned(local.clone(), OperationType::Mod, order.zone_name, local, values)
            }
        };

        if proposal.op == OperationType::Add {
            let target = self.cfg.proposal_pow;
            let cancel = self.stamp_cancel.clone();
            let stamped = tokio::task::spawn_blocking(move || {
                pow::stamp(&mut proposal, target, &cancel).map(|_| proposal)
            })
            .await;
            proposal = match stamped {
                Ok(Ok(p)) => p,
                Ok(Err(e)) => {
                    debug!(err = %e, "admission stamping aborted; order dropped");
                    return None;
                }
                Err(e) => {
                    warn!(err = %e, "stamping task failed; order dropped");
                    return None;
                }
            };
        }

        if let Err(e) = proposal.seal(&self.authority) {
            warn!(err = %e, "could not seal proposal");
            return None;
        }
        Some(proposal)
    }

    /// Count a signed acknowledgement. Finalises on quorum.
    pub fn handle_reply(&self, payload: &[u8]) {
        let reply: ProposalReply = match decode_canonical_limited(payload, MAX_PAYLOAD) {
            Ok(r) => r,
            Err(e) => {
                debug!(err = %e, "undecodable reply; dropping");
                self.metrics.invalid_frames_total.inc();
                return;
            }
        };
        if !reply.verify(&self.authority) {
            warn!(from = %reply.from, "reply signature invalid; dropping");
            self.metrics.invalid_frames_total.inc();
            return;
        }

        let finalized = {
            let mut t = self.tables.lock().expect("replicator lock poisoned");
            if !t.proposals.contains_key(&reply.proposal_id) {
                debug!(id = %reply.proposal_id.short(), "reply for unknown proposal; dropping");
                return;
            }
            let voters = t.replies.entry(reply.proposal_id).or_default();
            if !voters.insert(reply.from.clone()) {
                return; // already counted
            }
            if self.authority.quorum_reached(voters.len()) {
                Self::remove_locked(&mut t, &reply.proposal_id)
            } else {
                None
            }
        };

        if let Some((proposal, cancel)) = finalized {
            self.finalize(proposal, cancel);
        }
    }

    /// Validate a peer's proposal and acknowledge it point-to-point.
    pub fn handle_proposal(&self, payload: &[u8]) {
        let proposal: Proposal = match decode_canonical_limited(payload, MAX_PAYLOAD) {
            Ok(p) => p,
            Err(e) => {
                debug!(err = %e, "undecodable proposal; dropping");
                self.metrics.invalid_frames_total.inc();
                return;
            }
        };
        if !proposal.verify(&self.authority) {
            warn!(from = %proposal.from, "proposal signature invalid; dropping");
            self.metrics.invalid_frames_total.inc();
            return;
        }
        if !self.admit(&proposal) {
            return;
        }

        let reply = match ProposalReply::new(&self.authority, proposal.id) {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "could not sign reply");
                return;
            }
        };
        self.issued
            .lock()
            .expect("replicator lock poisoned")
            .insert(proposal.id, reply.clone());
        self.send_reply(&reply, &proposal.from);
    }

    /// Re-acknowledge a proposal the proposer is confirming. Unknown ids are
    /// dropped; only proposals this node already validated are answered.
    pub fn handle_confirm(&self, payload: &[u8]) {
        let confirm: ProposalConfirm = match decode_canonical_limited(payload, MAX_PAYLOAD) {
            Ok(c) => c,
            Err(e) => {
                debug!(err = %e, "undecodable confirm; dropping");
                self.metrics.invalid_frames_total.inc();
                return;
            }
        };
        if !confirm.verify(&self.authority) {
            warn!(from = %confirm.from, "confirm signature invalid; dropping");
            self.metrics.invalid_frames_total.inc();
            return;
        }
        let issued = self
            .issued
            .lock()
            .expect("replicator lock poisoned")
            .get(&confirm.proposal_hash)
            .cloned();
        match issued {
            Some(reply) => self.send_reply(&reply, &confirm.from),
            None => debug!(
                id = %confirm.proposal_hash.short(),
                "confirm for proposal this node never validated; dropping"
            ),
        }
    }

    /// Admission rules for proposals from the wire.
    fn admit(&self, proposal: &Proposal) -> bool {
        match proposal.op {
            OperationType::Add => match pow::check(proposal, self.cfg.proposal_pow) {
                Ok(true) => true,
                Ok(false) => {
                    warn!(id = %proposal.id.short(), "proposal misses the work target; dropping");
                    false
                }
                Err(e) => {
                    warn!(err = %e, "work check failed; dropping");
                    false
                }
            },
            OperationType::Mod => match self.store.live_owner(&proposal.zone_name) {
                Ok(Some(owner)) if owner == proposal.from => true,
                Ok(_) => {
                    debug!(zone = %proposal.zone_name, "modify without live ownership; dropping");
                    false
                }
                Err(e) => {
                    warn!(err = %e, "zone lookup failed; dropping");
                    false
                }
            },
            OperationType::Del => match self.store.live_owner(&proposal.zone_name) {
                Ok(Some(_)) => proposal.owner.is_dereliction(),
                Ok(None) => {
                    debug!(zone = %proposal.zone_name, "relinquish of unowned zone; dropping");
                    false
                }
                Err(e) => {
                    warn!(err = %e, "zone lookup failed; dropping");
                    false
                }
            },
        }
    }

    fn send_reply(&self, reply: &ProposalReply, to: &NodeName) {
        match encode_canonical(reply) {
            Ok(payload) => self
                .transport
                .send_to(Frame::new(MessageType::ProposalResult, payload), to),
            Err(e) => warn!(err = %e, "could not encode reply"),
        }
    }

    /// Pull a row out of the tables. Caller settles the timer and downstream.
    fn remove_locked(
        t: &mut Tables,
        id: &H256,
    ) -> Option<(Proposal, Option<oneshot::Sender<()>>)> {
        let proposal = t.proposals.remove(id)?;
        t.replies.remove(id);
        t.phases.remove(id);
        let cancel = t.cancels.remove(id);
        Some((proposal, cancel))
    }

    fn finalize(&self, proposal: Proposal, cancel: Option<oneshot::Sender<()>>) {
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }
        info!(id = %proposal.id.short(), zone = %proposal.zone_name, "proposal finalised");
        self.metrics.proposals_finalized_total.inc();
        if self.finalized_tx.try_send(proposal).is_err() {
            warn!("block pipeline full; finalised proposal dropped");
        }
    }

    fn arm_timer(&self, id: H256, after: Duration) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut t = self.tables.lock().expect("replicator lock poisoned");
            if !t.proposals.contains_key(&id) {
                return; // finalised while the lock was free
            }
            t.cancels.insert(id, cancel_tx);
        }
        let timeout_tx = self.timeout_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {
                    if timeout_tx.try_send(id).is_err() {
                        warn!(id = %id.short(), "timeout queue full; expiry dropped");
                    }
                }
                _ = cancel_rx => {}
            }
        });
    }

    /// Deadline handling: finalise a race winner, escalate a pending round,
    /// abandon a confirm round.
    pub fn on_timeout(&self, id: H256) {
        enum Outcome {
            Gone,
            Finalise(Proposal, Option<oneshot::Sender<()>>),
            Escalate,
            Abandon(Proposal),
        }

        let outcome = {
            let mut t = self.tables.lock().expect("replicator lock poisoned");
            match t.phases.get(&id).copied() {
                None => Outcome::Gone,
                Some(phase) => {
                    let count = t.replies.get(&id).map(|r| r.len()).unwrap_or(0);
                    if self.authority.quorum_reached(count) {
                        match Self::remove_locked(&mut t, &id) {
                            Some((p, c)) => Outcome::Finalise(p, c),
                            None => Outcome::Gone,
                        }
                    } else if phase == Phase::Pending {
                        t.phases.insert(id, Phase::Confirming);
                        t.cancels.remove(&id);
                        Outcome::Escalate
                    } else {
                        match Self::remove_locked(&mut t, &id) {
                            Some((p, _)) => Outcome::Abandon(p),
                            None => Outcome::Gone,
                        }
                    }
                }
            }
        };

        match outcome {
            Outcome::Gone => {}
            Outcome::Finalise(proposal, cancel) => self.finalize(proposal, cancel),
            Outcome::Escalate => {
                self.metrics.confirm_rounds_total.inc();
                let confirm = match ProposalConfirm::new(&self.authority, id) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(err = %e, "could not sign confirm");
                        return;
                    }
                };
                match encode_canonical(&confirm) {
                    Ok(payload) => {
                        info!(id = %id.short(), "quorum missed; confirm round started");
                        self.transport
                            .broadcast(Frame::new(MessageType::Commit, payload));
                    }
                    Err(e) => {
                        warn!(err = %e, "could not encode confirm");
                        return;
                    }
                }
                self.arm_timer(id, self.cfg.proposal_timeout);
            }
            Outcome::Abandon(proposal) => {
                warn!(id = %id.short(), zone = %proposal.zone_name, "proposal abandoned");
                self.metrics.proposals_abandoned_total.inc();
                if self
                    .missed_tx
                    .try_send(MissedProposal {
                        proposal_id: proposal.id,
                    })
                    .is_err()
                {
                    warn!("view manager queue full; missed-proposal report dropped");
                }
            }
        }
    }

    /// Main loop: orders and replies run to completion, one at a time;
    /// inbound proposals and confirms interleave on the same task.
    pub async fn run(
        self: Arc<Self>,
        mut order_rx: mpsc::Receiver<Vec<u8>>,
        mut reply_rx: mpsc::Receiver<Vec<u8>>,
        mut proposal_rx: mpsc::Receiver<Vec<u8>>,
        mut confirm_rx: mpsc::Receiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut timeout_rx = self
            .timeout_rx
            .lock()
            .expect("replicator lock poisoned")
            .take()
            .expect("replicator main loop started twice");
        loop {
            tokio::select! {
                Some(raw) = order_rx.recv() => self.handle_order(&raw).await,
                Some(payload) = reply_rx.recv() => self.handle_reply(&payload),
                Some(payload) = proposal_rx.recv() => self.handle_proposal(&payload),
                Some(payload) = confirm_rx.recv() => self.handle_confirm(&payload),
                Some(id) = timeout_rx.recv() => self.on_timeout(id),
                _ = shutdown.changed() => {
                    self.stamp_cancel.cancel();
                    let mut t = self.tables.lock().expect("replicator lock poisoned");
                    for (_, cancel) in std::mem::take(&mut t.cancels) {
                        let _ = cancel.send(());
                    }
                    break;
                }
                else => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::CanonicalMap;
    use crate::networking::memory::MemoryHub;
    use crate::networking::Router;

    struct Harness {
        replicators: Vec<Arc<Replicator>>,
        authorities: Vec<Arc<Authority>>,
        finalized_rx: Vec<mpsc::Receiver<Proposal>>,
        missed_rx: Vec<mpsc::Receiver<MissedProposal>>,
        reply_rx: Vec<mpsc::Receiver<Vec<u8>>>,
        proposal_rx: Vec<mpsc::Receiver<Vec<u8>>>,
    }

    fn harness(names: &[&str], proposal_pow: u8) -> Harness {
        let hub = MemoryHub::new();
        let authorities: Vec<Arc<Authority>> = Authority::generate_network(names)
            .unwrap()
            .into_iter()
            .map(Arc::new)
            .collect();
        let mut replicators = Vec::new();
        let mut finalized_rx = Vec::new();
        let mut missed_rx = Vec::new();
        let mut reply_rx = Vec::new();
        let mut proposal_rx = Vec::new();
        for auth in &authorities {
            let mut router = Router::new();
            reply_rx.push(router.register(MessageType::ProposalResult));
            proposal_rx.push(router.register(MessageType::Proposal));
            let transport =
                Arc::new(hub.attach(auth.local_name().clone(), Arc::new(router)));
            let (f_tx, f_rx) = mpsc::channel(16);
            let (m_tx, m_rx) = mpsc::channel(16);
            replicators.push(Replicator::new(
                auth.clone(),
                ZoneStore::open_temporary().unwrap(),
                transport,
                Arc::new(Metrics::new().unwrap()),
                ReplicatorConfig {
                    proposal_timeout: Duration::from_millis(200),
                    proposal_pow,
                },
                f_tx,
                m_tx,
            ));
            finalized_rx.push(f_rx);
            missed_rx.push(m_rx);
        }
        Harness {
            replicators,
            authorities,
            finalized_rx,
            missed_rx,
            reply_rx,
            proposal_rx,
        }
    }

    fn add_order(zone: &str) -> Vec<u8> {
        let mut values = CanonicalMap::new();
        values.insert("ip".to_string(), "1.1.1.1".to_string());
        serde_json::to_vec(&Order {
            opt_type: OperationType::Add,
            zone_name: zone.to_string(),
            values,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn order_becomes_inflight_proposal() {
        let mut h = harness(&["a", "b", "c", "d"], 4);
        let alice = h.replicators[0].clone();
        alice.handle_order(&add_order("x")).await;
        assert_eq!(alice.in_flight().len(), 1);
        // every peer (self included) saw the proposal frame
        for rx in h.proposal_rx.iter_mut() {
            assert!(rx.try_recv().is_ok());
        }
    }

    #[tokio::test]
    async fn quorum_of_replies_finalises() {
        let mut h = harness(&["a", "b", "c", "d"], 0);
        let alice = h.replicators[0].clone();
        alice.handle_order(&add_order("x")).await;
        let id = alice.in_flight()[0];

        // three distinct ack'ers reach 2f+1 = 3
        for i in 0..3 {
            let reply = ProposalReply::new(&h.authorities[i], id).unwrap();
            alice.handle_reply(&encode_canonical(&reply).unwrap());
        }
        assert!(alice.in_flight().is_empty());
        let finalised = h.finalized_rx[0].try_recv().unwrap();
        assert_eq!(finalised.id, id);
    }

    #[tokio::test]
    async fn duplicate_and_late_replies_are_noops() {
        let mut h = harness(&["a", "b", "c", "d"], 0);
        let alice = h.replicators[0].clone();
        alice.handle_order(&add_order("x")).await;
        let id = alice.in_flight()[0];

        let bob = ProposalReply::new(&h.authorities[1], id).unwrap();
        let bob_bytes = encode_canonical(&bob).unwrap();
        alice.handle_reply(&bob_bytes);
        alice.handle_reply(&bob_bytes); // duplicate identity: no double count
        assert_eq!(alice.in_flight().len(), 1);

        for i in [0usize, 2] {
            let reply = ProposalReply::new(&h.authorities[i], id).unwrap();
            alice.handle_reply(&encode_canonical(&reply).unwrap());
        }
        assert!(alice.in_flight().is_empty());

        // late reply after finalisation: dropped without error
        let dave = ProposalReply::new(&h.authorities[3], id).unwrap();
        alice.handle_reply(&encode_canonical(&dave).unwrap());
        assert_eq!(h.finalized_rx[0].try_recv().unwrap().id, id);
        assert!(h.finalized_rx[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn reply_for_unknown_proposal_is_dropped() {
        let h = harness(&["a", "b", "c", "d"], 0);
        let alice = h.replicators[0].clone();
        let reply = ProposalReply::new(&h.authorities[1], H256::from_bytes([9; 32])).unwrap();
        alice.handle_reply(&encode_canonical(&reply).unwrap());
        assert!(alice.in_flight().is_empty());
    }

    #[tokio::test]
    async fn peers_acknowledge_valid_proposals() {
        let mut h = harness(&["a", "b"], 4);
        let alice = h.replicators[0].clone();
        alice.handle_order(&add_order("x")).await;

        // bob validates the broadcast proposal and acks to alice
        let payload = h.proposal_rx[1].try_recv().unwrap();
        h.replicators[1].handle_proposal(&payload);

        let reply_bytes = h.reply_rx[0].try_recv().unwrap();
        let reply: ProposalReply =
            decode_canonical_limited(&reply_bytes, MAX_PAYLOAD).unwrap();
        assert_eq!(&reply.from, h.authorities[1].local_name());
        assert!(reply.verify(&h.authorities[0]));
    }

    #[tokio::test]
    async fn understamped_proposal_is_not_acknowledged() {
        let mut h = harness(&["a", "b"], 20);
        // hand-build a proposal with no work attached
        let mut p = Proposal::unsigned(
            h.authorities[0].local_name().clone(),
            OperationType::Add,
            "x".to_string(),
            h.authorities[0].local_name().clone(),
            CanonicalMap::new(),
        );
        p.seal(&h.authorities[0]).unwrap();
        if pow::check(&p, 20).unwrap() {
            return; // freak hash; nothing to assert
        }
        h.replicators[1].handle_proposal(&encode_canonical(&p).unwrap());
        assert!(h.reply_rx[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn modify_of_missing_zone_is_rejected_locally() {
        let h = harness(&["a", "b", "c", "d"], 0);
        let alice = h.replicators[0].clone();
        let order = serde_json::to_vec(&Order {
            opt_type: OperationType::Mod,
            zone_name: "ghost".to_string(),
            values: CanonicalMap::new(),
        })
        .unwrap();
        alice.handle_order(&order).await;
        assert!(alice.in_flight().is_empty());
    }

    #[tokio::test]
    async fn confirm_is_answered_from_the_issued_cache() {
        let mut h = harness(&["a", "b"], 0);
        let alice = h.replicators[0].clone();
        alice.handle_order(&add_order("x")).await;
        let payload = h.proposal_rx[1].try_recv().unwrap();
        h.replicators[1].handle_proposal(&payload);
        let first = h.reply_rx[0].try_recv().unwrap();

        let id = decode_canonical_limited::<Proposal>(&payload, MAX_PAYLOAD)
            .unwrap()
            .id;
        let confirm = ProposalConfirm::new(&h.authorities[0], id).unwrap();
        h.replicators[1].handle_confirm(&encode_canonical(&confirm).unwrap());
        let second = h.reply_rx[0].try_recv().unwrap();
        assert_eq!(first, second);

        // confirm for something bob never saw: silence
        let unknown = ProposalConfirm::new(&h.authorities[0], H256::from_bytes([1; 32])).unwrap();
        h.replicators[1].handle_confirm(&encode_canonical(&unknown).unwrap());
        assert!(h.reply_rx[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn first_timeout_escalates_second_abandons() {
        let mut h = harness(&["a", "b", "c", "d"], 0);
        let alice = h.replicators[0].clone();
        alice.handle_order(&add_order("x")).await;
        let id = alice.in_flight()[0];

        // only one ack: under quorum at the deadline
        let bob = ProposalReply::new(&h.authorities[1], id).unwrap();
        alice.handle_reply(&encode_canonical(&bob).unwrap());

        alice.on_timeout(id);
        assert_eq!(alice.in_flight().len(), 1); // confirming, still tracked

        // late acks arriving during the confirm round finalise as usual
        let carol = ProposalReply::new(&h.authorities[2], id).unwrap();
        alice.handle_reply(&encode_canonical(&carol).unwrap());
        let dave = ProposalReply::new(&h.authorities[3], id).unwrap();
        alice.handle_reply(&encode_canonical(&dave).unwrap());
        assert!(alice.in_flight().is_empty());
        assert_eq!(h.finalized_rx[0].try_recv().unwrap().id, id);
    }

    #[tokio::test]
    async fn confirm_round_expiry_reports_the_miss() {
        let mut h = harness(&["a", "b", "c", "d"], 0);
        let alice = h.replicators[0].clone();
        alice.handle_order(&add_order("x")).await;
        let id = alice.in_flight()[0];

        alice.on_timeout(id); // escalate
        alice.on_timeout(id); // abandon
        assert!(alice.in_flight().is_empty());
        let missed = h.missed_rx[0].try_recv().unwrap();
        assert_eq!(missed.proposal_id, id);
        assert!(h.finalized_rx[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn timeout_finalises_a_quorum_race_winner() {
        let mut h = harness(&["a", "b", "c", "d"], 0);
        let alice = h.replicators[0].clone();
        alice.handle_order(&add_order("x")).await;
        let id = alice.in_flight()[0];
        for i in 0..3 {
            let reply = ProposalReply::new(&h.authorities[i], id).unwrap();
            // tally without triggering the handler's own finalisation
            let mut t = alice.tables.lock().unwrap();
            t.replies.entry(id).or_default().insert(reply.from.clone());
        }
        alice.on_timeout(id);
        assert!(alice.in_flight().is_empty());
        assert_eq!(h.finalized_rx[0].try_recv().unwrap().id, id);
    }
}
