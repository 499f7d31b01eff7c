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

//! View management: the (term, leader) tuple every honest node agrees on.
//!
//! A node boots in `Start` with no view, retrieves the current view from its
//! peers, and thereafter rotates the leader deterministically whenever a
//! quorum of members demands a change. Term ids never decrease; at most one
//! rotation commits per term.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::core::messages::{
    Frame, MessageType, RetrieveLeader, ViewChange, ViewChangeReason, ViewChangeResult, ViewInfo,
    MAX_PAYLOAD,
};
use crate::core::security::authority::Authority;
use crate::core::types::{decode_canonical_limited, encode_canonical, H256, NodeName};
use crate::monitoring::metrics::Metrics;
use crate::networking::Gossip;

/// Node's position in the view lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewState {
    /// Booted, no view adopted yet.
    Start,
    /// A view is live.
    Ready,
    /// A change round is in flight.
    OnChange,
}

/// Emitted by the replicator when a quorum-acknowledged proposal never made
/// it into a block.
#[derive(Clone, Copy, Debug)]
pub struct MissedProposal {
    /// The proposal that was acknowledged but never sealed.
    pub proposal_id: H256,
}

#[derive(Debug)]
struct ViewTables {
    term_id: i64,
    leader_id: i64,
    state: ViewState,
    // term -> distinct demanders
    change_tally: BTreeMap<i64, BTreeSet<NodeName>>,
    // term -> responder -> leader they reported
    retrieve_tally: BTreeMap<i64, BTreeMap<NodeName, i64>>,
    // term -> leader -> responder count
    retrieve_counts: BTreeMap<i64, BTreeMap<i64, usize>>,
}

/// Tracks and transitions the local view.
pub struct ViewManager {
    authority: Arc<Authority>,
    transport: Arc<dyn Gossip>,
    metrics: Arc<Metrics>,
    tables: Mutex<ViewTables>,
}

impl ViewManager {
    /// Fresh manager in `Start` with no view.
    pub fn new(
        authority: Arc<Authority>,
        transport: Arc<dyn Gossip>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            authority,
            transport,
            metrics,
            tables: Mutex::new(ViewTables {
                term_id: -1,
                leader_id: -1,
                state: ViewState::Start,
                change_tally: BTreeMap::new(),
                retrieve_tally: BTreeMap::new(),
                retrieve_counts: BTreeMap::new(),
            }),
        }
    }

    /// Current `(term, leader, state)` snapshot.
    pub fn status(&self) -> (i64, i64, ViewState) {
        let t = self.tables.lock().expect("view lock poisoned");
        (t.term_id, t.leader_id, t.state)
    }

    /// Name of the current leader, when a view is live.
    pub fn leader_name(&self) -> Option<NodeName> {
        let (_, leader_id, state) = self.status();
        if state == ViewState::Start {
            return None;
        }
        self.authority.name_at(leader_id).cloned()
    }

    /// Whether this node seals blocks in the current view.
    pub fn local_is_leader(&self) -> bool {
        self.leader_name()
            .is_some_and(|name| &name == self.authority.local_name())
    }

    /// Broadcast the startup view request.
    pub fn start_retrieval(&self) {
        let req = RetrieveLeader {
            from: self.authority.local_name().clone(),
        };
        match encode_canonical(&req) {
            Ok(payload) => {
                info!("retrieving current view from peers");
                self.transport
                    .broadcast(Frame::new(MessageType::RetrieveLeader, payload));
            }
            Err(e) => warn!(err = %e, "could not encode view retrieval"),
        }
    }

    /// Answer a peer's retrieval request with the signed local view.
    pub fn handle_retrieve_request(&self, payload: &[u8]) {
        let req: RetrieveLeader = match decode_canonical_limited(payload, MAX_PAYLOAD) {
            Ok(r) => r,
            Err(e) => {
                debug!(err = %e, "undecodable view retrieval; dropping");
                return;
            }
        };
        if !self.authority.exists(&req.from) {
            warn!(from = %req.from, "view retrieval from unknown identity; dropping");
            return;
        }
        let (term_id, leader_id, _) = self.status();
        // Sign outside the table lock.
        let info = match ViewInfo::new(&self.authority, term_id, leader_id) {
            Ok(info) => info,
            Err(e) => {
                warn!(err = %e, "could not sign view info");
                return;
            }
        };
        match encode_canonical(&info) {
            Ok(payload) => self.transport.send_to(
                Frame::new(MessageType::RetrieveLeaderResponse, payload),
                &req.from,
            ),
            Err(e) => warn!(err = %e, "could not encode view info"),
        }
    }

    /// Tally a signed retrieval response; adopt the first `(term, leader)`
    /// pair confirmed by a quorum.
    pub fn handle_retrieve_response(&self, payload: &[u8]) {
        let info: ViewInfo = match decode_canonical_limited(payload, MAX_PAYLOAD) {
            Ok(i) => i,
            Err(e) => {
                debug!(err = %e, "undecodable view info; dropping");
                return;
            }
        };
        if !self.authority.exists(&info.from) {
            warn!(from = %info.from, "view info from unknown identity; dropping");
            return;
        }
        if !info.verify(&self.authority) {
            warn!(from = %info.from, "view info signature invalid; dropping");
            return;
        }

        let mut t = self.tables.lock().expect("view lock poisoned");
        if info.term_id < t.term_id {
            debug!(term = info.term_id, local = t.term_id, "stale view info; dropping");
            return;
        }

        let seen = t.retrieve_tally.entry(info.term_id).or_default();
        if seen.contains_key(&info.from) {
            return;
        }
        seen.insert(info.from.clone(), info.leader_id);
        let count = {
            let counts = t
                .retrieve_counts
                .entry(info.term_id)
                .or_default()
                .entry(info.leader_id)
                .or_insert(0);
            *counts += 1;
            *counts
        };

        if self.authority.quorum_reached(count) {
            // A fresh network answers with the boot view; adopt the genesis
            // view (term 0, first roster member) instead of staying leaderless.
            let (term_id, leader_id) = if info.term_id < 0 || info.leader_id < 0 {
                (0, 0)
            } else {
                (info.term_id, info.leader_id)
            };
            t.term_id = term_id;
            t.leader_id = leader_id;
            t.state = ViewState::Ready;
            t.retrieve_tally.clear();
            t.retrieve_counts.clear();
            info!(term = term_id, leader = leader_id, "view adopted from retrieval");
        }
    }

    /// Broadcast a view-change demand for the current term.
    pub fn trigger_view_change(&self, reason: ViewChangeReason, proposal_id: Option<H256>) {
        let (term_id, leader_id) = {
            let mut t = self.tables.lock().expect("view lock poisoned");
            if t.state == ViewState::Start {
                debug!("no live view; change request suppressed");
                return;
            }
            t.state = ViewState::OnChange;
            (t.term_id, t.leader_id)
        };

        let msg = match ViewChange::new(&self.authority, reason, term_id, leader_id, proposal_id) {
            Ok(m) => m,
            Err(e) => {
                warn!(err = %e, "could not sign view change");
                return;
            }
        };
        match encode_canonical(&msg) {
            Ok(payload) => {
                info!(term = term_id, ?reason, "requesting view change");
                self.transport
                    .broadcast(Frame::new(MessageType::ViewChange, payload));
            }
            Err(e) => warn!(err = %e, "could not encode view change"),
        }
    }

    /// Tally a view-change demand; rotate on quorum.
    pub fn handle_view_change(&self, payload: &[u8]) {
        let msg: ViewChange = match decode_canonical_limited(payload, MAX_PAYLOAD) {
            Ok(m) => m,
            Err(e) => {
                debug!(err = %e, "undecodable view change; dropping");
                return;
            }
        };
        if !self.authority.exists(&msg.from) {
            warn!(from = %msg.from, "view change from unknown identity; dropping");
            return;
        }
        if !msg.verify(&self.authority) {
            warn!(from = %msg.from, "view change signature invalid; dropping");
            return;
        }

        let committed = {
            let mut t = self.tables.lock().expect("view lock poisoned");
            if msg.term_id != t.term_id {
                debug!(term = msg.term_id, local = t.term_id, "out-of-term view change; dropping");
                return;
            }
            let tally = t.change_tally.entry(msg.term_id).or_default();
            tally.insert(msg.from.clone());
            if !self.authority.quorum_reached(tally.len()) {
                return;
            }
            let n = self.authority.network_size() as i64;
            t.leader_id = (t.leader_id + 1).rem_euclid(n);
            t.term_id += 1;
            t.state = ViewState::Ready;
            t.change_tally.remove(&msg.term_id);
            (t.term_id, t.leader_id)
        };

        self.metrics.view_changes_total.inc();
        info!(term = committed.0, leader = committed.1, "view change committed");

        let result = match ViewChangeResult::new(&self.authority, committed.0, committed.1) {
            Ok(r) => r,
            Err(e) => {
                warn!(err = %e, "could not sign view change result");
                return;
            }
        };
        match encode_canonical(&result) {
            Ok(payload) => self
                .transport
                .broadcast(Frame::new(MessageType::ViewChangeResult, payload)),
            Err(e) => warn!(err = %e, "could not encode view change result"),
        }
    }

    /// Adopt a committed view announced by a peer that got there first.
    pub fn handle_view_change_result(&self, payload: &[u8]) {
        let msg: ViewChangeResult = match decode_canonical_limited(payload, MAX_PAYLOAD) {
            Ok(m) => m,
            Err(e) => {
                debug!(err = %e, "undecodable view change result; dropping");
                return;
            }
        };
        if !self.authority.exists(&msg.from) || !msg.verify(&self.authority) {
            warn!(from = %msg.from, "invalid view change result; dropping");
            return;
        }
        let n = self.authority.network_size() as i64;
        if msg.leader_id < 0 || msg.leader_id >= n {
            warn!(leader = msg.leader_id, "view change result names no member; dropping");
            return;
        }
        let mut t = self.tables.lock().expect("view lock poisoned");
        if msg.term_id > t.term_id {
            t.term_id = msg.term_id;
            t.leader_id = msg.leader_id;
            t.state = ViewState::Ready;
            info!(term = msg.term_id, leader = msg.leader_id, "view adopted from peer result");
        }
    }

    /// Consumer loop for change demands, change results and missed-proposal
    /// reports from the replicator.
    pub async fn run_change_loop(
        self: Arc<Self>,
        mut change_rx: mpsc::Receiver<Vec<u8>>,
        mut result_rx: mpsc::Receiver<Vec<u8>>,
        mut missed_rx: mpsc::Receiver<MissedProposal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                Some(payload) = change_rx.recv() => self.handle_view_change(&payload),
                Some(payload) = result_rx.recv() => self.handle_view_change_result(&payload),
                Some(missed) = missed_rx.recv() => {
                    warn!(id = %missed.proposal_id.short(), "acknowledged proposal missed its block");
                    self.trigger_view_change(
                        ViewChangeReason::ProposalMissed,
                        Some(missed.proposal_id),
                    );
                }
                _ = shutdown.changed() => break,
                else => break,
            }
        }
    }

    /// Consumer loop for retrieval requests and responses.
    pub async fn run_retrieve_loop(
        self: Arc<Self>,
        mut request_rx: mpsc::Receiver<Vec<u8>>,
        mut response_rx: mpsc::Receiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                Some(payload) = request_rx.recv() => self.handle_retrieve_request(&payload),
                Some(payload) = response_rx.recv() => self.handle_retrieve_response(&payload),
                _ = shutdown.changed() => break,
                else => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::memory::MemoryHub;
    use crate::networking::Router;

    fn build(names: &[&str]) -> (Vec<Arc<ViewManager>>, Vec<Arc<Authority>>, MemoryHub) {
        let hub = MemoryHub::new();
        let auths: Vec<Arc<Authority>> = Authority::generate_network(names)
            .unwrap()
            .into_iter()
            .map(Arc::new)
            .collect();
        let metrics = Arc::new(Metrics::new().unwrap());
        let managers = auths
            .iter()
            .map(|a| {
                let transport =
                    Arc::new(hub.attach(a.local_name().clone(), Arc::new(Router::new())));
                Arc::new(ViewManager::new(a.clone(), transport, metrics.clone()))
            })
            .collect();
        (managers, auths, hub)
    }

    fn force_view(manager: &ViewManager, term: i64, leader: i64) {
        let mut t = manager.tables.lock().unwrap();
        t.term_id = term;
        t.leader_id = leader;
        t.state = ViewState::Ready;
    }

    #[test]
    fn retrieval_adopts_quorum_view() {
        let (managers, auths, _hub) = build(&["a", "b", "c", "d"]);
        let eve = &managers[0];

        // three peers report (5, 2)
        for auth in auths.iter().take(3) {
            let info = ViewInfo::new(auth, 5, 2).unwrap();
            eve.handle_retrieve_response(&encode_canonical(&info).unwrap());
        }
        assert_eq!(eve.status(), (5, 2, ViewState::Ready));
    }

    #[test]
    fn retrieval_rejects_stale_and_unknown() {
        let (managers, auths, _hub) = build(&["a", "b", "c", "d"]);
        let m = &managers[0];
        force_view(m, 10, 1);

        // stale term
        let stale = ViewInfo::new(&auths[1], 4, 0).unwrap();
        m.handle_retrieve_response(&encode_canonical(&stale).unwrap());
        assert_eq!(m.status(), (10, 1, ViewState::Ready));

        // tampered signature
        let mut forged = ViewInfo::new(&auths[1], 11, 0).unwrap();
        forged.leader_id = 2;
        m.handle_retrieve_response(&encode_canonical(&forged).unwrap());
        assert_eq!(m.status(), (10, 1, ViewState::Ready));
    }

    #[test]
    fn fresh_network_adopts_genesis_view() {
        let (managers, auths, _hub) = build(&["a", "b", "c", "d"]);
        let m = &managers[0];
        for auth in auths.iter().take(3) {
            let info = ViewInfo::new(auth, -1, -1).unwrap();
            m.handle_retrieve_response(&encode_canonical(&info).unwrap());
        }
        assert_eq!(m.status(), (0, 0, ViewState::Ready));
        assert!(m.leader_name().is_some());
    }

    #[test]
    fn quorum_rotates_leader_once_per_term() {
        let (managers, auths, _hub) = build(&["a", "b", "c", "d"]);
        let m = &managers[0];
        force_view(m, 7, 1);

        for auth in auths.iter().take(3) {
            let vc =
                ViewChange::new(auth, ViewChangeReason::LeaderDead, 7, 1, None).unwrap();
            m.handle_view_change(&encode_canonical(&vc).unwrap());
        }
        assert_eq!(m.status(), (8, 2, ViewState::Ready));

        // a late demand for the old term is out-of-term now
        let late = ViewChange::new(&auths[3], ViewChangeReason::LeaderDead, 7, 1, None).unwrap();
        m.handle_view_change(&encode_canonical(&late).unwrap());
        assert_eq!(m.status(), (8, 2, ViewState::Ready));
    }

    #[test]
    fn rotation_wraps_around_roster() {
        let (managers, auths, _hub) = build(&["a", "b", "c", "d"]);
        let m = &managers[0];
        force_view(m, 3, 3);
        for auth in auths.iter().take(3) {
            let vc = ViewChange::new(auth, ViewChangeReason::BlockOvertime, 3, 3, None).unwrap();
            m.handle_view_change(&encode_canonical(&vc).unwrap());
        }
        assert_eq!(m.status(), (4, 0, ViewState::Ready));
    }

    #[test]
    fn out_of_term_demands_do_not_tally() {
        let (managers, auths, _hub) = build(&["a", "b", "c", "d"]);
        let m = &managers[0];
        force_view(m, 7, 1);
        for auth in auths.iter().take(3) {
            let vc = ViewChange::new(auth, ViewChangeReason::LeaderDead, 6, 1, None).unwrap();
            m.handle_view_change(&encode_canonical(&vc).unwrap());
        }
        assert_eq!(m.status(), (7, 1, ViewState::Ready));
    }

    #[test]
    fn change_result_moves_lagging_node_forward() {
        let (managers, auths, _hub) = build(&["a", "b", "c", "d"]);
        let m = &managers[0];
        force_view(m, 7, 1);

        let result = ViewChangeResult::new(&auths[2], 8, 2).unwrap();
        m.handle_view_change_result(&encode_canonical(&result).unwrap());
        assert_eq!(m.status(), (8, 2, ViewState::Ready));

        // never backwards
        let old = ViewChangeResult::new(&auths[2], 5, 0).unwrap();
        m.handle_view_change_result(&encode_canonical(&old).unwrap());
        assert_eq!(m.status(), (8, 2, ViewState::Ready));
    }

    #[test]
    fn duplicate_demanders_count_once() {
        let (managers, auths, _hub) = build(&["a", "b", "c", "d"]);
        let m = &managers[0];
        force_view(m, 7, 1);
        let vc = ViewChange::new(&auths[1], ViewChangeReason::LeaderDead, 7, 1, None).unwrap();
        let payload = encode_canonical(&vc).unwrap();
        for _ in 0..5 {
            m.handle_view_change(&payload);
        }
        assert_eq!(m.status(), (7, 1, ViewState::Ready));
    }
}
