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

//! Wire messages of the consensus protocol and their hash/sign/verify rules.
//!
//! Every signed message hashes a canonical structural preimage (see
//! [`CanonicalWriter`]) and signs that hash with the node key. Wire payloads
//! travel as canonical bincode inside a one-byte-tagged [`Frame`]; the block
//! payload alone uses the hand-rolled layout in [`crate::core::block`].

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::security::authority::{Authority, AuthorityError};
use crate::core::types::{
    CanonicalMap, CanonicalWriter, CodecError, H256, NodeName, Signature, sha256,
};

/// Upper bound for any single decoded payload.
pub const MAX_PAYLOAD: usize = 64 * 1024;

/// Seconds since the UNIX epoch, as the protocol's i64 timestamp.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Frame tags carried on the gossip wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// A zone-name proposal.
    Proposal = 1,
    /// Audit-round response (carried for forward compatibility).
    AuditResponse = 2,
    /// View-change request.
    ViewChange = 3,
    /// View-change outcome announcement.
    ViewChangeResult = 4,
    /// Leader retrieval request (startup).
    RetrieveLeader = 5,
    /// Signed view info answering a retrieval.
    RetrieveLeaderResponse = 6,
    /// Round-coordination message; carries the proposer's confirm round.
    Commit = 7,
    /// A sealed block.
    Block = 8,
    /// A signed acknowledgement of a proposal.
    ProposalResult = 9,
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self, CodecError> {
        Ok(match tag {
            1 => MessageType::Proposal,
            2 => MessageType::AuditResponse,
            3 => MessageType::ViewChange,
            4 => MessageType::ViewChangeResult,
            5 => MessageType::RetrieveLeader,
            6 => MessageType::RetrieveLeaderResponse,
            7 => MessageType::Commit,
            8 => MessageType::Block,
            9 => MessageType::ProposalResult,
            other => return Err(CodecError::UnknownTag(other)),
        })
    }
}

/// Tagged wire envelope: one byte of type followed by the raw payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Payload discriminant.
    pub message_type: MessageType,
    /// Encoded payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Wrap an already-encoded payload.
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            payload,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.payload.len());
        out.push(self.message_type as u8);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (&tag, payload) = bytes.split_first().ok_or(CodecError::Truncated)?;
        Ok(Self {
            message_type: MessageType::try_from(tag)?,
            payload: payload.to_vec(),
        })
    }

    /// Encoded size on the wire.
    pub fn encoded_len(&self) -> usize {
        1 + self.payload.len()
    }
}

/// Zone operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    /// Claim a new zone.
    Add,
    /// Relinquish a zone.
    Del,
    /// Modify an owned zone's values.
    Mod,
}

impl OperationType {
    fn as_u8(self) -> u8 {
        match self {
            OperationType::Add => 0,
            OperationType::Del => 1,
            OperationType::Mod => 2,
        }
    }
}

/// A client intent, received as one JSON datagram on the local UDP socket.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    /// Requested operation.
    pub opt_type: OperationType,
    /// Target zone name.
    pub zone_name: String,
    /// Record values (merged over existing values for Mod).
    #[serde(default)]
    pub values: CanonicalMap<String, String>,
}

/// A zone-name proposal, the protocol's transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Originating node.
    pub from: NodeName,
    /// Origination time (unix seconds).
    pub timestamp: i64,
    /// Operation kind.
    pub op: OperationType,
    /// Target zone.
    pub zone_name: String,
    /// Owner after this operation (the dereliction sentinel for Del).
    pub owner: NodeName,
    /// Record values.
    pub values: CanonicalMap<String, String>,
    /// Admission-control nonce (meaningful for Add only).
    pub nonce: u32,
    /// Content hash of the canonical fields.
    pub id: H256,
    /// Signature over `id` under `from`'s key.
    pub signature: Signature,
}

impl Proposal {
    /// Unsigned proposal skeleton; `id` and `signature` are attached by
    /// [`Proposal::seal`], the nonce by the admitter.
    pub fn unsigned(
        from: NodeName,
        op: OperationType,
        zone_name: String,
        owner: NodeName,
        values: CanonicalMap<String, String>,
    ) -> Self {
        Self {
            from,
            timestamp: now_unix(),
            op,
            zone_name,
            owner,
            values,
            nonce: 0,
            id: H256::ZERO,
            signature: Signature::default(),
        }
    }

    /// Canonical id preimage: from, timestamp, op, zone, owner, values.
    /// The nonce is deliberately outside the id (see the work hash).
    pub fn id_preimage(&self) -> Result<Vec<u8>, CodecError> {
        let mut w = CanonicalWriter::new();
        w.put_identity(&self.from)?;
        w.put_i64(self.timestamp);
        w.put_u8(self.op.as_u8());
        w.put_str(&self.zone_name);
        w.put_identity(&self.owner)?;
        w.put_map(&self.values);
        Ok(w.finish())
    }

    /// Content hash over the canonical preimage.
    pub fn compute_id(&self) -> Result<H256, CodecError> {
        Ok(sha256(&self.id_preimage()?))
    }

    /// Admission work hash: `SHA256(id || nonce_le)`. Incrementing the nonce
    /// re-rolls this hash without disturbing the content id.
    pub fn work_hash(&self) -> Result<H256, CodecError> {
        let mut buf = Vec::with_capacity(32 + 4);
        buf.extend_from_slice(self.compute_id()?.as_bytes());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        Ok(sha256(&buf))
    }

    /// Fix the id and sign it.
    pub fn seal(&mut self, authority: &Authority) -> Result<(), SealError> {
        self.id = self.compute_id()?;
        self.signature = authority.sign(self.id.as_bytes())?;
        Ok(())
    }

    /// Recompute the id and verify the signature under `from`'s key.
    pub fn verify(&self, authority: &Authority) -> bool {
        let Ok(id) = self.compute_id() else {
            return false;
        };
        id == self.id
            && authority
                .verify(&self.signature, self.id.as_bytes(), &self.from)
                .is_ok()
    }
}

/// Error sealing a message: canonicalisation or signing failed.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Authority(#[from] AuthorityError),
}

/// A signed acknowledgement that a peer accepted a proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalReply {
    /// Acknowledging node.
    pub from: NodeName,
    /// Acknowledged proposal id.
    pub proposal_id: H256,
    /// Reply time (unix seconds).
    pub timestamp: i64,
    /// Signature over (from, proposal_id, timestamp).
    pub signature: Signature,
}

impl ProposalReply {
    /// Build and sign a reply for `proposal_id`.
    pub fn new(authority: &Authority, proposal_id: H256) -> Result<Self, SealError> {
        let mut reply = Self {
            from: authority.local_name().clone(),
            proposal_id,
            timestamp: now_unix(),
            signature: Signature::default(),
        };
        let hash = reply.signing_hash()?;
        reply.signature = authority.sign(hash.as_bytes())?;
        Ok(reply)
    }

    fn signing_hash(&self) -> Result<H256, CodecError> {
        let mut w = CanonicalWriter::new();
        w.put_identity(&self.from)?;
        w.put_hash(&self.proposal_id);
        w.put_i64(self.timestamp);
        Ok(sha256(&w.finish()))
    }

    /// Verify the signature under `from`'s key.
    pub fn verify(&self, authority: &Authority) -> bool {
        let Ok(hash) = self.signing_hash() else {
            return false;
        };
        authority
            .verify(&self.signature, hash.as_bytes(), &self.from)
            .is_ok()
    }
}

/// Issued by the original proposer when the first round missed quorum.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalConfirm {
    /// Proposer re-requesting acknowledgements.
    pub from: NodeName,
    /// Hash of the proposal under confirmation.
    pub proposal_hash: H256,
    /// Confirm time (unix seconds).
    pub timestamp: i64,
    /// Signature over (from, proposal_hash, timestamp).
    pub signature: Signature,
}

impl ProposalConfirm {
    /// Build and sign a confirm for `proposal_hash`.
    pub fn new(authority: &Authority, proposal_hash: H256) -> Result<Self, SealError> {
        let mut confirm = Self {
            from: authority.local_name().clone(),
            proposal_hash,
            timestamp: now_unix(),
            signature: Signature::default(),
        };
        let hash = confirm.signing_hash()?;
        confirm.signature = authority.sign(hash.as_bytes())?;
        Ok(confirm)
    }

    fn signing_hash(&self) -> Result<H256, CodecError> {
        let mut w = CanonicalWriter::new();
        w.put_identity(&self.from)?;
        w.put_hash(&self.proposal_hash);
        w.put_i64(self.timestamp);
        Ok(sha256(&w.finish()))
    }

    /// Verify the signature under `from`'s key.
    pub fn verify(&self, authority: &Authority) -> bool {
        let Ok(hash) = self.signing_hash() else {
            return false;
        };
        authority
            .verify(&self.signature, hash.as_bytes(), &self.from)
            .is_ok()
    }
}

/// Why a node requests a view change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewChangeReason {
    /// The failure detector suspects the leader is dead.
    LeaderDead,
    /// A quorum-acknowledged proposal never made it into a block.
    ProposalMissed,
    /// The block round exceeded its deadline.
    BlockOvertime,
}

/// A signed request to rotate the leader for a term.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChange {
    /// Requesting node.
    pub from: NodeName,
    /// Reported reason.
    pub reason: ViewChangeReason,
    /// Term this request applies to.
    pub term_id: i64,
    /// Leader the requester currently sees.
    pub leader_id: i64,
    /// Offending proposal, when the reason names one.
    pub proposal_id: Option<H256>,
    /// Signature over the fields above.
    pub signature: Signature,
}

impl ViewChange {
    /// Build and sign a view-change request.
    pub fn new(
        authority: &Authority,
        reason: ViewChangeReason,
        term_id: i64,
        leader_id: i64,
        proposal_id: Option<H256>,
    ) -> Result<Self, SealError> {
        let mut msg = Self {
            from: authority.local_name().clone(),
            reason,
            term_id,
            leader_id,
            proposal_id,
            signature: Signature::default(),
        };
        let hash = msg.signing_hash()?;
        msg.signature = authority.sign(hash.as_bytes())?;
        Ok(msg)
    }

    fn signing_hash(&self) -> Result<H256, CodecError> {
        let mut w = CanonicalWriter::new();
        w.put_identity(&self.from)?;
        w.put_u8(match self.reason {
            ViewChangeReason::LeaderDead => 0,
            ViewChangeReason::ProposalMissed => 1,
            ViewChangeReason::BlockOvertime => 2,
        });
        w.put_i64(self.term_id);
        w.put_i64(self.leader_id);
        w.put_hash(&self.proposal_id.unwrap_or(H256::ZERO));
        Ok(sha256(&w.finish()))
    }

    /// Verify the signature under `from`'s key.
    pub fn verify(&self, authority: &Authority) -> bool {
        let Ok(hash) = self.signing_hash() else {
            return false;
        };
        authority
            .verify(&self.signature, hash.as_bytes(), &self.from)
            .is_ok()
    }
}

/// Announces the view a node committed after a change round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewChangeResult {
    /// Announcing node.
    pub from: NodeName,
    /// Committed term.
    pub term_id: i64,
    /// Committed leader.
    pub leader_id: i64,
    /// Signature over the fields above.
    pub signature: Signature,
}

impl ViewChangeResult {
    /// Build and sign an announcement.
    pub fn new(authority: &Authority, term_id: i64, leader_id: i64) -> Result<Self, SealError> {
        let mut msg = Self {
            from: authority.local_name().clone(),
            term_id,
            leader_id,
            signature: Signature::default(),
        };
        let hash = msg.signing_hash()?;
        msg.signature = authority.sign(hash.as_bytes())?;
        Ok(msg)
    }

    fn signing_hash(&self) -> Result<H256, CodecError> {
        let mut w = CanonicalWriter::new();
        w.put_identity(&self.from)?;
        w.put_i64(self.term_id);
        w.put_i64(self.leader_id);
        Ok(sha256(&w.finish()))
    }

    /// Verify the signature under `from`'s key.
    pub fn verify(&self, authority: &Authority) -> bool {
        let Ok(hash) = self.signing_hash() else {
            return false;
        };
        authority
            .verify(&self.signature, hash.as_bytes(), &self.from)
            .is_ok()
    }
}

/// Startup request for the current view. Unsigned: the answer is what counts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveLeader {
    /// Requesting node, so peers can answer point-to-point.
    pub from: NodeName,
}

/// Signed (term, leader) tuple answering a retrieval request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewInfo {
    /// Term counter.
    pub term_id: i64,
    /// Leader index within the roster.
    pub leader_id: i64,
    /// Answering node.
    pub from: NodeName,
    /// Signature over (term_id, leader_id, from).
    pub signature: Signature,
}

impl ViewInfo {
    /// Build and sign a view info.
    pub fn new(authority: &Authority, term_id: i64, leader_id: i64) -> Result<Self, SealError> {
        let mut info = Self {
            term_id,
            leader_id,
            from: authority.local_name().clone(),
            signature: Signature::default(),
        };
        let hash = info.signing_hash()?;
        info.signature = authority.sign(hash.as_bytes())?;
        Ok(info)
    }

    fn signing_hash(&self) -> Result<H256, CodecError> {
        let mut w = CanonicalWriter::new();
        w.put_i64(self.term_id);
        w.put_i64(self.leader_id);
        w.put_identity(&self.from)?;
        Ok(sha256(&w.finish()))
    }

    /// Verify the signature under `from`'s key.
    pub fn verify(&self, authority: &Authority) -> bool {
        let Ok(hash) = self.signing_hash() else {
            return false;
        };
        authority
            .verify(&self.signature, hash.as_bytes(), &self.from)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{decode_canonical_limited, encode_canonical};

    fn net(n: usize) -> Vec<Authority> {
        let names: Vec<String> = (0..n).map(|i| format!("node{i}")).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        Authority::generate_network(&refs).unwrap()
    }

    fn sample_proposal(authority: &Authority) -> Proposal {
        let mut values = CanonicalMap::new();
        values.insert("ip".to_string(), "1.1.1.1".to_string());
        let mut p = Proposal::unsigned(
            authority.local_name().clone(),
            OperationType::Add,
            "example".to_string(),
            authority.local_name().clone(),
            values,
        );
        p.seal(authority).unwrap();
        p
    }

    #[test]
    fn frame_round_trip_all_tags() {
        for tag in 1u8..=9 {
            let frame = Frame::new(MessageType::try_from(tag).unwrap(), vec![1, 2, 3]);
            let back = Frame::decode(&frame.encode()).unwrap();
            assert_eq!(frame, back);
        }
    }

    #[test]
    fn frame_rejects_unknown_and_empty() {
        assert!(matches!(Frame::decode(&[]), Err(CodecError::Truncated)));
        assert!(matches!(
            Frame::decode(&[0, 1, 2]),
            Err(CodecError::UnknownTag(0))
        ));
        assert!(matches!(
            Frame::decode(&[10]),
            Err(CodecError::UnknownTag(10))
        ));
    }

    #[test]
    fn proposal_round_trip_and_verify() {
        let auths = net(2);
        let p = sample_proposal(&auths[0]);
        let bytes = encode_canonical(&p).unwrap();
        let back: Proposal = decode_canonical_limited(&bytes, MAX_PAYLOAD).unwrap();
        assert_eq!(p, back);
        assert!(back.verify(&auths[1]));
    }

    #[test]
    fn proposal_id_ignores_nonce_but_work_hash_does_not() {
        let auths = net(1);
        let mut p = sample_proposal(&auths[0]);
        let id = p.compute_id().unwrap();
        let w0 = p.work_hash().unwrap();
        p.nonce += 1;
        assert_eq!(p.compute_id().unwrap(), id);
        assert_ne!(p.work_hash().unwrap(), w0);
    }

    #[test]
    fn tampered_proposal_fails_verification() {
        let auths = net(2);
        let mut p = sample_proposal(&auths[0]);
        p.zone_name = "other".to_string();
        assert!(!p.verify(&auths[1]));
    }

    #[test]
    fn reply_verifies_and_rejects_cross_signer() {
        let auths = net(2);
        let id = H256::from_bytes([7u8; 32]);
        let mut reply = ProposalReply::new(&auths[0], id).unwrap();
        assert!(reply.verify(&auths[1]));
        // claim the other node's identity without its key
        reply.from = auths[1].local_name().clone();
        assert!(!reply.verify(&auths[1]));
    }

    #[test]
    fn view_messages_verify() {
        let auths = net(2);
        let info = ViewInfo::new(&auths[0], 5, 2).unwrap();
        assert!(info.verify(&auths[1]));

        let vc = ViewChange::new(&auths[0], ViewChangeReason::LeaderDead, 7, 1, None).unwrap();
        assert!(vc.verify(&auths[1]));

        let mut forged = vc.clone();
        forged.term_id = 8;
        assert!(!forged.verify(&auths[1]));
    }

    #[test]
    fn order_parses_from_json() {
        let raw = br#"{"opt_type":"Add","zone_name":"a","values":{"ip":"1.1.1.1"}}"#;
        let order: Order = serde_json::from_slice(raw).unwrap();
        assert_eq!(order.zone_name, "a");
        assert_eq!(order.values.get("ip").map(String::as_str), Some("1.1.1.1"));
    }
}
