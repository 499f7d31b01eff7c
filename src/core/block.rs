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

//! Content-addressed blocks over finalised proposals.
//!
//! Wire layout:
//! `origin[NETWORK_KEY_SIZE] ‖ timestamp[u32 LE] ‖ prev_block[32] ‖
//! merkle_root[32] ‖ nonce[u32 LE] ‖ signature[NETWORK_KEY_SIZE, zero padded]
//! ‖ count[u32 LE] ‖ (len[u32 LE] ‖ bytes)*`.
//!
//! The Merkle root promotes the odd tail: an odd level recurses on
//! `[root(all-but-last), last]` rather than duplicating the last leaf.
//! Compatibility depends on that exact rule.

use thiserror::Error;

use crate::core::messages::{Proposal, MAX_PAYLOAD};
use crate::core::security::authority::{Authority, AuthorityError};
use crate::core::types::{
    decode_canonical_limited, encode_canonical, sha256, CodecError, H256, NodeName, Signature,
    BLOCK_HEADER_SIZE, NETWORK_KEY_SIZE,
};

/// Block errors.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Encoding/decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Signing failed.
    #[error(transparent)]
    Authority(#[from] AuthorityError),
    /// Recomputed Merkle root differs from the header.
    #[error("merkle root mismatch")]
    MerkleMismatch,
    /// Header signature does not verify under the origin.
    #[error("bad block signature")]
    BadSignature,
    /// The origin is not the leader the local view expects.
    #[error("origin {0} is not the expected leader")]
    WrongLeader(NodeName),
    /// A contained transaction fails verification.
    #[error("invalid transaction in block")]
    BadTransaction,
}

/// Fixed-width block header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Sealing node.
    pub origin: NodeName,
    /// Hash of the previous block's header; zero for genesis.
    pub prev_block: H256,
    /// Merkle commitment over the transaction slice.
    pub merkle_root: H256,
    /// Seal time (unix seconds, truncated to u32).
    pub timestamp: u32,
    /// Reserved.
    pub nonce: u32,
}

fn strip_trailing_zeros(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| *b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    &bytes[..end]
}

impl BlockHeader {
    /// Encode to the fixed [`BLOCK_HEADER_SIZE`] layout.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(BLOCK_HEADER_SIZE);
        let name = self.origin.as_str().as_bytes();
        if name.len() > NETWORK_KEY_SIZE {
            return Err(CodecError::Canonical);
        }
        out.extend_from_slice(name);
        out.extend(std::iter::repeat(0u8).take(NETWORK_KEY_SIZE - name.len()));
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(self.prev_block.as_bytes());
        out.extend_from_slice(self.merkle_root.as_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        Ok(out)
    }

    /// Decode from the fixed layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < BLOCK_HEADER_SIZE {
            return Err(CodecError::Truncated);
        }
        let mut at = 0usize;
        let origin_raw = strip_trailing_zeros(&bytes[at..at + NETWORK_KEY_SIZE]);
        let origin = NodeName::new(
            std::str::from_utf8(origin_raw)
                .map_err(|_| CodecError::Deserialize)?
                .to_string(),
        );
        at += NETWORK_KEY_SIZE;

        let mut ts = [0u8; 4];
        ts.copy_from_slice(&bytes[at..at + 4]);
        at += 4;

        let mut prev = [0u8; 32];
        prev.copy_from_slice(&bytes[at..at + 32]);
        at += 32;

        let mut root = [0u8; 32];
        root.copy_from_slice(&bytes[at..at + 32]);
        at += 32;

        let mut nonce = [0u8; 4];
        nonce.copy_from_slice(&bytes[at..at + 4]);

        Ok(Self {
            origin,
            prev_block: H256::from_bytes(prev),
            merkle_root: H256::from_bytes(root),
            timestamp: u32::from_le_bytes(ts),
            nonce: u32::from_le_bytes(nonce),
        })
    }

    /// Header identity hash.
    pub fn hash(&self) -> Result<H256, CodecError> {
        Ok(sha256(&self.encode()?))
    }
}

/// Canonical bytes of a transaction as carried in the block body.
pub fn transaction_bytes(p: &Proposal) -> Result<Vec<u8>, CodecError> {
    encode_canonical(p)
}

/// Leaf hash of a transaction: hash of its canonical encoding.
pub fn transaction_hash(p: &Proposal) -> Result<H256, CodecError> {
    Ok(sha256(&transaction_bytes(p)?))
}

fn merkle(hashes: &[H256]) -> H256 {
    match hashes.len() {
        0 => H256::ZERO,
        1 => hashes[0],
        l if l % 2 == 1 => {
            // Promote the tail: pair the root of the even prefix with the
            // last element.
            merkle(&[merkle(&hashes[..l - 1]), hashes[l - 1]])
        }
        l => {
            let mut next = Vec::with_capacity(l / 2);
            for pair in hashes.chunks_exact(2) {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(pair[0].as_bytes());
                buf[32..].copy_from_slice(pair[1].as_bytes());
                next.push(sha256(&buf));
            }
            merkle(&next)
        }
    }
}

/// Merkle root over an ordered transaction list.
pub fn merkle_root(transactions: &[Proposal]) -> Result<H256, CodecError> {
    let hashes: Vec<H256> = transactions
        .iter()
        .map(transaction_hash)
        .collect::<Result<_, _>>()?;
    Ok(merkle(&hashes))
}

/// A sealed block: header, origin signature, ordered transactions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Header.
    pub header: BlockHeader,
    /// Signature over the header hash under the origin's key.
    pub signature: Signature,
    /// Finalised proposals in seal order.
    pub transactions: Vec<Proposal>,
}

impl Block {
    /// Assemble and sign a block over `transactions`.
    pub fn seal(
        authority: &Authority,
        prev_block: H256,
        transactions: Vec<Proposal>,
    ) -> Result<Self, BlockError> {
        let header = BlockHeader {
            origin: authority.local_name().clone(),
            prev_block,
            merkle_root: merkle_root(&transactions)?,
            timestamp: crate::core::messages::now_unix() as u32,
            nonce: 0,
        };
        let signature = authority.sign(header.hash()?.as_bytes())?;
        Ok(Self {
            header,
            signature,
            transactions,
        })
    }

    /// Encode to wire bytes, signature zero-padded to [`NETWORK_KEY_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.signature.0.len() > NETWORK_KEY_SIZE {
            return Err(CodecError::Canonical);
        }
        let mut out = self.header.encode()?;
        out.extend_from_slice(&self.signature.0);
        out.extend(std::iter::repeat(0u8).take(NETWORK_KEY_SIZE - self.signature.0.len()));

        out.extend_from_slice(&(self.transactions.len() as u32).to_le_bytes());
        for tx in &self.transactions {
            let bytes = transaction_bytes(tx)?;
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < BLOCK_HEADER_SIZE + NETWORK_KEY_SIZE + 4 {
            return Err(CodecError::Truncated);
        }
        let header = BlockHeader::decode(&bytes[..BLOCK_HEADER_SIZE])?;
        let mut at = BLOCK_HEADER_SIZE;

        // An Ed25519 signature fills the field exactly; a trailing zero byte
        // is signature material, not padding.
        let signature = Signature(bytes[at..at + NETWORK_KEY_SIZE].to_vec());
        at += NETWORK_KEY_SIZE;

        let mut count_raw = [0u8; 4];
        count_raw.copy_from_slice(&bytes[at..at + 4]);
        at += 4;
        let count = u32::from_le_bytes(count_raw) as usize;

        let mut transactions = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            if bytes.len() < at + 4 {
                return Err(CodecError::Truncated);
            }
            let mut len_raw = [0u8; 4];
            len_raw.copy_from_slice(&bytes[at..at + 4]);
            at += 4;
            let len = u32::from_le_bytes(len_raw) as usize;
            if len > MAX_PAYLOAD || bytes.len() < at + len {
                return Err(CodecError::Truncated);
            }
            transactions.push(decode_canonical_limited(&bytes[at..at + len], MAX_PAYLOAD)?);
            at += len;
        }
        if at != bytes.len() {
            return Err(CodecError::Deserialize);
        }
        Ok(Self {
            header,
            signature,
            transactions,
        })
    }

    /// Identity is the origin signature over the header.
    pub fn same_block(&self, other: &Block) -> bool {
        self.signature == other.signature
    }

    /// Verify a received block: Merkle commitment, origin signature, origin
    /// is the expected leader, and every transaction verifies.
    pub fn verify(
        &self,
        authority: &Authority,
        expected_leader: Option<&NodeName>,
    ) -> Result<(), BlockError> {
        if merkle_root(&self.transactions)? != self.header.merkle_root {
            return Err(BlockError::MerkleMismatch);
        }
        if let Some(leader) = expected_leader {
            if leader != &self.header.origin {
                return Err(BlockError::WrongLeader(self.header.origin.clone()));
            }
        }
        let hash = self.header.hash()?;
        authority
            .verify(&self.signature, hash.as_bytes(), &self.header.origin)
            .map_err(|_| BlockError::BadSignature)?;
        for tx in &self.transactions {
            if !tx.verify(authority) {
                return Err(BlockError::BadTransaction);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::messages::OperationType;
    use crate::core::types::CanonicalMap;

    fn net(n: usize) -> Vec<Authority> {
        let names: Vec<String> = (0..n).map(|i| format!("node{i}")).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        Authority::generate_network(&refs).unwrap()
    }

    fn tx(authority: &Authority, zone: &str) -> Proposal {
        let mut values = CanonicalMap::new();
        values.insert("ip".to_string(), "1.1.1.1".to_string());
        let mut p = Proposal::unsigned(
            authority.local_name().clone(),
            OperationType::Add,
            zone.to_string(),
            authority.local_name().clone(),
            values,
        );
        p.seal(authority).unwrap();
        p
    }

    #[test]
    fn empty_merkle_root_is_zero() {
        assert_eq!(merkle_root(&[]).unwrap(), H256::ZERO);
    }

    #[test]
    fn singleton_merkle_root_is_the_transaction_hash() {
        let auth = &net(1)[0];
        let p = tx(auth, "a");
        assert_eq!(merkle_root(&[p.clone()]).unwrap(), transaction_hash(&p).unwrap());
    }

    #[test]
    fn odd_tail_promotion_rule() {
        let auth = &net(1)[0];
        let txs: Vec<Proposal> = ["a", "b", "c"].iter().map(|z| tx(auth, z)).collect();
        let h: Vec<H256> = txs.iter().map(|t| transaction_hash(t).unwrap()).collect();

        // [a b c] must hash as (H(a‖b), c), not as (H(a‖b), H(c‖c)).
        let mut ab = [0u8; 64];
        ab[..32].copy_from_slice(h[0].as_bytes());
        ab[32..].copy_from_slice(h[1].as_bytes());
        let ab = sha256(&ab);
        let mut abc = [0u8; 64];
        abc[..32].copy_from_slice(ab.as_bytes());
        abc[32..].copy_from_slice(h[2].as_bytes());
        let expected = sha256(&abc);

        assert_eq!(merkle_root(&txs).unwrap(), expected);
    }

    #[test]
    fn header_round_trip_exact() {
        let header = BlockHeader {
            origin: NodeName::new("alpha"),
            prev_block: H256::from_bytes([3u8; 32]),
            merkle_root: H256::from_bytes([4u8; 32]),
            timestamp: 1_700_000_000,
            nonce: 0,
        };
        let bytes = header.encode().unwrap();
        assert_eq!(bytes.len(), BLOCK_HEADER_SIZE);
        assert_eq!(BlockHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn block_round_trip_including_signature_padding() {
        let auth = &net(1)[0];
        let block = Block::seal(auth, H256::ZERO, vec![tx(auth, "a"), tx(auth, "b")]).unwrap();
        let bytes = block.encode().unwrap();
        let back = Block::decode(&bytes).unwrap();
        assert_eq!(block, back);
        // the padding must be reproduced byte for byte
        assert_eq!(bytes, back.encode().unwrap());
    }

    #[test]
    fn verify_accepts_sealed_and_rejects_tampered() {
        let auths = net(2);
        let leader = &auths[0];
        let block = Block::seal(leader, H256::ZERO, vec![tx(leader, "a")]).unwrap();

        block
            .verify(&auths[1], Some(leader.local_name()))
            .unwrap();

        // wrong expected leader
        assert!(matches!(
            block.verify(&auths[1], Some(auths[1].local_name())),
            Err(BlockError::WrongLeader(_))
        ));

        // tampered transaction set
        let mut bad = block.clone();
        bad.transactions.push(tx(leader, "b"));
        assert!(matches!(
            bad.verify(&auths[1], None),
            Err(BlockError::MerkleMismatch)
        ));
    }

    #[test]
    fn decode_rejects_truncation() {
        let auth = &net(1)[0];
        let block = Block::seal(auth, H256::ZERO, vec![tx(auth, "a")]).unwrap();
        let bytes = block.encode().unwrap();
        assert!(Block::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(Block::decode(&bytes[..BLOCK_HEADER_SIZE]).is_err());
    }
}
