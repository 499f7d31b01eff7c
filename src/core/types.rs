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

//! Deterministic core types, canonical encoding and node configuration.

use bincode::Options;
use ring::digest;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Fixed byte width for identity and signature fields in hash preimages and
/// the block wire layout. An Ed25519 signature (64 bytes) fits exactly.
pub const NETWORK_KEY_SIZE: usize = 64;

/// Encoded block header size: origin + timestamp + prev + merkle + nonce.
pub const BLOCK_HEADER_SIZE: usize = NETWORK_KEY_SIZE + 4 + 32 + 32 + 4;

/// Frames at or above this size go over the reliable point-to-point path
/// instead of the gossip broadcast queue.
pub const MAX_GOSSIP_PAYLOAD: usize = 1350;

/// Depth of every bounded channel in the node.
pub const CHANNEL_DEPTH: usize = 1024;

/// Canonical serialization error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization")]
    Serialize,
    #[error("deserialization")]
    Deserialize,
    #[error("size limit exceeded")]
    TooLarge,
    #[error("truncated frame")]
    Truncated,
    #[error("unknown frame tag {0}")]
    UnknownTag(u8),
    #[error("field exceeds its fixed width")]
    Canonical,
}

/// Canonical bincode options (deterministic).
fn bincode_opts() -> impl Options {
    // Fixint encoding provides a stable integer representation.
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode with deterministic rules. Container ordering must already be
/// deterministic (BTreeMap/BTreeSet only).
pub fn encode_canonical<T: Serialize>(v: &T) -> Result<Vec<u8>, CodecError> {
    bincode_opts()
        .serialize(v)
        .map_err(|_| CodecError::Serialize)
}

/// Decode with a hard size cap.
pub fn decode_canonical_limited<T: DeserializeOwned>(
    bytes: &[u8],
    max: usize,
) -> Result<T, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::TooLarge);
    }
    // Cap inside the deserializer as well so container length fields cannot
    // request huge allocations.
    bincode_opts()
        .with_limit(max as u64)
        .deserialize(bytes)
        .map_err(|_| CodecError::Deserialize)
}

/// 256-bit hash (SHA-256 output).
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct H256([u8; 32]);

impl H256 {
    /// All-zero hash, used for the genesis previous-block link and the
    /// empty Merkle root.
    pub const ZERO: H256 = H256([0u8; 32]);

    /// Construct from raw bytes.
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }
    /// Return bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
    /// Abbreviated hex form for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for H256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "H256({})", hex::encode(self.0))
    }
}

/// SHA-256 over raw bytes.
pub fn sha256(data: &[u8]) -> H256 {
    let d = digest::digest(&digest::SHA256, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(d.as_ref());
    H256(out)
}

/// Ed25519 signature bytes (expected 64).
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Signature(pub Vec<u8>);

impl Signature {
    /// True when no signature has been attached yet.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Reserved owner name marking a zone as abandoned.
const DERELICTION: &str = "dereliction";

/// Stable node identity string, backed by a registered public key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeName(String);

impl NodeName {
    /// Wrap a raw name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
    /// The sentinel owner of abandoned zones.
    pub fn dereliction() -> Self {
        Self(DERELICTION.to_string())
    }
    /// Whether this is the abandoned-zone sentinel.
    pub fn is_dereliction(&self) -> bool {
        self.0 == DERELICTION
    }
    /// Raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical map type alias.
pub type CanonicalMap<K, V> = BTreeMap<K, V>;

/// Builder for hash preimages: fixed field order, little-endian fixed-width
/// integers, length-prefixed containers, identity fields zero-padded to
/// [`NETWORK_KEY_SIZE`].
#[derive(Default)]
pub struct CanonicalWriter {
    buf: Vec<u8>,
}

impl CanonicalWriter {
    /// Fresh empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a single byte.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Append a little-endian u32.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a little-endian i64.
    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a length-prefixed byte string.
    pub fn put_bytes(&mut self, v: &[u8]) {
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, v: &str) {
        self.put_bytes(v.as_bytes());
    }

    /// Append an identity name zero-padded right to [`NETWORK_KEY_SIZE`].
    pub fn put_identity(&mut self, name: &NodeName) -> Result<(), CodecError> {
        self.put_fixed(name.as_str().as_bytes(), NETWORK_KEY_SIZE)
    }

    /// Append a 32-byte hash.
    pub fn put_hash(&mut self, h: &H256) {
        self.buf.extend_from_slice(h.as_bytes());
    }

    /// Append bytes zero-padded right to `width`.
    pub fn put_fixed(&mut self, v: &[u8], width: usize) -> Result<(), CodecError> {
        if v.len() > width {
            return Err(CodecError::Canonical);
        }
        self.buf.extend_from_slice(v);
        self.buf.extend(std::iter::repeat(0u8).take(width - v.len()));
        Ok(())
    }

    /// Append a string map as `(len, (key, value)*)` in byte-lexicographic
    /// key order. BTreeMap iteration already yields that order.
    pub fn put_map(&mut self, m: &CanonicalMap<String, String>) {
        self.put_u32(m.len() as u32);
        for (k, v) in m.iter() {
            self.put_str(k);
            self.put_str(v);
        }
    }

    /// Consume the writer and return the preimage bytes.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Configuration load error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Node configuration root, loaded from a single TOML file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's registered identity name.
    pub host_name: String,
    /// Gossip listen port.
    pub port: u16,
    /// Client order ingress socket.
    #[serde(default = "default_udp_addr")]
    pub udp_addr: String,
    /// Data directory (sled db + key material + authority directory).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// How long a proposal waits for quorum before the confirm round.
    pub proposal_timeout_ms: u64,
    /// Leading-zero-bit target for Add proposals.
    pub proposal_pow: u8,
    /// Leader sealing interval.
    pub block_interval_ms: u64,
    /// How long a finalised proposal may wait for a block before a view
    /// change is raised.
    #[serde(default = "default_block_overtime_ms")]
    pub block_overtime_ms: u64,
    /// Optional prometheus text exposition listener, e.g. "127.0.0.1:9100".
    #[serde(default)]
    pub metrics_addr: Option<String>,
    /// Bootstrap peer multiaddrs.
    #[serde(default)]
    pub peers: Vec<String>,
}

fn default_udp_addr() -> String {
    "127.0.0.1:8888".to_string()
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_block_overtime_ms() -> u64 {
    10_000
}

impl NodeConfig {
    /// Load from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Identity name as a [`NodeName`].
    pub fn node_name(&self) -> NodeName {
        NodeName::new(self.host_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_writer_pads_identities() {
        let mut w = CanonicalWriter::new();
        w.put_identity(&NodeName::new("alpha")).unwrap();
        let bytes = w.finish();
        assert_eq!(bytes.len(), NETWORK_KEY_SIZE);
        assert_eq!(&bytes[..5], b"alpha");
        assert!(bytes[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn canonical_writer_rejects_oversized_identity() {
        let long = "x".repeat(NETWORK_KEY_SIZE + 1);
        let mut w = CanonicalWriter::new();
        assert!(matches!(
            w.put_identity(&NodeName::new(long)),
            Err(CodecError::Canonical)
        ));
    }

    #[test]
    fn canonical_map_is_key_ordered() {
        let mut a = CanonicalMap::new();
        a.insert("b".to_string(), "2".to_string());
        a.insert("a".to_string(), "1".to_string());

        let mut b = CanonicalMap::new();
        b.insert("a".to_string(), "1".to_string());
        b.insert("b".to_string(), "2".to_string());

        let enc = |m: &CanonicalMap<String, String>| {
            let mut w = CanonicalWriter::new();
            w.put_map(m);
            w.finish()
        };
        assert_eq!(enc(&a), enc(&b));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = encode_canonical(&42u32).unwrap();
        bytes.push(0);
        assert!(decode_canonical_limited::<u32>(&bytes, 64).is_err());
    }

    #[test]
    fn dereliction_sentinel_round_trips() {
        let d = NodeName::dereliction();
        assert!(d.is_dereliction());
        let enc = encode_canonical(&d).unwrap();
        let back: NodeName = decode_canonical_limited(&enc, 256).unwrap();
        assert!(back.is_dereliction());
    }

    #[test]
    fn config_parses_minimal_file() {
        let text = r#"
host_name = "alpha"
port = 5300
proposal_timeout_ms = 3000
proposal_pow = 12
block_interval_ms = 5000
"#;
        let cfg: NodeConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.host_name, "alpha");
        assert_eq!(cfg.udp_addr, "127.0.0.1:8888");
        assert_eq!(cfg.block_overtime_ms, 10_000);
    }
}
