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

//! Certificate-authority collaborator: the fixed identity directory plus the
//! local Ed25519 signing key.
//!
//! The member set is static for the life of the process; it is loaded from
//! `authority.toml` in the data directory. Key generation and revocation are
//! out of scope. Quorum arithmetic lives here because it is a property of the
//! directory: `f = (n-1)/3`, quorum at `2f+1` distinct identities.

use ring::{
    rand::SystemRandom,
    signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, Instant},
};
use thiserror::Error;
use zeroize::Zeroize;

use crate::core::types::{NodeName, Signature};

/// Authority errors.
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("io")]
    Io,
    #[error("invalid key encoding")]
    InvalidKey,
    #[error("identity directory: {0}")]
    Directory(String),
    #[error("unknown identity {0}")]
    UnknownIdentity(NodeName),
    #[error("bad signature")]
    BadSignature,
    #[error("rate limited")]
    RateLimited,
}

/// On-disk identity directory.
#[derive(Debug, Serialize, Deserialize)]
struct DirectoryFile {
    members: Vec<MemberEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MemberEntry {
    name: String,
    public_key_hex: String,
}

fn set_private_perms_best_effort(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    }
}

/// Atomic write to disk (best-effort fsync, then rename).
fn atomic_write_private(path: &Path, bytes: &[u8]) -> Result<(), AuthorityError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|_| AuthorityError::Io)?;
    }

    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");

    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .map_err(|_| AuthorityError::Io)?;
        f.write_all(bytes).map_err(|_| AuthorityError::Io)?;
        let _ = f.sync_all();
    }

    set_private_perms_best_effort(&tmp);
    fs::rename(&tmp, path).map_err(|_| AuthorityError::Io)?;
    set_private_perms_best_effort(path);
    Ok(())
}

/// Load an Ed25519 PKCS#8 key file, or generate and persist one.
fn load_or_create_keypair(path: &Path) -> Result<Ed25519KeyPair, AuthorityError> {
    if path.exists() {
        let mut bytes = fs::read(path).map_err(|_| AuthorityError::Io)?;
        let kp = Ed25519KeyPair::from_pkcs8(&bytes).map_err(|_| AuthorityError::InvalidKey);
        bytes.zeroize();
        return kp;
    }

    let rng = SystemRandom::new();
    let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| AuthorityError::InvalidKey)?;
    atomic_write_private(path, pkcs8.as_ref())?;
    Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| AuthorityError::InvalidKey)
}

/// Signing rate limiter (fixed one-second window).
#[derive(Debug)]
struct RateLimiter {
    window_start: Instant,
    count: u32,
    limit_per_sec: u32,
}

impl RateLimiter {
    fn new(limit_per_sec: u32) -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
            limit_per_sec,
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= self.limit_per_sec {
            return false;
        }
        self.count = self.count.saturating_add(1);
        true
    }
}

/// Identity directory and signing oracle for one node.
pub struct Authority {
    local: NodeName,
    keypair: Ed25519KeyPair,
    members: BTreeMap<NodeName, [u8; 32]>,
    // Deterministic roster: leader ids index into this sorted list.
    roster: Vec<NodeName>,
    limiter: Mutex<RateLimiter>,
}

impl Authority {
    /// Open the authority for `local`: load (or create) the node key at
    /// `data_dir/node.key` and the member directory at
    /// `data_dir/authority.toml`. The directory must list `local` with the
    /// public key matching the node key.
    pub fn open(data_dir: &str, local: NodeName) -> Result<Self, AuthorityError> {
        let mut key_path = PathBuf::from(data_dir);
        key_path.push("node.key");
        let keypair = load_or_create_keypair(&key_path)?;

        let mut dir_path = PathBuf::from(data_dir);
        dir_path.push("authority.toml");
        let text = fs::read_to_string(&dir_path).map_err(|_| {
            AuthorityError::Directory(format!("missing {}", dir_path.display()))
        })?;
        let file: DirectoryFile = toml::from_str(&text)
            .map_err(|e| AuthorityError::Directory(e.to_string()))?;

        let mut members = BTreeMap::new();
        for entry in file.members {
            let name = NodeName::new(entry.name);
            if name.is_dereliction() {
                return Err(AuthorityError::Directory(
                    "the dereliction sentinel cannot be a member".to_string(),
                ));
            }
            let raw = hex::decode(&entry.public_key_hex)
                .map_err(|_| AuthorityError::Directory(format!("bad key hex for {name}")))?;
            if raw.len() != 32 {
                return Err(AuthorityError::Directory(format!(
                    "key for {name} is not 32 bytes"
                )));
            }
            let mut pk = [0u8; 32];
            pk.copy_from_slice(&raw);
            members.insert(name, pk);
        }

        Self::assemble(local, keypair, members)
    }

    /// Build from an in-memory directory. The local public key must match the
    /// directory entry for `local`.
    pub fn from_members(
        local: NodeName,
        keypair: Ed25519KeyPair,
        members: BTreeMap<NodeName, [u8; 32]>,
    ) -> Result<Self, AuthorityError> {
        Self::assemble(local, keypair, members)
    }

    fn assemble(
        local: NodeName,
        keypair: Ed25519KeyPair,
        members: BTreeMap<NodeName, [u8; 32]>,
    ) -> Result<Self, AuthorityError> {
        let registered = members
            .get(&local)
            .ok_or_else(|| AuthorityError::UnknownIdentity(local.clone()))?;
        if registered.as_slice() != keypair.public_key().as_ref() {
            return Err(AuthorityError::Directory(format!(
                "directory key for {local} does not match the node key"
            )));
        }
        let roster: Vec<NodeName> = members.keys().cloned().collect();
        Ok(Self {
            local,
            keypair,
            members,
            roster,
            limiter: Mutex::new(RateLimiter::new(10_000)),
        })
    }

    /// Generate a full network of authorities sharing one directory.
    /// Intended for local clusters and test harnesses.
    pub fn generate_network(names: &[&str]) -> Result<Vec<Authority>, AuthorityError> {
        let rng = SystemRandom::new();
        let mut keys = Vec::with_capacity(names.len());
        let mut members = BTreeMap::new();
        for name in names {
            let pkcs8 =
                Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| AuthorityError::InvalidKey)?;
            let kp = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
                .map_err(|_| AuthorityError::InvalidKey)?;
            let mut pk = [0u8; 32];
            pk.copy_from_slice(kp.public_key().as_ref());
            members.insert(NodeName::new(*name), pk);
            keys.push((NodeName::new(*name), kp));
        }
        keys.into_iter()
            .map(|(name, kp)| Self::assemble(name, kp, members.clone()))
            .collect()
    }

    /// This node's identity.
    pub fn local_name(&self) -> &NodeName {
        &self.local
    }

    /// Whether `name` is a registered member.
    pub fn exists(&self, name: &NodeName) -> bool {
        self.members.contains_key(name)
    }

    /// Number of registered members.
    pub fn network_size(&self) -> usize {
        self.members.len()
    }

    /// Byzantine tolerance: `f = (n-1)/3`.
    pub fn f(&self) -> usize {
        (self.network_size().saturating_sub(1)) / 3
    }

    /// Quorum predicate: `count >= 2f+1`.
    pub fn quorum_reached(&self, count: usize) -> bool {
        count >= 2 * self.f() + 1
    }

    /// Member at a leader index, if the index is in `[0, network_size)`.
    pub fn name_at(&self, index: i64) -> Option<&NodeName> {
        if index < 0 {
            return None;
        }
        self.roster.get(index as usize)
    }

    /// Leader index of a member.
    pub fn index_of(&self, name: &NodeName) -> Option<i64> {
        self.roster.iter().position(|n| n == name).map(|i| i as i64)
    }

    /// All registered members in roster order.
    pub fn roster(&self) -> &[NodeName] {
        &self.roster
    }

    /// Sign a message hash with the local key.
    pub fn sign(&self, msg: &[u8]) -> Result<Signature, AuthorityError> {
        let mut guard = self
            .limiter
            .lock()
            .map_err(|_| AuthorityError::RateLimited)?;
        if !guard.allow() {
            return Err(AuthorityError::RateLimited);
        }
        drop(guard);
        Ok(Signature(self.keypair.sign(msg).as_ref().to_vec()))
    }

    /// Verify a signature over `msg` under `name`'s registered key.
    pub fn verify(
        &self,
        sig: &Signature,
        msg: &[u8],
        name: &NodeName,
    ) -> Result<(), AuthorityError> {
        if sig.0.len() != 64 {
            return Err(AuthorityError::BadSignature);
        }
        let pk_bytes = self
            .members
            .get(name)
            .ok_or_else(|| AuthorityError::UnknownIdentity(name.clone()))?;
        let pk = UnparsedPublicKey::new(&ED25519, pk_bytes);
        pk.verify(msg, &sig.0)
            .map_err(|_| AuthorityError::BadSignature)
    }
}
