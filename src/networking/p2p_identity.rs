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

//! Persistent libp2p transport identity, separate from the consensus node
//! key: transport identity authenticates connections, the node key signs
//! protocol messages.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use libp2p::{identity, PeerId};
use thiserror::Error;

/// Identity persistence errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("io")]
    Io,
    #[error("decode")]
    Decode,
}

impl From<std::io::Error> for IdentityError {
    fn from(_: std::io::Error) -> Self {
        IdentityError::Io
    }
}

/// Load an existing Ed25519 keypair from `data_dir/transport.key`, or create
/// a new one and persist it. Returns (PeerId, Keypair).
pub fn load_or_create_identity(
    data_dir: impl AsRef<Path>,
) -> Result<(PeerId, identity::Keypair), IdentityError> {
    let dir = data_dir.as_ref();
    fs::create_dir_all(dir)?;

    let path: PathBuf = dir.join("transport.key");

    if path.exists() {
        let bytes = fs::read(&path)?;
        let kp =
            identity::Keypair::from_protobuf_encoding(&bytes).map_err(|_| IdentityError::Decode)?;
        let pid = PeerId::from(kp.public());
        return Ok((pid, kp));
    }

    let kp = identity::Keypair::generate_ed25519();
    let bytes = kp
        .to_protobuf_encoding()
        .map_err(|_| IdentityError::Decode)?;

    // Write to tmp then rename so a crash never leaves a half-written key.
    let tmp = dir.join("transport.key.tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, &path)?;

    let pid = PeerId::from(kp.public());
    Ok((pid, kp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _) = load_or_create_identity(dir.path()).unwrap();
        let (second, _) = load_or_create_identity(dir.path()).unwrap();
        assert_eq!(first, second);
    }
}
