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

//! Durable zone records and block persistence, backed by sled.
//!
//! A zone's record is the canonical encoding of the most recent proposal
//! that committed for it. A relinquished zone keeps its record with the
//! dereliction sentinel as owner.

use sled::Tree;
use thiserror::Error;

use crate::core::messages::{Proposal, MAX_PAYLOAD};
use crate::core::types::{decode_canonical_limited, CanonicalMap, NodeName};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("db open")]
    DbOpen,
    #[error("db io")]
    DbIo,
    #[error("stored record does not decode")]
    Corrupt,
}

/// Sled-backed zone and block store.
#[derive(Clone)]
pub struct ZoneStore {
    db: sled::Db,
    zones: Tree,
    blocks: Tree,
}

impl ZoneStore {
    /// Open (or create) the store under `path`.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|_| StoreError::DbOpen)?;
        Self::with_db(db)
    }

    /// In-memory store for tests and tooling.
    pub fn open_temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|_| StoreError::DbOpen)?;
        Self::with_db(db)
    }

    fn with_db(db: sled::Db) -> Result<Self, StoreError> {
        let zones = db.open_tree("zones").map_err(|_| StoreError::DbOpen)?;
        let blocks = db.open_tree("blocks").map_err(|_| StoreError::DbOpen)?;
        Ok(Self { db, zones, blocks })
    }

    /// Flush outstanding writes to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|_| StoreError::DbIo)?;
        Ok(())
    }

    /// Raw record bytes for a zone.
    pub fn get(&self, zone_name: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let v = self
            .zones
            .get(zone_name.as_bytes())
            .map_err(|_| StoreError::DbIo)?;
        Ok(v.map(|iv| iv.to_vec()))
    }

    /// Store the canonical record bytes for a zone.
    pub fn put(&self, zone_name: &str, record: &[u8]) -> Result<(), StoreError> {
        self.zones
            .insert(zone_name.as_bytes(), record)
            .map_err(|_| StoreError::DbIo)?;
        Ok(())
    }

    /// Remove a zone record outright.
    pub fn delete(&self, zone_name: &str) -> Result<(), StoreError> {
        self.zones
            .remove(zone_name.as_bytes())
            .map_err(|_| StoreError::DbIo)?;
        Ok(())
    }

    /// Decode the stored record for a zone.
    pub fn record(&self, zone_name: &str) -> Result<Option<Proposal>, StoreError> {
        match self.get(zone_name)? {
            None => Ok(None),
            Some(bytes) => decode_canonical_limited(&bytes, MAX_PAYLOAD)
                .map(Some)
                .map_err(|_| StoreError::Corrupt),
        }
    }

    /// The zone's current owner, if the zone resolves and has not been
    /// relinquished.
    pub fn live_owner(&self, zone_name: &str) -> Result<Option<NodeName>, StoreError> {
        Ok(self
            .record(zone_name)?
            .map(|p| p.owner)
            .filter(|owner| !owner.is_dereliction()))
    }

    /// The zone's current values, if the zone resolves.
    pub fn current_values(
        &self,
        zone_name: &str,
    ) -> Result<Option<CanonicalMap<String, String>>, StoreError> {
        Ok(self.record(zone_name)?.map(|p| p.values))
    }

    /// Append a sealed block's wire bytes at `height`.
    pub fn append_block(&self, height: u64, bytes: &[u8]) -> Result<(), StoreError> {
        self.blocks
            .insert(height.to_be_bytes(), bytes)
            .map_err(|_| StoreError::DbIo)?;
        Ok(())
    }

    /// Highest stored block, if any.
    pub fn last_block(&self) -> Result<Option<(u64, Vec<u8>)>, StoreError> {
        let last = self.blocks.last().map_err(|_| StoreError::DbIo)?;
        Ok(last.map(|(k, v)| {
            let mut height = [0u8; 8];
            height.copy_from_slice(&k);
            (u64::from_be_bytes(height), v.to_vec())
        }))
    }

    /// Number of stored blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::messages::OperationType;
    use crate::core::types::encode_canonical;

    fn record_for(owner: &str) -> Vec<u8> {
        let p = Proposal::unsigned(
            NodeName::new(owner),
            OperationType::Add,
            "example".to_string(),
            NodeName::new(owner),
            CanonicalMap::new(),
        );
        encode_canonical(&p).unwrap()
    }

    #[test]
    fn put_get_delete_round_trip() {
        let store = ZoneStore::open_temporary().unwrap();
        assert!(store.get("example").unwrap().is_none());

        let rec = record_for("alpha");
        store.put("example", &rec).unwrap();
        assert_eq!(store.get("example").unwrap().unwrap(), rec);

        store.delete("example").unwrap();
        assert!(store.get("example").unwrap().is_none());
    }

    #[test]
    fn live_owner_filters_dereliction() {
        let store = ZoneStore::open_temporary().unwrap();
        store.put("live", &record_for("alpha")).unwrap();
        assert_eq!(
            store.live_owner("live").unwrap(),
            Some(NodeName::new("alpha"))
        );

        let abandoned = Proposal::unsigned(
            NodeName::new("alpha"),
            OperationType::Del,
            "gone".to_string(),
            NodeName::dereliction(),
            CanonicalMap::new(),
        );
        store
            .put("gone", &encode_canonical(&abandoned).unwrap())
            .unwrap();
        assert_eq!(store.live_owner("gone").unwrap(), None);
        assert_eq!(store.live_owner("missing").unwrap(), None);
    }

    #[test]
    fn corrupt_record_is_an_error() {
        let store = ZoneStore::open_temporary().unwrap();
        store.put("bad", b"garbage").unwrap();
        assert!(matches!(store.record("bad"), Err(StoreError::Corrupt)));
    }

    #[test]
    fn block_persistence_orders_by_height() {
        let store = ZoneStore::open_temporary().unwrap();
        store.append_block(0, b"genesis").unwrap();
        store.append_block(1, b"next").unwrap();
        assert_eq!(store.block_count(), 2);
        let (height, bytes) = store.last_block().unwrap().unwrap();
        assert_eq!(height, 1);
        assert_eq!(bytes, b"next");
    }
}
