//! Block location ledger: which peers are believed to hold a replica of which block.
//!
//! Each block is one record in the `blocks` tree. Every mutation is a read-modify-write
//! under that block's lock, so a verification failure removing a location can never
//! overwrite a concurrent confirmation adding one.

use crate::channel::PeerIdentity;
use crate::error::Result;
use crate::locks::KeyedLocks;
use crate::now_ms;
use crate::store::{decode, encode, BackupStore};
use serde::{Deserialize, Serialize};
use sled::Tree;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRecord {
    pub recorded_at_ms: u64,
    pub verified_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetaData {
    pub id: String,
    pub hash: Option<String>,
    pub locations: BTreeMap<PeerIdentity, LocationRecord>,
}

impl BlockMetaData {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            hash: None,
            locations: BTreeMap::new(),
        }
    }

    /// A block without locations has to be re-replicated.
    pub fn is_orphaned(&self) -> bool {
        self.locations.is_empty()
    }
}

pub struct LocationLedger {
    tree: Tree,
    locks: KeyedLocks<String>,
}

impl LocationLedger {
    pub fn new(store: &BackupStore) -> Result<Self> {
        Ok(Self {
            tree: store.tree("blocks")?,
            locks: KeyedLocks::new(),
        })
    }

    pub fn get(&self, block_id: &str) -> Result<Option<BlockMetaData>> {
        match self.tree.get(block_id)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, block_id: &str) -> Result<bool> {
        Ok(self.tree.contains_key(block_id)?)
    }

    /// Creates the block record if needed. A content hash, once known, is never replaced
    /// by a different one.
    pub fn ensure_block(&self, block_id: &str, hash: Option<&str>) -> Result<BlockMetaData> {
        self.update(block_id, |block| {
            if let Some(hash) = hash {
                match &block.hash {
                    Some(existing) if existing != hash => {
                        warn!(block = %block_id, existing = %existing, offered = %hash, "Conflicting block hash ignored");
                    }
                    _ => block.hash = Some(hash.to_string()),
                }
            }
            block.clone()
        })
    }

    /// Idempotent. Returns true if the location was new.
    pub fn record_location(&self, block_id: &str, peer: &PeerIdentity) -> Result<bool> {
        let now = now_ms();
        self.update(block_id, |block| {
            if block.locations.contains_key(peer) {
                return false;
            }
            block.locations.insert(
                peer.clone(),
                LocationRecord {
                    recorded_at_ms: now,
                    verified_at_ms: None,
                },
            );
            true
        })
    }

    /// Idempotent. Returns true if a location was removed.
    pub fn remove_location(&self, block_id: &str, peer: &PeerIdentity) -> Result<bool> {
        let removed = self.update_existing(block_id, |block| block.locations.remove(peer).is_some())?;
        let removed = removed.unwrap_or(false);
        if removed {
            debug!(block = %block_id, peer = %peer, "Location removed");
        }
        Ok(removed)
    }

    pub fn mark_verified(&self, block_id: &str, peer: &PeerIdentity, at_ms: u64) -> Result<bool> {
        let marked = self.update_existing(block_id, |block| match block.locations.get_mut(peer) {
            Some(location) => {
                location.verified_at_ms = Some(at_ms);
                true
            }
            None => false,
        })?;
        Ok(marked.unwrap_or(false))
    }

    pub fn locations_for(&self, block_id: &str) -> Result<BTreeSet<PeerIdentity>> {
        Ok(self
            .get(block_id)?
            .map(|block| block.locations.into_keys().collect())
            .unwrap_or_default())
    }

    /// Blocks with fewer than `min_replicas` known locations, produced lazily.
    pub fn blocks_needing_replication(
        &self,
        min_replicas: usize,
    ) -> impl Iterator<Item = Result<String>> + '_ {
        self.blocks().filter_map(move |block| match block {
            Ok(block) if block.locations.len() < min_replicas => Some(Ok(block.id)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
    }

    pub fn blocks(&self) -> impl Iterator<Item = Result<BlockMetaData>> + '_ {
        self.tree
            .iter()
            .values()
            .map(|raw| decode::<BlockMetaData>(&raw?))
    }

    /// Drops `peer` from every block, e.g. when the user is removed.
    pub fn remove_peer(&self, peer: &PeerIdentity) -> Result<usize> {
        let mut removed = 0;
        let ids: Vec<String> = self
            .blocks()
            .filter_map(|block| block.ok())
            .filter(|block| block.locations.contains_key(peer))
            .map(|block| block.id)
            .collect();
        for id in ids {
            if self.remove_location(&id, peer)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn update<R>(&self, block_id: &str, f: impl FnOnce(&mut BlockMetaData) -> R) -> Result<R> {
        self.locks.with(&block_id.to_string(), || {
            let mut block = match self.tree.get(block_id)? {
                Some(raw) => decode(&raw)?,
                None => BlockMetaData::new(block_id),
            };
            let out = f(&mut block);
            self.tree.insert(block_id, encode(&block)?)?;
            Ok(out)
        })
    }

    fn update_existing<R>(
        &self,
        block_id: &str,
        f: impl FnOnce(&mut BlockMetaData) -> R,
    ) -> Result<Option<R>> {
        self.locks.with(&block_id.to_string(), || {
            let Some(raw) = self.tree.get(block_id)? else {
                return Ok(None);
            };
            let mut block: BlockMetaData = decode(&raw)?;
            let out = f(&mut block);
            self.tree.insert(block_id, encode(&block)?)?;
            Ok(Some(out))
        })
    }
}
