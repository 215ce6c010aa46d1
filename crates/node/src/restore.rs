//! Disaster recovery and restore.
//!
//! Recovery starts from nothing but the node identity: peers are asked for everything
//! they hold on our behalf, the newest consistent backup index is chosen, and blocks are
//! pulled back in two phases. Content-bearing blocks first (`RecoverData`), then the
//! remaining metadata (`RecoverMetadata`). Path versions reveal the data blocks of each
//! file, which are tracked as [`RestorePath`] missing sets until the file can be written.
//!
//! Ordinary restores of already-recovered path versions reuse the same tracking through
//! [`RecoveryEngine::begin_restore`].

use crate::channel::{ChannelRegistry, PeerIdentity};
use crate::config::RestoreConfig;
use crate::error::{BackupError, Result};
use crate::ledger::LocationLedger;
use crate::locks::KeyedLocks;
use crate::mac_stream::{self, MacKey};
use crate::materialize::PathMaterializer;
use crate::pending::{random_nonce_hex, PendingKey, PendingTable};
use crate::store::{decode, encode, BackupStore, BlockStore};
use peerbackup_protocol::{
    is_index_block, BackupCommand, BackupIndex, BlockContent, BlockFetchRequest,
    BlockFetchResponse, FetchPurpose, IndexSnapshotRequest, IndexSnapshotResponse,
    PathVersionBlock, INDEX_BLOCK_PREFIX,
};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sled::Tree;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const STATE_KEY: &[u8] = b"__meta:recovery_state";
const ROOTS_KEY: &[u8] = b"__meta:recovery_roots";

/// What a block is needed for. Ordered so that merging needs only ever moves upwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RestoreType {
    /// The block's data content.
    Restore,
    /// Only local metadata derived from the block.
    Recover,
    RecoverMetaDataAndRestoreData,
}

impl RestoreType {
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Restore, Self::Recover) | (Self::Recover, Self::Restore) => {
                Self::RecoverMetaDataAndRestoreData
            }
            _ => self.max(other),
        }
    }

    pub fn wants_content(self) -> bool {
        !matches!(self, Self::Recover)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryState {
    /// Index snapshots are being collected.
    Initialized,
    RecoverData,
    RecoverMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreBlockData {
    pub block_id: String,
    pub restore_type: RestoreType,
    /// Holders that already failed to deliver this block.
    pub tried: BTreeSet<PeerIdentity>,
    pub unrecoverable: bool,
}

impl RestoreBlockData {
    fn new(block_id: &str, restore_type: RestoreType) -> Self {
        Self {
            block_id: block_id.to_string(),
            restore_type,
            tried: BTreeSet::new(),
            unrecoverable: false,
        }
    }
}

/// One file path within one backup version, tracked until every data block is back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestorePath {
    pub id: String,
    pub root_directory_id: String,
    pub path: String,
    pub version_ms: u64,
    /// Directory the root is written to. Paths without one are tracked but never written.
    pub destination: Option<PathBuf>,
    pub block_ids: Vec<String>,
    pub missing: BTreeSet<String>,
    pub unrecoverable: BTreeSet<String>,
    pub materialized: bool,
}

impl RestorePath {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverRoot {
    pub id: String,
    pub name: String,
    pub destination: PathBuf,
}

#[derive(Debug, Default)]
pub struct SnapshotSummary {
    pub new_locations: usize,
    pub new_candidates: usize,
    pub rejected_index_blocks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// No fetch was outstanding for this reply.
    Stale,
    Missing,
    Corrupt,
    /// A path version was recorded and its children scheduled.
    Expanded { children: usize },
    /// Data stored; lists paths that became complete.
    Resolved { completed: Vec<String> },
    /// Received and consumed without further work.
    Dropped,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub state: Option<RecoveryState>,
    pub requested: Vec<(String, PeerIdentity)>,
    pub resolved_locally: Vec<String>,
    pub unrecoverable: Vec<String>,
    pub materialized: Vec<String>,
    pub finished: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryProgress {
    pub state: Option<RecoveryState>,
    pub total_paths: usize,
    pub complete_paths: usize,
    pub materialized_paths: usize,
    pub pending_paths: usize,
    pub pending_blocks: BTreeMap<RestoreType, usize>,
    pub in_flight: usize,
    pub unrecoverable: Vec<String>,
}

impl RecoveryProgress {
    /// True when some blocks could not be found anywhere.
    pub fn is_partial(&self) -> bool {
        !self.unrecoverable.is_empty()
    }

    pub fn unrecoverable_errors(&self) -> Vec<BackupError> {
        self.unrecoverable
            .iter()
            .map(|block_id| BackupError::UnrecoverableBlock {
                block_id: block_id.clone(),
            })
            .collect()
    }
}

enum FetchAttempt {
    Sent(PeerIdentity),
    /// Untried holders exist but none is connected right now.
    Deferred,
    Exhausted,
}

pub struct RecoveryEngine {
    entries: Tree,
    paths: Tree,
    path_index: Tree,
    versions: Tree,
    indexes: Tree,
    meta: Tree,
    config: RestoreConfig,
    ledger: Arc<LocationLedger>,
    registry: Arc<ChannelRegistry>,
    restoration: Arc<BlockStore>,
    mac_key: MacKey,
    materializer: Box<dyn PathMaterializer>,
    fetches: PendingTable<()>,
    snapshots: PendingTable<()>,
    block_locks: KeyedLocks<String>,
    path_locks: KeyedLocks<String>,
}

impl RecoveryEngine {
    pub fn new(
        store: &BackupStore,
        config: RestoreConfig,
        ledger: Arc<LocationLedger>,
        registry: Arc<ChannelRegistry>,
        restoration: Arc<BlockStore>,
        mac_key: MacKey,
        materializer: Box<dyn PathMaterializer>,
    ) -> Result<Self> {
        Ok(Self {
            entries: store.tree("restore_blocks")?,
            paths: store.tree("restore_paths")?,
            path_index: store.tree("path_index")?,
            versions: store.tree("path_versions")?,
            indexes: store.tree("indexes")?,
            meta: store.meta()?,
            config,
            ledger,
            registry,
            restoration,
            mac_key,
            materializer,
            fetches: PendingTable::new(),
            snapshots: PendingTable::new(),
            block_locks: KeyedLocks::new(),
            path_locks: KeyedLocks::new(),
        })
    }

    pub fn state(&self) -> Result<Option<RecoveryState>> {
        match self.meta.get(STATE_KEY)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn is_recovering(&self) -> Result<bool> {
        Ok(self.state()?.is_some())
    }

    /// Enters `Initialized` and asks every connected peer for an index snapshot.
    pub fn begin_recovery(&self, now_ms: u64) -> Result<Vec<PeerIdentity>> {
        self.set_state(Some(RecoveryState::Initialized))?;
        let mut asked = Vec::new();
        for peer in self.registry.online_peers() {
            if self.request_snapshot(&peer, now_ms)? {
                asked.push(peer);
            }
        }
        info!(peers = asked.len(), "Recovery initialized, index snapshots requested");
        Ok(asked)
    }

    /// Asks one peer for its snapshot. Also used for peers connecting while `Initialized`.
    pub fn request_snapshot(&self, peer: &PeerIdentity, now_ms: u64) -> Result<bool> {
        let Ok(channel) = self.registry.get(peer) else {
            return Ok(false);
        };
        let nonce_hex = random_nonce_hex();
        let key = PendingKey::new(INDEX_BLOCK_PREFIX, peer, &nonce_hex);
        self.snapshots.insert(
            key.clone(),
            now_ms.saturating_add(self.config.fetch_timeout_ms()),
            (),
        );
        if let Err(e) = channel.send(BackupCommand::IndexSnapshot(IndexSnapshotRequest { nonce_hex })) {
            self.snapshots.take(&key);
            debug!(peer = %peer, error = %e, "Index snapshot request not sent");
            return Ok(false);
        }
        Ok(true)
    }

    pub fn handle_index_snapshot(
        &self,
        peer: &PeerIdentity,
        response: &IndexSnapshotResponse,
    ) -> Result<SnapshotSummary> {
        let mut summary = SnapshotSummary::default();
        let key = PendingKey::new(INDEX_BLOCK_PREFIX, peer, &response.nonce_hex);
        if self.snapshots.take(&key).is_none() {
            debug!(peer = %peer, "Unsolicited index snapshot ignored");
            return Ok(summary);
        }
        let recovering = self.is_recovering()?;

        for block_id in &response.held_block_ids {
            if self.ledger.record_location(block_id, peer)? {
                summary.new_locations += 1;
                self.location_discovered(block_id, peer)?;
            }
            if recovering && !is_index_block(block_id) {
                self.upsert(block_id, RestoreType::Recover)?;
            }
        }

        for index_block in &response.index_blocks {
            match self.open_content(&index_block.block_id, &index_block.payload) {
                Ok(BlockContent::Index(index)) => {
                    if self.store_candidate(&index)? {
                        summary.new_candidates += 1;
                    }
                    if recovering {
                        for version_block in &index.version_block_ids {
                            self.upsert(version_block, RestoreType::Recover)?;
                        }
                    }
                }
                Ok(_) => {
                    warn!(peer = %peer, block = %index_block.block_id, "Index block carries other content");
                    summary.rejected_index_blocks += 1;
                }
                Err(e) => {
                    warn!(peer = %peer, block = %index_block.block_id, error = %e, "Index block failed verification");
                    self.ledger.remove_location(&index_block.block_id, peer)?;
                    summary.rejected_index_blocks += 1;
                }
            }
        }
        info!(
            peer = %peer,
            held = response.held_block_ids.len(),
            candidates = summary.new_candidates,
            "Index snapshot received"
        );
        Ok(summary)
    }

    /// Snapshot candidates, newest first.
    pub fn candidates(&self) -> Result<Vec<BackupIndex>> {
        let mut out = self
            .indexes
            .iter()
            .values()
            .map(|raw| decode::<BackupIndex>(&raw?))
            .collect::<Result<Vec<_>>>()?;
        out.reverse();
        Ok(out)
    }

    /// A usable snapshot names at least one root and every version block it lists has a
    /// known holder.
    pub fn is_valid(&self, index: &BackupIndex) -> Result<bool> {
        if index.root_directories.is_empty() {
            return Ok(false);
        }
        for block_id in &index.version_block_ids {
            if self.ledger.locations_for(block_id)?.is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Picks the newest valid snapshot and starts pulling its data back into
    /// `destination/<root name>`.
    pub fn start_recovery(&self, destination: &Path) -> Result<BackupIndex> {
        let candidates = self.candidates()?;
        let total = candidates.len();
        let mut chosen = None;
        for candidate in candidates {
            if self.is_valid(&candidate)? {
                chosen = Some(candidate);
                break;
            }
            debug!(created_at_ms = candidate.created_at_ms, "Index snapshot rejected");
        }
        let Some(index) = chosen else {
            error!(candidates = total, "No recoverable index among snapshots");
            return Err(BackupError::NoRecoverableIndex { candidates: total });
        };

        let roots: Vec<RecoverRoot> = index
            .root_directories
            .iter()
            .map(|root| RecoverRoot {
                id: root.id.clone(),
                name: root.name.clone(),
                destination: destination.join(root_dir_name(&root.name, &root.id)),
            })
            .collect();
        self.meta.insert(ROOTS_KEY, encode(&roots)?)?;

        for block_id in &index.version_block_ids {
            self.upsert(block_id, RestoreType::RecoverMetaDataAndRestoreData)?;
        }
        let chosen_key = index.created_at_ms.to_be_bytes();
        for key in self.indexes.iter().keys() {
            let key = key?;
            if *key != chosen_key[..] {
                self.indexes.remove(key)?;
            }
        }
        self.set_state(Some(RecoveryState::RecoverData))?;
        info!(
            created_at_ms = index.created_at_ms,
            roots = roots.len(),
            versions = index.version_block_ids.len(),
            "Recovery started from index snapshot"
        );
        Ok(index)
    }

    pub fn roots(&self) -> Result<Vec<RecoverRoot>> {
        match self.meta.get(ROOTS_KEY)? {
            Some(raw) => decode(&raw),
            None => Ok(Vec::new()),
        }
    }

    /// Starts restoring `root_id` as it was at `at_ms` into `destination`. Returns the number
    /// of paths scheduled.
    pub fn begin_restore(&self, root_id: &str, at_ms: u64, destination: &Path) -> Result<usize> {
        let mut newest: BTreeMap<String, PathVersionBlock> = BTreeMap::new();
        for raw in self.versions.scan_prefix(prefix(root_id)).values() {
            let version: PathVersionBlock = decode(&raw?)?;
            if version.version_ms > at_ms {
                continue;
            }
            match newest.get(&version.path) {
                Some(existing) if existing.version_ms >= version.version_ms => {}
                _ => {
                    newest.insert(version.path.clone(), version);
                }
            }
        }

        let mut scheduled = 0;
        let local = self.registry.local().clone();
        for version in newest.values().filter(|v| !v.deleted) {
            for block_id in &version.block_ids {
                if !self.restoration.contains(&local, block_id)? {
                    self.upsert(block_id, RestoreType::Restore)?;
                }
            }
            self.create_path(version, Some(destination.to_path_buf()))?;
            scheduled += 1;
        }
        info!(root = %root_id, at_ms, paths = scheduled, "Restore scheduled");
        Ok(scheduled)
    }

    /// One pass of the fetch loop.
    pub fn restore_tick(&self, now_ms: u64) -> Result<TickReport> {
        let mut report = TickReport::default();
        for (key, ()) in self.fetches.expire(now_ms) {
            debug!(block = %key.block_id, peer = %key.peer, "Block fetch timed out");
            self.mark_tried(&key.block_id, &key.peer)?;
        }
        self.snapshots.expire(now_ms);
        report.materialized = self.materialize_ready()?;

        let state = self.state()?;
        report.state = state;
        let content_only = match state {
            Some(RecoveryState::Initialized) => return Ok(report),
            Some(RecoveryState::RecoverData) => {
                if self.has_fetchable(true)? {
                    true
                } else {
                    info!("Recovered data blocks, moving on to metadata");
                    self.set_state(Some(RecoveryState::RecoverMetadata))?;
                    report.state = Some(RecoveryState::RecoverMetadata);
                    false
                }
            }
            Some(RecoveryState::RecoverMetadata) | None => false,
        };

        if report.state.is_some() && !self.has_fetchable(false)? && self.fetches.is_empty() {
            self.set_state(None)?;
            report.state = None;
            report.finished = true;
            let unrecoverable = self.unrecoverable()?;
            if unrecoverable.is_empty() {
                info!("Recovery finished");
            } else {
                warn!(unrecoverable = unrecoverable.len(), "Recovery finished with unrecoverable blocks");
            }
            return Ok(report);
        }

        let local = self.registry.local().clone();
        let batch: Vec<RestoreBlockData> = self
            .all_entries()?
            .into_iter()
            .filter(|e| !e.unrecoverable)
            .filter(|e| !content_only || e.restore_type.wants_content())
            .filter(|e| !self.fetches.contains_block(&e.block_id))
            .take(self.config.batch_size)
            .collect();

        for entry in batch {
            if entry.restore_type.wants_content()
                && self.restoration.contains(&local, &entry.block_id)?
            {
                self.resolve_data(&entry.block_id)?;
                self.drop_entry(&entry.block_id)?;
                report.resolved_locally.push(entry.block_id);
                continue;
            }
            match self.request_fetch(&entry, now_ms)? {
                FetchAttempt::Sent(peer) => report.requested.push((entry.block_id, peer)),
                FetchAttempt::Deferred => {}
                FetchAttempt::Exhausted => {
                    self.mark_unrecoverable(&entry.block_id)?;
                    report.unrecoverable.push(entry.block_id);
                }
            }
        }
        Ok(report)
    }

    /// Handles a block delivered for a restore fetch.
    pub fn handle_block(
        &self,
        peer: &PeerIdentity,
        response: &BlockFetchResponse,
    ) -> Result<BlockOutcome> {
        let block_id = response.block_id.as_str();
        let key = PendingKey::new(block_id, peer, &response.nonce_hex);
        if self.fetches.take(&key).is_none() {
            debug!(block = %block_id, peer = %peer, "Unrequested block ignored");
            return Ok(BlockOutcome::Stale);
        }
        if !response.found {
            debug!(block = %block_id, peer = %peer, "Holder no longer has block");
            self.ledger.remove_location(block_id, peer)?;
            self.mark_tried(block_id, peer)?;
            return Ok(BlockOutcome::Missing);
        }
        let content = match self.open_content(block_id, &response.payload) {
            Ok(content) => content,
            Err(e) => {
                warn!(block = %block_id, peer = %peer, error = %e, "Received block failed verification");
                self.ledger.remove_location(block_id, peer)?;
                self.mark_tried(block_id, peer)?;
                return Ok(BlockOutcome::Corrupt);
            }
        };

        let hash = hex::encode(Sha256::digest(&response.payload));
        self.ledger.ensure_block(block_id, Some(&hash))?;
        self.ledger.record_location(block_id, peer)?;

        let Some(entry) = self.entry(block_id)? else {
            return Ok(BlockOutcome::Dropped);
        };
        let outcome = match content {
            BlockContent::Index(index) => {
                self.store_candidate(&index)?;
                BlockOutcome::Dropped
            }
            BlockContent::PathVersion(version) => BlockOutcome::Expanded {
                children: self.expand(&entry, &version)?,
            },
            BlockContent::Data(bytes) if entry.restore_type.wants_content() => {
                if !self.restoration.save(self.registry.local(), block_id, &bytes)? {
                    return Err(BackupError::QuotaExceeded);
                }
                BlockOutcome::Resolved {
                    completed: self.resolve_data(block_id)?,
                }
            }
            BlockContent::Data(_) => BlockOutcome::Dropped,
        };
        self.drop_entry(block_id)?;
        Ok(outcome)
    }

    /// A holder newly known for `block_id` makes an unrecoverable block worth retrying.
    pub fn location_discovered(&self, block_id: &str, peer: &PeerIdentity) -> Result<()> {
        let was_unrecoverable = self.block_locks.with(&block_id.to_string(), || -> Result<bool> {
            let Some(mut entry) = self.entry(block_id)? else {
                return Ok(false);
            };
            let was = entry.unrecoverable;
            entry.tried.remove(peer);
            entry.unrecoverable = false;
            self.put_entry(&entry)?;
            Ok(was)
        })?;
        if was_unrecoverable {
            info!(block = %block_id, peer = %peer, "New location for unrecoverable block");
            for path_id in self.paths_for_block(block_id)? {
                self.update_path(&path_id, |path| {
                    path.unrecoverable.remove(block_id);
                })?;
            }
        }
        Ok(())
    }

    pub fn progress(&self) -> Result<RecoveryProgress> {
        let mut progress = RecoveryProgress {
            state: self.state()?,
            in_flight: self.fetches.len(),
            ..Default::default()
        };
        for path in self.all_paths()? {
            progress.total_paths += 1;
            if path.is_complete() {
                progress.complete_paths += 1;
            } else {
                progress.pending_paths += 1;
            }
            if path.materialized {
                progress.materialized_paths += 1;
            }
        }
        for entry in self.all_entries()? {
            if entry.unrecoverable {
                progress.unrecoverable.push(entry.block_id);
            } else {
                *progress.pending_blocks.entry(entry.restore_type).or_default() += 1;
            }
        }
        Ok(progress)
    }

    pub fn path(&self, path_id: &str) -> Result<Option<RestorePath>> {
        match self.paths.get(path_id)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn paths_under_root(&self, root_id: &str) -> Result<Vec<RestorePath>> {
        Ok(self
            .all_paths()?
            .into_iter()
            .filter(|path| path.root_directory_id == root_id)
            .collect())
    }

    pub fn entry(&self, block_id: &str) -> Result<Option<RestoreBlockData>> {
        match self.entries.get(block_id)? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// Recovered versions of one path, oldest first.
    pub fn versions_of(&self, root_id: &str, path: &str) -> Result<Vec<PathVersionBlock>> {
        let mut key = prefix(root_id);
        key.extend_from_slice(path.as_bytes());
        key.push(0);
        self.versions
            .scan_prefix(key)
            .values()
            .map(|raw| decode(&raw?))
            .collect()
    }

    /// Writes out every complete path that has not been written yet.
    pub fn materialize_ready(&self) -> Result<Vec<String>> {
        let mut written = Vec::new();
        let local = self.registry.local().clone();
        for path in self.all_paths()? {
            if !path.is_complete() || path.materialized {
                continue;
            }
            let Some(destination) = path.destination.clone() else {
                continue;
            };
            let mut content = Vec::with_capacity(path.block_ids.len());
            for block_id in &path.block_ids {
                match self.restoration.load(&local, block_id)? {
                    Some(bytes) => content.push(bytes),
                    None => {
                        warn!(path = %path.path, block = %block_id, "Restored block vanished before write");
                        break;
                    }
                }
            }
            if content.len() != path.block_ids.len() {
                continue;
            }
            match self.materializer.materialize(&path, &destination, &content) {
                Ok(target) => {
                    self.update_path(&path.id, |p| p.materialized = true)?;
                    info!(path = %path.path, target = %target.display(), "Path restored");
                    written.push(path.id);
                }
                Err(e) => warn!(path = %path.path, error = %e, "Unable to write restored path"),
            }
        }
        Ok(written)
    }

    fn expand(&self, entry: &RestoreBlockData, version: &PathVersionBlock) -> Result<usize> {
        self.record_version(version)?;
        if version.deleted {
            return Ok(0);
        }
        let local = self.registry.local().clone();
        let mut scheduled = 0;
        for child in &version.block_ids {
            if entry.restore_type.wants_content() && self.restoration.contains(&local, child)? {
                continue;
            }
            self.upsert(child, entry.restore_type)?;
            scheduled += 1;
        }
        if entry.restore_type == RestoreType::RecoverMetaDataAndRestoreData {
            let destination = self
                .roots()?
                .into_iter()
                .find(|root| root.id == version.root_directory_id)
                .map(|root| root.destination);
            self.create_path(version, destination)?;
        }
        Ok(scheduled)
    }

    fn create_path(&self, version: &PathVersionBlock, destination: Option<PathBuf>) -> Result<()> {
        let id = path_id(version);
        let local = self.registry.local().clone();
        self.path_locks.with(&id, || -> Result<()> {
            if self.paths.contains_key(&id)? {
                return Ok(());
            }
            // Index first, then check storage, so a block landing concurrently is seen by
            // one side or the other.
            for block_id in &version.block_ids {
                self.path_index.insert(index_key(block_id, &id), Vec::new())?;
            }
            let mut missing = BTreeSet::new();
            for block_id in &version.block_ids {
                if !self.restoration.contains(&local, block_id)? {
                    missing.insert(block_id.clone());
                }
            }
            let path = RestorePath {
                id: id.clone(),
                root_directory_id: version.root_directory_id.clone(),
                path: version.path.clone(),
                version_ms: version.version_ms,
                destination,
                block_ids: version.block_ids.clone(),
                missing,
                unrecoverable: BTreeSet::new(),
                materialized: false,
            };
            debug!(path = %path.path, missing = path.missing.len(), "Restore path created");
            self.paths.insert(id.as_bytes(), encode(&path)?)?;
            Ok(())
        })
    }

    /// Removes `block_id` from every path waiting on it. Returns paths that became complete.
    fn resolve_data(&self, block_id: &str) -> Result<Vec<String>> {
        let mut completed = Vec::new();
        for path_id in self.paths_for_block(block_id)? {
            let done = self
                .update_path(&path_id, |path| path.missing.remove(block_id) && path.is_complete())?
                .unwrap_or(false);
            self.path_index.remove(index_key(block_id, &path_id))?;
            if done {
                info!(path = %path_id, "Restore path complete");
                completed.push(path_id);
            }
        }
        Ok(completed)
    }

    fn request_fetch(&self, entry: &RestoreBlockData, now_ms: u64) -> Result<FetchAttempt> {
        let untried: Vec<PeerIdentity> = self
            .ledger
            .locations_for(&entry.block_id)?
            .into_iter()
            .filter(|peer| !entry.tried.contains(peer))
            .collect();
        if untried.is_empty() {
            return Ok(FetchAttempt::Exhausted);
        }
        let online: Vec<PeerIdentity> = untried
            .into_iter()
            .filter(|peer| self.registry.is_online(peer))
            .collect();
        let Some(peer) = online.choose(&mut rand::thread_rng()).cloned() else {
            return Ok(FetchAttempt::Deferred);
        };
        let Ok(channel) = self.registry.get(&peer) else {
            return Ok(FetchAttempt::Deferred);
        };
        let nonce_hex = random_nonce_hex();
        let key = PendingKey::new(&entry.block_id, &peer, &nonce_hex);
        self.fetches.insert(
            key.clone(),
            now_ms.saturating_add(self.config.fetch_timeout_ms()),
            (),
        );
        let command = BackupCommand::FetchBlock(BlockFetchRequest {
            block_id: entry.block_id.clone(),
            purpose: FetchPurpose::Restore,
            nonce_hex,
        });
        if let Err(e) = channel.send(command) {
            self.fetches.take(&key);
            debug!(block = %entry.block_id, peer = %peer, error = %e, "Block fetch not sent");
            return Ok(FetchAttempt::Deferred);
        }
        Ok(FetchAttempt::Sent(peer))
    }

    fn mark_tried(&self, block_id: &str, peer: &PeerIdentity) -> Result<()> {
        self.block_locks.with(&block_id.to_string(), || {
            if let Some(mut entry) = self.entry(block_id)? {
                if entry.tried.insert(peer.clone()) {
                    self.put_entry(&entry)?;
                }
            }
            Ok(())
        })
    }

    fn mark_unrecoverable(&self, block_id: &str) -> Result<()> {
        self.block_locks.with(&block_id.to_string(), || -> Result<()> {
            if let Some(mut entry) = self.entry(block_id)? {
                entry.unrecoverable = true;
                self.put_entry(&entry)?;
            }
            Ok(())
        })?;
        let paths = self.paths_for_block(block_id)?;
        for path_id in &paths {
            self.update_path(path_id, |path| {
                path.unrecoverable.insert(block_id.to_string());
            })?;
        }
        warn!(
            block = %block_id,
            paths = paths.len(),
            "{}",
            BackupError::UnrecoverableBlock { block_id: block_id.to_string() }
        );
        Ok(())
    }

    fn upsert(&self, block_id: &str, restore_type: RestoreType) -> Result<RestoreBlockData> {
        self.block_locks.with(&block_id.to_string(), || {
            let entry = match self.entry(block_id)? {
                Some(mut entry) => {
                    let merged = entry.restore_type.merge(restore_type);
                    if merged == entry.restore_type {
                        return Ok(entry);
                    }
                    entry.restore_type = merged;
                    entry
                }
                None => RestoreBlockData::new(block_id, restore_type),
            };
            self.put_entry(&entry)?;
            Ok(entry)
        })
    }

    fn drop_entry(&self, block_id: &str) -> Result<()> {
        self.block_locks.with(&block_id.to_string(), || {
            self.entries.remove(block_id)?;
            Ok(())
        })
    }

    fn put_entry(&self, entry: &RestoreBlockData) -> Result<()> {
        self.entries.insert(entry.block_id.as_bytes(), encode(entry)?)?;
        Ok(())
    }

    fn all_entries(&self) -> Result<Vec<RestoreBlockData>> {
        self.entries
            .iter()
            .values()
            .map(|raw| decode(&raw?))
            .collect()
    }

    fn has_fetchable(&self, content_only: bool) -> Result<bool> {
        Ok(self
            .all_entries()?
            .iter()
            .any(|e| !e.unrecoverable && (!content_only || e.restore_type.wants_content())))
    }

    fn unrecoverable(&self) -> Result<Vec<String>> {
        Ok(self
            .all_entries()?
            .into_iter()
            .filter(|e| e.unrecoverable)
            .map(|e| e.block_id)
            .collect())
    }

    fn all_paths(&self) -> Result<Vec<RestorePath>> {
        self.paths
            .iter()
            .values()
            .map(|raw| decode(&raw?))
            .collect()
    }

    fn update_path<R>(&self, path_id: &str, f: impl FnOnce(&mut RestorePath) -> R) -> Result<Option<R>> {
        self.path_locks.with(&path_id.to_string(), || {
            let Some(mut path) = self.path(path_id)? else {
                return Ok(None);
            };
            let out = f(&mut path);
            self.paths.insert(path_id.as_bytes(), encode(&path)?)?;
            Ok(Some(out))
        })
    }

    fn paths_for_block(&self, block_id: &str) -> Result<Vec<String>> {
        let key_prefix = prefix(block_id);
        self.path_index
            .scan_prefix(&key_prefix)
            .keys()
            .map(|key| {
                let key = key?;
                Ok(String::from_utf8_lossy(&key[key_prefix.len()..]).into_owned())
            })
            .collect()
    }

    fn record_version(&self, version: &PathVersionBlock) -> Result<bool> {
        let mut key = prefix(&version.root_directory_id);
        key.extend_from_slice(version.path.as_bytes());
        key.push(0);
        key.extend_from_slice(&version.version_ms.to_be_bytes());
        if self.versions.contains_key(&key)? {
            return Ok(false);
        }
        self.versions.insert(key, encode(version)?)?;
        Ok(true)
    }

    fn store_candidate(&self, index: &BackupIndex) -> Result<bool> {
        let key = index.created_at_ms.to_be_bytes();
        if self.indexes.contains_key(key)? {
            return Ok(false);
        }
        self.indexes.insert(key, encode(index)?)?;
        Ok(true)
    }

    fn open_content(&self, block_id: &str, framed: &[u8]) -> Result<BlockContent> {
        let body = mac_stream::open(&self.mac_key, block_id, framed)?;
        Ok(BlockContent::decode(&body)?)
    }

    fn set_state(&self, state: Option<RecoveryState>) -> Result<()> {
        match state {
            Some(state) => {
                self.meta.insert(STATE_KEY, encode(&state)?)?;
            }
            None => {
                self.meta.remove(STATE_KEY)?;
            }
        }
        Ok(())
    }
}

fn prefix(id: &str) -> Vec<u8> {
    let mut key = id.as_bytes().to_vec();
    key.push(0);
    key
}

fn index_key(block_id: &str, path_id: &str) -> Vec<u8> {
    let mut key = prefix(block_id);
    key.extend_from_slice(path_id.as_bytes());
    key
}

fn path_id(version: &PathVersionBlock) -> String {
    format!(
        "{}:{}@{}",
        version.root_directory_id, version.path, version.version_ms
    )
}

fn root_dir_name(name: &str, fallback: &str) -> String {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelId, Direction, Outbound, Session};
    use crate::materialize::FsMaterializer;
    use peerbackup_protocol::{index_block_id, IndexBlock, RootDirectoryRef};
    use tokio::sync::mpsc;

    const OWNER: &str = "owner";

    struct Harness {
        engine: RecoveryEngine,
        ledger: Arc<LocationLedger>,
        registry: Arc<ChannelRegistry>,
        restoration: Arc<BlockStore>,
        key: MacKey,
        rx: mpsc::UnboundedReceiver<Outbound>,
        tx: mpsc::UnboundedSender<Outbound>,
        dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let store = BackupStore::temporary().unwrap();
        let ledger = Arc::new(LocationLedger::new(&store).unwrap());
        let registry = Arc::new(ChannelRegistry::new(PeerIdentity::new(OWNER)));
        let restoration = Arc::new(BlockStore::open(&store, "restoration", u64::MAX).unwrap());
        let key = MacKey::derive(OWNER.as_bytes()).unwrap();
        let config = RestoreConfig {
            tick_secs: 1,
            fetch_timeout_secs: 1,
            batch_size: 100,
            discovery_secs: 1,
        };
        let engine = RecoveryEngine::new(
            &store,
            config,
            ledger.clone(),
            registry.clone(),
            restoration.clone(),
            key.clone(),
            Box::new(FsMaterializer),
        )
        .unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        Harness {
            engine,
            ledger,
            registry,
            restoration,
            key,
            rx,
            tx,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    impl Harness {
        fn connect(&self, peer: &str) {
            let mut session = Session::new(ChannelId::next(), Direction::Outbound);
            session.bind_identity(PeerIdentity::new(peer)).unwrap();
            let channel = Channel::open(session, self.registry.local(), self.tx.clone()).unwrap();
            self.registry.bind(channel);
        }

        fn frame(&self, block_id: &str, content: &BlockContent) -> Vec<u8> {
            mac_stream::seal(&self.key, block_id, &content.encode().unwrap()).unwrap()
        }

        fn drain(&mut self) -> Vec<Outbound> {
            let mut out = Vec::new();
            while let Ok(msg) = self.rx.try_recv() {
                out.push(msg);
            }
            out
        }

        fn fetch_requests(&mut self) -> Vec<(PeerIdentity, BlockFetchRequest)> {
            self.drain()
                .into_iter()
                .filter_map(|msg| match msg.command {
                    BackupCommand::FetchBlock(req) => Some((msg.peer, req)),
                    _ => None,
                })
                .collect()
        }

        fn snapshot_nonce(&mut self) -> String {
            self.drain()
                .into_iter()
                .find_map(|msg| match msg.command {
                    BackupCommand::IndexSnapshot(req) => Some(req.nonce_hex),
                    _ => None,
                })
                .unwrap()
        }

        fn deliver(
            &self,
            peer: &PeerIdentity,
            req: &BlockFetchRequest,
            payload: Option<Vec<u8>>,
        ) -> BlockOutcome {
            let response = BlockFetchResponse {
                block_id: req.block_id.clone(),
                purpose: req.purpose,
                nonce_hex: req.nonce_hex.clone(),
                found: payload.is_some(),
                payload: payload.unwrap_or_default(),
            };
            self.engine.handle_block(peer, &response).unwrap()
        }
    }

    fn index(created_at_ms: u64, roots: &[&str], versions: &[&str]) -> BackupIndex {
        BackupIndex {
            created_at_ms,
            root_directories: roots
                .iter()
                .map(|r| RootDirectoryRef {
                    id: r.to_string(),
                    name: format!("{r}-name"),
                })
                .collect(),
            version_block_ids: versions.iter().map(|v| v.to_string()).collect(),
        }
    }

    fn version(root: &str, path: &str, version_ms: u64, blocks: &[&str]) -> PathVersionBlock {
        PathVersionBlock {
            root_directory_id: root.into(),
            path: path.into(),
            version_ms,
            deleted: false,
            content_hash: None,
            block_ids: blocks.iter().map(|b| b.to_string()).collect(),
        }
    }

    #[test]
    fn restore_type_only_moves_up() {
        use RestoreType::*;
        assert_eq!(Restore.merge(Recover), RecoverMetaDataAndRestoreData);
        assert_eq!(Recover.merge(Restore), RecoverMetaDataAndRestoreData);
        assert_eq!(RecoverMetaDataAndRestoreData.merge(Restore), RecoverMetaDataAndRestoreData);
        assert_eq!(Restore.merge(Restore), Restore);
        assert!(Restore < Recover && Recover < RecoverMetaDataAndRestoreData);
    }

    #[test]
    fn full_recovery_of_one_root() {
        let mut h = harness();
        let p1 = PeerIdentity::new("p1");
        h.connect("p1");

        let idx = index(1_000, &["R1"], &["V1"]);
        let v1 = version("R1", "docs/a.txt", 900, &["C1", "C2"]);
        let v1_framed = h.frame("V1", &BlockContent::PathVersion(v1));
        let c1 = h.frame("C1", &BlockContent::Data(b"first half, ".to_vec()));
        let c2 = h.frame("C2", &BlockContent::Data(b"second half".to_vec()));

        assert_eq!(h.engine.begin_recovery(0).unwrap(), vec![p1.clone()]);
        let nonce_hex = h.snapshot_nonce();
        let idx_id = index_block_id(1_000);
        let summary = h
            .engine
            .handle_index_snapshot(
                &p1,
                &IndexSnapshotResponse {
                    nonce_hex,
                    held_block_ids: vec![idx_id.clone(), "V1".into(), "C1".into(), "C2".into()],
                    index_blocks: vec![IndexBlock {
                        block_id: idx_id,
                        payload: h.frame(
                            &index_block_id(1_000),
                            &BlockContent::Index(idx.clone()),
                        ),
                    }],
                },
            )
            .unwrap();
        assert_eq!(summary.new_candidates, 1);
        assert_eq!(h.engine.state().unwrap(), Some(RecoveryState::Initialized));
        assert!(h.engine.restore_tick(1).unwrap().requested.is_empty());

        let chosen = h.engine.start_recovery(h.dir.path()).unwrap();
        assert_eq!(chosen, idx);
        assert_eq!(h.engine.state().unwrap(), Some(RecoveryState::RecoverData));

        // Only the version block is content-bearing so far.
        h.engine.restore_tick(2).unwrap();
        let requests = h.fetch_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1.block_id, "V1");
        let outcome = h.deliver(&p1, &requests[0].1, Some(v1_framed));
        assert_eq!(outcome, BlockOutcome::Expanded { children: 2 });

        let paths = h.engine.paths_under_root("R1").unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].missing.len(), 2);

        h.engine.restore_tick(3).unwrap();
        let mut requests = h.fetch_requests();
        requests.sort_by(|a, b| a.1.block_id.cmp(&b.1.block_id));
        assert_eq!(requests.len(), 2);
        assert_eq!(
            h.deliver(&p1, &requests[0].1, Some(c1)),
            BlockOutcome::Resolved { completed: vec![] }
        );
        let BlockOutcome::Resolved { completed } = h.deliver(&p1, &requests[1].1, Some(c2)) else {
            panic!("expected resolution");
        };
        assert_eq!(completed, vec![paths[0].id.clone()]);
        assert!(h.engine.paths_under_root("R1").unwrap().iter().all(|p| p.is_complete()));

        let report = h.engine.restore_tick(4).unwrap();
        assert_eq!(report.materialized.len(), 1);
        let written = h.dir.path().join("R1-name").join("docs").join("a.txt");
        assert_eq!(std::fs::read(written).unwrap(), b"first half, second half");
        assert!(report.finished);
        assert_eq!(h.engine.state().unwrap(), None);

        let progress = h.engine.progress().unwrap();
        assert_eq!(progress.total_paths, 1);
        assert_eq!(progress.materialized_paths, 1);
        assert!(!progress.is_partial());
    }

    #[test]
    fn no_valid_snapshot_fails_recovery() {
        let mut h = harness();
        let p1 = PeerIdentity::new("p1");
        h.connect("p1");
        h.engine.begin_recovery(0).unwrap();
        let nonce_hex = h.snapshot_nonce();
        h.engine
            .handle_index_snapshot(
                &p1,
                &IndexSnapshotResponse {
                    nonce_hex,
                    held_block_ids: vec![],
                    index_blocks: vec![
                        IndexBlock {
                            block_id: index_block_id(1),
                            payload: h.frame(
                                &index_block_id(1),
                                &BlockContent::Index(index(1, &[], &[])),
                            ),
                        },
                        IndexBlock {
                            block_id: index_block_id(2),
                            payload: h.frame(
                                &index_block_id(2),
                                &BlockContent::Index(index(2, &["R1"], &["nowhere"])),
                            ),
                        },
                    ],
                },
            )
            .unwrap();
        let err = h.engine.start_recovery(h.dir.path()).unwrap_err();
        assert!(matches!(err, BackupError::NoRecoverableIndex { candidates: 2 }));
        assert_eq!(h.engine.state().unwrap(), Some(RecoveryState::Initialized));
    }

    #[test]
    fn newest_valid_snapshot_wins() {
        let mut h = harness();
        let p1 = PeerIdentity::new("p1");
        h.connect("p1");
        h.engine.begin_recovery(0).unwrap();
        let nonce_hex = h.snapshot_nonce();
        h.engine
            .handle_index_snapshot(
                &p1,
                &IndexSnapshotResponse {
                    nonce_hex,
                    held_block_ids: vec!["V-old".into()],
                    index_blocks: vec![
                        IndexBlock {
                            block_id: index_block_id(10),
                            payload: h.frame(
                                &index_block_id(10),
                                &BlockContent::Index(index(10, &["R"], &["V-old"])),
                            ),
                        },
                        IndexBlock {
                            block_id: index_block_id(20),
                            payload: h.frame(
                                &index_block_id(20),
                                &BlockContent::Index(index(20, &["R"], &["V-lost"])),
                            ),
                        },
                    ],
                },
            )
            .unwrap();
        assert_eq!(h.engine.candidates().unwrap().len(), 2);
        assert_eq!(h.engine.start_recovery(h.dir.path()).unwrap().created_at_ms, 10);
        assert_eq!(h.engine.candidates().unwrap().len(), 1);
    }

    #[test]
    fn forged_index_block_is_rejected() {
        let mut h = harness();
        let p1 = PeerIdentity::new("p1");
        h.connect("p1");
        h.engine.begin_recovery(0).unwrap();
        let nonce_hex = h.snapshot_nonce();
        let forged = mac_stream::seal(
            &MacKey::derive(b"someone else").unwrap(),
            &index_block_id(5),
            &BlockContent::Index(index(5, &["R"], &[])).encode().unwrap(),
        )
        .unwrap();
        let summary = h
            .engine
            .handle_index_snapshot(
                &p1,
                &IndexSnapshotResponse {
                    nonce_hex,
                    held_block_ids: vec![index_block_id(5)],
                    index_blocks: vec![IndexBlock {
                        block_id: index_block_id(5),
                        payload: forged,
                    }],
                },
            )
            .unwrap();
        assert_eq!(summary.rejected_index_blocks, 1);
        assert!(h.engine.candidates().unwrap().is_empty());
        assert!(h.ledger.locations_for(&index_block_id(5)).unwrap().is_empty());
    }

    #[test]
    fn exhausted_holders_mark_block_unrecoverable_until_rediscovered() {
        let mut h = harness();
        let p1 = PeerIdentity::new("p1");
        h.connect("p1");
        h.ledger.record_location("C1", &p1).unwrap();
        h.engine.record_version(&version("R", "f.bin", 5, &["C1"])).unwrap();
        h.engine.begin_restore("R", 10, h.dir.path()).unwrap();

        h.engine.restore_tick(0).unwrap();
        let (peer, req) = h.fetch_requests().remove(0);
        assert_eq!(h.deliver(&peer, &req, None), BlockOutcome::Missing);
        assert!(h.ledger.locations_for("C1").unwrap().is_empty());

        let report = h.engine.restore_tick(1).unwrap();
        assert_eq!(report.unrecoverable, vec!["C1".to_string()]);
        let progress = h.engine.progress().unwrap();
        assert!(progress.is_partial());
        assert_eq!(progress.pending_paths, 1);
        assert!(matches!(
            progress.unrecoverable_errors().as_slice(),
            [BackupError::UnrecoverableBlock { block_id }] if block_id == "C1"
        ));
        let path = &h.engine.paths_under_root("R").unwrap()[0];
        assert!(path.unrecoverable.contains("C1"));

        h.connect("p2");
        let p2 = PeerIdentity::new("p2");
        h.ledger.record_location("C1", &p2).unwrap();
        h.engine.location_discovered("C1", &p2).unwrap();
        assert!(!h.engine.progress().unwrap().is_partial());
        h.engine.restore_tick(2).unwrap();
        let (peer, req) = h.fetch_requests().remove(0);
        assert_eq!(peer, p2);
        let data = h.frame("C1", &BlockContent::Data(b"bytes".to_vec()));
        assert!(matches!(h.deliver(&peer, &req, Some(data)), BlockOutcome::Resolved { .. }));
        assert!(h.engine.paths_under_root("R").unwrap()[0].unrecoverable.is_empty());
    }

    #[test]
    fn offline_holder_defers_instead_of_failing() {
        let mut h = harness();
        h.ledger.record_location("C1", &PeerIdentity::new("away")).unwrap();
        h.engine.record_version(&version("R", "f", 1, &["C1"])).unwrap();
        h.engine.begin_restore("R", 1, h.dir.path()).unwrap();
        let report = h.engine.restore_tick(0).unwrap();
        assert!(report.requested.is_empty());
        assert!(report.unrecoverable.is_empty());
        assert!(h.drain().is_empty());
    }

    #[test]
    fn fetch_timeout_moves_to_next_holder() {
        let mut h = harness();
        h.connect("p1");
        h.connect("p2");
        h.ledger.record_location("C1", &PeerIdentity::new("p1")).unwrap();
        h.ledger.record_location("C1", &PeerIdentity::new("p2")).unwrap();
        h.engine.record_version(&version("R", "f", 1, &["C1"])).unwrap();
        h.engine.begin_restore("R", 1, h.dir.path()).unwrap();

        h.engine.restore_tick(0).unwrap();
        let (first, _) = h.fetch_requests().remove(0);
        // Deadline is one second out.
        h.engine.restore_tick(5_000).unwrap();
        let (second, _) = h.fetch_requests().remove(0);
        assert_ne!(first, second);
        assert!(h.engine.entry("C1").unwrap().unwrap().tried.contains(&first));
        // Timing out is not proof of loss.
        assert_eq!(h.ledger.locations_for("C1").unwrap().len(), 2);
    }

    #[test]
    fn corrupt_block_removes_location() {
        let mut h = harness();
        let p1 = PeerIdentity::new("p1");
        h.connect("p1");
        h.ledger.record_location("C1", &p1).unwrap();
        h.engine.record_version(&version("R", "f", 1, &["C1"])).unwrap();
        h.engine.begin_restore("R", 1, h.dir.path()).unwrap();
        h.engine.restore_tick(0).unwrap();
        let (peer, req) = h.fetch_requests().remove(0);
        assert_eq!(h.deliver(&peer, &req, Some(vec![0u8; 80])), BlockOutcome::Corrupt);
        assert!(h.ledger.locations_for("C1").unwrap().is_empty());
        assert_eq!(h.engine.paths_under_root("R").unwrap()[0].missing.len(), 1);
    }

    #[test]
    fn restore_picks_newest_version_not_after_cutoff() {
        let mut h = harness();
        h.connect("p1");
        h.ledger.record_location("old", &PeerIdentity::new("p1")).unwrap();
        h.ledger.record_location("new", &PeerIdentity::new("p1")).unwrap();
        h.engine.record_version(&version("R", "f", 10, &["old"])).unwrap();
        h.engine.record_version(&version("R", "f", 20, &["new"])).unwrap();
        let mut gone = version("R", "g", 15, &["x"]);
        gone.deleted = true;
        h.engine.record_version(&gone).unwrap();

        assert_eq!(h.engine.begin_restore("R", 15, h.dir.path()).unwrap(), 1);
        let paths = h.engine.paths_under_root("R").unwrap();
        assert_eq!(paths[0].version_ms, 10);
        assert_eq!(paths[0].block_ids, vec!["old".to_string()]);
        assert_eq!(h.engine.versions_of("R", "f").unwrap().len(), 2);
        h.drain();
    }

    #[test]
    fn blocks_already_restored_are_not_missing() {
        let h = harness();
        h.restoration
            .save(h.registry.local(), "shared", b"already here")
            .unwrap();
        h.engine.record_version(&version("R", "copy", 1, &["shared"])).unwrap();
        h.engine.begin_restore("R", 1, h.dir.path()).unwrap();
        let path = &h.engine.paths_under_root("R").unwrap()[0];
        assert!(path.is_complete());
        assert!(h.engine.entry("shared").unwrap().is_none());
        assert_eq!(h.engine.restore_tick(0).unwrap().materialized.len(), 1);
    }

    #[test]
    fn block_served_under_another_id_is_corrupt() {
        let mut h = harness();
        let p1 = PeerIdentity::new("p1");
        h.connect("p1");
        h.ledger.record_location("C1", &p1).unwrap();
        h.ledger.record_location("C2", &p1).unwrap();
        h.engine.record_version(&version("R", "f", 1, &["C1", "C2"])).unwrap();
        h.engine.begin_restore("R", 1, h.dir.path()).unwrap();
        h.engine.restore_tick(0).unwrap();
        let requests = h.fetch_requests();
        let (peer, req) = requests.iter().find(|(_, r)| r.block_id == "C1").unwrap();

        let swapped = h.frame("C2", &BlockContent::Data(b"second half".to_vec()));
        assert_eq!(h.deliver(peer, req, Some(swapped)), BlockOutcome::Corrupt);
        assert!(h.ledger.locations_for("C1").unwrap().is_empty());
        assert!(h.restoration.load(h.registry.local(), "C1").unwrap().is_none());
        let path = &h.engine.paths_under_root("R").unwrap()[0];
        assert!(path.missing.contains("C1"));
    }

    #[test]
    fn index_block_served_under_another_id_is_rejected() {
        let mut h = harness();
        let p1 = PeerIdentity::new("p1");
        h.connect("p1");
        h.engine.begin_recovery(0).unwrap();
        let nonce_hex = h.snapshot_nonce();
        let summary = h
            .engine
            .handle_index_snapshot(
                &p1,
                &IndexSnapshotResponse {
                    nonce_hex,
                    held_block_ids: vec![index_block_id(9)],
                    index_blocks: vec![IndexBlock {
                        block_id: index_block_id(9),
                        payload: h.frame(
                            &index_block_id(3),
                            &BlockContent::Index(index(3, &["R"], &[])),
                        ),
                    }],
                },
            )
            .unwrap();
        assert_eq!(summary.rejected_index_blocks, 1);
        assert!(h.engine.candidates().unwrap().is_empty());
    }

    #[test]
    fn missing_set_never_regrows() {
        let mut h = harness();
        let p1 = PeerIdentity::new("p1");
        h.connect("p1");
        h.ledger.record_location("C1", &p1).unwrap();
        let v = version("R", "f", 1, &["C1", "C2"]);
        h.ledger.record_location("C2", &p1).unwrap();
        h.engine.record_version(&v).unwrap();
        h.engine.begin_restore("R", 1, h.dir.path()).unwrap();
        h.engine.restore_tick(0).unwrap();
        let requests = h.fetch_requests();
        let (peer, req) = requests.iter().find(|(_, r)| r.block_id == "C1").unwrap();
        h.deliver(peer, req, Some(h.frame("C1", &BlockContent::Data(b"1".to_vec()))));

        // Scheduling the same version again leaves the tracked path alone.
        h.engine.begin_restore("R", 1, h.dir.path()).unwrap();
        let path = &h.engine.paths_under_root("R").unwrap()[0];
        assert_eq!(path.missing, BTreeSet::from(["C2".to_string()]));
    }
}
