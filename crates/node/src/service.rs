//! The node's backup service: every component wired together behind the calls the
//! network layer makes.
//!
//! Inbound commands and replies arrive as [`Envelope`]s carrying the authenticated sender.
//! Commands are served from the held-block store on behalf of that sender only. Replies
//! are routed to the verification or recovery engine by type.

use crate::channel::{BindOutcome, Channel, ChannelId, ChannelRegistry, Outbound, PeerIdentity, Session};
use crate::config::{NodeConfig, UserConfig};
use crate::envelope::Envelope;
use crate::error::{BackupError, Result};
use crate::ledger::LocationLedger;
use crate::mac_stream::{self, MacKey};
use crate::materialize::{FsMaterializer, PathMaterializer};
use crate::pending::{PendingKey, PendingTable};
use crate::restore::{RecoveryEngine, RecoveryProgress, RecoveryState, TickReport};
use crate::store::{BackupStore, BlockStore};
use crate::user::{UserChange, UserDirectory};
use crate::verification::{RoundReport, VerificationEngine, VerificationHealth};
use dashmap::DashMap;
use peerbackup_protocol::{
    is_index_block, BackupCommand, BackupIndex, BackupReply, BlockContent, BlockFetchResponse,
    ChallengeResponse, DeleteBlockResponse, FetchPurpose, IndexBlock, IndexSnapshotResponse,
    StoreBlockRequest, StoreBlockResponse,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const REPLAY_WINDOW_MS: u64 = 10 * 60 * 1000;

pub struct BackupService {
    config: NodeConfig,
    store: BackupStore,
    registry: Arc<ChannelRegistry>,
    ledger: Arc<LocationLedger>,
    held: Arc<BlockStore>,
    users: UserDirectory,
    verification: VerificationEngine,
    recovery: RecoveryEngine,
    mac_key: MacKey,
    outbound: mpsc::UnboundedSender<Outbound>,
    replay_guard: Mutex<HashMap<String, u64>>,
    stores: PendingTable<()>,
    dial_attempts: DashMap<PeerIdentity, u64>,
}

impl BackupService {
    /// Opens every component on `store`. Commands for peers are queued on `outbound`.
    pub fn open(
        store: BackupStore,
        config: NodeConfig,
        local: PeerIdentity,
        mac_key: MacKey,
        max_held_bytes: u64,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Result<Self> {
        Self::open_with(
            store,
            config,
            local,
            mac_key,
            max_held_bytes,
            outbound,
            Box::new(FsMaterializer),
        )
    }

    pub fn open_with(
        store: BackupStore,
        config: NodeConfig,
        local: PeerIdentity,
        mac_key: MacKey,
        max_held_bytes: u64,
        outbound: mpsc::UnboundedSender<Outbound>,
        materializer: Box<dyn PathMaterializer>,
    ) -> Result<Self> {
        let registry = Arc::new(ChannelRegistry::new(local));
        let ledger = Arc::new(LocationLedger::new(&store)?);
        let held = Arc::new(BlockStore::open(&store, "held", max_held_bytes)?);
        let restoration = Arc::new(BlockStore::open(&store, "restoration", u64::MAX)?);
        let users = UserDirectory::new(&store)?;
        let verification = VerificationEngine::new(
            &store,
            config.verification.clone(),
            ledger.clone(),
            registry.clone(),
            held.clone(),
            mac_key.clone(),
        )?;
        let recovery = RecoveryEngine::new(
            &store,
            config.restore.clone(),
            ledger.clone(),
            registry.clone(),
            restoration,
            mac_key.clone(),
            materializer,
        )?;
        let changes = users.import(&config.users)?;
        if !changes.is_empty() {
            info!(changes = changes.len(), "Configured users imported");
        }
        Ok(Self {
            config,
            store,
            registry,
            ledger,
            held,
            users,
            verification,
            recovery,
            mac_key,
            outbound,
            replay_guard: Mutex::new(HashMap::new()),
            stores: PendingTable::new(),
            dial_attempts: DashMap::new(),
        })
    }

    pub fn local(&self) -> &PeerIdentity {
        self.registry.local()
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &LocationLedger {
        &self.ledger
    }

    pub fn users(&self) -> &UserDirectory {
        &self.users
    }

    pub fn verification(&self) -> &VerificationEngine {
        &self.verification
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Registers a freshly authenticated connection. While recovery is collecting index
    /// snapshots, new peers are asked for theirs too.
    pub fn on_connection(&self, session: Session, now_ms: u64) -> Result<BindOutcome> {
        let channel = Channel::open(session, self.local(), self.outbound.clone())?;
        let peer = channel.peer().clone();
        let outcome = self.registry.bind(channel);
        if outcome.is_bound() && self.recovery.state()? == Some(RecoveryState::Initialized) {
            self.recovery.request_snapshot(&peer, now_ms)?;
        }
        Ok(outcome)
    }

    pub fn on_disconnect(&self, channel: ChannelId) -> bool {
        self.registry.release(channel)
    }

    /// Serves a command from an authenticated peer. Failures become negative replies.
    pub fn handle_command(&self, envelope: Envelope<BackupCommand>, now_ms: u64) -> BackupReply {
        let (sender, command) = envelope.into_parts();
        let kind = command.kind();
        match self.serve(&sender, &command, now_ms) {
            Ok(reply) => {
                debug!(peer = %sender, command = kind, "Served command");
                reply
            }
            Err(e) => {
                warn!(peer = %sender, command = kind, error = %e, "Command refused");
                command.denied()
            }
        }
    }

    /// Routes a reply to the component that asked for it.
    pub fn handle_reply(&self, envelope: Envelope<BackupReply>, now_ms: u64) -> Result<()> {
        let (sender, reply) = envelope.into_parts();
        match reply {
            BackupReply::StoreBlock(response) => {
                let key = PendingKey::new(&response.block_id, &sender, "");
                if self.stores.take(&key).is_none() {
                    debug!(peer = %sender, block = %response.block_id, "Unrequested store receipt");
                } else if response.stored {
                    if self.ledger.record_location(&response.block_id, &sender)? {
                        self.recovery.location_discovered(&response.block_id, &sender)?;
                    }
                    debug!(peer = %sender, block = %response.block_id, "Replica stored");
                } else {
                    warn!(peer = %sender, block = %response.block_id, "Peer refused replica");
                }
            }
            BackupReply::Challenge(response) => {
                self.verification.handle_response(&sender, &response, now_ms)?;
            }
            BackupReply::FetchBlock(response) => match response.purpose {
                FetchPurpose::Restore => {
                    self.recovery.handle_block(&sender, &response)?;
                }
                FetchPurpose::Verification => {
                    self.verification.handle_fetched_block(
                        &sender,
                        &response.block_id,
                        &response.nonce_hex,
                        response.found,
                        &response.payload,
                    )?;
                }
            },
            BackupReply::IndexSnapshot(response) => {
                self.recovery.handle_index_snapshot(&sender, &response)?;
            }
            BackupReply::DeleteBlock(response) => {
                if response.deleted {
                    self.ledger.remove_location(&response.block_id, &sender)?;
                }
            }
        }
        Ok(())
    }

    /// Frames `content`, keeps a local copy and offers it to every connected user we back
    /// up to. Returns the peers asked to store it.
    pub fn backup_block(
        &self,
        block_id: &str,
        content: &BlockContent,
        now_ms: u64,
    ) -> Result<Vec<PeerIdentity>> {
        let framed = mac_stream::seal(&self.mac_key, block_id, &content.encode()?)?;
        if !self.held.save(self.local(), block_id, &framed)? {
            return Err(BackupError::QuotaExceeded);
        }
        let hash = hex::encode(Sha256::digest(&framed));
        self.ledger.ensure_block(block_id, Some(&hash))?;
        self.verification.replenish(block_id, &framed)?;

        let holders = self.ledger.locations_for(block_id)?;
        let deadline = now_ms.saturating_add(self.config.verification.response_timeout_ms());
        let mut asked = Vec::new();
        for peer in self.registry.online_peers() {
            if holders.contains(&peer) || !self.users.sends_data_to(&peer)? {
                continue;
            }
            let Ok(channel) = self.registry.get(&peer) else {
                continue;
            };
            let command = BackupCommand::StoreBlock(StoreBlockRequest {
                block_id: block_id.to_string(),
                payload: framed.clone(),
            });
            self.stores.insert(PendingKey::new(block_id, &peer, ""), deadline, ());
            if channel.send(command).is_ok() {
                asked.push(peer);
            }
        }
        debug!(block = %block_id, peers = asked.len(), "Block offered for backup");
        Ok(asked)
    }

    /// Writes `index` as an `IDX_` block so it can be found again after data loss.
    pub fn backup_index(&self, index: &BackupIndex, now_ms: u64) -> Result<Vec<PeerIdentity>> {
        let block_id = peerbackup_protocol::index_block_id(index.created_at_ms);
        self.backup_block(&block_id, &BlockContent::Index(index.clone()), now_ms)
    }

    pub fn verification_tick(&self, now_ms: u64) -> Result<RoundReport> {
        let timed_out = self.verification.sweep(now_ms)?;
        if !timed_out.is_empty() {
            debug!(count = timed_out.len(), "Challenges timed out");
        }
        for (key, ()) in self.stores.expire(now_ms) {
            let e = BackupError::Timeout(format!("store receipt for {}", key.block_id));
            debug!(peer = %key.peer, error = %e, "Replica not confirmed");
        }
        self.verification.run_round(now_ms)
    }

    pub fn health(&self, now_ms: u64) -> Result<VerificationHealth> {
        self.verification.health(self.config.min_replicas, now_ms)
    }

    pub fn begin_recovery(&self, now_ms: u64) -> Result<Vec<PeerIdentity>> {
        self.recovery.begin_recovery(now_ms)
    }

    pub fn start_recovery(&self, destination: &Path) -> Result<BackupIndex> {
        self.recovery.start_recovery(destination)
    }

    pub fn begin_restore(&self, root_id: &str, at_ms: u64, destination: &Path) -> Result<usize> {
        self.recovery.begin_restore(root_id, at_ms, destination)
    }

    pub fn restore_tick(&self, now_ms: u64) -> Result<TickReport> {
        self.recovery.restore_tick(now_ms)
    }

    pub fn progress(&self) -> Result<RecoveryProgress> {
        self.recovery.progress()
    }

    pub fn import_users(&self, configured: &[UserConfig]) -> Result<Vec<UserChange>> {
        let changes = self.users.import(configured)?;
        for change in &changes {
            self.apply_user_change(change)?;
        }
        Ok(changes)
    }

    /// Removes a user and everything we believed they held for us.
    pub fn remove_user(&self, id: &PeerIdentity) -> Result<Option<UserChange>> {
        let change = self.users.remove(id)?;
        if let Some(change) = &change {
            self.apply_user_change(change)?;
        }
        Ok(change)
    }

    pub fn apply_user_change(&self, change: &UserChange) -> Result<()> {
        match change {
            UserChange::Removed(user) => {
                let dropped = self.ledger.remove_peer(&user.id)?;
                info!(user = %user.id, locations = dropped, "Locations of removed user dropped");
            }
            UserChange::Changed { before, after }
                if before.allow_backup_data_to_user && !after.allow_backup_data_to_user =>
            {
                info!(user = %after.id, "User no longer receives our blocks");
            }
            UserChange::Added(_) | UserChange::Changed { .. } => {}
        }
        Ok(())
    }

    /// Known users without a live channel whose last dial attempt is older than the
    /// reconnect interval, with their addresses.
    pub fn reconnect_candidates(&self, now_ms: u64) -> Result<Vec<(PeerIdentity, Vec<String>)>> {
        let interval = self.config.network.reconnect_secs.saturating_mul(1000);
        let mut due = Vec::new();
        for user in self.users.list()? {
            if user.addresses.is_empty() || self.registry.is_online(&user.id) {
                continue;
            }
            let last = self.dial_attempts.get(&user.id).map(|t| *t);
            if last.is_some_and(|t| now_ms.saturating_sub(t) < interval) {
                continue;
            }
            self.dial_attempts.insert(user.id.clone(), now_ms);
            due.push((user.id, user.addresses.into_iter().collect()));
        }
        Ok(due)
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    fn serve(&self, sender: &PeerIdentity, command: &BackupCommand, now_ms: u64) -> Result<BackupReply> {
        let reply = match command {
            BackupCommand::StoreBlock(request) => {
                if !self.users.accepts_data_from(sender)? {
                    return Err(BackupError::UnknownUser(sender.clone()));
                }
                let stored = self.held.save(sender, &request.block_id, &request.payload)?;
                if !stored {
                    warn!(peer = %sender, block = %request.block_id, "Held block quota reached");
                }
                BackupReply::StoreBlock(StoreBlockResponse {
                    block_id: request.block_id.clone(),
                    stored,
                })
            }
            BackupCommand::Challenge(request) => {
                if !self.register_nonce(&request.block_id, &request.nonce_hex, now_ms) {
                    warn!(peer = %sender, block = %request.block_id, "Replayed challenge nonce");
                    return Ok(command.denied());
                }
                let payload = self.held.load(sender, &request.block_id)?;
                BackupReply::Challenge(ChallengeResponse::answer(request, payload.as_deref()))
            }
            BackupCommand::FetchBlock(request) => {
                let payload = self.held.load(sender, &request.block_id)?;
                BackupReply::FetchBlock(BlockFetchResponse {
                    block_id: request.block_id.clone(),
                    purpose: request.purpose,
                    nonce_hex: request.nonce_hex.clone(),
                    found: payload.is_some(),
                    payload: payload.unwrap_or_default(),
                })
            }
            BackupCommand::IndexSnapshot(request) => {
                let held_block_ids = self.held.block_ids(sender)?;
                let mut index_blocks = Vec::new();
                for block_id in held_block_ids.iter().filter(|id| is_index_block(id)) {
                    if let Some(payload) = self.held.load(sender, block_id)? {
                        index_blocks.push(IndexBlock {
                            block_id: block_id.clone(),
                            payload,
                        });
                    }
                }
                BackupReply::IndexSnapshot(IndexSnapshotResponse {
                    nonce_hex: request.nonce_hex.clone(),
                    held_block_ids,
                    index_blocks,
                })
            }
            BackupCommand::DeleteBlock(request) => BackupReply::DeleteBlock(DeleteBlockResponse {
                block_id: request.block_id.clone(),
                deleted: self.held.delete(sender, &request.block_id)?,
            }),
        };
        Ok(reply)
    }

    fn register_nonce(&self, block_id: &str, nonce_hex: &str, now_ms: u64) -> bool {
        let key = format!("{block_id}:{nonce_hex}");
        let mut seen = self.replay_guard.lock().unwrap_or_else(|e| e.into_inner());
        seen.retain(|_, at| now_ms.saturating_sub(*at) <= REPLAY_WINDOW_MS);
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now_ms);
        true
    }
}
