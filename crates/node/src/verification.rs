//! Challenge-based verification of remote replicas.
//!
//! Every block owns a pool of one-shot [`VerificationValue`]s generated from the payload
//! as shipped to holders. At most one value per block is active. A round promotes a fresh
//! value for every due block and sends its challenge to all holders with a live channel.
//! Responses are scored against the pending record of that exact (block, peer, nonce).

use crate::channel::{ChannelRegistry, PeerIdentity};
use crate::config::VerificationConfig;
use crate::error::{BackupError, Result};
use crate::ledger::LocationLedger;
use crate::locks::KeyedLocks;
use crate::mac_stream::{self, MacKey};
use crate::pending::{random_nonce_hex, PendingKey, PendingTable};
use crate::store::{decode, encode, BackupStore, BlockStore};
use peerbackup_protocol::{
    BackupCommand, BlockFetchRequest, ChallengeRequest, ChallengeResponse, FetchPurpose,
};
use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sled::Tree;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

const CHALLENGE_LEN: usize = 16;
const RECENT_FAILURES: usize = 256;

/// A precomputed challenge and the hash an honest holder must answer with.
///
/// `active_until_ms` is set while the value is the block's active challenge. Values are
/// removed from the unused pool the moment they are promoted, so no value is ever
/// promoted twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationValue {
    pub id: String,
    pub block_id: String,
    pub expected_hash: Vec<u8>,
    pub active_until_ms: Option<u64>,
    pub dispatched: bool,
    pub retired: bool,
}

impl VerificationValue {
    pub fn generate(block_id: &str, payload: &[u8]) -> Self {
        let mut challenge = [0u8; CHALLENGE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        Self {
            id: hex::encode(challenge),
            block_id: block_id.to_string(),
            expected_hash: ChallengeResponse::compute_hash(&challenge, payload),
            active_until_ms: None,
            dispatched: false,
            retired: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_until_ms.is_some()
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.active_until_ms.is_some_and(|until| now_ms >= until)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    Expired,
    Missing,
    Mismatch,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "no response before deadline",
            Self::Expired => "challenge no longer active",
            Self::Missing => "holder reports block missing",
            Self::Mismatch => "response hash mismatch",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationOutcome {
    Confirmed,
    Failed(FailureReason),
    /// No pending record matched; the response was ignored.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentFailure {
    pub block_id: String,
    pub peer: PeerIdentity,
    pub reason: FailureReason,
    pub at_ms: u64,
}

impl RecentFailure {
    pub fn to_error(&self) -> BackupError {
        BackupError::VerificationFailed {
            block_id: self.block_id.clone(),
            peer: self.peer.clone(),
            reason: self.reason.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RoundReport {
    pub challenged: Vec<(String, PeerIdentity)>,
    pub replenished: Vec<String>,
    /// Blocks whose pool ran dry. Each is a `NoVerificationValuesLeft` condition.
    pub exhausted: Vec<String>,
    pub value_requests: Vec<(String, PeerIdentity)>,
    pub skipped_offline: usize,
}

#[derive(Debug, Default)]
pub struct VerificationHealth {
    pub blocks_below_replicas: Vec<String>,
    pub blocks_without_values: Vec<String>,
    pub recent_failures: Vec<RecentFailure>,
}

#[derive(Debug, Clone)]
struct PendingChallenge {
    challenge_id: String,
    expected_hash: Vec<u8>,
}

pub struct VerificationEngine {
    values: Tree,
    config: VerificationConfig,
    ledger: Arc<LocationLedger>,
    registry: Arc<ChannelRegistry>,
    blocks: Arc<BlockStore>,
    mac_key: MacKey,
    challenges: PendingTable<PendingChallenge>,
    value_fetches: PendingTable<()>,
    locks: KeyedLocks<String>,
    failures: Mutex<VecDeque<RecentFailure>>,
}

impl VerificationEngine {
    pub fn new(
        store: &BackupStore,
        config: VerificationConfig,
        ledger: Arc<LocationLedger>,
        registry: Arc<ChannelRegistry>,
        blocks: Arc<BlockStore>,
        mac_key: MacKey,
    ) -> Result<Self> {
        Ok(Self {
            values: store.tree("verification")?,
            config,
            ledger,
            registry,
            blocks,
            mac_key,
            challenges: PendingTable::new(),
            value_fetches: PendingTable::new(),
            locks: KeyedLocks::new(),
            failures: Mutex::new(VecDeque::new()),
        })
    }

    pub fn unused_count(&self, block_id: &str) -> Result<usize> {
        Ok(self.unused(block_id)?.len())
    }

    pub fn needs_replenish(&self, block_id: &str) -> Result<bool> {
        Ok(self.unused_count(block_id)? <= self.config.replenish_threshold)
    }

    /// Tops the unused pool up to `pool_size` from the payload as stored by holders.
    pub fn replenish(&self, block_id: &str, payload: &[u8]) -> Result<usize> {
        self.locks.with(&block_id.to_string(), || {
            let unused = self.unused(block_id)?.len();
            let missing = self.config.pool_size.saturating_sub(unused);
            for _ in 0..missing {
                self.put(&VerificationValue::generate(block_id, payload))?;
            }
            if missing > 0 {
                debug!(block = %block_id, generated = missing, "Verification values replenished");
            }
            Ok(missing)
        })
    }

    /// Current active value, if it is still within its window.
    pub fn active(&self, block_id: &str, now_ms: u64) -> Result<Option<VerificationValue>> {
        Ok(self
            .active_any(block_id)?
            .filter(|value| !value.is_expired(now_ms)))
    }

    /// Returns the unexpired active value, or retires the expired one and promotes the
    /// next unused value.
    pub fn activate(&self, block_id: &str, now_ms: u64) -> Result<VerificationValue> {
        self.locks.with(&block_id.to_string(), || {
            if let Some(active) = self.active_any(block_id)? {
                if !active.is_expired(now_ms) {
                    return Ok(active);
                }
                debug!(block = %block_id, value = %active.id, "Active verification value expired");
                self.remove(&active)?;
            }
            let Some(mut next) = self.unused(block_id)?.into_iter().next() else {
                return Err(BackupError::NoVerificationValuesLeft(block_id.to_string()));
            };
            self.remove(&next)?;
            next.active_until_ms = Some(now_ms.saturating_add(self.config.window_ms()));
            next.dispatched = false;
            self.put(&next)?;
            Ok(next)
        })
    }

    pub fn is_due(&self, block_id: &str, now_ms: u64) -> Result<bool> {
        Ok(match self.active_any(block_id)? {
            None => true,
            Some(active) => active.is_expired(now_ms) || !active.dispatched,
        })
    }

    /// One scheduled verification pass over every block with known holders.
    pub fn run_round(&self, now_ms: u64) -> Result<RoundReport> {
        let mut report = RoundReport::default();
        let blocks: Vec<_> = self
            .ledger
            .blocks()
            .filter_map(|block| match block {
                Ok(block) => Some(block),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable block record");
                    None
                }
            })
            .filter(|block| !block.is_orphaned())
            .collect();

        for block in blocks {
            let online: Vec<PeerIdentity> = block
                .locations
                .keys()
                .filter(|peer| self.registry.is_online(peer))
                .cloned()
                .collect();
            if online.is_empty() {
                report.skipped_offline += 1;
                continue;
            }
            if !self.is_due(&block.id, now_ms)? {
                continue;
            }

            let local = self.blocks.load(self.registry.local(), &block.id)?;
            if let Some(payload) = &local {
                if self.needs_replenish(&block.id)? && self.replenish(&block.id, payload)? > 0 {
                    report.replenished.push(block.id.clone());
                }
            }

            let value = match self.activate(&block.id, now_ms) {
                Ok(value) => value,
                Err(BackupError::NoVerificationValuesLeft(id)) => {
                    warn!(block = %id, "No verification values left");
                    report.exhausted.push(id.clone());
                    if local.is_none() {
                        if let Some(peer) = self.request_block_for_values(&id, &online, now_ms) {
                            report.value_requests.push((id, peer));
                        }
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            for peer in self.dispatch(&value, &online, now_ms)? {
                report.challenged.push((block.id.clone(), peer));
            }
        }

        info!(
            challenged = report.challenged.len(),
            exhausted = report.exhausted.len(),
            offline = report.skipped_offline,
            "Verification round finished"
        );
        Ok(report)
    }

    /// Sends the active challenge to `holders`. Holders without a channel are skipped
    /// and keep their location.
    pub fn dispatch(
        &self,
        value: &VerificationValue,
        holders: &[PeerIdentity],
        now_ms: u64,
    ) -> Result<Vec<PeerIdentity>> {
        let deadline = now_ms.saturating_add(self.config.response_timeout_ms());
        let mut sent = Vec::new();
        for peer in holders {
            let Ok(channel) = self.registry.get(peer) else {
                debug!(block = %value.block_id, peer = %peer, "Holder unreachable, skipped this round");
                continue;
            };
            let nonce_hex = random_nonce_hex();
            let command = BackupCommand::Challenge(ChallengeRequest {
                block_id: value.block_id.clone(),
                challenge_hex: value.id.clone(),
                nonce_hex: nonce_hex.clone(),
            });
            let key = PendingKey::new(&value.block_id, peer, &nonce_hex);
            self.challenges.insert(
                key.clone(),
                deadline,
                PendingChallenge {
                    challenge_id: value.id.clone(),
                    expected_hash: value.expected_hash.clone(),
                },
            );
            match channel.send(command) {
                Ok(()) => sent.push(peer.clone()),
                Err(e) => {
                    self.challenges.take(&key);
                    debug!(block = %value.block_id, peer = %peer, error = %e, "Challenge not sent");
                }
            }
        }
        if !sent.is_empty() {
            self.locks.with(&value.block_id, || -> Result<()> {
                if let Some(mut active) = self.active_any(&value.block_id)? {
                    if active.id == value.id {
                        active.dispatched = true;
                        self.put(&active)?;
                    }
                }
                Ok(())
            })?;
        }
        Ok(sent)
    }

    /// Scores a challenge response from an authenticated `peer`.
    pub fn handle_response(
        &self,
        peer: &PeerIdentity,
        response: &ChallengeResponse,
        now_ms: u64,
    ) -> Result<VerificationOutcome> {
        let key = PendingKey::new(&response.block_id, peer, &response.nonce_hex);
        let Some(pending) = self.challenges.take(&key) else {
            debug!(block = %response.block_id, peer = %peer, "Unsolicited challenge response ignored");
            return Ok(VerificationOutcome::Stale);
        };

        let outcome = if now_ms >= pending.deadline_ms {
            VerificationOutcome::Failed(FailureReason::Timeout)
        } else {
            self.score(&response.block_id, &pending.value, response, now_ms)?
        };
        self.apply(&response.block_id, peer, outcome, now_ms)?;
        Ok(outcome)
    }

    /// Fails every challenge whose deadline passed without a response.
    pub fn sweep(&self, now_ms: u64) -> Result<Vec<(String, PeerIdentity)>> {
        let mut timed_out = Vec::new();
        for (key, _) in self.challenges.expire(now_ms) {
            self.apply(
                &key.block_id,
                &key.peer,
                VerificationOutcome::Failed(FailureReason::Timeout),
                now_ms,
            )?;
            timed_out.push((key.block_id, key.peer));
        }
        for (key, _) in self.value_fetches.expire(now_ms) {
            debug!(block = %key.block_id, peer = %key.peer, "Block fetch for verification values timed out");
        }
        Ok(timed_out)
    }

    /// Handles a block delivered for regenerating verification values.
    pub fn handle_fetched_block(
        &self,
        peer: &PeerIdentity,
        block_id: &str,
        nonce_hex: &str,
        found: bool,
        payload: &[u8],
    ) -> Result<usize> {
        let key = PendingKey::new(block_id, peer, nonce_hex);
        if self.value_fetches.take(&key).is_none() {
            debug!(block = %block_id, peer = %peer, "Unrequested block for verification ignored");
            return Ok(0);
        }
        if !found {
            self.ledger.remove_location(block_id, peer)?;
            self.record_failure(block_id, peer, FailureReason::Missing, crate::now_ms());
            return Ok(0);
        }
        if let Err(e) = mac_stream::open(&self.mac_key, block_id, payload) {
            warn!(block = %block_id, peer = %peer, error = %e, "Holder returned a corrupt block");
            self.ledger.remove_location(block_id, peer)?;
            self.record_failure(block_id, peer, FailureReason::Mismatch, crate::now_ms());
            return Ok(0);
        }
        self.replenish(block_id, payload)
    }

    pub fn health(&self, min_replicas: usize, now_ms: u64) -> Result<VerificationHealth> {
        let blocks_below_replicas = self
            .ledger
            .blocks_needing_replication(min_replicas)
            .collect::<Result<Vec<_>>>()?;
        let mut blocks_without_values = Vec::new();
        for block in self.ledger.blocks() {
            let block = block?;
            if self.unused_count(&block.id)? == 0 && self.active(&block.id, now_ms)?.is_none() {
                blocks_without_values.push(block.id);
            }
        }
        let recent_failures = self.failures_lock().iter().cloned().collect();
        Ok(VerificationHealth {
            blocks_below_replicas,
            blocks_without_values,
            recent_failures,
        })
    }

    pub fn pending_challenges(&self) -> usize {
        self.challenges.len()
    }

    fn score(
        &self,
        block_id: &str,
        pending: &PendingChallenge,
        response: &ChallengeResponse,
        now_ms: u64,
    ) -> Result<VerificationOutcome> {
        self.locks.with(&block_id.to_string(), || {
            let active = self.active_any(block_id)?;
            let Some(mut active) = active.filter(|a| a.id == pending.challenge_id && !a.is_expired(now_ms)) else {
                return Ok(VerificationOutcome::Failed(FailureReason::Expired));
            };
            if !response.found {
                return Ok(VerificationOutcome::Failed(FailureReason::Missing));
            }
            let answered = hex::decode(&response.response_hash).unwrap_or_default();
            let echoed = response.challenge_hex.as_bytes().ct_eq(pending.challenge_id.as_bytes());
            let matches = answered.ct_eq(&pending.expected_hash) & echoed;
            if matches.unwrap_u8() != 1 {
                return Ok(VerificationOutcome::Failed(FailureReason::Mismatch));
            }
            if !active.retired {
                active.retired = true;
                self.put(&active)?;
            }
            Ok(VerificationOutcome::Confirmed)
        })
    }

    fn apply(
        &self,
        block_id: &str,
        peer: &PeerIdentity,
        outcome: VerificationOutcome,
        now_ms: u64,
    ) -> Result<()> {
        match outcome {
            VerificationOutcome::Confirmed => {
                self.ledger.mark_verified(block_id, peer, now_ms)?;
                debug!(block = %block_id, peer = %peer, "Location verified");
            }
            VerificationOutcome::Failed(reason) => {
                self.ledger.remove_location(block_id, peer)?;
                let failure = self.record_failure(block_id, peer, reason, now_ms);
                warn!(error = %failure.to_error(), "Location removed");
            }
            VerificationOutcome::Stale => {}
        }
        Ok(())
    }

    fn request_block_for_values(
        &self,
        block_id: &str,
        online: &[PeerIdentity],
        now_ms: u64,
    ) -> Option<PeerIdentity> {
        if self.value_fetches.contains_block(block_id) {
            return None;
        }
        let peer = online.choose(&mut rand::thread_rng())?.clone();
        let channel = self.registry.get(&peer).ok()?;
        let nonce_hex = random_nonce_hex();
        let command = BackupCommand::FetchBlock(BlockFetchRequest {
            block_id: block_id.to_string(),
            purpose: FetchPurpose::Verification,
            nonce_hex: nonce_hex.clone(),
        });
        if let Err(e) = channel.send(command) {
            warn!(block = %block_id, peer = %peer, error = %e, "Unable to request block for verification");
            return None;
        }
        self.value_fetches.insert(
            PendingKey::new(block_id, &peer, &nonce_hex),
            now_ms.saturating_add(self.config.response_timeout_ms()),
            (),
        );
        Some(peer)
    }

    fn record_failure(
        &self,
        block_id: &str,
        peer: &PeerIdentity,
        reason: FailureReason,
        at_ms: u64,
    ) -> RecentFailure {
        let failure = RecentFailure {
            block_id: block_id.to_string(),
            peer: peer.clone(),
            reason,
            at_ms,
        };
        let mut failures = self.failures_lock();
        if failures.len() == RECENT_FAILURES {
            failures.pop_front();
        }
        failures.push_back(failure.clone());
        failure
    }

    fn failures_lock(&self) -> std::sync::MutexGuard<'_, VecDeque<RecentFailure>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn values_of(&self, block_id: &str) -> Result<Vec<VerificationValue>> {
        self.values
            .scan_prefix(block_prefix(block_id))
            .values()
            .map(|raw| decode::<VerificationValue>(&raw?))
            .collect()
    }

    fn unused(&self, block_id: &str) -> Result<Vec<VerificationValue>> {
        Ok(self
            .values_of(block_id)?
            .into_iter()
            .filter(|v| !v.is_active())
            .collect())
    }

    fn active_any(&self, block_id: &str) -> Result<Option<VerificationValue>> {
        Ok(self.values_of(block_id)?.into_iter().find(|v| v.is_active()))
    }

    fn put(&self, value: &VerificationValue) -> Result<()> {
        self.values
            .insert(value_key(&value.block_id, &value.id), encode(value)?)?;
        Ok(())
    }

    fn remove(&self, value: &VerificationValue) -> Result<()> {
        self.values.remove(value_key(&value.block_id, &value.id))?;
        Ok(())
    }
}

fn block_prefix(block_id: &str) -> Vec<u8> {
    let mut prefix = block_id.as_bytes().to_vec();
    prefix.push(0);
    prefix
}

fn value_key(block_id: &str, value_id: &str) -> Vec<u8> {
    let mut key = block_prefix(block_id);
    key.extend_from_slice(value_id.as_bytes());
    key
}
