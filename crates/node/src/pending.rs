use crate::channel::PeerIdentity;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Mutex;

/// Identifies one outstanding request: which block, which peer, which nonce.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub block_id: String,
    pub peer: PeerIdentity,
    pub nonce_hex: String,
}

impl PendingKey {
    pub fn new(block_id: &str, peer: &PeerIdentity, nonce_hex: &str) -> Self {
        Self {
            block_id: block_id.to_string(),
            peer: peer.clone(),
            nonce_hex: nonce_hex.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pending<V> {
    pub deadline_ms: u64,
    pub value: V,
}

/// Outstanding requests with explicit deadlines. Nothing stays here past its deadline
/// once [`PendingTable::expire`] has run.
pub struct PendingTable<V> {
    entries: Mutex<HashMap<PendingKey, Pending<V>>>,
}

impl<V: Clone> PendingTable<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: PendingKey, deadline_ms: u64, value: V) {
        self.lock().insert(key, Pending { deadline_ms, value });
    }

    /// Removes and returns the record matching a reply.
    pub fn take(&self, key: &PendingKey) -> Option<Pending<V>> {
        self.lock().remove(key)
    }

    /// Removes and returns every record whose deadline has passed.
    pub fn expire(&self, now_ms: u64) -> Vec<(PendingKey, V)> {
        let mut entries = self.lock();
        let expired: Vec<PendingKey> = entries
            .iter()
            .filter(|(_, p)| p.deadline_ms <= now_ms)
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| entries.remove(&k).map(|p| (k, p.value)))
            .collect()
    }

    pub fn contains_block(&self, block_id: &str) -> bool {
        self.lock().keys().any(|k| k.block_id == block_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PendingKey, Pending<V>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<V: Clone> Default for PendingTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

pub fn random_nonce_hex() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    hex::encode(nonce)
}
