use crate::channel::PeerIdentity;
use crate::error::{BackupError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    AeadCore, Aes256Gcm, Key, Nonce,
};
use serde::{de::DeserializeOwned, Serialize};
use sled::{Db, Tree};
use std::path::Path;
use tracing::info;

const ENCRYPTION_KEY: &[u8] = b"__meta:block_encryption_key";
const NONCE_LEN: usize = 12;

/// The node database. Every component works on its own named tree.
#[derive(Clone)]
pub struct BackupStore {
    db: Db,
}

impl BackupStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path)?;
        info!(path = %path.display(), "Backup database opened");
        Ok(Self { db })
    }

    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn tree(&self, name: &str) -> Result<Tree> {
        Ok(self.db.open_tree(name)?)
    }

    pub fn meta(&self) -> Result<Tree> {
        self.tree("meta")
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Block payloads keyed by owner and block id, sealed at rest with AES-256-GCM.
///
/// Used for blocks held on behalf of peers, for the local node's own blocks and for blocks
/// fetched back during a restore. Writes that would push the tree past `max_bytes` are
/// refused.
pub struct BlockStore {
    tree: Tree,
    meta: Tree,
    used_key: String,
    max_bytes: u64,
    cipher: Aes256Gcm,
}

impl BlockStore {
    pub fn open(store: &BackupStore, name: &str, max_bytes: u64) -> Result<Self> {
        let tree = store.tree(name)?;
        let meta = store.meta()?;
        let cipher = load_or_create_cipher(&meta)?;
        let used_key = format!("__meta:used_bytes:{name}");
        let used = read_used_bytes(&meta, &used_key)?;
        info!(tree = name, max_bytes, used_bytes = used, "Block store ready");
        Ok(Self {
            tree,
            meta,
            used_key,
            max_bytes,
            cipher,
        })
    }

    /// Returns `Ok(false)` when the quota would be exceeded.
    pub fn save(&self, owner: &PeerIdentity, block_id: &str, payload: &[u8]) -> Result<bool> {
        let key = block_key(owner, block_id);
        let sealed = self.seal(&key, payload)?;
        let existing_len = self.tree.get(&key)?.map(|v| v.len() as u64).unwrap_or(0);
        let used = read_used_bytes(&self.meta, &self.used_key)?;
        let projected = used
            .saturating_sub(existing_len)
            .saturating_add(sealed.len() as u64);
        if projected > self.max_bytes {
            return Ok(false);
        }
        self.tree.insert(key, sealed)?;
        write_used_bytes(&self.meta, &self.used_key, projected)?;
        Ok(true)
    }

    pub fn load(&self, owner: &PeerIdentity, block_id: &str) -> Result<Option<Vec<u8>>> {
        let key = block_key(owner, block_id);
        match self.tree.get(&key)? {
            Some(sealed) => Ok(Some(self.unseal(&key, &sealed)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, owner: &PeerIdentity, block_id: &str) -> Result<bool> {
        Ok(self.tree.contains_key(block_key(owner, block_id))?)
    }

    pub fn delete(&self, owner: &PeerIdentity, block_id: &str) -> Result<bool> {
        let Some(v) = self.tree.remove(block_key(owner, block_id))? else {
            return Ok(false);
        };
        let used = read_used_bytes(&self.meta, &self.used_key)?;
        write_used_bytes(&self.meta, &self.used_key, used.saturating_sub(v.len() as u64))?;
        Ok(true)
    }

    /// Ids of every block stored for `owner`.
    pub fn block_ids(&self, owner: &PeerIdentity) -> Result<Vec<String>> {
        let prefix = owner_prefix(owner);
        self.tree
            .scan_prefix(&prefix)
            .keys()
            .map(|key| {
                let key = key?;
                Ok(String::from_utf8_lossy(&key[prefix.len()..]).into_owned())
            })
            .collect()
    }

    pub fn used_bytes(&self) -> Result<u64> {
        read_used_bytes(&self.meta, &self.used_key)
    }

    fn seal(&self, aad: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, Payload { msg: payload, aad })
            .map_err(|e| BackupError::Crypto(e.to_string()))?;
        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn unseal(&self, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(BackupError::Crypto("sealed block too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|e| BackupError::Crypto(e.to_string()))
    }
}

fn owner_prefix(owner: &PeerIdentity) -> Vec<u8> {
    let mut prefix = owner.as_str().as_bytes().to_vec();
    prefix.push(0);
    prefix
}

fn block_key(owner: &PeerIdentity, block_id: &str) -> Vec<u8> {
    let mut key = owner_prefix(owner);
    key.extend_from_slice(block_id.as_bytes());
    key
}

fn load_or_create_cipher(meta: &Tree) -> Result<Aes256Gcm> {
    if let Some(bytes) = meta.get(ENCRYPTION_KEY)? {
        if bytes.len() == 32 {
            return Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes)));
        }
    }
    let key = Aes256Gcm::generate_key(OsRng);
    // Another tree may have raced us here; whoever wins defines the key.
    match meta.compare_and_swap(ENCRYPTION_KEY, None as Option<&[u8]>, Some(key.as_slice()))? {
        Ok(()) => Ok(Aes256Gcm::new(&key)),
        Err(conflict) => match conflict.current {
            Some(bytes) if bytes.len() == 32 => {
                Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes)))
            }
            _ => Err(BackupError::Crypto("corrupt block encryption key".into())),
        },
    }
}

fn read_used_bytes(meta: &Tree, key: &str) -> Result<u64> {
    let Some(v) = meta.get(key)? else {
        return Ok(0);
    };
    if v.len() != 8 {
        return Ok(0);
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&v);
    Ok(u64::from_le_bytes(arr))
}

fn write_used_bytes(meta: &Tree, key: &str, bytes: u64) -> Result<()> {
    meta.insert(key, bytes.to_le_bytes().to_vec())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> PeerIdentity {
        PeerIdentity::new("12D3KooWowner")
    }

    #[test]
    fn save_load_delete() {
        let store = BackupStore::temporary().unwrap();
        let blocks = BlockStore::open(&store, "held", u64::MAX).unwrap();
        assert!(blocks.save(&owner(), "b1", b"hello").unwrap());
        assert_eq!(blocks.load(&owner(), "b1").unwrap().unwrap(), b"hello");
        assert!(blocks.load(&PeerIdentity::new("other"), "b1").unwrap().is_none());
        assert!(blocks.delete(&owner(), "b1").unwrap());
        assert!(!blocks.delete(&owner(), "b1").unwrap());
        assert_eq!(blocks.used_bytes().unwrap(), 0);
    }

    #[test]
    fn payload_is_not_stored_in_clear() {
        let store = BackupStore::temporary().unwrap();
        let blocks = BlockStore::open(&store, "held", u64::MAX).unwrap();
        blocks.save(&owner(), "b1", b"plaintext marker").unwrap();
        let raw = store.tree("held").unwrap().get(block_key(&owner(), "b1")).unwrap().unwrap();
        assert!(!raw.windows(16).any(|w| w == b"plaintext marker"));
    }

    #[test]
    fn quota_is_enforced() {
        let store = BackupStore::temporary().unwrap();
        let blocks = BlockStore::open(&store, "held", 100).unwrap();
        assert!(blocks.save(&owner(), "small", &[0u8; 40]).unwrap());
        assert!(!blocks.save(&owner(), "big", &[0u8; 80]).unwrap());
        assert!(blocks.load(&owner(), "big").unwrap().is_none());
    }

    #[test]
    fn block_ids_are_listed_per_owner() {
        let store = BackupStore::temporary().unwrap();
        let blocks = BlockStore::open(&store, "held", u64::MAX).unwrap();
        blocks.save(&owner(), "a", b"1").unwrap();
        blocks.save(&owner(), "IDX_1", b"2").unwrap();
        blocks.save(&PeerIdentity::new("other"), "c", b"3").unwrap();
        let mut ids = blocks.block_ids(&owner()).unwrap();
        ids.sort();
        assert_eq!(ids, vec!["IDX_1".to_string(), "a".to_string()]);
    }

    #[test]
    fn trees_share_one_encryption_key() {
        let store = BackupStore::temporary().unwrap();
        let held = BlockStore::open(&store, "held", u64::MAX).unwrap();
        held.save(&owner(), "b", b"x").unwrap();
        let reopened = BlockStore::open(&store, "held", u64::MAX).unwrap();
        let _other = BlockStore::open(&store, "restoration", u64::MAX).unwrap();
        assert_eq!(reopened.load(&owner(), "b").unwrap().unwrap(), b"x");
    }
}
