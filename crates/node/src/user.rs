use crate::channel::PeerIdentity;
use crate::config::UserConfig;
use crate::error::{BackupError, Result};
use crate::locks::KeyedLocks;
use crate::store::{decode, encode, BackupStore};
use serde::{Deserialize, Serialize};
use sled::Tree;
use std::collections::BTreeSet;
use tracing::info;

/// A peer we exchange backup data with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: PeerIdentity,
    /// Protobuf-encoded public key, once seen on an authenticated connection.
    pub public_key: Option<Vec<u8>>,
    /// We hold blocks sent by this user.
    pub allow_backup_data_from_user: bool,
    /// We send our blocks to this user.
    pub allow_backup_data_to_user: bool,
    pub addresses: BTreeSet<String>,
}

impl User {
    pub fn new(id: PeerIdentity) -> Self {
        Self {
            id,
            public_key: None,
            allow_backup_data_from_user: false,
            allow_backup_data_to_user: false,
            addresses: BTreeSet::new(),
        }
    }
}

/// Result of a directory mutation, returned to the caller to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserChange {
    Added(User),
    Changed { before: User, after: User },
    Removed(User),
}

impl UserChange {
    pub fn user(&self) -> &User {
        match self {
            Self::Added(user) | Self::Removed(user) => user,
            Self::Changed { after, .. } => after,
        }
    }
}

pub struct UserDirectory {
    tree: Tree,
    locks: KeyedLocks<PeerIdentity>,
}

impl UserDirectory {
    pub fn new(store: &BackupStore) -> Result<Self> {
        Ok(Self {
            tree: store.tree("users")?,
            locks: KeyedLocks::new(),
        })
    }

    /// Inserts or replaces a user.
    pub fn add(&self, user: User) -> Result<UserChange> {
        let previous = self.tree.insert(user.id.as_str(), encode(&user)?)?;
        let change = match previous {
            Some(raw) => UserChange::Changed {
                before: decode(&raw)?,
                after: user,
            },
            None => {
                info!(user = %user.id, "User added");
                UserChange::Added(user)
            }
        };
        Ok(change)
    }

    pub fn get(&self, id: &PeerIdentity) -> Result<Option<User>> {
        match self.tree.get(id.as_str())? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn require(&self, id: &PeerIdentity) -> Result<User> {
        self.get(id)?
            .ok_or_else(|| BackupError::UnknownUser(id.clone()))
    }

    pub fn list(&self) -> Result<Vec<User>> {
        self.tree
            .iter()
            .values()
            .map(|raw| decode(&raw?))
            .collect()
    }

    pub fn set_trust(
        &self,
        id: &PeerIdentity,
        allow_from: bool,
        allow_to: bool,
    ) -> Result<Option<UserChange>> {
        self.modify(id, |user| {
            user.allow_backup_data_from_user = allow_from;
            user.allow_backup_data_to_user = allow_to;
        })
    }

    pub fn add_address(&self, id: &PeerIdentity, address: &str) -> Result<Option<UserChange>> {
        self.modify(id, |user| {
            user.addresses.insert(address.to_string());
        })
    }

    /// Records the key proven on a connection. A user's key never changes once set.
    pub fn bind_public_key(&self, id: &PeerIdentity, key: &[u8]) -> Result<Option<UserChange>> {
        self.modify(id, |user| {
            if user.public_key.is_none() {
                user.public_key = Some(key.to_vec());
            }
        })
    }

    pub fn remove(&self, id: &PeerIdentity) -> Result<Option<UserChange>> {
        match self.tree.remove(id.as_str())? {
            Some(raw) => {
                info!(user = %id, "User removed");
                Ok(Some(UserChange::Removed(decode(&raw)?)))
            }
            None => Ok(None),
        }
    }

    /// Merges configured users into the directory. Existing keys are kept.
    pub fn import(&self, configured: &[UserConfig]) -> Result<Vec<UserChange>> {
        let mut changes = Vec::new();
        for entry in configured {
            let id = PeerIdentity::new(entry.peer_id.clone());
            let mut user = self.get(&id)?.unwrap_or_else(|| User::new(id));
            user.allow_backup_data_from_user = entry.allow_backup_data_from_user;
            user.allow_backup_data_to_user = entry.allow_backup_data_to_user;
            user.addresses.extend(entry.addresses.iter().cloned());
            match self.add(user)? {
                UserChange::Changed { before, after } if before == after => {}
                change => changes.push(change),
            }
        }
        Ok(changes)
    }

    pub fn accepts_data_from(&self, id: &PeerIdentity) -> Result<bool> {
        Ok(self
            .get(id)?
            .is_some_and(|user| user.allow_backup_data_from_user))
    }

    pub fn sends_data_to(&self, id: &PeerIdentity) -> Result<bool> {
        Ok(self
            .get(id)?
            .is_some_and(|user| user.allow_backup_data_to_user))
    }

    fn modify(&self, id: &PeerIdentity, f: impl FnOnce(&mut User)) -> Result<Option<UserChange>> {
        self.locks.with(id, || {
            let before = self.require(id)?;
            let mut after = before.clone();
            f(&mut after);
            if after == before {
                return Ok(None);
            }
            self.tree.insert(id.as_str(), encode(&after)?)?;
            Ok(Some(UserChange::Changed { before, after }))
        })
    }
}
