//! Block payload content.
//!
//! Every block that leaves a node is `bincode(BlockContent)` wrapped in a MAC frame.
//! Holders never look inside; only the owning node decodes it during recovery.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Block ids starting with this prefix carry a serialized [`BackupIndex`].
pub const INDEX_BLOCK_PREFIX: &str = "IDX_";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed block content: {0}")]
    Malformed(#[from] bincode::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootDirectoryRef {
    pub id: String,
    pub name: String,
}

/// Point-in-time snapshot of the whole backup index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupIndex {
    pub created_at_ms: u64,
    pub root_directories: Vec<RootDirectoryRef>,
    pub version_block_ids: Vec<String>,
}

/// One version of one file path. `block_ids` are the file's data blocks in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathVersionBlock {
    pub root_directory_id: String,
    pub path: String,
    pub version_ms: u64,
    pub deleted: bool,
    pub content_hash: Option<String>,
    pub block_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockContent {
    Data(Vec<u8>),
    PathVersion(PathVersionBlock),
    Index(BackupIndex),
}

impl BlockContent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

pub fn index_block_id(created_at_ms: u64) -> String {
    format!("{INDEX_BLOCK_PREFIX}{created_at_ms}")
}

pub fn is_index_block(block_id: &str) -> bool {
    block_id.starts_with(INDEX_BLOCK_PREFIX)
}
