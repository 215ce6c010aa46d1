use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

pub mod content;

pub use content::{
    index_block_id, is_index_block, BackupIndex, BlockContent, PathVersionBlock, ProtocolError,
    RootDirectoryRef, INDEX_BLOCK_PREFIX,
};

pub const BLOCK_PROTOCOL: &str = "/peerbackup/block/1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreBlockRequest {
    pub block_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreBlockResponse {
    pub block_id: String,
    pub stored: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeRequest {
    pub block_id: String,
    pub challenge_hex: String,
    pub nonce_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub block_id: String,
    pub challenge_hex: String,
    pub nonce_hex: String,
    pub found: bool,
    pub response_hash: String,
}

/// Why a block is being fetched. Echoed back so the requester can route the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchPurpose {
    Restore,
    Verification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockFetchRequest {
    pub block_id: String,
    pub purpose: FetchPurpose,
    pub nonce_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockFetchResponse {
    pub block_id: String,
    pub purpose: FetchPurpose,
    pub nonce_hex: String,
    pub found: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshotRequest {
    pub nonce_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexBlock {
    pub block_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshotResponse {
    pub nonce_hex: String,
    pub held_block_ids: Vec<String>,
    pub index_blocks: Vec<IndexBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteBlockRequest {
    pub block_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteBlockResponse {
    pub block_id: String,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackupCommand {
    StoreBlock(StoreBlockRequest),
    Challenge(ChallengeRequest),
    FetchBlock(BlockFetchRequest),
    IndexSnapshot(IndexSnapshotRequest),
    DeleteBlock(DeleteBlockRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BackupReply {
    StoreBlock(StoreBlockResponse),
    Challenge(ChallengeResponse),
    FetchBlock(BlockFetchResponse),
    IndexSnapshot(IndexSnapshotResponse),
    DeleteBlock(DeleteBlockResponse),
}

impl BackupCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StoreBlock(_) => "store-block",
            Self::Challenge(_) => "challenge",
            Self::FetchBlock(_) => "fetch-block",
            Self::IndexSnapshot(_) => "index-snapshot",
            Self::DeleteBlock(_) => "delete-block",
        }
    }

    /// The negative reply sent to peers that are not allowed to issue this command.
    pub fn denied(&self) -> BackupReply {
        match self {
            Self::StoreBlock(req) => BackupReply::StoreBlock(StoreBlockResponse {
                block_id: req.block_id.clone(),
                stored: false,
            }),
            Self::Challenge(req) => BackupReply::Challenge(ChallengeResponse {
                block_id: req.block_id.clone(),
                challenge_hex: req.challenge_hex.clone(),
                nonce_hex: req.nonce_hex.clone(),
                found: false,
                response_hash: String::new(),
            }),
            Self::FetchBlock(req) => BackupReply::FetchBlock(BlockFetchResponse {
                block_id: req.block_id.clone(),
                purpose: req.purpose,
                nonce_hex: req.nonce_hex.clone(),
                found: false,
                payload: Vec::new(),
            }),
            Self::IndexSnapshot(req) => BackupReply::IndexSnapshot(IndexSnapshotResponse {
                nonce_hex: req.nonce_hex.clone(),
                held_block_ids: Vec::new(),
                index_blocks: Vec::new(),
            }),
            Self::DeleteBlock(req) => BackupReply::DeleteBlock(DeleteBlockResponse {
                block_id: req.block_id.clone(),
                deleted: false,
            }),
        }
    }
}

impl ChallengeResponse {
    /// SHA-512 over the challenge bytes followed by the block payload as stored.
    pub fn compute_hash(challenge: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut hasher = Sha512::new();
        hasher.update(challenge);
        hasher.update(payload);
        hasher.finalize().to_vec()
    }

    pub fn answer(request: &ChallengeRequest, payload: Option<&[u8]>) -> Self {
        let challenge = hex::decode(&request.challenge_hex).ok();
        let response_hash = match (challenge, payload) {
            (Some(challenge), Some(payload)) => hex::encode(Self::compute_hash(&challenge, payload)),
            _ => String::new(),
        };
        Self {
            block_id: request.block_id.clone(),
            challenge_hex: request.challenge_hex.clone(),
            nonce_hex: request.nonce_hex.clone(),
            found: !response_hash.is_empty(),
            response_hash,
        }
    }
}
