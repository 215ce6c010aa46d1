use crate::channel::PeerIdentity;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("message processed before the peer was authenticated")]
    UnauthenticatedPeer,

    #[error("no channel registered for peer {0}")]
    NoChannel(PeerIdentity),

    #[error("envelope requested on a session without a bound identity")]
    MissingIdentity,

    #[error("block {0} has no verification values left")]
    NoVerificationValuesLeft(String),

    #[error("peer {peer} failed verification of block {block_id}: {reason}")]
    VerificationFailed {
        block_id: String,
        peer: PeerIdentity,
        reason: String,
    },

    #[error("no recoverable backup index among {candidates} candidates")]
    NoRecoverableIndex { candidates: usize },

    #[error("block {block_id} could not be fetched from any known location")]
    UnrecoverableBlock { block_id: String },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("MAC verification failed")]
    MacMismatch,

    #[error("unknown user {0}")]
    UnknownUser(PeerIdentity),

    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("block content error: {0}")]
    Content(#[from] peerbackup_protocol::ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;
