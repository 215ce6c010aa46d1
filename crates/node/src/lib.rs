//! Peer-to-peer encrypted backup node.
//!
//! Blocks are MAC-framed, offered to trusted peers, verified periodically with one-time
//! challenges and fetched back when the local copy is lost.

pub mod channel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod mac_stream;
pub mod materialize;
pub mod p2p;
pub mod pending;
pub mod restore;
pub mod service;
pub mod store;
pub mod user;
pub mod verification;

pub use channel::{BindOutcome, Channel, ChannelId, ChannelRegistry, Direction, Outbound, PeerIdentity, Session};
pub use config::NodeConfig;
pub use envelope::Envelope;
pub use error::{BackupError, Result};
pub use mac_stream::MacKey;
pub use restore::{RecoveryEngine, RecoveryState, RestoreType};
pub use service::BackupService;
pub use store::{BackupStore, BlockStore};
pub use verification::VerificationEngine;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
