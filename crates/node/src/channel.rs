//! Identity and channel registry.
//!
//! A [`Session`] is created for every connection and only gains an identity once the
//! transport handshake has authenticated the remote key. Authenticated sessions become
//! [`Channel`]s, and the [`ChannelRegistry`] keeps at most one live channel per peer.

use crate::error::{BackupError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use peerbackup_protocol::BackupCommand;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Stable peer identifier taken from the authenticated transport key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity(String);

impl PeerIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&libp2p::PeerId> for PeerIdentity {
    fn from(peer: &libp2p::PeerId) -> Self {
        Self(peer.to_base58())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed the peer.
    Outbound,
    /// The peer dialed us.
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl ChannelId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// A command queued for delivery on a channel.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub channel: ChannelId,
    pub peer: PeerIdentity,
    pub command: BackupCommand,
}

/// Per-connection context passed to every handling step.
#[derive(Debug, Clone)]
pub struct Session {
    channel: ChannelId,
    direction: Direction,
    identity: Option<PeerIdentity>,
}

impl Session {
    pub fn new(channel: ChannelId, direction: Direction) -> Self {
        Self {
            channel,
            direction,
            identity: None,
        }
    }

    /// Binds the identity proven by the handshake. An identity cannot change once bound.
    pub fn bind_identity(&mut self, identity: PeerIdentity) -> Result<()> {
        match &self.identity {
            Some(bound) if *bound != identity => Err(BackupError::UnauthenticatedPeer),
            _ => {
                self.identity = Some(identity);
                Ok(())
            }
        }
    }

    pub fn identity(&self) -> Result<&PeerIdentity> {
        self.identity.as_ref().ok_or(BackupError::UnauthenticatedPeer)
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// Live, reusable connection to one authenticated peer.
#[derive(Debug, Clone)]
pub struct Channel {
    session: Session,
    peer: PeerIdentity,
    dialer: PeerIdentity,
    tx: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl Channel {
    /// Opens a channel for an authenticated session. `local` is our own identity and is
    /// needed to know which side dialed.
    pub fn open(
        session: Session,
        local: &PeerIdentity,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> Result<Self> {
        let peer = session.identity()?.clone();
        let dialer = match session.direction() {
            Direction::Outbound => local.clone(),
            Direction::Inbound => peer.clone(),
        };
        Ok(Self {
            session,
            peer,
            dialer,
            tx,
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.session.channel_id()
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn direction(&self) -> Direction {
        self.session.direction()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_alive(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Queues a command. Commands on one channel are delivered in the order sent.
    pub fn send(&self, command: BackupCommand) -> Result<()> {
        if !self.is_alive() {
            return Err(BackupError::NoChannel(self.peer.clone()));
        }
        self.tx
            .send(Outbound {
                channel: self.id(),
                peer: self.peer.clone(),
                command,
            })
            .map_err(|_| BackupError::NoChannel(self.peer.clone()))
    }

    // Both ends of a duplicate pair pick the connection dialed by the smaller identity.
    fn preferred_over(&self, other: &Channel) -> bool {
        self.dialer < other.dialer
    }
}

#[derive(Debug)]
pub enum BindOutcome {
    Bound,
    /// The new channel took over; the displaced one should be closed by the caller.
    Replaced(Channel),
    /// A healthier channel already exists; the caller should close the new connection.
    Redundant,
}

impl BindOutcome {
    pub fn is_bound(&self) -> bool {
        !matches!(self, Self::Redundant)
    }
}

pub struct ChannelRegistry {
    local: PeerIdentity,
    channels: DashMap<PeerIdentity, Channel>,
}

impl ChannelRegistry {
    pub fn new(local: PeerIdentity) -> Self {
        Self {
            local,
            channels: DashMap::new(),
        }
    }

    pub fn local(&self) -> &PeerIdentity {
        &self.local
    }

    /// Registers `channel` as the reusable channel for its peer.
    pub fn bind(&self, channel: Channel) -> BindOutcome {
        let peer = channel.peer().clone();
        match self.channels.entry(peer.clone()) {
            Entry::Vacant(slot) => {
                info!(peer = %peer, channel = %channel.id(), direction = ?channel.direction(), "Channel bound");
                slot.insert(channel);
                BindOutcome::Bound
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if existing.id() == channel.id() {
                    return BindOutcome::Bound;
                }
                if !existing.is_alive() || channel.preferred_over(existing) {
                    debug!(peer = %peer, old = %existing.id(), new = %channel.id(), "Channel replaced");
                    let old = slot.insert(channel);
                    old.close();
                    return BindOutcome::Replaced(old);
                }
                warn!(
                    peer = %peer,
                    kept = %existing.id(),
                    offered = %channel.id(),
                    "Peer already has a live channel, offered channel stays unshared"
                );
                BindOutcome::Redundant
            }
        }
    }

    pub fn get(&self, peer: &PeerIdentity) -> Result<Channel> {
        match self.channels.get(peer) {
            Some(channel) if channel.is_alive() => Ok(channel.clone()),
            _ => Err(BackupError::NoChannel(peer.clone())),
        }
    }

    /// Deregisters a channel on disconnect. Releasing twice, or releasing a channel that
    /// was already displaced, is a no-op.
    pub fn release(&self, channel: ChannelId) -> bool {
        let Some(peer) = self.peer_for(channel) else {
            return false;
        };
        match self.channels.remove_if(&peer, |_, c| c.id() == channel) {
            Some((peer, c)) => {
                c.close();
                info!(peer = %peer, channel = %channel, "Channel released");
                true
            }
            None => false,
        }
    }

    pub fn is_online(&self, peer: &PeerIdentity) -> bool {
        self.get(peer).is_ok()
    }

    pub fn online_peers(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<_> = self
            .channels
            .iter()
            .filter(|entry| entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        peers
    }

    fn peer_for(&self, channel: ChannelId) -> Option<PeerIdentity> {
        self.channels
            .iter()
            .find(|entry| entry.value().id() == channel)
            .map(|entry| entry.key().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticated(dir: Direction, peer: &str) -> Session {
        let mut session = Session::new(ChannelId::next(), dir);
        session.bind_identity(PeerIdentity::new(peer)).unwrap();
        session
    }

    #[test]
    fn unauthenticated_session_cannot_open_channel() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::new(ChannelId::next(), Direction::Inbound);
        let err = Channel::open(session, &PeerIdentity::new("local"), tx).unwrap_err();
        assert!(matches!(err, BackupError::UnauthenticatedPeer));
    }

    #[test]
    fn identity_is_immutable_once_bound() {
        let mut session = authenticated(Direction::Inbound, "peer-a");
        assert!(session.bind_identity(PeerIdentity::new("peer-a")).is_ok());
        assert!(session.bind_identity(PeerIdentity::new("peer-b")).is_err());
    }

    #[test]
    fn bind_get_release() {
        let local = PeerIdentity::new("local");
        let registry = ChannelRegistry::new(local.clone());
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = Channel::open(authenticated(Direction::Outbound, "peer-a"), &local, tx).unwrap();
        let id = channel.id();

        assert!(registry.bind(channel).is_bound());
        assert_eq!(registry.get(&PeerIdentity::new("peer-a")).unwrap().id(), id);

        assert!(registry.release(id));
        assert!(!registry.release(id));
        assert!(matches!(
            registry.get(&PeerIdentity::new("peer-a")),
            Err(BackupError::NoChannel(_))
        ));
    }

    #[test]
    fn dead_channel_is_replaced() {
        let local = PeerIdentity::new("m-local");
        let registry = ChannelRegistry::new(local.clone());
        let (tx1, rx1) = mpsc::unbounded_channel();
        let first = Channel::open(authenticated(Direction::Outbound, "a-peer"), &local, tx1).unwrap();
        registry.bind(first);
        drop(rx1);

        let (tx2, _rx2) = mpsc::unbounded_channel();
        let second = Channel::open(authenticated(Direction::Outbound, "a-peer"), &local, tx2).unwrap();
        let second_id = second.id();
        assert!(matches!(registry.bind(second), BindOutcome::Replaced(_)));
        assert_eq!(registry.get(&PeerIdentity::new("a-peer")).unwrap().id(), second_id);
    }

    #[test]
    fn simultaneous_connections_collapse_to_one_channel_on_both_sides() {
        let a = PeerIdentity::new("peer-a");
        let b = PeerIdentity::new("peer-b");
        let reg_a = ChannelRegistry::new(a.clone());
        let reg_b = ChannelRegistry::new(b.clone());
        let (tx, _rx) = mpsc::unbounded_channel();

        // A dials B (conn 1) and B dials A (conn 2) at the same time.
        let a_out = Channel::open(authenticated(Direction::Outbound, "peer-b"), &a, tx.clone()).unwrap();
        let b_out = Channel::open(authenticated(Direction::Outbound, "peer-a"), &b, tx.clone()).unwrap();
        let b_in = Channel::open(authenticated(Direction::Inbound, "peer-a"), &b, tx.clone()).unwrap();
        let a_in = Channel::open(authenticated(Direction::Inbound, "peer-b"), &a, tx).unwrap();

        assert!(reg_a.bind(a_out).is_bound());
        assert!(reg_b.bind(b_out).is_bound());

        // Connection dialed by peer-a wins everywhere.
        assert!(!reg_a.bind(a_in).is_bound());
        assert!(matches!(reg_b.bind(b_in), BindOutcome::Replaced(_)));

        assert_eq!(reg_a.get(&b).unwrap().direction(), Direction::Outbound);
        assert_eq!(reg_b.get(&a).unwrap().direction(), Direction::Inbound);
    }

    #[test]
    fn messages_on_a_channel_arrive_in_order() {
        let local = PeerIdentity::new("local");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let channel = Channel::open(authenticated(Direction::Outbound, "peer"), &local, tx).unwrap();
        for i in 0..5 {
            channel
                .send(BackupCommand::DeleteBlock(peerbackup_protocol::DeleteBlockRequest {
                    block_id: format!("b{i}"),
                }))
                .unwrap();
        }
        for i in 0..5 {
            match rx.try_recv().unwrap().command {
                BackupCommand::DeleteBlock(req) => assert_eq!(req.block_id, format!("b{i}")),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn closed_channel_refuses_to_send() {
        let local = PeerIdentity::new("local");
        let (tx, _rx) = mpsc::unbounded_channel();
        let channel = Channel::open(authenticated(Direction::Inbound, "peer"), &local, tx).unwrap();
        channel.close();
        let err = channel
            .send(BackupCommand::IndexSnapshot(peerbackup_protocol::IndexSnapshotRequest {
                nonce_hex: String::new(),
            }))
            .unwrap_err();
        assert!(matches!(err, BackupError::NoChannel(_)));
    }
}
