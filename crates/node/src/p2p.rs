use crate::channel::{BindOutcome, ChannelId, Direction, Outbound, PeerIdentity, Session};
use crate::envelope::Envelope;
use crate::error::BackupError;
use crate::service::BackupService;
use anyhow::Result;
use futures::StreamExt;
use libp2p::{
    dns, identify, identity, noise, ping,
    request_response::{
        self, Behaviour as RequestResponse, Codec as RequestResponseCodec,
        Event as RequestResponseEvent, Message as RequestResponseMessage, OutboundRequestId,
    },
    swarm::{ConnectionId, NetworkBehaviour, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Transport,
};
use peerbackup_protocol::{BackupCommand, BackupReply, BLOCK_PROTOCOL};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::path::PathBuf;
use std::{io, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const IDENTIFY_PROTOCOL: &str = "/peerbackup/id/1.0.0";
const DIAL_CHECK_SECS: u64 = 30;

/// Bincode over a single request-response stream, bounded by `max_bytes`.
#[derive(Clone)]
pub struct BackupCodec {
    max_bytes: u64,
}

impl BackupCodec {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes: max_bytes as u64,
        }
    }

    async fn read_bounded<T, M>(&self, io: &mut T) -> io::Result<M>
    where
        T: futures::AsyncRead + Unpin + Send,
        M: serde::de::DeserializeOwned,
    {
        let mut buf = Vec::new();
        let mut limited = futures::AsyncReadExt::take(io, self.max_bytes + 1);
        futures::AsyncReadExt::read_to_end(&mut limited, &mut buf).await?;
        if buf.len() as u64 > self.max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "message exceeds size limit",
            ));
        }
        bincode::deserialize(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn write_all<T, M>(&self, io: &mut T, message: &M) -> io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
        M: serde::Serialize,
    {
        let data =
            bincode::serialize(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        futures::AsyncWriteExt::write_all(io, &data).await?;
        futures::AsyncWriteExt::close(io).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl RequestResponseCodec for BackupCodec {
    type Protocol = StreamProtocol;
    type Request = BackupCommand;
    type Response = BackupReply;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: futures::AsyncRead + Unpin + Send,
    {
        self.read_bounded(io).await
    }

    async fn read_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: futures::AsyncRead + Unpin + Send,
    {
        self.read_bounded(io).await
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        request: BackupCommand,
    ) -> io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
    {
        self.write_all(io, &request).await
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        response: BackupReply,
    ) -> io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
    {
        self.write_all(io, &response).await
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "NodeEvent")]
pub struct NodeBehaviour {
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub block: RequestResponse<BackupCodec>,
}

#[allow(dead_code)]
#[derive(Debug)]
pub enum NodeEvent {
    Identify(identify::Event),
    Ping(ping::Event),
    Block(RequestResponseEvent<BackupCommand, BackupReply>),
}

impl From<identify::Event> for NodeEvent {
    fn from(v: identify::Event) -> Self {
        Self::Identify(v)
    }
}
impl From<ping::Event> for NodeEvent {
    fn from(v: ping::Event) -> Self {
        Self::Ping(v)
    }
}
impl From<RequestResponseEvent<BackupCommand, BackupReply>> for NodeEvent {
    fn from(v: RequestResponseEvent<BackupCommand, BackupReply>) -> Self {
        Self::Block(v)
    }
}

/// Recovery requested on the command line: snapshots are collected for the discovery
/// period, then the newest valid index is restored into `destination`.
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    pub destination: PathBuf,
}

/// Commands waiting per peer behind at most one request in flight.
///
/// Each request gets its own stream and the remote reads streams concurrently, so a second
/// command is only released once the previous one is answered or has failed.
struct PeerQueues<P, T, I> {
    waiting: HashMap<P, VecDeque<T>>,
    in_flight: HashMap<P, I>,
}

impl<P: Eq + Hash + Clone, T, I: PartialEq> PeerQueues<P, T, I> {
    fn new() -> Self {
        Self {
            waiting: HashMap::new(),
            in_flight: HashMap::new(),
        }
    }

    fn push(&mut self, peer: P, item: T) {
        self.waiting.entry(peer).or_default().push_back(item);
    }

    /// The next command for `peer`, if nothing is in flight to it.
    fn pop_ready(&mut self, peer: &P) -> Option<T> {
        if self.in_flight.contains_key(peer) {
            return None;
        }
        let queue = self.waiting.get_mut(peer)?;
        let item = queue.pop_front();
        if queue.is_empty() {
            self.waiting.remove(peer);
        }
        item
    }

    fn started(&mut self, peer: P, request: I) {
        self.in_flight.insert(peer, request);
    }

    /// Clears the in-flight slot when `request` is the one occupying it.
    fn finished(&mut self, peer: &P, request: &I) -> bool {
        if self.in_flight.get(peer) != Some(request) {
            return false;
        }
        self.in_flight.remove(peer);
        true
    }

    fn queued(&self, peer: &P) -> usize {
        self.waiting.get(peer).map_or(0, VecDeque::len)
    }
}

pub struct BackupNode {
    pub peer_id: PeerId,
    pub swarm: Swarm<NodeBehaviour>,
    pub service: BackupService,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub bootstrap_addrs: Vec<Multiaddr>,
    connections: HashMap<ConnectionId, ChannelId>,
    channels: HashMap<ChannelId, ConnectionId>,
    queues: PeerQueues<PeerId, Outbound, OutboundRequestId>,
}

pub fn build_node(
    keypair: identity::Keypair,
    service: BackupService,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    bootstrap_addrs: Vec<Multiaddr>,
) -> Result<BackupNode> {
    let peer_id = PeerId::from(keypair.public());

    let noise_config = noise::Config::new(&keypair)
        .map_err(|e| anyhow::anyhow!("Noise key generation failed: {e}"))?;

    let tcp_transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true));
    // User addresses may be /dns4 or /dns6.
    let transport = dns::tokio::Transport::system(tcp_transport)
        .map_err(|e| anyhow::anyhow!("DNS resolver setup failed: {e}"))?
        .upgrade(libp2p::core::upgrade::Version::V1Lazy)
        .authenticate(noise_config)
        .multiplex(yamux::Config::default())
        .boxed();

    let identify = identify::Behaviour::new(identify::Config::new(
        IDENTIFY_PROTOCOL.to_string(),
        keypair.public(),
    ));

    let ping = ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(20)));

    let network = &service.config().network;
    let block = RequestResponse::with_codec(
        BackupCodec::new(network.max_message_bytes),
        std::iter::once((
            StreamProtocol::new(BLOCK_PROTOCOL),
            request_response::ProtocolSupport::Full,
        )),
        request_response::Config::default()
            .with_request_timeout(Duration::from_secs(service.config().restore.fetch_timeout_secs)),
    );

    let behaviour = NodeBehaviour {
        identify,
        ping,
        block,
    };

    let swarm = Swarm::new(
        transport,
        behaviour,
        peer_id,
        libp2p::swarm::Config::with_tokio_executor()
            .with_idle_connection_timeout(Duration::from_secs(60)),
    );

    Ok(BackupNode {
        peer_id,
        swarm,
        service,
        outbound,
        bootstrap_addrs,
        connections: HashMap::new(),
        channels: HashMap::new(),
        queues: PeerQueues::new(),
    })
}

pub async fn drive_node(
    mut node: BackupNode,
    listen_addr: Multiaddr,
    recovery: Option<RecoveryPlan>,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    node.swarm.listen_on(listen_addr)?;

    for addr in &node.bootstrap_addrs {
        if let Err(e) = node.swarm.dial(addr.clone()) {
            warn!(address = %addr, error = %e, "Bootstrap dial failed");
        }
    }

    let config = node.service.config().clone();
    let mut verification_tick = interval(Duration::from_secs(config.verification.tick_secs.max(1)));
    let mut restore_tick = interval(Duration::from_secs(config.restore.tick_secs.max(1)));
    let mut dial_tick = interval(Duration::from_secs(DIAL_CHECK_SECS));
    for tick in [&mut verification_tick, &mut restore_tick, &mut dial_tick] {
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    let discovery = Duration::from_secs(config.restore.discovery_secs);
    let mut select_at = None;
    if let Some(plan) = &recovery {
        let asked = node.service.begin_recovery(crate::now_ms())?;
        info!(peers = asked.len(), destination = %plan.destination.display(), "Recovery requested");
        select_at = Some(Instant::now() + discovery);
    }

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping node");
                break;
            }
            _ = async { sleep_until(select_at.unwrap_or_else(Instant::now)).await }, if select_at.is_some() => {
                select_at = None;
                if let Some(plan) = &recovery {
                    match node.service.start_recovery(&plan.destination) {
                        Ok(index) => info!(created_at_ms = index.created_at_ms, roots = index.root_directories.len(), "Recovering from backup index"),
                        Err(e @ BackupError::NoRecoverableIndex { .. }) => error!(error = %e, "Recovery not possible"),
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Some(outbound) = node.outbound.recv() => {
                send_outbound(&mut node, outbound);
            }
            _ = verification_tick.tick() => {
                match node.service.verification_tick(crate::now_ms()) {
                    Ok(report) => debug!(?report, "Verification round"),
                    Err(e) => warn!(error = %e, "Verification round failed"),
                }
            }
            _ = restore_tick.tick() => {
                match node.service.restore_tick(crate::now_ms()) {
                    Ok(report) if report.finished => {
                        info!(?report, "Restore finished");
                        report_unrecoverable(&node.service);
                    }
                    Ok(report) => debug!(?report, "Restore tick"),
                    Err(e) => warn!(error = %e, "Restore tick failed"),
                }
            }
            _ = dial_tick.tick() => {
                redial_users(&mut node);
            }
            event = node.swarm.select_next_some() => {
                handle_swarm_event(&mut node, event);
            }
        }
    }
    node.service.flush()?;
    Ok(())
}

fn send_outbound(node: &mut BackupNode, outbound: Outbound) {
    let Ok(peer) = outbound.peer.as_str().parse::<PeerId>() else {
        warn!(peer = %outbound.peer, "Outbound command for unparseable peer id dropped");
        return;
    };
    node.queues.push(peer, outbound);
    release_next(node, &peer);
}

/// Sends the next queued command to `peer` unless one is still unanswered.
fn release_next(node: &mut BackupNode, peer: &PeerId) {
    while let Some(outbound) = node.queues.pop_ready(peer) {
        if !node.channels.contains_key(&outbound.channel) {
            debug!(peer = %outbound.peer, channel = %outbound.channel, "Channel gone, command dropped");
            continue;
        }
        let kind = outbound.command.kind();
        let request = node
            .swarm
            .behaviour_mut()
            .block
            .send_request(peer, outbound.command);
        node.queues.started(*peer, request);
        debug!(peer = %peer, command = kind, queued = node.queues.queued(peer), "Command sent");
        return;
    }
}

fn report_unrecoverable(service: &BackupService) {
    match service.progress() {
        Ok(progress) => {
            for e in progress.unrecoverable_errors() {
                error!(error = %e, "Restore incomplete");
            }
        }
        Err(e) => warn!(error = %e, "Reading restore progress failed"),
    }
}

fn redial_users(node: &mut BackupNode) {
    let due = match node.service.reconnect_candidates(crate::now_ms()) {
        Ok(due) => due,
        Err(e) => {
            warn!(error = %e, "Listing users to reconnect failed");
            return;
        }
    };
    for (user, addresses) in due {
        for address in addresses {
            match address.parse::<Multiaddr>() {
                Ok(addr) => {
                    if let Err(e) = node.swarm.dial(addr) {
                        debug!(user = %user, error = %e, "Dial failed");
                    }
                }
                Err(e) => warn!(user = %user, address = %address, error = %e, "Invalid user address"),
            }
        }
    }
}

fn handle_swarm_event(node: &mut BackupNode, event: SwarmEvent<NodeEvent>) {
    match event {
        SwarmEvent::Behaviour(NodeEvent::Block(event)) => match event {
            RequestResponseEvent::Message { peer, message, .. } => match message {
                RequestResponseMessage::Request {
                    request, channel, ..
                } => {
                    let response = match session_for(node, &peer) {
                        Some(session) => match Envelope::wrap(&session, request) {
                            Ok(envelope) => node.service.handle_command(envelope, crate::now_ms()),
                            Err(e) => {
                                error!(peer = %peer, error = %e, "Command without identity, closing channel");
                                close_channel(node, session.channel_id());
                                return;
                            }
                        },
                        None => {
                            warn!(peer = %peer, "Command on unregistered connection refused");
                            request.denied()
                        }
                    };
                    if node
                        .swarm
                        .behaviour_mut()
                        .block
                        .send_response(channel, response)
                        .is_err()
                    {
                        debug!(peer = %peer, "Response channel closed");
                    }
                }
                RequestResponseMessage::Response {
                    request_id,
                    response,
                } => {
                    node.queues.finished(&peer, &request_id);
                    match session_for(node, &peer) {
                        Some(session) => {
                            let handled = Envelope::wrap(&session, response).and_then(|envelope| {
                                node.service.handle_reply(envelope, crate::now_ms())
                            });
                            if let Err(e) = handled {
                                warn!(peer = %peer, error = %e, "Reply handling failed");
                            }
                        }
                        None => debug!(peer = %peer, "Reply after channel release ignored"),
                    }
                    release_next(node, &peer);
                }
            },
            RequestResponseEvent::InboundFailure { peer, error, .. } => {
                warn!(peer = %peer, error = %error, "Block inbound failure");
            }
            RequestResponseEvent::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                warn!(peer = %peer, error = %error, "Block outbound failure");
                node.queues.finished(&peer, &request_id);
                release_next(node, &peer);
            }
            RequestResponseEvent::ResponseSent { peer, .. } => {
                debug!(peer = %peer, "Block response sent");
            }
        },
        SwarmEvent::Behaviour(NodeEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
            learn_identity(node, &peer_id, &info);
        }
        SwarmEvent::NewListenAddr { address, .. } => {
            info!(address = %address, "Listening");
        }
        SwarmEvent::ConnectionEstablished {
            peer_id,
            connection_id,
            endpoint,
            ..
        } => {
            info!(peer = %peer_id, endpoint = ?endpoint, "Connection established");
            let direction = if endpoint.is_dialer() {
                Direction::Outbound
            } else {
                Direction::Inbound
            };
            let channel = ChannelId::next();
            let mut session = Session::new(channel, direction);
            if let Err(e) = session.bind_identity(PeerIdentity::from(&peer_id)) {
                warn!(peer = %peer_id, error = %e, "Identity binding failed");
                node.swarm.close_connection(connection_id);
                return;
            }
            node.connections.insert(connection_id, channel);
            node.channels.insert(channel, connection_id);
            match node.service.on_connection(session, crate::now_ms()) {
                Ok(BindOutcome::Bound) => {}
                Ok(BindOutcome::Replaced(old)) => {
                    old.close();
                    close_channel(node, old.id());
                }
                Ok(BindOutcome::Redundant) => close_channel(node, channel),
                Err(e) => {
                    warn!(peer = %peer_id, error = %e, "Channel setup failed");
                    close_channel(node, channel);
                }
            }
        }
        SwarmEvent::ConnectionClosed {
            peer_id,
            connection_id,
            cause,
            ..
        } => {
            info!(peer = %peer_id, cause = ?cause, "Connection closed");
            if let Some(channel) = node.connections.remove(&connection_id) {
                node.channels.remove(&channel);
                node.service.on_disconnect(channel);
            }
            // Drops commands queued for the closed channel.
            release_next(node, &peer_id);
        }
        SwarmEvent::IncomingConnectionError { error, .. } => {
            warn!(error = ?error, "Incoming connection error");
        }
        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
            warn!(peer = ?peer_id, error = ?error, "Outgoing connection error");
        }
        _ => {}
    }
}

fn session_for(node: &BackupNode, peer: &PeerId) -> Option<Session> {
    node.service
        .registry()
        .get(&PeerIdentity::from(peer))
        .ok()
        .map(|channel| channel.session().clone())
}

fn close_channel(node: &mut BackupNode, channel: ChannelId) {
    let Some(connection) = node.channels.get(&channel).copied() else {
        return;
    };
    if !node.swarm.close_connection(connection) {
        warn!(channel = %channel, "Connection to close was already gone");
    }
}

fn learn_identity(node: &BackupNode, peer_id: &PeerId, info: &identify::Info) {
    let peer = PeerIdentity::from(peer_id);
    if PeerId::from(info.public_key.clone()) != *peer_id {
        warn!(peer = %peer, "Identify key does not match connection identity");
        return;
    }
    let users = node.service.users();
    match users.get(&peer) {
        Ok(Some(_)) => {}
        Ok(None) => return,
        Err(e) => {
            warn!(peer = %peer, error = %e, "User lookup failed");
            return;
        }
    }
    if let Err(e) = users.bind_public_key(&peer, &info.public_key.encode_protobuf()) {
        warn!(peer = %peer, error = %e, "Storing user key failed");
    }
    for addr in &info.listen_addrs {
        if let Err(e) = users.add_address(&peer, &addr.to_string()) {
            warn!(peer = %peer, error = %e, "Storing user address failed");
        }
    }
}

pub fn peer_id_from_multiaddr(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        libp2p::multiaddr::Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}

pub fn parse_listen_multiaddr(addr: &str) -> Result<Multiaddr> {
    addr.parse::<Multiaddr>()
        .map_err(|e| anyhow::anyhow!("invalid multiaddr: {e}"))
}
