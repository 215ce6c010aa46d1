//! Several in-process nodes wired through their outbound queues. Every command is served by
//! the addressed node and its reply handed back to the sender, as the swarm loop does.

use peerbackup_node::config::VerificationConfig;
use peerbackup_node::user::User;
use peerbackup_node::{
    BackupService, BackupStore, BindOutcome, ChannelId, Direction, Envelope, MacKey, NodeConfig,
    Outbound, PeerIdentity, RecoveryState, Session,
};
use peerbackup_protocol::{BackupCommand, BackupIndex, BlockContent, PathVersionBlock, RootDirectoryRef};
use tokio::sync::mpsc;

const WINDOW_SECS: u64 = 60;

struct Node {
    id: PeerIdentity,
    service: BackupService,
    rx: mpsc::UnboundedReceiver<Outbound>,
}

fn config() -> NodeConfig {
    NodeConfig {
        verification: VerificationConfig {
            pool_size: 4,
            replenish_threshold: 1,
            window_secs: WINDOW_SECS,
            tick_secs: 1,
            response_timeout_secs: 30,
        },
        ..NodeConfig::default()
    }
}

/// A node with an empty disk. The MAC key only depends on the name, as it only depends on
/// the identity key in a real node.
fn node(name: &str) -> Node {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = PeerIdentity::new(name);
    let service = BackupService::open(
        BackupStore::temporary().unwrap(),
        config(),
        id.clone(),
        MacKey::derive(format!("{name}-identity").as_bytes()).unwrap(),
        u64::MAX,
        tx,
    )
    .unwrap();
    Node { id, service, rx }
}

fn trust(owner: &Node, holder: &Node) {
    let mut to = User::new(holder.id.clone());
    to.allow_backup_data_to_user = true;
    owner.service.users().add(to).unwrap();
    let mut from = User::new(owner.id.clone());
    from.allow_backup_data_from_user = true;
    holder.service.users().add(from).unwrap();
}

fn session(peer: &PeerIdentity, direction: Direction) -> Session {
    let mut session = Session::new(ChannelId::next(), direction);
    session.bind_identity(peer.clone()).unwrap();
    session
}

/// `dialer` opens a connection to `listener`. Returns each side's channel id and outcome.
fn connect(
    dialer: &Node,
    listener: &Node,
    now_ms: u64,
) -> ((ChannelId, BindOutcome), (ChannelId, BindOutcome)) {
    let out = session(&listener.id, Direction::Outbound);
    let inb = session(&dialer.id, Direction::Inbound);
    let (out_id, in_id) = (out.channel_id(), inb.channel_id());
    let a = dialer.service.on_connection(out, now_ms).unwrap();
    let b = listener.service.on_connection(inb, now_ms).unwrap();
    ((out_id, a), (in_id, b))
}

fn link(a: &Node, b: &Node) -> (ChannelId, ChannelId) {
    let ((x, _), (y, _)) = connect(a, b, 0);
    (x, y)
}

/// Delivers queued commands until every queue is empty. Returns the commands delivered.
fn pump(nodes: &mut [&mut Node], now_ms: u64) -> Vec<(PeerIdentity, PeerIdentity, &'static str)> {
    let mut delivered = Vec::new();
    loop {
        let mut queued = Vec::new();
        for (i, node) in nodes.iter_mut().enumerate() {
            while let Ok(out) = node.rx.try_recv() {
                queued.push((i, out));
            }
        }
        if queued.is_empty() {
            return delivered;
        }
        for (i, out) in queued {
            let Some(j) = nodes.iter().position(|n| n.id == out.peer) else {
                continue;
            };
            let (sender, receiver) = (&nodes[i], &nodes[j]);
            let Ok(inbound) = receiver.service.registry().get(&sender.id) else {
                continue;
            };
            let kind = out.command.kind();
            let command = Envelope::wrap(inbound.session(), out.command).unwrap();
            let reply = receiver.service.handle_command(command, now_ms);
            let Ok(outbound) = sender.service.registry().get(&receiver.id) else {
                continue;
            };
            let reply = Envelope::wrap(outbound.session(), reply).unwrap();
            sender.service.handle_reply(reply, now_ms).unwrap();
            delivered.push((sender.id.clone(), receiver.id.clone(), kind));
        }
    }
}

fn data(bytes: &[u8]) -> BlockContent {
    BlockContent::Data(bytes.to_vec())
}

#[test]
fn verification_keeps_honest_holders_and_drops_lost_ones() {
    let mut owner = node("owner");
    let mut p1 = node("p1");
    let mut p2 = node("p2");
    trust(&owner, &p1);
    trust(&owner, &p2);
    link(&owner, &p1);
    let (owner_p2, p2_side) = link(&owner, &p2);

    let asked = owner.service.backup_block("B1", &data(b"block one"), 0).unwrap();
    assert_eq!(asked.len(), 2);
    pump(&mut [&mut owner, &mut p1, &mut p2], 0);
    let holders = owner.service.ledger().locations_for("B1").unwrap();
    assert!(holders.contains(&p1.id) && holders.contains(&p2.id));

    let report = owner.service.verification_tick(1_000).unwrap();
    assert_eq!(report.challenged.len(), 2);
    pump(&mut [&mut owner, &mut p1, &mut p2], 1_000);
    assert_eq!(owner.service.ledger().locations_for("B1").unwrap().len(), 2);
    assert!(owner.service.health(1_000).unwrap().recent_failures.is_empty());

    // p2 loses its disk and comes back under the same identity.
    owner.service.on_disconnect(owner_p2);
    p2.service.on_disconnect(p2_side);
    let mut p2 = node("p2");
    trust(&owner, &p2);
    link(&owner, &p2);

    let later = WINDOW_SECS * 1000 + 2_000;
    let report = owner.service.verification_tick(later).unwrap();
    assert_eq!(report.challenged.len(), 2);
    pump(&mut [&mut owner, &mut p1, &mut p2], later);

    let holders = owner.service.ledger().locations_for("B1").unwrap();
    assert!(holders.contains(&p1.id));
    assert!(!holders.contains(&p2.id));
    let health = owner.service.health(later).unwrap();
    assert_eq!(health.blocks_below_replicas, vec!["B1".to_string()]);
    assert_eq!(health.recent_failures.len(), 1);
    assert_eq!(health.recent_failures[0].peer, p2.id);
}

#[test]
fn offline_holder_is_not_challenged_and_keeps_its_location() {
    let mut owner = node("owner");
    let mut p1 = node("p1");
    trust(&owner, &p1);
    let (owner_side, p1_side) = link(&owner, &p1);
    owner.service.backup_block("B1", &data(b"x"), 0).unwrap();
    pump(&mut [&mut owner, &mut p1], 0);

    owner.service.on_disconnect(owner_side);
    p1.service.on_disconnect(p1_side);
    let report = owner.service.verification_tick(1_000).unwrap();
    assert!(report.challenged.is_empty());
    assert_eq!(report.skipped_offline, 1);
    assert!(owner.service.ledger().locations_for("B1").unwrap().contains(&p1.id));
}

#[test]
fn untrusted_peer_never_receives_blocks() {
    let mut owner = node("owner");
    let mut stranger = node("stranger");
    link(&owner, &stranger);
    assert!(owner.service.backup_block("B1", &data(b"x"), 0).unwrap().is_empty());
    assert!(pump(&mut [&mut owner, &mut stranger], 0).is_empty());
    assert!(owner.service.ledger().locations_for("B1").unwrap().is_empty());
}

#[test]
fn simultaneous_connections_settle_on_one_channel() {
    let alice = node("alice");
    let bob = node("bob");

    // alice dials bob while bob dials alice.
    let ((a_out, _), (b_in, _)) = connect(&alice, &bob, 0);
    let ((b_out, b_second), (a_in, a_second)) = connect(&bob, &alice, 0);

    // The connection dialed by the smaller identity survives on both ends.
    assert!(matches!(b_second, BindOutcome::Redundant));
    assert!(matches!(a_second, BindOutcome::Redundant));
    assert_eq!(alice.service.registry().get(&bob.id).unwrap().id(), a_out);
    assert_eq!(bob.service.registry().get(&alice.id).unwrap().id(), b_in);

    // Releasing the losing connection leaves the kept one in place.
    assert!(!alice.service.on_disconnect(a_in));
    assert!(!bob.service.on_disconnect(b_out));
    assert!(alice.service.registry().is_online(&bob.id));
}

#[test]
fn commands_to_one_peer_keep_their_order() {
    let mut owner = node("owner");
    let mut p1 = node("p1");
    trust(&owner, &p1);
    link(&owner, &p1);
    for id in ["B1", "B2", "B3"] {
        owner.service.backup_block(id, &data(id.as_bytes()), 0).unwrap();
    }
    let mut sent = Vec::new();
    while let Ok(out) = owner.rx.try_recv() {
        if let BackupCommand::StoreBlock(req) = out.command {
            sent.push(req.block_id);
        }
    }
    assert_eq!(sent, vec!["B1", "B2", "B3"]);
    assert!(pump(&mut [&mut owner, &mut p1], 0).is_empty());
}

#[test]
fn owner_recovers_files_after_total_data_loss() {
    let mut owner = node("owner");
    let mut p1 = node("p1");
    trust(&owner, &p1);
    let (owner_side, p1_side) = link(&owner, &p1);

    owner.service.backup_block("C1", &data(b"hello, "), 0).unwrap();
    owner.service.backup_block("C2", &data(b"world"), 0).unwrap();
    let version = PathVersionBlock {
        root_directory_id: "R1".into(),
        path: "notes/today.txt".into(),
        version_ms: 500,
        deleted: false,
        content_hash: None,
        block_ids: vec!["C1".into(), "C2".into()],
    };
    owner.service.backup_block("V1", &BlockContent::PathVersion(version), 0).unwrap();
    let index = BackupIndex {
        created_at_ms: 1_000,
        root_directories: vec![RootDirectoryRef {
            id: "R1".into(),
            name: "/home/owner/documents".into(),
        }],
        version_block_ids: vec!["V1".into()],
    };
    owner.service.backup_index(&index, 0).unwrap();
    pump(&mut [&mut owner, &mut p1], 0);
    assert_eq!(owner.service.ledger().locations_for("V1").unwrap().len(), 1);

    // Everything local is gone. Only the identity survived.
    owner.service.on_disconnect(owner_side);
    p1.service.on_disconnect(p1_side);
    let mut owner = node("owner");
    trust(&owner, &p1);
    let target = tempfile::tempdir().unwrap();

    owner.service.begin_recovery(10).unwrap();
    link(&owner, &p1);
    pump(&mut [&mut owner, &mut p1], 10);
    assert_eq!(owner.service.recovery().candidates().unwrap(), vec![index.clone()]);

    assert_eq!(owner.service.start_recovery(target.path()).unwrap(), index);
    let mut finished = false;
    for step in 1..10u64 {
        let now = 10 + step * 1_000;
        let report = owner.service.restore_tick(now).unwrap();
        if report.finished {
            finished = true;
            break;
        }
        pump(&mut [&mut owner, &mut p1], now);
    }
    assert!(finished);
    assert_eq!(owner.service.recovery().state().unwrap(), None::<RecoveryState>);

    let restored = target.path().join("documents").join("notes").join("today.txt");
    assert_eq!(std::fs::read(restored).unwrap(), b"hello, world");
    let progress = owner.service.progress().unwrap();
    assert_eq!(progress.materialized_paths, 1);
    assert!(!progress.is_partial());

    // The recovered node has no verification values and no local payloads, so it pulls
    // blocks back from the holder to generate new ones.
    let report = owner.service.verification_tick(20_000).unwrap();
    assert!(report.exhausted.contains(&"C1".to_string()));
    assert!(report.value_requests.iter().any(|(id, peer)| id == "C1" && *peer == p1.id));
    pump(&mut [&mut owner, &mut p1], 20_000);
    assert_eq!(owner.service.verification().unused_count("C1").unwrap(), 4);

    let report = owner.service.verification_tick(21_000).unwrap();
    assert!(report.challenged.iter().any(|(id, _)| id == "C1"));
    pump(&mut [&mut owner, &mut p1], 21_000);
    assert!(owner.service.ledger().locations_for("C1").unwrap().contains(&p1.id));
}

#[test]
fn recovery_without_snapshots_reports_no_recoverable_index() {
    let mut owner = node("owner");
    let mut p1 = node("p1");
    trust(&owner, &p1);
    link(&owner, &p1);
    owner.service.begin_recovery(0).unwrap();
    pump(&mut [&mut owner, &mut p1], 0);
    let target = tempfile::tempdir().unwrap();
    assert!(matches!(
        owner.service.start_recovery(target.path()),
        Err(peerbackup_node::BackupError::NoRecoverableIndex { candidates: 0 })
    ));
}
