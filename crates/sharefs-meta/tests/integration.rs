//! Integration tests for multi-node scenarios.
//!
//! These tests run several instances in one process over simulated links and
//! exercise lease revocation, coordinator hand-off, host disabling and send
//! retry end to end.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{host_name, node_config, wait_until, TestCluster, TestNode, FS_NAME};
use sharefs_meta::{
    accept_peer, AdminState, ControlKind, InvalidateMode, LeaseKind, LeaseMask, ManualLiveness,
    MetaError, Phase, PeerOrdinal, ResourceId, Role, SessionFlags, WaitMode,
};
use sharefs_transport::message::STATUS_MOUNTED;
use sharefs_transport::{
    codec, Command, FixedName, LeaseOp, LeasePayload, MountOp, MountPayload, NotifyOp, Originator,
    Payload, PeerLink, SimFault, SimLink, WireMessage,
};

const F: ResourceId = ResourceId::new(500, 1);
const G: ResourceId = ResourceId::new(501, 1);

fn ord(n: u32) -> PeerOrdinal {
    PeerOrdinal::new(n)
}

#[tokio::test]
async fn test_cluster_handshake() {
    let cluster = TestCluster::start(3).await;

    assert_eq!(cluster.servers(), vec![1]);
    for n in 1..=3 {
        let instance = cluster.instance(n);
        assert_eq!(instance.current_coordinator(), ord(1));
        let peers = instance.connected_peers();
        assert_eq!(peers.iter().filter(|p| p.connected).count(), 2);
        assert!(peers.iter().all(|p| p.mounted));
    }
    let node2 = cluster
        .instance(1)
        .registry()
        .get(ord(2), false)
        .expect("session for node2");
    assert_eq!(node2.name(), host_name(2));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_write_request_revokes_cached_read() {
    let cluster = TestCluster::start(3).await;
    let reader = cluster.instance(2);
    let writer = cluster.instance(3);

    let grant = reader.request_lease(F, LeaseKind::Read).await.unwrap();
    assert!(grant.leases.contains(LeaseMask::READ));
    assert!(reader.held_leases(F).contains(LeaseMask::READ));

    let grant = writer.request_lease(F, LeaseKind::Write).await.unwrap();
    assert!(grant.leases.contains(LeaseMask::WRITE));

    // The reader flushed and dropped its pages before giving the lease back.
    let modes = cluster.node(2).cache.modes_for(F);
    let sync = modes.iter().position(|m| *m == InvalidateMode::SyncPages);
    let dropped = modes.iter().position(|m| *m == InvalidateMode::DropPages);
    assert!(sync.is_some() && dropped.is_some());
    assert!(sync < dropped);
    assert!(reader.held_leases(F).is_empty());

    let holders = cluster.instance(1).leases().holders(F);
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].0, ord(3));
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_nowait_request_would_block() {
    let cluster = TestCluster::start(3).await;
    cluster
        .instance(2)
        .request_lease(G, LeaseKind::Truncate)
        .await
        .unwrap();

    let err = cluster
        .instance(3)
        .request_lease_with(G, LeaseKind::Write, WaitMode::NoWait)
        .await
        .unwrap_err();
    assert!(matches!(err, MetaError::WouldBlock(r) if r == G));
    assert!(err.is_retryable());
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failover_preconditions_leave_cluster_untouched() {
    let cluster = TestCluster::start(3).await;
    let coordinator = cluster.instance(1);

    let err = coordinator
        .request_voluntary_failover("node9")
        .await
        .unwrap_err();
    assert!(matches!(err, MetaError::CandidateNotReady(_)));

    let err = cluster
        .instance(2)
        .request_voluntary_failover("node3")
        .await
        .unwrap_err();
    assert!(matches!(err, MetaError::NotCoordinator { coordinator } if coordinator == ord(1)));

    cluster.instance(2).set_mounted(false).await;
    let session = coordinator.registry().get(ord(2), false).unwrap();
    wait_until("node2 reported unmounted", || !session.is_mounted()).await;
    let err = coordinator
        .request_voluntary_failover("node2")
        .await
        .unwrap_err();
    assert!(matches!(err, MetaError::CandidateNotReady(_)));

    let status = coordinator.status();
    assert_eq!(status.phase, Phase::Active);
    assert_eq!(status.role, Role::Server);
    assert!(!status.failover_pending);
    assert_eq!(status.generation, 1);
    assert_eq!(cluster.servers(), vec![1]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_voluntary_failover_hands_off_role() {
    let cluster = TestCluster::start(3).await;
    cluster
        .instance(3)
        .request_lease(F, LeaseKind::Open)
        .await
        .unwrap();

    let target = cluster
        .instance(1)
        .request_voluntary_failover("node2")
        .await
        .unwrap();
    assert_eq!(target, ord(2));

    let new = cluster.instance(2);
    wait_until("node2 promoted", || {
        new.is_server() && new.status().phase == Phase::Active
    })
    .await;
    for n in 1..=3 {
        let instance = cluster.instance(n);
        wait_until("coordinator adopted", || {
            instance.current_coordinator() == ord(2) && instance.status().generation == 2
        })
        .await;
    }
    assert_eq!(cluster.servers(), vec![2]);

    let old = cluster.instance(1).status();
    assert_eq!(old.role, Role::Client);
    assert_eq!(old.phase, Phase::Active);
    assert!(!old.failover_pending);

    // Leases held across the hand-off were re-reported to the new coordinator.
    let holders = new.leases().holders(F);
    assert!(holders
        .iter()
        .any(|(o, m)| *o == ord(3) && m.contains(LeaseMask::OPEN)));

    // The former coordinator wrote its control blocks back.
    for kind in ControlKind::ALL {
        assert!(cluster.node(1).store.block(kind).is_some());
    }

    let grant = cluster
        .instance(1)
        .request_lease(G, LeaseKind::Write)
        .await
        .unwrap();
    assert_eq!(grant.generation, 2);

    // A lease request still carrying the old generation is refused.
    let mut stale = WireMessage::new(
        Command::Lease(LeaseOp::Get),
        Originator::Client,
        Payload::Lease(LeasePayload {
            resource: G,
            kind: LeaseKind::Read.index() as u16,
            mask: LeaseMask::READ.bits(),
            generation: 1,
            ..Default::default()
        }),
    );
    stale.header.coord_generation = 1;
    let reply = new.process_request(ord(3), &stale).await;
    assert_eq!(reply.header.error, 53);

    // The former coordinator refuses coordinator work.
    let mut current = stale.clone();
    current.header.coord_generation = 2;
    let reply = cluster.instance(1).process_request(ord(3), &current).await;
    assert_eq!(reply.header.error, 66);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_freeze_waits_for_active_operations() {
    let cluster = TestCluster::start(3).await;
    let target = cluster.instance(2);
    let op = target.failover().begin_op().await;

    cluster
        .instance(1)
        .request_voluntary_failover("node2")
        .await
        .unwrap();
    wait_until("node2 freezing", || target.status().phase == Phase::Freezing).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = target.status();
    assert_eq!(status.phase, Phase::Freezing);
    assert_eq!(status.active_ops, 1);
    assert!(!target.is_server());

    drop(op);
    wait_until("node2 promoted", || {
        target.is_server() && target.status().phase == Phase::Active
    })
    .await;
    assert_eq!(cluster.servers(), vec![2]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_lost_candidate_calls_off_handoff() {
    let cluster = TestCluster::start(3).await;
    let coordinator = cluster.instance(1).clone();
    let bystander = cluster.instance(3).clone();
    let op = coordinator.failover().begin_op().await;

    let handoff = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.request_voluntary_failover("node2").await }
    });
    wait_until("node1 freezing", || {
        coordinator.status().phase == Phase::Freezing
    })
    .await;
    cluster.link(1, 2).close().await;

    let err = handoff.await.unwrap().unwrap_err();
    assert!(matches!(err, MetaError::CandidateNotReady(ref name) if name == "node2"));
    let status = coordinator.status();
    assert_eq!(status.phase, Phase::Active);
    assert!(!status.failover_pending);
    assert!(coordinator.is_server());
    assert_eq!(status.generation, 1);
    wait_until("node3 thawed", || {
        let status = bystander.status();
        status.phase == Phase::Active && !status.failover_pending
    })
    .await;

    // The coordinator accepts a new hand-off right away.
    drop(op);
    coordinator.request_voluntary_failover("node3").await.unwrap();
    wait_until("node3 promoted", || {
        bystander.is_server() && bystander.status().phase == Phase::Active
    })
    .await;
    assert!(!coordinator.is_server());
    assert_eq!(bystander.status().generation, 2);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_involuntary_failover_keeps_one_coordinator() {
    let mut cluster = TestCluster::start(3).await;
    let liveness = ManualLiveness::new();
    cluster.instance(2).attach_liveness(&liveness);
    cluster.instance(3).attach_liveness(&liveness);

    liveness.report_down(ord(1));
    let (n1, n2, n3) = (
        cluster.instance(1).clone(),
        cluster.instance(2).clone(),
        cluster.instance(3).clone(),
    );
    wait_until("node1 dropped", || {
        !n2.registry().is_connected(ord(1))
            && !n3.registry().is_connected(ord(1))
            && !n1.registry().is_connected(ord(2))
            && !n1.registry().is_connected(ord(3))
    })
    .await;

    n3.set_coordinator(ord(2), 3).await.unwrap();
    n2.set_coordinator(ord(2), 3).await.unwrap();
    wait_until("node2 promoted", || {
        n2.is_server() && n2.status().phase == Phase::Active
    })
    .await;
    assert_eq!(n2.status().generation, 2);
    assert_eq!(n3.status().generation, 2);
    assert_eq!(n3.current_coordinator(), ord(2));
    assert_eq!(n3.status().phase, Phase::Active);
    assert!(!n3.is_server());

    // The isolated node still believes it coordinates until it reconnects and
    // learns the newer generation.
    assert!(n1.is_server());
    cluster.connect(1, 2).await;
    wait_until("node1 stepped down", || !n1.is_server()).await;
    assert_eq!(n1.current_coordinator(), ord(2));
    assert_eq!(n1.status().generation, 2);
    assert_eq!(cluster.servers(), vec![2]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_unreadable_control_block_keeps_target_frozen() {
    let cluster = TestCluster::start(3).await;
    cluster.node(2).store.corrupt(ControlKind::BlockMap);

    cluster
        .instance(1)
        .request_voluntary_failover("node2")
        .await
        .unwrap();
    let target = cluster.instance(2);
    wait_until("node2 frozen", || target.status().phase == Phase::Frozen).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(target.status().phase, Phase::Frozen);
    assert!(!target.is_server());
    assert!(target.recovery_required().await.unwrap());

    // A restart on the same store comes back frozen as well.
    let restarted =
        TestNode::start_with_store(node_config(2, 3), cluster.node(2).store.clone()).await;
    assert_eq!(restarted.instance.status().phase, Phase::Frozen);
    assert!(restarted.instance.recovery_required().await.unwrap());
    restarted.instance.shutdown().await;

    cluster.node(2).store.repair(ControlKind::BlockMap);
    target.set_coordinator(ord(2), 3).await.unwrap();
    wait_until("node2 promoted", || {
        target.is_server() && target.status().phase == Phase::Active
    })
    .await;
    assert!(!target.recovery_required().await.unwrap());
    assert_eq!(cluster.servers(), vec![2]);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_host_off_after_unmount() {
    let cluster = TestCluster::start(3).await;
    let coordinator = cluster.instance(1);

    let err = cluster
        .instance(2)
        .set_admin_state(ord(3), AdminState::Off)
        .await
        .unwrap_err();
    assert!(matches!(err, MetaError::NotCoordinator { .. }));

    coordinator
        .set_admin_state(ord(3), AdminState::Off)
        .await
        .unwrap();
    let session = coordinator.registry().get(ord(3), false).unwrap();
    assert!(session
        .flags()
        .intersects(SessionFlags::OFF_PENDING | SessionFlags::OFF));

    wait_until("node3 off", || {
        session.flags().contains(SessionFlags::OFF) && !session.is_connected()
    })
    .await;
    assert!(!session.flags().contains(SessionFlags::OFF_PENDING));
    assert!(!cluster.instance(3).failover().is_mounted());
    cluster.shutdown().await;
}

fn raw_init(ordinal: u32) -> WireMessage {
    let mut init = WireMessage::new(
        Command::Mount(MountOp::Init),
        Originator::Client,
        Payload::Mount(MountPayload {
            host_name: FixedName::new(&host_name(ordinal)),
            fs_name: FixedName::new(FS_NAME),
            status: STATUS_MOUNTED,
            coordinator: 1,
            max_ordinal: ordinal,
            generation: 1,
            ..Default::default()
        }),
    );
    init.header.origin = ord(ordinal);
    init.header.destination = ord(1);
    init.header.fs_id = 1;
    init.header.fs_generation = 1;
    init.header.coord_generation = 1;
    init
}

#[tokio::test(start_paused = true)]
async fn test_silent_host_forced_off_after_timeout() {
    let node = TestNode::start(node_config(1, 2)).await;
    let coordinator = &node.instance;
    let (local, remote) = SimLink::pair("node1", "node2");
    let remote = Arc::new(remote);

    let frame = codec::encode(&raw_init(2)).unwrap();
    let (accepted, reply) = tokio::join!(accept_peer(coordinator, Arc::new(local)), async {
        remote.send_frame(&frame).await.unwrap();
        remote.recv_frame().await.unwrap()
    });
    assert_eq!(accepted.unwrap(), ord(2));
    let reply = codec::decode(&reply).unwrap();
    assert_eq!(reply.header.error, 0);

    coordinator
        .set_admin_state(ord(2), AdminState::Off)
        .await
        .unwrap();
    let session = coordinator.registry().get(ord(2), false).unwrap();

    tokio::time::sleep(Duration::from_secs(19)).await;
    assert!(session.flags().contains(SessionFlags::OFF_PENDING));
    assert!(session.is_connected());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(session.flags().contains(SessionFlags::OFF));
    assert!(!session.is_connected());

    // The peer saw the notice, then the connection closing.
    let notice = codec::decode(&remote.recv_frame().await.unwrap()).unwrap();
    assert_eq!(notice.command(), Command::Notify(NotifyOp::HostOff));
    assert!(remote.recv_frame().await.is_err());

    // A disabled host cannot come back until it is enabled again.
    let (local, remote) = SimLink::pair("node1", "node2");
    let frame = codec::encode(&raw_init(2)).unwrap();
    let (accepted, reply) = tokio::join!(accept_peer(coordinator, Arc::new(local)), async {
        remote.send_frame(&frame).await.unwrap();
        remote.recv_frame().await.unwrap()
    });
    assert!(matches!(accepted, Err(MetaError::HostDisabled(o)) if o == ord(2)));
    assert_eq!(codec::decode(&reply).unwrap().header.error, 112);
    node.instance.shutdown().await;
}

#[tokio::test]
async fn test_congested_peer_uses_retry_budget() {
    let cluster = TestCluster::start(2).await;
    let coordinator = cluster.instance(1);
    let link = cluster.link(1, 2);
    let notice = || {
        let mut msg = WireMessage::new(
            Command::Notify(NotifyOp::Dnlc),
            Originator::Server,
            Payload::empty_for(Command::Notify(NotifyOp::Dnlc)),
        );
        msg.header.wait_flag = sharefs_transport::WaitFlag::OneWay;
        msg
    };

    link.inject(SimFault::Congested);
    let before = link.send_attempts();
    let err = coordinator
        .messenger()
        .send(ord(2), notice())
        .await
        .unwrap_err();
    assert!(matches!(err, MetaError::PeerBlocked { attempts: 6, .. }));
    assert_eq!(link.send_attempts() - before, 6);
    let session = coordinator.registry().get(ord(2), false).unwrap();
    assert!(session.flags().contains(SessionFlags::SOCK_BLOCKED));

    let before = link.send_attempts();
    let err = coordinator
        .messenger()
        .send(ord(2), notice())
        .await
        .unwrap_err();
    assert!(matches!(err, MetaError::PeerBlocked { attempts: 3, .. }));
    assert_eq!(link.send_attempts() - before, 3);
    assert!(session.is_connected());

    link.inject(SimFault::None);
    coordinator.messenger().send(ord(2), notice()).await.unwrap();
    let cache = &cluster.node(2).cache;
    wait_until("name cache purge", || cache.purges() >= 1).await;
    cluster.shutdown().await;
}
