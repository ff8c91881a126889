// Integration tests for the membership layer: gossip convergence, failure
// detection and downing across an in-process cluster.

use actor::{ActorRef, ActorSystem, SystemRef};
use cluster::{
    CHANNEL_GOSSIP, ClusterConfig, GossipCommand, GossipEndpoint,
    GossipResponse, Gossiper, LoopbackTransport, Member, MemberStatus,
    MembershipEvent, MembershipView, NodeAddress, NodeId, Transport,
};

use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

fn fast_config() -> ClusterConfig {
    ClusterConfig {
        gossip_interval: Duration::from_millis(50),
        gossip_fanout: 3,
        heartbeat_interval: Duration::from_millis(50),
        missed_heartbeats: 3,
    }
}

struct TestNode {
    #[allow(dead_code)]
    system: SystemRef,
    gossiper: ActorRef<Gossiper>,
    address: NodeAddress,
}

async fn spawn_node(
    name: &str,
    port: u16,
    seeds: Vec<NodeAddress>,
    transport: &LoopbackTransport,
) -> TestNode {
    let (system, _runner) = ActorSystem::create(CancellationToken::new());
    let address = NodeAddress::new("127.0.0.1", port);
    let myself = Member::new(
        NodeId::from(name),
        address.clone(),
        MemberStatus::Joining,
        1,
    );
    let gossiper = Gossiper::new(
        myself,
        seeds,
        fast_config(),
        Arc::new(transport.clone()),
    );
    let gossiper = system
        .create_root_actor("gossiper", gossiper)
        .await
        .expect("gossiper should start");
    transport
        .bind(
            address.clone(),
            CHANNEL_GOSSIP,
            Arc::new(GossipEndpoint::new(gossiper.clone())),
        )
        .await;
    TestNode {
        system,
        gossiper,
        address,
    }
}

async fn view_of(node: &TestNode) -> MembershipView {
    match node.gossiper.ask(GossipCommand::GetView).await.unwrap() {
        GossipResponse::View(view) => view,
        GossipResponse::None => panic!("expected a view"),
    }
}

/// Polls a node's view until the predicate holds or the deadline passes.
async fn wait_for_view<F>(
    node: &TestNode,
    deadline: Duration,
    predicate: F,
) -> bool
where
    F: Fn(&MembershipView) -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate(&view_of(node).await) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
#[traced_test]
async fn test_three_nodes_converge_to_up() {
    let transport = LoopbackTransport::new();
    let seed_address = NodeAddress::new("127.0.0.1", 2551);

    let a = spawn_node("node-a", 2551, vec![], &transport).await;
    let b =
        spawn_node("node-b", 2552, vec![seed_address.clone()], &transport)
            .await;
    let c =
        spawn_node("node-c", 2553, vec![seed_address.clone()], &transport)
            .await;

    for node in [&a, &b, &c] {
        let converged = wait_for_view(node, Duration::from_secs(5), |view| {
            view.up_members().len() == 3
        })
        .await;
        assert!(converged, "all three nodes should see three Up members");
    }

    // Converged views agree on the leader.
    let leader_a = view_of(&a).await.leader().cloned();
    let leader_b = view_of(&b).await.leader().cloned();
    assert_eq!(leader_a, Some(NodeId::from("node-a")));
    assert_eq!(leader_a, leader_b);

    assert!(logs_contain("Membership event"));
}

#[tokio::test]
async fn test_dead_node_becomes_unreachable_by_quorum() {
    let transport = LoopbackTransport::new();
    let seed_address = NodeAddress::new("127.0.0.1", 3551);

    let a = spawn_node("node-a", 3551, vec![], &transport).await;
    let b =
        spawn_node("node-b", 3552, vec![seed_address.clone()], &transport)
            .await;
    let c =
        spawn_node("node-c", 3553, vec![seed_address.clone()], &transport)
            .await;

    assert!(
        wait_for_view(&a, Duration::from_secs(5), |view| {
            view.up_members().len() == 3
        })
        .await
    );

    let mut events = a.gossiper.subscribe();

    // Kill node-b: its endpoint disappears from the transport.
    transport.unbind(&b.address).await;

    let unreachable = wait_for_view(&a, Duration::from_secs(5), |view| {
        view.is_unreachable(&NodeId::from("node-b"))
    })
    .await;
    assert!(unreachable, "node-b should be declared unreachable");

    // The transition was published as an event.
    let mut saw_unreachable = false;
    while let Ok(event) = events.try_recv() {
        if let MembershipEvent::MemberUnreachable(member) = event {
            if member.id == NodeId::from("node-b") {
                saw_unreachable = true;
            }
        }
    }
    assert!(saw_unreachable);

    // node-c agrees through gossip.
    assert!(
        wait_for_view(&c, Duration::from_secs(5), |view| {
            view.is_unreachable(&NodeId::from("node-b"))
        })
        .await
    );
}

#[tokio::test]
async fn test_unreachability_is_reversible() {
    let transport = LoopbackTransport::new();
    let seed_address = NodeAddress::new("127.0.0.1", 4551);

    let a = spawn_node("node-a", 4551, vec![], &transport).await;
    let b =
        spawn_node("node-b", 4552, vec![seed_address.clone()], &transport)
            .await;

    assert!(
        wait_for_view(&a, Duration::from_secs(5), |view| {
            view.up_members().len() == 2
        })
        .await
    );

    transport.unbind(&b.address).await;
    assert!(
        wait_for_view(&a, Duration::from_secs(5), |view| {
            view.is_unreachable(&NodeId::from("node-b"))
        })
        .await
    );

    // The node comes back: renewed contact retracts the suspicion.
    transport
        .bind(
            b.address.clone(),
            CHANNEL_GOSSIP,
            Arc::new(GossipEndpoint::new(b.gossiper.clone())),
        )
        .await;
    assert!(
        wait_for_view(&a, Duration::from_secs(5), |view| {
            !view.is_unreachable(&NodeId::from("node-b"))
        })
        .await,
        "node-b should become reachable again"
    );
    let view = view_of(&a).await;
    assert_eq!(
        view.get(&NodeId::from("node-b")).unwrap().status,
        MemberStatus::Up
    );
}

#[tokio::test]
async fn test_down_is_terminal_and_gossiped() {
    let transport = LoopbackTransport::new();
    let seed_address = NodeAddress::new("127.0.0.1", 5551);

    let a = spawn_node("node-a", 5551, vec![], &transport).await;
    let b =
        spawn_node("node-b", 5552, vec![seed_address.clone()], &transport)
            .await;
    let c =
        spawn_node("node-c", 5553, vec![seed_address.clone()], &transport)
            .await;

    assert!(
        wait_for_view(&a, Duration::from_secs(5), |view| {
            view.up_members().len() == 3
        })
        .await
    );

    transport.unbind(&b.address).await;
    a.gossiper
        .tell(GossipCommand::MarkDown(NodeId::from("node-b")))
        .await
        .unwrap();

    // The downing decision spreads to node-c.
    assert!(
        wait_for_view(&c, Duration::from_secs(5), |view| {
            view.get(&NodeId::from("node-b"))
                .map(|m| m.status == MemberStatus::Down)
                .unwrap_or(false)
        })
        .await
    );

    // A stale Up record for the same incarnation cannot resurrect it.
    let stale = Member::new(
        NodeId::from("node-b"),
        NodeAddress::new("127.0.0.1", 5552),
        MemberStatus::Up,
        1,
    );
    let mut stale_view = MembershipView::new();
    stale_view.upsert(stale);
    a.gossiper
        .tell(GossipCommand::Merge(stale_view))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        view_of(&a)
            .await
            .get(&NodeId::from("node-b"))
            .unwrap()
            .status,
        MemberStatus::Down
    );
}
