// Cluster scenarios: shard distribution, node loss, graceful leave and
// rerouting, on an in-process three-node cluster sharing one store.

use actor::{ActorPath, Error as ActorError, Event, Message, Response};
use cluster::{ClusterConfig, LoopbackTransport, NodeAddress, NodeId};
use sharding::{
    CoordinatorCommand, CoordinatorResponse, Effects, Entity, EntityHost,
    EntityId, ShardCoordinator, ShardId, ShardedNode, ShardingConfig,
    region_path, shard_for_entity,
};
use store::{DbManager, MemoryManager};

use serde::{Deserialize, Serialize};
use tracing_test::traced_test;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

// A durable score-keeping entity (one per match table).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Table {
    points: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum TableCommand {
    Score(u64),
    Total,
}

impl Message for TableCommand {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum TableOutcome {
    Scored(u64),
    Total(u64),
}

impl Response for TableOutcome {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PointsScored(u64);

impl Event for PointsScored {}

impl Entity for Table {
    const TYPE: &'static str = "table";

    type Command = TableCommand;
    type Outcome = TableOutcome;
    type Change = PointsScored;

    fn initialize(_id: &EntityId) -> Self {
        Table { points: 0 }
    }

    fn on_command(
        &self,
        _id: &EntityId,
        command: TableCommand,
    ) -> Result<Effects<Self>, ActorError> {
        match command {
            TableCommand::Score(points) => {
                Ok(Effects::reply(TableOutcome::Scored(
                    self.points + points,
                ))
                .with_change(PointsScored(points)))
            }
            TableCommand::Total => {
                Ok(Effects::reply(TableOutcome::Total(self.points)))
            }
        }
    }

    fn apply(&mut self, change: &PointsScored) {
        self.points += change.0;
    }
}

fn fast_cluster_config() -> ClusterConfig {
    ClusterConfig {
        gossip_interval: Duration::from_millis(50),
        gossip_fanout: 3,
        heartbeat_interval: Duration::from_millis(50),
        missed_heartbeats: 3,
    }
}

fn fast_sharding_config() -> ShardingConfig {
    ShardingConfig {
        shard_count: 30,
        passivate_after: Duration::from_secs(60),
        passivation_interval: Duration::from_secs(5),
        ask_timeout: Duration::from_secs(5),
        allocation_timeout: Duration::from_secs(2),
        allocation_retry_interval: Duration::from_millis(100),
        handoff_timeout: Duration::from_secs(5),
        max_concurrent_handoffs: 3,
        buffer_capacity: 1024,
        downing_grace: Duration::from_millis(600),
    }
}

struct Cluster {
    transport: Arc<LoopbackTransport>,
    nodes: Vec<ShardedNode>,
}

async fn spawn_cluster(names: &[&str], base_port: u16) -> Cluster {
    let transport = Arc::new(LoopbackTransport::new());
    // One shared store stands in for the external persistence
    // collaborator, so entity state survives node loss.
    let manager: Arc<dyn DbManager> = Arc::new(MemoryManager::default());
    let coordinator = NodeId::from(names[0]);
    let seed = NodeAddress::new("127.0.0.1", base_port);

    let mut nodes = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let seeds = if i == 0 { vec![] } else { vec![seed.clone()] };
        let node = ShardedNode::start(
            NodeId::from(*name),
            NodeAddress::new("127.0.0.1", base_port + i as u16),
            seeds,
            coordinator.clone(),
            1,
            fast_cluster_config(),
            fast_sharding_config(),
            transport.clone(),
            manager.clone(),
        )
        .await
        .expect("node should start");
        nodes.push(node);
    }
    Cluster { transport, nodes }
}

async fn wait_until_up(cluster: &Cluster, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    for node in &cluster.nodes {
        loop {
            let view = node.view().await.unwrap();
            if view.up_members().len() == expected {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "cluster should converge to {} Up members",
                expected
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

async fn assignments_of(node: &ShardedNode) -> BTreeMap<ShardId, NodeId> {
    let coordinator = node
        .system()
        .get_actor::<ShardCoordinator>(&ActorPath::from(
            "/user/coordinator-table",
        ))
        .await
        .expect("coordinator should run on the first node");
    match coordinator
        .ask(CoordinatorCommand::GetAssignments)
        .await
        .unwrap()
    {
        CoordinatorResponse::Assignments(assignments) => assignments,
        CoordinatorResponse::None => panic!("expected assignments"),
    }
}

/// Ids of entities covering every shard owned by `owner`.
fn entities_owned_by(
    assignments: &BTreeMap<ShardId, NodeId>,
    owner: &NodeId,
    shard_count: u32,
) -> Vec<EntityId> {
    let mut found = Vec::new();
    for i in 0..1000 {
        let id = EntityId::new(format!("table-{}", i));
        let shard = shard_for_entity(&id, shard_count);
        if assignments.get(&shard) == Some(owner)
            && !found
                .iter()
                .any(|e| shard_for_entity(e, shard_count) == shard)
        {
            found.push(id);
        }
    }
    found
}

#[tokio::test]
async fn test_shards_distribute_and_route_across_nodes() {
    let cluster =
        spawn_cluster(&["node-a", "node-b", "node-c"], 7551).await;
    wait_until_up(&cluster, 3).await;

    let client_a = cluster.nodes[0].register_entity::<Table>().await.unwrap();
    let client_b = cluster.nodes[1].register_entity::<Table>().await.unwrap();
    let client_c = cluster.nodes[2].register_entity::<Table>().await.unwrap();

    // Touch one entity per shard from node-a.
    for i in 0..30 {
        let outcome = client_a
            .send(
                EntityId::new(format!("table-{}", i)),
                TableCommand::Score(1),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TableOutcome::Scored(1));
    }

    // Every entity is reachable from any node, with the same state.
    for i in 0..30 {
        let id = EntityId::new(format!("table-{}", i));
        assert_eq!(
            client_b.send(id.clone(), TableCommand::Total).await.unwrap(),
            TableOutcome::Total(1)
        );
        assert_eq!(
            client_c.send(id, TableCommand::Total).await.unwrap(),
            TableOutcome::Total(1)
        );
    }

    // Least-loaded allocation spreads the shards over the three nodes.
    let assignments = assignments_of(&cluster.nodes[0]).await;
    for name in ["node-a", "node-b", "node-c"] {
        let owned = assignments
            .values()
            .filter(|owner| **owner == NodeId::from(name))
            .count();
        assert!(
            owned >= 8,
            "{} owns {} shards, expected a fair share",
            name,
            owned
        );
    }
}

#[tokio::test]
async fn test_single_live_instance_per_entity() {
    let cluster = spawn_cluster(&["node-a", "node-b"], 7651).await;
    wait_until_up(&cluster, 2).await;

    let client_a = cluster.nodes[0].register_entity::<Table>().await.unwrap();
    let _client_b =
        cluster.nodes[1].register_entity::<Table>().await.unwrap();

    let id = EntityId::from("table-solo");
    client_a
        .send(id.clone(), TableCommand::Score(3))
        .await
        .unwrap();

    // Exactly one node hosts the live actor.
    let shard = shard_for_entity(&id, 30);
    let host_path = region_path::<Table>()
        / format!("shard-{}", shard).as_str()
        / id.as_str();
    let mut live = 0;
    for node in &cluster.nodes {
        if node
            .system()
            .get_actor::<EntityHost<Table>>(&host_path)
            .await
            .is_some()
        {
            live += 1;
        }
    }
    assert_eq!(live, 1, "exactly one live instance cluster-wide");
}

// Scenario: a node dies; its shards are reassigned within the grace
// period and routing succeeds afterwards with the flushed state.
#[tokio::test]
async fn test_node_loss_reassigns_shards() {
    let cluster =
        spawn_cluster(&["node-a", "node-b", "node-c"], 7751).await;
    wait_until_up(&cluster, 3).await;

    let client_a = cluster.nodes[0].register_entity::<Table>().await.unwrap();
    let _client_b =
        cluster.nodes[1].register_entity::<Table>().await.unwrap();
    let _client_c =
        cluster.nodes[2].register_entity::<Table>().await.unwrap();

    for i in 0..30 {
        client_a
            .send(
                EntityId::new(format!("table-{}", i)),
                TableCommand::Score(5),
            )
            .await
            .unwrap();
    }

    let node_b = NodeId::from("node-b");
    let assignments = assignments_of(&cluster.nodes[0]).await;
    let orphans = entities_owned_by(&assignments, &node_b, 30);
    assert!(!orphans.is_empty(), "node-b should own some shards");

    // node-b dies without warning.
    cluster
        .transport
        .unbind(cluster.nodes[1].address())
        .await;
    cluster.nodes[1].shutdown();

    // Within the failure-detection plus grace budget, every shard node-b
    // owned is reassigned to a surviving node.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let assignments = assignments_of(&cluster.nodes[0]).await;
        if !assignments.values().any(|owner| *owner == node_b) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "node-b's shards should be reassigned"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Routing to the reassigned entities succeeds, and the shared store
    // returns the state they had flushed.
    for id in orphans {
        let outcome = client_a
            .send(id.clone(), TableCommand::Total)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TableOutcome::Total(5),
            "entity {} should recover its flushed state",
            id
        );
    }
}

// Scenario: a stale region cache points at a node that handed its shard
// off; the message is rerouted to the new owner without being lost.
#[tokio::test]
#[traced_test]
async fn test_graceful_leave_reroutes_stale_caches() {
    let cluster = spawn_cluster(&["node-a", "node-b"], 7851).await;
    wait_until_up(&cluster, 2).await;

    let client_a = cluster.nodes[0].register_entity::<Table>().await.unwrap();
    let _client_b =
        cluster.nodes[1].register_entity::<Table>().await.unwrap();

    for i in 0..30 {
        client_a
            .send(
                EntityId::new(format!("table-{}", i)),
                TableCommand::Score(2),
            )
            .await
            .unwrap();
    }
    let node_b = NodeId::from("node-b");
    let assignments = assignments_of(&cluster.nodes[0]).await;
    let moved = entities_owned_by(&assignments, &node_b, 30);
    assert!(!moved.is_empty(), "node-b should own some shards");

    // node-a's region now caches node-b as the owner of those shards.
    // node-b leaves gracefully: its shards are handed off, flushing state.
    cluster.nodes[1].leave().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let assignments = assignments_of(&cluster.nodes[0]).await;
        if !assignments.values().any(|owner| *owner == node_b) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "node-b's shards should be handed off"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // The stale cache entries are invalidated on first use and every
    // message reaches the current owner with the drained state intact.
    for id in moved {
        let outcome = client_a
            .send(id.clone(), TableCommand::Total)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TableOutcome::Total(2),
            "entity {} should survive the handoff",
            id
        );
    }

    assert!(logs_contain("handing off"));
}

// No message is lost while its shard is being handed off.
#[tokio::test]
async fn test_no_message_loss_during_handoff() {
    let cluster = spawn_cluster(&["node-a", "node-b"], 7951).await;
    wait_until_up(&cluster, 2).await;

    let client_a = cluster.nodes[0].register_entity::<Table>().await.unwrap();
    let _client_b =
        cluster.nodes[1].register_entity::<Table>().await.unwrap();

    // Find an entity hosted by node-b.
    for i in 0..30 {
        client_a
            .send(
                EntityId::new(format!("table-{}", i)),
                TableCommand::Score(0),
            )
            .await
            .unwrap();
    }
    let node_b = NodeId::from("node-b");
    let assignments = assignments_of(&cluster.nodes[0]).await;
    let targets = entities_owned_by(&assignments, &node_b, 30);
    let target = targets.first().expect("node-b should own a shard").clone();

    // Keep scoring while node-b leaves; every delivery must settle with
    // an explicit outcome and none may be lost.
    let scorer = {
        let client = client_a.clone();
        let target = target.clone();
        tokio::spawn(async move {
            let mut delivered = 0u64;
            for _ in 0..40 {
                if client
                    .send(target.clone(), TableCommand::Score(1))
                    .await
                    .is_ok()
                {
                    delivered += 1;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            delivered
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cluster.nodes[1].leave().await.unwrap();

    let delivered = scorer.await.unwrap();
    assert!(delivered > 0, "some deliveries should succeed");

    let outcome = client_a
        .send(target, TableCommand::Total)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TableOutcome::Total(delivered),
        "every acknowledged delivery must be applied exactly once"
    );
}
