//! Multi-peer coordination tests.
//!
//! Peers are wired together with `LocalNetwork`. Peer ids are derived from
//! the task's content hash so placement is known in advance: the hash
//! itself is at distance 0, its bitwise complement at distance 256.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tokio::sync::mpsc;

use tasknet::coordination::{
    ClockEvent, ContentHash, Envelope, MerkleClock, PeerMessage, PeerTable, Placement, Transport,
};
use tasknet::core::task::TaskId;
use tasknet::{
    CollectSynthesizer, Config, Coordinator, LocalNetwork, PeerId, TaskEvent, TaskGraph, TaskNet,
    TaskNode, TaskResult,
};

use crate::fixtures::{eventually, test_config, Recorder, WAIT};

fn near(hash: &ContentHash) -> PeerId {
    PeerId::from_bytes(*hash.as_bytes())
}

fn far(hash: &ContentHash) -> PeerId {
    let mut bytes = *hash.as_bytes();
    for b in bytes.iter_mut() {
        *b = !*b;
    }
    PeerId::from_bytes(bytes)
}

async fn start_peer(
    network: &LocalNetwork,
    config: &Config,
    id: PeerId,
    peers: &[PeerId],
    recorder: Arc<Recorder>,
) -> TaskNet {
    let inbound = network.register(id).await;
    let coordinator = Coordinator::new(id, config.coordination.clone(), Arc::new(network.clone()))
        .with_peers(peers.iter().copied());
    TaskNet::builder(config.clone(), recorder, Arc::new(CollectSynthesizer))
        .with_coordinator(coordinator, inbound)
        .start()
        .expect("start peer")
}

/// Wait until `net` has fresh gossip from `peer` advertising capacity.
async fn await_eligible(net: &TaskNet, peer: PeerId) {
    eventually("peer gossip", move || async move {
        net.coordinator()
            .expect("coordinator attached")
            .peers()
            .await
            .map(|peers| {
                peers
                    .iter()
                    .any(|p| p.id == peer && p.last_seen.is_some() && p.load < p.capacity)
            })
            .unwrap_or(false)
    })
    .await;
}

fn single(task: TaskNode) -> (TaskGraph, TaskId) {
    let id = task.id;
    let mut graph = TaskGraph::new();
    graph.add_task(task);
    (graph, id)
}

/// Test: Delegation between two live peers
/// Given a delegable task whose hash is nearest to peer B
/// When peer A submits it
/// Then B executes it and A records B's result
#[tokio::test]
async fn test_two_peer_delegation() {
    let task = TaskNode::new("remote-job", json!({ "n": 1 })).delegable();
    let hash = task.content_hash();
    let (a_id, b_id) = (far(&hash), near(&hash));

    let network = LocalNetwork::new(64);
    let config = test_config();
    let a_rec = Recorder::labelled("a");
    let b_rec = Recorder::labelled("b");
    let a = start_peer(&network, &config, a_id, &[b_id], a_rec.clone()).await;
    let b = start_peer(&network, &config, b_id, &[a_id], b_rec.clone()).await;
    let mut events = a.subscribe();

    await_eligible(&a, b_id).await;

    let (graph, id) = single(task);
    a.submit(graph).await.unwrap();
    let result = a.wait_timeout(id, WAIT).await.unwrap();

    assert_eq!(
        result,
        TaskResult::Completed(b_rec.output("remote-job", vec![]))
    );
    assert_eq!(a_rec.count("remote-job"), 0);
    assert_eq!(b_rec.count("remote-job"), 1);

    let mut delegated = false;
    while let Ok(event) = events.try_recv() {
        if event == (TaskEvent::Delegated { task_id: id, peer: b_id }) {
            delegated = true;
        }
    }
    assert!(delegated);

    // A's delegation record reaches B through gossip.
    let a_clock = a.coordinator().unwrap().clock().await.unwrap();
    let entry = a_clock
        .heads()
        .find(|e| e.peer == a_id)
        .cloned()
        .expect("A recorded events");
    let b_ref = &b;
    eventually("B observes A's clock", move || {
        let hash = entry.hash;
        async move {
            b_ref
                .coordinator()
                .unwrap()
                .clock()
                .await
                .map(|clock| clock.get(&hash).is_some())
                .unwrap_or(false)
        }
    })
    .await;

    eventually("B records the hosted task", move || async move {
        b_ref
            .coordinator()
            .unwrap()
            .clock()
            .await
            .map(|clock| {
                clock.heads().any(|e| {
                    matches!(
                        e.event,
                        ClockEvent::TaskHosted { task, from } if task == id && from == a_id
                    )
                })
            })
            .unwrap_or(false)
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}

/// Test: Non-delegable tasks stay local even when a closer peer exists
#[tokio::test]
async fn test_non_delegable_runs_locally() {
    let task = TaskNode::new("local-job", json!({ "n": 2 }));
    let hash = task.content_hash();
    let (a_id, b_id) = (far(&hash), near(&hash));

    let network = LocalNetwork::new(64);
    let config = test_config();
    let a_rec = Recorder::labelled("a");
    let b_rec = Recorder::labelled("b");
    let a = start_peer(&network, &config, a_id, &[b_id], a_rec.clone()).await;
    let b = start_peer(&network, &config, b_id, &[a_id], b_rec.clone()).await;
    await_eligible(&a, b_id).await;

    let (graph, id) = single(task);
    a.submit(graph).await.unwrap();
    let result = a.wait_timeout(id, WAIT).await.unwrap();
    assert_eq!(result, TaskResult::Completed(a_rec.output("local-job", vec![])));
    assert_eq!(b_rec.count("local-job"), 0);

    a.shutdown().await;
    b.shutdown().await;
}

/// A scripted remote peer: announces capacity once, then forwards every
/// delegation offer it receives to `offers`, rejecting it first if asked.
struct FakePeer {
    id: PeerId,
    offers: mpsc::UnboundedReceiver<Envelope>,
}

async fn fake_peer(network: &LocalNetwork, id: PeerId, target: PeerId, reject: bool) -> FakePeer {
    let mut inbound = network.register(id).await;
    network
        .send(
            target,
            Envelope {
                from: id,
                message: PeerMessage::Gossip {
                    entries: Vec::new(),
                    load: 0,
                    capacity: 4,
                },
            },
        )
        .await
        .unwrap();

    let (offers_tx, offers) = mpsc::unbounded_channel();
    let network = network.clone();
    tokio::spawn(async move {
        while let Some(envelope) = inbound.recv().await {
            if let PeerMessage::DelegationOffer { offer_id, .. } = &envelope.message {
                if reject {
                    let reply = Envelope {
                        from: id,
                        message: PeerMessage::DelegationReject {
                            offer_id: *offer_id,
                            reason: "busy".to_string(),
                        },
                    };
                    let _ = network.send(envelope.from, reply).await;
                }
                let _ = offers_tx.send(envelope);
            }
        }
    });
    FakePeer { id, offers }
}

async fn assert_falls_back(reject: bool) {
    let task = TaskNode::new("fallback-job", json!({ "reject": reject })).delegable();
    let hash = task.content_hash();
    let (a_id, fake_id) = (far(&hash), near(&hash));

    let network = LocalNetwork::new(64);
    let config = test_config();
    let a_rec = Recorder::labelled("a");
    let a = start_peer(&network, &config, a_id, &[], a_rec.clone()).await;
    let mut fake = fake_peer(&network, fake_id, a_id, reject).await;
    await_eligible(&a, fake.id).await;
    let mut events = a.subscribe();

    let (graph, id) = single(task);
    a.submit(graph).await.unwrap();
    let result = a.wait_timeout(id, WAIT).await.unwrap();

    assert_eq!(result, TaskResult::Completed(a_rec.output("fallback-job", vec![])));
    assert_eq!(a_rec.count("fallback-job"), 1);

    let offer = tokio::time::timeout(WAIT, fake.offers.recv())
        .await
        .unwrap()
        .expect("offer reached the fake peer");
    assert_eq!(offer.from, a_id);

    let mut fell_back = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TaskEvent::DelegationFallback { task_id, .. } if task_id == id) {
            fell_back = true;
        }
    }
    assert!(fell_back);
    a.shutdown().await;
}

/// Test: Rejected offer
/// Given the nearest peer rejects every offer
/// Then the task runs locally
#[tokio::test]
async fn test_rejected_offer_falls_back_locally() {
    assert_falls_back(true).await;
}

/// Test: Unanswered offer
/// Given the nearest peer never answers
/// Then the offer times out and the task runs locally
#[tokio::test]
async fn test_unanswered_offer_falls_back_locally() {
    assert_falls_back(false).await;
}

/// Test: A peer with no spare capacity is never offered work
#[tokio::test]
async fn test_full_peer_not_chosen() {
    let task = TaskNode::new("capacity-job", json!(null)).delegable();
    let hash = task.content_hash();
    let (a_id, b_id) = (far(&hash), near(&hash));

    let network = LocalNetwork::new(64);
    let config = test_config();
    let mut full = test_config();
    full.coordination.accept_capacity = 0;

    let a_rec = Recorder::labelled("a");
    let b_rec = Recorder::labelled("b");
    let a = start_peer(&network, &config, a_id, &[b_id], a_rec.clone()).await;
    let b = start_peer(&network, &full, b_id, &[a_id], b_rec.clone()).await;

    let a_ref = &a;
    eventually("gossip from full peer", move || async move {
        a_ref
            .coordinator()
            .unwrap()
            .peers()
            .await
            .map(|peers| peers.iter().any(|p| p.id == b_id && p.last_seen.is_some()))
            .unwrap_or(false)
    })
    .await;

    let (graph, id) = single(task);
    a.submit(graph).await.unwrap();
    let result = a.wait_timeout(id, WAIT).await.unwrap();
    assert_eq!(result, TaskResult::Completed(a_rec.output("capacity-job", vec![])));
    assert_eq!(b_rec.count("capacity-job"), 0);

    a.shutdown().await;
    b.shutdown().await;
}

fn random_clock(rng: &mut StdRng, owner: PeerId, events: usize) -> MerkleClock {
    let mut clock = MerkleClock::new(owner);
    for _ in 0..events {
        let event = if rng.gen_bool(0.5) {
            ClockEvent::TaskScheduled { task: TaskId::new() }
        } else {
            ClockEvent::TaskCompleted { task: TaskId::new() }
        };
        clock.append(event);
    }
    clock
}

/// Test: Clock merge is commutative, associative and idempotent
#[test]
fn test_clock_merge_laws() {
    let mut rng = StdRng::seed_from_u64(7);
    for round in 0..20 {
        let ids = [
            PeerId::from_name(&format!("a-{round}")),
            PeerId::from_name(&format!("b-{round}")),
            PeerId::from_name(&format!("c-{round}")),
        ];
        let n_a = rng.gen_range(0..6);
        let mut a = random_clock(&mut rng, ids[0], n_a);
        let n_b = rng.gen_range(0..6);
        let b = random_clock(&mut rng, ids[1], n_b);
        let n_c = rng.gen_range(0..6);
        let mut c = random_clock(&mut rng, ids[2], n_c);

        // Some shared history so merges overlap.
        a.merge(&b);
        a.append(ClockEvent::TaskCompleted { task: TaskId::new() });
        c.merge(&a);

        assert_eq!(a.merged(&b), b.merged(&a));
        assert_eq!(a.merged(&b).merged(&c), a.merged(&b.merged(&c)));
        assert_eq!(a.merged(&a), a);
        assert_eq!(a.merged(&b).merged(&b), a.merged(&b));
    }
}

/// Test: Causality survives merging
#[test]
fn test_clock_causality_across_peers() {
    let a_id = PeerId::from_name("a");
    let b_id = PeerId::from_name("b");
    let mut a = MerkleClock::new(a_id);
    let mut b = MerkleClock::new(b_id);

    let first = a.append(ClockEvent::TaskScheduled { task: TaskId::new() });
    let concurrent = b.append(ClockEvent::TaskScheduled { task: TaskId::new() });
    b.observe(first.clone()).unwrap();
    let second = b.append(ClockEvent::TaskCompleted { task: TaskId::new() });

    a.merge(&b);
    assert!(a.precedes(&first.hash, &second.hash));
    assert!(a.precedes(&concurrent.hash, &second.hash));
    assert!(a.concurrent(&first.hash, &concurrent.hash));
    assert!(!a.precedes(&second.hash, &first.hash));
}

/// Test: Every peer computes the same placement
/// Given several peers that all see each other as eligible
/// Then each peer's table agrees on the winner for every hash
#[test]
fn test_placement_is_deterministic_across_peers() {
    let mut rng = StdRng::seed_from_u64(42);
    let peers: Vec<PeerId> = (0..5).map(|_| PeerId::from_bytes(rng.gen())).collect();
    let now = tokio::time::Instant::now();

    let tables: Vec<PeerTable> = peers
        .iter()
        .map(|local| {
            let mut table = PeerTable::new(*local, Duration::from_secs(5));
            // Insert in a rotated order so tables differ in construction.
            let offset = peers.iter().position(|p| p == local).unwrap_or(0);
            for i in 0..peers.len() {
                let peer = peers[(i + offset) % peers.len()];
                table.observe(peer, 0, 4, now);
            }
            table
        })
        .collect();

    for _ in 0..100 {
        let hash = ContentHash::from_bytes(rng.gen());
        let winner = peers
            .iter()
            .map(|p| (p.distance(&hash), *p))
            .min()
            .map(|(_, p)| p)
            .unwrap();
        for table in &tables {
            let chosen = match table.place(&hash, now, 256) {
                Placement::Local => table.local(),
                Placement::Delegate(peer) => peer,
            };
            assert_eq!(chosen, winner);
        }
    }
}

/// Test: A winner beyond the distance bound is not used
#[test]
fn test_placement_respects_max_distance() {
    let hash = ContentHash::from_bytes([0u8; 32]);
    let local = PeerId::from_bytes([0xff; 32]);
    let mut remote_bytes = [0u8; 32];
    remote_bytes[..4].copy_from_slice(&[0xff; 4]);
    let remote = PeerId::from_bytes(remote_bytes);

    let now = tokio::time::Instant::now();
    let mut table = PeerTable::new(local, Duration::from_secs(5));
    table.observe(remote, 0, 1, now);

    assert_eq!(remote.distance(&hash), 32);
    assert_eq!(table.place(&hash, now, 256), Placement::Delegate(remote));
    assert_eq!(table.place(&hash, now, 32), Placement::Delegate(remote));
    assert_eq!(table.place(&hash, now, 31), Placement::Local);
}
