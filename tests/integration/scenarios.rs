//! End-to-end lifecycle tests.
//!
//! Each test starts its own `TaskNet`, submits a graph and follows it to a
//! terminal state through the public API.

use std::time::Duration;

use serde_json::json;

use tasknet::core::task::{CancelReason, TaskState};
use tasknet::{Subgraph, TaskEvent, TaskGraph, TaskNode, TaskResult};

use crate::fixtures::{eventually, start, test_config, wait_for_state, Recorder, WAIT};

fn position(events: &[TaskEvent], wanted: &TaskEvent) -> usize {
    events
        .iter()
        .position(|e| e == wanted)
        .unwrap_or_else(|| panic!("missing event {:?}", wanted))
}

/// Test: Linear chain
/// Given A -> B -> C
/// When A is held running
/// Then B and C stay pending, and the root result is C's result
#[tokio::test]
async fn test_linear_chain() {
    let recorder = Recorder::new();
    let net = start(test_config(), recorder.clone());
    let mut events = net.subscribe();

    let mut graph = TaskGraph::new();
    let a = TaskNode::new("gate-a", json!(null));
    let b = TaskNode::new("b", json!(null));
    let c = TaskNode::new("c", json!(null));
    let ids = [a.id, b.id, c.id];
    for task in [a, b, c] {
        graph.add_task(task);
    }
    let [a, b, c] = ids;
    graph.add_dependency(&a, &b).unwrap();
    graph.add_dependency(&b, &c).unwrap();

    let root = net.submit(graph).await.unwrap();
    assert_eq!(root, c);

    wait_for_state(&net, a, |s| *s == TaskState::Running).await;
    assert_eq!(net.status(b).await.unwrap(), TaskState::Pending);
    assert_eq!(net.status(c).await.unwrap(), TaskState::Pending);

    recorder.release();
    let result = net.wait_timeout(root, WAIT).await.unwrap();

    let expected = recorder.output(
        "c",
        vec![recorder.output("b", vec![recorder.output("gate-a", vec![])])],
    );
    assert_eq!(result, TaskResult::Completed(expected));
    assert_eq!(recorder.calls(), vec!["gate-a", "b", "c"]);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    let a_done = position(&seen, &TaskEvent::Completed { task_id: a });
    let b_ready = position(&seen, &TaskEvent::Ready { task_id: b });
    let b_done = position(&seen, &TaskEvent::Completed { task_id: b });
    let c_ready = position(&seen, &TaskEvent::Ready { task_id: c });
    assert!(a_done < b_ready);
    assert!(b_ready < b_done);
    assert!(b_done < c_ready);

    net.shutdown().await;
}

/// Test: Retry until success
/// Given a task that fails twice and max_retries = 3
/// When it runs
/// Then the executor is invoked exactly 3 times and the task completes
#[tokio::test]
async fn test_retry_then_succeed() {
    let recorder = Recorder::new();
    recorder.fail_times("flaky", 2);
    let mut config = test_config();
    config.retry.max_retries = 3;
    let net = start(config, recorder.clone());
    let mut events = net.subscribe();

    let mut graph = TaskGraph::new();
    let task = TaskNode::new("flaky", json!(null));
    let id = task.id;
    graph.add_task(task);

    net.submit(graph).await.unwrap();
    let result = net.wait_timeout(id, WAIT).await.unwrap();

    assert_eq!(result, TaskResult::Completed(recorder.output("flaky", vec![])));
    assert_eq!(recorder.count("flaky"), 3);
    assert_eq!(net.status(id).await.unwrap(), TaskState::Completed);
    assert_eq!(net.task(id).await.unwrap().retry_count, 2);

    let mut retries = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, TaskEvent::Retrying { task_id, .. } if task_id == id) {
            retries += 1;
        }
    }
    assert_eq!(retries, 2);

    net.shutdown().await;
}

/// Test: Retries exhausted
/// Given a task that always fails and max_retries = 1
/// When it runs
/// Then it fails after two attempts and its dependent is cancelled
#[tokio::test]
async fn test_retries_exhausted_blocks_dependents() {
    let recorder = Recorder::new();
    recorder.fail_times("doomed", 100);
    let mut config = test_config();
    config.retry.max_retries = 1;
    let net = start(config, recorder.clone());

    let mut graph = TaskGraph::new();
    let doomed = TaskNode::new("doomed", json!(null));
    let after = TaskNode::new("after", json!(null));
    let (doomed_id, after_id) = (doomed.id, after.id);
    graph.add_task(doomed);
    graph.add_task(after);
    graph.add_dependency(&doomed_id, &after_id).unwrap();

    net.submit(graph).await.unwrap();
    let result = net.wait_timeout(doomed_id, WAIT).await.unwrap();
    assert!(matches!(result, TaskResult::Failed(msg) if msg.contains("transient")));
    assert_eq!(recorder.count("doomed"), 2);

    assert_eq!(
        net.result(after_id).await.unwrap(),
        TaskResult::Cancelled(CancelReason::BlockedByFailedDependency {
            dependency: doomed_id
        })
    );
    assert_eq!(recorder.count("after"), 0);

    net.shutdown().await;
}

/// Test: Decomposition of a queued task
/// Given a ready task P waiting in the queue behind a busy worker
/// When P is decomposed into S1 -> S2
/// Then P's dependent waits on S2 and completes only after the subgraph
#[tokio::test]
async fn test_decompose_ready_task() {
    let recorder = Recorder::new();
    let mut config = test_config();
    config.workers.pool_size = 1;
    let net = start(config, recorder.clone());

    let mut blocker = TaskGraph::new();
    let gate = TaskNode::new("gate", json!(null));
    let gate_id = gate.id;
    blocker.add_task(gate);
    net.submit(blocker).await.unwrap();
    wait_for_state(&net, gate_id, |s| *s == TaskState::Running).await;

    let mut graph = TaskGraph::new();
    let p = TaskNode::new("p", json!(null));
    let c = TaskNode::new("c", json!(null));
    let (p_id, c_id) = (p.id, c.id);
    graph.add_task(p);
    graph.add_task(c);
    graph.add_dependency(&p_id, &c_id).unwrap();
    let root = net.submit(graph).await.unwrap();
    assert_eq!(net.status(p_id).await.unwrap(), TaskState::Scheduled);

    let s1 = TaskNode::new("s1", json!(null));
    let s2 = TaskNode::new("s2", json!(null));
    let (s1_id, s2_id) = (s1.id, s2.id);
    net.decompose(p_id, Subgraph::chain(vec![s1, s2])).await.unwrap();

    assert_eq!(net.dependencies(c_id).await.unwrap(), vec![s2_id]);
    assert_eq!(net.dependencies(s2_id).await.unwrap(), vec![s1_id]);
    assert_eq!(net.task(p_id).await.unwrap().id, s2_id);
    assert_eq!(net.status(root).await.unwrap(), TaskState::Pending);

    recorder.release();
    let result = net.wait_timeout(root, WAIT).await.unwrap();
    let expected = recorder.output(
        "c",
        vec![recorder.output("s2", vec![recorder.output("s1", vec![])])],
    );
    assert_eq!(result, TaskResult::Completed(expected));
    assert_eq!(recorder.count("p"), 0);

    net.shutdown().await;
}

/// Test: Decomposing a running task is rejected
#[tokio::test]
async fn test_decompose_running_task_rejected() {
    let recorder = Recorder::new();
    let net = start(test_config(), recorder.clone());

    let mut graph = TaskGraph::new();
    let gate = TaskNode::new("gate", json!(null));
    let gate_id = gate.id;
    graph.add_task(gate);
    net.submit(graph).await.unwrap();
    wait_for_state(&net, gate_id, |s| *s == TaskState::Running).await;

    let sub = Subgraph::chain(vec![TaskNode::new("x", json!(null))]);
    assert!(matches!(
        net.decompose(gate_id, sub).await,
        Err(tasknet::Error::Validation(_))
    ));

    recorder.release();
    net.wait_timeout(gate_id, WAIT).await.unwrap();
    net.shutdown().await;
}

/// Test: Cancellation cascade
/// Given A with two pending dependents B and C joined by D
/// When A is cancelled while running
/// Then B, C and D are cancelled and never executed
#[tokio::test]
async fn test_cancel_cascades_to_dependents() {
    let recorder = Recorder::new();
    let net = start(test_config(), recorder.clone());

    let mut graph = TaskGraph::new();
    let a = TaskNode::new("gate-a", json!(null));
    let b = TaskNode::new("b", json!(null));
    let c = TaskNode::new("c", json!(null));
    let d = TaskNode::synthesis("d");
    let (a_id, b_id, c_id, d_id) = (a.id, b.id, c.id, d.id);
    for task in [a, b, c, d] {
        graph.add_task(task);
    }
    graph.add_dependency(&a_id, &b_id).unwrap();
    graph.add_dependency(&a_id, &c_id).unwrap();
    graph.add_dependency(&b_id, &d_id).unwrap();
    graph.add_dependency(&c_id, &d_id).unwrap();

    let root = net.submit(graph).await.unwrap();
    assert_eq!(root, d_id);
    wait_for_state(&net, a_id, |s| *s == TaskState::Running).await;

    let cancelled = net.cancel(a_id).await.unwrap();
    assert_eq!(cancelled[0], a_id);
    assert_eq!(cancelled.len(), 4);

    assert_eq!(
        net.result(a_id).await.unwrap(),
        TaskResult::Cancelled(CancelReason::Requested)
    );
    for id in [b_id, c_id, d_id] {
        assert_eq!(
            net.result(id).await.unwrap(),
            TaskResult::Cancelled(CancelReason::DependencyCancelled { dependency: a_id })
        );
    }

    // The gated executor observes its token and returns.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.calls(), vec!["gate-a"]);
    assert!(net.running().await.is_empty());
    assert_eq!(
        net.status(a_id).await.unwrap(),
        TaskState::Cancelled {
            reason: CancelReason::Requested
        }
    );

    // Cancelling a finished task changes nothing.
    assert!(net.cancel(a_id).await.unwrap().is_empty());
    net.shutdown().await;
}

/// Test: Synthesis node
/// Given two leaves feeding a synthesis-only root
/// Then the root result is the leaf results in insertion order
#[tokio::test]
async fn test_synthesis_root() {
    let recorder = Recorder::new();
    let net = start(test_config(), recorder.clone());

    let mut graph = TaskGraph::new();
    let left = TaskNode::new("left", json!(null));
    let right = TaskNode::new("right", json!(null));
    let join = TaskNode::synthesis("join");
    let (l, r, j) = (left.id, right.id, join.id);
    graph.add_task(left);
    graph.add_task(right);
    graph.add_task(join);
    graph.add_dependency(&l, &j).unwrap();
    graph.add_dependency(&r, &j).unwrap();

    let root = net.submit(graph).await.unwrap();
    let result = net.wait_timeout(root, WAIT).await.unwrap();
    assert_eq!(
        result,
        TaskResult::Completed(json!([
            recorder.output("left", vec![]),
            recorder.output("right", vec![])
        ]))
    );
    assert_eq!(recorder.count("join"), 0);

    net.shutdown().await;
}

/// Test: Priority order
/// Given one busy worker and three queued tasks
/// When the worker frees up
/// Then the lowest priority key runs first
#[tokio::test]
async fn test_queued_tasks_run_in_priority_order() {
    let recorder = Recorder::new();
    let mut config = test_config();
    config.workers.pool_size = 1;
    let net = start(config, recorder.clone());

    let mut blocker = TaskGraph::new();
    let gate = TaskNode::new("gate", json!(null));
    let gate_id = gate.id;
    blocker.add_task(gate);
    net.submit(blocker).await.unwrap();
    wait_for_state(&net, gate_id, |s| *s == TaskState::Running).await;

    let mut ids = Vec::new();
    for (name, priority) in [("p10", 10.0), ("p5", 5.0), ("p0", 0.0)] {
        let mut graph = TaskGraph::new();
        let task = TaskNode::new(name, json!(null)).with_priority(priority);
        ids.push(task.id);
        graph.add_task(task);
        net.submit(graph).await.unwrap();
    }
    assert_eq!(net.queued().await, 3);

    recorder.release();
    for id in ids {
        net.wait_timeout(id, WAIT).await.unwrap();
    }
    assert_eq!(recorder.calls(), vec!["gate", "p0", "p5", "p10"]);

    net.shutdown().await;
}

/// Test: Aging is visible on queued tasks
/// Given one busy worker and a queued task
/// When the aging loop re-keys the queue
/// Then the task's reported dynamic priority decreases
#[tokio::test]
async fn test_queued_task_priority_ages() {
    let recorder = Recorder::new();
    let mut config = test_config();
    config.workers.pool_size = 1;
    config.workers.aging_interval_ms = 20;
    config.priority.age_weight = 1.0;
    let net = start(config, recorder.clone());

    let mut blocker = TaskGraph::new();
    let gate = TaskNode::new("gate", json!(null));
    let gate_id = gate.id;
    blocker.add_task(gate);
    net.submit(blocker).await.unwrap();
    wait_for_state(&net, gate_id, |s| *s == TaskState::Running).await;

    let mut graph = TaskGraph::new();
    let waiting = TaskNode::new("waiting", json!(null)).with_priority(100.0);
    let waiting_id = waiting.id;
    graph.add_task(waiting);
    net.submit(graph).await.unwrap();
    wait_for_state(&net, waiting_id, |s| *s == TaskState::Scheduled).await;

    let net_ref = &net;
    let priority = move || async move {
        net_ref.task(waiting_id).await.unwrap().dynamic_priority
    };
    eventually("initial priority", move || async move { priority().await.is_some() }).await;
    let first = priority().await.unwrap();

    eventually("aged priority", move || async move {
        priority().await.is_some_and(|p| p < first)
    })
    .await;

    recorder.release();
    net.wait_timeout(waiting_id, WAIT).await.unwrap();
    net.shutdown().await;
}

/// Test: Cycle rejection happens before submission
#[tokio::test]
async fn test_cycle_rejected_at_build_time() {
    let mut graph = TaskGraph::new();
    let a = TaskNode::new("a", json!(null));
    let b = TaskNode::new("b", json!(null));
    let (a_id, b_id) = (a.id, b.id);
    graph.add_task(a);
    graph.add_task(b);
    graph.add_dependency(&a_id, &b_id).unwrap();

    assert!(matches!(
        graph.add_dependency(&b_id, &a_id),
        Err(tasknet::Error::CycleDetected { .. })
    ));
    assert_eq!(graph.dependency_count(), 1);
}
