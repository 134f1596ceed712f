mod common;

use common::test_helpers::{init_tracing, short_config, wait_until, Harness, ScriptedOp};
use remote_tasks::{
    Clock, NodeHandle, NodeId, NodeRegistry, PartitionId, PickLeader, PickSpecificNode,
    RemoteError, ReplicaPicker, RetryPolicy, RetryingTask, ServerErrorCode,
    StatusCode, TaskConfig, TaskError, TaskEvent, TaskState, TaskTracker, TokioSleeper,
};
use std::sync::Arc;
use std::time::Duration;

fn transport() -> Result<(), TaskError> {
    Err(TaskError::Transport("connection reset".into()))
}

fn not_the_leader() -> Result<(), TaskError> {
    Err(TaskError::Remote(RemoteError::with_code(
        ServerErrorCode::NotTheLeader,
        StatusCode::IllegalState,
        "not the leader",
    )))
}

async fn drained(owner: &TaskTracker) {
    tokio::time::timeout(Duration::from_secs(5), owner.wait_drained())
        .await
        .expect("tasks did not finish");
}

fn terminal_events(h: &Harness, task: remote_tasks::TaskId) -> usize {
    h.sink.events_for(task).iter().filter(|e| matches!(e, TaskEvent::Terminal { .. })).count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completes_on_first_attempt_and_unregisters_once() {
    init_tracing();
    let h = Harness::new(TaskConfig::default());
    h.registry.register(NodeId::new("ts-1"), "ts-1:9100");
    let owner = TaskTracker::new("table-a");
    let picker = PickSpecificNode::new(h.registry(), NodeId::new("ts-1"));
    let task = RetryingTask::builder(ScriptedOp::new(), picker, h.env.clone())
        .owner(owner.clone())
        .build();

    assert!(owner.contains(task.id()));
    assert_eq!(task.state(), TaskState::Waiting);
    task.run().unwrap();
    drained(&owner).await;

    assert_eq!(task.state(), TaskState::Complete);
    assert_eq!(task.attempt(), 1);
    assert!(!owner.contains(task.id()));
    assert!(task.is_unregistered());
    assert_eq!(task.last_error(), None);
    assert_eq!(terminal_events(&h, task.id()), 1);
    assert_eq!(task.target().map(|t| t.id().clone()), Some(NodeId::new("ts-1")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unresolvable_target_times_out_along_the_backoff_sequence() {
    init_tracing();
    let h = Harness::new(short_config(Duration::from_secs(1)));
    let owner = TaskTracker::new("table-b");
    let picker = PickSpecificNode::new(h.registry(), NodeId::new("ts-gone"));
    let task = RetryingTask::builder(ScriptedOp::new(), picker, h.env.clone())
        .owner(owner.clone())
        .build();

    // Resolution failures are retried asynchronously.
    task.run().unwrap();
    drained(&owner).await;

    assert_eq!(task.state(), TaskState::Failed);
    assert_eq!(task.last_error(), Some(TaskError::TimedOut { attempts: 7 }));
    assert_eq!(task.operation().send_count(), 0);
    let delays: Vec<u64> = h.sleeper.calls().iter().map(|d| d.as_millis() as u64).collect();
    // The last delay is capped by what is left before the deadline.
    assert_eq!(delays, vec![16, 32, 64, 128, 256, 494]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn follows_leadership_handoff_until_success() {
    init_tracing();
    let h = Harness::new(TaskConfig::default());
    for i in 1..=4 {
        h.registry.register(NodeId::new(format!("ts-{i}")), format!("ts-{i}:9100"));
    }
    let tablet = PartitionId::new("tablet-c");
    h.registry.set_leader(tablet.clone(), NodeId::new("ts-1"));

    let registry = h.registry.clone();
    let hook_tablet = tablet.clone();
    let op = ScriptedOp::new()
        .script([not_the_leader(), not_the_leader(), not_the_leader()])
        .on_send(move |ctx| {
            let next = NodeId::new(format!("ts-{}", ctx.attempt() + 1));
            registry.set_leader(hook_tablet.clone(), next);
        });
    let owner = TaskTracker::new("table-c");
    let picker = PickLeader::new(h.registry(), tablet);
    let task = RetryingTask::builder(op, picker, h.env.clone()).owner(owner.clone()).build();

    task.run().unwrap();
    drained(&owner).await;

    assert_eq!(task.state(), TaskState::Complete);
    assert_eq!(task.attempt(), 4);
    let targets: Vec<_> = task.operation().sends();
    assert_eq!(
        targets,
        (1..=4).map(|i| (i, NodeId::new(format!("ts-{i}")))).collect::<Vec<_>>()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_retry_fails_after_first_retryable_response() {
    init_tracing();
    let h = Harness::new(TaskConfig::default());
    h.registry.register(NodeId::new("ts-1"), "ts-1:9100");
    let owner = TaskTracker::new("table-d");
    let op = ScriptedOp::new().policy(RetryPolicy::NoRetry).script([transport()]);
    let picker = PickSpecificNode::new(h.registry(), NodeId::new("ts-1"));
    let task = RetryingTask::builder(op, picker, h.env.clone()).owner(owner.clone()).build();

    task.run().unwrap();
    drained(&owner).await;

    assert_eq!(task.state(), TaskState::Failed);
    assert_eq!(
        task.last_error(),
        Some(TaskError::RetriesExhausted { attempts: 1, threshold: 0 })
    );
    assert_eq!(task.operation().send_count(), 1);
    assert_eq!(h.sleeper.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attempts_are_sequential_and_monotonic() {
    init_tracing();
    let h = Harness::new(TaskConfig::default());
    h.registry.register(NodeId::new("ts-1"), "ts-1:9100");
    let owner = TaskTracker::new("table-e");
    let op = ScriptedOp::new().script(std::iter::repeat_with(transport).take(5));
    let picker = PickSpecificNode::new(h.registry(), NodeId::new("ts-1"));
    let task = RetryingTask::builder(op, picker, h.env.clone()).owner(owner.clone()).build();

    task.run().unwrap();
    drained(&owner).await;

    assert_eq!(task.state(), TaskState::Complete);
    let attempts: Vec<u32> = task.operation().sends().into_iter().map(|(a, _)| a).collect();
    assert_eq!(attempts, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(task.operation().max_in_flight(), 1);
    assert_eq!(task.operation().handled(), 6);

    let retries = h
        .sink
        .events_for(task.id())
        .into_iter()
        .filter(|e| matches!(e, TaskEvent::RetryScheduled { .. }))
        .count();
    assert_eq!(retries, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn always_retryable_task_stops_at_its_deadline() {
    init_tracing();
    let h = Harness::new(short_config(Duration::from_secs(2)));
    h.registry.register(NodeId::new("ts-1"), "ts-1:9100");
    let owner = TaskTracker::new("table-f");
    let op = ScriptedOp::new()
        .policy(RetryPolicy::RetryUntilDeadline)
        .script(std::iter::repeat_with(transport).take(1_000));
    let picker = PickSpecificNode::new(h.registry(), NodeId::new("ts-1"));
    let task = RetryingTask::builder(op, picker, h.env.clone()).owner(owner.clone()).build();

    task.run().unwrap();
    drained(&owner).await;

    assert_eq!(task.state(), TaskState::Failed);
    assert!(task.last_error().is_some_and(|e| e.is_timed_out()));
    assert!(h.clock.now_millis() <= 2_000);
    assert!(task.operation().send_count() > 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retry_limit_is_read_from_live_config() {
    init_tracing();
    let h = Harness::new(TaskConfig::default());
    h.registry.register(NodeId::new("ts-1"), "ts-1:9100");
    h.config.set(TaskConfig::builder().retry_limit(2).build().unwrap());

    let owner = TaskTracker::new("table-g");
    let op = ScriptedOp::new().script(std::iter::repeat_with(transport).take(10));
    let picker = PickSpecificNode::new(h.registry(), NodeId::new("ts-1"));
    let task = RetryingTask::builder(op, picker, h.env.clone()).owner(owner.clone()).build();

    task.run().unwrap();
    drained(&owner).await;

    assert_eq!(task.state(), TaskState::Failed);
    assert_eq!(
        task.last_error(),
        Some(TaskError::RetriesExhausted { attempts: 3, threshold: 2 })
    );
    assert_eq!(task.operation().send_count(), 3);
}

#[derive(Debug)]
struct ExpiredPicker;

impl ReplicaPicker for ExpiredPicker {
    fn pick_replica(&self) -> Result<NodeHandle, TaskError> {
        Err(TaskError::Expired("tablet was deleted".into()))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_target_fails_synchronously() {
    init_tracing();
    let h = Harness::new(TaskConfig::default());
    let owner = TaskTracker::new("table-h");
    let task = RetryingTask::builder(ScriptedOp::new(), ExpiredPicker, h.env.clone())
        .owner(owner.clone())
        .build();

    let err = task.run().unwrap_err();
    assert!(matches!(err, TaskError::Expired(_)));
    assert_eq!(task.state(), TaskState::Failed);
    assert_eq!(owner.outstanding(), 0);
    assert_eq!(h.sleeper.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_node_is_retried_until_it_comes_back() {
    init_tracing();
    // Real sleeps, so the test can step in between retries.
    let h = Harness::with_sleeper(TaskConfig::default(), TokioSleeper);
    let node = h.registry.register(NodeId::new("ts-1"), "ts-1:9100");
    node.set_reachable(false);

    let owner = TaskTracker::new("table-i");
    let picker = PickSpecificNode::new(h.registry(), NodeId::new("ts-1"));
    let task = RetryingTask::builder(ScriptedOp::new(), picker, h.env.clone())
        .owner(owner.clone())
        .build();

    task.run().unwrap();
    let retries = || {
        h.sink
            .events_for(task.id())
            .into_iter()
            .filter(|e| matches!(e, TaskEvent::RetryScheduled { .. }))
            .count()
    };
    wait_until("two retries to be scheduled", || retries() >= 2).await;
    assert_eq!(task.operation().send_count(), 0);

    node.set_reachable(true);
    drained(&owner).await;
    assert_eq!(task.state(), TaskState::Complete);
    assert_eq!(task.operation().send_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn owner_only_holds_weak_references() {
    let h = Harness::new(TaskConfig::default());
    h.registry.register(NodeId::new("ts-1"), "ts-1:9100");
    let owner = TaskTracker::new("table-j");
    let picker = PickSpecificNode::new(h.registry(), NodeId::new("ts-1"));
    let task = RetryingTask::builder(ScriptedOp::new(), picker, h.env.clone())
        .owner(owner.clone())
        .build();

    assert_eq!(owner.tasks().len(), 1);
    let id = task.id();
    drop(task);
    assert!(owner.tasks().is_empty());
    assert!(!owner.contains(id));

    assert_eq!(owner.abort_all("table deleted"), 0);
    owner.mark_pending_delete();
    assert!(owner.is_deleted());
    tokio::time::timeout(Duration::from_secs(2), owner.wait_drained()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn leader_picker_reports_missing_leader() {
    let h = Harness::new(TaskConfig::default());
    let picker = PickLeader::new(h.registry(), PartitionId::new("tablet-k"));
    assert!(matches!(picker.pick_replica(), Err(TaskError::NoLeader(_))));
    assert!(matches!(
        h.registry().lookup_by_id(&NodeId::new("ts-9")),
        Err(TaskError::NotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registry_lookups_resolve_registered_nodes() {
    let h = Harness::new(TaskConfig::default());
    h.registry.register(NodeId::new("ts-1"), "ts-1:9100");
    let tablet = PartitionId::new("tablet-l");
    h.registry.set_leader(tablet.clone(), NodeId::new("ts-1"));

    let leader = h.registry().current_leader_of(&tablet).unwrap();
    assert_eq!(leader.id(), &NodeId::new("ts-1"));
    assert!(Arc::ptr_eq(&leader, &h.registry().lookup_by_id(&NodeId::new("ts-1")).unwrap()));
}
