use futures::future::BoxFuture;
use remote_tasks::ops::{AdminClient, AdminRequest, CatalogListener, TabletStatus};
use remote_tasks::{
    AttemptContext, ConnectionProxy, Dispatch, DynamicConfig, InMemoryNodeRegistry, Jitter,
    ManualClock, MemorySink, NodeId, Outcome, PartitionId, RemoteOperation, RetryPolicy,
    ServerErrorCode, Sleeper, TaskConfig, TaskEnv, TaskError, TaskKind, Telemetry,
    TokioScheduler, TrackingSleeper, WorkerPool,
};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Config with a short task timeout so deadline behaviour is quick to reach.
pub fn short_config(unresponsive: Duration) -> TaskConfig {
    TaskConfig::builder()
        .unresponsive_timeout(unresponsive)
        .rpc_timeout(unresponsive.min(Duration::from_secs(30)))
        .build()
        .unwrap()
}

/// Poll `cond` until it holds, panicking after five seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Sleeper whose sleeps never finish; timers only fire when cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub struct PendingSleeper;

impl Sleeper for PendingSleeper {
    fn sleep(&self, _duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(futures::future::pending())
    }
}

/// Everything a task needs, wired with a manual clock that the retry sleeps advance.
pub struct Harness {
    pub clock: ManualClock,
    /// Records retry delays when the default sleeper is in use.
    pub sleeper: TrackingSleeper,
    pub scheduler: TokioScheduler,
    pub pool: Arc<WorkerPool>,
    pub registry: InMemoryNodeRegistry,
    pub sink: MemorySink,
    pub config: DynamicConfig<TaskConfig>,
    pub env: TaskEnv,
}

impl Harness {
    pub fn new(config: TaskConfig) -> Self {
        let clock = ManualClock::new();
        let sleeper = TrackingSleeper::advancing(clock.clone());
        Self::assemble(config, clock, sleeper.clone(), sleeper)
    }

    pub fn with_sleeper<S: Sleeper + 'static>(config: TaskConfig, sleeper: S) -> Self {
        let clock = ManualClock::new();
        Self::assemble(config, clock, TrackingSleeper::new(), sleeper)
    }

    fn assemble<S: Sleeper + 'static>(
        config: TaskConfig,
        clock: ManualClock,
        sleeper: TrackingSleeper,
        scheduler_sleeper: S,
    ) -> Self {
        let scheduler = TokioScheduler::with_sleeper(Handle::current(), scheduler_sleeper);
        let pool = Arc::new(WorkerPool::new("callbacks", 2, 64).unwrap());
        let sink = MemorySink::new();
        let config = DynamicConfig::new(config);
        let env = TaskEnv::new(Handle::current(), Arc::new(scheduler.clone()), pool.clone())
            .with_clock(clock.clone())
            .with_config(config.clone())
            .with_telemetry(Telemetry::new(sink.clone()))
            .with_jitter(Jitter::None);
        Self {
            clock,
            sleeper,
            scheduler,
            pool,
            registry: InMemoryNodeRegistry::new(),
            sink,
            config,
            env,
        }
    }

    pub fn registry(&self) -> Arc<InMemoryNodeRegistry> {
        Arc::new(self.registry.clone())
    }
}

type SendHook = Box<dyn Fn(&AttemptContext) + Send + Sync>;

/// Operation replaying a scripted list of responses, one per send. Sends past the end of the
/// script succeed.
pub struct ScriptedOp {
    policy: RetryPolicy,
    script: Mutex<VecDeque<Result<(), TaskError>>>,
    gate: Option<Arc<Semaphore>>,
    on_send: Option<SendHook>,
    sends: Mutex<Vec<(u32, NodeId)>>,
    handled: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedOp {
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::RetryLimited,
            script: Mutex::new(VecDeque::new()),
            gate: None,
            on_send: None,
            sends: Mutex::new(Vec::new()),
            handled: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn script(self, responses: impl IntoIterator<Item = Result<(), TaskError>>) -> Self {
        self.script.lock().unwrap().extend(responses);
        self
    }

    /// Responses wait for a permit on `gate` before resolving.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn on_send(mut self, hook: impl Fn(&AttemptContext) + Send + Sync + 'static) -> Self {
        self.on_send = Some(Box::new(hook));
        self
    }

    pub fn sends(&self) -> Vec<(u32, NodeId)> {
        self.sends.lock().unwrap().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sends.lock().unwrap().len()
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl RemoteOperation for ScriptedOp {
    type Response = ();

    fn kind(&self) -> TaskKind {
        TaskKind::Custom("scripted")
    }

    fn description(&self, target: Option<&NodeId>) -> String {
        match target {
            Some(node) => format!("scripted op on {node}"),
            None => "scripted op".to_owned(),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    fn send_request(&self, ctx: &AttemptContext) -> Dispatch<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.sends.lock().unwrap().push((ctx.attempt(), ctx.target().id().clone()));
        if let Some(hook) = &self.on_send {
            hook(ctx);
        }
        let response = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        let gate = self.gate.clone();
        Dispatch::Sent(Box::pin(async move {
            if let Some(gate) = gate {
                let _permit = gate.acquire().await;
            }
            response
        }))
    }

    fn handle_response(&self, _ctx: &AttemptContext, result: Result<(), TaskError>) -> Outcome {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.handled.fetch_add(1, Ordering::SeqCst);
        match result {
            Ok(()) => Outcome::Complete,
            Err(e) if e.server_code() == Some(ServerErrorCode::NotTheLeader) => Outcome::Retry,
            Err(e) if e.is_retryable() => Outcome::Retry,
            Err(e) => Outcome::Failed(e),
        }
    }
}

/// Admin client recording every request; answers from a script, then `Ok`.
#[derive(Debug, Default)]
pub struct RecordingClient {
    requests: Mutex<Vec<AdminRequest>>,
    responses: Mutex<VecDeque<Result<(), TaskError>>>,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond_with(&self, responses: impl IntoIterator<Item = Result<(), TaskError>>) {
        self.responses.lock().unwrap().extend(responses);
    }

    pub fn requests(&self) -> Vec<AdminRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl AdminClient for RecordingClient {
    fn call(
        &self,
        _connection: &ConnectionProxy,
        request: AdminRequest,
    ) -> BoxFuture<'static, Result<(), TaskError>> {
        self.requests.lock().unwrap().push(request);
        let response = self.responses.lock().unwrap().pop_front().unwrap_or(Ok(()));
        Box::pin(async move { response })
    }
}

/// Catalog with one tablet status shared by every tablet, recording notifications.
#[derive(Debug)]
pub struct FakeCatalog {
    status: Mutex<Option<TabletStatus>>,
    pub deleted: Mutex<Vec<(PartitionId, NodeId)>>,
    pub schema_reports: Mutex<Vec<(PartitionId, NodeId, u32)>>,
}

impl FakeCatalog {
    pub fn running(committed_opid_index: i64) -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(Some(TabletStatus { running: true, committed_opid_index })),
            deleted: Mutex::new(Vec::new()),
            schema_reports: Mutex::new(Vec::new()),
        })
    }

    pub fn set_status(&self, status: Option<TabletStatus>) {
        *self.status.lock().unwrap() = status;
    }
}

impl CatalogListener for FakeCatalog {
    fn tablet_status(&self, _tablet: &PartitionId) -> Option<TabletStatus> {
        *self.status.lock().unwrap()
    }

    fn replica_deleted(&self, tablet: &PartitionId, node: &NodeId) {
        self.deleted.lock().unwrap().push((tablet.clone(), node.clone()));
    }

    fn schema_version_reported(&self, tablet: &PartitionId, node: &NodeId, version: u32) {
        self.schema_reports.lock().unwrap().push((tablet.clone(), node.clone(), version));
    }
}
