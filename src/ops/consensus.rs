//! Consensus configuration changes and leader step-down, sent to the tablet leader.

use super::{AdminClient, AdminRequest, CatalogListener};
use crate::clock::Deadline;
use crate::config::{RetryPolicy, TaskConfig};
use crate::error::{ServerErrorCode, TaskError};
use crate::owner::OwnerResource;
use crate::picker::{NodeId, NodeRegistry, PartitionId, PickLeader, ServiceKind};
use crate::state::TaskKind;
use crate::task::{AttemptContext, Dispatch, Outcome, RemoteOperation, RetryingTask, TaskEnv};
use std::sync::{Arc, Weak};
use tracing::{info, warn};

/// Role a new peer joins with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberType {
    PreVoter,
    PreObserver,
}

/// Membership change applied by [`ChangeConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigChange {
    AddServer { peer: NodeId, member_type: MemberType },
    RemoveServer { peer: NodeId },
}

impl ConfigChange {
    pub fn peer(&self) -> &NodeId {
        match self {
            ConfigChange::AddServer { peer, .. } | ConfigChange::RemoveServer { peer } => peer,
        }
    }
}

/// Adds or removes a peer through the tablet leader.
///
/// Never times out; it keeps retrying until the change is applied or becomes moot. The request
/// carries the config index the change was computed against, and the task aborts as soon as the
/// catalog sees a newer committed config.
#[derive(Debug)]
pub struct ChangeConfig {
    client: Arc<dyn AdminClient>,
    catalog: Arc<dyn CatalogListener>,
    tablet: PartitionId,
    change: ConfigChange,
    opid_index: i64,
}

impl ChangeConfig {
    pub fn add_server(
        client: Arc<dyn AdminClient>,
        catalog: Arc<dyn CatalogListener>,
        tablet: PartitionId,
        peer: NodeId,
        member_type: MemberType,
        opid_index: i64,
    ) -> Self {
        let change = ConfigChange::AddServer { peer, member_type };
        Self { client, catalog, tablet, change, opid_index }
    }

    pub fn remove_server(
        client: Arc<dyn AdminClient>,
        catalog: Arc<dyn CatalogListener>,
        tablet: PartitionId,
        peer: NodeId,
        opid_index: i64,
    ) -> Self {
        let change = ConfigChange::RemoveServer { peer };
        Self { client, catalog, tablet, change, opid_index }
    }

    pub fn change(&self) -> &ConfigChange {
        &self.change
    }

    pub fn tablet(&self) -> &PartitionId {
        &self.tablet
    }
}

impl RemoteOperation for ChangeConfig {
    type Response = ();

    fn kind(&self) -> TaskKind {
        match self.change {
            ConfigChange::AddServer { .. } => TaskKind::AddServer,
            ConfigChange::RemoveServer { .. } => TaskKind::RemoveServer,
        }
    }

    fn description(&self, target: Option<&NodeId>) -> String {
        let leader = target.map_or_else(|| "<unknown>".to_owned(), NodeId::to_string);
        format!(
            "{} {} for tablet {} (config index {}) via leader {leader}",
            self.kind(),
            self.change.peer(),
            self.tablet,
            self.opid_index
        )
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::RetryUntilDeadline
    }

    fn services(&self) -> &'static [ServiceKind] {
        &[ServiceKind::Consensus]
    }

    fn deadline(&self, _now_millis: u64, _config: &TaskConfig) -> Deadline {
        Deadline::Never
    }

    fn send_request(&self, ctx: &AttemptContext) -> Dispatch<()> {
        let status = match self.catalog.tablet_status(&self.tablet) {
            Some(status) if status.running => status,
            _ => {
                return Dispatch::Abort(TaskError::Aborted(format!(
                    "tablet {} is no longer running",
                    self.tablet
                )));
            }
        };
        if status.committed_opid_index > self.opid_index {
            return Dispatch::Abort(TaskError::Aborted(format!(
                "latest config has index {} while this task has index {}",
                status.committed_opid_index, self.opid_index
            )));
        }
        let conn = match ctx.connection(ServiceKind::Consensus) {
            Ok(conn) => conn,
            Err(e) => return Dispatch::Abort(e),
        };
        let request = AdminRequest::ChangeConfig {
            tablet: self.tablet.clone(),
            dest: ctx.target().id().clone(),
            change: self.change.clone(),
            cas_config_opid_index: self.opid_index,
        };
        Dispatch::Sent(self.client.call(conn, request))
    }

    fn handle_response(&self, ctx: &AttemptContext, result: Result<(), TaskError>) -> Outcome {
        let e = match result {
            Ok(()) => {
                info!(tablet = %self.tablet, peer = %self.change.peer(), "{} applied", self.kind());
                return Outcome::Complete;
            }
            Err(e) => e,
        };
        match e.server_code() {
            Some(
                ServerErrorCode::CasFailed
                | ServerErrorCode::AddChangeConfigAlreadyPresent
                | ServerErrorCode::RemoveChangeConfigNotPresent
                | ServerErrorCode::NotTheLeader,
            ) => {
                warn!(
                    tablet = %self.tablet,
                    leader = %ctx.target().id(),
                    error = %e,
                    "{} no longer needed",
                    self.kind()
                );
                Outcome::Complete
            }
            _ => Outcome::Retry,
        }
    }
}

/// What a successful step-down needs to chain a `RemoveServer` of the former leader.
#[derive(Debug, Clone)]
pub struct StepDownFollowup {
    env: TaskEnv,
    registry: Arc<dyn NodeRegistry>,
    owner: Option<Weak<dyn OwnerResource>>,
}

impl StepDownFollowup {
    pub fn new(env: TaskEnv, registry: Arc<dyn NodeRegistry>) -> Self {
        Self { env, registry, owner: None }
    }

    /// Register the chained task with `owner`.
    pub fn owner(mut self, owner: &Arc<dyn OwnerResource>) -> Self {
        self.owner = Some(Arc::downgrade(owner));
        self
    }
}

/// Asks the current leader to step down. Sent at most once.
#[derive(Debug)]
pub struct LeaderStepDown {
    client: Arc<dyn AdminClient>,
    catalog: Arc<dyn CatalogListener>,
    tablet: PartitionId,
    leader: NodeId,
    new_leader: Option<NodeId>,
    followup: Option<StepDownFollowup>,
}

impl LeaderStepDown {
    pub fn new(
        client: Arc<dyn AdminClient>,
        catalog: Arc<dyn CatalogListener>,
        tablet: PartitionId,
        leader: NodeId,
    ) -> Self {
        Self { client, catalog, tablet, leader, new_leader: None, followup: None }
    }

    /// Suggest the peer that should take over.
    pub fn with_new_leader(mut self, node: NodeId) -> Self {
        self.new_leader = Some(node);
        self
    }

    /// Remove the stepped-down leader from the config once it stepped down.
    pub fn remove_after(mut self, followup: StepDownFollowup) -> Self {
        self.followup = Some(followup);
        self
    }

    fn remove_former_leader(&self, followup: &StepDownFollowup) {
        let Some(status) = self.catalog.tablet_status(&self.tablet) else {
            warn!(tablet = %self.tablet, "tablet vanished, not removing former leader");
            return;
        };
        let op = ChangeConfig::remove_server(
            self.client.clone(),
            self.catalog.clone(),
            self.tablet.clone(),
            self.leader.clone(),
            status.committed_opid_index,
        );
        let picker = PickLeader::new(followup.registry.clone(), self.tablet.clone());
        let mut builder = RetryingTask::builder(op, picker, followup.env.clone());
        if let Some(owner) = followup.owner.as_ref().and_then(Weak::upgrade) {
            builder = builder.owner(owner);
        }
        let task = builder.build();
        if let Err(e) = task.run() {
            warn!(tablet = %self.tablet, error = %e, "failed to start removal of former leader");
        }
    }
}

impl RemoteOperation for LeaderStepDown {
    type Response = ();

    fn kind(&self) -> TaskKind {
        TaskKind::LeaderStepDown
    }

    fn description(&self, _target: Option<&NodeId>) -> String {
        match &self.new_leader {
            Some(next) => {
                format!("step down {} for tablet {} in favour of {next}", self.leader, self.tablet)
            }
            None => format!("step down {} for tablet {}", self.leader, self.tablet),
        }
    }

    fn services(&self) -> &'static [ServiceKind] {
        &[ServiceKind::Consensus]
    }

    fn send_request(&self, ctx: &AttemptContext) -> Dispatch<()> {
        if ctx.attempt() > 1 {
            return Dispatch::Abort(TaskError::Aborted("step down request already sent".into()));
        }
        if ctx.target().id() != &self.leader {
            return Dispatch::Abort(TaskError::Aborted(format!(
                "leader of tablet {} is {}, not {}",
                self.tablet,
                ctx.target().id(),
                self.leader
            )));
        }
        let conn = match ctx.connection(ServiceKind::Consensus) {
            Ok(conn) => conn,
            Err(e) => return Dispatch::Abort(e),
        };
        let request = AdminRequest::LeaderStepDown {
            tablet: self.tablet.clone(),
            dest: self.leader.clone(),
            new_leader: self.new_leader.clone(),
        };
        Dispatch::Sent(self.client.call(conn, request))
    }

    fn handle_response(&self, _ctx: &AttemptContext, result: Result<(), TaskError>) -> Outcome {
        match result {
            Ok(()) => {
                info!(tablet = %self.tablet, leader = %self.leader, "leader stepped down");
                // Chained before this task unregisters so the owner never looks drained.
                if let Some(followup) = &self.followup {
                    self.remove_former_leader(followup);
                }
                Outcome::Complete
            }
            Err(e) if e.is_transport() => Outcome::Abort(e),
            Err(e) => {
                warn!(
                    tablet = %self.tablet,
                    leader = %self.leader,
                    error = %e,
                    "step down refused"
                );
                self.catalog.step_down_failed(&self.tablet, &e);
                Outcome::Complete
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::test_support::{context, remote, NoopClient, RecordingCatalog};
    use crate::ops::TabletStatus;

    fn change_config(catalog: Arc<RecordingCatalog>, opid_index: i64) -> ChangeConfig {
        ChangeConfig::add_server(
            Arc::new(NoopClient),
            catalog,
            PartitionId::new("tablet-1"),
            NodeId::new("ts-4"),
            MemberType::PreVoter,
            opid_index,
        )
    }

    fn step_down(catalog: Arc<RecordingCatalog>) -> LeaderStepDown {
        LeaderStepDown::new(
            Arc::new(NoopClient),
            catalog,
            PartitionId::new("tablet-1"),
            NodeId::new("ts-1"),
        )
    }

    #[test]
    fn change_config_never_times_out() {
        let op = change_config(RecordingCatalog::running(7), 7);
        assert_eq!(op.deadline(0, &TaskConfig::default()), Deadline::Never);
        assert_eq!(op.retry_policy(), RetryPolicy::RetryUntilDeadline);
        assert_eq!(op.kind(), TaskKind::AddServer);
    }

    #[test]
    fn change_config_sends_while_config_is_current() {
        let op = change_config(RecordingCatalog::running(7), 7);
        assert!(matches!(op.send_request(&context("ts-1", 1, true)), Dispatch::Sent(_)));
    }

    #[test]
    fn change_config_aborts_when_config_moved_on() {
        let op = change_config(RecordingCatalog::running(9), 7);
        assert!(matches!(
            op.send_request(&context("ts-1", 1, true)),
            Dispatch::Abort(TaskError::Aborted(_))
        ));
    }

    #[test]
    fn change_config_aborts_when_tablet_stopped() {
        let catalog = RecordingCatalog::running(7);
        *catalog.status.lock().unwrap() =
            Some(TabletStatus { running: false, committed_opid_index: 7 });
        let op = change_config(catalog, 7);
        assert!(matches!(op.send_request(&context("ts-1", 1, true)), Dispatch::Abort(_)));
    }

    #[test]
    fn change_config_completes_on_moot_errors() {
        let op = change_config(RecordingCatalog::running(7), 7);
        let ctx = context("ts-1", 1, true);
        for code in [
            ServerErrorCode::CasFailed,
            ServerErrorCode::AddChangeConfigAlreadyPresent,
            ServerErrorCode::RemoveChangeConfigNotPresent,
            ServerErrorCode::NotTheLeader,
        ] {
            assert_eq!(op.handle_response(&ctx, Err(remote(code))), Outcome::Complete, "{code:?}");
        }
        assert_eq!(
            op.handle_response(&ctx, Err(TaskError::Transport("reset".into()))),
            Outcome::Retry
        );
    }

    #[test]
    fn step_down_is_sent_once_to_the_expected_leader() {
        let op = step_down(RecordingCatalog::running(1));
        assert!(matches!(op.send_request(&context("ts-1", 1, true)), Dispatch::Sent(_)));
        assert!(matches!(op.send_request(&context("ts-1", 2, true)), Dispatch::Abort(_)));
        assert!(matches!(op.send_request(&context("ts-2", 1, true)), Dispatch::Abort(_)));
    }

    #[test]
    fn step_down_classification() {
        let catalog = RecordingCatalog::running(1);
        let op = step_down(catalog.clone());
        let ctx = context("ts-1", 1, true);

        assert!(matches!(
            op.handle_response(&ctx, Err(TaskError::Transport("reset".into()))),
            Outcome::Abort(_)
        ));
        assert_eq!(
            op.handle_response(&ctx, Err(remote(ServerErrorCode::NotTheLeader))),
            Outcome::Complete
        );
        assert_eq!(catalog.step_down_failures.lock().unwrap().len(), 1);
        assert_eq!(op.handle_response(&ctx, Ok(())), Outcome::Complete);
    }
}
