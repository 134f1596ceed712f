//! Concrete tablet-management operations.
//!
//! Each operation is a [`RemoteOperation`](crate::task::RemoteOperation) that talks to a storage
//! node through an [`AdminClient`] and classifies the answer with its own idempotence rules:
//! errors meaning "already done" complete the task instead of retrying it.

mod consensus;
mod replica;
mod tablet;

pub use consensus::{ChangeConfig, ConfigChange, LeaderStepDown, MemberType, StepDownFollowup};
pub use replica::{CreateReplica, DeleteReplica, DeleteType};
pub use tablet::{AddTableToTablet, AlterSchema, RemoveTableFromTablet, SplitTablet};

use crate::error::TaskError;
use crate::picker::{ConnectionProxy, NodeId, PartitionId};
use futures::future::BoxFuture;
use std::fmt;

/// Request sent to a storage node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminRequest {
    CreateTablet {
        tablet: PartitionId,
        table: String,
    },
    DeleteTablet {
        tablet: PartitionId,
        dest: NodeId,
        delete_type: DeleteType,
        reason: String,
        cas_config_opid_index: Option<i64>,
    },
    ChangeConfig {
        tablet: PartitionId,
        dest: NodeId,
        change: ConfigChange,
        cas_config_opid_index: i64,
    },
    LeaderStepDown {
        tablet: PartitionId,
        dest: NodeId,
        new_leader: Option<NodeId>,
    },
    SplitTablet {
        tablet: PartitionId,
        split_key: Vec<u8>,
        new_tablets: [PartitionId; 2],
    },
    AlterSchema {
        tablet: PartitionId,
        table: String,
        schema_version: u32,
    },
    AddTableToTablet {
        tablet: PartitionId,
        table: String,
    },
    RemoveTableFromTablet {
        tablet: PartitionId,
        table: String,
    },
}

impl AdminRequest {
    pub fn tablet(&self) -> &PartitionId {
        match self {
            AdminRequest::CreateTablet { tablet, .. }
            | AdminRequest::DeleteTablet { tablet, .. }
            | AdminRequest::ChangeConfig { tablet, .. }
            | AdminRequest::LeaderStepDown { tablet, .. }
            | AdminRequest::SplitTablet { tablet, .. }
            | AdminRequest::AlterSchema { tablet, .. }
            | AdminRequest::AddTableToTablet { tablet, .. }
            | AdminRequest::RemoveTableFromTablet { tablet, .. } => tablet,
        }
    }
}

/// RPC stub for storage nodes.
///
/// Application-level failures resolve to [`TaskError::Remote`]; anything else is treated as a
/// transport failure.
pub trait AdminClient: Send + Sync + fmt::Debug {
    fn call(
        &self,
        connection: &ConnectionProxy,
        request: AdminRequest,
    ) -> BoxFuture<'static, Result<(), TaskError>>;
}

/// Tablet metadata as the catalog currently sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabletStatus {
    pub running: bool,
    /// Index of the latest committed consensus configuration.
    pub committed_opid_index: i64,
}

/// Catalog callbacks used by the operations. Called from response handlers, so implementations
/// may block.
pub trait CatalogListener: Send + Sync + fmt::Debug {
    /// `None` when the tablet is unknown.
    fn tablet_status(&self, tablet: &PartitionId) -> Option<TabletStatus>;

    fn replica_deleted(&self, _tablet: &PartitionId, _node: &NodeId) {}

    fn schema_version_reported(&self, _tablet: &PartitionId, _node: &NodeId, _version: u32) {}

    fn step_down_failed(&self, _tablet: &PartitionId, _error: &TaskError) {}
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clock::Deadline;
    use crate::error::{RemoteError, ServerErrorCode, StatusCode};
    use crate::picker::{NodeDescriptor, ServiceKind};
    use crate::state::TaskId;
    use crate::task::AttemptContext;
    use std::sync::{Arc, Mutex};

    pub(crate) fn context(node: &str, attempt: u32, live: bool) -> AttemptContext {
        let target = Arc::new(NodeDescriptor::new(NodeId::new(node), format!("{node}:9100")));
        target.set_live(live);
        let connections = [ServiceKind::Admin, ServiceKind::Consensus]
            .into_iter()
            .map(|s| target.connect(s).unwrap())
            .collect();
        AttemptContext::new(TaskId::from_raw(1), attempt, target, connections, Deadline::Never)
    }

    pub(crate) fn remote(code: ServerErrorCode) -> TaskError {
        TaskError::Remote(RemoteError::with_code(code, StatusCode::RemoteError, "test"))
    }

    pub(crate) fn status(status: StatusCode) -> TaskError {
        TaskError::Remote(RemoteError::new(status, "test"))
    }

    #[derive(Debug, Default)]
    pub(crate) struct NoopClient;

    impl AdminClient for NoopClient {
        fn call(
            &self,
            _connection: &ConnectionProxy,
            _request: AdminRequest,
        ) -> BoxFuture<'static, Result<(), TaskError>> {
            Box::pin(async { Ok(()) })
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct RecordingCatalog {
        pub(crate) status: Mutex<Option<TabletStatus>>,
        pub(crate) deleted: Mutex<Vec<(PartitionId, NodeId)>>,
        pub(crate) schema_reports: Mutex<Vec<(PartitionId, NodeId, u32)>>,
        pub(crate) step_down_failures: Mutex<Vec<PartitionId>>,
    }

    impl RecordingCatalog {
        pub(crate) fn running(committed_opid_index: i64) -> Arc<Self> {
            let catalog = Self::default();
            *catalog.status.lock().unwrap() =
                Some(TabletStatus { running: true, committed_opid_index });
            Arc::new(catalog)
        }
    }

    impl CatalogListener for RecordingCatalog {
        fn tablet_status(&self, _tablet: &PartitionId) -> Option<TabletStatus> {
            *self.status.lock().unwrap()
        }

        fn replica_deleted(&self, tablet: &PartitionId, node: &NodeId) {
            self.deleted.lock().unwrap().push((tablet.clone(), node.clone()));
        }

        fn schema_version_reported(&self, tablet: &PartitionId, node: &NodeId, version: u32) {
            self.schema_reports.lock().unwrap().push((tablet.clone(), node.clone(), version));
        }

        fn step_down_failed(&self, tablet: &PartitionId, _error: &TaskError) {
            self.step_down_failures.lock().unwrap().push(tablet.clone());
        }
    }
}
