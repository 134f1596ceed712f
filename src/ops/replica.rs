//! Replica creation and deletion on a specific node.

use super::{AdminClient, AdminRequest, CatalogListener};
use crate::clock::Deadline;
use crate::config::TaskConfig;
use crate::error::{ServerErrorCode, StatusCode, TaskError};
use crate::picker::{NodeId, PartitionId, ServiceKind};
use crate::state::{TaskKind, TaskState};
use crate::task::{AttemptContext, Dispatch, Outcome, RemoteOperation, TerminalOutcome};
use std::sync::Arc;
use tracing::{info, warn};

/// Creates a tablet replica on one node. Bounded by the tablet creation timeout.
#[derive(Debug)]
pub struct CreateReplica {
    client: Arc<dyn AdminClient>,
    tablet: PartitionId,
    table: String,
}

impl CreateReplica {
    pub fn new(
        client: Arc<dyn AdminClient>,
        tablet: PartitionId,
        table: impl Into<String>,
    ) -> Self {
        Self { client, tablet, table: table.into() }
    }
}

impl RemoteOperation for CreateReplica {
    type Response = ();

    fn kind(&self) -> TaskKind {
        TaskKind::CreateReplica
    }

    fn description(&self, target: Option<&NodeId>) -> String {
        match target {
            Some(node) => format!("CreateTablet RPC for tablet {} on TS={node}", self.tablet),
            None => format!("CreateTablet RPC for tablet {}", self.tablet),
        }
    }

    fn deadline(&self, now_millis: u64, config: &TaskConfig) -> Deadline {
        Deadline::after(now_millis, config.tablet_creation_timeout())
    }

    fn send_request(&self, ctx: &AttemptContext) -> Dispatch<()> {
        let conn = match ctx.connection(ServiceKind::Admin) {
            Ok(conn) => conn,
            Err(e) => return Dispatch::Abort(e),
        };
        let request =
            AdminRequest::CreateTablet { tablet: self.tablet.clone(), table: self.table.clone() };
        Dispatch::Sent(self.client.call(conn, request))
    }

    fn handle_response(&self, ctx: &AttemptContext, result: Result<(), TaskError>) -> Outcome {
        match result {
            Ok(()) => Outcome::Complete,
            Err(e) if e.remote_status() == Some(StatusCode::AlreadyPresent) => {
                info!(
                    tablet = %self.tablet,
                    node = %ctx.target().id(),
                    "tablet replica already present"
                );
                Outcome::Complete
            }
            Err(_) => Outcome::Retry,
        }
    }
}

/// How a deleted replica leaves the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeleteType {
    /// Keep the consensus metadata so the replica can vote in elections for the tablet.
    Tombstoned,
    /// Remove everything.
    Deleted,
}

/// Deletes a tablet replica from one node. Meant to be throttled.
#[derive(Debug)]
pub struct DeleteReplica {
    client: Arc<dyn AdminClient>,
    catalog: Arc<dyn CatalogListener>,
    tablet: PartitionId,
    node: NodeId,
    delete_type: DeleteType,
    reason: String,
    cas_config_opid_index: Option<i64>,
}

impl DeleteReplica {
    pub fn new(
        client: Arc<dyn AdminClient>,
        catalog: Arc<dyn CatalogListener>,
        tablet: PartitionId,
        node: NodeId,
        delete_type: DeleteType,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            client,
            catalog,
            tablet,
            node,
            delete_type,
            reason: reason.into(),
            cas_config_opid_index: None,
        }
    }

    /// Only delete if the node's committed config is still at `opid_index`.
    pub fn with_cas_config_opid_index(mut self, opid_index: i64) -> Self {
        self.cas_config_opid_index = Some(opid_index);
        self
    }
}

impl RemoteOperation for DeleteReplica {
    type Response = ();

    fn kind(&self) -> TaskKind {
        TaskKind::DeleteReplica
    }

    fn description(&self, _target: Option<&NodeId>) -> String {
        format!("{:?} tablet {} on TS={}", self.delete_type, self.tablet, self.node)
    }

    fn send_request(&self, ctx: &AttemptContext) -> Dispatch<()> {
        let conn = match ctx.connection(ServiceKind::Admin) {
            Ok(conn) => conn,
            Err(e) => return Dispatch::Abort(e),
        };
        let request = AdminRequest::DeleteTablet {
            tablet: self.tablet.clone(),
            dest: self.node.clone(),
            delete_type: self.delete_type,
            reason: self.reason.clone(),
            cas_config_opid_index: self.cas_config_opid_index,
        };
        Dispatch::Sent(self.client.call(conn, request))
    }

    fn handle_response(&self, ctx: &AttemptContext, result: Result<(), TaskError>) -> Outcome {
        let e = match result {
            Ok(()) => {
                info!(tablet = %self.tablet, node = %self.node, "tablet replica deleted");
                return Outcome::Complete;
            }
            Err(e) => e,
        };
        match e.server_code() {
            Some(ServerErrorCode::TabletNotFound) => {
                warn!(tablet = %self.tablet, node = %self.node, "tablet replica already deleted");
                Outcome::Complete
            }
            Some(ServerErrorCode::CasFailed) => {
                warn!(
                    tablet = %self.tablet,
                    node = %self.node,
                    error = %e,
                    "delete skipped, config changed"
                );
                Outcome::Complete
            }
            Some(ServerErrorCode::WrongServerUuid) => {
                warn!(
                    tablet = %self.tablet,
                    node = %self.node,
                    error = %e,
                    "node has a new identity"
                );
                Outcome::Complete
            }
            _ if e.is_transport() && !ctx.target().is_live() => {
                warn!(
                    tablet = %self.tablet,
                    node = %self.node,
                    error = %e,
                    "node is no longer live, not retrying delete"
                );
                Outcome::Complete
            }
            _ => Outcome::Retry,
        }
    }

    fn on_unregistered(&self, outcome: &TerminalOutcome) {
        if outcome.state == TaskState::Complete {
            self.catalog.replica_deleted(&self.tablet, &self.node);
        }
    }
}
