//! Tablet-level maintenance sent to the tablet leader.

use super::{AdminClient, AdminRequest, CatalogListener};
use crate::error::{ServerErrorCode, StatusCode, TaskError};
use crate::picker::{NodeId, PartitionId, ServiceKind};
use crate::state::TaskKind;
use crate::task::{AttemptContext, Dispatch, Outcome, RemoteOperation};
use std::sync::Arc;
use tracing::{info, warn};

fn admin_call(
    client: &Arc<dyn AdminClient>,
    ctx: &AttemptContext,
    request: AdminRequest,
) -> Dispatch<()> {
    match ctx.connection(ServiceKind::Admin) {
        Ok(conn) => Dispatch::Sent(client.call(conn, request)),
        Err(e) => Dispatch::Abort(e),
    }
}

/// Splits a tablet at `split_key` into two new tablets.
#[derive(Debug)]
pub struct SplitTablet {
    client: Arc<dyn AdminClient>,
    tablet: PartitionId,
    split_key: Vec<u8>,
    new_tablets: [PartitionId; 2],
}

impl SplitTablet {
    pub fn new(
        client: Arc<dyn AdminClient>,
        tablet: PartitionId,
        split_key: Vec<u8>,
        new_tablets: [PartitionId; 2],
    ) -> Self {
        Self { client, tablet, split_key, new_tablets }
    }
}

impl RemoteOperation for SplitTablet {
    type Response = ();

    fn kind(&self) -> TaskKind {
        TaskKind::SplitTablet
    }

    fn description(&self, _target: Option<&NodeId>) -> String {
        let [left, right] = &self.new_tablets;
        format!("split tablet {} into {left} and {right}", self.tablet)
    }

    fn send_request(&self, ctx: &AttemptContext) -> Dispatch<()> {
        let request = AdminRequest::SplitTablet {
            tablet: self.tablet.clone(),
            split_key: self.split_key.clone(),
            new_tablets: self.new_tablets.clone(),
        };
        admin_call(&self.client, ctx, request)
    }

    fn handle_response(&self, _ctx: &AttemptContext, result: Result<(), TaskError>) -> Outcome {
        let e = match result {
            Ok(()) => return Outcome::Complete,
            Err(e) => e,
        };
        match e.remote_status() {
            Some(StatusCode::AlreadyPresent) => {
                info!(tablet = %self.tablet, "tablet already split");
                Outcome::Complete
            }
            Some(
                StatusCode::InvalidArgument
                | StatusCode::NotFound
                | StatusCode::NotSupported
                | StatusCode::Incomplete,
            ) => Outcome::Failed(e),
            _ => Outcome::Retry,
        }
    }
}

/// Pushes a new schema version to the tablet leader.
#[derive(Debug)]
pub struct AlterSchema {
    client: Arc<dyn AdminClient>,
    catalog: Arc<dyn CatalogListener>,
    tablet: PartitionId,
    table: String,
    schema_version: u32,
}

impl AlterSchema {
    pub fn new(
        client: Arc<dyn AdminClient>,
        catalog: Arc<dyn CatalogListener>,
        tablet: PartitionId,
        table: impl Into<String>,
        schema_version: u32,
    ) -> Self {
        Self { client, catalog, tablet, table: table.into(), schema_version }
    }
}

impl RemoteOperation for AlterSchema {
    type Response = ();

    fn kind(&self) -> TaskKind {
        TaskKind::AlterSchema
    }

    fn description(&self, _target: Option<&NodeId>) -> String {
        format!(
            "alter table {} to schema version {} on tablet {}",
            self.table, self.schema_version, self.tablet
        )
    }

    fn send_request(&self, ctx: &AttemptContext) -> Dispatch<()> {
        let request = AdminRequest::AlterSchema {
            tablet: self.tablet.clone(),
            table: self.table.clone(),
            schema_version: self.schema_version,
        };
        admin_call(&self.client, ctx, request)
    }

    fn handle_response(&self, ctx: &AttemptContext, result: Result<(), TaskError>) -> Outcome {
        match result {
            Ok(()) => {}
            Err(e) => match e.server_code() {
                Some(
                    ServerErrorCode::TabletNotFound
                    | ServerErrorCode::MismatchedSchema
                    | ServerErrorCode::TabletHasANewerSchema,
                ) => {
                    warn!(tablet = %self.tablet, error = %e, "alter schema not applied, ignoring");
                }
                _ => return Outcome::Retry,
            },
        }
        self.catalog.schema_version_reported(&self.tablet, ctx.target().id(), self.schema_version);
        Outcome::Complete
    }
}

// Only leadership problems are worth another attempt; a lost connection aborts.
fn colocation_outcome(
    tablet: &PartitionId,
    table: &str,
    action: &str,
    result: Result<(), TaskError>,
) -> Outcome {
    let e = match result {
        Ok(()) => return Outcome::Complete,
        Err(e) => e,
    };
    if e.is_transport() {
        return Outcome::Abort(e);
    }
    match e.server_code() {
        Some(ServerErrorCode::NotTheLeader | ServerErrorCode::LeaderNotReadyToServe) => {
            Outcome::Retry
        }
        _ => {
            warn!(tablet = %tablet, table, error = %e, "{action} failed, not retrying");
            Outcome::Complete
        }
    }
}

/// Adds a colocated table to an existing tablet.
#[derive(Debug)]
pub struct AddTableToTablet {
    client: Arc<dyn AdminClient>,
    tablet: PartitionId,
    table: String,
}

impl AddTableToTablet {
    pub fn new(
        client: Arc<dyn AdminClient>,
        tablet: PartitionId,
        table: impl Into<String>,
    ) -> Self {
        Self { client, tablet, table: table.into() }
    }
}

impl RemoteOperation for AddTableToTablet {
    type Response = ();

    fn kind(&self) -> TaskKind {
        TaskKind::AddTableToTablet
    }

    fn description(&self, _target: Option<&NodeId>) -> String {
        format!("add table {} to tablet {}", self.table, self.tablet)
    }

    fn send_request(&self, ctx: &AttemptContext) -> Dispatch<()> {
        let request = AdminRequest::AddTableToTablet {
            tablet: self.tablet.clone(),
            table: self.table.clone(),
        };
        admin_call(&self.client, ctx, request)
    }

    fn handle_response(&self, _ctx: &AttemptContext, result: Result<(), TaskError>) -> Outcome {
        colocation_outcome(&self.tablet, &self.table, "add table", result)
    }
}

/// Removes a colocated table from the tablet hosting it.
#[derive(Debug)]
pub struct RemoveTableFromTablet {
    client: Arc<dyn AdminClient>,
    tablet: PartitionId,
    table: String,
}

impl RemoveTableFromTablet {
    pub fn new(
        client: Arc<dyn AdminClient>,
        tablet: PartitionId,
        table: impl Into<String>,
    ) -> Self {
        Self { client, tablet, table: table.into() }
    }
}

impl RemoteOperation for RemoveTableFromTablet {
    type Response = ();

    fn kind(&self) -> TaskKind {
        TaskKind::RemoveTableFromTablet
    }

    fn description(&self, _target: Option<&NodeId>) -> String {
        format!("remove table {} from tablet {}", self.table, self.tablet)
    }

    fn send_request(&self, ctx: &AttemptContext) -> Dispatch<()> {
        let request = AdminRequest::RemoveTableFromTablet {
            tablet: self.tablet.clone(),
            table: self.table.clone(),
        };
        admin_call(&self.client, ctx, request)
    }

    fn handle_response(&self, _ctx: &AttemptContext, result: Result<(), TaskError>) -> Outcome {
        colocation_outcome(&self.tablet, &self.table, "remove table", result)
    }
}
