//! Node registry and replica pickers.
//!
//! A task never caches its target: every attempt asks its [`ReplicaPicker`] again, so an attempt
//! that follows a leadership change or a node restart lands on the node that is correct *now*.

use crate::error::TaskError;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Stable identifier of a storage node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a replicated partition (tablet).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(id: impl Into<String>) -> Self {
        PartitionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// RPC service exposed by a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// Replica administration (create, delete, alter, split).
    Admin,
    /// Consensus membership and leadership.
    Consensus,
    /// Regular data-plane service.
    Data,
}

/// Open connection to one service on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionProxy {
    node: NodeId,
    address: String,
    service: ServiceKind,
}

impl ConnectionProxy {
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn service(&self) -> ServiceKind {
        self.service
    }
}

/// Live descriptor of a node as seen by the control plane.
#[derive(Debug)]
pub struct NodeDescriptor {
    id: NodeId,
    address: String,
    live: AtomicBool,
    reachable: AtomicBool,
}

/// Shared handle to a node descriptor. Re-resolved on every attempt.
pub type NodeHandle = Arc<NodeDescriptor>;

impl NodeDescriptor {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            live: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the node is heartbeating. Dead nodes stay known to the registry.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Release);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    /// Open a connection to `service` on this node.
    pub fn connect(&self, service: ServiceKind) -> Result<ConnectionProxy, TaskError> {
        if !self.reachable.load(Ordering::Acquire) {
            return Err(TaskError::Unreachable {
                node: self.id.to_string(),
                reason: format!("cannot open {service:?} connection to {}", self.address),
            });
        }
        Ok(ConnectionProxy { node: self.id.clone(), address: self.address.clone(), service })
    }
}

/// Cluster membership and leadership as known to the control plane.
pub trait NodeRegistry: Send + Sync + fmt::Debug {
    /// Look a node up by id; `NotFound` if the cluster does not know it.
    fn lookup_by_id(&self, id: &NodeId) -> Result<NodeHandle, TaskError>;
    /// Current leader of a partition; `NoLeader` if none is known.
    fn current_leader_of(&self, partition: &PartitionId) -> Result<NodeHandle, TaskError>;
}

/// In-memory registry backed by RwLocks.
#[derive(Debug, Default, Clone)]
pub struct InMemoryNodeRegistry {
    nodes: Arc<RwLock<HashMap<NodeId, NodeHandle>>>,
    leaders: Arc<RwLock<HashMap<PartitionId, NodeId>>>,
}

impl InMemoryNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node, replacing any previous descriptor with the same id.
    pub fn register(&self, id: NodeId, address: impl Into<String>) -> NodeHandle {
        let handle = Arc::new(NodeDescriptor::new(id.clone(), address));
        self.nodes.write().unwrap_or_else(PoisonError::into_inner).insert(id, handle.clone());
        handle
    }

    pub fn remove(&self, id: &NodeId) -> Option<NodeHandle> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner).remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<NodeHandle> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    pub fn set_leader(&self, partition: PartitionId, leader: NodeId) {
        tracing::debug!(partition = %partition, leader = %leader, "leader changed");
        self.leaders.write().unwrap_or_else(PoisonError::into_inner).insert(partition, leader);
    }

    pub fn clear_leader(&self, partition: &PartitionId) {
        self.leaders.write().unwrap_or_else(PoisonError::into_inner).remove(partition);
    }
}

impl NodeRegistry for InMemoryNodeRegistry {
    fn lookup_by_id(&self, id: &NodeId) -> Result<NodeHandle, TaskError> {
        self.get(id).ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    fn current_leader_of(&self, partition: &PartitionId) -> Result<NodeHandle, TaskError> {
        let leader = self
            .leaders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(partition)
            .cloned()
            .ok_or_else(|| TaskError::NoLeader(partition.to_string()))?;
        self.lookup_by_id(&leader)
    }
}

/// Strategy resolving the node a task should target on the next attempt.
pub trait ReplicaPicker: Send + Sync + fmt::Debug {
    fn pick_replica(&self) -> Result<NodeHandle, TaskError>;
}

/// Always targets one node, looked up by id on every call.
#[derive(Debug, Clone)]
pub struct PickSpecificNode {
    registry: Arc<dyn NodeRegistry>,
    node: NodeId,
}

impl PickSpecificNode {
    pub fn new(registry: Arc<dyn NodeRegistry>, node: NodeId) -> Self {
        Self { registry, node }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }
}

impl ReplicaPicker for PickSpecificNode {
    fn pick_replica(&self) -> Result<NodeHandle, TaskError> {
        self.registry.lookup_by_id(&self.node)
    }
}

/// Targets whichever node currently leads the partition.
#[derive(Debug, Clone)]
pub struct PickLeader {
    registry: Arc<dyn NodeRegistry>,
    partition: PartitionId,
}

impl PickLeader {
    pub fn new(registry: Arc<dyn NodeRegistry>, partition: PartitionId) -> Self {
        Self { registry, partition }
    }

    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }
}

impl ReplicaPicker for PickLeader {
    fn pick_replica(&self) -> Result<NodeHandle, TaskError> {
        self.registry.current_leader_of(&self.partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> InMemoryNodeRegistry {
        let registry = InMemoryNodeRegistry::new();
        registry.register(NodeId::new("ts-1"), "10.0.0.1:9100");
        registry.register(NodeId::new("ts-2"), "10.0.0.2:9100");
        registry
    }

    #[test]
    fn specific_node_picker_resolves_known_node() {
        let registry = registry();
        let picker = PickSpecificNode::new(Arc::new(registry), NodeId::new("ts-1"));
        let node = picker.pick_replica().unwrap();
        assert_eq!(node.address(), "10.0.0.1:9100");
    }

    #[test]
    fn specific_node_picker_fails_for_unknown_node() {
        let picker = PickSpecificNode::new(Arc::new(registry()), NodeId::new("ts-9"));
        assert_eq!(picker.pick_replica().unwrap_err(), TaskError::NotFound("ts-9".into()));
    }

    #[test]
    fn leader_picker_follows_leadership_changes() {
        let registry = registry();
        let tablet = PartitionId::new("tablet-a");
        let picker = PickLeader::new(Arc::new(registry.clone()), tablet.clone());

        assert!(matches!(picker.pick_replica(), Err(TaskError::NoLeader(_))));

        registry.set_leader(tablet.clone(), NodeId::new("ts-1"));
        assert_eq!(picker.pick_replica().unwrap().id(), &NodeId::new("ts-1"));

        registry.set_leader(tablet.clone(), NodeId::new("ts-2"));
        assert_eq!(picker.pick_replica().unwrap().id(), &NodeId::new("ts-2"));

        registry.clear_leader(&tablet);
        assert!(picker.pick_replica().is_err());
    }

    #[test]
    fn leader_that_left_the_cluster_is_not_found() {
        let registry = registry();
        let tablet = PartitionId::new("tablet-b");
        registry.set_leader(tablet.clone(), NodeId::new("ts-2"));
        registry.remove(&NodeId::new("ts-2"));

        let picker = PickLeader::new(Arc::new(registry), tablet);
        assert_eq!(picker.pick_replica().unwrap_err(), TaskError::NotFound("ts-2".into()));
    }

    #[test]
    fn unreachable_node_refuses_connections() {
        let registry = registry();
        let node = registry.get(&NodeId::new("ts-1")).unwrap();
        assert!(node.connect(ServiceKind::Admin).is_ok());

        node.set_reachable(false);
        let err = node.connect(ServiceKind::Consensus).unwrap_err();
        assert!(matches!(err, TaskError::Unreachable { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn dead_nodes_remain_known() {
        let registry = registry();
        let node = registry.get(&NodeId::new("ts-2")).unwrap();
        node.set_live(false);
        let found = registry.lookup_by_id(&NodeId::new("ts-2")).unwrap();
        assert!(!found.is_live());
    }
}
