pub mod factory;
pub mod memory;
pub mod redis;
pub mod rest;

pub use factory::RegistryBuilder;
pub use memory::MemoryRegistry;
pub use redis::RedisRegistry;
pub use rest::RestMirror;

use crate::error::Result;
use crate::node::{ClusterId, NodeRecord, NodeRole, NodeStatus, ResourceFloor, Resources};
use crate::particle::ParticleId;
use async_trait::async_trait;

/// Query filter for [`NodeRegistry::find_by_role`].
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub status: Option<NodeStatus>,
    pub floor: Option<ResourceFloor>,
    pub cluster_id: Option<ClusterId>,
    pub is_master: Option<bool>,
}

impl NodeFilter {
    pub fn online() -> Self {
        Self {
            status: Some(NodeStatus::Online),
            ..Default::default()
        }
    }

    pub fn matches(&self, node: &NodeRecord) -> bool {
        if let Some(status) = self.status {
            if node.status != status {
                return false;
            }
        }
        if let Some(floor) = &self.floor {
            if !node.resources.meets(floor) {
                return false;
            }
        }
        if let Some(cluster_id) = &self.cluster_id {
            if node.cluster_id.as_deref() != Some(cluster_id.as_str()) {
                return false;
            }
        }
        if let Some(is_master) = self.is_master {
            if node.is_master != is_master {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    CpuDesc,
    MemoryDesc,
    StorageDesc,
    NetworkDesc,
    HeartbeatDesc,
    CachedBytesAsc,
}

pub(crate) fn sort_nodes(nodes: &mut [NodeRecord], sort: SortKey) {
    match sort {
        SortKey::CpuDesc => nodes.sort_by(|a, b| {
            b.resources
                .cpu_pct
                .total_cmp(&a.resources.cpu_pct)
                .then(b.last_heartbeat_at.cmp(&a.last_heartbeat_at))
        }),
        SortKey::MemoryDesc => nodes.sort_by(|a, b| {
            b.resources
                .memory_mb
                .cmp(&a.resources.memory_mb)
                .then(b.last_heartbeat_at.cmp(&a.last_heartbeat_at))
        }),
        SortKey::StorageDesc => nodes.sort_by(|a, b| {
            b.resources
                .storage_mb
                .cmp(&a.resources.storage_mb)
                .then(b.last_heartbeat_at.cmp(&a.last_heartbeat_at))
        }),
        SortKey::NetworkDesc => nodes.sort_by(|a, b| {
            b.resources
                .network_mbps
                .total_cmp(&a.resources.network_mbps)
                .then(b.last_heartbeat_at.cmp(&a.last_heartbeat_at))
        }),
        SortKey::HeartbeatDesc => nodes.sort_by(|a, b| b.last_heartbeat_at.cmp(&a.last_heartbeat_at)),
        SortKey::CachedBytesAsc => nodes.sort_by(|a, b| a.cached_bytes.cmp(&b.cached_bytes)),
    }
}

/// Durable record of every connected worker node.
///
/// All mutations are idempotent upserts keyed by node id, applied as
/// field-level merges: a heartbeat and a resource update arriving
/// concurrently for the same node must both land. Sweep-driven flips of
/// `status` and `is_master` go through the compare-and-set methods so
/// duplicate sweeps cannot double-promote.
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    async fn upsert_node(
        &self,
        id: &str,
        role: NodeRole,
        resources: Resources,
    ) -> Result<NodeRecord>;

    async fn get_node(&self, id: &str) -> Result<Option<NodeRecord>>;

    async fn touch_heartbeat(&self, id: &str) -> Result<()>;

    async fn update_resources(&self, id: &str, resources: Resources) -> Result<()>;

    async fn set_status(&self, id: &str, status: NodeStatus) -> Result<()>;

    /// Compare-and-set on `status`; returns false if the current status
    /// did not match `expected`.
    async fn set_status_if(
        &self,
        id: &str,
        expected: NodeStatus,
        next: NodeStatus,
    ) -> Result<bool>;

    /// Logical deletion: nodes go offline, they are never hard-deleted
    /// while routing history references them.
    async fn mark_offline(&self, id: &str) -> Result<()>;

    async fn find_by_role(
        &self,
        role: NodeRole,
        filter: NodeFilter,
        sort: SortKey,
        limit: usize,
    ) -> Result<Vec<NodeRecord>>;

    async fn set_cluster_membership(
        &self,
        id: &str,
        cluster_id: Option<&str>,
        is_master: bool,
    ) -> Result<()>;

    /// Compare-and-set on `is_master`; the promotion path uses this to
    /// avoid double-promotion between overlapping sweeps.
    async fn set_master_if(&self, id: &str, expected: bool, next: bool) -> Result<bool>;

    async fn set_assigned_ingest(&self, id: &str, ingest_id: Option<&str>) -> Result<()>;

    /// Mirror of a cache node's accumulation, kept so that
    /// `cached_bytes == sum(size of cached_particle_ids)` holds in the record.
    async fn set_cache_state(
        &self,
        id: &str,
        particle_ids: Vec<ParticleId>,
        cached_bytes: u64,
    ) -> Result<()>;

    /// Distinct cluster ids across storage nodes, online members only.
    async fn list_cluster_ids(&self) -> Result<Vec<ClusterId>>;

    async fn cluster_members(&self, cluster_id: &str) -> Result<Vec<NodeRecord>>;
}
