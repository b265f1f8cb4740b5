use crate::particle::ParticleId;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type NodeId = String;
pub type ClusterId = String;

/// Worker roles in the relay mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Originates a stream and forwards particle batches upstream.
    Ingest,
    /// Buffers particles up to a byte threshold before forwarding.
    Cache,
    /// Persists particles as a member of a bounded storage cluster.
    Storage,
    /// Drives node selection, cluster tracking and stream transitions.
    Coordinator,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Ingest => write!(f, "ingest"),
            NodeRole::Cache => write!(f, "cache"),
            NodeRole::Storage => write!(f, "storage"),
            NodeRole::Coordinator => write!(f, "coordinator"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Busy,
    Offline,
}

/// Resource snapshot as reported by the node itself.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Resources {
    /// Available CPU, percent.
    pub cpu_pct: f64,
    /// Available memory, MB.
    pub memory_mb: u64,
    /// Available storage, MB.
    pub storage_mb: u64,
    /// Available network bandwidth, Mbps.
    pub network_mbps: f64,
}

impl Resources {
    pub fn meets(&self, floor: &ResourceFloor) -> bool {
        self.cpu_pct >= floor.min_cpu_pct
            && self.memory_mb >= floor.min_memory_mb
            && self.storage_mb >= floor.min_storage_mb
            && self.network_mbps >= floor.min_network_mbps
    }
}

/// Minimum-resource constraints for node selection.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceFloor {
    #[serde(default)]
    pub min_cpu_pct: f64,
    #[serde(default)]
    pub min_memory_mb: u64,
    #[serde(default)]
    pub min_storage_mb: u64,
    #[serde(default)]
    pub min_network_mbps: f64,
}

/// Connection class declared at registration time. Drives the per-node
/// cache memory limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionClass {
    Broadband,
    Constrained,
}

impl ConnectionClass {
    /// Links at 20 Mbps or better count as broadband.
    pub fn from_network_mbps(mbps: f64) -> Self {
        if mbps >= 20.0 {
            ConnectionClass::Broadband
        } else {
            ConnectionClass::Constrained
        }
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        match self {
            ConnectionClass::Broadband => 128 * 1024 * 1024,
            ConnectionClass::Constrained => 32 * 1024 * 1024,
        }
    }
}

/// Durable record of a connected worker node.
///
/// Invariants: `is_master` may be true only for `role == Storage`; at most
/// one online master per cluster; `cached_bytes` equals the payload total
/// of `cached_particle_ids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub role: NodeRole,
    pub resources: Resources,
    pub status: NodeStatus,
    pub last_heartbeat_at: chrono::DateTime<chrono::Utc>,
    pub cluster_id: Option<ClusterId>,
    pub is_master: bool,
    pub assigned_ingest_id: Option<NodeId>,
    pub cached_particle_ids: Vec<ParticleId>,
    pub cached_bytes: u64,
    pub connection_class: ConnectionClass,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl NodeRecord {
    pub fn new(id: impl Into<NodeId>, role: NodeRole, resources: Resources) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            role,
            resources,
            status: NodeStatus::Online,
            last_heartbeat_at: now,
            cluster_id: None,
            is_master: false,
            assigned_ingest_id: None,
            cached_particle_ids: Vec::new(),
            cached_bytes: 0,
            connection_class: ConnectionClass::from_network_mbps(resources.network_mbps),
            created_at: now,
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == NodeStatus::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_class_boundary() {
        assert_eq!(
            ConnectionClass::from_network_mbps(20.0),
            ConnectionClass::Broadband
        );
        assert_eq!(
            ConnectionClass::from_network_mbps(19.9),
            ConnectionClass::Constrained
        );
        assert_eq!(
            ConnectionClass::Constrained.memory_limit_bytes(),
            32 * 1024 * 1024
        );
    }

    #[test]
    fn test_resource_floor() {
        let resources = Resources {
            cpu_pct: 40.0,
            memory_mb: 512,
            storage_mb: 0,
            network_mbps: 10.0,
        };
        assert!(resources.meets(&ResourceFloor {
            min_cpu_pct: 20.0,
            min_memory_mb: 100,
            ..Default::default()
        }));
        assert!(!resources.meets(&ResourceFloor {
            min_storage_mb: 100,
            ..Default::default()
        }));
    }
}
