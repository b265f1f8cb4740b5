use super::{NodeFilter, NodeRegistry, SortKey, sort_nodes};
use crate::error::{FluxError, Result};
use crate::node::{ClusterId, ConnectionClass, NodeRecord, NodeRole, NodeStatus, Resources};
use crate::particle::ParticleId;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory registry backend. The default for tests and single-process
/// deployments; every mutation merges into the existing record under one
/// write lock, so disjoint-field updates cannot lose each other.
#[derive(Default)]
pub struct MemoryRegistry {
    nodes: RwLock<HashMap<String, NodeRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_node<F, T>(&self, id: &str, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut NodeRecord) -> T,
    {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| FluxError::NodeNotFound(id.to_string()))?;
        Ok(mutate(node))
    }

    /// Age a node's heartbeat. Test hook for liveness sweeps.
    #[doc(hidden)]
    pub async fn backdate_heartbeat(&self, id: &str, age: chrono::Duration) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(id) {
            node.last_heartbeat_at = chrono::Utc::now() - age;
        }
    }
}

#[async_trait]
impl NodeRegistry for MemoryRegistry {
    async fn upsert_node(
        &self,
        id: &str,
        role: NodeRole,
        resources: Resources,
    ) -> Result<NodeRecord> {
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .entry(id.to_string())
            .and_modify(|existing| {
                existing.role = role;
                existing.resources = resources;
                existing.connection_class =
                    ConnectionClass::from_network_mbps(resources.network_mbps);
                existing.status = NodeStatus::Online;
                existing.last_heartbeat_at = chrono::Utc::now();
            })
            .or_insert_with(|| NodeRecord::new(id, role, resources));
        Ok(node.clone())
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeRecord>> {
        Ok(self.nodes.read().await.get(id).cloned())
    }

    async fn touch_heartbeat(&self, id: &str) -> Result<()> {
        self.with_node(id, |node| {
            node.last_heartbeat_at = chrono::Utc::now();
        })
        .await
    }

    async fn update_resources(&self, id: &str, resources: Resources) -> Result<()> {
        self.with_node(id, |node| {
            node.resources = resources;
            node.connection_class = ConnectionClass::from_network_mbps(resources.network_mbps);
        })
        .await
    }

    async fn set_status(&self, id: &str, status: NodeStatus) -> Result<()> {
        self.with_node(id, |node| {
            node.status = status;
        })
        .await
    }

    async fn set_status_if(
        &self,
        id: &str,
        expected: NodeStatus,
        next: NodeStatus,
    ) -> Result<bool> {
        self.with_node(id, |node| {
            if node.status == expected {
                node.status = next;
                true
            } else {
                false
            }
        })
        .await
    }

    async fn mark_offline(&self, id: &str) -> Result<()> {
        self.set_status(id, NodeStatus::Offline).await
    }

    async fn find_by_role(
        &self,
        role: NodeRole,
        filter: NodeFilter,
        sort: SortKey,
        limit: usize,
    ) -> Result<Vec<NodeRecord>> {
        let nodes = self.nodes.read().await;
        let mut matched: Vec<NodeRecord> = nodes
            .values()
            .filter(|node| node.role == role && filter.matches(node))
            .cloned()
            .collect();
        sort_nodes(&mut matched, sort);
        matched.truncate(limit);
        Ok(matched)
    }

    async fn set_cluster_membership(
        &self,
        id: &str,
        cluster_id: Option<&str>,
        is_master: bool,
    ) -> Result<()> {
        self.with_node(id, |node| {
            node.cluster_id = cluster_id.map(str::to_string);
            node.is_master = is_master;
        })
        .await
    }

    async fn set_master_if(&self, id: &str, expected: bool, next: bool) -> Result<bool> {
        self.with_node(id, |node| {
            if node.is_master == expected {
                node.is_master = next;
                true
            } else {
                false
            }
        })
        .await
    }

    async fn set_assigned_ingest(&self, id: &str, ingest_id: Option<&str>) -> Result<()> {
        self.with_node(id, |node| {
            node.assigned_ingest_id = ingest_id.map(str::to_string);
        })
        .await
    }

    async fn set_cache_state(
        &self,
        id: &str,
        particle_ids: Vec<ParticleId>,
        cached_bytes: u64,
    ) -> Result<()> {
        self.with_node(id, |node| {
            node.cached_particle_ids = particle_ids;
            node.cached_bytes = cached_bytes;
        })
        .await
    }

    async fn list_cluster_ids(&self) -> Result<Vec<ClusterId>> {
        let nodes = self.nodes.read().await;
        let mut ids: Vec<ClusterId> = nodes
            .values()
            .filter(|node| node.role == NodeRole::Storage && node.is_online())
            .filter_map(|node| node.cluster_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn cluster_members(&self, cluster_id: &str) -> Result<Vec<NodeRecord>> {
        let nodes = self.nodes.read().await;
        Ok(nodes
            .values()
            .filter(|node| {
                node.role == NodeRole::Storage
                    && node.cluster_id.as_deref() == Some(cluster_id)
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn resources(cpu: f64, memory: u64) -> Resources {
        Resources {
            cpu_pct: cpu,
            memory_mb: memory,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let registry = MemoryRegistry::new();
        let first = registry
            .upsert_node("node_a", NodeRole::Ingest, resources(40.0, 512))
            .await
            .unwrap();
        let second = registry
            .upsert_node("node_a", NodeRole::Ingest, resources(50.0, 512))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.resources.cpu_pct, 50.0);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn test_concurrent_disjoint_field_updates_both_land() {
        let registry = Arc::new(MemoryRegistry::new());
        registry
            .upsert_node("node_a", NodeRole::Cache, resources(10.0, 64))
            .await
            .unwrap();

        let heartbeat = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for _ in 0..100 {
                    registry.touch_heartbeat("node_a").await.unwrap();
                }
            })
        };
        let updates = {
            let registry = registry.clone();
            tokio::spawn(async move {
                for i in 0..100u64 {
                    registry
                        .update_resources("node_a", resources(10.0, i))
                        .await
                        .unwrap();
                }
            })
        };
        heartbeat.await.unwrap();
        updates.await.unwrap();

        let node = registry.get_node("node_a").await.unwrap().unwrap();
        assert_eq!(node.resources.memory_mb, 99);
    }

    #[tokio::test]
    async fn test_status_cas() {
        let registry = MemoryRegistry::new();
        registry
            .upsert_node("node_a", NodeRole::Storage, Resources::default())
            .await
            .unwrap();

        assert!(
            registry
                .set_status_if("node_a", NodeStatus::Online, NodeStatus::Offline)
                .await
                .unwrap()
        );
        // Second sweep observing the same stale heartbeat is a no-op.
        assert!(
            !registry
                .set_status_if("node_a", NodeStatus::Online, NodeStatus::Offline)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_find_by_role_filters_and_sorts() {
        let registry = MemoryRegistry::new();
        registry
            .upsert_node("low", NodeRole::Ingest, resources(10.0, 128))
            .await
            .unwrap();
        registry
            .upsert_node("high", NodeRole::Ingest, resources(80.0, 1024))
            .await
            .unwrap();
        registry
            .upsert_node("offline", NodeRole::Ingest, resources(90.0, 2048))
            .await
            .unwrap();
        registry.mark_offline("offline").await.unwrap();

        let found = registry
            .find_by_role(NodeRole::Ingest, NodeFilter::online(), SortKey::CpuDesc, 10)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, "high");
    }
}
