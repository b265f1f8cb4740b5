use crate::bus::{CoordMessage, SessionBus};
use crate::error::{FluxError, Result};
use crate::node::{ClusterId, NodeId, NodeRecord, NodeRole, ResourceFloor};
use crate::particle::ParticleId;
use crate::registry::{NodeFilter, NodeRegistry, SortKey};
use crate::stream::StreamId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use ulid::Ulid;

/// Replication group size, one master plus three replicas.
pub const CLUSTER_CAPACITY: usize = 4;

/// Groups storage nodes into fixed-size replication clusters and routes
/// store/retrieve traffic through them. Writes go to the master only;
/// replication to the other members is asynchronous and best-effort.
pub struct StorageClusterManager {
    registry: Arc<dyn NodeRegistry>,
    bus: Arc<SessionBus>,
    /// stream id -> (cluster holding it, stored particle ids).
    stored: Mutex<HashMap<StreamId, (ClusterId, Vec<ParticleId>)>>,
}

impl StorageClusterManager {
    pub fn new(registry: Arc<dyn NodeRegistry>, bus: Arc<SessionBus>) -> Self {
        Self {
            registry,
            bus,
            stored: Mutex::new(HashMap::new()),
        }
    }

    /// Place a storage node into the first cluster with a free slot, or
    /// open a new cluster with the node as its master. Re-joining a node
    /// that already belongs to a cluster returns its current membership.
    pub async fn join_cluster(&self, node_id: &str) -> Result<(ClusterId, bool)> {
        let node = self
            .registry
            .get_node(node_id)
            .await?
            .ok_or_else(|| FluxError::NodeNotFound(node_id.to_string()))?;
        if node.role != NodeRole::Storage {
            return Err(FluxError::Internal(format!(
                "node {} is {}, only storage nodes join clusters",
                node_id, node.role
            )));
        }
        if let Some(cluster_id) = node.cluster_id {
            if node.is_master {
                let replaced = self
                    .online_members(&cluster_id)
                    .await?
                    .iter()
                    .any(|member| member.is_master && member.id != node_id);
                if replaced {
                    // A replica was promoted while this master was away;
                    // the returning node steps down to replica.
                    self.registry.set_master_if(node_id, true, false).await?;
                    tracing::info!(
                        node_id,
                        cluster_id = %cluster_id,
                        "returning master rejoined as replica"
                    );
                    return Ok((cluster_id, false));
                }
            }
            return Ok((cluster_id, node.is_master));
        }

        let mut placement = None;
        for cluster_id in self.registry.list_cluster_ids().await? {
            let members = self.online_members(&cluster_id).await?;
            if members.len() < CLUSTER_CAPACITY {
                placement = Some(cluster_id);
                break;
            }
        }

        let (cluster_id, is_master) = match placement {
            Some(cluster_id) => (cluster_id, false),
            None => (format!("cluster_{}", Ulid::new()), true),
        };

        self.registry
            .set_cluster_membership(node_id, Some(&cluster_id), is_master)
            .await?;
        tracing::info!(
            node_id,
            cluster_id = %cluster_id,
            is_master,
            "storage node joined cluster"
        );

        let joined = CoordMessage::ClusterJoined {
            cluster_id: cluster_id.clone(),
            is_master,
        };
        if let Err(error) = self.bus.send_to(NodeRole::Storage, node_id, joined) {
            tracing::warn!(node_id, %error, "cluster join notice not delivered");
        }
        Ok((cluster_id, is_master))
    }

    /// Route a write to the cluster's master and fan replication out to the
    /// online replicas. Replica failures are logged, never propagated; a
    /// missing or offline master fails the write.
    pub async fn store(
        &self,
        cluster_id: &str,
        stream_id: &str,
        particle_ids: Vec<ParticleId>,
        source_id: &str,
    ) -> Result<NodeId> {
        let members = self.online_members(cluster_id).await?;
        let master = members
            .iter()
            .find(|member| member.is_master)
            .ok_or_else(|| FluxError::ClusterUnavailable {
                cluster_id: cluster_id.to_string(),
            })?;

        self.bus.send_to(
            NodeRole::Storage,
            &master.id,
            CoordMessage::ParticlesStore {
                stream_id: stream_id.to_string(),
                particle_ids: particle_ids.clone(),
                source_id: source_id.to_string(),
            },
        )?;

        let mut replicated = 0usize;
        for replica in members.iter().filter(|member| !member.is_master) {
            let message = CoordMessage::ReplicateData {
                stream_id: stream_id.to_string(),
                particle_ids: particle_ids.clone(),
                source_master_id: master.id.clone(),
            };
            match self.bus.send_to(NodeRole::Storage, &replica.id, message) {
                Ok(()) => replicated += 1,
                Err(error) => {
                    tracing::warn!(
                        replica_id = %replica.id,
                        cluster_id,
                        %error,
                        "replication send failed"
                    );
                }
            }
        }
        tracing::info!(
            cluster_id,
            stream_id,
            master_id = %master.id,
            particles = particle_ids.len(),
            replicated,
            "stored particle batch"
        );

        let mut stored = self.stored.lock().await;
        let entry = stored
            .entry(stream_id.to_string())
            .or_insert_with(|| (cluster_id.to_string(), Vec::new()));
        entry.1.extend(particle_ids);

        Ok(master.id.clone())
    }

    /// Promote the best online replica to master, ranked by cpu headroom
    /// and then network throughput. A no-op when the cluster still has an
    /// online master or has no promotable replica. The compare-and-set on
    /// `is_master` keeps overlapping sweeps from double-promoting.
    pub async fn promote_master(&self, cluster_id: &str) -> Result<Option<NodeId>> {
        let members = self.online_members(cluster_id).await?;
        if members.iter().any(|member| member.is_master) {
            return Ok(None);
        }

        let mut replicas = members;
        replicas.sort_by(|a, b| {
            b.resources
                .cpu_pct
                .total_cmp(&a.resources.cpu_pct)
                .then(b.resources.network_mbps.total_cmp(&a.resources.network_mbps))
        });
        let Some(best) = replicas.first() else {
            tracing::warn!(cluster_id, "no promotable replica; cluster left masterless");
            return Ok(None);
        };

        if !self.registry.set_master_if(&best.id, false, true).await? {
            // Lost the race to a concurrent promotion.
            return Ok(None);
        }
        tracing::info!(cluster_id, node_id = %best.id, "promoted replica to master");

        let notice = CoordMessage::PromotedToMaster {
            cluster_id: cluster_id.to_string(),
        };
        if let Err(error) = self.bus.send_to(NodeRole::Storage, &best.id, notice) {
            tracing::warn!(node_id = %best.id, %error, "promotion notice not delivered");
        }
        Ok(Some(best.id.clone()))
    }

    /// Rotate mastership off the current master after it finishes a job,
    /// promoting the best online replica in its place. The outgoing master
    /// keeps its role when the cluster has no replacement, so rotation
    /// never leaves a cluster masterless.
    pub async fn rotate_master(&self, cluster_id: &str) -> Result<Option<NodeId>> {
        let members = self.online_members(cluster_id).await?;
        let Some(master) = members.iter().find(|member| member.is_master) else {
            return self.promote_master(cluster_id).await;
        };

        let mut replicas: Vec<&NodeRecord> =
            members.iter().filter(|member| !member.is_master).collect();
        replicas.sort_by(|a, b| {
            b.resources
                .cpu_pct
                .total_cmp(&a.resources.cpu_pct)
                .then(b.resources.network_mbps.total_cmp(&a.resources.network_mbps))
        });
        let Some(next) = replicas.first() else {
            tracing::debug!(cluster_id, "no replica to rotate to; master kept");
            return Ok(None);
        };

        if !self.registry.set_master_if(&master.id, true, false).await? {
            return Ok(None);
        }
        if !self.registry.set_master_if(&next.id, false, true).await? {
            return Ok(None);
        }
        tracing::info!(
            cluster_id,
            from = %master.id,
            to = %next.id,
            "rotated cluster master"
        );

        let notice = CoordMessage::PromotedToMaster {
            cluster_id: cluster_id.to_string(),
        };
        if let Err(error) = self.bus.send_to(NodeRole::Storage, &next.id, notice) {
            tracing::warn!(node_id = %next.id, %error, "rotation notice not delivered");
        }
        Ok(Some(next.id.clone()))
    }

    /// Pick a member to serve a read and route the retrieve request to it.
    /// Replicas are preferred over the master so serving reads does not
    /// contend with writes; among replicas, highest network first.
    pub async fn retrieve(
        &self,
        cluster_id: &str,
        stream_id: &str,
        particle_ids: Vec<ParticleId>,
        target_id: &str,
    ) -> Result<NodeId> {
        let members = self.online_members(cluster_id).await?;

        let mut replicas: Vec<&NodeRecord> =
            members.iter().filter(|member| !member.is_master).collect();
        replicas.sort_by(|a, b| {
            b.resources
                .network_mbps
                .total_cmp(&a.resources.network_mbps)
        });

        let source = replicas
            .first()
            .copied()
            .or_else(|| members.iter().find(|member| member.is_master))
            .ok_or_else(|| FluxError::ClusterUnavailable {
                cluster_id: cluster_id.to_string(),
            })?;

        self.bus.send_to(
            NodeRole::Storage,
            &source.id,
            CoordMessage::ParticlesRetrieve {
                stream_id: stream_id.to_string(),
                particle_ids,
                target_id: target_id.to_string(),
            },
        )?;
        Ok(source.id.clone())
    }

    /// Choose the cluster for a new stream's stored particles: the one
    /// whose online master has the most free storage.
    pub async fn allocate_cluster(&self) -> Result<ClusterId> {
        let masters = self
            .registry
            .find_by_role(
                NodeRole::Storage,
                NodeFilter {
                    is_master: Some(true),
                    ..NodeFilter::online()
                },
                SortKey::StorageDesc,
                1,
            )
            .await?;

        masters
            .into_iter()
            .next()
            .and_then(|master| master.cluster_id)
            .ok_or(FluxError::NoCandidateNode {
                role: NodeRole::Storage,
                min: ResourceFloor::default(),
            })
    }

    /// Where a stream's stored particles live, if any have been stored.
    pub async fn stored_location(&self, stream_id: &str) -> Option<(ClusterId, Vec<ParticleId>)> {
        let stored = self.stored.lock().await;
        stored.get(stream_id).cloned()
    }

    pub async fn forget_stream(&self, stream_id: &str) {
        let mut stored = self.stored.lock().await;
        stored.remove(stream_id);
    }

    async fn online_members(&self, cluster_id: &str) -> Result<Vec<NodeRecord>> {
        let members = self.registry.cluster_members(cluster_id).await?;
        Ok(members
            .into_iter()
            .filter(NodeRecord::is_online)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Resources;
    use crate::registry::MemoryRegistry;

    async fn storage_node(registry: &MemoryRegistry, id: &str, cpu: f64, network: f64) {
        registry
            .upsert_node(
                id,
                NodeRole::Storage,
                Resources {
                    cpu_pct: cpu,
                    network_mbps: network,
                    storage_mb: 10_000,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    fn manager() -> (Arc<MemoryRegistry>, Arc<SessionBus>, StorageClusterManager) {
        let registry = Arc::new(MemoryRegistry::new());
        let bus = Arc::new(SessionBus::new());
        let manager = StorageClusterManager::new(registry.clone(), bus.clone());
        (registry, bus, manager)
    }

    #[tokio::test]
    async fn test_join_fills_cluster_then_opens_next() {
        let (registry, _bus, manager) = manager();

        let mut first_cluster = None;
        for i in 0..CLUSTER_CAPACITY {
            let id = format!("store_{}", i);
            storage_node(&registry, &id, 10.0, 10.0).await;
            let (cluster_id, is_master) = manager.join_cluster(&id).await.unwrap();
            assert_eq!(is_master, i == 0, "only the first joiner opens as master");
            match &first_cluster {
                None => first_cluster = Some(cluster_id),
                Some(expected) => assert_eq!(&cluster_id, expected),
            }
        }

        // Fifth node opens a second cluster as its master.
        storage_node(&registry, "store_4", 10.0, 10.0).await;
        let (cluster_id, is_master) = manager.join_cluster("store_4").await.unwrap();
        assert_ne!(Some(&cluster_id), first_cluster.as_ref());
        assert!(is_master);

        // Re-join is idempotent.
        let (again, _) = manager.join_cluster("store_4").await.unwrap();
        assert_eq!(again, cluster_id);
    }

    #[tokio::test]
    async fn test_store_routes_to_master_and_replicates() {
        let (registry, bus, manager) = manager();
        for id in ["m", "r1", "r2"] {
            storage_node(&registry, id, 10.0, 10.0).await;
            manager.join_cluster(id).await.unwrap();
        }
        let mut master_rx = bus.attach(NodeRole::Storage, "m");
        let mut replica_rx = bus.attach(NodeRole::Storage, "r1");
        // r2 stays detached; its replication send fails quietly.

        let cluster_id = registry.get_node("m").await.unwrap().unwrap().cluster_id.unwrap();
        let target = manager
            .store(&cluster_id, "s1", vec!["p1".into(), "p2".into()], "ingest_a")
            .await
            .unwrap();
        assert_eq!(target, "m");

        assert!(matches!(
            master_rx.try_recv().unwrap(),
            CoordMessage::ParticlesStore { .. }
        ));
        match replica_rx.try_recv().unwrap() {
            CoordMessage::ReplicateData {
                source_master_id, ..
            } => assert_eq!(source_master_id, "m"),
            other => panic!("unexpected message: {:?}", other),
        }

        let (where_stored, ids) = manager.stored_location("s1").await.unwrap();
        assert_eq!(where_stored, cluster_id);
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn test_store_without_master_is_cluster_unavailable() {
        let (registry, _bus, manager) = manager();
        storage_node(&registry, "m", 10.0, 10.0).await;
        storage_node(&registry, "r1", 10.0, 10.0).await;
        manager.join_cluster("m").await.unwrap();
        manager.join_cluster("r1").await.unwrap();
        let cluster_id = registry.get_node("m").await.unwrap().unwrap().cluster_id.unwrap();

        registry.mark_offline("m").await.unwrap();
        let error = manager
            .store(&cluster_id, "s1", vec!["p1".into()], "ingest_a")
            .await
            .unwrap_err();
        assert!(matches!(error, FluxError::ClusterUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_promotion_prefers_cpu_then_network() {
        let (registry, _bus, manager) = manager();
        storage_node(&registry, "m", 50.0, 10.0).await;
        storage_node(&registry, "r_slow", 20.0, 90.0).await;
        storage_node(&registry, "r_fast", 40.0, 5.0).await;
        for id in ["m", "r_slow", "r_fast"] {
            manager.join_cluster(id).await.unwrap();
        }
        let cluster_id = registry.get_node("m").await.unwrap().unwrap().cluster_id.unwrap();

        // Online master present: promotion is a no-op.
        assert!(manager.promote_master(&cluster_id).await.unwrap().is_none());

        registry.mark_offline("m").await.unwrap();
        let promoted = manager.promote_master(&cluster_id).await.unwrap();
        assert_eq!(promoted.as_deref(), Some("r_fast"));

        // Second sweep sees the new master and does nothing.
        assert!(manager.promote_master(&cluster_id).await.unwrap().is_none());
        let node = registry.get_node("r_fast").await.unwrap().unwrap();
        assert!(node.is_master);
    }

    #[tokio::test]
    async fn test_returning_master_rejoins_as_replica() {
        let (registry, _bus, manager) = manager();
        storage_node(&registry, "m", 50.0, 10.0).await;
        storage_node(&registry, "r", 30.0, 10.0).await;
        manager.join_cluster("m").await.unwrap();
        manager.join_cluster("r").await.unwrap();
        let cluster_id = registry.get_node("m").await.unwrap().unwrap().cluster_id.unwrap();

        registry.mark_offline("m").await.unwrap();
        assert_eq!(
            manager.promote_master(&cluster_id).await.unwrap().as_deref(),
            Some("r")
        );

        // The old master comes back: re-registration puts it online again
        // and it re-joins its cluster, stepping down to replica.
        storage_node(&registry, "m", 50.0, 10.0).await;
        let (rejoined, is_master) = manager.join_cluster("m").await.unwrap();
        assert_eq!(rejoined, cluster_id);
        assert!(!is_master);

        let masters: Vec<String> = registry
            .cluster_members(&cluster_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|member| member.is_online() && member.is_master)
            .map(|member| member.id)
            .collect();
        assert_eq!(masters, vec!["r".to_string()]);
    }

    #[tokio::test]
    async fn test_rotate_master_hands_off_to_best_replica() {
        let (registry, _bus, manager) = manager();
        storage_node(&registry, "m", 50.0, 10.0).await;
        storage_node(&registry, "r_strong", 40.0, 10.0).await;
        storage_node(&registry, "r_weak", 20.0, 10.0).await;
        for id in ["m", "r_strong", "r_weak"] {
            manager.join_cluster(id).await.unwrap();
        }
        let cluster_id = registry.get_node("m").await.unwrap().unwrap().cluster_id.unwrap();

        let rotated = manager.rotate_master(&cluster_id).await.unwrap();
        assert_eq!(rotated.as_deref(), Some("r_strong"));
        assert!(!registry.get_node("m").await.unwrap().unwrap().is_master);
        assert!(registry.get_node("r_strong").await.unwrap().unwrap().is_master);
    }

    #[tokio::test]
    async fn test_rotate_master_without_replica_keeps_master() {
        let (registry, _bus, manager) = manager();
        storage_node(&registry, "m", 50.0, 10.0).await;
        manager.join_cluster("m").await.unwrap();
        let cluster_id = registry.get_node("m").await.unwrap().unwrap().cluster_id.unwrap();

        assert!(manager.rotate_master(&cluster_id).await.unwrap().is_none());
        assert!(registry.get_node("m").await.unwrap().unwrap().is_master);
    }

    #[tokio::test]
    async fn test_masterless_cluster_without_replicas() {
        let (registry, _bus, manager) = manager();
        storage_node(&registry, "m", 10.0, 10.0).await;
        manager.join_cluster("m").await.unwrap();
        let cluster_id = registry.get_node("m").await.unwrap().unwrap().cluster_id.unwrap();

        registry.mark_offline("m").await.unwrap();
        assert!(manager.promote_master(&cluster_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retrieve_prefers_replica_falls_back_to_master() {
        let (registry, bus, manager) = manager();
        storage_node(&registry, "m", 10.0, 10.0).await;
        storage_node(&registry, "r1", 10.0, 80.0).await;
        manager.join_cluster("m").await.unwrap();
        manager.join_cluster("r1").await.unwrap();
        let cluster_id = registry.get_node("m").await.unwrap().unwrap().cluster_id.unwrap();
        let _m_rx = bus.attach(NodeRole::Storage, "m");
        let mut r1_rx = bus.attach(NodeRole::Storage, "r1");

        let source = manager
            .retrieve(&cluster_id, "s1", vec!["p1".into()], "cache_a")
            .await
            .unwrap();
        assert_eq!(source, "r1");
        match r1_rx.try_recv().unwrap() {
            CoordMessage::ParticlesRetrieve { target_id, .. } => assert_eq!(target_id, "cache_a"),
            other => panic!("unexpected message: {:?}", other),
        }

        registry.mark_offline("r1").await.unwrap();
        let source = manager
            .retrieve(&cluster_id, "s1", vec!["p1".into()], "cache_a")
            .await
            .unwrap();
        assert_eq!(source, "m");

        registry.mark_offline("m").await.unwrap();
        let error = manager
            .retrieve(&cluster_id, "s1", vec!["p1".into()], "cache_a")
            .await
            .unwrap_err();
        assert!(matches!(error, FluxError::ClusterUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_allocate_cluster_picks_roomiest_master() {
        let (registry, _bus, manager) = manager();
        for i in 0..CLUSTER_CAPACITY {
            let id = format!("a_{}", i);
            storage_node(&registry, &id, 10.0, 10.0).await;
            manager.join_cluster(&id).await.unwrap();
        }
        storage_node(&registry, "b_0", 10.0, 10.0).await;
        registry
            .update_resources(
                "b_0",
                Resources {
                    storage_mb: 50_000,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        manager.join_cluster("b_0").await.unwrap();

        let chosen = manager.allocate_cluster().await.unwrap();
        let b_cluster = registry.get_node("b_0").await.unwrap().unwrap().cluster_id.unwrap();
        assert_eq!(chosen, b_cluster);
    }
}
