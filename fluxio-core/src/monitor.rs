use crate::cluster::StorageClusterManager;
use crate::error::Result;
use crate::node::{ClusterId, NodeId, NodeRecord, NodeRole, NodeStatus};
use crate::registry::{NodeFilter, NodeRegistry, SortKey};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;

/// A node whose heartbeat is older than this is considered gone.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the sweep runs.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

const ALL_ROLES: [NodeRole; 4] = [
    NodeRole::Ingest,
    NodeRole::Cache,
    NodeRole::Storage,
    NodeRole::Coordinator,
];

#[derive(Debug, Default)]
pub struct SweepReport {
    pub offlined: Vec<NodeId>,
    /// Clusters whose master went offline and the replica promoted in its
    /// place, when one was available.
    pub promoted: Vec<(ClusterId, Option<NodeId>)>,
}

/// Periodic liveness sweep. Marks stale nodes offline via compare-and-set
/// so overlapping sweeps cannot double-apply, then repairs any storage
/// cluster that lost its master.
pub struct HealthMonitor {
    registry: Arc<dyn NodeRegistry>,
    clusters: Arc<StorageClusterManager>,
    timeout: chrono::Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<dyn NodeRegistry>, clusters: Arc<StorageClusterManager>) -> Self {
        Self::with_timeout(
            registry,
            clusters,
            chrono::Duration::from_std(HEARTBEAT_TIMEOUT).unwrap_or(chrono::Duration::seconds(30)),
        )
    }

    pub fn with_timeout(
        registry: Arc<dyn NodeRegistry>,
        clusters: Arc<StorageClusterManager>,
        timeout: chrono::Duration,
    ) -> Self {
        Self {
            registry,
            clusters,
            timeout,
        }
    }

    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.sweep().await {
                Ok(report) if !report.offlined.is_empty() => {
                    tracing::info!(
                        offlined = report.offlined.len(),
                        promotions = report.promoted.len(),
                        "health sweep marked nodes offline"
                    );
                }
                Ok(_) => {}
                Err(error) => tracing::warn!(%error, "health sweep failed"),
            }
        }
    }

    /// One pass over every registered node. Returns what changed.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let cutoff = chrono::Utc::now() - self.timeout;
        let mut stale = Vec::new();
        for role in ALL_ROLES {
            let nodes = self
                .registry
                .find_by_role(role, NodeFilter::default(), SortKey::HeartbeatDesc, usize::MAX)
                .await?;
            stale.extend(nodes.into_iter().filter(|node| {
                node.status != NodeStatus::Offline && node.last_heartbeat_at < cutoff
            }));
        }

        let flips = join_all(stale.iter().map(|node| {
            self.registry
                .set_status_if(&node.id, node.status, NodeStatus::Offline)
        }))
        .await;

        let mut report = SweepReport::default();
        let mut lost_masters: Vec<NodeRecord> = Vec::new();
        for (node, flipped) in stale.into_iter().zip(flips) {
            // A failed compare-and-set means another sweep got there first.
            if !flipped? {
                continue;
            }
            tracing::warn!(node_id = %node.id, role = %node.role, "node heartbeat timed out");
            report.offlined.push(node.id.clone());
            if node.role == NodeRole::Storage && node.is_master {
                lost_masters.push(node);
            }
        }

        for master in lost_masters {
            let Some(cluster_id) = master.cluster_id else {
                continue;
            };
            // The dead master keeps its flag; promotion only considers
            // online members, so a stale flag on an offline node is inert.
            let promoted = self.clusters.promote_master(&cluster_id).await?;
            report.promoted.push((cluster_id, promoted));
        }
        Ok(report)
    }
}
