use crate::error::{FluxError, Result};
use crate::node::{NodeRecord, NodeRole, ResourceFloor};
use crate::registry::{NodeFilter, NodeRegistry, SortKey};
use std::sync::Arc;

/// Ranking field for node selection. Call sites rank by the resource that
/// dominates their hop: ingest by cpu, cache relays by network, storage by
/// free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankBy {
    Cpu,
    Memory,
    Storage,
    Network,
}

impl RankBy {
    fn sort_key(self) -> SortKey {
        match self {
            RankBy::Cpu => SortKey::CpuDesc,
            RankBy::Memory => SortKey::MemoryDesc,
            RankBy::Storage => SortKey::StorageDesc,
            RankBy::Network => SortKey::NetworkDesc,
        }
    }
}

/// Resource-aware node selection over the registry.
pub struct ResourceSelector {
    registry: Arc<dyn NodeRegistry>,
}

impl ResourceSelector {
    pub fn new(registry: Arc<dyn NodeRegistry>) -> Self {
        Self { registry }
    }

    /// Best-ranked live node of `role` meeting every floor field; ties are
    /// broken by the most recent heartbeat (already folded into the sort).
    /// `NoCandidateNode` is retryable and must not be treated as fatal.
    pub async fn select_best_node(
        &self,
        role: NodeRole,
        floor: ResourceFloor,
        rank_by: RankBy,
    ) -> Result<NodeRecord> {
        let filter = NodeFilter {
            floor: Some(floor),
            ..NodeFilter::online()
        };
        let candidates = self
            .registry
            .find_by_role(role, filter, rank_by.sort_key(), 1)
            .await?;

        candidates
            .into_iter()
            .next()
            .ok_or(FluxError::NoCandidateNode { role, min: floor })
    }
}
