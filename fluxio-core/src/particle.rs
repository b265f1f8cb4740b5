use crate::node::{ClusterId, NodeId};
use crate::stream::StreamId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type ParticleId = String;

/// Compute the SHA256 digest of a particle payload.
pub fn compute_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Per-particle routing progress. Transitions only move forward; re-delivery
/// of a transition already taken is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingStatus {
    Created,
    Assigned,
    Cached,
    Forwarded,
    Routed,
    Stored,
    Served,
}

impl RoutingStatus {
    fn rank(&self) -> u8 {
        match self {
            RoutingStatus::Created => 0,
            RoutingStatus::Assigned => 1,
            RoutingStatus::Cached => 2,
            RoutingStatus::Forwarded => 3,
            RoutingStatus::Routed => 4,
            RoutingStatus::Stored => 5,
            RoutingStatus::Served => 6,
        }
    }

    /// True when moving to `next` advances the pipeline.
    pub fn advances_to(&self, next: RoutingStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// Which nodes have handled a particle on its way through the mesh.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticleRouting {
    pub ingest_id: Option<NodeId>,
    pub cache_id: Option<NodeId>,
    pub coordinator_id: Option<NodeId>,
    pub storage_id: Option<NodeId>,
    pub cluster_id: Option<ClusterId>,
}

/// A fixed-size ordered chunk of a stream's raw payload.
#[derive(Debug, Clone)]
pub struct Particle {
    pub id: ParticleId,
    pub stream_id: StreamId,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub payload: Bytes,
    pub sha256: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub routing: ParticleRouting,
    pub routing_status: RoutingStatus,
}

impl Particle {
    pub fn new(stream_id: &str, chunk_index: u32, total_chunks: u32, payload: Bytes) -> Self {
        let sha256 = compute_digest(&payload);
        Self {
            id: format!(
                "{}_{}_{}",
                stream_id,
                chrono::Utc::now().timestamp_millis(),
                chunk_index
            ),
            stream_id: stream_id.to_string(),
            chunk_index,
            total_chunks,
            payload,
            sha256,
            created_at: chrono::Utc::now(),
            routing: ParticleRouting::default(),
            routing_status: RoutingStatus::Created,
        }
    }

    /// Advance the routing status; returns false on a duplicate or
    /// backwards delivery, which callers treat as a no-op.
    pub fn advance(&mut self, next: RoutingStatus) -> bool {
        if self.routing_status.advances_to(next) {
            self.routing_status = next;
            true
        } else {
            false
        }
    }
}
