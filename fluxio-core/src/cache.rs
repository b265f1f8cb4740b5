use crate::bus::{CoordMessage, SessionBus};
use crate::error::{FluxError, Result};
use crate::node::{NodeId, NodeRole, ResourceFloor};
use crate::particle::{Particle, ParticleId};
use crate::recovery::PendingTransmissionStore;
use crate::registry::rest::TaskCreate;
use crate::registry::{NodeFilter, NodeRegistry, RestMirror, SortKey};
use crate::stream::StreamId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A per-stream accumulation is forwarded once it holds this many bytes.
pub const FLUSH_THRESHOLD_BYTES: u64 = 32 * 1024 * 1024;

/// Estimated bookkeeping overhead per cached particle.
pub const PER_PARTICLE_OVERHEAD_BYTES: u64 = 200;

/// A non-empty accumulation older than this is force-flushed by the sweep.
pub const CACHE_STALENESS: chrono::Duration = chrono::Duration::minutes(5);

/// Crossing this fraction of the node's memory limit asks the orchestrator
/// for an additional cache node on the same ingest.
pub const CAPACITY_WARN_RATIO: f64 = 0.8;

/// Failed forwards are retried this many times before the batch is written
/// to the pending-transmission store.
pub const MAX_FLUSH_ATTEMPTS: u32 = 3;

#[derive(Debug)]
struct Accumulation {
    particle_ids: Vec<ParticleId>,
    bytes: u64,
    first_accepted_at: chrono::DateTime<chrono::Utc>,
    flush_attempts: u32,
}

impl Accumulation {
    fn new() -> Self {
        Self {
            particle_ids: Vec::new(),
            bytes: 0,
            first_accepted_at: chrono::Utc::now(),
            flush_attempts: 0,
        }
    }
}

/// A batch forwarded from a cache relay to its ingest node.
#[derive(Debug, Clone)]
pub struct FlushBatch {
    pub node_id: NodeId,
    pub stream_id: StreamId,
    pub target_ingest_id: NodeId,
    pub particle_ids: Vec<ParticleId>,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct AcceptOutcome {
    pub cached_bytes: u64,
    /// Set when this acceptance crossed the threshold and the flush
    /// reached its target.
    pub flushed: Option<FlushBatch>,
    /// Set when estimated memory usage crossed 80% of the node's limit
    /// and a spawn request went out.
    pub capacity_warning: bool,
}

/// Per cache-node accumulation buffers with threshold flushing.
///
/// Accumulations are keyed by (node, stream): a relay serving several
/// streams at once buffers and flushes each stream on its own, so a flush
/// batch always carries one stream's particles under that stream's id.
pub struct CacheManager {
    registry: Arc<dyn NodeRegistry>,
    bus: Arc<SessionBus>,
    pending: Arc<PendingTransmissionStore>,
    mirror: Option<RestMirror>,
    flush_threshold: u64,
    state: Mutex<HashMap<NodeId, HashMap<StreamId, Accumulation>>>,
}

impl CacheManager {
    pub fn new(
        registry: Arc<dyn NodeRegistry>,
        bus: Arc<SessionBus>,
        pending: Arc<PendingTransmissionStore>,
    ) -> Self {
        Self::with_threshold(registry, bus, pending, FLUSH_THRESHOLD_BYTES)
    }

    pub fn with_threshold(
        registry: Arc<dyn NodeRegistry>,
        bus: Arc<SessionBus>,
        pending: Arc<PendingTransmissionStore>,
        flush_threshold: u64,
    ) -> Self {
        Self {
            registry,
            bus,
            pending,
            mirror: None,
            flush_threshold,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Also post each pending-transmission record as a recovery task on the
    /// collaborator surface.
    pub fn with_mirror(mut self, mirror: RestMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Append particles to a cache node's accumulation for their stream.
    /// A stream accumulation crossing the byte threshold is flushed before
    /// any further acceptance; the node's total estimated memory crossing
    /// 80% of its limit emits a spawn request for the same ingest.
    pub async fn accept(
        &self,
        cache_id: &str,
        stream_id: &str,
        particles: &[Particle],
    ) -> Result<AcceptOutcome> {
        let node = self
            .registry
            .get_node(cache_id)
            .await?
            .ok_or_else(|| FluxError::NodeNotFound(cache_id.to_string()))?;
        if node.role != NodeRole::Cache {
            return Err(FluxError::Internal(format!(
                "node {} is {}, not a cache relay",
                cache_id, node.role
            )));
        }

        let (stream_bytes, node_bytes, node_count) = {
            let mut state = self.state.lock().await;
            let streams = state.entry(cache_id.to_string()).or_default();
            let acc = streams
                .entry(stream_id.to_string())
                .or_insert_with(Accumulation::new);
            for particle in particles {
                acc.particle_ids.push(particle.id.clone());
                acc.bytes += particle.payload.len() as u64;
            }
            let stream_bytes = acc.bytes;
            let node_bytes: u64 = streams.values().map(|acc| acc.bytes).sum();
            let node_count: usize = streams.values().map(|acc| acc.particle_ids.len()).sum();
            (stream_bytes, node_bytes, node_count)
        };

        self.mirror_cache_state(cache_id).await?;

        let mut capacity_warning = false;
        let limit = node.connection_class.memory_limit_bytes();
        let estimate = node_bytes + PER_PARTICLE_OVERHEAD_BYTES * node_count as u64;
        if (estimate as f64) >= (limit as f64) * CAPACITY_WARN_RATIO {
            capacity_warning = true;
            self.request_spawn(&node.assigned_ingest_id).await;
        }

        let mut flushed = None;
        if stream_bytes >= self.flush_threshold {
            flushed = self.flush_stream(cache_id, stream_id).await?;
        }

        Ok(AcceptOutcome {
            cached_bytes: node_bytes,
            flushed,
            capacity_warning,
        })
    }

    /// Forward one stream's accumulation to the node's assigned ingest and
    /// clear it. An empty accumulation is a no-op. A failed forward keeps
    /// the buffer for retry; after `MAX_FLUSH_ATTEMPTS` the batch goes to
    /// the pending-transmission store instead of being dropped.
    pub async fn flush_stream(
        &self,
        cache_id: &str,
        stream_id: &str,
    ) -> Result<Option<FlushBatch>> {
        let taken = {
            let mut state = self.state.lock().await;
            let Some(streams) = state.get_mut(cache_id) else {
                return Ok(None);
            };
            match streams.remove(stream_id) {
                Some(acc) if !acc.particle_ids.is_empty() => acc,
                _ => return Ok(None),
            }
        };

        let target = match self.resolve_ingest(cache_id).await? {
            Some(target) => target,
            None => {
                // The original records an emergency registry entry here.
                self.record_pending(
                    stream_id,
                    cache_id,
                    &taken.particle_ids,
                    taken.bytes,
                    "no ingest node available",
                )
                .await?;
                self.mirror_cache_state(cache_id).await?;
                return Ok(None);
            }
        };

        let message = CoordMessage::ParticlesProcess {
            stream_id: stream_id.to_string(),
            particle_ids: taken.particle_ids.clone(),
        };
        match self.bus.send_to(NodeRole::Ingest, &target, message) {
            Ok(()) => {
                self.mirror_cache_state(cache_id).await?;
                tracing::info!(
                    cache_id,
                    stream_id,
                    ingest_id = %target,
                    bytes = taken.bytes,
                    particles = taken.particle_ids.len(),
                    "flushed cache accumulation"
                );
                Ok(Some(FlushBatch {
                    node_id: cache_id.to_string(),
                    stream_id: stream_id.to_string(),
                    target_ingest_id: target,
                    particle_ids: taken.particle_ids,
                    bytes: taken.bytes,
                }))
            }
            Err(error) => {
                let attempts = taken.flush_attempts + 1;
                if attempts >= MAX_FLUSH_ATTEMPTS {
                    self.record_pending(
                        stream_id,
                        cache_id,
                        &taken.particle_ids,
                        taken.bytes,
                        "flush retry budget exhausted",
                    )
                    .await?;
                    self.mirror_cache_state(cache_id).await?;
                    return Ok(None);
                }

                // Retain the buffer; a later flush or sweep retries it.
                let mut state = self.state.lock().await;
                let streams = state.entry(cache_id.to_string()).or_default();
                let acc = streams
                    .entry(stream_id.to_string())
                    .or_insert_with(Accumulation::new);
                let mut ids = taken.particle_ids;
                ids.append(&mut acc.particle_ids);
                acc.particle_ids = ids;
                acc.bytes += taken.bytes;
                acc.flush_attempts = attempts;
                acc.first_accepted_at = acc.first_accepted_at.min(taken.first_accepted_at);
                tracing::warn!(cache_id, stream_id, attempts, %error, "flush failed; buffer retained");
                Err(error)
            }
        }
    }

    /// Flush every stream buffered on a node, one batch per stream. Stops
    /// at the first retained failure, returning the batches that made it
    /// out; the rest stay buffered for retry.
    pub async fn flush(&self, cache_id: &str) -> Result<Vec<FlushBatch>> {
        let mut batches = Vec::new();
        for stream_id in self.buffered_streams(cache_id).await {
            match self.flush_stream(cache_id, &stream_id).await {
                Ok(Some(batch)) => batches.push(batch),
                Ok(None) => {}
                Err(error) if batches.is_empty() => return Err(error),
                Err(error) => {
                    tracing::warn!(cache_id, stream_id = %stream_id, %error, "partial flush; remainder retained");
                    break;
                }
            }
        }
        Ok(batches)
    }

    /// Best-effort drain of one stream's buffer, used when the stream
    /// stops: a failed forward records the batch rather than retaining it.
    pub async fn drain_stream(
        &self,
        cache_id: &str,
        stream_id: &str,
    ) -> Result<Option<FlushBatch>> {
        match self.flush_stream(cache_id, stream_id).await {
            Ok(batch) => Ok(batch),
            Err(FluxError::TransmissionFailure { .. }) => {
                self.record_remaining(cache_id, Some(stream_id)).await?;
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    /// Best-effort drain on disconnect: flush whatever the node buffered,
    /// and record any stream that could not be forwarded since the buffer
    /// owner is gone.
    pub async fn drain(&self, cache_id: &str) -> Result<Vec<FlushBatch>> {
        let mut batches = Vec::new();
        for stream_id in self.buffered_streams(cache_id).await {
            match self.flush_stream(cache_id, &stream_id).await {
                Ok(Some(batch)) => batches.push(batch),
                Ok(None) => {}
                Err(FluxError::TransmissionFailure { .. }) => {
                    self.record_remaining(cache_id, Some(stream_id.as_str())).await?;
                }
                Err(other) => return Err(other),
            }
        }
        Ok(batches)
    }

    /// Force-flush accumulations that have been non-empty for longer than
    /// the staleness window. Duplicate sweeps are no-ops because a flush
    /// clears the accumulation.
    pub async fn sweep_stale(&self) -> Result<Vec<FlushBatch>> {
        let cutoff = chrono::Utc::now() - CACHE_STALENESS;
        let stale: Vec<(NodeId, StreamId)> = {
            let state = self.state.lock().await;
            state
                .iter()
                .flat_map(|(cache_id, streams)| {
                    streams
                        .iter()
                        .filter(|(_, acc)| {
                            !acc.particle_ids.is_empty() && acc.first_accepted_at < cutoff
                        })
                        .map(|(stream_id, _)| (cache_id.clone(), stream_id.clone()))
                })
                .collect()
        };

        let mut batches = Vec::new();
        for (cache_id, stream_id) in stale {
            tracing::info!(
                cache_id = %cache_id,
                stream_id = %stream_id,
                "force-flushing stale cache accumulation"
            );
            match self.flush_stream(&cache_id, &stream_id).await {
                Ok(Some(batch)) => batches.push(batch),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(cache_id = %cache_id, %error, "stale flush failed; will retry")
                }
            }
        }
        Ok(batches)
    }

    /// Total bytes buffered on a node, across all streams.
    pub async fn cached_bytes(&self, cache_id: &str) -> u64 {
        let state = self.state.lock().await;
        state
            .get(cache_id)
            .map_or(0, |streams| streams.values().map(|acc| acc.bytes).sum())
    }

    /// Backdate the first-accepted timestamps of a node's accumulations.
    /// Test hook for the staleness sweep.
    #[doc(hidden)]
    pub async fn backdate_accumulation(&self, cache_id: &str, age: chrono::Duration) {
        let mut state = self.state.lock().await;
        if let Some(streams) = state.get_mut(cache_id) {
            for acc in streams.values_mut() {
                acc.first_accepted_at = chrono::Utc::now() - age;
            }
        }
    }

    async fn buffered_streams(&self, cache_id: &str) -> Vec<StreamId> {
        let state = self.state.lock().await;
        state
            .get(cache_id)
            .map(|streams| streams.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Write a batch that will not be forwarded to the pending store, and
    /// post it as a recovery task when a mirror is configured.
    async fn record_pending(
        &self,
        stream_id: &str,
        cache_id: &str,
        particle_ids: &[ParticleId],
        bytes: u64,
        reason: &str,
    ) -> Result<i64> {
        let pk = self
            .pending
            .record(stream_id, cache_id, particle_ids, bytes, reason)?;
        tracing::warn!(
            cache_id,
            stream_id,
            record = pk,
            particles = particle_ids.len(),
            reason,
            "batch recorded for recovery"
        );

        if let Some(mirror) = &self.mirror {
            let task = TaskCreate {
                kind: "pendingTransmission",
                stream_id,
                node_id: cache_id,
                detail: serde_json::json!({
                    "record": pk,
                    "bytes": bytes,
                    "particles": particle_ids.len(),
                    "reason": reason,
                }),
            };
            match mirror.create_task(task).await {
                Ok(created) => {
                    if let Err(error) = self.pending.set_task_id(pk, &created.id) {
                        tracing::warn!(record = pk, %error, "recovery task id not saved");
                    }
                }
                Err(error) => {
                    tracing::warn!(record = pk, %error, "recovery task not mirrored");
                }
            }
        }
        Ok(pk)
    }

    async fn record_remaining(&self, cache_id: &str, stream_id: Option<&str>) -> Result<()> {
        let remaining: Vec<(StreamId, Accumulation)> = {
            let mut state = self.state.lock().await;
            let Some(streams) = state.get_mut(cache_id) else {
                return Ok(());
            };
            match stream_id {
                Some(stream_id) => streams
                    .remove(stream_id)
                    .map(|acc| vec![(stream_id.to_string(), acc)])
                    .unwrap_or_default(),
                None => streams.drain().collect(),
            }
        };
        for (stream_id, acc) in remaining {
            if acc.particle_ids.is_empty() {
                continue;
            }
            self.record_pending(
                &stream_id,
                cache_id,
                &acc.particle_ids,
                acc.bytes,
                "disconnected before transmission",
            )
            .await?;
        }
        self.mirror_cache_state(cache_id).await
    }

    async fn resolve_ingest(&self, cache_id: &str) -> Result<Option<NodeId>> {
        if let Some(node) = self.registry.get_node(cache_id).await? {
            if let Some(assigned) = node.assigned_ingest_id {
                return Ok(Some(assigned));
            }
        }
        // No assignment; fall back to any live ingest node.
        let candidates = self
            .registry
            .find_by_role(
                NodeRole::Ingest,
                NodeFilter::online(),
                SortKey::HeartbeatDesc,
                1,
            )
            .await?;
        Ok(candidates.into_iter().next().map(|node| node.id))
    }

    async fn mirror_cache_state(&self, cache_id: &str) -> Result<()> {
        let (ids, bytes) = {
            let state = self.state.lock().await;
            state
                .get(cache_id)
                .map(|streams| {
                    let mut ids = Vec::new();
                    let mut bytes = 0u64;
                    for acc in streams.values() {
                        ids.extend(acc.particle_ids.iter().cloned());
                        bytes += acc.bytes;
                    }
                    (ids, bytes)
                })
                .unwrap_or_default()
        };
        self.registry.set_cache_state(cache_id, ids, bytes).await
    }

    async fn request_spawn(&self, ingest_id: &Option<NodeId>) {
        let message = CoordMessage::SpawnRequest {
            min_resources: ResourceFloor {
                min_cpu_pct: 10.0,
                min_memory_mb: 32,
                ..Default::default()
            },
        };
        match ingest_id {
            Some(ingest_id) => {
                if let Err(error) = self.bus.send_to(NodeRole::Ingest, ingest_id, message) {
                    tracing::warn!(ingest_id = %ingest_id, %error, "spawn request not delivered");
                }
            }
            None => {
                self.bus.broadcast(NodeRole::Ingest, message);
            }
        }
    }
}
