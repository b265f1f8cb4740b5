use crate::bus::{CoordMessage, NodeMessage, SessionBus};
use crate::cache::{AcceptOutcome, CacheManager, FlushBatch};
use crate::cluster::StorageClusterManager;
use crate::error::{FluxError, Result};
use crate::node::{NodeId, NodeRole, ResourceFloor};
use crate::particle::{Particle, ParticleId, RoutingStatus};
use crate::registry::NodeRegistry;
use crate::selector::{RankBy, ResourceSelector};
use crate::stream::{Stream, StreamId, StreamStatus};
use crate::transport::ParticleTransport;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Ingest selection is retried this many times before the stream errors.
pub const SELECT_RETRIES: u32 = 3;

/// Minimum resources for the node that pulls from the media source.
pub const INGEST_FLOOR: ResourceFloor = ResourceFloor {
    min_cpu_pct: 20.0,
    min_memory_mb: 100,
    min_storage_mb: 0,
    min_network_mbps: 0.0,
};

/// Minimum resources for a cache relay.
pub const CACHE_RELAY_FLOOR: ResourceFloor = ResourceFloor {
    min_cpu_pct: 0.0,
    min_memory_mb: 0,
    min_storage_mb: 0,
    min_network_mbps: 5.0,
};

/// Callbacks fired on stream lifecycle edges. The server uses these to
/// push notifications out to connected sessions.
#[async_trait]
pub trait StreamLifecycleHooks: Send + Sync {
    async fn on_created(&self, _stream: &Stream) {}
    async fn on_started(&self, _stream: &Stream) {}
    async fn on_stopped(&self, _stream: &Stream) {}
    async fn on_error(&self, _stream: &Stream, _message: &str) {}
}

pub struct NoopHooks;

#[async_trait]
impl StreamLifecycleHooks for NoopHooks {}

/// What a caller registers to open a stream.
#[derive(Debug, Clone)]
pub struct StreamSource {
    pub source_id: String,
    pub source_uri: String,
    pub resolution: String,
    pub fps: u32,
}

#[derive(Debug, Default)]
struct StreamAssignment {
    ingest_id: Option<NodeId>,
    cache_id: Option<NodeId>,
    cluster_id: Option<String>,
    particles: HashMap<ParticleId, RoutingStatus>,
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub particle_ids: Vec<ParticleId>,
    pub cached_bytes: u64,
    pub flushed: bool,
    pub capacity_warning: bool,
}

#[derive(Debug, Clone)]
pub struct ServeReport {
    pub source_storage_id: NodeId,
    pub relay_cache_id: NodeId,
    pub particle_ids: Vec<ParticleId>,
}

/// Drives streams through their lifecycle and routes each particle batch
/// along the ingest -> cache -> storage pipeline. All transitions are
/// idempotent: re-delivery of a message that was already applied is a
/// no-op, never an error.
pub struct StreamOrchestrator {
    registry: Arc<dyn NodeRegistry>,
    selector: ResourceSelector,
    transport: Arc<ParticleTransport>,
    clusters: Arc<StorageClusterManager>,
    cache: Arc<CacheManager>,
    bus: Arc<SessionBus>,
    hooks: Arc<dyn StreamLifecycleHooks>,
    streams: Mutex<HashMap<StreamId, Stream>>,
    assignments: Mutex<HashMap<StreamId, StreamAssignment>>,
}

impl StreamOrchestrator {
    pub fn new(
        registry: Arc<dyn NodeRegistry>,
        transport: Arc<ParticleTransport>,
        clusters: Arc<StorageClusterManager>,
        cache: Arc<CacheManager>,
        bus: Arc<SessionBus>,
    ) -> Self {
        Self::with_hooks(registry, transport, clusters, cache, bus, Arc::new(NoopHooks))
    }

    pub fn with_hooks(
        registry: Arc<dyn NodeRegistry>,
        transport: Arc<ParticleTransport>,
        clusters: Arc<StorageClusterManager>,
        cache: Arc<CacheManager>,
        bus: Arc<SessionBus>,
        hooks: Arc<dyn StreamLifecycleHooks>,
    ) -> Self {
        Self {
            selector: ResourceSelector::new(registry.clone()),
            registry,
            transport,
            clusters,
            cache,
            bus,
            hooks,
            streams: Mutex::new(HashMap::new()),
            assignments: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new stream in `Initialized`. No nodes are involved yet.
    pub async fn initialize(&self, source: StreamSource) -> Result<Stream> {
        let stream = Stream::new(
            source.source_id,
            source.source_uri,
            source.resolution,
            source.fps,
        );
        {
            let mut streams = self.streams.lock().await;
            streams.insert(stream.id.clone(), stream.clone());
        }
        tracing::info!(stream_id = %stream.id, source_id = %stream.source_id, "stream initialized");
        self.hooks.on_created(&stream).await;
        Ok(stream)
    }

    /// Move to `Starting` and pin an ingest node. Selection failures are
    /// retried; exhausting the retry budget fails the stream.
    pub async fn start(&self, stream_id: &str) -> Result<Stream> {
        let stream = self.transition(stream_id, StreamStatus::Starting).await?;

        let mut last_error = None;
        for attempt in 1..=SELECT_RETRIES {
            match self
                .selector
                .select_best_node(NodeRole::Ingest, INGEST_FLOOR, RankBy::Cpu)
                .await
            {
                Ok(node) => {
                    let mut assignments = self.assignments.lock().await;
                    let assignment = assignments.entry(stream_id.to_string()).or_default();
                    assignment.ingest_id = Some(node.id.clone());
                    tracing::info!(stream_id, ingest_id = %node.id, "ingest node pinned");
                    return Ok(stream);
                }
                Err(error) if error.is_retryable() => {
                    tracing::warn!(stream_id, attempt, %error, "ingest selection failed");
                    last_error = Some(error);
                }
                Err(error) => return Err(error),
            }
        }

        let failed = self.transition(stream_id, StreamStatus::Error).await?;
        self.hooks.on_error(&failed, "no ingest capacity").await;
        self.bus.broadcast(
            NodeRole::Coordinator,
            CoordMessage::StreamError {
                stream_id: stream_id.to_string(),
                message: "no ingest capacity".to_string(),
            },
        );
        Err(last_error
            .unwrap_or_else(|| FluxError::Internal("ingest selection exhausted".to_string())))
    }

    /// Split a raw payload into particles and push them into a cache
    /// relay. The first accepted batch flips `Starting` to `Active`; a
    /// threshold crossing inside the cache routes the flushed batch on to
    /// a storage cluster.
    pub async fn ingest_payload(&self, stream_id: &str, payload: bytes::Bytes) -> Result<IngestReport> {
        let status = self.status(stream_id).await?.status;
        if !matches!(status, StreamStatus::Starting | StreamStatus::Active) {
            return Err(FluxError::InvalidTransition {
                stream_id: stream_id.to_string(),
                from: status,
                to: StreamStatus::Active,
            });
        }

        let particles = self.transport.split(stream_id, payload);
        let particle_ids: Vec<ParticleId> =
            particles.iter().map(|particle| particle.id.clone()).collect();
        self.advance_particles(stream_id, &particle_ids, RoutingStatus::Assigned)
            .await;

        let outcome = self.dispatch_to_cache(stream_id, &particles).await?;

        if status == StreamStatus::Starting {
            let stream = self.transition(stream_id, StreamStatus::Active).await?;
            self.hooks.on_started(&stream).await;
        }

        let mut flushed = false;
        if let Some(batch) = &outcome.flushed {
            self.route_flush(batch).await?;
            flushed = true;
        }

        Ok(IngestReport {
            particle_ids,
            cached_bytes: outcome.cached_bytes,
            flushed,
            capacity_warning: outcome.capacity_warning,
        })
    }

    /// Stop a stream: drain its cache relay to storage, then tear down
    /// routing state. Stopping an already-terminal stream is a no-op.
    pub async fn stop(&self, stream_id: &str) -> Result<Stream> {
        {
            let streams = self.streams.lock().await;
            let stream = streams
                .get(stream_id)
                .ok_or_else(|| FluxError::StreamNotFound(stream_id.to_string()))?;
            if stream.status.is_terminal() {
                return Ok(stream.clone());
            }
        }

        let cache_id = {
            let assignments = self.assignments.lock().await;
            assignments
                .get(stream_id)
                .and_then(|assignment| assignment.cache_id.clone())
        };
        if let Some(cache_id) = cache_id {
            match self.cache.drain_stream(&cache_id, stream_id).await {
                Ok(Some(batch)) => {
                    if let Err(error) = self.route_flush(&batch).await {
                        tracing::warn!(stream_id, %error, "stop-time drain could not reach storage");
                    }
                }
                Ok(None) => {}
                Err(error) => tracing::warn!(stream_id, %error, "stop-time drain failed"),
            }
        }

        let stream = self.transition(stream_id, StreamStatus::Stopped).await?;
        self.assignments.lock().await.remove(stream_id);
        self.transport.drop_stream(stream_id);
        self.clusters.forget_stream(stream_id).await;
        tracing::info!(stream_id, "stream stopped");
        self.hooks.on_stopped(&stream).await;
        Ok(stream)
    }

    pub async fn pause(&self, stream_id: &str) -> Result<Stream> {
        self.transition(stream_id, StreamStatus::Paused).await
    }

    pub async fn resume(&self, stream_id: &str) -> Result<Stream> {
        self.transition(stream_id, StreamStatus::Active).await
    }

    /// Route a stream's stored particles toward a viewer: pick the best
    /// cluster member for the read, relay through the best-connected cache
    /// node. Serving before anything reached storage is an incomplete
    /// stream, which callers retry.
    pub async fn serve(&self, stream_id: &str) -> Result<ServeReport> {
        let status = self.status(stream_id).await?.status;
        if status.is_terminal() {
            return Err(FluxError::InvalidTransition {
                stream_id: stream_id.to_string(),
                from: status,
                to: StreamStatus::Active,
            });
        }

        let Some((cluster_id, particle_ids)) = self.clusters.stored_location(stream_id).await
        else {
            return Err(FluxError::IncompleteStream {
                stream_id: stream_id.to_string(),
                missing: Vec::new(),
            });
        };

        let relay = self
            .selector
            .select_best_node(NodeRole::Cache, CACHE_RELAY_FLOOR, RankBy::Network)
            .await?;
        let source = self
            .clusters
            .retrieve(&cluster_id, stream_id, particle_ids.clone(), &relay.id)
            .await?;
        self.bus.send_to(
            NodeRole::Cache,
            &relay.id,
            CoordMessage::ParticlesServed {
                stream_id: stream_id.to_string(),
                particle_ids: particle_ids.clone(),
            },
        )?;
        self.advance_particles(stream_id, &particle_ids, RoutingStatus::Served)
            .await;

        tracing::info!(
            stream_id,
            source_id = %source,
            relay_id = %relay.id,
            particles = particle_ids.len(),
            "serving stored particles"
        );
        Ok(ServeReport {
            source_storage_id: source,
            relay_cache_id: relay.id,
            particle_ids,
        })
    }

    /// Force-flush stale cache accumulations and route the flushed batches
    /// into storage. Called from the server's periodic sweep.
    pub async fn sweep_caches(&self) -> Result<usize> {
        let batches = self.cache.sweep_stale().await?;
        let flushed = batches.len();
        for batch in &batches {
            if let Err(error) = self.route_flush(batch).await {
                tracing::warn!(node_id = %batch.node_id, %error, "swept batch could not reach storage");
            }
        }
        Ok(flushed)
    }

    pub async fn status(&self, stream_id: &str) -> Result<Stream> {
        let streams = self.streams.lock().await;
        streams
            .get(stream_id)
            .cloned()
            .ok_or_else(|| FluxError::StreamNotFound(stream_id.to_string()))
    }

    pub async fn list_streams(&self) -> Vec<Stream> {
        let streams = self.streams.lock().await;
        let mut all: Vec<Stream> = streams.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub async fn particle_status(
        &self,
        stream_id: &str,
        particle_id: &str,
    ) -> Option<RoutingStatus> {
        let assignments = self.assignments.lock().await;
        assignments
            .get(stream_id)
            .and_then(|assignment| assignment.particles.get(particle_id))
            .copied()
    }

    /// Apply one inbound session message. Used by the server's session
    /// endpoints; every arm is safe to re-deliver.
    pub async fn handle_node_message(&self, message: NodeMessage) -> Result<()> {
        match message {
            NodeMessage::Register {
                node_id,
                role,
                resources,
            } => {
                self.registry.upsert_node(&node_id, role, resources).await?;
                if role == NodeRole::Storage {
                    self.clusters.join_cluster(&node_id).await?;
                }
            }
            NodeMessage::Heartbeat { node_id } => {
                self.registry.touch_heartbeat(&node_id).await?;
            }
            NodeMessage::ResourcesUpdate { node_id, resources } => {
                self.registry.update_resources(&node_id, resources).await?;
            }
            NodeMessage::ParticlesProcess {
                node_id,
                stream_id,
                particle_ids,
            } => {
                let particles = self.transport.pending_particles(&stream_id, &particle_ids);
                if particles.is_empty() {
                    tracing::debug!(node_id, stream_id, "no pending particles to process");
                    return Ok(());
                }
                let outcome = self.dispatch_to_cache(&stream_id, &particles).await?;
                if let Some(batch) = &outcome.flushed {
                    self.route_flush(batch).await?;
                }
            }
            NodeMessage::ParticlesProcessed {
                stream_id,
                particle_ids,
                ..
            } => {
                self.advance_particles(&stream_id, &particle_ids, RoutingStatus::Cached)
                    .await;
            }
            NodeMessage::ParticlesStore {
                node_id,
                stream_id,
                particle_ids,
            } => {
                self.route_batch_to_storage(&stream_id, &node_id, particle_ids)
                    .await?;
            }
            NodeMessage::ParticlesStored {
                stream_id,
                particle_ids,
                ..
            } => {
                self.advance_particles(&stream_id, &particle_ids, RoutingStatus::Stored)
                    .await;
                self.mark_batch_processed(&particle_ids);
            }
            NodeMessage::ParticlesRetrieve {
                node_id,
                stream_id,
                particle_ids,
            } => {
                let Some((cluster_id, _)) = self.clusters.stored_location(&stream_id).await else {
                    return Err(FluxError::IncompleteStream {
                        stream_id,
                        missing: Vec::new(),
                    });
                };
                self.clusters
                    .retrieve(&cluster_id, &stream_id, particle_ids, &node_id)
                    .await?;
            }
            NodeMessage::ReplicateData {
                node_id, stream_id, ..
            } => {
                tracing::debug!(node_id, stream_id, "replication acknowledged");
            }
            NodeMessage::JoinCluster { node_id } => {
                self.clusters.join_cluster(&node_id).await?;
            }
            NodeMessage::MasterCompleted { cluster_id, .. } => {
                self.clusters.rotate_master(&cluster_id).await?;
            }
            NodeMessage::FlushParticles { node_id, stream_id } => {
                let batches = match stream_id {
                    Some(stream_id) => self
                        .cache
                        .flush_stream(&node_id, &stream_id)
                        .await?
                        .into_iter()
                        .collect(),
                    None => self.cache.flush(&node_id).await?,
                };
                for batch in &batches {
                    self.route_flush(batch).await?;
                }
            }
        }
        Ok(())
    }

    /// Drain a disconnecting node's state: flush its accumulation if it
    /// was a cache relay, mark it offline, and repair its cluster if it
    /// was a storage master.
    pub async fn handle_disconnect(&self, node_id: &str) -> Result<()> {
        let Some(node) = self.registry.get_node(node_id).await? else {
            return Ok(());
        };
        self.bus.detach(node.role, node_id);

        if node.role == NodeRole::Cache {
            match self.cache.drain(node_id).await {
                Ok(batches) => {
                    for batch in &batches {
                        if let Err(error) = self.route_flush(batch).await {
                            tracing::warn!(node_id, %error, "disconnect drain could not reach storage");
                        }
                    }
                }
                Err(error) => tracing::warn!(node_id, %error, "disconnect drain failed"),
            }
        }

        self.registry.mark_offline(node_id).await?;
        if node.role == NodeRole::Storage && node.is_master {
            if let Some(cluster_id) = node.cluster_id {
                self.clusters.promote_master(&cluster_id).await?;
            }
        }
        tracing::info!(node_id, role = %node.role, "node disconnected");
        Ok(())
    }

    async fn dispatch_to_cache(
        &self,
        stream_id: &str,
        particles: &[Particle],
    ) -> Result<AcceptOutcome> {
        let ingest_id = {
            let assignments = self.assignments.lock().await;
            assignments
                .get(stream_id)
                .and_then(|assignment| assignment.ingest_id.clone())
                .ok_or_else(|| {
                    FluxError::Internal(format!("stream {} has no ingest assignment", stream_id))
                })?
        };
        let cache_id = self.resolve_cache(stream_id, &ingest_id).await?;
        let outcome = self.cache.accept(&cache_id, stream_id, particles).await?;

        let particle_ids: Vec<ParticleId> =
            particles.iter().map(|particle| particle.id.clone()).collect();
        self.advance_particles(stream_id, &particle_ids, RoutingStatus::Cached)
            .await;
        Ok(outcome)
    }

    /// Reuse the stream's pinned cache relay while it is online; otherwise
    /// select a new one and bind it to the stream's ingest node.
    async fn resolve_cache(&self, stream_id: &str, ingest_id: &str) -> Result<NodeId> {
        let pinned = {
            let assignments = self.assignments.lock().await;
            assignments
                .get(stream_id)
                .and_then(|assignment| assignment.cache_id.clone())
        };
        if let Some(cache_id) = pinned {
            if let Some(node) = self.registry.get_node(&cache_id).await? {
                if node.is_online() {
                    return Ok(cache_id);
                }
            }
            tracing::warn!(stream_id, cache_id, "pinned cache relay lost; reselecting");
        }

        let node = self
            .selector
            .select_best_node(NodeRole::Cache, CACHE_RELAY_FLOOR, RankBy::Network)
            .await?;
        self.registry
            .set_assigned_ingest(&node.id, Some(ingest_id))
            .await?;
        let mut assignments = self.assignments.lock().await;
        let assignment = assignments.entry(stream_id.to_string()).or_default();
        assignment.cache_id = Some(node.id.clone());
        Ok(node.id)
    }

    /// Take a flushed cache batch the rest of the way: through the ingest
    /// hop and into a storage cluster.
    async fn route_flush(&self, batch: &FlushBatch) -> Result<()> {
        self.advance_particles(&batch.stream_id, &batch.particle_ids, RoutingStatus::Forwarded)
            .await;
        self.route_batch_to_storage(
            &batch.stream_id,
            &batch.target_ingest_id,
            batch.particle_ids.clone(),
        )
        .await
    }

    async fn route_batch_to_storage(
        &self,
        stream_id: &str,
        source_id: &str,
        particle_ids: Vec<ParticleId>,
    ) -> Result<()> {
        let cluster_id = {
            let assignments = self.assignments.lock().await;
            assignments
                .get(stream_id)
                .and_then(|assignment| assignment.cluster_id.clone())
        };
        let cluster_id = match cluster_id {
            Some(cluster_id) => cluster_id,
            None => {
                let allocated = self.clusters.allocate_cluster().await?;
                let mut assignments = self.assignments.lock().await;
                let assignment = assignments.entry(stream_id.to_string()).or_default();
                assignment.cluster_id = Some(allocated.clone());
                allocated
            }
        };

        self.advance_particles(stream_id, &particle_ids, RoutingStatus::Routed)
            .await;
        self.clusters
            .store(&cluster_id, stream_id, particle_ids.clone(), source_id)
            .await?;
        self.advance_particles(stream_id, &particle_ids, RoutingStatus::Stored)
            .await;
        self.mark_batch_processed(&particle_ids);
        Ok(())
    }

    fn mark_batch_processed(&self, particle_ids: &[ParticleId]) {
        for particle_id in particle_ids {
            if let Err(error) = self.transport.mark_processed(particle_id) {
                tracing::debug!(particle_id, %error, "processed mark skipped");
            }
        }
    }

    async fn advance_particles(
        &self,
        stream_id: &str,
        particle_ids: &[ParticleId],
        next: RoutingStatus,
    ) {
        let mut assignments = self.assignments.lock().await;
        let assignment = assignments.entry(stream_id.to_string()).or_default();
        for particle_id in particle_ids {
            let status = assignment
                .particles
                .entry(particle_id.clone())
                .or_insert(RoutingStatus::Created);
            // Forward-only; duplicate deliveries fall through.
            if status.advances_to(next) {
                *status = next;
            }
        }
    }

    async fn transition(&self, stream_id: &str, next: StreamStatus) -> Result<Stream> {
        let mut streams = self.streams.lock().await;
        let stream = streams
            .get_mut(stream_id)
            .ok_or_else(|| FluxError::StreamNotFound(stream_id.to_string()))?;

        if stream.status == next {
            return Ok(stream.clone());
        }
        if !stream.status.can_transition_to(next) {
            return Err(FluxError::InvalidTransition {
                stream_id: stream_id.to_string(),
                from: stream.status,
                to: next,
            });
        }

        stream.status = next;
        match next {
            StreamStatus::Active if stream.started_at.is_none() => {
                stream.started_at = Some(chrono::Utc::now());
            }
            StreamStatus::Stopped => {
                stream.stopped_at = Some(chrono::Utc::now());
            }
            _ => {}
        }
        Ok(stream.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::CLUSTER_CAPACITY;
    use crate::node::Resources;
    use crate::recovery::PendingTransmissionStore;
    use crate::registry::MemoryRegistry;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::UnboundedReceiver;

    #[derive(Default)]
    struct CountingHooks {
        started: AtomicUsize,
        stopped: AtomicUsize,
        errored: AtomicUsize,
    }

    #[async_trait]
    impl StreamLifecycleHooks for CountingHooks {
        async fn on_started(&self, _stream: &Stream) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_stopped(&self, _stream: &Stream) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_error(&self, _stream: &Stream, _message: &str) {
            self.errored.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        registry: Arc<MemoryRegistry>,
        bus: Arc<SessionBus>,
        transport: Arc<ParticleTransport>,
        clusters: Arc<StorageClusterManager>,
        hooks: Arc<CountingHooks>,
        orchestrator: StreamOrchestrator,
        _temp: tempfile::TempDir,
    }

    impl Harness {
        /// Full mesh: one ingest, one cache relay, one storage pair, all
        /// attached to the bus. The cache flush threshold is lowered so
        /// tests do not need multi-megabyte payloads.
        async fn new(flush_threshold: u64) -> (Self, Vec<UnboundedReceiver<CoordMessage>>) {
            let temp = tempfile::tempdir().unwrap();
            let registry = Arc::new(MemoryRegistry::new());
            let bus = Arc::new(SessionBus::new());
            let pending = Arc::new(
                PendingTransmissionStore::new(temp.path().join("pending.db")).unwrap(),
            );
            let transport = Arc::new(ParticleTransport::new(16 * 1024));
            let clusters = Arc::new(StorageClusterManager::new(registry.clone(), bus.clone()));
            let cache = Arc::new(CacheManager::with_threshold(
                registry.clone(),
                bus.clone(),
                pending,
                flush_threshold,
            ));
            let hooks = Arc::new(CountingHooks::default());
            let orchestrator = StreamOrchestrator::with_hooks(
                registry.clone(),
                transport.clone(),
                clusters.clone(),
                cache,
                bus.clone(),
                hooks.clone(),
            );

            registry
                .upsert_node(
                    "ingest_a",
                    NodeRole::Ingest,
                    Resources {
                        cpu_pct: 40.0,
                        memory_mb: 512,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            registry
                .upsert_node(
                    "cache_a",
                    NodeRole::Cache,
                    Resources {
                        network_mbps: 10.0,
                        memory_mb: 256,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            for id in ["store_m", "store_r"] {
                registry
                    .upsert_node(
                        id,
                        NodeRole::Storage,
                        Resources {
                            cpu_pct: 30.0,
                            network_mbps: 20.0,
                            storage_mb: 10_000,
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
                clusters.join_cluster(id).await.unwrap();
            }

            let receivers = vec![
                bus.attach(NodeRole::Ingest, "ingest_a"),
                bus.attach(NodeRole::Cache, "cache_a"),
                bus.attach(NodeRole::Storage, "store_m"),
                bus.attach(NodeRole::Storage, "store_r"),
            ];

            (
                Self {
                    registry,
                    bus,
                    transport,
                    clusters,
                    hooks,
                    orchestrator,
                    _temp: temp,
                },
                receivers,
            )
        }
    }

    #[tokio::test]
    async fn test_start_pins_ingest_and_first_batch_activates() {
        let (harness, _rx) = Harness::new(32 * 1024 * 1024).await;
        let stream = harness
            .orchestrator
            .initialize(StreamSource {
                source_id: "cam_1".into(),
                source_uri: "rtsp://cam_1/main".into(),
                resolution: "1920x1080".into(),
                fps: 30,
            })
            .await
            .unwrap();
        assert_eq!(stream.status, StreamStatus::Initialized);

        let started = harness.orchestrator.start(&stream.id).await.unwrap();
        assert_eq!(started.status, StreamStatus::Starting);

        let report = harness
            .orchestrator
            .ingest_payload(&stream.id, Bytes::from(vec![1u8; 1024 * 1024]))
            .await
            .unwrap();
        assert_eq!(report.particle_ids.len(), 64);
        assert!(!report.flushed);

        let stream = harness.orchestrator.status(&stream.id).await.unwrap();
        assert_eq!(stream.status, StreamStatus::Active);
        assert!(stream.started_at.is_some());
        assert_eq!(harness.hooks.started.load(Ordering::SeqCst), 1);

        // Second batch does not re-fire the started hook.
        harness
            .orchestrator
            .ingest_payload(&stream.id, Bytes::from(vec![2u8; 16 * 1024]))
            .await
            .unwrap();
        assert_eq!(harness.hooks.started.load(Ordering::SeqCst), 1);

        let status = harness
            .orchestrator
            .particle_status(&stream.id, &report.particle_ids[0])
            .await;
        assert_eq!(status, Some(RoutingStatus::Cached));
    }

    #[tokio::test]
    async fn test_start_without_ingest_fails_stream() {
        let (harness, _rx) = Harness::new(32 * 1024 * 1024).await;
        harness.registry.mark_offline("ingest_a").await.unwrap();

        let stream = harness
            .orchestrator
            .initialize(StreamSource {
                source_id: "cam_1".into(),
                source_uri: "rtsp://cam_1/main".into(),
                resolution: "640x480".into(),
                fps: 15,
            })
            .await
            .unwrap();

        let error = harness.orchestrator.start(&stream.id).await.unwrap_err();
        assert!(matches!(error, FluxError::NoCandidateNode { .. }));
        let stream = harness.orchestrator.status(&stream.id).await.unwrap();
        assert_eq!(stream.status, StreamStatus::Error);
        assert_eq!(harness.hooks.errored.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_threshold_flush_reaches_storage() {
        // 32 KiB threshold: the second 16 KiB chunk triggers the flush.
        let (harness, _rx) = Harness::new(32 * 1024).await;
        let stream = harness
            .orchestrator
            .initialize(StreamSource {
                source_id: "cam_1".into(),
                source_uri: "rtsp://cam_1/main".into(),
                resolution: "1920x1080".into(),
                fps: 30,
            })
            .await
            .unwrap();
        harness.orchestrator.start(&stream.id).await.unwrap();

        let report = harness
            .orchestrator
            .ingest_payload(&stream.id, Bytes::from(vec![3u8; 32 * 1024]))
            .await
            .unwrap();
        assert!(report.flushed);

        for particle_id in &report.particle_ids {
            assert_eq!(
                harness
                    .orchestrator
                    .particle_status(&stream.id, particle_id)
                    .await,
                Some(RoutingStatus::Stored)
            );
        }

        let (cluster_id, stored_ids) = harness
            .clusters
            .stored_location(&stream.id)
            .await
            .expect("batch must be stored");
        assert_eq!(stored_ids.len(), 2);
        let master = harness.registry.get_node("store_m").await.unwrap().unwrap();
        assert_eq!(master.cluster_id.as_deref(), Some(cluster_id.as_str()));

        // Stored particles count as processed: the payload reassembles.
        let assembled = harness.transport.reassemble(&stream.id).unwrap();
        assert_eq!(assembled.len(), 32 * 1024);
    }

    #[tokio::test]
    async fn test_stop_drains_cache_to_storage() {
        let (harness, _rx) = Harness::new(32 * 1024 * 1024).await;
        let stream = harness
            .orchestrator
            .initialize(StreamSource {
                source_id: "cam_1".into(),
                source_uri: "rtsp://cam_1/main".into(),
                resolution: "1920x1080".into(),
                fps: 30,
            })
            .await
            .unwrap();
        harness.orchestrator.start(&stream.id).await.unwrap();
        let report = harness
            .orchestrator
            .ingest_payload(&stream.id, Bytes::from(vec![4u8; 1024 * 1024]))
            .await
            .unwrap();
        assert_eq!(report.particle_ids.len(), 64);
        assert!(!report.flushed);

        let stopped = harness.orchestrator.stop(&stream.id).await.unwrap();
        assert_eq!(stopped.status, StreamStatus::Stopped);
        assert!(stopped.stopped_at.is_some());
        assert_eq!(harness.transport.pending_count(&stream.id), 0);

        // The drain pushed all 64 buffered particles out of the relay.
        let relay = harness.registry.get_node("cache_a").await.unwrap().unwrap();
        assert_eq!(relay.cached_bytes, 0);
        assert!(relay.cached_particle_ids.is_empty());
        assert_eq!(harness.hooks.stopped.load(Ordering::SeqCst), 1);

        // Idempotent: a second stop changes nothing.
        let again = harness.orchestrator.stop(&stream.id).await.unwrap();
        assert_eq!(again.status, StreamStatus::Stopped);
        assert_eq!(harness.hooks.stopped.load(Ordering::SeqCst), 1);

        // No further routing for the dropped stream.
        let error = harness
            .orchestrator
            .ingest_payload(&stream.id, Bytes::from(vec![5u8; 1024]))
            .await
            .unwrap_err();
        assert!(matches!(error, FluxError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let (harness, _rx) = Harness::new(32 * 1024 * 1024).await;
        let stream = harness
            .orchestrator
            .initialize(StreamSource {
                source_id: "cam_1".into(),
                source_uri: "rtsp://cam_1/main".into(),
                resolution: "640x480".into(),
                fps: 15,
            })
            .await
            .unwrap();
        harness.orchestrator.start(&stream.id).await.unwrap();
        harness
            .orchestrator
            .ingest_payload(&stream.id, Bytes::from(vec![6u8; 1024]))
            .await
            .unwrap();

        let paused = harness.orchestrator.pause(&stream.id).await.unwrap();
        assert_eq!(paused.status, StreamStatus::Paused);

        // Ingest while paused is rejected.
        let error = harness
            .orchestrator
            .ingest_payload(&stream.id, Bytes::from(vec![7u8; 1024]))
            .await
            .unwrap_err();
        assert!(matches!(error, FluxError::InvalidTransition { .. }));

        let resumed = harness.orchestrator.resume(&stream.id).await.unwrap();
        assert_eq!(resumed.status, StreamStatus::Active);
        harness
            .orchestrator
            .ingest_payload(&stream.id, Bytes::from(vec![8u8; 1024]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_serve_routes_through_relay() {
        let (harness, mut rx) = Harness::new(16 * 1024).await;
        let stream = harness
            .orchestrator
            .initialize(StreamSource {
                source_id: "cam_1".into(),
                source_uri: "rtsp://cam_1/main".into(),
                resolution: "1920x1080".into(),
                fps: 30,
            })
            .await
            .unwrap();
        harness.orchestrator.start(&stream.id).await.unwrap();
        harness
            .orchestrator
            .ingest_payload(&stream.id, Bytes::from(vec![9u8; 16 * 1024]))
            .await
            .unwrap();

        let report = harness.orchestrator.serve(&stream.id).await.unwrap();
        assert_eq!(report.relay_cache_id, "cache_a");
        // Reads prefer the replica over the master.
        assert_eq!(report.source_storage_id, "store_r");

        // The relay got the serve notice.
        let cache_rx = &mut rx[1];
        let mut saw_served = false;
        while let Ok(message) = cache_rx.try_recv() {
            if matches!(message, CoordMessage::ParticlesServed { .. }) {
                saw_served = true;
            }
        }
        assert!(saw_served);
        assert_eq!(
            harness
                .orchestrator
                .particle_status(&stream.id, &report.particle_ids[0])
                .await,
            Some(RoutingStatus::Served)
        );
    }

    #[tokio::test]
    async fn test_serve_before_storage_is_incomplete() {
        let (harness, _rx) = Harness::new(32 * 1024 * 1024).await;
        let stream = harness
            .orchestrator
            .initialize(StreamSource {
                source_id: "cam_1".into(),
                source_uri: "rtsp://cam_1/main".into(),
                resolution: "640x480".into(),
                fps: 15,
            })
            .await
            .unwrap();
        harness.orchestrator.start(&stream.id).await.unwrap();
        harness
            .orchestrator
            .ingest_payload(&stream.id, Bytes::from(vec![1u8; 1024]))
            .await
            .unwrap();

        let error = harness.orchestrator.serve(&stream.id).await.unwrap_err();
        assert!(matches!(error, FluxError::IncompleteStream { .. }));
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn test_register_message_joins_storage_cluster() {
        let (harness, _rx) = Harness::new(32 * 1024 * 1024).await;
        // The harness pair fills half of the first cluster; new storage
        // nodes keep joining it until it holds CLUSTER_CAPACITY members.
        for i in 0..(CLUSTER_CAPACITY - 2) {
            harness
                .orchestrator
                .handle_node_message(NodeMessage::Register {
                    node_id: format!("store_extra_{}", i),
                    role: NodeRole::Storage,
                    resources: Resources {
                        storage_mb: 5_000,
                        ..Default::default()
                    },
                })
                .await
                .unwrap();
        }

        let first = harness
            .registry
            .get_node("store_m")
            .await
            .unwrap()
            .unwrap()
            .cluster_id
            .unwrap();
        let joined = harness
            .registry
            .get_node("store_extra_0")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(joined.cluster_id.as_deref(), Some(first.as_str()));
        assert!(!joined.is_master);
    }

    #[tokio::test]
    async fn test_shared_relay_keeps_streams_separate() {
        let (harness, _rx) = Harness::new(32 * 1024 * 1024).await;
        let mut streams = Vec::new();
        for source in ["cam_1", "cam_2"] {
            let stream = harness
                .orchestrator
                .initialize(StreamSource {
                    source_id: source.into(),
                    source_uri: format!("rtsp://{}/main", source),
                    resolution: "1920x1080".into(),
                    fps: 30,
                })
                .await
                .unwrap();
            harness.orchestrator.start(&stream.id).await.unwrap();
            harness
                .orchestrator
                .ingest_payload(&stream.id, Bytes::from(vec![1u8; 16 * 1024]))
                .await
                .unwrap();
            streams.push(stream.id);
        }

        // Both streams buffer on the single relay; an explicit flush must
        // route each stream's particles under its own id.
        harness
            .orchestrator
            .handle_node_message(NodeMessage::FlushParticles {
                node_id: "cache_a".into(),
                stream_id: None,
            })
            .await
            .unwrap();

        for stream_id in &streams {
            let (_, stored_ids) = harness
                .clusters
                .stored_location(stream_id)
                .await
                .expect("each stream must be stored under its own id");
            assert_eq!(stored_ids.len(), 1);
            for particle_id in &stored_ids {
                assert!(
                    particle_id.starts_with(stream_id.as_str()),
                    "particle {} stored under stream {}",
                    particle_id,
                    stream_id
                );
            }
        }
    }

    #[tokio::test]
    async fn test_master_completed_rotates_cluster_master() {
        let (harness, _rx) = Harness::new(32 * 1024 * 1024).await;
        let cluster_id = harness
            .registry
            .get_node("store_m")
            .await
            .unwrap()
            .unwrap()
            .cluster_id
            .unwrap();

        harness
            .orchestrator
            .handle_node_message(NodeMessage::MasterCompleted {
                node_id: "store_m".into(),
                cluster_id: cluster_id.clone(),
            })
            .await
            .unwrap();

        let old = harness.registry.get_node("store_m").await.unwrap().unwrap();
        let new = harness.registry.get_node("store_r").await.unwrap().unwrap();
        assert!(!old.is_master);
        assert!(new.is_master);
        assert_eq!(new.cluster_id.as_deref(), Some(cluster_id.as_str()));
    }

    #[tokio::test]
    async fn test_disconnect_of_cache_drains_and_offlines() {
        let (harness, _rx) = Harness::new(32 * 1024 * 1024).await;
        let stream = harness
            .orchestrator
            .initialize(StreamSource {
                source_id: "cam_1".into(),
                source_uri: "rtsp://cam_1/main".into(),
                resolution: "1920x1080".into(),
                fps: 30,
            })
            .await
            .unwrap();
        harness.orchestrator.start(&stream.id).await.unwrap();
        harness
            .orchestrator
            .ingest_payload(&stream.id, Bytes::from(vec![1u8; 32 * 1024]))
            .await
            .unwrap();

        harness.orchestrator.handle_disconnect("cache_a").await.unwrap();

        let node = harness.registry.get_node("cache_a").await.unwrap().unwrap();
        assert!(!node.is_online());
        assert!(!harness.bus.is_attached(NodeRole::Cache, "cache_a"));
        // The drain routed the buffered batch into storage.
        assert!(harness.clusters.stored_location(&stream.id).await.is_some());
    }
}
