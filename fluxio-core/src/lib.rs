//! Fluxio Core - Orchestration layer for a distributed media relay mesh
//!
//! Streams are pulled by ingest nodes, chunked into fixed-size particles,
//! buffered on cache relays, and replicated into fixed-size storage
//! clusters:
//! - 16 KiB ordered particles with SHA256 digests
//! - 32 MiB threshold-flushed cache accumulations
//! - clusters of four storage nodes, one master and three replicas
//! - pluggable node registry (in-memory or Redis)

pub mod bus;
pub mod cache;
pub mod cluster;
pub mod error;
pub mod monitor;
pub mod node;
pub mod orchestrator;
pub mod particle;
pub mod recovery;
pub mod registry;
pub mod selector;
pub mod stream;
pub mod transport;

pub use bus::{CoordMessage, NodeMessage, SessionBus};
pub use cache::{AcceptOutcome, CacheManager, FlushBatch, FLUSH_THRESHOLD_BYTES};
pub use cluster::{StorageClusterManager, CLUSTER_CAPACITY};
pub use error::{FluxError, Result};
pub use monitor::{HealthMonitor, SweepReport, HEARTBEAT_TIMEOUT, SWEEP_INTERVAL};
pub use node::{
    ClusterId, ConnectionClass, NodeId, NodeRecord, NodeRole, NodeStatus, ResourceFloor, Resources,
};
pub use orchestrator::{
    IngestReport, NoopHooks, ServeReport, StreamLifecycleHooks, StreamOrchestrator, StreamSource,
};
pub use particle::{compute_digest, Particle, ParticleId, ParticleRouting, RoutingStatus};
pub use recovery::{PendingTransmission, PendingTransmissionStore};
pub use registry::{MemoryRegistry, NodeFilter, NodeRegistry, RedisRegistry, RegistryBuilder, RestMirror, SortKey};
pub use selector::{RankBy, ResourceSelector};
pub use stream::{Stream, StreamId, StreamStatus};
pub use transport::{ParticleTransport, StreamProgress, DEFAULT_CHUNK_SIZE};
