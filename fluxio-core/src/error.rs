use crate::node::{NodeRole, ResourceFloor};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FluxError>;

#[derive(Error, Debug)]
pub enum FluxError {
    /// No live node of the requested role satisfies the resource floor.
    /// Retryable: callers back off and retry before failing the stream.
    #[error("no candidate {role} node satisfies {min:?}")]
    NoCandidateNode { role: NodeRole, min: ResourceFloor },

    /// Reassembly was requested before every chunk index was processed.
    /// Retryable: the caller waits for the remaining particles.
    #[error("stream {stream_id} incomplete: missing chunk indexes {missing:?}")]
    IncompleteStream {
        stream_id: String,
        missing: Vec<u32>,
    },

    /// No online master and no promotable replica in the cluster.
    #[error("cluster {cluster_id} has no online master or promotable replica")]
    ClusterUnavailable { cluster_id: String },

    /// A forward failed mid-flight. The originating node retains its
    /// buffer; exhausted retries end up in the pending-transmission store.
    #[error("transmission failed for stream {stream_id} ({context})")]
    TransmissionFailure {
        stream_id: String,
        particle_ids: Vec<String>,
        context: String,
    },

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("invalid stream transition for {stream_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        stream_id: String,
        from: crate::stream::StreamStatus,
        to: crate::stream::StreamStatus,
    },

    #[error("particle digest mismatch for {particle_id}: expected {expected}, actual {actual}")]
    DigestMismatch {
        particle_id: String,
        expected: String,
        actual: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FluxError {
    /// Errors the originating hop may retry instead of failing the stream.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FluxError::NoCandidateNode { .. }
                | FluxError::IncompleteStream { .. }
                | FluxError::ClusterUnavailable { .. }
                | FluxError::TransmissionFailure { .. }
        )
    }
}

impl From<redis::RedisError> for FluxError {
    fn from(error: redis::RedisError) -> Self {
        FluxError::Registry(error.to_string())
    }
}

impl From<reqwest::Error> for FluxError {
    fn from(error: reqwest::Error) -> Self {
        FluxError::Registry(error.to_string())
    }
}
