use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type StreamId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Initialized,
    Starting,
    Active,
    Paused,
    Stopped,
    Error,
}

impl StreamStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamStatus::Stopped | StreamStatus::Error)
    }

    /// Legal lifecycle edges. `Stopped` and `Error` are reachable from any
    /// non-terminal state; re-entering the current state is not an edge
    /// (callers treat it as an idempotent no-op).
    pub fn can_transition_to(&self, next: StreamStatus) -> bool {
        use StreamStatus::*;
        match (self, next) {
            (_, _) if self.is_terminal() => false,
            (_, Stopped) | (_, Error) => true,
            (Initialized, Starting) => true,
            (Starting, Active) => true,
            (Active, Paused) => true,
            (Paused, Active) => true,
            _ => false,
        }
    }
}

/// One live media stream moving through the mesh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,
    pub source_id: String,
    pub source_uri: String,
    pub status: StreamStatus,
    pub resolution: String,
    pub fps: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub stopped_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Stream {
    pub fn new(
        source_id: impl Into<String>,
        source_uri: impl Into<String>,
        resolution: impl Into<String>,
        fps: u32,
    ) -> Self {
        Self {
            id: format!("stream_{}", Ulid::new()),
            source_id: source_id.into(),
            source_uri: source_uri.into(),
            status: StreamStatus::Initialized,
            resolution: resolution.into(),
            fps,
            created_at: chrono::Utc::now(),
            started_at: None,
            stopped_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_edges() {
        use StreamStatus::*;
        assert!(Initialized.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Stopped));
        assert!(Starting.can_transition_to(Error));
        assert!(!Initialized.can_transition_to(Active));
        assert!(!Stopped.can_transition_to(Active));
        assert!(!Error.can_transition_to(Starting));
    }
}
