use crate::error::{FluxError, Result};
use crate::particle::{Particle, ParticleId, compute_digest};
use crate::stream::StreamId;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

/// Default particle payload size, 16 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Outcome of [`ParticleTransport::mark_processed`]. `Completed` is
/// returned exactly once per stream, when its pending set empties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamProgress {
    Pending { remaining: usize },
    Completed,
    /// The particle was already processed; re-delivery is a no-op.
    Duplicate,
}

#[derive(Default)]
struct TransportState {
    /// particle id -> stream id, for pending particles.
    index: HashMap<ParticleId, StreamId>,
    pending: HashMap<StreamId, HashMap<ParticleId, Particle>>,
    processed: HashMap<StreamId, BTreeMap<u32, Particle>>,
    totals: HashMap<StreamId, u32>,
    completed: HashSet<StreamId>,
}

/// Splits raw payloads into fixed-size ordered particles and tracks each
/// stream's pending/processed sets until it can be reassembled.
pub struct ParticleTransport {
    chunk_size: usize,
    state: Mutex<TransportState>,
}

impl Default for ParticleTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ParticleTransport {
    pub fn new(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        Self {
            chunk_size,
            state: Mutex::new(TransportState::default()),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Deterministic chunking in payload order. Chunk indexes continue from
    /// the stream's current total, so successive payload batches extend the
    /// same ordered sequence.
    pub fn split(&self, stream_id: &str, payload: Bytes) -> Vec<Particle> {
        let mut state = self.state.lock().expect("transport state poisoned");

        let base = *state.totals.get(stream_id).unwrap_or(&0);
        let new_chunks = payload.len().div_ceil(self.chunk_size) as u32;
        let total = base + new_chunks;

        let mut particles = Vec::with_capacity(new_chunks as usize);
        for i in 0..new_chunks {
            let start = i as usize * self.chunk_size;
            let end = (start + self.chunk_size).min(payload.len());
            let particle = Particle::new(stream_id, base + i, total, payload.slice(start..end));

            state
                .index
                .insert(particle.id.clone(), stream_id.to_string());
            state
                .pending
                .entry(stream_id.to_string())
                .or_default()
                .insert(particle.id.clone(), particle.clone());
            particles.push(particle);
        }

        state.totals.insert(stream_id.to_string(), total);
        // New pending work re-arms the completion signal.
        state.completed.remove(stream_id);

        tracing::debug!(
            stream_id,
            count = particles.len(),
            total_chunks = total,
            "split payload into particles"
        );
        particles
    }

    /// Move a particle from pending to processed. When the stream's pending
    /// set empties this returns `Completed`, exactly once; duplicate calls
    /// for an already-processed particle are safe no-ops.
    pub fn mark_processed(&self, particle_id: &str) -> Result<StreamProgress> {
        let mut state = self.state.lock().expect("transport state poisoned");

        let Some(stream_id) = state.index.remove(particle_id) else {
            // Either unknown or already processed; both are no-ops.
            let already = state
                .processed
                .values()
                .any(|chunks| chunks.values().any(|p| p.id == particle_id));
            if already {
                return Ok(StreamProgress::Duplicate);
            }
            return Err(FluxError::Internal(format!(
                "unknown particle: {}",
                particle_id
            )));
        };

        let pending = state
            .pending
            .get_mut(&stream_id)
            .ok_or_else(|| FluxError::StreamNotFound(stream_id.clone()))?;
        let particle = pending.remove(particle_id).ok_or_else(|| {
            FluxError::Internal(format!("particle missing from pending set: {}", particle_id))
        })?;
        let remaining = pending.len();

        state
            .processed
            .entry(stream_id.clone())
            .or_default()
            .insert(particle.chunk_index, particle);

        if remaining == 0 && state.completed.insert(stream_id.clone()) {
            tracing::info!(stream_id, "all particles processed");
            return Ok(StreamProgress::Completed);
        }
        Ok(StreamProgress::Pending { remaining })
    }

    /// Reassemble the ordered byte sequence for a stream. Idempotent and
    /// non-mutating; safe to call repeatedly.
    pub fn reassemble(&self, stream_id: &str) -> Result<Bytes> {
        let state = self.state.lock().expect("transport state poisoned");

        let total = *state
            .totals
            .get(stream_id)
            .ok_or_else(|| FluxError::StreamNotFound(stream_id.to_string()))?;
        let empty = BTreeMap::new();
        let processed = state.processed.get(stream_id).unwrap_or(&empty);

        let missing: Vec<u32> = (0..total)
            .filter(|index| !processed.contains_key(index))
            .collect();
        if !missing.is_empty() {
            return Err(FluxError::IncompleteStream {
                stream_id: stream_id.to_string(),
                missing,
            });
        }

        let mut assembled = BytesMut::with_capacity(
            processed.values().map(|p| p.payload.len()).sum(),
        );
        for particle in processed.values() {
            let actual = compute_digest(&particle.payload);
            if actual != particle.sha256 {
                return Err(FluxError::DigestMismatch {
                    particle_id: particle.id.clone(),
                    expected: particle.sha256.clone(),
                    actual,
                });
            }
            assembled.extend_from_slice(&particle.payload);
        }
        Ok(assembled.freeze())
    }

    pub fn pending_count(&self, stream_id: &str) -> usize {
        let state = self.state.lock().expect("transport state poisoned");
        state.pending.get(stream_id).map_or(0, HashMap::len)
    }

    pub fn total_chunks(&self, stream_id: &str) -> Option<u32> {
        let state = self.state.lock().expect("transport state poisoned");
        state.totals.get(stream_id).copied()
    }

    /// Look up pending particles by id (e.g. to hand a batch to a cache
    /// node). Unknown or already-processed ids are skipped.
    pub fn pending_particles(&self, stream_id: &str, particle_ids: &[ParticleId]) -> Vec<Particle> {
        let state = self.state.lock().expect("transport state poisoned");
        let Some(pending) = state.pending.get(stream_id) else {
            return Vec::new();
        };
        particle_ids
            .iter()
            .filter_map(|id| pending.get(id).cloned())
            .collect()
    }

    /// Forget all state for a stream. Used when a stream is stopped and
    /// its pending routing is cancelled.
    pub fn drop_stream(&self, stream_id: &str) {
        let mut state = self.state.lock().expect("transport state poisoned");
        if let Some(pending) = state.pending.remove(stream_id) {
            for id in pending.keys() {
                state.index.remove(id);
            }
        }
        state.processed.remove(stream_id);
        state.totals.remove(stream_id);
        state.completed.remove(stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_round_trip() {
        let transport = ParticleTransport::new(16 * 1024);
        let payload = Bytes::from(vec![7u8; 1024 * 1024]);
        let particles = transport.split("s1", payload.clone());

        assert_eq!(particles.len(), 64);
        assert_eq!(particles[0].chunk_index, 0);
        assert_eq!(particles[63].chunk_index, 63);
        assert!(particles.iter().all(|p| p.total_chunks == 64));

        for particle in &particles {
            transport.mark_processed(&particle.id).unwrap();
        }
        assert_eq!(transport.reassemble("s1").unwrap(), payload);
    }

    #[test]
    fn test_uneven_tail_chunk() {
        let transport = ParticleTransport::new(10);
        let payload = Bytes::from_static(b"0123456789abcde");
        let particles = transport.split("s1", payload.clone());
        assert_eq!(particles.len(), 2);
        assert_eq!(particles[1].payload.len(), 5);

        for particle in &particles {
            transport.mark_processed(&particle.id).unwrap();
        }
        assert_eq!(transport.reassemble("s1").unwrap(), payload);
    }

    #[test]
    fn test_completion_fires_exactly_once_any_order() {
        let transport = ParticleTransport::new(4);
        let mut particles = transport.split("s1", Bytes::from(vec![1u8; 40]));
        particles.reverse();

        let mut completions = 0;
        for particle in &particles {
            if transport.mark_processed(&particle.id).unwrap() == StreamProgress::Completed {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);

        // Duplicate delivery after completion stays a no-op.
        assert_eq!(
            transport.mark_processed(&particles[0].id).unwrap(),
            StreamProgress::Duplicate
        );
    }

    #[test]
    fn test_reassemble_incomplete_fails_and_is_idempotent() {
        let transport = ParticleTransport::new(4);
        let particles = transport.split("s1", Bytes::from(vec![2u8; 12]));

        transport.mark_processed(&particles[0].id).unwrap();
        transport.mark_processed(&particles[2].id).unwrap();

        match transport.reassemble("s1") {
            Err(FluxError::IncompleteStream { missing, .. }) => assert_eq!(missing, vec![1]),
            other => panic!("expected IncompleteStream, got {:?}", other),
        }

        transport.mark_processed(&particles[1].id).unwrap();
        let first = transport.reassemble("s1").unwrap();
        let second = transport.reassemble("s1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_second_batch_extends_indexes() {
        let transport = ParticleTransport::new(4);
        let first = transport.split("s1", Bytes::from(vec![1u8; 8]));
        let second = transport.split("s1", Bytes::from(vec![2u8; 8]));

        assert_eq!(first.len(), 2);
        assert_eq!(second[0].chunk_index, 2);
        assert_eq!(transport.total_chunks("s1"), Some(4));

        for particle in first.iter().chain(second.iter()) {
            transport.mark_processed(&particle.id).unwrap();
        }
        let assembled = transport.reassemble("s1").unwrap();
        assert_eq!(&assembled[..8], &[1u8; 8][..]);
        assert_eq!(&assembled[8..], &[2u8; 8][..]);
    }

    #[test]
    fn test_drop_stream_cancels_pending() {
        let transport = ParticleTransport::new(4);
        let particles = transport.split("s1", Bytes::from(vec![1u8; 8]));
        transport.drop_stream("s1");
        assert_eq!(transport.pending_count("s1"), 0);
        assert!(transport.mark_processed(&particles[0].id).is_err());
    }
}
