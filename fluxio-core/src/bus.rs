use crate::error::{FluxError, Result};
use crate::node::{ClusterId, NodeId, NodeRole, ResourceFloor, Resources};
use crate::particle::ParticleId;
use crate::stream::StreamId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;

/// Messages a worker node sends to the coordination layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeMessage {
    Register {
        node_id: NodeId,
        role: NodeRole,
        resources: Resources,
    },
    Heartbeat {
        node_id: NodeId,
    },
    ResourcesUpdate {
        node_id: NodeId,
        resources: Resources,
    },
    ParticlesProcess {
        node_id: NodeId,
        stream_id: StreamId,
        particle_ids: Vec<ParticleId>,
    },
    ParticlesProcessed {
        node_id: NodeId,
        stream_id: StreamId,
        particle_ids: Vec<ParticleId>,
        target_id: NodeId,
    },
    ParticlesStore {
        node_id: NodeId,
        stream_id: StreamId,
        particle_ids: Vec<ParticleId>,
    },
    ParticlesStored {
        node_id: NodeId,
        stream_id: StreamId,
        particle_ids: Vec<ParticleId>,
        cluster_id: ClusterId,
    },
    ParticlesRetrieve {
        node_id: NodeId,
        stream_id: StreamId,
        particle_ids: Vec<ParticleId>,
    },
    ReplicateData {
        node_id: NodeId,
        stream_id: StreamId,
        particle_ids: Vec<ParticleId>,
        source_master_id: NodeId,
    },
    JoinCluster {
        node_id: NodeId,
    },
    /// A master finished a storage job; mastership rotates to spread load.
    MasterCompleted {
        node_id: NodeId,
        cluster_id: ClusterId,
    },
    FlushParticles {
        node_id: NodeId,
        stream_id: Option<StreamId>,
    },
}

/// Messages the coordination layer sends to a worker node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CoordMessage {
    ClusterJoined {
        cluster_id: ClusterId,
        is_master: bool,
    },
    PromotedToMaster {
        cluster_id: ClusterId,
    },
    SpawnRequest {
        min_resources: ResourceFloor,
    },
    StreamError {
        stream_id: StreamId,
        message: String,
    },
    ParticlesServed {
        stream_id: StreamId,
        particle_ids: Vec<ParticleId>,
    },
    ParticlesProcess {
        stream_id: StreamId,
        particle_ids: Vec<ParticleId>,
    },
    ParticlesStore {
        stream_id: StreamId,
        particle_ids: Vec<ParticleId>,
        source_id: NodeId,
    },
    ReplicateData {
        stream_id: StreamId,
        particle_ids: Vec<ParticleId>,
        source_master_id: NodeId,
    },
    ParticlesRetrieve {
        stream_id: StreamId,
        particle_ids: Vec<ParticleId>,
        target_id: NodeId,
    },
}

impl CoordMessage {
    fn stream_id(&self) -> Option<&str> {
        match self {
            CoordMessage::StreamError { stream_id, .. }
            | CoordMessage::ParticlesServed { stream_id, .. }
            | CoordMessage::ParticlesProcess { stream_id, .. }
            | CoordMessage::ParticlesStore { stream_id, .. }
            | CoordMessage::ReplicateData { stream_id, .. }
            | CoordMessage::ParticlesRetrieve { stream_id, .. } => Some(stream_id),
            _ => None,
        }
    }

    fn particle_ids(&self) -> &[ParticleId] {
        match self {
            CoordMessage::ParticlesServed { particle_ids, .. }
            | CoordMessage::ParticlesProcess { particle_ids, .. }
            | CoordMessage::ParticlesStore { particle_ids, .. }
            | CoordMessage::ReplicateData { particle_ids, .. }
            | CoordMessage::ParticlesRetrieve { particle_ids, .. } => particle_ids,
            _ => &[],
        }
    }
}

/// Typed per-role message channels, one channel per attached node. This
/// replaces stringly-keyed broadcast groups: each role has its own map of
/// node id to sender, and message variants are enum cases, not event names.
#[derive(Default)]
pub struct SessionBus {
    channels: RwLock<HashMap<NodeRole, HashMap<NodeId, mpsc::UnboundedSender<CoordMessage>>>>,
}

impl SessionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node session; the returned receiver is the node's inbound
    /// half of the channel. Re-attaching replaces the previous session.
    pub fn attach(&self, role: NodeRole, node_id: &str) -> mpsc::UnboundedReceiver<CoordMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.channels.write().expect("bus state poisoned");
        channels
            .entry(role)
            .or_default()
            .insert(node_id.to_string(), tx);
        rx
    }

    pub fn detach(&self, role: NodeRole, node_id: &str) {
        let mut channels = self.channels.write().expect("bus state poisoned");
        if let Some(role_map) = channels.get_mut(&role) {
            role_map.remove(node_id);
        }
    }

    pub fn is_attached(&self, role: NodeRole, node_id: &str) -> bool {
        let channels = self.channels.read().expect("bus state poisoned");
        channels
            .get(&role)
            .is_some_and(|role_map| role_map.contains_key(node_id))
    }

    /// Deliver a message to a single node. A detached or closed session is
    /// a `TransmissionFailure`; the sender must retain its buffer.
    pub fn send_to(&self, role: NodeRole, node_id: &str, message: CoordMessage) -> Result<()> {
        let channels = self.channels.read().expect("bus state poisoned");
        let sender = channels
            .get(&role)
            .and_then(|role_map| role_map.get(node_id));

        let failure = |message: &CoordMessage, reason: &str| FluxError::TransmissionFailure {
            stream_id: message.stream_id().unwrap_or("-").to_string(),
            particle_ids: message.particle_ids().to_vec(),
            context: format!("{} {} {}", role, node_id, reason),
        };

        match sender {
            Some(tx) => tx
                .send(message.clone())
                .map_err(|_| failure(&message, "session closed")),
            None => Err(failure(&message, "not attached")),
        }
    }

    /// Deliver to every attached node of a role; returns the number of
    /// sessions reached.
    pub fn broadcast(&self, role: NodeRole, message: CoordMessage) -> usize {
        let channels = self.channels.read().expect("bus state poisoned");
        let Some(role_map) = channels.get(&role) else {
            return 0;
        };
        role_map
            .values()
            .filter(|tx| tx.send(message.clone()).is_ok())
            .count()
    }
}
