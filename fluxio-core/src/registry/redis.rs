use super::{NodeFilter, NodeRegistry, SortKey, sort_nodes};
use crate::error::{FluxError, Result};
use crate::node::{
    ClusterId, ConnectionClass, NodeRecord, NodeRole, NodeStatus, Resources,
};
use crate::particle::ParticleId;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::collections::HashMap;

/// Redis-backed registry. One hash per node keyed by
/// `{namespace}:node:{id}`, a set per role for lookup. Every field group is
/// its own hash field, so a heartbeat touch and a resource update write
/// disjoint fields and cannot clobber each other; `status`/`is_master`
/// flips go through a compare-and-set script.
pub struct RedisRegistry {
    conn: ConnectionManager,
    namespace: String,
}

const CAS_FIELD_SCRIPT: &str = r#"
local cur = redis.call('HGET', KEYS[1], ARGV[1])
if cur == ARGV[2] then
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
  return 1
end
return 0
"#;

impl RedisRegistry {
    pub async fn new(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| FluxError::Config(format!("invalid redis url: {}", e)))?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn node_key(&self, id: &str) -> String {
        format!("{}:node:{}", self.namespace, id)
    }

    fn role_key(&self, role: NodeRole) -> String {
        format!("{}:role:{}", self.namespace, role)
    }

    async fn hset_json<T: serde::Serialize>(
        &self,
        id: &str,
        field: &str,
        value: &T,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.node_key(id)).await?;
        if !exists {
            return Err(FluxError::NodeNotFound(id.to_string()));
        }
        let _: () = conn
            .hset(self.node_key(id), field, serde_json::to_string(value)?)
            .await?;
        Ok(())
    }

    async fn cas_json<T: serde::Serialize>(
        &self,
        id: &str,
        field: &str,
        expected: &T,
        next: &T,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.node_key(id)).await?;
        if !exists {
            return Err(FluxError::NodeNotFound(id.to_string()));
        }
        let swapped: i32 = redis::Script::new(CAS_FIELD_SCRIPT)
            .key(self.node_key(id))
            .arg(field)
            .arg(serde_json::to_string(expected)?)
            .arg(serde_json::to_string(next)?)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn load_node(&self, id: &str) -> Result<Option<NodeRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.node_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_node(id, &fields).map(Some)
    }

    async fn write_full(&self, node: &NodeRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = self.node_key(&node.id);
        let entries: Vec<(&str, String)> = vec![
            ("role", serde_json::to_string(&node.role)?),
            ("resources", serde_json::to_string(&node.resources)?),
            ("status", serde_json::to_string(&node.status)?),
            (
                "last_heartbeat_at",
                serde_json::to_string(&node.last_heartbeat_at)?,
            ),
            ("cluster_id", serde_json::to_string(&node.cluster_id)?),
            ("is_master", serde_json::to_string(&node.is_master)?),
            (
                "assigned_ingest_id",
                serde_json::to_string(&node.assigned_ingest_id)?,
            ),
            (
                "cached_particle_ids",
                serde_json::to_string(&node.cached_particle_ids)?,
            ),
            ("cached_bytes", serde_json::to_string(&node.cached_bytes)?),
            (
                "connection_class",
                serde_json::to_string(&node.connection_class)?,
            ),
            ("created_at", serde_json::to_string(&node.created_at)?),
        ];
        let _: () = conn.hset_multiple(&key, &entries).await?;
        let _: () = conn.sadd(self.role_key(node.role), &node.id).await?;
        Ok(())
    }

    async fn nodes_of_role(&self, role: NodeRole) -> Result<Vec<NodeRecord>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(self.role_key(role)).await?;
        let mut nodes = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.load_node(&id).await? {
                // A node may have been re-registered under another role.
                if node.role == role {
                    nodes.push(node);
                }
            }
        }
        Ok(nodes)
    }
}

fn parse_node(id: &str, fields: &HashMap<String, String>) -> Result<NodeRecord> {
    fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str> {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| FluxError::Registry(format!("node hash missing field '{}'", name)))
    }

    Ok(NodeRecord {
        id: id.to_string(),
        role: serde_json::from_str(field(fields, "role")?)?,
        resources: serde_json::from_str(field(fields, "resources")?)?,
        status: serde_json::from_str(field(fields, "status")?)?,
        last_heartbeat_at: serde_json::from_str(field(fields, "last_heartbeat_at")?)?,
        cluster_id: serde_json::from_str(field(fields, "cluster_id")?)?,
        is_master: serde_json::from_str(field(fields, "is_master")?)?,
        assigned_ingest_id: serde_json::from_str(field(fields, "assigned_ingest_id")?)?,
        cached_particle_ids: serde_json::from_str(field(fields, "cached_particle_ids")?)?,
        cached_bytes: serde_json::from_str(field(fields, "cached_bytes")?)?,
        connection_class: serde_json::from_str(field(fields, "connection_class")?)?,
        created_at: serde_json::from_str(field(fields, "created_at")?)?,
    })
}

#[async_trait]
impl NodeRegistry for RedisRegistry {
    async fn upsert_node(
        &self,
        id: &str,
        role: NodeRole,
        resources: Resources,
    ) -> Result<NodeRecord> {
        let node = match self.load_node(id).await? {
            Some(mut existing) => {
                existing.role = role;
                existing.resources = resources;
                existing.status = NodeStatus::Online;
                existing.last_heartbeat_at = chrono::Utc::now();
                existing.connection_class =
                    ConnectionClass::from_network_mbps(resources.network_mbps);
                existing
            }
            None => NodeRecord::new(id, role, resources),
        };
        self.write_full(&node).await?;
        Ok(node)
    }

    async fn get_node(&self, id: &str) -> Result<Option<NodeRecord>> {
        self.load_node(id).await
    }

    async fn touch_heartbeat(&self, id: &str) -> Result<()> {
        self.hset_json(id, "last_heartbeat_at", &chrono::Utc::now())
            .await
    }

    async fn update_resources(&self, id: &str, resources: Resources) -> Result<()> {
        self.hset_json(id, "resources", &resources).await?;
        self.hset_json(
            id,
            "connection_class",
            &ConnectionClass::from_network_mbps(resources.network_mbps),
        )
        .await
    }

    async fn set_status(&self, id: &str, status: NodeStatus) -> Result<()> {
        self.hset_json(id, "status", &status).await
    }

    async fn set_status_if(
        &self,
        id: &str,
        expected: NodeStatus,
        next: NodeStatus,
    ) -> Result<bool> {
        self.cas_json(id, "status", &expected, &next).await
    }

    async fn mark_offline(&self, id: &str) -> Result<()> {
        self.set_status(id, NodeStatus::Offline).await
    }

    async fn find_by_role(
        &self,
        role: NodeRole,
        filter: NodeFilter,
        sort: SortKey,
        limit: usize,
    ) -> Result<Vec<NodeRecord>> {
        let mut nodes: Vec<NodeRecord> = self
            .nodes_of_role(role)
            .await?
            .into_iter()
            .filter(|node| filter.matches(node))
            .collect();
        sort_nodes(&mut nodes, sort);
        nodes.truncate(limit);
        Ok(nodes)
    }

    async fn set_cluster_membership(
        &self,
        id: &str,
        cluster_id: Option<&str>,
        is_master: bool,
    ) -> Result<()> {
        self.hset_json(id, "cluster_id", &cluster_id.map(str::to_string))
            .await?;
        self.hset_json(id, "is_master", &is_master).await
    }

    async fn set_master_if(&self, id: &str, expected: bool, next: bool) -> Result<bool> {
        self.cas_json(id, "is_master", &expected, &next).await
    }

    async fn set_assigned_ingest(&self, id: &str, ingest_id: Option<&str>) -> Result<()> {
        self.hset_json(id, "assigned_ingest_id", &ingest_id.map(str::to_string))
            .await
    }

    async fn set_cache_state(
        &self,
        id: &str,
        particle_ids: Vec<ParticleId>,
        cached_bytes: u64,
    ) -> Result<()> {
        self.hset_json(id, "cached_particle_ids", &particle_ids)
            .await?;
        self.hset_json(id, "cached_bytes", &cached_bytes).await
    }

    async fn list_cluster_ids(&self) -> Result<Vec<ClusterId>> {
        let mut ids: Vec<ClusterId> = self
            .nodes_of_role(NodeRole::Storage)
            .await?
            .into_iter()
            .filter(|node| node.is_online())
            .filter_map(|node| node.cluster_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn cluster_members(&self, cluster_id: &str) -> Result<Vec<NodeRecord>> {
        Ok(self
            .nodes_of_role(NodeRole::Storage)
            .await?
            .into_iter()
            .filter(|node| node.cluster_id.as_deref() == Some(cluster_id))
            .collect())
    }
}
