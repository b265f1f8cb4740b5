use crate::error::Result;
use crate::node::{NodeId, NodeRole, Resources};
use serde::{Deserialize, Serialize};

/// Thin client for the collaborator REST surface. Used to persist registry
/// snapshots and recovery tasks when a node is not on a live session
/// channel; it is a mirror, not a registry backend of record.
#[derive(Clone)]
pub struct RestMirror {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterSnapshot<'a> {
    pub node_id: &'a str,
    pub role: NodeRole,
    pub resources: Resources,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatSnapshot<'a> {
    pub node_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskCreate<'a> {
    pub kind: &'a str,
    pub stream_id: &'a str,
    pub node_id: &'a str,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskUpdate<'a> {
    pub status: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskCreated {
    pub id: String,
}

impl RestMirror {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub async fn register_node(
        &self,
        node_id: &NodeId,
        role: NodeRole,
        resources: Resources,
    ) -> Result<()> {
        self.client
            .post(self.url("/nodes/register"))
            .json(&RegisterSnapshot {
                node_id,
                role,
                resources,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn heartbeat(&self, node_id: &NodeId) -> Result<()> {
        self.client
            .post(self.url("/nodes/heartbeat"))
            .json(&HeartbeatSnapshot { node_id })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn create_task(&self, task: TaskCreate<'_>) -> Result<TaskCreated> {
        let created = self
            .client
            .post(self.url("/tasks"))
            .json(&task)
            .send()
            .await?
            .error_for_status()?
            .json::<TaskCreated>()
            .await?;
        Ok(created)
    }

    pub async fn update_task(&self, task_id: &str, status: &str) -> Result<()> {
        self.client
            .patch(self.url(&format!("/tasks/{}", task_id)))
            .json(&TaskUpdate { status })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
