use crate::error::Result;
use crate::particle::ParticleId;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::PathBuf;

/// A batch that could not be forwarded. Recorded instead of dropped so the
/// particles can be recovered manually or by a scheduled job.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PendingTransmission {
    pub pk: i64,
    pub stream_id: String,
    pub source_node_id: String,
    pub particle_ids: Vec<ParticleId>,
    pub bytes: u64,
    pub reason: String,
    /// Id of the recovery task mirrored to the collaborator surface, when
    /// one was created.
    pub task_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub recovered_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// SQLite-backed store for pending-transmission records.
pub struct PendingTransmissionStore {
    db_path: PathBuf,
}

impl PendingTransmissionStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pending_transmissions (
                pk INTEGER PRIMARY KEY AUTOINCREMENT,
                stream_id TEXT NOT NULL,
                source_node_id TEXT NOT NULL,
                particle_ids TEXT NOT NULL,
                bytes INTEGER NOT NULL,
                reason TEXT NOT NULL,
                task_id TEXT,
                created_at TEXT NOT NULL,
                recovered_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_pending_transmissions_open
             ON pending_transmissions(recovered_at, stream_id)",
            [],
        )?;

        Ok(())
    }

    /// Record a failed batch; returns the record's primary key.
    pub fn record(
        &self,
        stream_id: &str,
        source_node_id: &str,
        particle_ids: &[ParticleId],
        bytes: u64,
        reason: &str,
    ) -> Result<i64> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO pending_transmissions (
                stream_id, source_node_id, particle_ids, bytes, reason, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                stream_id,
                source_node_id,
                serde_json::to_string(particle_ids)?,
                bytes as i64,
                reason,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Attach the mirrored recovery task's id to a record.
    pub fn set_task_id(&self, pk: i64, task_id: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE pending_transmissions SET task_id = ?1 WHERE pk = ?2",
            params![task_id, pk],
        )?;
        Ok(affected > 0)
    }

    pub fn list_pending(&self) -> Result<Vec<PendingTransmission>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT pk, stream_id, source_node_id, particle_ids, bytes, reason, task_id, created_at
             FROM pending_transmissions WHERE recovered_at IS NULL ORDER BY pk",
        )?;

        let rows = stmt.query_map([], |row| {
            let pk: i64 = row.get(0)?;
            let stream_id: String = row.get(1)?;
            let source_node_id: String = row.get(2)?;
            let particle_ids_json: String = row.get(3)?;
            let bytes: i64 = row.get(4)?;
            let reason: String = row.get(5)?;
            let task_id: Option<String> = row.get(6)?;
            let created_at: String = row.get(7)?;

            let particle_ids: Vec<ParticleId> = serde_json::from_str(&particle_ids_json)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

            Ok(PendingTransmission {
                pk,
                stream_id,
                source_node_id,
                particle_ids,
                bytes: bytes as u64,
                reason,
                task_id,
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?
                    .with_timezone(&chrono::Utc),
                recovered_at: None,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Mark a record as recovered; returns false if it was already
    /// recovered or does not exist.
    pub fn mark_recovered(&self, pk: i64) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE pending_transmissions SET recovered_at = ?1
             WHERE pk = ?2 AND recovered_at IS NULL",
            params![chrono::Utc::now().to_rfc3339(), pk],
        )?;
        Ok(affected > 0)
    }

    pub fn get(&self, pk: i64) -> Result<Option<PendingTransmission>> {
        let conn = self.get_conn()?;
        let row = conn
            .query_row(
                "SELECT stream_id, source_node_id, particle_ids, bytes, reason,
                        task_id, created_at, recovered_at
                 FROM pending_transmissions WHERE pk = ?1",
                params![pk],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()?;

        match row {
            Some((
                stream_id,
                source_node_id,
                ids_json,
                bytes,
                reason,
                task_id,
                created_at,
                recovered_at,
            )) => {
                Ok(Some(PendingTransmission {
                    pk,
                    stream_id,
                    source_node_id,
                    particle_ids: serde_json::from_str(&ids_json)?,
                    bytes: bytes as u64,
                    reason,
                    task_id,
                    created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                        .map_err(|e| crate::error::FluxError::Internal(e.to_string()))?
                        .with_timezone(&chrono::Utc),
                    recovered_at: recovered_at
                        .map(|t| chrono::DateTime::parse_from_rfc3339(&t))
                        .transpose()
                        .map_err(|e| crate::error::FluxError::Internal(e.to_string()))?
                        .map(|t| t.with_timezone(&chrono::Utc)),
                }))
            }
            None => Ok(None),
        }
    }
}
