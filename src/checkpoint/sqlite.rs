//! SQLite 检查点存储
//!
//! 单连接 + Mutex，所有操作放到 spawn_blocking；追加在 IMMEDIATE 事务里完成：
//! 先取该会话当前最大序号，再插入，提交前其它读者看不到这一行。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, TransactionBehavior};

use super::{Checkpoint, CheckpointError, CheckpointMetadata, CheckpointStore};
use crate::core::ConversationState;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS checkpoints (
    conversation_id TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    checkpoint_id TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL,
    snapshot TEXT NOT NULL,
    metadata TEXT NOT NULL,
    PRIMARY KEY (conversation_id, ordinal)
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_created ON checkpoints(created_at);
";

const SELECT_COLUMNS: &str =
    "SELECT conversation_id, ordinal, checkpoint_id, created_at, snapshot, metadata FROM checkpoints";

pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

/// 数据库中的一行，JSON 列尚未解析
struct CheckpointRow {
    conversation_id: String,
    ordinal: i64,
    checkpoint_id: String,
    created_at: i64,
    snapshot: String,
    metadata: String,
}

impl CheckpointRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            conversation_id: row.get(0)?,
            ordinal: row.get(1)?,
            checkpoint_id: row.get(2)?,
            created_at: row.get(3)?,
            snapshot: row.get(4)?,
            metadata: row.get(5)?,
        })
    }

    fn decode(self) -> Result<Checkpoint, CheckpointError> {
        let created_at = Utc
            .timestamp_millis_opt(self.created_at)
            .single()
            .ok_or_else(|| CheckpointError::Storage(format!("invalid timestamp {}", self.created_at)))?;
        Ok(Checkpoint {
            conversation_id: self.conversation_id,
            checkpoint_id: self.checkpoint_id,
            ordinal: u64::try_from(self.ordinal)
                .map_err(|_| CheckpointError::Storage(format!("invalid ordinal {}", self.ordinal)))?,
            created_at,
            snapshot: serde_json::from_str(&self.snapshot)?,
            metadata: serde_json::from_str(&self.metadata)?,
        })
    }
}

impl SqliteCheckpointStore {
    /// 打开（必要时创建）数据库文件并建表
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| CheckpointError::Storage(e.to_string()))?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, CheckpointError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CheckpointError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, CheckpointError>
    where
        F: FnOnce(&mut Connection) -> Result<T, CheckpointError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CheckpointError::Storage("connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| CheckpointError::Storage(e.to_string()))?
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn append(
        &self,
        conversation_id: &str,
        snapshot: &ConversationState,
        metadata: CheckpointMetadata,
    ) -> Result<String, CheckpointError> {
        let snapshot_json = serde_json::to_string(snapshot)?;
        let metadata_json = serde_json::to_string(&metadata)?;
        let conversation_id = conversation_id.to_string();
        let checkpoint_id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now().timestamp_millis();

        let id = checkpoint_id.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let ordinal: i64 = tx.query_row(
                "SELECT COALESCE(MAX(ordinal), 0) + 1 FROM checkpoints WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO checkpoints
                 (conversation_id, ordinal, checkpoint_id, created_at, snapshot, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![conversation_id, ordinal, id, created_at, snapshot_json, metadata_json],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        Ok(checkpoint_id)
    }

    async fn latest(&self, conversation_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let mut rows = self.list(conversation_id, 1).await?;
        Ok(rows.pop())
    }

    async fn list(&self, conversation_id: &str, limit: usize) -> Result<Vec<Checkpoint>, CheckpointError> {
        let conversation_id = conversation_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE conversation_id = ?1 ORDER BY ordinal DESC LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![conversation_id, limit], CheckpointRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter().map(CheckpointRow::decode).collect()
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, CheckpointError> {
        let cutoff = cutoff.timestamp_millis();
        let removed = self
            .with_conn(move |conn| {
                Ok(conn.execute("DELETE FROM checkpoints WHERE created_at < ?1", params![cutoff])?)
            })
            .await?;
        if removed > 0 {
            tracing::info!("Pruned {} old checkpoints", removed);
        }
        Ok(removed)
    }
}
