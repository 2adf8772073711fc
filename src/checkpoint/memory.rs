//! 内存检查点存储：每个会话一把读写锁，会话之间互不阻塞

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;

use super::{Checkpoint, CheckpointError, CheckpointMetadata, CheckpointStore};
use crate::core::ConversationState;

type Log = Arc<RwLock<Vec<Checkpoint>>>;

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    logs: DashMap<String, Log>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, conversation_id: &str) -> Option<Log> {
        self.logs.get(conversation_id).map(|e| Arc::clone(e.value()))
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn append(
        &self,
        conversation_id: &str,
        snapshot: &ConversationState,
        metadata: CheckpointMetadata,
    ) -> Result<String, CheckpointError> {
        let log = Arc::clone(
            self.logs
                .entry(conversation_id.to_string())
                .or_default()
                .value(),
        );

        // 先在锁外构造完整的检查点，再一次性推入
        let checkpoint_id = uuid::Uuid::new_v4().to_string();
        let mut checkpoint = Checkpoint {
            conversation_id: conversation_id.to_string(),
            checkpoint_id: checkpoint_id.clone(),
            ordinal: 0,
            created_at: Utc::now(),
            snapshot: snapshot.clone(),
            metadata,
        };

        let mut entries = log.write().await;
        checkpoint.ordinal = entries.last().map_or(1, |c| c.ordinal + 1);
        entries.push(checkpoint);
        Ok(checkpoint_id)
    }

    async fn latest(&self, conversation_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let Some(log) = self.log(conversation_id) else {
            return Ok(None);
        };
        let entries = log.read().await;
        Ok(entries.last().cloned())
    }

    async fn list(&self, conversation_id: &str, limit: usize) -> Result<Vec<Checkpoint>, CheckpointError> {
        let Some(log) = self.log(conversation_id) else {
            return Ok(Vec::new());
        };
        let entries = log.read().await;
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, CheckpointError> {
        let logs: Vec<Log> = self.logs.iter().map(|e| Arc::clone(e.value())).collect();
        let mut removed = 0;
        for log in logs {
            let mut entries = log.write().await;
            let before = entries.len();
            entries.retain(|c| c.created_at >= cutoff);
            removed += before - entries.len();
        }
        // 清空的会话整体移除；别处还持有引用（正在 append）的留到下次
        self.logs.retain(|_, log| {
            Arc::strong_count(log) > 1 || log.try_read().map(|entries| !entries.is_empty()).unwrap_or(true)
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::contract;
    use crate::core::Phase;

    #[tokio::test]
    async fn test_latest_returns_nth_append() {
        contract::latest_returns_nth_append(&InMemoryCheckpointStore::new()).await;
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        contract::list_is_newest_first(&InMemoryCheckpointStore::new()).await;
    }

    #[tokio::test]
    async fn test_metadata_round_trips() {
        contract::metadata_round_trips(&InMemoryCheckpointStore::new()).await;
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_distinct_ordinals() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut handles = Vec::new();
        for n in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let state = contract::sample_state("c", n);
                store
                    .append("c", &state, CheckpointMetadata::new("r", Phase::Planning))
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let mut ordinals: Vec<u64> = store
            .list("c", 100)
            .await
            .unwrap()
            .iter()
            .map(|c| c.ordinal)
            .collect();
        ordinals.sort_unstable();
        assert_eq!(ordinals, (1..=20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_prune_before() {
        let store = InMemoryCheckpointStore::new();
        store
            .append("c", &contract::sample_state("c", 1), CheckpointMetadata::new("r", Phase::Complete))
            .await
            .unwrap();
        let removed = store.prune_before(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.latest("c").await.unwrap().is_none());
        assert!(store.logs.is_empty());
    }
}
