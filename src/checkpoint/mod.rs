//! 检查点存储抽象层
//!
//! 每个 conversation_id 一条只追加的快照日志；latest = 序号最大者。
//! 内存与 SQLite 两种实现共享同一接口，追加是原子的：读者看不到写了一半的检查点。

pub mod memory;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{CheckpointBackend, CheckpointSection};
use crate::core::{ConversationState, Phase};

pub use memory::InMemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

/// 检查点存储错误
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for CheckpointError {
    fn from(e: rusqlite::Error) -> Self {
        CheckpointError::Storage(e.to_string())
    }
}

/// 检查点附带的元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// 产生该快照的那一轮运行（即 TaskRegistry 中的 task_id）
    pub run_id: String,
    pub phase: Phase,
    /// 本阶段是否走了降级路径（兜底路由 / 兜底汇总）
    #[serde(default)]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl CheckpointMetadata {
    pub fn new(run_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            run_id: run_id.into(),
            phase,
            degraded: false,
            note: None,
        }
    }

    pub fn degraded(mut self, degraded: bool) -> Self {
        self.degraded = degraded;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// 一个不可变的会话快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub conversation_id: String,
    pub checkpoint_id: String,
    /// 会话内单调递增，从 1 开始
    pub ordinal: u64,
    pub created_at: DateTime<Utc>,
    pub snapshot: ConversationState,
    pub metadata: CheckpointMetadata,
}

/// 检查点存储接口
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 追加一个快照，返回 checkpoint_id
    async fn append(
        &self,
        conversation_id: &str,
        snapshot: &ConversationState,
        metadata: CheckpointMetadata,
    ) -> Result<String, CheckpointError>;

    /// 序号最大的检查点
    async fn latest(&self, conversation_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// 按序号倒序列出，最多 limit 条
    async fn list(&self, conversation_id: &str, limit: usize) -> Result<Vec<Checkpoint>, CheckpointError>;

    /// 删除早于 cutoff 的检查点，返回删除条数
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, CheckpointError>;
}

/// 导出某会话的全部检查点（JSON，按序号升序）
pub async fn export_history(
    store: &dyn CheckpointStore,
    conversation_id: &str,
) -> Result<String, CheckpointError> {
    let mut checkpoints = store.list(conversation_id, usize::MAX).await?;
    checkpoints.reverse();

    let history = serde_json::json!({
        "conversation_id": conversation_id,
        "exported_at": Utc::now().to_rfc3339(),
        "checkpoints": checkpoints,
    });
    Ok(serde_json::to_string_pretty(&history)?)
}

/// 创建检查点存储
///
/// 配置为 sqlite 时打开（必要时创建）数据库文件；失败时回退到内存存储
pub fn create_checkpoint_store(cfg: &CheckpointSection) -> Arc<dyn CheckpointStore> {
    if cfg.backend == CheckpointBackend::Sqlite {
        let default_path = Path::new("data").join("checkpoints.db");
        let path = cfg.path.as_deref().unwrap_or(&default_path);
        match SqliteCheckpointStore::open(path) {
            Ok(store) => {
                tracing::info!("Using SQLite checkpoint store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite checkpoint store, falling back to memory: {}", e);
            }
        }
    }

    tracing::info!("Using in-memory checkpoint store");
    Arc::new(InMemoryCheckpointStore::new())
}

/// 两种后端共用的契约测试
#[cfg(test)]
pub(crate) mod contract {
    use super::*;
    use crate::core::{CallStatus, Message, RemoteCallRecord, RoutedTask};

    pub fn sample_state(conversation_id: &str, n: usize) -> ConversationState {
        let mut state = ConversationState::new(conversation_id, format!("request #{n}"));
        state.plan = Some(format!("plan #{n}"));
        state.routing_decision = Some(vec![RoutedTask {
            target_agent: "http://agent".into(),
            sub_request: format!("sub #{n}"),
            parallel: n % 2 == 0,
        }]);
        state.remote_calls = vec![RemoteCallRecord {
            agent_endpoint: "http://agent".into(),
            remote_task_id: format!("rt-{n}"),
            status: CallStatus::Completed,
            result: Some("ok".into()),
            error: None,
        }];
        state.message_history.push(Message::assistant(format!("answer #{n}")));
        state.phase = Phase::Complete;
        state
    }

    pub async fn latest_returns_nth_append(store: &dyn CheckpointStore) {
        assert!(store.latest("conv").await.unwrap().is_none());

        let mut ids = Vec::new();
        for n in 1..=5 {
            let state = sample_state("conv", n);
            let id = store
                .append("conv", &state, CheckpointMetadata::new("run", state.phase))
                .await
                .unwrap();
            ids.push(id);

            let latest = store.latest("conv").await.unwrap().unwrap();
            assert_eq!(latest.ordinal, n as u64);
            assert_eq!(latest.snapshot, state);
            assert_eq!(latest.checkpoint_id, ids[n - 1]);
        }

        // 其它会话互不影响
        store
            .append("other", &sample_state("other", 9), CheckpointMetadata::new("r", Phase::Planning))
            .await
            .unwrap();
        let latest = store.latest("conv").await.unwrap().unwrap();
        assert_eq!(latest.ordinal, 5);
    }

    pub async fn list_is_newest_first(store: &dyn CheckpointStore) {
        for n in 1..=4 {
            store
                .append("c", &sample_state("c", n), CheckpointMetadata::new("run", Phase::Complete))
                .await
                .unwrap();
        }
        let listed = store.list("c", 3).await.unwrap();
        let ordinals: Vec<u64> = listed.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![4, 3, 2]);
        assert!(store.list("missing", 10).await.unwrap().is_empty());
    }

    pub async fn metadata_round_trips(store: &dyn CheckpointStore) {
        let meta = CheckpointMetadata::new("run-1", Phase::Routing)
            .degraded(true)
            .with_note("keyword fallback");
        store
            .append("m", &ConversationState::new("m", "hi"), meta.clone())
            .await
            .unwrap();
        let latest = store.latest("m").await.unwrap().unwrap();
        assert_eq!(latest.metadata, meta);
        assert_eq!(latest.conversation_id, "m");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use crate::core::{
        CallStatus, FailureClass, Message, RemoteCallRecord, Role, RoutedTask, RunFailure,
    };

    fn arb_phase() -> impl Strategy<Value = Phase> {
        prop_oneof![
            Just(Phase::Planning),
            Just(Phase::Routing),
            Just(Phase::Executing),
            Just(Phase::Aggregating),
            Just(Phase::Complete),
            Just(Phase::Error),
        ]
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        (
            prop_oneof![Just(Role::User), Just(Role::Assistant), Just(Role::System)],
            ".*",
        )
            .prop_map(|(role, content)| Message { role, content })
    }

    fn arb_call() -> impl Strategy<Value = RemoteCallRecord> {
        (
            ".*",
            ".*",
            prop_oneof![
                Just(CallStatus::Pending),
                Just(CallStatus::InProgress),
                Just(CallStatus::Completed),
                Just(CallStatus::Failed),
            ],
            proptest::option::of(".*"),
            proptest::option::of(".*"),
        )
            .prop_map(|(agent_endpoint, remote_task_id, status, result, error)| RemoteCallRecord {
                agent_endpoint,
                remote_task_id,
                status,
                result,
                error,
            })
    }

    fn arb_state() -> impl Strategy<Value = ConversationState> {
        (
            "[a-z0-9-]{1,16}",
            proptest::collection::vec(arb_message(), 0..4),
            proptest::option::of(".*"),
            proptest::option::of(proptest::collection::vec(
                (".*", ".*", any::<bool>()).prop_map(|(target_agent, sub_request, parallel)| {
                    RoutedTask {
                        target_agent,
                        sub_request,
                        parallel,
                    }
                }),
                0..3,
            )),
            proptest::collection::vec(arb_call(), 0..3),
            proptest::option::of(".*"),
            arb_phase(),
            proptest::option::of(".*".prop_map(|message| RunFailure {
                class: FailureClass::Degraded,
                message,
            })),
        )
            .prop_map(
                |(
                    conversation_id,
                    message_history,
                    plan,
                    routing_decision,
                    remote_calls,
                    aggregated_result,
                    phase,
                    error,
                )| ConversationState {
                    conversation_id,
                    message_history,
                    plan,
                    routing_decision,
                    remote_calls,
                    aggregated_result,
                    phase,
                    error,
                },
            )
    }

    proptest! {
        #[test]
        fn prop_snapshot_serde_round_trip(state in arb_state()) {
            let json = serde_json::to_string(&state).unwrap();
            let back: ConversationState = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, state);
        }

        #[test]
        fn prop_sqlite_round_trip(state in arb_state()) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let store = SqliteCheckpointStore::open_in_memory().unwrap();
            let id = state.conversation_id.clone();
            let loaded = rt.block_on(async {
                store.append(&id, &state, CheckpointMetadata::new("run", state.phase)).await.unwrap();
                store.latest(&id).await.unwrap().unwrap()
            });
            prop_assert_eq!(loaded.snapshot, state);
        }
    }

    #[test]
    fn test_empty_state_round_trip() {
        let state = ConversationState::new("c", "");
        let json = serde_json::to_string(&state).unwrap();
        let back: ConversationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert!(back.routing_decision.is_none());
        assert!(back.remote_calls.is_empty());
    }

    #[tokio::test]
    async fn test_export_history_in_ordinal_order() {
        let store = InMemoryCheckpointStore::new();
        for n in 1..=3 {
            store
                .append("c", &contract::sample_state("c", n), CheckpointMetadata::new("r", Phase::Complete))
                .await
                .unwrap();
        }
        let exported = export_history(&store, "c").await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&exported).unwrap();
        assert_eq!(value["conversation_id"], "c");
        let ordinals: Vec<u64> = value["checkpoints"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["ordinal"].as_u64().unwrap())
            .collect();
        assert_eq!(ordinals, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_factory_falls_back_to_memory() {
        let cfg = CheckpointSection {
            backend: CheckpointBackend::Sqlite,
            path: Some("/nonexistent-dir/\0/bad.db".into()),
            ..Default::default()
        };
        // 打开失败时不 panic，退回的内存实现照常可用
        let store = create_checkpoint_store(&cfg);
        contract::latest_returns_nth_append(store.as_ref()).await;
        assert_eq!(store.list("conv", 10).await.unwrap().len(), 5);
    }
}
