//! 任务登记表
//!
//! 每一轮编排在这里登记一条 TaskRecord，随阶段推进更新状态。
//!
//! 核心约束：
//! - 状态迁移按固定表校验，非法迁移返回 InvalidTransition，记录保持不变
//! - 按 task_id 串行化修改（每条记录一把锁，没有全局锁）
//! - 登记数量有上限，超过时拒绝创建

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::core::FailureClass;

/// 任务 ID
pub type TaskId = String;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 已登记，尚未开始
    Pending,
    /// 正在编排
    Processing,
    /// 已完成
    Completed,
    /// 执行失败
    Failed,
    /// 已取消
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 迁移表：Pending→{Processing,Cancelled}；Processing→{Completed,Failed,Cancelled}；终态无出边
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Processing)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Processing, TaskStatus::Completed)
                | (TaskStatus::Processing, TaskStatus::Failed)
                | (TaskStatus::Processing, TaskStatus::Cancelled)
        )
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Some(TaskStatus::Pending),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" | "canceled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }
}

/// 任务登记表错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error("Invalid transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task limit exceeded ({limit} tracked tasks)")]
    LimitExceeded { limit: usize },
}

impl TaskError {
    pub fn classify(&self) -> FailureClass {
        match self {
            TaskError::NotFound(_) | TaskError::InvalidTransition { .. } => FailureClass::FixInput,
            TaskError::LimitExceeded { .. } => FailureClass::Retry,
        }
    }
}

/// 一条任务记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub conversation_id: String,
    pub status: TaskStatus,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    fn new(conversation_id: &str, input: String) -> Self {
        let now = Utc::now();
        Self {
            task_id: format!("task_{}", uuid::Uuid::new_v4()),
            conversation_id: conversation_id.to_string(),
            status: TaskStatus::Pending,
            input,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 并发安全的任务登记表
pub struct TaskRegistry {
    tasks: DashMap<TaskId, Arc<Mutex<TaskRecord>>>,
    /// 已占用的名额（含正在创建中的）
    tracked: AtomicUsize,
    max_tasks: usize,
}

impl TaskRegistry {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            tasks: DashMap::new(),
            tracked: AtomicUsize::new(0),
            max_tasks: max_tasks.max(1),
        }
    }

    /// 登记新任务（Pending）；超过上限时返回 LimitExceeded
    pub fn create(&self, conversation_id: &str, input: impl Into<String>) -> Result<TaskRecord, TaskError> {
        let limit = self.max_tasks;
        self.tracked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| TaskError::LimitExceeded { limit })?;

        let record = TaskRecord::new(conversation_id, input.into());
        self.tasks
            .insert(record.task_id.clone(), Arc::new(Mutex::new(record.clone())));
        tracing::debug!(task_id = %record.task_id, "Created task");
        Ok(record)
    }

    fn entry(&self, task_id: &str) -> Result<Arc<Mutex<TaskRecord>>, TaskError> {
        self.tasks
            .get(task_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
    }

    /// 更新状态；非法迁移被拒绝且记录不变
    pub async fn update_status(
        &self,
        task_id: &str,
        new_status: TaskStatus,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<TaskRecord, TaskError> {
        let entry = self.entry(task_id)?;
        let mut task = entry.lock().await;

        if !task.status.can_transition_to(new_status) {
            return Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status,
                to: new_status,
            });
        }

        task.status = new_status;
        task.updated_at = Utc::now();
        if output.is_some() {
            task.output = output;
        }
        if error.is_some() {
            task.error = error;
        }
        tracing::info!(task_id, status = ?new_status, "Updated task");
        Ok(task.clone())
    }

    /// 取消任务（Pending / Processing 均可）
    pub async fn cancel(&self, task_id: &str) -> Result<TaskRecord, TaskError> {
        self.update_status(task_id, TaskStatus::Cancelled, None, None)
            .await
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskRecord> {
        let entry = self.entry(task_id).ok()?;
        let task = entry.lock().await;
        Some(task.clone())
    }

    /// 按创建时间倒序列出，可按状态过滤
    pub async fn list(&self, status_filter: Option<TaskStatus>, limit: usize) -> Vec<TaskRecord> {
        let entries: Vec<_> = self.tasks.iter().map(|e| Arc::clone(e.value())).collect();

        let mut tasks = Vec::with_capacity(entries.len());
        for entry in entries {
            let task = entry.lock().await.clone();
            if status_filter.map_or(true, |s| task.status == s) {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        tasks
    }

    /// 清理终态且超过保留时长的任务，返回清理条数
    pub async fn cleanup_finished(&self, max_age: Duration) -> usize {
        let max_age =
            chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::weeks(5200));
        let cutoff = Utc::now() - max_age;

        let entries: Vec<_> = self
            .tasks
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut removed = 0;
        for (task_id, entry) in entries {
            let task = entry.lock().await;
            if task.status.is_terminal() && task.updated_at <= cutoff {
                drop(task);
                if self.tasks.remove(&task_id).is_some() {
                    self.tracked.fetch_sub(1, Ordering::AcqRel);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!("Cleaned up {} finished tasks", removed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new(1000)
    }
}
