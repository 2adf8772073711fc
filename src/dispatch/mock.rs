//! Mock Worker 客户端（用于测试与离线模式，无需真实 Agent）
//!
//! 每个 endpoint 可单独配置：延迟、第几次查询完成、永不完成、前 K 次提交 / 查询失败、远程失败。
//! 未配置的 endpoint 立即完成，并回显子请求。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::client::{RemoteTaskSnapshot, RemoteTaskState, WorkerClient, WorkerError};

/// 任务结束时的结果
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// 以 "[endpoint] 子请求" 回显
    Echo,
    Reply(String),
    Fail(String),
}

/// 单个 endpoint 的行为
#[derive(Debug, Clone)]
pub struct MockEndpoint {
    /// 每次 submit / poll 的延迟
    pub latency: Duration,
    /// 第几次 poll 时完成；Some(0) 表示 submit 即完成，None 表示永不完成
    pub complete_after_polls: Option<u32>,
    /// 前 K 次 submit 返回网络错误
    pub failing_submits: u32,
    /// 前 K 次 poll 返回网络错误（不推进任务进度）
    pub failing_polls: u32,
    pub outcome: MockOutcome,
}

impl Default for MockEndpoint {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            complete_after_polls: Some(0),
            failing_submits: 0,
            failing_polls: 0,
            outcome: MockOutcome::Echo,
        }
    }
}

impl MockEndpoint {
    pub fn replying(text: impl Into<String>) -> Self {
        Self {
            outcome: MockOutcome::Reply(text.into()),
            ..Default::default()
        }
    }

    pub fn remote_failure(reason: impl Into<String>) -> Self {
        Self {
            outcome: MockOutcome::Fail(reason.into()),
            ..Default::default()
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn after_polls(mut self, polls: u32) -> Self {
        self.complete_after_polls = Some(polls);
        self
    }

    pub fn never_completes(mut self) -> Self {
        self.complete_after_polls = None;
        self
    }

    pub fn failing_submits(mut self, count: u32) -> Self {
        self.failing_submits = count;
        self
    }

    pub fn failing_polls(mut self, count: u32) -> Self {
        self.failing_polls = count;
        self
    }
}

struct MockTask {
    endpoint: String,
    request: String,
    polls: u32,
}

/// Mock 客户端
#[derive(Default)]
pub struct MockWorkerClient {
    endpoints: HashMap<String, MockEndpoint>,
    tasks: DashMap<String, MockTask>,
    submit_attempts: DashMap<String, AtomicU32>,
    poll_counts: DashMap<String, AtomicU32>,
}

impl MockWorkerClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>, behavior: MockEndpoint) -> Self {
        self.endpoints.insert(endpoint.into(), behavior);
        self
    }

    /// 某 endpoint 收到的 submit 次数（含失败）；poll_count 同理
    pub fn submit_count(&self, endpoint: &str) -> u32 {
        self.submit_attempts
            .get(endpoint)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    pub fn poll_count(&self, endpoint: &str) -> u32 {
        self.poll_counts
            .get(endpoint)
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }

    fn behavior(&self, endpoint: &str) -> MockEndpoint {
        self.endpoints.get(endpoint).cloned().unwrap_or_default()
    }

    fn bump(counter: &DashMap<String, AtomicU32>, endpoint: &str) -> u32 {
        counter
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicU32::new(0))
            .fetch_add(1, Ordering::SeqCst)
            + 1
    }

    fn finished(task_id: &str, endpoint: &str, request: &str, outcome: &MockOutcome) -> RemoteTaskSnapshot {
        match outcome {
            MockOutcome::Echo => RemoteTaskSnapshot::new(task_id, RemoteTaskState::Completed)
                .with_parts(vec![format!("[{}] {}", endpoint, request)]),
            MockOutcome::Reply(text) => {
                RemoteTaskSnapshot::new(task_id, RemoteTaskState::Completed).with_parts(vec![text.clone()])
            }
            MockOutcome::Fail(reason) => {
                RemoteTaskSnapshot::new(task_id, RemoteTaskState::Failed).with_error(reason.clone())
            }
        }
    }
}

#[async_trait]
impl WorkerClient for MockWorkerClient {
    async fn submit(
        &self,
        endpoint: &str,
        text: &str,
        _conversation_id: &str,
    ) -> Result<RemoteTaskSnapshot, WorkerError> {
        let behavior = self.behavior(endpoint);
        if !behavior.latency.is_zero() {
            tokio::time::sleep(behavior.latency).await;
        }

        let attempt = Self::bump(&self.submit_attempts, endpoint);
        if attempt <= behavior.failing_submits {
            return Err(WorkerError::Transport("connection refused".into()));
        }

        let task_id = format!("mock-{}", uuid::Uuid::new_v4());
        if behavior.complete_after_polls == Some(0) {
            return Ok(Self::finished(&task_id, endpoint, text, &behavior.outcome));
        }

        self.tasks.insert(
            task_id.clone(),
            MockTask {
                endpoint: endpoint.to_string(),
                request: text.to_string(),
                polls: 0,
            },
        );
        Ok(RemoteTaskSnapshot::new(task_id, RemoteTaskState::Submitted))
    }

    async fn poll(&self, endpoint: &str, remote_task_id: &str) -> Result<RemoteTaskSnapshot, WorkerError> {
        let behavior = self.behavior(endpoint);
        if !behavior.latency.is_zero() {
            tokio::time::sleep(behavior.latency).await;
        }
        let attempt = Self::bump(&self.poll_counts, endpoint);
        if attempt <= behavior.failing_polls {
            return Err(WorkerError::Transport("connection reset".into()));
        }

        let (polls, request) = {
            let mut task = self
                .tasks
                .get_mut(remote_task_id)
                .filter(|t| t.endpoint == endpoint)
                .ok_or_else(|| WorkerError::Protocol(format!("task {} not found", remote_task_id)))?;
            task.polls += 1;
            (task.polls, task.request.clone())
        };

        match behavior.complete_after_polls {
            Some(n) if polls >= n => {
                self.tasks.remove(remote_task_id);
                Ok(Self::finished(remote_task_id, endpoint, &request, &behavior.outcome))
            }
            _ => Ok(RemoteTaskSnapshot::new(remote_task_id, RemoteTaskState::Working)),
        }
    }
}

impl std::fmt::Debug for MockWorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockWorkerClient")
            .field("endpoints", &self.endpoints.keys().collect::<Vec<_>>())
            .field("in_flight", &self.tasks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_endpoint_echoes_immediately() {
        let client = MockWorkerClient::new();
        let snapshot = client.submit("http://a", "hello", "c").await.unwrap();
        assert_eq!(snapshot.state, RemoteTaskState::Completed);
        assert_eq!(snapshot.result_text(), "[http://a] hello");
    }

    #[tokio::test]
    async fn test_completes_after_polls() {
        let client = MockWorkerClient::new().with_endpoint("a", MockEndpoint::replying("done").after_polls(2));
        let submitted = client.submit("a", "x", "c").await.unwrap();
        assert!(!submitted.state.is_terminal());

        let first = client.poll("a", &submitted.remote_task_id).await.unwrap();
        assert_eq!(first.state, RemoteTaskState::Working);
        let second = client.poll("a", &submitted.remote_task_id).await.unwrap();
        assert_eq!(second.result_text(), "done");
        assert_eq!(client.poll_count("a"), 2);
    }

    #[tokio::test]
    async fn test_failing_submits() {
        let client = MockWorkerClient::new().with_endpoint("a", MockEndpoint::default().failing_submits(1));
        assert!(client.submit("a", "x", "c").await.is_err());
        assert!(client.submit("a", "x", "c").await.is_ok());
        assert_eq!(client.submit_count("a"), 2);
    }

    #[tokio::test]
    async fn test_failing_polls_do_not_advance_task() {
        let client = MockWorkerClient::new()
            .with_endpoint("a", MockEndpoint::replying("done").after_polls(1).failing_polls(1));
        let submitted = client.submit("a", "x", "c").await.unwrap();
        assert!(client.poll("a", &submitted.remote_task_id).await.is_err());
        let snapshot = client.poll("a", &submitted.remote_task_id).await.unwrap();
        assert_eq!(snapshot.result_text(), "done");
        assert_eq!(client.poll_count("a"), 2);
    }
}
