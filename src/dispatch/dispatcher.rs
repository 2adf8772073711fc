//! 远程调用派发：提交子任务并轮询到终态
//!
//! 三层超时都是软的：单次请求超时、轮询次数上限、整轮运行的截止时间（由取消令牌传入），
//! 到期只会得到一条 Failed 记录。每次调用互相独立，某个 endpoint 的失败不影响其它调用。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::client::{RemoteTaskSnapshot, WorkerClient, WorkerError};
use crate::config::DispatchSection;
use crate::core::RemoteCallRecord;

/// 派发策略
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    /// submit / poll 网络错误的额外重试次数
    pub max_network_retries: u32,
    pub request_timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from(&DispatchSection::default())
    }
}

impl From<&DispatchSection> for DispatchPolicy {
    fn from(cfg: &DispatchSection) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            max_poll_attempts: cfg.max_poll_attempts.max(1),
            max_network_retries: cfg.max_network_retries,
            request_timeout: cfg.request_timeout(),
            retry_backoff: Duration::from_millis(200),
        }
    }
}

pub struct Dispatcher {
    client: Arc<dyn WorkerClient>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn WorkerClient>, policy: DispatchPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// 调用一次远程 Agent，总是返回终态记录
    pub async fn invoke(&self, endpoint: &str, sub_request: &str, conversation_id: &str) -> RemoteCallRecord {
        self.invoke_cancellable(endpoint, sub_request, conversation_id, &CancellationToken::new())
            .await
    }

    /// 同 invoke；令牌取消后在当前这次轮询结束时放弃
    pub async fn invoke_cancellable(
        &self,
        endpoint: &str,
        sub_request: &str,
        conversation_id: &str,
        cancel: &CancellationToken,
    ) -> RemoteCallRecord {
        tracing::info!(conversation_id, endpoint, "Dispatching sub-request");

        let submitted = self
            .with_retries("submit", endpoint, cancel, || {
                self.client.submit(endpoint, sub_request, conversation_id)
            })
            .await;
        let mut snapshot = match submitted {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(endpoint, "Submit failed: {}", e);
                return RemoteCallRecord::failed(endpoint, "", format!("submit failed: {}", e));
            }
        };

        let remote_task_id = snapshot.remote_task_id.clone();
        let mut attempts = 0;
        while !snapshot.state.is_terminal() {
            if attempts >= self.policy.max_poll_attempts {
                tracing::warn!(
                    endpoint,
                    remote_task_id = %remote_task_id,
                    "Remote task did not finish within {} poll attempts",
                    self.policy.max_poll_attempts
                );
                return RemoteCallRecord::failed(
                    endpoint,
                    &remote_task_id,
                    format!("timed out after {} poll attempts", self.policy.max_poll_attempts),
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return RemoteCallRecord::failed(endpoint, &remote_task_id, "cancelled");
                }
                _ = tokio::time::sleep(self.policy.poll_interval) => {}
            }
            attempts += 1;

            snapshot = match self
                .with_retries("poll", endpoint, cancel, || self.client.poll(endpoint, &remote_task_id))
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(endpoint, remote_task_id = %remote_task_id, "Poll failed: {}", e);
                    return RemoteCallRecord::failed(endpoint, &remote_task_id, format!("poll failed: {}", e));
                }
            };
            tracing::debug!(
                endpoint,
                remote_task_id = %remote_task_id,
                attempt = attempts,
                state = snapshot.state.as_str(),
                "Polled remote task"
            );
        }

        finish(endpoint, snapshot)
    }

    /// 单次请求带超时；可重试的错误按退避重试若干次
    async fn with_retries<F, Fut>(
        &self,
        op: &str,
        endpoint: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<RemoteTaskSnapshot, WorkerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<RemoteTaskSnapshot, WorkerError>>,
    {
        let mut retries = 0;
        loop {
            let result = match tokio::time::timeout(self.policy.request_timeout, call()).await {
                Ok(r) => r,
                Err(_) => Err(WorkerError::Timeout),
            };
            match result {
                Err(e) if e.is_retryable() && retries < self.policy.max_network_retries => {
                    retries += 1;
                    tracing::warn!(endpoint, "{} failed ({}), retry {}/{}", op, e, retries, self.policy.max_network_retries);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(self.policy.retry_backoff * retries) => {}
                    }
                }
                other => return other,
            }
        }
    }
}

fn finish(endpoint: &str, snapshot: RemoteTaskSnapshot) -> RemoteCallRecord {
    if snapshot.state.is_success() {
        tracing::info!(endpoint, remote_task_id = %snapshot.remote_task_id, "Remote task completed");
        let result = snapshot.result_text();
        RemoteCallRecord::completed(endpoint, &snapshot.remote_task_id, result)
    } else {
        let reason = snapshot
            .error
            .clone()
            .unwrap_or_else(|| format!("remote task {}", snapshot.state.as_str()));
        tracing::warn!(endpoint, remote_task_id = %snapshot.remote_task_id, "Remote task failed: {}", reason);
        RemoteCallRecord::failed(endpoint, &snapshot.remote_task_id, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CallStatus;
    use crate::dispatch::mock::{MockEndpoint, MockWorkerClient};

    fn policy(interval_ms: u64, attempts: u32) -> DispatchPolicy {
        DispatchPolicy {
            poll_interval: Duration::from_millis(interval_ms),
            max_poll_attempts: attempts,
            max_network_retries: 2,
            request_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_completes_after_polling() {
        let mock = Arc::new(MockWorkerClient::new().with_endpoint("a", MockEndpoint::replying("ok").after_polls(3)));
        let dispatcher = Dispatcher::new(mock.clone(), policy(5, 10));

        let record = dispatcher.invoke("a", "do it", "c").await;
        assert_eq!(record.status, CallStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("ok"));
        assert_eq!(mock.poll_count("a"), 3);
    }

    #[tokio::test]
    async fn test_terminal_submit_skips_polling() {
        let mock = Arc::new(MockWorkerClient::new());
        let dispatcher = Dispatcher::new(mock.clone(), policy(5, 10));
        let record = dispatcher.invoke("a", "hi", "c").await;
        assert!(record.is_success());
        assert_eq!(mock.poll_count("a"), 0);
    }

    #[tokio::test]
    async fn test_poll_budget_exceeded_is_timeout_failure() {
        let mock = Arc::new(MockWorkerClient::new().with_endpoint("slow", MockEndpoint::default().never_completes()));
        let dispatcher = Dispatcher::new(mock.clone(), policy(5, 4));

        let record = dispatcher.invoke("slow", "x", "c").await;
        assert_eq!(record.status, CallStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("timed out after 4 poll attempts"));
        assert!(!record.remote_task_id.is_empty());
        assert_eq!(mock.poll_count("slow"), 4);
    }

    #[tokio::test]
    async fn test_submit_network_errors_are_retried() {
        let mock = Arc::new(MockWorkerClient::new().with_endpoint("a", MockEndpoint::replying("ok").failing_submits(2)));
        let dispatcher = Dispatcher::new(mock.clone(), policy(5, 3));
        let record = dispatcher.invoke("a", "x", "c").await;
        assert!(record.is_success());
        assert_eq!(mock.submit_count("a"), 3);
    }

    #[tokio::test]
    async fn test_submit_retries_are_bounded() {
        let mock = Arc::new(MockWorkerClient::new().with_endpoint("a", MockEndpoint::default().failing_submits(10)));
        let dispatcher = Dispatcher::new(mock.clone(), policy(5, 3));
        let record = dispatcher.invoke("a", "x", "c").await;
        assert_eq!(record.status, CallStatus::Failed);
        assert!(record.error.as_deref().unwrap().starts_with("submit failed"));
        assert_eq!(mock.submit_count("a"), 3);
    }

    #[tokio::test]
    async fn test_poll_network_errors_are_retried() {
        let mock = Arc::new(
            MockWorkerClient::new().with_endpoint("a", MockEndpoint::replying("ok").after_polls(1).failing_polls(2)),
        );
        let dispatcher = Dispatcher::new(mock.clone(), policy(5, 3));
        let record = dispatcher.invoke("a", "x", "c").await;
        assert_eq!(record.status, CallStatus::Completed);
        assert_eq!(record.result.as_deref(), Some("ok"));
        // 两次失败的重试不占轮询预算
        assert_eq!(mock.poll_count("a"), 3);
    }

    #[tokio::test]
    async fn test_poll_retries_are_bounded() {
        let mock = Arc::new(
            MockWorkerClient::new().with_endpoint("a", MockEndpoint::replying("ok").after_polls(1).failing_polls(10)),
        );
        let dispatcher = Dispatcher::new(mock.clone(), policy(5, 10));
        let record = dispatcher.invoke("a", "x", "c").await;
        assert_eq!(record.status, CallStatus::Failed);
        assert!(record.error.as_deref().unwrap().starts_with("poll failed"));
        assert!(!record.remote_task_id.is_empty());
        assert_eq!(mock.poll_count("a"), 3);
    }

    #[tokio::test]
    async fn test_remote_failure_reason_is_recorded() {
        let mock = Arc::new(
            MockWorkerClient::new().with_endpoint("a", MockEndpoint::remote_failure("rate API down").after_polls(1)),
        );
        let dispatcher = Dispatcher::new(mock, policy(5, 3));
        let record = dispatcher.invoke("a", "x", "c").await;
        assert_eq!(record.status, CallStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("rate API down"));
    }

    #[tokio::test]
    async fn test_parallel_calls_are_isolated() {
        let mock = Arc::new(
            MockWorkerClient::new()
                .with_endpoint("stuck", MockEndpoint::default().never_completes())
                .with_endpoint(
                    "fast",
                    MockEndpoint::replying("42").with_latency(Duration::from_millis(400)),
                ),
        );
        // stuck: 4 次 × 100ms 后超时；fast: 约 400ms 完成
        let dispatcher = Dispatcher::new(mock, policy(100, 4));

        let started = std::time::Instant::now();
        let (stuck, fast) = tokio::join!(
            dispatcher.invoke("stuck", "x", "c"),
            dispatcher.invoke("fast", "y", "c"),
        );
        let elapsed = started.elapsed();

        assert_eq!(fast.status, CallStatus::Completed);
        assert_eq!(fast.result.as_deref(), Some("42"));
        assert_eq!(stuck.status, CallStatus::Failed);
        assert!(elapsed < Duration::from_millis(750), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_cancel_abandons_polling() {
        let mock = Arc::new(MockWorkerClient::new().with_endpoint("slow", MockEndpoint::default().never_completes()));
        let dispatcher = Dispatcher::new(mock, policy(50, 100));
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            canceller.cancel();
        });

        let record = dispatcher.invoke_cancellable("slow", "x", "c", &token).await;
        assert_eq!(record.status, CallStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("cancelled"));
    }
}
