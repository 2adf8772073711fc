//! 远程调用并发限制
//!
//! 所有会话共享一个 Semaphore，限制同时在途的远程调用数；许可随调用结束自动归还。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 调用调度器
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    /// 远程调用并发限制（默认 4）
    call_semaphore: Arc<Semaphore>,
    max_parallel: usize,
}

impl TaskScheduler {
    pub fn new(max_parallel_calls: usize) -> Self {
        let max_parallel = max_parallel_calls.max(1);
        Self {
            call_semaphore: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
        }
    }

    /// 获取一次远程调用的许可；调度器关闭后返回 None
    pub async fn acquire_call(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.call_semaphore).acquire_owned().await.ok()
    }

    pub fn available(&self) -> usize {
        self.call_semaphore.available_permits()
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// 关闭后所有等待中的 acquire 立即返回 None
    pub fn close(&self) {
        self.call_semaphore.close();
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}
