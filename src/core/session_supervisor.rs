//! 会话监管：每个会话至多一个在途运行
//!
//! 每次运行持有一个 CancellationToken；cancel 只触发令牌，由编排循环在阶段之间与轮询间隙检查。
//! 若配置了整轮超时，截止时由后台任务触发同一令牌。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::core::OrchestratorError;

/// 运行结束的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    DeadlineExceeded,
}

struct ActiveRun {
    token: CancellationToken,
    deadline_hit: Arc<AtomicBool>,
}

/// 会话级生命周期管理
#[derive(Default)]
pub struct SessionSupervisor {
    runs: DashMap<String, ActiveRun>,
}

/// 一次运行的句柄；drop 时自动登记结束
pub struct RunGuard {
    supervisor: Arc<SessionSupervisor>,
    conversation_id: String,
    token: CancellationToken,
    deadline_hit: Arc<AtomicBool>,
}

impl RunGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// 子 token（用于单个远程调用）
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        if !self.token.is_cancelled() {
            None
        } else if self.deadline_hit.load(Ordering::Acquire) {
            Some(StopReason::DeadlineExceeded)
        } else {
            Some(StopReason::Cancelled)
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.supervisor.finish(&self.conversation_id, self);
    }
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一次运行；同一会话已有在途运行时返回 ConversationBusy
    pub fn begin(
        self: &Arc<Self>,
        conversation_id: &str,
        deadline: Option<Duration>,
    ) -> Result<RunGuard, OrchestratorError> {
        let token = CancellationToken::new();
        let deadline_hit = Arc::new(AtomicBool::new(false));

        match self.runs.entry(conversation_id.to_string()) {
            Entry::Occupied(_) => return Err(OrchestratorError::ConversationBusy(conversation_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(ActiveRun {
                    token: token.clone(),
                    deadline_hit: Arc::clone(&deadline_hit),
                });
            }
        }

        if let Some(deadline) = deadline {
            let token = token.clone();
            let hit = Arc::clone(&deadline_hit);
            let conversation_id = conversation_id.to_string();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(deadline) => {
                        tracing::warn!(conversation_id = %conversation_id, "Run deadline exceeded ({:?})", deadline);
                        hit.store(true, Ordering::Release);
                        token.cancel();
                    }
                }
            });
        }

        Ok(RunGuard {
            supervisor: Arc::clone(self),
            conversation_id: conversation_id.to_string(),
            token,
            deadline_hit,
        })
    }

    /// 触发取消（协作式）；没有在途运行时返回 false
    pub fn cancel(&self, conversation_id: &str) -> bool {
        match self.runs.get(conversation_id) {
            Some(run) => {
                tracing::info!(conversation_id, "Cancelling run");
                run.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, conversation_id: &str) -> bool {
        self.runs.contains_key(conversation_id)
    }

    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    fn finish(&self, conversation_id: &str, run: &RunGuard) {
        // 只移除自己登记的那一条
        self.runs
            .remove_if(conversation_id, |_, active| Arc::ptr_eq(&active.deadline_hit, &run.deadline_hit));
        // 结束截止时间任务
        run.token.cancel();
    }
}
