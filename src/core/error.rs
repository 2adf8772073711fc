//! 编排错误类型与失败分类
//!
//! 每个调用方可见的失败都归入 FailureClass：重试 / 修正输入 / 服务降级。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::tasks::TaskError;

/// 调用方应如何应对一次失败
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// 暂时性故障，原样重试即可
    Retry,
    /// 输入有问题，需要调用方修正
    FixInput,
    /// 依赖服务降级，结果可能不完整
    Degraded,
}

/// 编排入口（submit / resume / cancel）返回的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Missing conversation id")]
    MissingConversationId,

    #[error("Conversation {0} already has a run in progress")]
    ConversationBusy(String),

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Conversation {0} has no interrupted run to resume")]
    NothingToResume(String),

    #[error("Task registry error: {0}")]
    Task(#[from] TaskError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

impl OrchestratorError {
    pub fn classify(&self) -> FailureClass {
        match self {
            OrchestratorError::MissingConversationId
            | OrchestratorError::UnknownConversation(_)
            | OrchestratorError::NothingToResume(_) => FailureClass::FixInput,
            OrchestratorError::ConversationBusy(_) => FailureClass::Retry,
            OrchestratorError::Task(e) => e.classify(),
            OrchestratorError::Checkpoint(_) => FailureClass::Retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_input_errors() {
        assert_eq!(
            OrchestratorError::MissingConversationId.classify(),
            FailureClass::FixInput
        );
        assert_eq!(
            OrchestratorError::UnknownConversation("x".into()).classify(),
            FailureClass::FixInput
        );
        assert_eq!(
            OrchestratorError::ConversationBusy("x".into()).classify(),
            FailureClass::Retry
        );
    }

    #[test]
    fn test_classify_task_limit_is_retry() {
        let err = OrchestratorError::from(TaskError::LimitExceeded { limit: 3 });
        assert_eq!(err.classify(), FailureClass::Retry);
    }
}
