//! Worker 客户端抽象：提交远程任务、查询任务状态
//!
//! 两个操作都是幂等、可重试的请求/响应调用，与具体传输无关。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::FailureClass;

/// 远程任务状态（A2A 任务状态字符串）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteTaskState {
    Submitted,
    Working,
    InputRequired,
    Completed,
    Failed,
    Canceled,
    Rejected,
    /// 无法识别的状态，按未结束处理
    Unknown(String),
}

impl RemoteTaskState {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "submitted" => Self::Submitted,
            "working" => Self::Working,
            "input-required" | "input_required" => Self::InputRequired,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "canceled" | "cancelled" => Self::Canceled,
            "rejected" => Self::Rejected,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.is_success() || self.is_failure()
    }

    /// 带结果结束：completed 与 input-required
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::InputRequired)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Canceled | Self::Rejected)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::InputRequired => "input-required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
            Self::Unknown(s) => s,
        }
    }
}

/// 一次 submit / poll 看到的远程任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTaskSnapshot {
    pub remote_task_id: String,
    pub state: RemoteTaskState,
    pub result_parts: Vec<String>,
    /// 远程给出的失败说明（若有）
    pub error: Option<String>,
}

impl RemoteTaskSnapshot {
    pub fn new(remote_task_id: impl Into<String>, state: RemoteTaskState) -> Self {
        Self {
            remote_task_id: remote_task_id.into(),
            state,
            result_parts: Vec::new(),
            error: None,
        }
    }

    pub fn with_parts(mut self, parts: Vec<String>) -> Self {
        self.result_parts = parts;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn result_text(&self) -> String {
        self.result_parts.join("\n")
    }
}

/// Worker 调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("HTTP status {0}")]
    Http(u16),
}

impl WorkerError {
    /// 网络层错误可以重试；协议错误重试也没用
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Transport(_) | WorkerError::Timeout => true,
            WorkerError::Http(status) => *status >= 500 || *status == 429,
            WorkerError::Protocol(_) => false,
        }
    }

    pub fn classify(&self) -> FailureClass {
        if self.is_retryable() {
            FailureClass::Retry
        } else {
            FailureClass::Degraded
        }
    }
}

/// Worker 客户端 trait
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// 提交一个子请求，返回远程任务 id 与初始状态
    async fn submit(
        &self,
        endpoint: &str,
        text: &str,
        conversation_id: &str,
    ) -> Result<RemoteTaskSnapshot, WorkerError>;

    /// 查询远程任务
    async fn poll(&self, endpoint: &str, remote_task_id: &str) -> Result<RemoteTaskSnapshot, WorkerError>;
}
