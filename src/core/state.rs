//! 编排状态：ConversationState 及其组成部分
//!
//! ConversationState 由一次运行独占，只由编排状态机修改；每次阶段切换时整体快照写入检查点。

use serde::{Deserialize, Serialize};

use crate::core::error::FailureClass;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 编排阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Routing,
    Executing,
    Aggregating,
    Complete,
    Error,
}

impl Phase {
    /// Complete / Error 为一轮的终点
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::Routing => "routing",
            Phase::Executing => "executing",
            Phase::Aggregating => "aggregating",
            Phase::Complete => "complete",
            Phase::Error => "error",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 路由决策中的一项：发往哪个 Agent、子请求、是否可并行
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedTask {
    pub target_agent: String,
    pub sub_request: String,
    pub parallel: bool,
}

/// 远程调用状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallStatus::Completed | CallStatus::Failed)
    }
}

/// 一次发往单个 Worker 的调用结果；由 Dispatcher 创建，终态后不再修改
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCallRecord {
    pub agent_endpoint: String,
    /// 提交失败时为空串
    pub remote_task_id: String,
    pub status: CallStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl RemoteCallRecord {
    pub fn completed(endpoint: &str, remote_task_id: &str, result: String) -> Self {
        Self {
            agent_endpoint: endpoint.to_string(),
            remote_task_id: remote_task_id.to_string(),
            status: CallStatus::Completed,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(endpoint: &str, remote_task_id: &str, error: impl Into<String>) -> Self {
        Self {
            agent_endpoint: endpoint.to_string(),
            remote_task_id: remote_task_id.to_string(),
            status: CallStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CallStatus::Completed
    }
}

/// 运行级失败：人类可读原因 + 调用方该如何应对
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub class: FailureClass,
    pub message: String,
}

/// 一个会话在某一时刻的完整编排状态
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: String,
    pub message_history: Vec<Message>,
    pub plan: Option<String>,
    pub routing_decision: Option<Vec<RoutedTask>>,
    pub remote_calls: Vec<RemoteCallRecord>,
    pub aggregated_result: Option<String>,
    pub phase: Phase,
    pub error: Option<RunFailure>,
}

impl ConversationState {
    /// 新会话的第一轮
    pub fn new(conversation_id: impl Into<String>, user_text: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_history: vec![Message::user(user_text)],
            plan: None,
            routing_decision: None,
            remote_calls: Vec::new(),
            aggregated_result: None,
            phase: Phase::Planning,
            error: None,
        }
    }

    /// 在上一轮 Complete/Error 快照上开启新一轮：保留历史，清空本轮产物
    pub fn next_turn(&self, user_text: impl Into<String>) -> Self {
        let mut history = self.message_history.clone();
        history.push(Message::user(user_text));
        Self {
            conversation_id: self.conversation_id.clone(),
            message_history: history,
            plan: None,
            routing_decision: None,
            remote_calls: Vec::new(),
            aggregated_result: None,
            phase: Phase::Planning,
            error: None,
        }
    }

    /// 最近一条用户消息（本轮的请求）
    pub fn latest_user_request(&self) -> Option<&str> {
        self.message_history
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    /// 进入 Error 阶段
    pub fn fail(mut self, class: FailureClass, message: impl Into<String>) -> Self {
        self.phase = Phase::Error;
        self.error = Some(RunFailure {
            class,
            message: message.into(),
        });
        self
    }
}
