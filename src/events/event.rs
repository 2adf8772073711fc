//! 进度事件：编排过程中发布给订阅者（SSE / CLI）的单条事件

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::Phase;

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// 阶段切换（附一行状态说明）
    Phase,
    /// 某个远程调用结束
    RemoteCall,
    /// 走了降级路径（推理不可用 / 输出不合法）
    Degraded,
    /// 本轮完成，携带最终结果
    Final,
    /// 本轮以 Error 结束
    Error,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Phase => "phase",
            EventType::RemoteCall => "remote_call",
            EventType::Degraded => "degraded",
            EventType::Final => "final",
            EventType::Error => "error",
        }
    }
}

/// 调用方可见的进度：{phase, message, final_result?}
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub phase: Phase,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<String>,
    #[serde(default)]
    pub degraded: bool,
}

impl ProgressUpdate {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
            final_result: None,
            degraded: false,
        }
    }
}

/// 总线上的一条事件；sequence 在会话内单调递增，从 1 开始
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub conversation_id: String,
    pub sequence: u64,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    /// 若 payload 是 ProgressUpdate 则解析出来
    pub fn progress(&self) -> Option<ProgressUpdate> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}
