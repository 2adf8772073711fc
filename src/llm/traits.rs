//! 推理能力抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::infer(context, prompt)。
//! 输出可能不合格式，由调用方当作正常分支处理；这里只区分“不可用”和“超时”。

use async_trait::async_trait;
use thiserror::Error;

use crate::core::FailureClass;

/// 推理调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Inference unavailable: {0}")]
    Unavailable(String),

    #[error("Inference timed out")]
    Timeout,
}

impl LlmError {
    pub fn classify(&self) -> FailureClass {
        match self {
            LlmError::Unavailable(_) => FailureClass::Degraded,
            LlmError::Timeout => FailureClass::Retry,
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// context 作为系统提示，prompt 作为用户消息
    async fn infer(&self, context: &str, prompt: &str) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
