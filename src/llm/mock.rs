//! Mock LLM 客户端（用于测试与离线模式，无需 API）
//!
//! 按规则应答：context 或 prompt 中包含某个片段时返回预设回复（或预设错误）；
//! 没有规则命中时回显 prompt 首行，路由阶段因此拿不到 JSON，会走关键词兜底。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError};

type Handler = dyn Fn(&str, &str) -> Result<String, LlmError> + Send + Sync;

struct Rule {
    needle: String,
    reply: Result<String, LlmError>,
}

/// Mock 客户端
#[derive(Default)]
pub struct MockLlmClient {
    rules: Vec<Rule>,
    handler: Option<Arc<Handler>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// context 或 prompt 含 needle 时返回 reply；按添加顺序匹配，先到先得
    pub fn when(mut self, needle: impl Into<String>, reply: impl Into<String>) -> Self {
        self.rules.push(Rule {
            needle: needle.into(),
            reply: Ok(reply.into()),
        });
        self
    }

    pub fn fail_when(mut self, needle: impl Into<String>, error: LlmError) -> Self {
        self.rules.push(Rule {
            needle: needle.into(),
            reply: Err(error),
        });
        self
    }

    /// 自定义应答函数，优先于规则
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &str) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn infer(&self, context: &str, prompt: &str) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(handler) = &self.handler {
            return handler(context, prompt);
        }

        if let Some(rule) = self
            .rules
            .iter()
            .find(|r| context.contains(&r.needle) || prompt.contains(&r.needle))
        {
            return rule.reply.clone();
        }

        let first_line = prompt.lines().find(|l| !l.trim().is_empty()).unwrap_or("(no input)");
        Ok(format!("Mock response: {}", first_line.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rules_match_in_order() {
        let llm = MockLlmClient::new()
            .when("## Routing", "{\"tasks\": []}")
            .fail_when("## Aggregation", LlmError::Timeout);

        assert_eq!(llm.infer("## Routing", "x").await.unwrap(), "{\"tasks\": []}");
        assert_eq!(llm.infer("## Aggregation", "x").await, Err(LlmError::Timeout));
        assert_eq!(llm.infer("", "\nhello\nworld").await.unwrap(), "Mock response: hello");
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_handler_takes_precedence() {
        let llm = MockLlmClient::new()
            .when("a", "rule")
            .with_handler(|_, prompt| Ok(prompt.to_uppercase()));
        assert_eq!(llm.infer("", "a").await.unwrap(), "A");
    }
}
