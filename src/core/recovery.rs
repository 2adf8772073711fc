//! 降级恢复引擎
//!
//! 推理不可用或输出不合格式时的确定性兜底：
//! - 路由：按配置顺序匹配关键词规则，首个命中规则对应的 Agent 接收整条用户请求
//! - 汇总：拼接成功结果；全部失败时给出包含失败原因的说明

use crate::agents::AgentRegistry;
use crate::config::{FallbackRule, RoutingSection};
use crate::core::{RemoteCallRecord, RoutedTask};

/// 兜底路由与兜底汇总
#[derive(Debug, Clone, Default)]
pub struct RecoveryEngine {
    rules: Vec<FallbackRule>,
    default_endpoint: Option<String>,
}

impl RecoveryEngine {
    pub fn new(rules: Vec<FallbackRule>, default_endpoint: Option<String>) -> Self {
        Self {
            rules,
            default_endpoint,
        }
    }

    pub fn from_config(cfg: &RoutingSection) -> Self {
        Self::new(cfg.fallback_rules.clone(), cfg.default_endpoint.clone())
    }

    /// 关键词兜底路由：至多产生一个任务
    ///
    /// 规则命中但没有对应能力的 Agent 时继续尝试下一条；都不行则用 default_endpoint；
    /// 仍然没有则返回空列表（执行阶段直接跳过）
    pub async fn fallback_route(&self, user_text: &str, registry: &AgentRegistry) -> Vec<RoutedTask> {
        let lowered = user_text.to_lowercase();
        for rule in &self.rules {
            let Some(keyword) = rule
                .keywords
                .iter()
                .find(|k| !k.is_empty() && lowered.contains(&k.to_lowercase()))
            else {
                continue;
            };

            if let Some(manifest) = registry.find_by_capability(&rule.capability).await.first() {
                tracing::warn!(
                    keyword = %keyword,
                    capability = %rule.capability,
                    endpoint = %manifest.endpoint,
                    "Using keyword fallback routing"
                );
                return vec![Self::whole_request(&manifest.endpoint, user_text)];
            }
            tracing::debug!(capability = %rule.capability, "Fallback rule matched but no agent offers it");
        }

        if let Some(endpoint) = &self.default_endpoint {
            tracing::warn!(endpoint = %endpoint, "No fallback rule matched, using default endpoint");
            return vec![Self::whole_request(endpoint, user_text)];
        }

        tracing::warn!("No fallback rule matched and no default endpoint; routing to zero tasks");
        Vec::new()
    }

    fn whole_request(endpoint: &str, user_text: &str) -> RoutedTask {
        RoutedTask {
            target_agent: endpoint.to_string(),
            sub_request: user_text.to_string(),
            parallel: true,
        }
    }

    /// 汇总兜底：成功结果逐条拼接，失败的附在末尾
    pub fn fallback_aggregate(&self, calls: &[RemoteCallRecord]) -> String {
        let succeeded: Vec<&RemoteCallRecord> = calls.iter().filter(|c| c.is_success()).collect();
        let failed: Vec<&RemoteCallRecord> = calls.iter().filter(|c| !c.is_success()).collect();

        let mut out = if succeeded.is_empty() {
            if calls.is_empty() {
                "No results: no agent was able to handle this request.".to_string()
            } else {
                "No results: every agent call failed.".to_string()
            }
        } else {
            succeeded
                .iter()
                .map(|c| c.result.as_deref().unwrap_or_default().trim())
                .filter(|r| !r.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n")
        };

        if !failed.is_empty() {
            let reasons: Vec<String> = failed
                .iter()
                .map(|c| {
                    format!(
                        "- {}: {}",
                        c.agent_endpoint,
                        c.error.as_deref().unwrap_or("unknown error")
                    )
                })
                .collect();
            out.push_str("\n\nFailed calls:\n");
            out.push_str(&reasons.join("\n"));
        }

        if out.trim().is_empty() {
            out = "No results: agents returned empty responses.".to_string();
        }
        out
    }
}
