//! 路由决策解析与校验
//!
//! 推理输出应为 `{"tasks": [{"target_agent", "sub_request", "parallel"}]}`；
//! 先从文本中提取 JSON（```json 代码块或首个 `{` 到末个 `}`），再按结构解析，
//! 最后把 Agent 名称 / endpoint 解析为已发现的 endpoint。任一环节失败即视为格式不合法。

use std::sync::OnceLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::agents::AgentRegistry;
use crate::core::RoutedTask;

/// 路由输出的结构（同时用于生成提示词中的 JSON Schema）
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RoutingPayload {
    pub tasks: Vec<RoutingEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RoutingEntry {
    /// Agent endpoint URL 或 Agent 名称
    #[serde(alias = "agent_url", alias = "endpoint", alias = "agent")]
    pub target_agent: String,
    /// 发给该 Agent 的子请求
    #[serde(alias = "message")]
    pub sub_request: String,
    /// 是否可与其它 parallel 任务并发执行
    #[serde(default)]
    pub parallel: bool,
}

/// 校验结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingOutcome {
    Routed(Vec<RoutedTask>),
    /// 无法使用的输出及原因，调用方转入兜底路由
    Malformed(String),
}

static JSON_FENCE_RE: OnceLock<Regex> = OnceLock::new();

/// 从推理输出中取出 JSON 对象文本
pub fn extract_json(output: &str) -> Option<&str> {
    let re = JSON_FENCE_RE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").unwrap());
    if let Some(caps) = re.captures(output) {
        return caps.get(1).map(|m| m.as_str());
    }
    let start = output.find('{')?;
    let end = output.rfind('}')?;
    (end > start).then(|| &output[start..=end])
}

/// 仅做结构解析，不涉及 Agent 是否存在
pub fn parse_routing(output: &str) -> Result<RoutingPayload, String> {
    let json = extract_json(output).ok_or_else(|| "no JSON object in routing output".to_string())?;
    serde_json::from_str::<RoutingPayload>(json).map_err(|e| format!("invalid routing JSON: {}", e))
}

/// 完整校验：结构合法、子请求非空、目标 Agent 已发现
pub async fn validate_routing(output: &str, registry: &AgentRegistry) -> RoutingOutcome {
    let payload = match parse_routing(output) {
        Ok(p) => p,
        Err(reason) => return RoutingOutcome::Malformed(reason),
    };

    let mut tasks = Vec::with_capacity(payload.tasks.len());
    for (i, entry) in payload.tasks.into_iter().enumerate() {
        let sub_request = entry.sub_request.trim();
        if sub_request.is_empty() {
            return RoutingOutcome::Malformed(format!("task {} has an empty sub_request", i));
        }
        let Some(endpoint) = registry.resolve(&entry.target_agent).await else {
            return RoutingOutcome::Malformed(format!(
                "task {} targets unknown agent '{}'",
                i, entry.target_agent
            ));
        };
        tasks.push(RoutedTask {
            target_agent: endpoint,
            sub_request: sub_request.to_string(),
            parallel: entry.parallel,
        });
    }
    RoutingOutcome::Routed(tasks)
}

/// 路由输出的 JSON Schema（美化格式）
pub fn routing_schema() -> String {
    let schema = schemars::schema_for!(RoutingPayload);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
