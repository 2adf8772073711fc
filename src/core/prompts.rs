//! 三个推理阶段的提示词
//!
//! context 作为系统提示，以 `## Planning` / `## Routing` / `## Aggregation` 开头，便于日志与测试区分阶段。

use crate::core::{Message, RemoteCallRecord, Role};

use super::routing::routing_schema;

pub const PLANNING_HEADER: &str = "## Planning";
pub const ROUTING_HEADER: &str = "## Routing";
pub const AGGREGATION_HEADER: &str = "## Aggregation";

fn render_history(history: &[Message]) -> String {
    if history.is_empty() {
        return "(empty)".to_string();
    }
    history
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
            };
            format!("{}: {}", role, m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 规划：用户请求 + 历史 + 可用 Agent 摘要 -> 计划文本
pub fn planning(user_request: &str, history: &[Message], agent_summary: &str) -> (String, String) {
    let context = format!(
        "{PLANNING_HEADER}\n\
         You coordinate a team of remote agents. Break the user's request into concrete steps, \
         naming which agent should handle each step. Reply with the plan as plain text.\n\n\
         Available agents:\n{agent_summary}"
    );
    let prompt = format!(
        "Conversation so far:\n{}\n\nUser request:\n{}",
        render_history(history),
        user_request
    );
    (context, prompt)
}

/// 路由：计划 + 用户请求 -> 结构化路由决策
pub fn routing(plan: &str, user_request: &str, agent_summary: &str) -> (String, String) {
    let context = format!(
        "{ROUTING_HEADER}\n\
         Turn the plan into agent calls. Reply with ONLY a JSON object matching this schema:\n{}\n\n\
         Use an agent endpoint URL or exact agent name for target_agent. \
         Set parallel to true for calls that do not depend on each other's results. \
         Reply with {{\"tasks\": []}} if no agent is needed.\n\n\
         Available agents:\n{agent_summary}",
        routing_schema()
    );
    let prompt = format!("Plan:\n{plan}\n\nUser request:\n{user_request}");
    (context, prompt)
}

/// 汇总：用户请求 + 计划 + 每个调用的结果或失败原因 -> 最终回答
pub fn aggregation(user_request: &str, plan: Option<&str>, calls: &[RemoteCallRecord]) -> (String, String) {
    let context = format!(
        "{AGGREGATION_HEADER}\n\
         Combine the agent results into one answer for the user. \
         If some calls failed, say which part could not be answered and why."
    );

    let results = if calls.is_empty() {
        "(no agent calls were made)".to_string()
    } else {
        calls
            .iter()
            .enumerate()
            .map(|(i, c)| match (&c.result, &c.error) {
                (Some(result), _) if c.is_success() => {
                    format!("{}. {} succeeded:\n{}", i + 1, c.agent_endpoint, result)
                }
                (_, error) => format!(
                    "{}. {} failed: {}",
                    i + 1,
                    c.agent_endpoint,
                    error.as_deref().unwrap_or("unknown error")
                ),
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let prompt = format!(
        "User request:\n{}\n\nPlan:\n{}\n\nAgent results:\n{}",
        user_request,
        plan.unwrap_or("(none)"),
        results
    );
    (context, prompt)
}
