//! A2A JSON-RPC Worker 客户端
//!
//! - 提交：`message/send`，消息带一个文本 part，contextId 取会话 id
//! - 查询：`tasks/get`，结果从 status.state 与 artifacts[].parts[] 的文本中取
//! - 请求直接发到 Agent 的基础 URL；若配置了 API Key 则带 `X-API-Key` 头

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::client::{RemoteTaskSnapshot, RemoteTaskState, WorkerClient, WorkerError};

pub struct A2aWorkerClient {
    http: reqwest::Client,
    /// endpoint -> API Key
    api_keys: HashMap<String, String>,
}

impl A2aWorkerClient {
    pub fn new(request_timeout: Duration, api_keys: HashMap<String, String>) -> Result<Self, WorkerError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| WorkerError::Transport(e.to_string()))?;
        Ok(Self { http, api_keys })
    }

    async fn rpc(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, WorkerError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });

        let mut request = self.http.post(endpoint).json(&body);
        if let Some(key) = self.api_keys.get(endpoint) {
            request = request.header("X-API-Key", key);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(WorkerError::Http(status.as_u16()));
        }

        let envelope: Value = response.json().await.map_err(map_reqwest_error)?;
        if let Some(error) = envelope.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| error.to_string());
            return Err(WorkerError::Protocol(message));
        }
        envelope
            .get("result")
            .cloned()
            .ok_or_else(|| WorkerError::Protocol("response has neither result nor error".into()))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> WorkerError {
    if e.is_timeout() {
        WorkerError::Timeout
    } else if e.is_decode() {
        WorkerError::Protocol(e.to_string())
    } else {
        WorkerError::Transport(e.to_string())
    }
}

/// 收集一组 part 中的文本
fn text_parts(parts: Option<&Value>) -> Vec<String> {
    parts
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("kind").and_then(Value::as_str).map_or(true, |k| k == "text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// 解析 `message/send` 或 `tasks/get` 的 result
///
/// 直接返回 Message（没有任务）时视为已完成
pub(crate) fn parse_task(result: &Value) -> Result<RemoteTaskSnapshot, WorkerError> {
    let kind = result.get("kind").and_then(Value::as_str);
    if kind == Some("message") || (result.get("status").is_none() && result.get("parts").is_some()) {
        let id = result
            .get("taskId")
            .or_else(|| result.get("messageId"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Ok(RemoteTaskSnapshot::new(id, RemoteTaskState::Completed)
            .with_parts(text_parts(result.get("parts"))));
    }

    let id = result
        .get("id")
        .or_else(|| result.get("taskId"))
        .and_then(Value::as_str)
        .ok_or_else(|| WorkerError::Protocol("task result has no id".into()))?;

    let status = result.get("status");
    let state = status
        .and_then(|s| s.get("state"))
        .and_then(Value::as_str)
        .map(RemoteTaskState::parse)
        .unwrap_or(RemoteTaskState::Submitted);

    let mut artifacts: Vec<&Value> = result
        .get("artifacts")
        .and_then(Value::as_array)
        .map(|a| a.iter().collect())
        .unwrap_or_default();
    if artifacts.is_empty() {
        artifacts.extend(result.get("artifact"));
    }
    let mut parts: Vec<String> = artifacts
        .into_iter()
        .flat_map(|a| text_parts(a.get("parts")))
        .collect();
    // input-required 的提问通常只在 status.message 里
    if parts.is_empty() && state.is_success() {
        parts = status
            .and_then(|s| s.get("message"))
            .map(|m| text_parts(m.get("parts")))
            .unwrap_or_default();
    }

    let mut snapshot = RemoteTaskSnapshot::new(id, state).with_parts(parts);
    if snapshot.state.is_failure() {
        let reason = status
            .and_then(|s| s.get("message"))
            .map(|m| text_parts(m.get("parts")).join("\n"))
            .filter(|t| !t.is_empty())
            .or_else(|| result.get("error").map(|e| e.as_str().map(String::from).unwrap_or_else(|| e.to_string())));
        if let Some(reason) = reason {
            snapshot = snapshot.with_error(reason);
        }
    }
    Ok(snapshot)
}

#[async_trait]
impl WorkerClient for A2aWorkerClient {
    async fn submit(
        &self,
        endpoint: &str,
        text: &str,
        conversation_id: &str,
    ) -> Result<RemoteTaskSnapshot, WorkerError> {
        let params = json!({
            "message": {
                "messageId": uuid::Uuid::new_v4().to_string(),
                "role": "user",
                "parts": [{ "kind": "text", "text": text }],
                "contextId": conversation_id,
            }
        });
        let result = self.rpc(endpoint, "message/send", params).await?;
        let snapshot = parse_task(&result)?;
        tracing::debug!(
            endpoint,
            remote_task_id = %snapshot.remote_task_id,
            state = snapshot.state.as_str(),
            "Remote task submitted"
        );
        Ok(snapshot)
    }

    async fn poll(&self, endpoint: &str, remote_task_id: &str) -> Result<RemoteTaskSnapshot, WorkerError> {
        let result = self
            .rpc(endpoint, "tasks/get", json!({ "id": remote_task_id }))
            .await?;
        parse_task(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_working_task() {
        let result = json!({
            "id": "t-1",
            "contextId": "c",
            "kind": "task",
            "status": { "state": "working" }
        });
        let snapshot = parse_task(&result).unwrap();
        assert_eq!(snapshot.remote_task_id, "t-1");
        assert_eq!(snapshot.state, RemoteTaskState::Working);
        assert!(snapshot.result_parts.is_empty());
    }

    #[test]
    fn test_parse_completed_task_joins_artifact_text() {
        let result = json!({
            "id": "t-1",
            "status": { "state": "completed" },
            "artifacts": [
                { "parts": [{ "kind": "text", "text": "100 USD = 92 EUR" }, { "kind": "data", "data": {} }] },
                { "parts": [{ "text": "rate date 2024-05-01" }] }
            ]
        });
        let snapshot = parse_task(&result).unwrap();
        assert!(snapshot.state.is_success());
        assert_eq!(snapshot.result_text(), "100 USD = 92 EUR\nrate date 2024-05-01");
    }

    #[test]
    fn test_parse_single_artifact() {
        let result = json!({
            "taskId": "t-2",
            "status": { "state": "input-required" },
            "artifact": { "parts": [{ "kind": "text", "text": "which city?" }] }
        });
        let snapshot = parse_task(&result).unwrap();
        assert_eq!(snapshot.state, RemoteTaskState::InputRequired);
        assert_eq!(snapshot.result_text(), "which city?");
    }

    #[test]
    fn test_input_required_question_from_status_message() {
        let result = json!({
            "id": "t-9",
            "status": {
                "state": "input-required",
                "message": { "parts": [{ "kind": "text", "text": "Which currency do you want?" }] }
            }
        });
        let snapshot = parse_task(&result).unwrap();
        assert_eq!(snapshot.state, RemoteTaskState::InputRequired);
        assert_eq!(snapshot.result_text(), "Which currency do you want?");
    }

    #[test]
    fn test_parse_failed_task_reason() {
        let result = json!({
            "id": "t-3",
            "status": {
                "state": "failed",
                "message": { "parts": [{ "kind": "text", "text": "upstream rate API down" }] }
            }
        });
        let snapshot = parse_task(&result).unwrap();
        assert!(snapshot.state.is_failure());
        assert_eq!(snapshot.error.as_deref(), Some("upstream rate API down"));
    }

    #[test]
    fn test_direct_message_reply_is_completed() {
        let result = json!({
            "kind": "message",
            "messageId": "m-1",
            "role": "agent",
            "parts": [{ "kind": "text", "text": "It is 09:00 in Tokyo" }]
        });
        let snapshot = parse_task(&result).unwrap();
        assert_eq!(snapshot.state, RemoteTaskState::Completed);
        assert_eq!(snapshot.result_text(), "It is 09:00 in Tokyo");
    }

    #[test]
    fn test_task_without_id_is_protocol_error() {
        let err = parse_task(&json!({ "status": { "state": "working" } })).unwrap_err();
        assert!(matches!(err, WorkerError::Protocol(_)));
    }
}
