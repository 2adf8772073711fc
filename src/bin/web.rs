//! Hive HTTP 接口
//!
//! 启动: cargo run --bin hive-web --features web
//! 默认监听 http://127.0.0.1:10002

#![cfg(feature = "web")]

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use hive::checkpoint::export_history;
use hive::config::{load_config, AppConfig};
use hive::core::{ConversationState, FailureClass, Orchestrator, OrchestratorError, Phase, RetentionPolicy};
use hive::tasks::{TaskRecord, TaskStatus};

struct AppState {
    orchestrator: Arc<Orchestrator>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(e: OrchestratorError) -> ApiError {
    let status = match &e {
        OrchestratorError::ConversationBusy(_) => StatusCode::CONFLICT,
        OrchestratorError::UnknownConversation(_) => StatusCode::NOT_FOUND,
        _ => match e.classify() {
            FailureClass::FixInput => StatusCode::BAD_REQUEST,
            FailureClass::Retry | FailureClass::Degraded => StatusCode::SERVICE_UNAVAILABLE,
        },
    };
    (
        status,
        Json(serde_json::json!({ "error": e.to_string(), "class": e.classify() })),
    )
}

#[derive(Deserialize)]
struct MessageRequest {
    text: String,
}

/// 一轮运行的结果
#[derive(Serialize)]
struct RunResponse {
    conversation_id: String,
    phase: Phase,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    final_result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<hive::core::RunFailure>,
}

impl From<ConversationState> for RunResponse {
    fn from(state: ConversationState) -> Self {
        let message = match (&state.phase, &state.error) {
            (Phase::Complete, _) => "complete".to_string(),
            (_, Some(error)) => error.message.clone(),
            (phase, None) => phase.to_string(),
        };
        Self {
            conversation_id: state.conversation_id,
            phase: state.phase,
            message,
            final_result: state.aggregated_result,
            error: state.error,
        }
    }
}

/// POST /api/conversations/:id/messages：跑完一轮后返回结果
async fn api_send_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let result = state
        .orchestrator
        .submit(&conversation_id, &req.text)
        .await
        .map_err(api_error)?;
    Ok(Json(result.into()))
}

/// POST /api/conversations/:id/resume
async fn api_resume(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<Json<RunResponse>, ApiError> {
    let result = state
        .orchestrator
        .resume(&conversation_id)
        .await
        .map_err(api_error)?;
    Ok(Json(result.into()))
}

/// POST /api/conversations/:id/cancel
async fn api_cancel(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Json<serde_json::Value> {
    let cancelled = state.orchestrator.cancel(&conversation_id);
    Json(serde_json::json!({ "cancelled": cancelled }))
}

/// GET /api/conversations/:id/events?after=N：先重放 N 之后的历史，再推送实时事件
///
/// 也接受浏览器重连时带的 Last-Event-ID 头
async fn api_events_sse(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let after = query
        .get("after")
        .and_then(|s| s.parse::<u64>().ok())
        .or_else(|| {
            headers
                .get("last-event-id")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
        });

    let subscription = state.orchestrator.events().subscribe(&conversation_id, after);
    let stream = subscription.into_stream().map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default()
            .id(event.sequence.to_string())
            .event(event.event_type.as_str())
            .data(data))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

/// GET /api/conversations/:id/history：检查点历史（JSON）
async fn api_history(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
) -> Result<String, ApiError> {
    export_history(state.orchestrator.checkpoints().as_ref(), &conversation_id)
        .await
        .map_err(|e| api_error(e.into()))
}

/// GET /api/tasks?status=&limit=
async fn api_tasks_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Vec<TaskRecord>>, (StatusCode, String)> {
    let status = match query.get("status") {
        Some(s) => Some(
            TaskStatus::parse(s).ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown status: {}", s)))?,
        ),
        None => None,
    };
    let limit = query
        .get("limit")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(50);
    Ok(Json(state.orchestrator.tasks().list(status, limit).await))
}

/// GET /api/agents
async fn api_agents_list(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let agents = state.orchestrator.agents().all().await;
    Json(serde_json::json!({ "agents": agents.iter().map(|a| a.as_ref()).collect::<Vec<_>>() }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let addr = format!("{}:{}", cfg.web.host, cfg.web.port);
    let retention = RetentionPolicy::from(&cfg);

    let orchestrator = Arc::new(hive::build_orchestrator(cfg).await?);
    let state = Arc::new(AppState {
        orchestrator: Arc::clone(&orchestrator),
    });

    let app = Router::new()
        .route("/api/conversations/:id/messages", post(api_send_message))
        .route("/api/conversations/:id/resume", post(api_resume))
        .route("/api/conversations/:id/cancel", post(api_cancel))
        .route("/api/conversations/:id/events", get(api_events_sse))
        .route("/api/conversations/:id/history", get(api_history))
        .route("/api/tasks", get(api_tasks_list))
        .route("/api/agents", get(api_agents_list))
        .route("/api/health", get(|| async { "OK" }))
        .with_state(state);

    // 定期清理过期任务、旧检查点与空闲事件流
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let report = orchestrator.maintenance(&retention).await;
            if !report.is_empty() {
                tracing::info!(
                    tasks = report.tasks,
                    checkpoints = report.checkpoints,
                    channels = report.channels,
                    "Maintenance cleaned up stale state"
                );
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Hive web listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}
