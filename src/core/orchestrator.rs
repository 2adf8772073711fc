//! 主控循环：Planning -> Routing -> Executing -> Aggregating -> Complete
//!
//! `advance` 只依赖当前 ConversationState 与外部能力（推理 / Agent 注册表 / 派发器），
//! 不做持久化也不发事件；`drive` 负责每次迁移后的副作用：写检查点、发进度事件、更新任务状态。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::agents::AgentRegistry;
use crate::checkpoint::{CheckpointMetadata, CheckpointStore};
use crate::config::AppConfig;
use crate::core::prompts;
use crate::core::recovery::RecoveryEngine;
use crate::core::routing::{validate_routing, RoutingOutcome};
use crate::core::session_supervisor::{RunGuard, SessionSupervisor, StopReason};
use crate::core::task_scheduler::TaskScheduler;
use crate::core::{
    ConversationState, FailureClass, Message, OrchestratorError, Phase, RemoteCallRecord, RoutedTask,
};
use crate::dispatch::Dispatcher;
use crate::events::{EventBus, EventType, ProgressUpdate};
use crate::llm::LlmClient;
use crate::tasks::{TaskRegistry, TaskStatus};

/// 一次状态迁移的结果
#[derive(Debug, Clone)]
pub struct Transition {
    pub state: ConversationState,
    /// 本次迁移是否走了降级路径
    pub degraded: bool,
    /// 一行状态说明（进度事件与检查点备注）
    pub note: String,
}

impl Transition {
    fn new(state: ConversationState, note: impl Into<String>) -> Self {
        Self {
            state,
            degraded: false,
            note: note.into(),
        }
    }

    fn degraded(mut self, degraded: bool) -> Self {
        self.degraded = degraded;
        self
    }
}

/// 编排参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// 整轮软超时
    pub run_timeout: Option<Duration>,
    /// 规划时带入的历史消息条数上限
    pub max_history_messages: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            run_timeout: None,
            max_history_messages: 20,
        }
    }
}

/// 定期清理的保留时长
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub tasks: Duration,
    /// None 表示检查点永久保留
    pub checkpoints: Option<Duration>,
    pub idle_channels: Duration,
}

impl From<&AppConfig> for RetentionPolicy {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            tasks: Duration::from_secs(cfg.tasks.retention_secs),
            checkpoints: cfg.checkpoint.retention_secs.map(Duration::from_secs),
            idle_channels: Duration::from_secs(cfg.events.idle_secs),
        }
    }
}

/// 一次清理各项移除的数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub tasks: usize,
    pub checkpoints: usize,
    pub channels: usize,
}

impl MaintenanceReport {
    pub fn is_empty(&self) -> bool {
        self.tasks + self.checkpoints + self.channels == 0
    }
}

/// 编排器：持有全部协作组件，可被多个会话并发使用
pub struct Orchestrator {
    llm: Arc<dyn LlmClient>,
    agents: Arc<AgentRegistry>,
    dispatcher: Arc<Dispatcher>,
    tasks: Arc<TaskRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    events: Arc<EventBus>,
    recovery: RecoveryEngine,
    scheduler: TaskScheduler,
    supervisor: Arc<SessionSupervisor>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmClient>,
        agents: Arc<AgentRegistry>,
        dispatcher: Arc<Dispatcher>,
        tasks: Arc<TaskRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        events: Arc<EventBus>,
        recovery: RecoveryEngine,
        scheduler: TaskScheduler,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            llm,
            agents,
            dispatcher,
            tasks,
            checkpoints,
            events,
            recovery,
            scheduler,
            supervisor: Arc::new(SessionSupervisor::new()),
            settings,
        }
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn is_running(&self, conversation_id: &str) -> bool {
        self.supervisor.is_running(conversation_id)
    }

    // ------------------------------------------------------------------
    // 入口
    // ------------------------------------------------------------------

    /// 处理一条用户消息：在最新快照之上开启新一轮并跑到 Complete / Error
    ///
    /// 运行中的失败通过返回状态的 error 字段体现；这里的 Err 只表示请求本身被拒绝
    pub async fn submit(&self, conversation_id: &str, user_text: &str) -> Result<ConversationState, OrchestratorError> {
        let conversation_id = conversation_id.trim();
        if conversation_id.is_empty() {
            return Err(OrchestratorError::MissingConversationId);
        }

        let guard = self.supervisor.begin(conversation_id, self.settings.run_timeout)?;

        let state = match self.checkpoints.latest(conversation_id).await? {
            Some(checkpoint) => {
                if !checkpoint.snapshot.phase.is_terminal() {
                    tracing::warn!(
                        conversation_id,
                        phase = %checkpoint.snapshot.phase,
                        "Starting a new turn over an interrupted run"
                    );
                }
                checkpoint.snapshot.next_turn(user_text)
            }
            None => ConversationState::new(conversation_id, user_text),
        };

        let task = self.tasks.create(conversation_id, user_text)?;
        tracing::info!(conversation_id, task_id = %task.task_id, "Run started");

        self.persist(&state, &task.task_id, false, "run started").await;
        self.publish(&state, false, "planning");

        Ok(self.drive(state, &task.task_id, &guard).await)
    }

    /// 从最新检查点继续一次被中断的运行
    pub async fn resume(&self, conversation_id: &str) -> Result<ConversationState, OrchestratorError> {
        let guard = self.supervisor.begin(conversation_id, self.settings.run_timeout)?;

        let checkpoint = self
            .checkpoints
            .latest(conversation_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownConversation(conversation_id.to_string()))?;
        if checkpoint.snapshot.phase.is_terminal() {
            return Err(OrchestratorError::NothingToResume(conversation_id.to_string()));
        }

        // 原任务记录可能已被清理（或进程重启后丢失），此时重新登记
        let run_id = match self.tasks.get(&checkpoint.metadata.run_id).await {
            Some(task) if !task.status.is_terminal() => task.task_id,
            _ => {
                let input = checkpoint
                    .snapshot
                    .latest_user_request()
                    .unwrap_or_default()
                    .to_string();
                self.tasks.create(conversation_id, input)?.task_id
            }
        };

        tracing::info!(
            conversation_id,
            task_id = %run_id,
            phase = %checkpoint.snapshot.phase,
            "Resuming run"
        );
        Ok(self.drive(checkpoint.snapshot, &run_id, &guard).await)
    }

    /// 协作式取消：当前阶段结束（或当前轮询间隙）后停止
    pub fn cancel(&self, conversation_id: &str) -> bool {
        self.supervisor.cancel(conversation_id)
    }

    /// 定期清理：过期终态任务、过旧检查点、无人订阅的空闲事件流
    pub async fn maintenance(&self, policy: &RetentionPolicy) -> MaintenanceReport {
        let mut report = MaintenanceReport {
            tasks: self.tasks.cleanup_finished(policy.tasks).await,
            ..Default::default()
        };

        if let Some(cutoff) = policy
            .checkpoints
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .and_then(|age| Utc::now().checked_sub_signed(age))
        {
            match self.checkpoints.prune_before(cutoff).await {
                Ok(removed) => report.checkpoints = removed,
                Err(e) => tracing::warn!("Checkpoint pruning failed: {}", e),
            }
        }

        report.channels = self.events.evict_idle(policy.idle_channels);
        report
    }

    // ------------------------------------------------------------------
    // 运行驱动
    // ------------------------------------------------------------------

    async fn drive(&self, mut state: ConversationState, run_id: &str, guard: &RunGuard) -> ConversationState {
        let conversation_id = state.conversation_id.clone();
        self.mark_task(run_id, TaskStatus::Processing, None, None).await;

        // 只有循环自己因取消 / 超时停下时才记录；阶段本身失败与取消同时发生时按失败算
        let mut stopped = None;
        while !state.phase.is_terminal() {
            if let Some(reason) = guard.stop_reason() {
                stopped = Some(reason);
                let message = match reason {
                    StopReason::Cancelled => "cancelled",
                    StopReason::DeadlineExceeded => "run timed out",
                };
                tracing::warn!(conversation_id = %conversation_id, phase = %state.phase, "Run stopped: {}", message);
                state = state.fail(FailureClass::Retry, message);
                self.persist(&state, run_id, false, message).await;
                self.publish(&state, false, message);
                break;
            }

            let from = state.phase;
            let transition = self.advance(state, guard.token()).await;
            state = transition.state;
            tracing::info!(
                conversation_id = %conversation_id,
                from = %from,
                to = %state.phase,
                degraded = transition.degraded,
                "{}",
                transition.note
            );

            if from == Phase::Executing {
                for call in &state.remote_calls {
                    self.publish_call(&conversation_id, call);
                }
            }
            self.persist(&state, run_id, transition.degraded, &transition.note).await;
            self.publish(&state, transition.degraded, &transition.note);
        }

        match (state.phase, stopped) {
            (Phase::Complete, _) => {
                self.mark_task(run_id, TaskStatus::Completed, state.aggregated_result.clone(), None)
                    .await
            }
            (_, Some(StopReason::Cancelled)) => {
                self.mark_task(run_id, TaskStatus::Cancelled, None, Some("cancelled".into()))
                    .await
            }
            _ => {
                let error = state.error.as_ref().map(|e| e.message.clone());
                self.mark_task(run_id, TaskStatus::Failed, None, error).await
            }
        }
        tracing::info!(conversation_id = %conversation_id, task_id = run_id, phase = %state.phase, "Run finished");
        state
    }

    async fn persist(&self, state: &ConversationState, run_id: &str, degraded: bool, note: &str) {
        let metadata = CheckpointMetadata::new(run_id, state.phase)
            .degraded(degraded)
            .with_note(note);
        if let Err(e) = self
            .checkpoints
            .append(&state.conversation_id, state, metadata)
            .await
        {
            // 检查点写失败不终止本轮，只是该阶段无法恢复
            tracing::error!(conversation_id = %state.conversation_id, "Failed to append checkpoint: {}", e);
        }
    }

    fn publish(&self, state: &ConversationState, degraded: bool, note: &str) {
        let mut update = ProgressUpdate::new(state.phase, note);
        update.degraded = degraded;
        let event_type = match state.phase {
            Phase::Complete => {
                update.final_result = state.aggregated_result.clone();
                EventType::Final
            }
            Phase::Error => {
                if let Some(error) = &state.error {
                    update.message = error.message.clone();
                }
                EventType::Error
            }
            _ if degraded => EventType::Degraded,
            _ => EventType::Phase,
        };
        self.events
            .publish_progress(&state.conversation_id, event_type, &update);
    }

    fn publish_call(&self, conversation_id: &str, call: &RemoteCallRecord) {
        let payload = serde_json::to_value(call).unwrap_or(serde_json::Value::Null);
        self.events.publish(conversation_id, EventType::RemoteCall, payload);
    }

    async fn mark_task(&self, run_id: &str, status: TaskStatus, output: Option<String>, error: Option<String>) {
        if let Some(task) = self.tasks.get(run_id).await {
            if task.status == status {
                return;
            }
        }
        if let Err(e) = self.tasks.update_status(run_id, status, output, error).await {
            tracing::warn!(task_id = run_id, "Task status not updated: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // 状态迁移
    // ------------------------------------------------------------------

    /// 推进一个阶段；终态原样返回
    pub async fn advance(&self, state: ConversationState, cancel: &CancellationToken) -> Transition {
        match state.phase {
            Phase::Planning => self.plan(state).await,
            Phase::Routing => self.route(state).await,
            Phase::Executing => self.execute(state, cancel).await,
            Phase::Aggregating => self.aggregate(state).await,
            Phase::Complete | Phase::Error => Transition::new(state, "nothing to do"),
        }
    }

    /// 规划之前的历史（不含本轮请求），按上限截取最近的若干条
    fn prior_history<'a>(&self, state: &'a ConversationState) -> &'a [Message] {
        let prior = state
            .message_history
            .split_last()
            .map(|(_, rest)| rest)
            .unwrap_or_default();
        let skip = prior.len().saturating_sub(self.settings.max_history_messages);
        &prior[skip..]
    }

    async fn plan(&self, state: ConversationState) -> Transition {
        let Some(request) = state.latest_user_request().map(String::from) else {
            return Transition::new(state.fail(FailureClass::FixInput, "missing user input"), "missing user input");
        };

        let summary = self.agents.summary().await;
        let (context, prompt) = prompts::planning(&request, self.prior_history(&state), &summary);
        match self.llm.infer(&context, &prompt).await {
            Ok(plan) if !plan.trim().is_empty() => {
                let mut state = state;
                state.plan = Some(plan.trim().to_string());
                state.phase = Phase::Routing;
                Transition::new(state, "plan ready")
            }
            Ok(_) => Transition::new(
                state.fail(FailureClass::Retry, "planning produced no output"),
                "planning failed",
            ),
            Err(e) => {
                tracing::warn!(conversation_id = %state.conversation_id, "Planning inference failed: {}", e);
                Transition::new(
                    state.fail(FailureClass::Retry, format!("planning failed: {}", e)),
                    "planning failed",
                )
            }
        }
    }

    async fn route(&self, mut state: ConversationState) -> Transition {
        let request = state.latest_user_request().unwrap_or_default().to_string();
        let summary = self.agents.summary().await;
        let plan = state.plan.clone().unwrap_or_default();
        let (context, prompt) = prompts::routing(&plan, &request, &summary);

        let (tasks, degraded) = match self.llm.infer(&context, &prompt).await {
            Ok(output) => match validate_routing(&output, &self.agents).await {
                RoutingOutcome::Routed(tasks) => (tasks, false),
                RoutingOutcome::Malformed(reason) => {
                    tracing::warn!(conversation_id = %state.conversation_id, "Malformed routing output: {}", reason);
                    (self.recovery.fallback_route(&request, &self.agents).await, true)
                }
            },
            Err(e) => {
                tracing::warn!(conversation_id = %state.conversation_id, "Routing inference failed: {}", e);
                (self.recovery.fallback_route(&request, &self.agents).await, true)
            }
        };

        let note = if degraded {
            format!("fallback routing: {} task(s)", tasks.len())
        } else {
            format!("routed {} task(s)", tasks.len())
        };
        state.routing_decision = Some(tasks);
        state.phase = Phase::Executing;
        Transition::new(state, note).degraded(degraded)
    }

    async fn execute(&self, mut state: ConversationState, cancel: &CancellationToken) -> Transition {
        let tasks = state.routing_decision.clone().unwrap_or_default();
        if tasks.is_empty() {
            state.remote_calls = Vec::new();
            state.phase = Phase::Aggregating;
            return Transition::new(state, "no agent calls needed");
        }

        let conversation_id = state.conversation_id.clone();
        let conversation_id = conversation_id.as_str();
        let (parallel, sequential): (Vec<(usize, &RoutedTask)>, Vec<(usize, &RoutedTask)>) =
            tasks.iter().enumerate().partition(|(_, t)| t.parallel);

        // 串行链按提交顺序执行，与并行集合同时进行
        let sequential_chain = async {
            let mut records = Vec::with_capacity(sequential.len());
            for (i, task) in &sequential {
                records.push((*i, self.call(task, conversation_id, cancel).await));
            }
            records
        };
        let parallel_set = join_all(
            parallel
                .iter()
                .map(|(i, task)| async move { (*i, self.call(task, conversation_id, cancel).await) }),
        );
        let (sequential_records, parallel_records) = tokio::join!(sequential_chain, parallel_set);

        // 按路由顺序存放
        let mut slots: Vec<Option<RemoteCallRecord>> = vec![None; tasks.len()];
        for (i, record) in sequential_records.into_iter().chain(parallel_records) {
            slots[i] = Some(record);
        }
        state.remote_calls = slots
            .into_iter()
            .zip(&tasks)
            .map(|(slot, task)| {
                slot.unwrap_or_else(|| RemoteCallRecord::failed(&task.target_agent, "", "not executed"))
            })
            .collect();

        let succeeded = state.remote_calls.iter().filter(|c| c.is_success()).count();
        let note = format!("{}/{} agent call(s) succeeded", succeeded, state.remote_calls.len());
        state.phase = Phase::Aggregating;
        Transition::new(state, note)
    }

    async fn call(&self, task: &RoutedTask, conversation_id: &str, cancel: &CancellationToken) -> RemoteCallRecord {
        let Some(_permit) = self.scheduler.acquire_call().await else {
            return RemoteCallRecord::failed(&task.target_agent, "", "scheduler closed");
        };
        if cancel.is_cancelled() {
            return RemoteCallRecord::failed(&task.target_agent, "", "cancelled");
        }
        self.dispatcher
            .invoke_cancellable(&task.target_agent, &task.sub_request, conversation_id, &cancel.child_token())
            .await
    }

    async fn aggregate(&self, mut state: ConversationState) -> Transition {
        let request = state.latest_user_request().unwrap_or_default().to_string();
        let (context, prompt) = prompts::aggregation(&request, state.plan.as_deref(), &state.remote_calls);

        let (answer, degraded) = match self.llm.infer(&context, &prompt).await {
            Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), false),
            Ok(_) => {
                tracing::warn!(conversation_id = %state.conversation_id, "Aggregation produced no output, using fallback");
                (self.recovery.fallback_aggregate(&state.remote_calls), true)
            }
            Err(e) => {
                tracing::warn!(conversation_id = %state.conversation_id, "Aggregation inference failed: {}", e);
                (self.recovery.fallback_aggregate(&state.remote_calls), true)
            }
        };

        state.message_history.push(Message::assistant(answer.clone()));
        state.aggregated_result = Some(answer);
        state.phase = Phase::Complete;
        let note = if degraded { "fallback answer" } else { "answer ready" };
        Transition::new(state, note).degraded(degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentManifest, StaticManifestFetcher};
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::core::CallStatus;
    use crate::dispatch::{DispatchPolicy, MockEndpoint, MockWorkerClient};
    use crate::llm::{LlmError, MockLlmClient};

    const CURRENCY: &str = "http://localhost:10000";
    const GENERAL: &str = "http://localhost:10001";

    async fn orchestrator_with(
        llm: MockLlmClient,
        worker: MockWorkerClient,
        settings: OrchestratorSettings,
    ) -> Orchestrator {
        let manifests = [(CURRENCY, "Currency Agent", "currency"), (GENERAL, "General Agent", "time")]
            .into_iter()
            .map(|(endpoint, name, capability)| AgentManifest {
                endpoint: endpoint.into(),
                name: name.into(),
                description: String::new(),
                capabilities: vec![capability.into()],
                skills: vec![],
            });
        let agents = Arc::new(AgentRegistry::new(Arc::new(StaticManifestFetcher::new(manifests))));
        agents.discover_all(&[CURRENCY.into(), GENERAL.into()]).await;

        let policy = DispatchPolicy {
            poll_interval: Duration::from_millis(5),
            max_poll_attempts: 3,
            max_network_retries: 1,
            request_timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(1),
        };
        Orchestrator::new(
            Arc::new(llm),
            agents,
            Arc::new(Dispatcher::new(Arc::new(worker), policy)),
            Arc::new(TaskRegistry::new(100)),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(EventBus::default()),
            RecoveryEngine::from_config(&crate::config::RoutingSection::default()),
            TaskScheduler::new(4),
            settings,
        )
    }

    async fn orchestrator(llm: MockLlmClient, worker: MockWorkerClient) -> Orchestrator {
        orchestrator_with(llm, worker, OrchestratorSettings::default()).await
    }

    async fn wait_until_running(orch: &Orchestrator, conversation_id: &str) {
        for _ in 0..100 {
            if orch.is_running(conversation_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_advance_is_stepwise() {
        let llm = MockLlmClient::new()
            .when(prompts::PLANNING_HEADER, "ask the currency agent")
            .when(
                prompts::ROUTING_HEADER,
                r#"{"tasks": [{"target_agent": "Currency Agent", "sub_request": "5 USD to EUR", "parallel": false}]}"#,
            )
            .when(prompts::AGGREGATION_HEADER, "5 USD is 4.6 EUR");
        let orch = orchestrator(llm, MockWorkerClient::new()).await;
        let token = CancellationToken::new();

        let state = ConversationState::new("c", "5 USD to EUR?");
        let t = orch.advance(state, &token).await;
        assert_eq!(t.state.phase, Phase::Routing);
        assert_eq!(t.state.plan.as_deref(), Some("ask the currency agent"));

        let t = orch.advance(t.state, &token).await;
        assert_eq!(t.state.phase, Phase::Executing);
        assert!(!t.degraded);
        assert_eq!(t.state.routing_decision.as_ref().unwrap()[0].target_agent, CURRENCY);

        let t = orch.advance(t.state, &token).await;
        assert_eq!(t.state.phase, Phase::Aggregating);
        assert_eq!(t.state.remote_calls[0].status, CallStatus::Completed);

        let t = orch.advance(t.state, &token).await;
        assert_eq!(t.state.phase, Phase::Complete);
        assert_eq!(t.state.aggregated_result.as_deref(), Some("5 USD is 4.6 EUR"));
        assert_eq!(t.state.message_history.last().unwrap(), &Message::assistant("5 USD is 4.6 EUR"));
    }

    #[tokio::test]
    async fn test_planning_failure_is_retryable_error() {
        let llm = MockLlmClient::new().fail_when(prompts::PLANNING_HEADER, LlmError::Unavailable("down".into()));
        let worker = MockWorkerClient::new();
        let orch = orchestrator(llm, worker).await;

        let state = orch.submit("c", "hello").await.unwrap();
        assert_eq!(state.phase, Phase::Error);
        let error = state.error.unwrap();
        assert_eq!(error.class, FailureClass::Retry);
        assert!(error.message.contains("planning failed"));

        let tasks = orch.tasks().list(Some(TaskStatus::Failed), 10).await;
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_input_is_fix_input_error() {
        let orch = orchestrator(MockLlmClient::new(), MockWorkerClient::new()).await;
        let state = orch.submit("c", "   ").await.unwrap();
        assert_eq!(state.phase, Phase::Error);
        assert_eq!(state.error.unwrap().class, FailureClass::FixInput);
        assert!(matches!(
            orch.submit("", "hi").await,
            Err(OrchestratorError::MissingConversationId)
        ));
    }

    #[tokio::test]
    async fn test_zero_tasks_pass_through() {
        let llm = MockLlmClient::new()
            .when(prompts::PLANNING_HEADER, "just answer")
            .when(prompts::ROUTING_HEADER, r#"{"tasks": []}"#)
            .when(prompts::AGGREGATION_HEADER, "Hello!");
        let orch = orchestrator(llm, MockWorkerClient::new()).await;
        let state = orch.submit("c", "hi").await.unwrap();
        assert_eq!(state.phase, Phase::Complete);
        assert!(state.remote_calls.is_empty());
        assert_eq!(state.aggregated_result.as_deref(), Some("Hello!"));
    }

    #[tokio::test]
    async fn test_records_keep_routing_order() {
        let llm = MockLlmClient::new()
            .when(prompts::PLANNING_HEADER, "plan")
            .when(
                prompts::ROUTING_HEADER,
                r#"{"tasks": [
                    {"target_agent": "http://localhost:10001", "sub_request": "slow one", "parallel": true},
                    {"target_agent": "http://localhost:10000", "sub_request": "first in chain", "parallel": false},
                    {"target_agent": "http://localhost:10000", "sub_request": "second in chain", "parallel": false}
                ]}"#,
            )
            .when(prompts::AGGREGATION_HEADER, "done");
        let worker = MockWorkerClient::new()
            .with_endpoint(GENERAL, MockEndpoint::default().with_latency(Duration::from_millis(50)));
        let orch = orchestrator(llm, worker).await;

        let state = orch.submit("c", "do three things").await.unwrap();
        let results: Vec<&str> = state
            .remote_calls
            .iter()
            .map(|c| c.result.as_deref().unwrap())
            .collect();
        assert_eq!(
            results,
            vec![
                "[http://localhost:10001] slow one",
                "[http://localhost:10000] first in chain",
                "[http://localhost:10000] second in chain",
            ]
        );
    }

    #[tokio::test]
    async fn test_aggregation_failure_uses_fallback() {
        let llm = MockLlmClient::new()
            .when(prompts::PLANNING_HEADER, "plan")
            .when(
                prompts::ROUTING_HEADER,
                r#"{"tasks": [{"target_agent": "http://localhost:10000", "sub_request": "rate", "parallel": true}]}"#,
            )
            .fail_when(prompts::AGGREGATION_HEADER, LlmError::Timeout);
        let worker = MockWorkerClient::new().with_endpoint(CURRENCY, MockEndpoint::replying("1 USD = 0.92 EUR"));
        let orch = orchestrator(llm, worker).await;

        let state = orch.submit("c", "rate?").await.unwrap();
        assert_eq!(state.phase, Phase::Complete);
        assert_eq!(state.aggregated_result.as_deref(), Some("1 USD = 0.92 EUR"));

        let latest = orch.checkpoints().latest("c").await.unwrap().unwrap();
        assert!(latest.metadata.degraded);
    }

    #[tokio::test]
    async fn test_cancel_stops_run() {
        // 每次推理 100ms，取消一定落在规划阶段之内
        let llm = MockLlmClient::new()
            .when(prompts::PLANNING_HEADER, "plan")
            .with_delay(Duration::from_millis(100));
        let worker = MockWorkerClient::new();
        let orch = Arc::new(orchestrator(llm, worker).await);

        let runner = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.submit("c", "convert").await })
        };
        wait_until_running(&orch, "c").await;
        assert!(orch.cancel("c"));

        let state = runner.await.unwrap().unwrap();
        assert_eq!(state.phase, Phase::Error);
        assert_eq!(state.error.unwrap().message, "cancelled");
        assert!(state.plan.is_some());
        let cancelled = orch.tasks().list(Some(TaskStatus::Cancelled), 10).await;
        assert_eq!(cancelled.len(), 1);
        assert!(!orch.is_running("c"));
    }

    #[tokio::test]
    async fn test_phase_failure_during_cancel_is_recorded_as_failure() {
        // 规划本身失败，取消恰好在同一窗口到达
        let llm = MockLlmClient::new()
            .fail_when(prompts::PLANNING_HEADER, LlmError::Unavailable("down".into()))
            .with_delay(Duration::from_millis(100));
        let orch = Arc::new(orchestrator(llm, MockWorkerClient::new()).await);

        let runner = {
            let orch = Arc::clone(&orch);
            tokio::spawn(async move { orch.submit("c", "convert").await })
        };
        wait_until_running(&orch, "c").await;
        assert!(orch.cancel("c"));

        let state = runner.await.unwrap().unwrap();
        assert!(state.error.unwrap().message.contains("planning failed"));
        assert!(orch.tasks().list(Some(TaskStatus::Cancelled), 10).await.is_empty());
        let failed = orch.tasks().list(Some(TaskStatus::Failed), 10).await;
        assert_eq!(failed.len(), 1);
        assert!(failed[0].error.as_deref().unwrap().contains("planning failed"));
    }

    #[tokio::test]
    async fn test_run_timeout_fails_task() {
        let llm = MockLlmClient::new()
            .when(prompts::PLANNING_HEADER, "plan")
            .with_delay(Duration::from_millis(80));
        let settings = OrchestratorSettings {
            run_timeout: Some(Duration::from_millis(30)),
            ..Default::default()
        };
        let orch = orchestrator_with(llm, MockWorkerClient::new(), settings).await;

        let state = orch.submit("c", "convert").await.unwrap();
        assert_eq!(state.phase, Phase::Error);
        let error = state.error.unwrap();
        assert_eq!(error.class, FailureClass::Retry);
        assert_eq!(error.message, "run timed out");

        let latest = orch.checkpoints().latest("c").await.unwrap().unwrap();
        assert_eq!(latest.snapshot.phase, Phase::Error);
        assert_eq!(latest.metadata.note.as_deref(), Some("run timed out"));

        let failed = orch.tasks().list(Some(TaskStatus::Failed), 10).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.as_deref(), Some("run timed out"));
        assert!(orch.tasks().list(Some(TaskStatus::Cancelled), 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_maintenance_prunes_checkpoints_and_idle_channels() {
        let llm = MockLlmClient::new()
            .when(prompts::PLANNING_HEADER, "plan")
            .when(prompts::ROUTING_HEADER, r#"{"tasks": []}"#)
            .when(prompts::AGGREGATION_HEADER, "Hello!");
        let orch = orchestrator(llm, MockWorkerClient::new()).await;
        orch.submit("old", "hi").await.unwrap();
        orch.submit("watched", "hi").await.unwrap();
        let _watcher = orch.events().subscribe("watched", None);

        // 两个会话的检查点与事件都早于保留窗口
        tokio::time::sleep(Duration::from_millis(50)).await;
        orch.submit("fresh", "hi").await.unwrap();

        let policy = RetentionPolicy {
            tasks: Duration::from_secs(3600),
            checkpoints: Some(Duration::from_millis(30)),
            idle_channels: Duration::from_millis(30),
        };
        let report = orch.maintenance(&policy).await;
        assert_eq!(report.tasks, 0);
        assert_eq!(report.channels, 1);
        assert!(report.checkpoints > 0);

        assert!(orch.checkpoints().latest("old").await.unwrap().is_none());
        assert!(orch.checkpoints().latest("watched").await.unwrap().is_none());
        assert!(orch.checkpoints().latest("fresh").await.unwrap().is_some());

        assert!(orch.events().history("old").is_empty());
        assert!(!orch.events().history("watched").is_empty());
        assert!(!orch.events().history("fresh").is_empty());
        assert_eq!(orch.events().channel_count(), 2);

        // 不设置检查点保留时长时不清理检查点
        let keep = RetentionPolicy {
            checkpoints: None,
            ..policy
        };
        assert_eq!(orch.maintenance(&keep).await.checkpoints, 0);
        assert!(orch.checkpoints().latest("fresh").await.unwrap().is_some());
    }
}
