//! 编排器构建：按配置组装 LLM、Agent 注册表、派发器、任务表、检查点、事件总线
//!
//! CLI 与 Web 共用同一套组装逻辑；测试可替换 LLM / Worker 客户端 / Agent Card 来源。

use std::sync::Arc;
use std::time::Duration;

use crate::agents::{AgentRegistry, HttpManifestFetcher, ManifestFetcher};
use crate::checkpoint::{create_checkpoint_store, CheckpointStore};
use crate::config::AppConfig;
use crate::core::prompts::{AGGREGATION_HEADER, ROUTING_HEADER};
use crate::core::{Orchestrator, OrchestratorSettings, RecoveryEngine, TaskScheduler};
use crate::dispatch::{A2aWorkerClient, DispatchPolicy, Dispatcher, WorkerClient};
use crate::events::EventBus;
use crate::llm::{create_deepseek_client, LlmClient, LlmError, MockLlmClient, OpenAiClient};
use crate::tasks::TaskRegistry;

/// 离线推理：规划回显请求；路由与汇总报不可用，走关键词兜底与结果拼接
pub fn offline_llm() -> MockLlmClient {
    MockLlmClient::new()
        .fail_when(ROUTING_HEADER, LlmError::Unavailable("offline mode".into()))
        .fail_when(AGGREGATION_HEADER, LlmError::Unavailable("offline mode".into()))
}

/// 根据配置与环境变量选择 LLM 后端
///
/// provider = "mock" 时直接用 Mock；有 DeepSeek Key（或 provider = "deepseek"）走 DeepSeek；
/// 有 OPENAI_API_KEY 走 OpenAI 兼容端点；都没有则退回 Mock（离线模式）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let timeout = Duration::from_secs(cfg.llm.timeout_secs.max(1));

    if provider == "mock" {
        tracing::info!("Using offline Mock LLM (configured)");
        return Arc::new(offline_llm());
    }

    let has_deepseek_key = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let has_openai_key = std::env::var("OPENAI_API_KEY").is_ok();

    if has_deepseek_key || (provider == "deepseek" && has_openai_key) {
        let model = if provider == "deepseek" {
            Some(cfg.llm.model.as_str())
        } else {
            None
        };
        let client = create_deepseek_client(model, timeout);
        tracing::info!("Using DeepSeek LLM ({})", client.model());
        Arc::new(client)
    } else if has_openai_key {
        tracing::info!("Using OpenAI-compatible LLM ({})", cfg.llm.model);
        Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            None,
            timeout,
        ))
    } else {
        tracing::warn!("No API key set, using Mock LLM (routing will use keyword fallback)");
        Arc::new(offline_llm())
    }
}

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    worker_client: Option<Arc<dyn WorkerClient>>,
    manifest_fetcher: Option<Arc<dyn ManifestFetcher>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            worker_client: None,
            manifest_fetcher: None,
            checkpoints: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_worker_client(mut self, client: Arc<dyn WorkerClient>) -> Self {
        self.worker_client = Some(client);
        self
    }

    pub fn with_manifest_fetcher(mut self, fetcher: Arc<dyn ManifestFetcher>) -> Self {
        self.manifest_fetcher = Some(fetcher);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// 组装并发现配置中的所有 Agent；单个 Agent 发现失败只记日志
    pub async fn build(self) -> anyhow::Result<Orchestrator> {
        let cfg = self.config;

        let llm = match self.llm {
            Some(llm) => llm,
            None => create_llm_from_config(&cfg),
        };

        let worker_client: Arc<dyn WorkerClient> = match self.worker_client {
            Some(client) => client,
            None => Arc::new(A2aWorkerClient::new(
                cfg.dispatch.request_timeout(),
                cfg.agents.api_keys.clone(),
            )?),
        };

        let fetcher: Arc<dyn ManifestFetcher> = match self.manifest_fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpManifestFetcher::new(Duration::from_secs(
                cfg.agents.discovery_timeout_secs.max(1),
            ))?),
        };
        let agents = Arc::new(AgentRegistry::new(fetcher));
        let discovered = agents.discover_all(&cfg.agents.endpoints).await;
        if discovered == 0 && !cfg.agents.endpoints.is_empty() {
            tracing::warn!("No agents could be discovered; every run will answer without agent calls");
        } else {
            tracing::info!("Discovered {}/{} agents", discovered, cfg.agents.endpoints.len());
        }

        let checkpoints = match self.checkpoints {
            Some(store) => store,
            None => create_checkpoint_store(&cfg.checkpoint),
        };

        let settings = OrchestratorSettings {
            run_timeout: cfg.app.run_timeout_secs.map(Duration::from_secs),
            max_history_messages: cfg.app.max_history_messages,
        };

        Ok(Orchestrator::new(
            llm,
            agents,
            Arc::new(Dispatcher::new(worker_client, DispatchPolicy::from(&cfg.dispatch))),
            Arc::new(TaskRegistry::new(cfg.tasks.max_tasks)),
            checkpoints,
            Arc::new(EventBus::new(cfg.events.history_size, cfg.events.subscriber_buffer)),
            RecoveryEngine::from_config(&cfg.routing),
            TaskScheduler::new(cfg.dispatch.max_parallel_calls),
            settings,
        ))
    }
}

/// 按配置构建编排器（真实 LLM / A2A 客户端）
pub async fn build_orchestrator(cfg: AppConfig) -> anyhow::Result<Orchestrator> {
    OrchestratorBuilder::new(cfg).build().await
}
