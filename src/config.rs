//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__DISPATCH__MAX_POLL_ATTEMPTS=20`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agents: AgentsSection,
    pub dispatch: DispatchSection,
    pub tasks: TasksSection,
    pub checkpoint: CheckpointSection,
    pub events: EventsSection,
    pub routing: RoutingSection,
    pub web: WebSection,
}

/// [app] 段：应用名、整轮运行超时、历史消息上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 整轮编排的软超时（秒），未设置则不限
    pub run_timeout_secs: Option<u64>,
    /// 推理上下文中携带的历史消息条数
    pub max_history_messages: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            run_timeout_secs: None,
            max_history_messages: 20,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai（任意 OpenAI 兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 单次推理超时（秒）
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            timeout_secs: 60,
        }
    }
}

/// [agents] 段：远程 Worker 地址、API Key、发现超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    pub endpoints: Vec<String>,
    /// endpoint -> X-API-Key
    pub api_keys: HashMap<String, String>,
    pub discovery_timeout_secs: u64,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            endpoints: vec![
                "http://localhost:10000".into(),
                "http://localhost:10001".into(),
            ],
            api_keys: HashMap::new(),
            discovery_timeout_secs: 5,
        }
    }
}

/// [dispatch] 段：轮询间隔、轮询次数、网络重试、并行上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub poll_interval_ms: u64,
    pub max_poll_attempts: u32,
    pub max_network_retries: u32,
    /// 单次 submit/poll 请求超时（秒）
    pub request_timeout_secs: u64,
    pub max_parallel_calls: usize,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_poll_attempts: 10,
            max_network_retries: 2,
            request_timeout_secs: 30,
            max_parallel_calls: 4,
        }
    }
}

impl DispatchSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// [tasks] 段：任务表容量与保留时长
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TasksSection {
    pub max_tasks: usize,
    /// 终态任务保留时长（秒），超过后可被清理
    pub retention_secs: u64,
}

impl Default for TasksSection {
    fn default() -> Self {
        Self {
            max_tasks: 1000,
            retention_secs: 3600,
        }
    }
}

/// 检查点后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    Memory,
    Sqlite,
}

/// [checkpoint] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    pub backend: CheckpointBackend,
    /// SQLite 文件路径，未设置时用 ./data/checkpoints.db
    pub path: Option<PathBuf>,
    /// 检查点保留时长（秒）；不设置则永久保留
    pub retention_secs: Option<u64>,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::Memory,
            path: None,
            retention_secs: Some(7 * 24 * 3600),
        }
    }
}

/// [events] 段：每会话历史环形缓冲与订阅者缓冲大小
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    pub history_size: usize,
    pub subscriber_buffer: usize,
    /// 无订阅者且超过该时长（秒）没有活动的会话流会被回收
    pub idle_secs: u64,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            history_size: 100,
            subscriber_buffer: 100,
            idle_secs: 3600,
        }
    }
}

/// 关键词兜底路由规则：命中任一关键词即按 capability 查找 Agent
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackRule {
    pub keywords: Vec<String>,
    pub capability: String,
}

/// [routing] 段：推理输出无法解析时的关键词兜底
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub fallback_rules: Vec<FallbackRule>,
    /// 没有规则命中时的兜底 Agent
    pub default_endpoint: Option<String>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            fallback_rules: default_fallback_rules(),
            default_endpoint: None,
        }
    }
}

fn default_fallback_rules() -> Vec<FallbackRule> {
    vec![
        FallbackRule {
            keywords: vec![
                "currency".into(),
                "exchange".into(),
                "usd".into(),
                "eur".into(),
                "jpy".into(),
                "krw".into(),
                "환율".into(),
                "환전".into(),
                "달러".into(),
                "유로".into(),
            ],
            capability: "currency".into(),
        },
        FallbackRule {
            keywords: vec![
                "hotel".into(),
                "booking".into(),
                "호텔".into(),
                "숙박".into(),
            ],
            capability: "hotel".into(),
        },
        FallbackRule {
            keywords: vec![
                "time".into(),
                "timezone".into(),
                "clock".into(),
                "시간".into(),
                "몇시".into(),
            ],
            capability: "time".into(),
        },
    ]
}

/// [web] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSection {
    pub host: String,
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10002,
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
