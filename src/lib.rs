//! Hive - 多 Agent 编排器
//!
//! 一轮用户请求依次经过 规划 -> 路由 -> 执行 -> 汇总：
//! 推理后端决定要调用哪些远程 Worker Agent，派发器提交并轮询远程任务，最后把结果汇总成一个回答。
//!
//! 模块划分：
//! - **agents**: Agent Card 发现与注册表
//! - **checkpoint**: 阶段快照持久化（内存 / SQLite），支持中断后恢复
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态机、路由解析、降级恢复、会话监管、调用调度
//! - **dispatch**: 远程调用（A2A JSON-RPC 提交 + 轮询）
//! - **events**: 按会话的进度事件总线（环形缓冲重放）
//! - **llm**: 推理客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化
//! - **tasks**: 任务登记与状态跟踪

pub mod agents;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod events;
pub mod llm;
pub mod observability;
pub mod tasks;

pub use crate::core::{build_orchestrator, ConversationState, Orchestrator, OrchestratorBuilder, Phase};
