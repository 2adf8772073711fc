//! 核心编排层：状态与错误、路由解析、降级恢复、会话监管、调用调度、主控循环

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod prompts;
pub mod recovery;
pub mod routing;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;

pub use builder::{build_orchestrator, create_llm_from_config, offline_llm, OrchestratorBuilder};
pub use error::{FailureClass, OrchestratorError};
pub use orchestrator::{MaintenanceReport, Orchestrator, OrchestratorSettings, RetentionPolicy, Transition};
pub use recovery::RecoveryEngine;
pub use routing::{routing_schema, validate_routing, RoutingEntry, RoutingOutcome, RoutingPayload};
pub use session_supervisor::{RunGuard, SessionSupervisor, StopReason};
pub use state::{CallStatus, ConversationState, Message, Phase, RemoteCallRecord, Role, RoutedTask, RunFailure};
pub use task_scheduler::TaskScheduler;
