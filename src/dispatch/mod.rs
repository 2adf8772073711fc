//! 远程调用层：Worker 客户端抽象、A2A 实现、派发器与 Mock

pub mod a2a;
pub mod client;
pub mod dispatcher;
pub mod mock;

pub use a2a::A2aWorkerClient;
pub use client::{RemoteTaskSnapshot, RemoteTaskState, WorkerClient, WorkerError};
pub use dispatcher::{DispatchPolicy, Dispatcher};
pub use mock::{MockEndpoint, MockOutcome, MockWorkerClient};
