//! 任务登记表：带状态机校验的并发任务记录

pub mod registry;

pub use registry::{TaskError, TaskId, TaskRecord, TaskRegistry, TaskStatus};
