//! 进度事件总线：按会话发布 / 订阅，带有界历史用于断线回放

pub mod bus;
pub mod event;

pub use bus::{EventBus, Subscription};
pub use event::{EventType, ProgressUpdate, StreamEvent};
