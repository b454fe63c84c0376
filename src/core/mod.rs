//! 核心层：错误分类、阶段重试策略、观察者事件

pub mod error;
pub mod events;
pub mod retry;

pub use error::AgentError;
pub use events::{AgentObserver, LogStyle, NoopObserver};
pub use retry::RetryPolicy;
