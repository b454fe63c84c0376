//! Swarm - Rust 多智能体编排系统
//!
//! 模块划分：
//! - **agents**: Planner / Builder / Reviewer / Coordinator 四个角色与公共基座
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、阶段重试策略、观察者事件
//! - **memory**: 共享记忆存储、数据模型、伪嵌入向量化
//! - **observability**: tracing 初始化

pub mod agents;
pub mod config;
pub mod core;
pub mod memory;
pub mod observability;

pub use agents::{
    Agent, BuilderAgent, BuilderConfig, CoordinatorAgent, CoordinatorConfig, ExecutionMode,
    PlannerAgent, ReviewerAgent, ReviewerConfig, TaskContext,
};
pub use crate::core::{AgentError, AgentObserver, NoopObserver, RetryPolicy};
pub use memory::{MemoryKind, MemoryQuery, MemoryRecord, MemoryStore};
