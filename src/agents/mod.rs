//! Agent 角色层：Planner / Builder / Reviewer / Coordinator
//!
//! 统一契约：`initialize` / `shutdown` / `process_task`。子任务级的可恢复失败
//! 不得从 `process_task` 抛出（见 builder）；阶段级失败以 AgentError 上抛，
//! 由 Coordinator 的重试策略兜底。

pub mod base;
pub mod builder;
pub mod coordinator;
pub mod planner;
pub mod reviewer;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::error::AgentError;

pub use base::AgentCore;
pub use builder::{BuilderAgent, BuilderConfig, ExecutionMode, SubtaskResult};
pub use coordinator::{CoordinatorAgent, CoordinatorConfig};
pub use planner::{OptimizationGoal, PlannerAgent, TaskCategory};
pub use reviewer::{ReviewerAgent, ReviewerConfig};

/// 任务上下文：任意键值对，随阶段传递并整体写入计划记录
pub type TaskContext = serde_json::Map<String, Value>;

/// 角色能力接口：Coordinator 组合（has-a）其余三个角色，不做继承
#[async_trait]
pub trait Agent: Send + Sync {
    fn core(&self) -> &AgentCore;

    /// 处理一个任务，返回角色相关的结构化结果
    async fn process_task(&self, task: &str, context: &TaskContext) -> Result<Value, AgentError>;

    async fn initialize(&self) {
        self.core().initialize().await;
    }

    async fn shutdown(&self) {
        self.core().shutdown().await;
    }
}
