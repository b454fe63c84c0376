//! Agent 错误类型
//!
//! 传播策略：子任务级失败（Subtask）永远在执行引擎内部被捕获并记入结果，不向调用方抛出；
//! 阶段级失败由 Coordinator 的重试策略自动重试，耗尽后以 StageExhausted 上抛。

use thiserror::Error;

/// 编排流水线中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 必需输入缺失或格式错误（plan id、子任务列表、执行数据等），同步中止当前阶段的单次调用
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// 按 id 查找无结果；在依赖该记录的调用点以前置条件错误呈现
    #[error("Memory record not found: {0}")]
    NotFound(String),

    /// 单条子任务执行失败；仅在结果记录中出现，不会从执行引擎逃逸
    #[error("Subtask {index} failed: {reason}")]
    Subtask { index: usize, reason: String },

    /// 阶段在重试策略内耗尽全部尝试；对整个编排是致命的，不落任何部分报告
    #[error("Stage '{stage}' exhausted after {attempts} attempts: {last}")]
    StageExhausted {
        stage: String,
        attempts: usize,
        #[source]
        last: Box<AgentError>,
    },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AgentError {
    /// 错误分类名（持久化错误记录用）
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Precondition(_) => "precondition",
            AgentError::NotFound(_) => "not_found",
            AgentError::Subtask { .. } => "subtask",
            AgentError::StageExhausted { .. } => "stage_exhausted",
            AgentError::Serde(_) => "serde",
        }
    }
}
