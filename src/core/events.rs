//! 观察者接口：进度与消息的尽力而为发布
//!
//! 终端仪表盘等前端通过实现 AgentObserver 接收事件；发布方不等待、不保证送达，
//! 订阅者的异常不得回传到发布方（实现侧自行吞掉）。默认 NoopObserver 不做任何事。

/// 日志 / 消息级别，对应 Agent 的叙述风格
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStyle {
    Info,
    Action,
    Thought,
    Result,
    Success,
    Warning,
    Error,
}

impl LogStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStyle::Info => "info",
            LogStyle::Action => "action",
            LogStyle::Thought => "thought",
            LogStyle::Result => "result",
            LogStyle::Success => "success",
            LogStyle::Warning => "warning",
            LogStyle::Error => "error",
        }
    }
}

/// 编排事件观察者：at-most-once，发布失败不影响流水线
pub trait AgentObserver: Send + Sync {
    /// 阶段进度更新（percent ∈ [0,100]）
    fn on_progress(&self, _phase: &str, _percent: f32, _detail: &str) {}

    /// Agent 文字消息
    fn on_message(&self, _agent: &str, _text: &str, _phase: &str, _level: LogStyle) {}
}

/// 默认空实现：未接前端时使用
#[derive(Debug, Default, Clone)]
pub struct NoopObserver;

impl AgentObserver for NoopObserver {}
