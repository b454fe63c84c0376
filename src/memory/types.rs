//! 记忆数据模型：记录、查询、生命周期分类
//!
//! MemoryRecord 的 content 为 serde_json::Value：纯文本为 Value::String，
//! 结构化数据（对象 / 数组）在写入时序列化为 JSON 文本、读取时还原（见 store.rs 的往返约定）。

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 记忆生命周期分类（粗粒度）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// 临时工作数据（计划、执行结果等）
    Working,
    /// 经历 / 交互（日志、评审、编排报告）
    Episodic,
    /// 技能 / 过程（单条子任务）
    Procedural,
    /// 事实 / 知识
    Semantic,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Working => "working",
            MemoryKind::Episodic => "episodic",
            MemoryKind::Procedural => "procedural",
            MemoryKind::Semantic => "semantic",
        }
    }
}

/// 单条记忆记录
///
/// `id` 在写入时分配，之后不变且不复用；`embedding` 仅在 content 为非空文本时存在。
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub id: String,
    pub kind: MemoryKind,
    pub content: Value,
    pub created_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
    pub tags: HashSet<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub embedding: Option<Vec<f32>>,
}

impl MemoryRecord {
    /// 是否已过期（相对给定时刻）
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| now > t).unwrap_or(false)
    }

    /// metadata 中的字符串字段快捷读取
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// 检索查询：先过滤（kind → tags），有 text 时再按余弦相似度排序并按阈值截断
#[derive(Debug, Clone)]
pub struct MemoryQuery {
    /// 相似度检索文本；为 None 时只做过滤
    pub text: Option<String>,
    pub kind: Option<MemoryKind>,
    /// 标签过滤：与记录 tags 有交集即命中
    pub tags: Option<HashSet<String>>,
    /// 结果上限
    pub limit: usize,
    /// 相似度阈值，低于此值的候选被丢弃（仅在 text 存在时生效）
    pub threshold: f32,
}

impl Default for MemoryQuery {
    fn default() -> Self {
        Self {
            text: None,
            kind: None,
            tags: None,
            limit: 10,
            threshold: 0.7,
        }
    }
}

impl MemoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_kind(mut self, kind: MemoryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }
}

/// 按 kind 统计的存量信息（store.stats() 返回值）
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub total: usize,
    pub working: usize,
    pub episodic: usize,
    pub procedural: usize,
    pub semantic: usize,
}
