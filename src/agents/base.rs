//! Agent 公共运行时：生命周期、日志入记忆、进度与错误处理
//!
//! 四个角色（Planner / Builder / Reviewer / Coordinator）不走继承，
//! 各自组合一个 AgentCore：共享记忆与观察者在构造时显式注入，不使用全局单例。
//! 每条日志除 tracing 输出外还会落为一条 episodic 记忆，供事后检索。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use crate::core::error::AgentError;
use crate::core::events::{AgentObserver, LogStyle};
use crate::memory::{MemoryKind, MemoryQuery, MemoryRecord, MemoryStore};

/// 单个 Agent 的公共内核
pub struct AgentCore {
    name: String,
    role: String,
    /// 观察者事件使用的阶段标签（plan / build / review / coord）
    phase: String,
    memory: Arc<MemoryStore>,
    observer: Arc<dyn AgentObserver>,
    active: AtomicBool,
    current_task: Mutex<Option<String>>,
}

impl AgentCore {
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        phase: impl Into<String>,
        memory: Arc<MemoryStore>,
        observer: Arc<dyn AgentObserver>,
    ) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            phase: phase.into(),
            memory,
            observer,
            active: AtomicBool::new(false),
            current_task: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    pub fn observer(&self) -> &Arc<dyn AgentObserver> {
        &self.observer
    }

    /// 标记激活；重复调用无副作用
    pub async fn initialize(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            self.log(
                &format!("{} ({}) initialized", self.name, self.role),
                LogStyle::Success,
            )
            .await;
        }
    }

    /// 标记停用；重复调用无副作用
    pub async fn shutdown(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.log(&format!("{} shutting down", self.name), LogStyle::Info)
                .await;
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// 记录一条日志：tracing 输出 + episodic 记忆 + 观察者消息
    pub async fn log(&self, message: &str, style: LogStyle) {
        match style {
            LogStyle::Error => tracing::error!(agent = %self.name, "{}", message),
            LogStyle::Warning => tracing::warn!(agent = %self.name, "{}", message),
            _ => tracing::info!(agent = %self.name, "[{}] {}", style.as_str(), message),
        }

        let current_task = self.current_task.lock().unwrap().clone();
        let mut metadata = Map::new();
        metadata.insert("agent".into(), Value::String(self.name.clone()));
        metadata.insert("log_style".into(), Value::String(style.as_str().into()));
        if let Some(task) = current_task {
            metadata.insert("current_task".into(), Value::String(task));
        }
        let tags: HashSet<String> = ["log", style.as_str(), self.name.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.memory
            .store(
                Value::String(message.to_string()),
                MemoryKind::Episodic,
                metadata,
                tags,
                None,
            )
            .await;

        self.observer
            .on_message(&self.name, message, &self.phase, style);
    }

    /// 更新当前任务进度（percent ∈ [0,100]）
    pub async fn update_progress(&self, percent: f32, status: &str) {
        let label = if status.is_empty() {
            format!("{percent:.0}%")
        } else {
            format!("{percent:.0}% - {status}")
        };
        *self.current_task.lock().unwrap() = Some(label);

        self.log(&format!("Progress: {percent:.0}% - {status}"), LogStyle::Info)
            .await;
        self.observer.on_progress(&self.phase, percent, status);
    }

    /// 统一错误处理：日志 + 持久化错误记录（带分类与展示链）。
    /// 只做记录；需要传播的错误由调用方继续上抛。
    pub async fn handle_error(&self, error: &AgentError, context: &str) {
        let message = if context.is_empty() {
            error.to_string()
        } else {
            format!("Error in {context}: {error}")
        };
        self.log(&message, LogStyle::Error).await;

        let mut metadata = Map::new();
        metadata.insert("agent".into(), Value::String(self.name.clone()));
        metadata.insert("error_kind".into(), Value::String(error.kind().into()));
        metadata.insert("context".into(), Value::String(context.to_string()));
        let tags: HashSet<String> = ["error", self.name.as_str(), error.kind()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.memory
            .store(
                json!({
                    "error_message": error.to_string(),
                    "error_kind": error.kind(),
                    "context": context,
                    "trace": format!("{error:?}"),
                }),
                MemoryKind::Episodic,
                metadata,
                tags,
                None,
            )
            .await;
    }

    /// 相似度检索记忆
    pub async fn search_memory(
        &self,
        text: &str,
        kind: Option<MemoryKind>,
        limit: usize,
    ) -> Vec<MemoryRecord> {
        let mut query = MemoryQuery::new().with_text(text).with_limit(limit);
        query.kind = kind;
        self.memory.retrieve(&query).await
    }

    /// 存储一条任务结果（working 记忆，自动附加 result / 自身名字标签）
    pub async fn store_result(&self, result: Value, extra_tags: HashSet<String>) -> String {
        let mut metadata = Map::new();
        metadata.insert("agent".into(), Value::String(self.name.clone()));
        metadata.insert("task_result".into(), Value::Bool(true));
        if let Some(task) = self.current_task.lock().unwrap().clone() {
            metadata.insert("current_task".into(), Value::String(task));
        }
        let mut tags = extra_tags;
        tags.insert("result".into());
        tags.insert(self.name.clone());

        let id = self
            .memory
            .store(result, MemoryKind::Working, metadata, tags, None)
            .await;
        self.log(&format!("Stored result in memory: {}", &id[..8]), LogStyle::Info)
            .await;
        id
    }

    /// 写入键值上下文（working 记忆，按 context_key 检索）
    pub async fn set_context(&self, key: &str, value: Value) {
        let mut metadata = Map::new();
        metadata.insert("context_key".into(), Value::String(key.to_string()));
        metadata.insert("agent".into(), Value::String(self.name.clone()));
        let tags: HashSet<String> = ["context", key, self.name.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.memory
            .store(value, MemoryKind::Working, metadata, tags, None)
            .await;
    }

    /// 读取键值上下文：按标签过滤取最新一条
    pub async fn get_context(&self, key: &str) -> Option<Value> {
        let query = MemoryQuery::new()
            .with_kind(MemoryKind::Working)
            .with_tags(["context"])
            .with_limit(100);
        let mut results: Vec<MemoryRecord> = self
            .memory
            .retrieve(&query)
            .await
            .into_iter()
            .filter(|r| r.meta_str("context_key") == Some(key))
            .collect();
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        results.into_iter().next().map(|r| r.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::NoopObserver;
    use crate::memory::HashVectorizer;

    fn new_core() -> AgentCore {
        let store = Arc::new(MemoryStore::new(Arc::new(HashVectorizer::new())));
        AgentCore::new("Tester", "Unit Testing", "test", store, Arc::new(NoopObserver))
    }

    #[tokio::test]
    async fn test_lifecycle_idempotent() {
        let core = new_core();
        assert!(!core.is_active());
        core.initialize().await;
        core.initialize().await;
        assert!(core.is_active());
        let logs_after_init = core.memory().stats().await.episodic;

        core.shutdown().await;
        core.shutdown().await;
        assert!(!core.is_active());
        // 重复 shutdown 不追加日志
        assert_eq!(core.memory().stats().await.episodic, logs_after_init + 1);
    }

    #[tokio::test]
    async fn test_log_persists_episodic_record() {
        let core = new_core();
        core.log("hello", LogStyle::Action).await;
        let results = core
            .memory()
            .retrieve(
                &MemoryQuery::new()
                    .with_kind(MemoryKind::Episodic)
                    .with_tags(["log"]),
            )
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, Value::String("hello".into()));
        assert_eq!(results[0].meta_str("log_style"), Some("action"));
    }

    #[tokio::test]
    async fn test_store_result_tags() {
        let core = new_core();
        let id = core
            .store_result(json!({"ok": true}), ["build"].iter().map(|s| s.to_string()).collect())
            .await;
        let record = core.memory().get(&id).await.unwrap();
        assert!(record.tags.contains("result"));
        assert!(record.tags.contains("Tester"));
        assert!(record.tags.contains("build"));
        assert_eq!(record.content, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_context_roundtrip() {
        let core = new_core();
        core.set_context("framework", Value::String("axum".into())).await;
        core.set_context("framework", Value::String("actix".into())).await;
        // 取最新一条
        assert_eq!(core.get_context("framework").await, Some(Value::String("actix".into())));
        assert_eq!(core.get_context("missing").await, None);
    }

    #[tokio::test]
    async fn test_search_memory_by_similarity() {
        let core = new_core();
        core.store_result(Value::String("implement the parser".into()), HashSet::new())
            .await;
        // 完全相同的文本：相似度 1.0，必然越过默认阈值
        let results = core
            .search_memory("implement the parser", Some(MemoryKind::Working), 5)
            .await;
        assert!(results
            .iter()
            .any(|r| r.content == Value::String("implement the parser".into())));
    }

    #[tokio::test]
    async fn test_handle_error_persists_record() {
        let core = new_core();
        let err = AgentError::Precondition("no plan".into());
        core.handle_error(&err, "building").await;
        let results = core
            .memory()
            .retrieve(
                &MemoryQuery::new()
                    .with_kind(MemoryKind::Episodic)
                    .with_tags(["error"]),
            )
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].meta_str("error_kind"), Some("precondition"));
        assert_eq!(results[0].content["context"], Value::String("building".into()));
    }
}
