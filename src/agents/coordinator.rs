//! Coordinator：三阶段流水线编排
//!
//! planning → building → reviewing，每个阶段经由同一个 RetryPolicy
//! 执行（指数退避，耗尽抛 StageExhausted，后续阶段不再运行）。
//! 阶段间不传内存引用：每个阶段结束后按记录签名从共享记忆重新发现
//! 权威记录 id，找不到视为阶段失败，同样走重试。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::agents::base::AgentCore;
use crate::agents::builder::{BuilderAgent, BuilderConfig, ExecutionMode};
use crate::agents::planner::PlannerAgent;
use crate::agents::reviewer::{ReviewerAgent, ReviewerConfig};
use crate::agents::{Agent, TaskContext};
use crate::core::error::AgentError;
use crate::core::events::{AgentObserver, LogStyle};
use crate::core::retry::RetryPolicy;
use crate::memory::{MemoryKind, MemoryQuery, MemoryRecord, MemoryStore};

/// Coordinator 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// 每个阶段首次之外允许的重试次数
    pub max_retries: usize,
    /// Builder 走并行模式
    pub enable_parallel: bool,
    /// 传给 Builder 的全局快速模式
    pub fast_mode: bool,
    /// 退避基准毫秒数（第 n 次失败后等 backoff_unit_ms * 2^n）
    pub backoff_unit_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            enable_parallel: false,
            fast_mode: false,
            backoff_unit_ms: 1000,
        }
    }
}

/// 编排 Agent：持有三个下游 Agent，共享同一个记忆存储
pub struct CoordinatorAgent {
    core: AgentCore,
    config: CoordinatorConfig,
    planner: PlannerAgent,
    builder: BuilderAgent,
    reviewer: ReviewerAgent,
    retry: RetryPolicy,
    active: Mutex<HashMap<String, Value>>,
}

impl CoordinatorAgent {
    pub fn new(
        config: CoordinatorConfig,
        mut builder_config: BuilderConfig,
        reviewer_config: ReviewerConfig,
        memory: Arc<MemoryStore>,
        observer: Arc<dyn AgentObserver>,
    ) -> Self {
        builder_config.execution_mode = if config.enable_parallel {
            ExecutionMode::Parallel
        } else {
            ExecutionMode::Sequential
        };
        builder_config.fast_mode = builder_config.fast_mode || config.fast_mode;

        let retry = RetryPolicy::new(config.max_retries)
            .with_base_delay(Duration::from_millis(config.backoff_unit_ms));

        Self {
            core: AgentCore::new(
                "Coordinator",
                "Multi-Agent Orchestration",
                "coord",
                memory.clone(),
                observer.clone(),
            ),
            config,
            planner: PlannerAgent::new(memory.clone(), observer.clone()),
            builder: BuilderAgent::new(builder_config, memory.clone(), observer.clone()),
            reviewer: ReviewerAgent::new(reviewer_config, memory, observer),
            retry,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// 完整流水线：规划 → 执行 → 评审，成功后落编排报告
    pub async fn orchestrate(
        &self,
        task: &str,
        context: &TaskContext,
    ) -> Result<Value, AgentError> {
        let orchestration_id = format!("orch_{}", Uuid::new_v4().simple());
        let started_at = Utc::now();
        let started = Instant::now();

        self.core
            .log(&format!("Starting orchestration: {task}"), LogStyle::Action)
            .await;
        self.core
            .update_progress(10.0, "Initializing orchestration")
            .await;
        self.set_status(
            &orchestration_id,
            json!({
                "task": task,
                "status": "running",
                "started_at": started_at.to_rfc3339(),
            }),
        );

        let result = self
            .run_pipeline(task, context, &orchestration_id, started_at, started)
            .await;

        match &result {
            Ok(report) => {
                self.set_status(
                    &orchestration_id,
                    json!({
                        "task": task,
                        "status": "complete",
                        "result": report,
                    }),
                );
                self.core
                    .log(
                        &format!("Orchestration {orchestration_id} completed successfully"),
                        LogStyle::Success,
                    )
                    .await;
            }
            Err(e) => {
                self.set_status(
                    &orchestration_id,
                    json!({
                        "task": task,
                        "status": "failed",
                        "error": e.to_string(),
                    }),
                );
                self.core.handle_error(e, "orchestration").await;
            }
        }

        result
    }

    async fn run_pipeline(
        &self,
        task: &str,
        context: &TaskContext,
        orchestration_id: &str,
        started_at: chrono::DateTime<Utc>,
        started: Instant,
    ) -> Result<Value, AgentError> {
        // 阶段 1：规划
        self.core
            .log("Stage 1: Planning task", LogStyle::Thought)
            .await;
        self.core.update_progress(20.0, "Planning phase").await;
        let plan_result = self
            .retry
            .run("planning", || self.run_planner_stage(task, context))
            .await?;
        let plan_id = plan_result["plan_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.core
            .log(&format!("Planning complete: {}", &plan_id[..8]), LogStyle::Success)
            .await;

        // 阶段 2：执行
        self.core
            .log("Stage 2: Executing plan", LogStyle::Thought)
            .await;
        self.core.update_progress(50.0, "Building phase").await;
        let execution_result = self
            .retry
            .run("building", || self.run_builder_stage(task, &plan_id, context))
            .await?;
        let execution_id = execution_result["execution_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.core
            .log(
                &format!("Building complete: {}", &execution_id[..8]),
                LogStyle::Success,
            )
            .await;

        // 阶段 3：评审
        self.core
            .log("Stage 3: Reviewing execution", LogStyle::Thought)
            .await;
        self.core.update_progress(80.0, "Review phase").await;
        let review_result = self
            .retry
            .run("reviewing", || self.run_reviewer_stage(&plan_id, &execution_id))
            .await?;
        let review_id = review_result["review_id"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.core
            .log(&format!("Review complete: {}", &review_id[..8]), LogStyle::Success)
            .await;

        self.core.update_progress(100.0, "Compiling results").await;
        let finished_at = Utc::now();
        let duration_ms = started.elapsed().as_millis() as u64;

        let report = json!({
            "orchestration_id": orchestration_id,
            "task": task,
            "plan_id": plan_id,
            "execution_id": execution_id,
            "review_id": review_id,
            "summary": {
                "accuracy": review_result["accuracy"],
                "quality": review_result["quality"],
                "final_score": review_result["final_score"],
                "notes": review_result["notes"],
            },
            "stage_results": {
                "planning": plan_result,
                "building": execution_result,
                "reviewing": review_result,
            },
            "metadata": {
                "parallel_enabled": self.config.enable_parallel,
                "fast_mode": self.config.fast_mode,
                "started_at": started_at.to_rfc3339(),
                "finished_at": finished_at.to_rfc3339(),
                "duration_ms": duration_ms,
            },
        });

        self.store_orchestration(&report).await;
        Ok(report)
    }

    /// 规划阶段：调 Planner，再按签名从记忆重新发现计划 id
    async fn run_planner_stage(
        &self,
        task: &str,
        context: &TaskContext,
    ) -> Result<Value, AgentError> {
        let summary = self.planner.process_task(task, context).await?;

        let query = MemoryQuery::new()
            .with_kind(MemoryKind::Working)
            .with_tags(["plan"])
            .with_limit(20);
        let mut plans: Vec<MemoryRecord> = self
            .core
            .memory()
            .retrieve(&query)
            .await
            .into_iter()
            .filter(|r| {
                r.meta_str("plan_type") == Some("task_decomposition")
                    && r.content.get("original_task").and_then(Value::as_str) == Some(task)
            })
            .collect();
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let plan = plans.into_iter().next().ok_or_else(|| {
            AgentError::NotFound("no plan generated by planner".to_string())
        })?;

        if !plan.content.is_object() {
            return Err(AgentError::Precondition(format!(
                "plan {} is malformed",
                plan.id
            )));
        }

        Ok(json!({
            "plan_id": plan.id,
            "summary": summary,
            "stage": "planning",
        }))
    }

    /// 执行阶段：把计划数据连同调用方上下文交给 Builder（调用方键覆盖
    /// 计划派生键），结束后重新发现聚合执行记录 id
    async fn run_builder_stage(
        &self,
        task: &str,
        plan_id: &str,
        context: &TaskContext,
    ) -> Result<Value, AgentError> {
        let plan = self.core.memory().get(plan_id).await.ok_or_else(|| {
            AgentError::NotFound(format!("plan {plan_id} not found"))
        })?;
        let plan_data = plan.content.as_object().ok_or_else(|| {
            AgentError::Precondition(format!("plan {plan_id} is malformed"))
        })?;
        let subtasks = plan_data
            .get("subtasks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if subtasks.is_empty() {
            return Err(AgentError::Precondition(format!(
                "no subtasks found in plan {plan_id}"
            )));
        }

        let mut build_context = TaskContext::new();
        build_context.insert("plan_id".into(), Value::String(plan_id.to_string()));
        build_context.insert("plan_data".into(), Value::Object(plan_data.clone()));
        build_context.insert("subtasks".into(), Value::Array(subtasks));
        if self.config.fast_mode {
            build_context.insert("fast_mode".into(), Value::Bool(true));
        }
        for (key, value) in context {
            build_context.insert(key.clone(), value.clone());
        }

        let summary = self.builder.process_task(task, &build_context).await?;

        let query = MemoryQuery::new()
            .with_kind(MemoryKind::Working)
            .with_tags(["execution"])
            .with_limit(20);
        let mut executions: Vec<MemoryRecord> = self
            .core
            .memory()
            .retrieve(&query)
            .await
            .into_iter()
            .filter(|r| {
                r.tags.contains("complete")
                    && r.meta_str("agent") == Some("Builder")
                    && r.content.get("task").and_then(Value::as_str) == Some(task)
            })
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let execution = executions.into_iter().next().ok_or_else(|| {
            AgentError::NotFound("no execution generated by builder".to_string())
        })?;

        Ok(json!({
            "execution_id": execution.id,
            "summary": summary,
            "stage": "building",
        }))
    }

    /// 评审阶段：执行数据直接入上下文，结束后重新发现评审记录 id
    async fn run_reviewer_stage(
        &self,
        plan_id: &str,
        execution_id: &str,
    ) -> Result<Value, AgentError> {
        let execution = self.core.memory().get(execution_id).await.ok_or_else(|| {
            AgentError::NotFound(format!("execution {execution_id} not found"))
        })?;
        if !execution.content.is_object() {
            return Err(AgentError::Precondition(format!(
                "execution {execution_id} is malformed"
            )));
        }

        let original_task = self
            .core
            .memory()
            .get(plan_id)
            .await
            .and_then(|p| {
                p.content
                    .get("original_task")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "task".to_string());

        let mut review_context = TaskContext::new();
        review_context.insert("plan_id".into(), Value::String(plan_id.to_string()));
        review_context.insert("execution_id".into(), Value::String(execution_id.to_string()));
        review_context.insert("execution_data".into(), execution.content);
        review_context.insert("review_mode".into(), Value::String("auto".into()));

        let mut review = self
            .reviewer
            .process_task(&format!("Review execution of: {original_task}"), &review_context)
            .await?;

        let query = MemoryQuery::new()
            .with_kind(MemoryKind::Episodic)
            .with_tags(["review"])
            .with_limit(20);
        let mut reviews: Vec<MemoryRecord> = self
            .core
            .memory()
            .retrieve(&query)
            .await
            .into_iter()
            .filter(|r| {
                r.meta_str("review_type") == Some("execution_review")
                    && r.content.get("plan_id").and_then(Value::as_str) == Some(plan_id)
            })
            .collect();
        reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let stored = reviews.into_iter().next().ok_or_else(|| {
            AgentError::NotFound("no review generated by reviewer".to_string())
        })?;

        if let Some(obj) = review.as_object_mut() {
            obj.insert("review_id".into(), Value::String(stored.id));
            obj.insert("stage".into(), Value::String("reviewing".into()));
        }
        Ok(review)
    }

    async fn store_orchestration(&self, report: &Value) {
        let mut metadata = Map::new();
        metadata.insert("agent".into(), Value::String(self.core.name().into()));
        metadata.insert(
            "orchestration_type".into(),
            Value::String("full_pipeline".into()),
        );
        metadata.insert("task".into(), report["task"].clone());
        metadata.insert("final_score".into(), report["summary"]["final_score"].clone());
        metadata.insert("accuracy".into(), report["summary"]["accuracy"].clone());
        metadata.insert("quality".into(), report["summary"]["quality"].clone());
        metadata.insert("duration_ms".into(), report["metadata"]["duration_ms"].clone());
        let tags: HashSet<String> = ["orchestration", "summary", "pipeline"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.core
            .memory()
            .store(report.clone(), MemoryKind::Episodic, metadata, tags, None)
            .await;
        self.core
            .log("Orchestration stored in memory", LogStyle::Info)
            .await;
    }

    fn set_status(&self, orchestration_id: &str, status: Value) {
        self.active
            .lock()
            .unwrap()
            .insert(orchestration_id.to_string(), status);
    }

    /// 编排状态：先查活动表，再回落到记忆中的历史报告
    pub async fn status(&self, orchestration_id: &str) -> Option<Value> {
        if let Some(status) = self.active.lock().unwrap().get(orchestration_id) {
            return Some(status.clone());
        }
        for record in self.get_orchestration_history(50).await {
            if record.content.get("orchestration_id").and_then(Value::as_str)
                == Some(orchestration_id)
            {
                return Some(json!({
                    "status": "complete",
                    "result": record.content,
                }));
            }
        }
        None
    }

    /// 最近的编排报告（新→旧）
    pub async fn get_orchestration_history(&self, limit: usize) -> Vec<MemoryRecord> {
        let query = MemoryQuery::new()
            .with_kind(MemoryKind::Episodic)
            .with_tags(["orchestration"])
            .with_limit(limit * 2);
        let mut reports: Vec<MemoryRecord> = self
            .core
            .memory()
            .retrieve(&query)
            .await
            .into_iter()
            .filter(|r| {
                r.meta_str("agent") == Some(self.core.name())
                    && r.meta_str("orchestration_type") == Some("full_pipeline")
            })
            .collect();
        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        reports.truncate(limit);
        reports
    }
}

#[async_trait::async_trait]
impl Agent for CoordinatorAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    async fn process_task(&self, task: &str, context: &TaskContext) -> Result<Value, AgentError> {
        self.orchestrate(task, context).await
    }

    /// 级联初始化全部下游 Agent
    async fn initialize(&self) {
        self.core.initialize().await;
        self.planner.initialize().await;
        self.builder.initialize().await;
        self.reviewer.initialize().await;
    }

    async fn shutdown(&self) {
        self.planner.shutdown().await;
        self.builder.shutdown().await;
        self.reviewer.shutdown().await;
        self.core.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::NoopObserver;
    use crate::memory::HashVectorizer;

    fn new_coordinator(enable_parallel: bool) -> CoordinatorAgent {
        let store = Arc::new(MemoryStore::new(Arc::new(HashVectorizer::new())));
        let config = CoordinatorConfig {
            max_retries: 2,
            enable_parallel,
            fast_mode: true,
            backoff_unit_ms: 0,
        };
        CoordinatorAgent::new(
            config,
            BuilderConfig::default(),
            ReviewerConfig::default(),
            store,
            Arc::new(NoopObserver),
        )
    }

    #[tokio::test]
    async fn test_full_pipeline_sequential() {
        let coordinator = new_coordinator(false);
        coordinator.initialize().await;
        let report = coordinator
            .orchestrate("Write code for a parser", &TaskContext::new())
            .await
            .unwrap();

        assert_eq!(report["summary"]["accuracy"].as_f64().unwrap(), 1.0);
        assert!(report["summary"]["quality"].as_f64().unwrap() > 0.0);

        // 三个阶段记录都能按 id 取回
        for key in ["plan_id", "execution_id", "review_id"] {
            let id = report[key].as_str().unwrap();
            assert!(coordinator.core().memory().get(id).await.is_some(), "{key}");
        }

        let history = coordinator.get_orchestration_history(5).await;
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_full_pipeline_parallel() {
        let coordinator = new_coordinator(true);
        let report = coordinator
            .orchestrate("Build an api service", &TaskContext::new())
            .await
            .unwrap();

        assert_eq!(report["summary"]["accuracy"].as_f64().unwrap(), 1.0);
        let execution = coordinator
            .core()
            .memory()
            .get(report["execution_id"].as_str().unwrap())
            .await
            .unwrap();
        assert_eq!(execution.content["execution_mode"], "parallel");
    }

    #[tokio::test]
    async fn test_building_exhaustion_skips_review() {
        // 调用方上下文覆盖计划派生键：空 plan_data 让执行阶段每次都
        // 前置条件失败，耗尽后评审阶段不应运行
        let coordinator = new_coordinator(false);
        let mut context = TaskContext::new();
        context.insert("plan_data".into(), json!({}));

        let err = coordinator
            .orchestrate("Plan a trip", &context)
            .await
            .unwrap_err();
        match err {
            AgentError::StageExhausted { stage, attempts, .. } => {
                assert_eq!(stage, "building");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected StageExhausted, got {other:?}"),
        }

        let reviews = coordinator
            .core()
            .memory()
            .retrieve(
                &MemoryQuery::new()
                    .with_kind(MemoryKind::Episodic)
                    .with_tags(["review"])
                    .with_limit(10),
            )
            .await;
        assert!(reviews.is_empty());
        assert!(coordinator.get_orchestration_history(5).await.is_empty());
    }

    #[tokio::test]
    async fn test_flaky_subtask_passes_through_context() {
        let coordinator = new_coordinator(false);
        let mut context = TaskContext::new();
        context.insert("flaky_subtasks".into(), json!([0]));

        let report = coordinator
            .orchestrate("Plan a trip", &context)
            .await
            .unwrap();
        assert_eq!(report["summary"]["accuracy"].as_f64().unwrap(), 1.0);
    }

    #[tokio::test]
    async fn test_status_tracks_completion() {
        let coordinator = new_coordinator(false);
        let report = coordinator
            .orchestrate("Plan a trip", &TaskContext::new())
            .await
            .unwrap();
        let orchestration_id = report["orchestration_id"].as_str().unwrap();

        let status = coordinator.status(orchestration_id).await.unwrap();
        assert_eq!(status["status"], "complete");
        assert!(coordinator.status("orch_missing").await.is_none());
    }
}
