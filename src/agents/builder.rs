//! Builder：子任务执行引擎
//!
//! 顺序 / 并行两种模式。并行模式用 Semaphore 限制并发，结果按原始
//! 下标重排。执行本身是模拟：关键词时长表 × 随机抖动 + 预制产物文本。
//! 上下文里的 fail_subtasks / flaky_subtasks 用于注入失败，驱动
//! 恢复路径的演练。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;

use crate::agents::base::AgentCore;
use crate::agents::{Agent, TaskContext};
use crate::core::error::AgentError;
use crate::core::events::{AgentObserver, LogStyle};
use crate::memory::{MemoryKind, MemoryQuery, MemoryRecord, MemoryStore};

/// 子任务执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Sequential => "sequential",
            ExecutionMode::Parallel => "parallel",
        }
    }
}

/// Builder 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    pub execution_mode: ExecutionMode,
    /// 并行模式的最大并发数
    pub max_concurrency: usize,
    /// 失败后是否带 retry 标记重试一次
    pub error_recovery: bool,
    /// 跳过全部模拟延时
    pub fast_mode: bool,
    /// 一个模拟时间单位对应的毫秒数
    pub sim_unit_ms: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Sequential,
            max_concurrency: 3,
            error_recovery: true,
            fast_mode: false,
            sim_unit_ms: 1000,
        }
    }
}

/// 单条子任务的执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskResult {
    pub subtask: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub index: usize,
    /// 模拟耗时（时间单位）
    pub execution_time: f64,
}

/// 执行 Agent
pub struct BuilderAgent {
    core: Arc<AgentCore>,
    config: BuilderConfig,
}

impl BuilderAgent {
    pub fn new(
        config: BuilderConfig,
        memory: Arc<MemoryStore>,
        observer: Arc<dyn AgentObserver>,
    ) -> Self {
        Self {
            core: Arc::new(AgentCore::new(
                "Builder",
                "Implementation & Execution",
                "build",
                memory,
                observer,
            )),
            config,
        }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// 按相关性找最近的分解计划：签名匹配 + 任务文本包含，新者优先
    async fn find_latest_plan(&self, task: &str) -> Option<String> {
        let query = MemoryQuery::new()
            .with_kind(MemoryKind::Working)
            .with_tags(["plan"])
            .with_limit(20);
        let task_lower = task.to_lowercase();
        let mut plans: Vec<MemoryRecord> = self
            .core
            .memory()
            .retrieve(&query)
            .await
            .into_iter()
            .filter(|r| {
                r.meta_str("plan_type") == Some("task_decomposition")
                    && r.content
                        .get("original_task")
                        .and_then(Value::as_str)
                        .map(|t| t.to_lowercase().contains(&task_lower))
                        .unwrap_or(false)
            })
            .collect();
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        plans.into_iter().next().map(|r| r.id)
    }

    async fn subtasks_from_plan(&self, plan_id: &str) -> Vec<String> {
        match self.core.memory().get(plan_id).await {
            Some(record) => record
                .content
                .get("subtasks")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            None => {
                self.core
                    .log(
                        &format!("Plan {} not found in memory", &plan_id[..8.min(plan_id.len())]),
                        LogStyle::Warning,
                    )
                    .await;
                Vec::new()
            }
        }
    }

    /// 输入解析顺序：context.plan_data → context.subtasks → plan_id 取计划 →
    /// 按任务文本找最新计划
    async fn resolve_subtasks(
        &self,
        task: &str,
        context: &TaskContext,
    ) -> Result<(Vec<String>, String), AgentError> {
        let mut plan_id = context
            .get("plan_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let subtasks: Vec<String> = if let Some(plan_data) =
            context.get("plan_data").and_then(Value::as_object)
        {
            self.core
                .log("Using plan data from context", LogStyle::Info)
                .await;
            plan_data
                .get("subtasks")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        } else if let Some(direct) = context.get("subtasks").and_then(Value::as_array) {
            self.core
                .log(
                    &format!("Using {} subtasks from context", direct.len()),
                    LogStyle::Info,
                )
                .await;
            direct
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        } else {
            let resolved = match plan_id.clone() {
                Some(id) => id,
                None => self
                    .find_latest_plan(task)
                    .await
                    .ok_or_else(|| {
                        AgentError::Precondition(format!("no plan found for task: {task}"))
                    })?,
            };
            self.core
                .log("No direct context data, retrieving from memory", LogStyle::Thought)
                .await;
            let subtasks = self.subtasks_from_plan(&resolved).await;
            plan_id = Some(resolved);
            subtasks
        };

        if subtasks.is_empty() {
            return Err(AgentError::Precondition(format!(
                "no subtasks found for task: {task}"
            )));
        }
        Ok((subtasks, plan_id.unwrap_or_else(|| "unknown".to_string())))
    }

    async fn execute_sequential(
        &self,
        subtasks: &[String],
        context: &TaskContext,
    ) -> Vec<SubtaskResult> {
        let mut results = Vec::with_capacity(subtasks.len());
        let fast_mode = self.effective_fast_mode(context);

        for (i, subtask) in subtasks.iter().enumerate() {
            self.core
                .log(
                    &format!("Executing subtask {}/{}: {subtask}", i + 1, subtasks.len()),
                    LogStyle::Action,
                )
                .await;

            match Self::execute_subtask(&self.core, &self.config, subtask, context, i).await {
                Ok(result) => results.push(result),
                Err(e) if self.config.error_recovery => {
                    self.core
                        .log(
                            &format!("Subtask {} failed, attempting recovery...", i + 1),
                            LogStyle::Warning,
                        )
                        .await;
                    let mut recovery = context.clone();
                    recovery.insert("retry".into(), Value::Bool(true));
                    recovery.insert("original_error".into(), Value::String(e.to_string()));

                    match Self::execute_subtask(&self.core, &self.config, subtask, &recovery, i)
                        .await
                    {
                        Ok(result) => {
                            self.core
                                .log(
                                    &format!("Subtask {} recovered successfully", i + 1),
                                    LogStyle::Success,
                                )
                                .await;
                            results.push(result);
                        }
                        Err(retry_err) => {
                            self.core.handle_error(&retry_err, "subtask recovery").await;
                            results.push(Self::failed_result(subtask, i, &retry_err));
                        }
                    }
                }
                Err(e) => {
                    self.core.handle_error(&e, "subtask execution").await;
                    results.push(Self::failed_result(subtask, i, &e));
                }
            }

            let progress = 30.0 + 60.0 * (i + 1) as f32 / subtasks.len() as f32;
            self.core
                .update_progress(progress, &format!("Completed {}/{}", i + 1, subtasks.len()))
                .await;

            if !fast_mode {
                tokio::time::sleep(Duration::from_millis(self.config.sim_unit_ms / 5)).await;
            }
        }

        results
    }

    /// 并行执行：每个子任务一个 task，共享 max_concurrency 个许可，
    /// 完成后按原始下标重排
    async fn execute_parallel(
        &self,
        subtasks: &[String],
        context: &TaskContext,
    ) -> Vec<SubtaskResult> {
        self.core
            .log(
                &format!(
                    "Executing {} subtasks in parallel (max concurrency: {})",
                    subtasks.len(),
                    self.config.max_concurrency
                ),
                LogStyle::Info,
            )
            .await;

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));
        let mut handles = Vec::with_capacity(subtasks.len());

        for (i, subtask) in subtasks.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let core = Arc::clone(&self.core);
            let config = self.config.clone();
            let subtask = subtask.clone();
            let context = context.clone();

            handles.push(tokio::spawn(async move {
                // 信号量不会被主动关闭；即便如此也降级为失败结果而非 panic
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        let err = AgentError::Subtask {
                            index: i,
                            reason: format!("concurrency permit unavailable: {e}"),
                        };
                        core.handle_error(&err, "parallel subtask").await;
                        return Self::failed_result(&subtask, i, &err);
                    }
                };
                core.log(
                    &format!("Executing parallel subtask {}: {subtask}", i + 1),
                    LogStyle::Action,
                )
                .await;
                let outcome = match Self::execute_subtask(&core, &config, &subtask, &context, i)
                    .await
                {
                    Ok(result) => result,
                    Err(e) => {
                        core.handle_error(&e, "parallel subtask").await;
                        Self::failed_result(&subtask, i, &e)
                    }
                };
                core.log(
                    &format!("Parallel subtask {} finished", i + 1),
                    LogStyle::Result,
                )
                .await;
                outcome
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(result) => results.push(result),
                Err(join_err) => {
                    self.core
                        .log(
                            &format!("Parallel subtask {} panicked: {join_err}", i + 1),
                            LogStyle::Error,
                        )
                        .await;
                    results.push(SubtaskResult {
                        subtask: subtasks[i].clone(),
                        success: false,
                        result: None,
                        error: Some(join_err.to_string()),
                        index: i,
                        execution_time: 0.0,
                    });
                }
            }
        }

        results.sort_by_key(|r| r.index);
        results
    }

    /// 执行单条子任务：失败注入 → 模拟延时 → 预制产物 → 落单条结果记录
    async fn execute_subtask(
        core: &AgentCore,
        config: &BuilderConfig,
        subtask: &str,
        context: &TaskContext,
        index: usize,
    ) -> Result<SubtaskResult, AgentError> {
        let retrying = context.get("retry").and_then(Value::as_bool) == Some(true);
        if injected_indices(context, "fail_subtasks").contains(&index) {
            return Err(AgentError::Subtask {
                index,
                reason: "injected failure".to_string(),
            });
        }
        if injected_indices(context, "flaky_subtasks").contains(&index) && !retrying {
            return Err(AgentError::Subtask {
                index,
                reason: "injected transient failure".to_string(),
            });
        }

        let fast_mode =
            config.fast_mode || context.get("fast_mode").and_then(Value::as_bool) == Some(true);
        let execution_time = estimate_execution_units(subtask);
        if !fast_mode {
            let millis = (execution_time * config.sim_unit_ms as f64) as u64;
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }

        let result = generate_mock_result(subtask);

        let mut metadata = Map::new();
        metadata.insert("agent".into(), Value::String(core.name().into()));
        metadata.insert("subtask".into(), Value::String(subtask.into()));
        metadata.insert("subtask_index".into(), json!(index));
        metadata.insert("execution_time".into(), json!(execution_time));
        metadata.insert("fast_mode".into(), Value::Bool(fast_mode));
        let tags: HashSet<String> = [
            "subtask_result".to_string(),
            "execution".to_string(),
            format!("step_{}", index + 1),
        ]
        .into_iter()
        .collect();
        core.memory()
            .store(
                Value::String(result.clone()),
                MemoryKind::Working,
                metadata,
                tags,
                None,
            )
            .await;

        Ok(SubtaskResult {
            subtask: subtask.to_string(),
            success: true,
            result: Some(result),
            error: None,
            index,
            execution_time,
        })
    }

    fn failed_result(subtask: &str, index: usize, error: &AgentError) -> SubtaskResult {
        SubtaskResult {
            subtask: subtask.to_string(),
            success: false,
            result: None,
            error: Some(error.to_string()),
            index,
            execution_time: 0.0,
        }
    }

    fn effective_fast_mode(&self, context: &TaskContext) -> bool {
        self.config.fast_mode
            || context.get("fast_mode").and_then(Value::as_bool) == Some(true)
    }

    fn execution_summary(&self, task: &str, results: &[SubtaskResult], plan_id: &str) -> String {
        let successful = results.iter().filter(|r| r.success).count();
        let failed = results.len() - successful;
        let total_time: f64 = results.iter().map(|r| r.execution_time).sum();
        let avg_time: f64 = results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.execution_time)
            .sum::<f64>()
            / successful.max(1) as f64;

        let mut summary = format!(
            "Task execution summary\nTask: {task}\nPlan: {}\nSubtasks: {} total, {successful} successful, {failed} failed ({:.1}% success)\nMode: {}\nAvg time: {avg_time:.2} units, total time: {total_time:.2} units\n",
            &plan_id[..8.min(plan_id.len())],
            results.len(),
            successful as f64 / results.len().max(1) as f64 * 100.0,
            self.config.execution_mode.as_str()
        );
        for (i, result) in results.iter().enumerate() {
            let status = if result.success { "ok" } else { "failed" };
            summary.push_str(&format!("{:2}. [{status}] {}", i + 1, result.subtask));
            if let Some(error) = &result.error {
                summary.push_str(&format!(" ({error})"));
            }
            summary.push('\n');
        }
        summary
    }

    /// 最近的执行记录（新→旧）
    pub async fn get_execution_history(&self, limit: usize) -> Vec<MemoryRecord> {
        let query = MemoryQuery::new()
            .with_kind(MemoryKind::Working)
            .with_tags(["execution"])
            .with_limit(limit * 2);
        let mut executions: Vec<MemoryRecord> = self
            .core
            .memory()
            .retrieve(&query)
            .await
            .into_iter()
            .filter(|r| {
                r.meta_str("agent") == Some(self.core.name()) && r.tags.contains("complete")
            })
            .collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        executions.truncate(limit);
        executions
    }
}

/// 上下文中的下标数组（失败注入用）
fn injected_indices(context: &TaskContext, key: &str) -> Vec<usize> {
    context
        .get(key)
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_u64)
                .map(|v| v as usize)
                .collect()
        })
        .unwrap_or_default()
}

/// 关键词时长表（时间单位）× [0.5, 1.5) 均匀抖动
fn estimate_execution_units(subtask: &str) -> f64 {
    let lower = subtask.to_lowercase();
    let hit = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    let base = if hit(&["research", "analyze", "investigate"]) {
        2.0
    } else if hit(&["implement", "code", "generate"]) {
        1.5
    } else if hit(&["test", "validate", "review"]) {
        1.2
    } else if hit(&["document", "write"]) {
        1.8
    } else {
        1.0
    };
    base * rand::thread_rng().gen_range(0.5..1.5)
}

/// 关键词触发的预制产物文本
fn generate_mock_result(subtask: &str) -> String {
    let lower = subtask.to_lowercase();
    let hit = |words: &[&str]| words.iter().any(|w| lower.contains(w));

    if hit(&["code", "implement", "generate"]) {
        if lower.contains("api") {
            mock_api_code()
        } else if lower.contains("function") {
            mock_function_code()
        } else {
            mock_generic_code()
        }
    } else if hit(&["document", "write", "readme"]) {
        mock_documentation()
    } else if hit(&["test", "validate"]) {
        mock_tests()
    } else if hit(&["research", "analyze"]) {
        mock_analysis()
    } else if hit(&["design", "architecture"]) {
        mock_design()
    } else {
        format!("Completed: {subtask}")
    }
}

fn mock_api_code() -> String {
    "```rust\nasync fn create_task(Json(task): Json<TaskCreate>) -> Json<Task> {\n    Json(Task { id: \"task_123\".into(), status: \"created\".into(), ..task.into() })\n}\n```"
        .to_string()
}

fn mock_function_code() -> String {
    "```rust\nfn fibonacci(n: u64) -> u64 {\n    (0..n).fold((0, 1), |(a, b), _| (b, a + b)).0\n}\n```"
        .to_string()
}

fn mock_generic_code() -> String {
    "```rust\nasync fn main_task() -> anyhow::Result<()> {\n    let result = perform_work().await?;\n    tracing::info!(\"task completed: {result}\");\n    Ok(())\n}\n```"
        .to_string()
}

fn mock_documentation() -> String {
    "# Project Documentation\n\n## Overview\nTask management system with multi-agent orchestration.\n\n## Features\n- Task planning and decomposition\n- Parallel execution of subtasks\n- Memory-based state management"
        .to_string()
}

fn mock_tests() -> String {
    "```rust\n#[test]\nfn test_fibonacci_basic() {\n    assert_eq!(fibonacci(0), 0);\n    assert_eq!(fibonacci(10), 55);\n}\n```"
        .to_string()
}

fn mock_analysis() -> String {
    "# Analysis Results\n\n- Parallel execution provides measurable speedup\n- Error recovery handles the majority of transient failures\n- System scales to the configured concurrency limit"
        .to_string()
}

fn mock_design() -> String {
    "# System Design\n\nPlanner -> Builder -> Reviewer over a shared memory store.\nObserver events for progress, semaphore-bounded execution."
        .to_string()
}

#[async_trait::async_trait]
impl Agent for BuilderAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    /// 执行一个计划的全部子任务并写入聚合执行记录
    async fn process_task(&self, task: &str, context: &TaskContext) -> Result<Value, AgentError> {
        self.core
            .log(&format!("Building task: {task}"), LogStyle::Action)
            .await;
        self.core.update_progress(10.0, "Starting execution").await;

        let (subtasks, plan_id) = self.resolve_subtasks(task, context).await?;
        self.core
            .update_progress(30.0, &format!("Retrieved {} subtasks", subtasks.len()))
            .await;
        self.core
            .log(
                &format!(
                    "Executing {} subtasks in {} mode",
                    subtasks.len(),
                    self.config.execution_mode.as_str()
                ),
                LogStyle::Info,
            )
            .await;

        let results = if self.config.execution_mode == ExecutionMode::Parallel
            && subtasks.len() > 1
        {
            self.execute_parallel(&subtasks, context).await
        } else {
            self.execute_sequential(&subtasks, context).await
        };

        let successful = results.iter().filter(|r| r.success).count();
        self.core
            .update_progress(90.0, &format!("Executed {} subtasks", results.len()))
            .await;
        self.core
            .log(
                &format!("Completed {successful}/{} subtasks successfully", results.len()),
                LogStyle::Result,
            )
            .await;

        let summary = self.execution_summary(task, &results, &plan_id);
        let execution = json!({
            "task": task,
            "plan_id": plan_id,
            "execution_results": results,
            "total_subtasks": subtasks.len(),
            "execution_mode": self.config.execution_mode.as_str(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        let tags: HashSet<String> = ["execution", "build", "complete"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let execution_id = self.core.store_result(execution, tags).await;

        self.core
            .log(
                &format!("Build completed: {} subtasks executed", results.len()),
                LogStyle::Success,
            )
            .await;
        self.core.update_progress(100.0, "Build complete").await;

        Ok(json!({
            "execution_id": execution_id,
            "plan_id": plan_id,
            "total_subtasks": subtasks.len(),
            "successful": successful,
            "summary": summary,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::NoopObserver;
    use crate::memory::HashVectorizer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn new_builder(config: BuilderConfig) -> BuilderAgent {
        let store = Arc::new(MemoryStore::new(Arc::new(HashVectorizer::new())));
        BuilderAgent::new(config, store, Arc::new(NoopObserver))
    }

    fn fast_config(mode: ExecutionMode) -> BuilderConfig {
        BuilderConfig {
            execution_mode: mode,
            fast_mode: true,
            ..Default::default()
        }
    }

    fn context_with_subtasks(subtasks: &[&str]) -> TaskContext {
        let mut context = TaskContext::new();
        context.insert("subtasks".into(), json!(subtasks));
        context
    }

    #[tokio::test]
    async fn test_sequential_all_success_in_order() {
        let builder = new_builder(fast_config(ExecutionMode::Sequential));
        let context = context_with_subtasks(&["Step one", "Step two", "Step three"]);
        let result = builder.process_task("demo task", &context).await.unwrap();

        assert_eq!(result["successful"], json!(3));
        let execution = builder.get_execution_history(1).await;
        let results = execution[0].content["execution_results"].as_array().unwrap();
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r["index"], json!(i));
            assert_eq!(r["success"], Value::Bool(true));
        }
    }

    #[tokio::test]
    async fn test_failure_isolated_with_recovery() {
        let builder = new_builder(fast_config(ExecutionMode::Sequential));
        let mut context = context_with_subtasks(&["a", "b", "c"]);
        context.insert("fail_subtasks".into(), json!([1]));
        let result = builder.process_task("demo", &context).await.unwrap();

        assert_eq!(result["successful"], json!(2));
        let execution = builder.get_execution_history(1).await;
        let results = execution[0].content["execution_results"].as_array().unwrap();
        assert_eq!(results[0]["success"], Value::Bool(true));
        assert_eq!(results[1]["success"], Value::Bool(false));
        assert!(results[1]["error"].as_str().unwrap().contains("injected"));
        assert_eq!(results[2]["success"], Value::Bool(true));
    }

    #[tokio::test]
    async fn test_flaky_subtask_recovers_on_retry() {
        let builder = new_builder(fast_config(ExecutionMode::Sequential));
        let mut context = context_with_subtasks(&["a", "b"]);
        context.insert("flaky_subtasks".into(), json!([0]));
        let result = builder.process_task("demo", &context).await.unwrap();
        assert_eq!(result["successful"], json!(2));
    }

    #[tokio::test]
    async fn test_flaky_subtask_fails_without_recovery() {
        let mut config = fast_config(ExecutionMode::Sequential);
        config.error_recovery = false;
        let builder = new_builder(config);
        let mut context = context_with_subtasks(&["a", "b"]);
        context.insert("flaky_subtasks".into(), json!([0]));
        let result = builder.process_task("demo", &context).await.unwrap();
        assert_eq!(result["successful"], json!(1));
    }

    #[tokio::test]
    async fn test_parallel_results_reordered_by_index() {
        let mut config = fast_config(ExecutionMode::Parallel);
        config.max_concurrency = 4;
        let builder = new_builder(config);
        let context = context_with_subtasks(&["w", "x", "y", "z", "v", "u"]);
        builder.process_task("demo", &context).await.unwrap();

        let execution = builder.get_execution_history(1).await;
        let results = execution[0].content["execution_results"].as_array().unwrap();
        let indices: Vec<u64> = results
            .iter()
            .map(|r| r["index"].as_u64().unwrap())
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    /// 通过并行路径的子任务起止日志统计同时在执行的数量
    #[derive(Default)]
    struct InFlightObserver {
        current: AtomicUsize,
        max: AtomicUsize,
    }

    impl AgentObserver for InFlightObserver {
        fn on_message(&self, _agent: &str, text: &str, _phase: &str, _level: LogStyle) {
            if text.starts_with("Executing parallel subtask") {
                let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                self.max.fetch_max(now, Ordering::SeqCst);
            } else if text.starts_with("Parallel subtask") && text.ends_with("finished") {
                self.current.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn test_parallel_concurrency_bound() {
        // 6 个子任务、并发上限 2：任意时刻在执行的子任务数不得超过 2
        let config = BuilderConfig {
            execution_mode: ExecutionMode::Parallel,
            max_concurrency: 2,
            fast_mode: false,
            sim_unit_ms: 20,
            ..Default::default()
        };
        let observer = Arc::new(InFlightObserver::default());
        let store = Arc::new(MemoryStore::new(Arc::new(HashVectorizer::new())));
        let builder = BuilderAgent::new(config, store, observer.clone());
        let context = context_with_subtasks(&["s1", "s2", "s3", "s4", "s5", "s6"]);

        let result = builder.process_task("demo", &context).await.unwrap();

        assert_eq!(result["successful"], json!(6));
        let peak = observer.max.load(Ordering::SeqCst);
        assert!(peak >= 1 && peak <= 2, "peak in-flight {peak}");
        assert_eq!(observer.current.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_plan_is_precondition_error() {
        let builder = new_builder(fast_config(ExecutionMode::Sequential));
        let err = builder
            .process_task("nonexistent", &TaskContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Precondition(_)));
    }

    #[tokio::test]
    async fn test_subtasks_resolved_from_stored_plan() {
        let builder = new_builder(fast_config(ExecutionMode::Sequential));
        let plan = json!({
            "original_task": "demo task",
            "subtasks": ["alpha", "beta"],
        });
        let mut metadata = Map::new();
        metadata.insert("plan_type".into(), Value::String("task_decomposition".into()));
        let tags: HashSet<String> = ["plan"].iter().map(|s| s.to_string()).collect();
        let plan_id = builder
            .core()
            .memory()
            .store(plan, MemoryKind::Working, metadata, tags, None)
            .await;

        let mut context = TaskContext::new();
        context.insert("plan_id".into(), Value::String(plan_id.clone()));
        let result = builder.process_task("demo task", &context).await.unwrap();
        assert_eq!(result["total_subtasks"], json!(2));
        assert_eq!(result["plan_id"], Value::String(plan_id));
    }

    #[test]
    fn test_execution_time_keyword_table() {
        for _ in 0..20 {
            let t = estimate_execution_units("Research the market");
            assert!((1.0..3.0).contains(&t));
            let base = estimate_execution_units("Plan a trip");
            assert!((0.5..1.5).contains(&base));
        }
    }

    #[test]
    fn test_mock_result_keywords() {
        assert!(generate_mock_result("Implement the api layer").contains("rust"));
        assert!(generate_mock_result("Write documentation").contains("Documentation"));
        assert!(generate_mock_result("Do something else").starts_with("Completed:"));
    }
}
