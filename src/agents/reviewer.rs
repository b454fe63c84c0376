//! Reviewer：执行质量评审
//!
//! accuracy = 成功数 / 计划数；quality = 计划文本与执行文本的余弦相似度
//! （与记忆层同一向量器，词面相似而非语义）。最终分 = accuracy × w_a +
//! quality × w_q，权重不做归一化，配错会越界。

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::agents::base::AgentCore;
use crate::agents::{Agent, TaskContext};
use crate::core::error::AgentError;
use crate::core::events::{AgentObserver, LogStyle};
use crate::memory::{cosine_similarity, MemoryKind, MemoryQuery, MemoryRecord, MemoryStore};

/// Reviewer 配置
///
/// 权重刻意不归一化：w_a + w_q ≠ 1 时最终分会超出 [0,1]。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewerConfig {
    pub weight_accuracy: f64,
    pub weight_quality: f64,
}

impl Default for ReviewerConfig {
    fn default() -> Self {
        Self {
            weight_accuracy: 0.6,
            weight_quality: 0.4,
        }
    }
}

/// 评审 Agent
pub struct ReviewerAgent {
    core: AgentCore,
    config: ReviewerConfig,
}

impl ReviewerAgent {
    pub fn new(
        config: ReviewerConfig,
        memory: Arc<MemoryStore>,
        observer: Arc<dyn AgentObserver>,
    ) -> Self {
        Self {
            core: AgentCore::new(
                "Reviewer",
                "Quality Assurance & Evaluation",
                "review",
                memory,
                observer,
            ),
            config,
        }
    }

    pub fn config(&self) -> &ReviewerConfig {
        &self.config
    }

    /// 评审一次执行：计划与执行数据比对，产出评分并落 episodic 记录
    pub async fn review_execution(
        &self,
        plan_id: &str,
        execution_id: Option<&str>,
        context: &TaskContext,
    ) -> Result<Value, AgentError> {
        self.core.update_progress(20.0, "Retrieving plan").await;

        let plan_item = self
            .core
            .memory()
            .get(plan_id)
            .await
            .ok_or_else(|| AgentError::Precondition(format!("plan {plan_id} not found")))?;
        let plan_data = plan_item
            .content
            .as_object()
            .ok_or_else(|| {
                AgentError::Precondition(format!("plan {plan_id} content is not structured"))
            })?
            .clone();

        self.core.update_progress(30.0, "Retrieved plan").await;

        // 执行数据解析顺序：context.execution_data → execution_id 取记录
        let (execution_data, builder_id) = if let Some(data) =
            context.get("execution_data").and_then(Value::as_object)
        {
            self.core
                .log("Using execution data from context", LogStyle::Info)
                .await;
            let id = execution_id
                .map(str::to_string)
                .unwrap_or_else(|| "unknown".to_string());
            (data.clone(), id)
        } else if let Some(id) = execution_id {
            self.core
                .log("No execution data in context, retrieving from memory", LogStyle::Thought)
                .await;
            let item = self.core.memory().get(id).await.ok_or_else(|| {
                AgentError::Precondition(format!("execution {id} not found"))
            })?;
            let data = item
                .content
                .as_object()
                .ok_or_else(|| {
                    AgentError::Precondition(format!("execution {id} content is not structured"))
                })?
                .clone();
            (data, id.to_string())
        } else {
            return Err(AgentError::Precondition(
                "either execution_data or execution_id required for review".to_string(),
            ));
        };

        self.core.update_progress(50.0, "Retrieved execution").await;

        let plan_subtasks: Vec<String> = plan_data
            .get("subtasks")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if plan_subtasks.is_empty() {
            return Err(AgentError::Precondition(
                "no subtasks found in plan".to_string(),
            ));
        }
        let execution_results: Vec<Value> = execution_data
            .get("execution_results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        self.core
            .update_progress(60.0, &format!("Analyzing {} subtasks", plan_subtasks.len()))
            .await;

        let details = self.analyze_execution(&plan_subtasks, &execution_results).await;
        let accuracy = self.calculate_accuracy(&plan_subtasks, &execution_results).await;
        let quality = self.calculate_quality(&plan_data, &execution_data).await;
        let missing = identify_missing_items(&plan_subtasks, &execution_results);
        let notes = generate_review_notes(&details, accuracy, quality);
        let final_score =
            accuracy * self.config.weight_accuracy + quality * self.config.weight_quality;

        self.core
            .log(
                &format!(
                    "Scores: {:.1}% accuracy, {:.1}% quality, {:.1}% final",
                    accuracy * 100.0,
                    quality * 100.0,
                    final_score * 100.0
                ),
                LogStyle::Result,
            )
            .await;

        let review = json!({
            "plan_id": plan_id,
            "builder_id": builder_id,
            "accuracy": accuracy,
            "quality": quality,
            "final_score": final_score,
            "missing": missing,
            "notes": notes,
            "review_details": details,
        });

        self.store_review(&review, plan_id, &builder_id, accuracy, quality, final_score)
            .await;
        self.core.update_progress(100.0, "Review complete").await;

        Ok(review)
    }

    /// 逐条比对计划与执行：completed / failed 子任务集合与相似度列表
    async fn analyze_execution(
        &self,
        plan_subtasks: &[String],
        execution_results: &[Value],
    ) -> Value {
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut similarity_scores = Vec::new();

        for (i, planned) in plan_subtasks.iter().enumerate() {
            let matched = execution_results
                .iter()
                .find(|r| r.get("index").and_then(Value::as_u64) == Some(i as u64));

            match matched {
                Some(result) if result.get("success").and_then(Value::as_bool) == Some(true) => {
                    let executed = result
                        .get("result")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let similarity = self.similarity(planned, executed).await;
                    similarity_scores.push(similarity);
                    completed.push(json!({
                        "index": i,
                        "planned": planned,
                        "executed": executed,
                        "execution_time": result.get("execution_time").cloned().unwrap_or(json!(0.0)),
                        "similarity": similarity,
                    }));
                }
                Some(result) => {
                    failed.push(json!({
                        "index": i,
                        "planned": planned,
                        "error": result.get("error").cloned().unwrap_or(Value::String("Not executed".into())),
                    }));
                }
                None => {
                    failed.push(json!({
                        "index": i,
                        "planned": planned,
                        "error": "Missing",
                    }));
                }
            }
        }

        json!({
            "total_planned": plan_subtasks.len(),
            "total_executed": execution_results.len(),
            "completed_subtasks": completed,
            "failed_subtasks": failed,
            "similarity_scores": similarity_scores,
        })
    }

    /// accuracy = 成功数 / 计划数；计划为空时为 0
    async fn calculate_accuracy(
        &self,
        plan_subtasks: &[String],
        execution_results: &[Value],
    ) -> f64 {
        if plan_subtasks.is_empty() {
            return 0.0;
        }
        let completed = execution_results
            .iter()
            .filter(|r| r.get("success").and_then(Value::as_bool) == Some(true))
            .count();
        let accuracy = completed as f64 / plan_subtasks.len() as f64;
        self.core
            .log(
                &format!(
                    "Accuracy: {completed}/{} = {:.1}%",
                    plan_subtasks.len(),
                    accuracy * 100.0
                ),
                LogStyle::Thought,
            )
            .await;
        accuracy
    }

    async fn calculate_quality(
        &self,
        plan_data: &Map<String, Value>,
        execution_data: &Map<String, Value>,
    ) -> f64 {
        let plan_text = plan_to_text(plan_data);
        let execution_text = execution_to_text(execution_data);
        let similarity = self.similarity(&plan_text, &execution_text).await;
        self.core
            .log(
                &format!("Quality similarity: {:.1}%", similarity * 100.0),
                LogStyle::Thought,
            )
            .await;
        similarity
    }

    /// 两段文本的余弦相似度（记忆层向量器，带嵌入缓存）
    async fn similarity(&self, a: &str, b: &str) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let va = self.core.memory().embed(a).await;
        let vb = self.core.memory().embed(b).await;
        cosine_similarity(&va, &vb) as f64
    }

    async fn store_review(
        &self,
        review: &Value,
        plan_id: &str,
        builder_id: &str,
        accuracy: f64,
        quality: f64,
        final_score: f64,
    ) {
        let mut metadata = Map::new();
        metadata.insert("agent".into(), Value::String(self.core.name().into()));
        metadata.insert(
            "review_type".into(),
            Value::String("execution_review".into()),
        );
        metadata.insert("plan_id".into(), Value::String(plan_id.into()));
        metadata.insert("builder_id".into(), Value::String(builder_id.into()));
        metadata.insert("accuracy".into(), json!(accuracy));
        metadata.insert("quality".into(), json!(quality));
        metadata.insert("final_score".into(), json!(final_score));
        let tags: HashSet<String> = ["review", "evaluation", "quality_assessment"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.core
            .memory()
            .store(review.clone(), MemoryKind::Episodic, metadata, tags, None)
            .await;
        self.core.log("Review stored in memory", LogStyle::Info).await;
    }

    /// 最近的评审记录（新→旧）
    pub async fn get_review_history(&self, limit: usize) -> Vec<MemoryRecord> {
        let query = MemoryQuery::new()
            .with_kind(MemoryKind::Episodic)
            .with_tags(["review"])
            .with_limit(limit * 2);
        let mut reviews: Vec<MemoryRecord> = self
            .core
            .memory()
            .retrieve(&query)
            .await
            .into_iter()
            .filter(|r| {
                r.meta_str("agent") == Some(self.core.name())
                    && r.meta_str("review_type") == Some("execution_review")
            })
            .collect();
        reviews.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        reviews.truncate(limit);
        reviews
    }
}

/// 计划的文本化表示（Task | Type | Subtasks | Context）
fn plan_to_text(plan_data: &Map<String, Value>) -> String {
    let mut parts = Vec::new();
    if let Some(task) = plan_data.get("original_task").and_then(Value::as_str) {
        parts.push(format!("Task: {task}"));
    }
    if let Some(task_type) = plan_data.get("task_type").and_then(Value::as_str) {
        parts.push(format!("Type: {task_type}"));
    }
    if let Some(subtasks) = plan_data.get("subtasks").and_then(Value::as_array) {
        if !subtasks.is_empty() {
            let joined: Vec<&str> = subtasks.iter().filter_map(Value::as_str).collect();
            parts.push(format!("Subtasks: {}", joined.join("; ")));
        }
    }
    if let Some(context) = plan_data.get("context") {
        if context.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
            parts.push(format!("Context: {context}"));
        }
    }
    parts.join(" | ")
}

/// 执行的文本化表示（模式、成功比例、最多 3 条结果样本）
fn execution_to_text(execution_data: &Map<String, Value>) -> String {
    let mut parts = Vec::new();
    let mode = execution_data
        .get("execution_mode")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    parts.push(format!("Execution mode: {mode}"));

    let results: Vec<&Value> = execution_data
        .get("execution_results")
        .and_then(Value::as_array)
        .map(|a| a.iter().collect())
        .unwrap_or_default();
    let successful = results
        .iter()
        .filter(|r| r.get("success").and_then(Value::as_bool) == Some(true))
        .count();
    parts.push(format!("Results: {successful}/{} successful", results.len()));

    let mut details = Vec::new();
    for result in &results {
        if result.get("success").and_then(Value::as_bool) != Some(true) {
            continue;
        }
        let subtask = result.get("subtask").and_then(Value::as_str).unwrap_or("");
        if let Some(content) = result.get("result").and_then(Value::as_str) {
            let first_line = content.lines().next().unwrap_or("");
            details.push(format!("{subtask} -> {first_line}"));
        }
        if details.len() == 3 {
            break;
        }
    }
    if !details.is_empty() {
        parts.push(format!("Details: {}", details.join("; ")));
    }

    parts.join(" | ")
}

/// 缺失项清单：未成功执行的计划下标 + 失败条目
fn identify_missing_items(plan_subtasks: &[String], execution_results: &[Value]) -> Vec<String> {
    let mut missing = Vec::new();
    let executed: HashSet<u64> = execution_results
        .iter()
        .filter(|r| r.get("success").and_then(Value::as_bool) == Some(true))
        .filter_map(|r| r.get("index").and_then(Value::as_u64))
        .collect();

    for (i, subtask) in plan_subtasks.iter().enumerate() {
        if !executed.contains(&(i as u64)) {
            missing.push(format!("Missing execution: {subtask}"));
        }
    }
    for result in execution_results {
        if result.get("success").and_then(Value::as_bool) != Some(true) {
            let subtask = result.get("subtask").and_then(Value::as_str).unwrap_or("Unknown");
            let error = result
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("No error details");
            missing.push(format!("Failed: {subtask} - {error}"));
        }
    }
    missing
}

/// 评语：四档总体判断 + 完成数 / 平均时长 / 平均相似度补充句
fn generate_review_notes(analysis: &Value, accuracy: f64, quality: f64) -> String {
    let mut notes = Vec::new();

    if accuracy >= 0.9 && quality >= 0.8 {
        notes.push("Excellent execution with high fidelity to plan.".to_string());
    } else if accuracy >= 0.7 && quality >= 0.6 {
        notes.push("Good execution with reasonable alignment to plan.".to_string());
    } else if accuracy >= 0.5 {
        notes.push("Partial execution completed, some gaps identified.".to_string());
    } else {
        notes.push("Significant issues found in execution.".to_string());
    }

    let completed = analysis["completed_subtasks"].as_array().cloned().unwrap_or_default();
    let failed = analysis["failed_subtasks"].as_array().cloned().unwrap_or_default();

    if !completed.is_empty() {
        let avg_time: f64 = completed
            .iter()
            .filter_map(|c| c.get("execution_time").and_then(Value::as_f64))
            .sum::<f64>()
            / completed.len() as f64;
        notes.push(format!(
            "Successfully completed {} subtasks (avg: {avg_time:.1} units each).",
            completed.len()
        ));
    }
    if !failed.is_empty() {
        notes.push(format!("Failed or missing {} subtasks.", failed.len()));
    }

    if let Some(similarities) = analysis["similarity_scores"].as_array() {
        if !similarities.is_empty() {
            let avg: f64 = similarities.iter().filter_map(Value::as_f64).sum::<f64>()
                / similarities.len() as f64;
            if avg > 0.8 {
                notes.push("High similarity between planned and executed content.".to_string());
            } else if avg > 0.6 {
                notes.push("Good alignment between plan and execution.".to_string());
            } else {
                notes.push("Some divergence between planned and actual execution.".to_string());
            }
        }
    }

    notes.join(" ")
}

#[async_trait::async_trait]
impl Agent for ReviewerAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    /// 从上下文取 plan_id / execution_id / execution_data 并执行评审
    async fn process_task(&self, task: &str, context: &TaskContext) -> Result<Value, AgentError> {
        self.core
            .log(&format!("Reviewing task: {task}"), LogStyle::Action)
            .await;
        self.core.update_progress(10.0, "Starting review").await;

        let plan_id = context
            .get("plan_id")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::Precondition("plan_id required for review".to_string()))?;
        let execution_id = context.get("execution_id").and_then(Value::as_str);

        self.review_execution(plan_id, execution_id, context).await
    }
}
