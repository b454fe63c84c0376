//! Planner：任务分解与计划优化
//!
//! 分类与子任务生成是关键词规则表（不是调度意义上的规划器）：固定类别模板 +
//! 任务文本触发的步骤改写 + 上下文开关步骤 + 领域关键词插入。
//! 计划一经写入不再修改；optimize_plan 生成新计划记录。

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::agents::base::AgentCore;
use crate::agents::{Agent, TaskContext};
use crate::core::error::AgentError;
use crate::core::events::{AgentObserver, LogStyle};
use crate::memory::{MemoryKind, MemoryQuery, MemoryRecord, MemoryStore};

/// 任务类别（关键词分类的固定集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCategory {
    CodeGeneration,
    Research,
    Documentation,
    Design,
    Testing,
    General,
}

impl TaskCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskCategory::CodeGeneration => "code_generation",
            TaskCategory::Research => "research",
            TaskCategory::Documentation => "documentation",
            TaskCategory::Design => "design",
            TaskCategory::Testing => "testing",
            TaskCategory::General => "general",
        }
    }

    /// 关键词分类：命中即归类，全不命中为 general
    pub fn classify(task: &str) -> Self {
        let t = task.to_lowercase();
        let hit = |words: &[&str]| words.iter().any(|w| t.contains(w));
        if hit(&["code", "program", "script", "function", "class"]) {
            TaskCategory::CodeGeneration
        } else if hit(&["research", "analyze", "study", "investigate"]) {
            TaskCategory::Research
        } else if hit(&["document", "readme", "guide", "manual"]) {
            TaskCategory::Documentation
        } else if hit(&["design", "architecture", "structure"]) {
            TaskCategory::Design
        } else if hit(&["test", "validate", "verify", "check"]) {
            TaskCategory::Testing
        } else {
            TaskCategory::General
        }
    }

    /// 类别模板：子任务生成的起点
    fn template(&self) -> &'static [&'static str] {
        match self {
            TaskCategory::CodeGeneration => &[
                "Analyze requirements and constraints",
                "Design solution architecture",
                "Implement core functionality",
                "Add error handling and validation",
                "Create tests and documentation",
                "Review and optimize code",
            ],
            TaskCategory::Research => &[
                "Define research scope and objectives",
                "Gather relevant sources and data",
                "Analyze and synthesize information",
                "Draw conclusions and insights",
                "Document findings and methodology",
            ],
            TaskCategory::Documentation => &[
                "Understand target audience and purpose",
                "Gather existing information and resources",
                "Structure content outline",
                "Write comprehensive documentation",
                "Review for accuracy and clarity",
                "Format and finalize output",
            ],
            TaskCategory::Design => &[
                "Analyze design requirements",
                "Create conceptual design",
                "Develop detailed specifications",
                "Review design feasibility",
                "Document design decisions",
            ],
            TaskCategory::Testing => &[
                "Define testing scope and objectives",
                "Create test cases and scenarios",
                "Execute tests systematically",
                "Analyze test results",
                "Report findings and recommendations",
            ],
            TaskCategory::General => &[
                "Understand the task requirements",
                "Break down into logical components",
                "Assign responsibilities to sub-agents",
                "Set execution order and dependencies",
                "Execute planned steps",
                "Review and validate results",
            ],
        }
    }
}

/// 计划优化目标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationGoal {
    Speed,
    Quality,
    Cost,
    Reliability,
}

impl OptimizationGoal {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationGoal::Speed => "speed",
            OptimizationGoal::Quality => "quality",
            OptimizationGoal::Cost => "cost",
            OptimizationGoal::Reliability => "reliability",
        }
    }
}

/// 任务分解 Agent
pub struct PlannerAgent {
    core: AgentCore,
}

impl PlannerAgent {
    pub fn new(memory: Arc<MemoryStore>, observer: Arc<dyn AgentObserver>) -> Self {
        Self {
            core: AgentCore::new(
                "Planner",
                "Task Decomposition & Strategic Planning",
                "plan",
                memory,
                observer,
            ),
        }
    }

    /// 生成子任务列表：模板 → 任务文本改写 → 上下文开关 → 领域关键词插入
    pub fn generate_subtasks(
        &self,
        task: &str,
        category: TaskCategory,
        context: &TaskContext,
    ) -> Vec<String> {
        let task_lower = task.to_lowercase();
        let mut subtasks: Vec<String> = Vec::new();

        for step in category.template() {
            let step_lower = step.to_lowercase();
            let customized = if task_lower.contains("code") {
                if step_lower.contains("test") {
                    format!("Create comprehensive tests for {task}")
                } else if step_lower.contains("document") {
                    format!("Document the implementation of {task}")
                } else {
                    step.to_string()
                }
            } else if task_lower.contains("research") {
                if step_lower.contains("gather") {
                    format!("Research and collect data for: {task}")
                } else if step_lower.contains("analyze") {
                    format!("Analyze research findings from {task}")
                } else {
                    step.to_string()
                }
            } else {
                format!("{step} for: {task}")
            };
            subtasks.push(customized);
        }

        // 上下文开关步骤
        if context.get("include_testing").and_then(Value::as_bool) == Some(true) {
            subtasks.push("Create and run comprehensive tests".to_string());
        }
        if context.get("include_documentation").and_then(Value::as_bool) == Some(true) {
            subtasks.push("Generate documentation and usage examples".to_string());
        }
        if let Some(deadline) = context.get("deadline").and_then(Value::as_str) {
            subtasks.push(format!("Ensure completion by {deadline}"));
        }

        // 领域关键词：固定插入到第 2 位
        let insert_at = 2.min(subtasks.len());
        if task_lower.contains("api") || task_lower.contains("web") {
            subtasks.insert(insert_at, "Design API endpoints and data structures".to_string());
        }
        if task_lower.contains("database") || task_lower.contains("storage") {
            subtasks.insert(insert_at, "Design database schema and relationships".to_string());
        }
        if task_lower.contains("ui") || task_lower.contains("interface") {
            subtasks.insert(insert_at, "Design user interface components".to_string());
        }

        subtasks
    }

    /// 优化既有计划：按目标追加 / 插入步骤，按首次出现去重，产生新计划记录
    pub async fn optimize_plan(
        &self,
        plan_id: &str,
        goal: OptimizationGoal,
    ) -> Result<Value, AgentError> {
        self.core
            .log(
                &format!("Optimizing plan {} for: {}", &plan_id[..8.min(plan_id.len())], goal.as_str()),
                LogStyle::Action,
            )
            .await;

        let plan_item = self
            .core
            .memory()
            .get(plan_id)
            .await
            .ok_or_else(|| AgentError::NotFound(format!("plan {plan_id}")))?;

        let plan = plan_item
            .content
            .as_object()
            .ok_or_else(|| {
                AgentError::Precondition(format!("plan {plan_id} content is not structured"))
            })?
            .clone();

        let subtasks: Vec<String> = plan
            .get("subtasks")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let optimized = apply_optimization(subtasks, goal);

        let mut new_plan = plan.clone();
        new_plan.insert("subtasks".into(), json!(optimized));
        new_plan.insert("optimization_goal".into(), Value::String(goal.as_str().into()));
        new_plan.insert("optimized_at".into(), Value::String(Utc::now().to_rfc3339()));

        let mut metadata = Map::new();
        metadata.insert("agent".into(), Value::String(self.core.name().into()));
        metadata.insert(
            "plan_type".into(),
            Value::String("optimized_decomposition".into()),
        );
        metadata.insert("original_plan_id".into(), Value::String(plan_id.into()));
        metadata.insert(
            "optimization_goal".into(),
            Value::String(goal.as_str().into()),
        );
        let tags: HashSet<String> = ["plan", "optimized", goal.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let memory_id = self
            .core
            .memory()
            .store(Value::Object(new_plan), MemoryKind::Working, metadata, tags, None)
            .await;

        self.core
            .log(
                &format!("Plan optimization complete: {}", &memory_id[..8]),
                LogStyle::Success,
            )
            .await;

        Ok(json!({
            "plan_id": memory_id,
            "optimization_goal": goal.as_str(),
            "subtasks": optimized,
        }))
    }

    /// 最近的分解计划（新→旧）
    pub async fn get_recent_plans(&self, limit: usize) -> Vec<MemoryRecord> {
        let query = MemoryQuery::new()
            .with_kind(MemoryKind::Working)
            .with_tags(["plan"])
            .with_limit(limit * 3);
        let mut plans: Vec<MemoryRecord> = self
            .core
            .memory()
            .retrieve(&query)
            .await
            .into_iter()
            .filter(|r| {
                r.meta_str("agent") == Some(self.core.name())
                    && r.meta_str("plan_type") == Some("task_decomposition")
            })
            .collect();
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        plans.truncate(limit);
        plans
    }

    fn plan_summary(&self, task: &str, subtasks: &[String], category: TaskCategory) -> String {
        let complexity = if subtasks.len() > 5 {
            "high"
        } else if subtasks.len() > 3 {
            "medium"
        } else {
            "low"
        };
        let mut summary = format!(
            "Task planning summary\nTask: {task}\nClassification: {}\nSubtasks: {} (complexity: {complexity})\n",
            category.as_str(),
            subtasks.len()
        );
        for (i, subtask) in subtasks.iter().enumerate() {
            summary.push_str(&format!("{:2}. {subtask}\n", i + 1));
        }
        summary
    }

    /// 单条子任务落为 procedural 记录，便于按索引检索
    async fn store_subtasks(&self, subtasks: &[String], original_task: &str) {
        for (i, subtask) in subtasks.iter().enumerate() {
            let mut metadata = Map::new();
            metadata.insert("agent".into(), Value::String(self.core.name().into()));
            metadata.insert("original_task".into(), Value::String(original_task.into()));
            metadata.insert("subtask_index".into(), json!(i));
            metadata.insert("total_subtasks".into(), json!(subtasks.len()));
            let tags: HashSet<String> = [
                "subtask".to_string(),
                "planned".to_string(),
                format!("step_{}", i + 1),
            ]
            .into_iter()
            .collect();
            self.core
                .memory()
                .store(
                    Value::String(subtask.clone()),
                    MemoryKind::Procedural,
                    metadata,
                    tags,
                    None,
                )
                .await;
        }
    }
}

/// 目标驱动的步骤调整；最后按首次出现顺序去重
fn apply_optimization(subtasks: Vec<String>, goal: OptimizationGoal) -> Vec<String> {
    let mut optimized = subtasks;

    match goal {
        OptimizationGoal::Speed => {
            optimized.push("Execute independent tasks in parallel where possible".to_string());
        }
        OptimizationGoal::Quality => {
            let check = "Conduct thorough quality review and validation".to_string();
            if optimized.len() > 1 {
                // 插在已有 review 步骤之前，否则倒数第二位
                let pos = optimized
                    .iter()
                    .position(|s| s.to_lowercase().contains("review"))
                    .unwrap_or(optimized.len() - 1);
                optimized.insert(pos, check);
                optimized.push("Apply final quality assurance checks".to_string());
            } else {
                optimized.push(check);
            }
        }
        OptimizationGoal::Cost => {
            optimized.push("Optimize resource usage and minimize costs".to_string());
        }
        OptimizationGoal::Reliability => {
            optimized.push("Add error handling and recovery mechanisms".to_string());
            optimized.push("Implement comprehensive logging and monitoring".to_string());
        }
    }

    let mut seen = HashSet::new();
    optimized.retain(|s| seen.insert(s.clone()));
    optimized
}

#[async_trait::async_trait]
impl Agent for PlannerAgent {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    /// 分解任务并把完整计划写入共享记忆
    async fn process_task(&self, task: &str, context: &TaskContext) -> Result<Value, AgentError> {
        self.core
            .log(&format!("Planning task: {task}"), LogStyle::Action)
            .await;
        self.core.update_progress(10.0, "Starting analysis").await;

        let category = TaskCategory::classify(task);
        self.core
            .update_progress(30.0, &format!("Classified as {}", category.as_str()))
            .await;
        self.core
            .log(
                &format!("Task classified as: {}", category.as_str()),
                LogStyle::Thought,
            )
            .await;

        let subtasks = self.generate_subtasks(task, category, context);
        self.core
            .update_progress(70.0, &format!("Generated {} subtasks", subtasks.len()))
            .await;

        let plan = json!({
            "original_task": task,
            "task_type": category.as_str(),
            "subtasks": subtasks,
            "context": Value::Object(context.clone()),
            "timestamp": Utc::now().to_rfc3339(),
        });

        let mut metadata = Map::new();
        metadata.insert("agent".into(), Value::String(self.core.name().into()));
        metadata.insert(
            "plan_type".into(),
            Value::String("task_decomposition".into()),
        );
        metadata.insert("subtask_count".into(), json!(subtasks.len()));
        let tags: HashSet<String> = ["plan", "decomposition", category.as_str()]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let memory_id = self
            .core
            .memory()
            .store(plan, MemoryKind::Working, metadata, tags, None)
            .await;

        self.core.update_progress(90.0, "Storing plan in memory").await;
        self.store_subtasks(&subtasks, task).await;

        let summary = self.plan_summary(task, &subtasks, category);
        self.core
            .log(
                &format!("Plan created with {} subtasks ({})", subtasks.len(), &memory_id[..8]),
                LogStyle::Success,
            )
            .await;
        self.core.update_progress(100.0, "Planning complete").await;

        Ok(json!({
            "task_type": category.as_str(),
            "subtask_count": subtasks.len(),
            "summary": summary,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::NoopObserver;
    use crate::memory::HashVectorizer;

    fn new_planner() -> PlannerAgent {
        let store = Arc::new(MemoryStore::new(Arc::new(HashVectorizer::new())));
        PlannerAgent::new(store, Arc::new(NoopObserver))
    }

    #[test]
    fn test_classify_keywords() {
        assert_eq!(
            TaskCategory::classify("Write code for a parser"),
            TaskCategory::CodeGeneration
        );
        assert_eq!(
            TaskCategory::classify("Research market trends"),
            TaskCategory::Research
        );
        assert_eq!(
            TaskCategory::classify("Write a readme"),
            TaskCategory::Documentation
        );
        assert_eq!(
            TaskCategory::classify("Design the architecture"),
            TaskCategory::Design
        );
        assert_eq!(
            TaskCategory::classify("Verify the results"),
            TaskCategory::Testing
        );
        assert_eq!(TaskCategory::classify("Plan a trip"), TaskCategory::General);
    }

    #[test]
    fn test_generate_subtasks_code_rewrites() {
        let planner = new_planner();
        let subtasks = planner.generate_subtasks(
            "Build code for a calculator",
            TaskCategory::CodeGeneration,
            &TaskContext::new(),
        );
        // "test" 与 "document" 模板步骤被任务相关步骤替换
        assert!(subtasks
            .iter()
            .any(|s| s == "Create comprehensive tests for Build code for a calculator"));
        assert!(!subtasks.iter().any(|s| s.contains(" for: ")));
    }

    #[test]
    fn test_generate_subtasks_context_flags() {
        let planner = new_planner();
        let mut context = TaskContext::new();
        context.insert("include_testing".into(), Value::Bool(true));
        context.insert("include_documentation".into(), Value::Bool(true));
        context.insert("deadline".into(), Value::String("Friday".into()));
        let subtasks =
            planner.generate_subtasks("Plan a trip", TaskCategory::General, &context);
        assert!(subtasks.contains(&"Create and run comprehensive tests".to_string()));
        assert!(subtasks.contains(&"Generate documentation and usage examples".to_string()));
        assert!(subtasks.contains(&"Ensure completion by Friday".to_string()));
    }

    #[test]
    fn test_generate_subtasks_domain_insert() {
        let planner = new_planner();
        let subtasks = planner.generate_subtasks(
            "Build an api service",
            TaskCategory::General,
            &TaskContext::new(),
        );
        assert_eq!(subtasks[2], "Design API endpoints and data structures");
    }

    #[tokio::test]
    async fn test_process_task_stores_plan_and_subtasks() {
        let planner = new_planner();
        planner.initialize().await;
        let result = planner
            .process_task("Write code for a parser", &TaskContext::new())
            .await
            .unwrap();
        assert_eq!(result["task_type"], "code_generation");

        let plans = planner.get_recent_plans(5).await;
        assert_eq!(plans.len(), 1);
        assert_eq!(
            plans[0].content["original_task"],
            Value::String("Write code for a parser".into())
        );

        // 单条子任务以 procedural 记录存在
        let subtask_records = planner
            .core()
            .memory()
            .retrieve(
                &MemoryQuery::new()
                    .with_kind(MemoryKind::Procedural)
                    .with_tags(["subtask"])
                    .with_limit(50),
            )
            .await;
        let expected = result["subtask_count"].as_u64().unwrap() as usize;
        assert_eq!(subtask_records.len(), expected);
    }

    #[tokio::test]
    async fn test_optimize_plan_dedup_and_new_record() {
        let planner = new_planner();
        planner
            .process_task("Build an api service", &TaskContext::new())
            .await
            .unwrap();
        let plan_id = planner.get_recent_plans(1).await[0].id.clone();

        let optimized = planner
            .optimize_plan(&plan_id, OptimizationGoal::Quality)
            .await
            .unwrap();
        let new_id = optimized["plan_id"].as_str().unwrap().to_string();
        assert_ne!(new_id, plan_id);

        // 原计划不被修改
        let original = planner.core().memory().get(&plan_id).await.unwrap();
        assert!(original.content["optimization_goal"].is_null());

        // 去重：无重复步骤
        let steps: Vec<&str> = optimized["subtasks"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        let unique: HashSet<&str> = steps.iter().copied().collect();
        assert_eq!(steps.len(), unique.len());
        assert!(steps.contains(&"Apply final quality assurance checks"));
    }

    #[tokio::test]
    async fn test_optimize_missing_plan_errors() {
        let planner = new_planner();
        let err = planner
            .optimize_plan("missing-id", OptimizationGoal::Speed)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }
}
