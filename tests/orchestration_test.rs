//! 编排流水线集成测试

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};
    use swarm::memory::HashVectorizer;
    use swarm::{
        Agent, BuilderConfig, CoordinatorAgent, CoordinatorConfig, MemoryKind, MemoryQuery,
        MemoryStore, NoopObserver, ReviewerConfig, TaskContext,
    };

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
    async fn test_sequential_pipeline_end_to_end() {
        let coordinator = new_coordinator(false);
        coordinator.initialize().await;

        let report = coordinator
            .orchestrate("Write code for a json parser", &TaskContext::new())
            .await
            .unwrap();

        // 全部子任务成功：accuracy 1.0，quality 词面相似非零
        assert_eq!(report["summary"]["accuracy"].as_f64().unwrap(), 1.0);
        assert!(report["summary"]["quality"].as_f64().unwrap() > 0.0);
        let final_score = report["summary"]["final_score"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&final_score));

        // 计划 / 执行 / 评审记录都可按 id 取回，且执行结果按下标有序
        let store = coordinator.core().memory();
        let plan = store.get(report["plan_id"].as_str().unwrap()).await.unwrap();
        assert_eq!(plan.content["original_task"], "Write code for a json parser");

        let execution = store
            .get(report["execution_id"].as_str().unwrap())
            .await
            .unwrap();
        let results = execution.content["execution_results"].as_array().unwrap();
        assert!(!results.is_empty());
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r["index"].as_u64().unwrap(), i as u64);
            assert_eq!(r["success"], Value::Bool(true));
        }

        let review = store
            .get(report["review_id"].as_str().unwrap())
            .await
            .unwrap();
        assert_eq!(review.content["plan_id"], report["plan_id"]);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_parallel_pipeline_end_to_end() {
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

        // 并行分支结果同样按原始下标重排
        let results = execution.content["execution_results"].as_array().unwrap();
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r["index"].as_u64().unwrap(), i as u64);
        }
    }

    #[tokio::test]
    async fn test_failed_subtask_degrades_review() {
        let coordinator = new_coordinator(false);
        let mut context = TaskContext::new();
        // 下标 1 每次尝试都失败；恢复重试后仍计为失败
        context.insert("fail_subtasks".into(), json!([1]));

        let report = coordinator.orchestrate("Plan a trip", &context).await.unwrap();

        let accuracy = report["summary"]["accuracy"].as_f64().unwrap();
        assert!(accuracy < 1.0);
        let review = coordinator
            .core()
            .memory()
            .get(report["review_id"].as_str().unwrap())
            .await
            .unwrap();
        let missing: Vec<&str> = review.content["missing"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(missing.iter().any(|m| m.starts_with("Failed:")));
    }

    #[tokio::test]
    async fn test_history_queries_across_agents() {
        let coordinator = new_coordinator(false);
        coordinator
            .orchestrate("Research market trends", &TaskContext::new())
            .await
            .unwrap();
        coordinator
            .orchestrate("Write a readme", &TaskContext::new())
            .await
            .unwrap();

        let history = coordinator.get_orchestration_history(10).await;
        assert_eq!(history.len(), 2);
        // 新→旧
        assert!(history[0].created_at >= history[1].created_at);

        // 报告签名完整：episodic + 固定标签
        let reports = coordinator
            .core()
            .memory()
            .retrieve(
                &MemoryQuery::new()
                    .with_kind(MemoryKind::Episodic)
                    .with_tags(["pipeline"])
                    .with_limit(10),
            )
            .await;
        assert_eq!(reports.len(), 2);
        for report in &reports {
            assert!(report.tags.contains("orchestration"));
            assert!(report.meta_str("orchestration_type") == Some("full_pipeline"));
        }
    }
}
