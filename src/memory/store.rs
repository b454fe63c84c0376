//! 共享记忆存储：进程内容量型记录仓库
//!
//! 写入时分配全新 uuid（无读改写竞争），结构化内容序列化为 JSON 文本并在
//! metadata 里记录原始形态（`_content_type`），读取时还原。往返约定：
//! 结构化内容在任何一次读取都必须反序列化回相等的值。
//! 嵌入按「文本精确匹配」缓存，达到上限后停止插入，直到 cleanup 截断为
//! 最近插入的尾部（非严格 LRU）。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::memory::types::{MemoryKind, MemoryQuery, MemoryRecord, MemoryStats};
use crate::memory::vectorizer::{cosine_similarity, TextVectorizer};

/// 结构化内容在 metadata 中的形态标记键
const CONTENT_TYPE_KEY: &str = "_content_type";
/// 启发式 JSON 重解析的文本长度上限（避免扫描大文本）
const REPARSE_MAX_LEN: usize = 10_000;

/// 嵌入缓存：插入序 + 精确文本索引
struct EmbedCache {
    entries: Vec<(String, Vec<f32>)>,
    index: HashMap<String, usize>,
}

impl EmbedCache {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn get(&self, text: &str) -> Option<&Vec<f32>> {
        self.index.get(text).map(|i| &self.entries[*i].1)
    }

    /// 达到 max 条后不再插入，等待 cleanup 截断腾出空间
    fn insert(&mut self, text: String, embedding: Vec<f32>, max: usize) {
        if self.entries.len() >= max || self.index.contains_key(&text) {
            return;
        }
        self.index.insert(text.clone(), self.entries.len());
        self.entries.push((text, embedding));
    }

    /// 截断为最近插入的 keep 条，重建索引
    fn truncate_to_tail(&mut self, keep: usize) {
        if self.entries.len() <= keep {
            return;
        }
        let drop = self.entries.len() - keep;
        self.entries.drain(0..drop);
        self.index.clear();
        for (i, (text, _)) in self.entries.iter().enumerate() {
            self.index.insert(text.clone(), i);
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// 共享记忆存储
///
/// 被 Coordinator 与各阶段按引用共享（Arc），所有组件显式注入，不使用全局单例。
pub struct MemoryStore {
    records: RwLock<HashMap<String, MemoryRecord>>,
    vectorizer: Arc<dyn TextVectorizer>,
    cache: Mutex<EmbedCache>,
    /// 缓存条数上限：达到后停止插入，cleanup 在此时触发截断
    cache_max: usize,
    /// cleanup 截断后保留的条数
    cache_keep: usize,
}

impl MemoryStore {
    pub fn new(vectorizer: Arc<dyn TextVectorizer>) -> Self {
        Self::with_cache_limits(vectorizer, 1000, 500)
    }

    pub fn with_cache_limits(
        vectorizer: Arc<dyn TextVectorizer>,
        cache_max: usize,
        cache_keep: usize,
    ) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            vectorizer: vectorizer.clone(),
            cache: Mutex::new(EmbedCache::new()),
            cache_max,
            cache_keep,
        }
    }

    /// 文本嵌入（带缓存）。评审阶段的质量评分与检索排序共用此函数。
    pub async fn embed(&self, text: &str) -> Vec<f32> {
        {
            let cache = self.cache.lock().await;
            if let Some(v) = cache.get(text) {
                return v.clone();
            }
        }
        let embedding = self.vectorizer.vectorize(text);
        let mut cache = self.cache.lock().await;
        cache.insert(text.to_string(), embedding.clone(), self.cache_max);
        embedding
    }

    /// 写入一条记忆，返回新分配的 id
    ///
    /// - 对象 / 数组内容序列化为 JSON 文本，metadata 记录 `_content_type`
    /// - 本身是合法 JSON 的字符串标记为 `json_string`
    /// - 非空文本计算嵌入；ttl 设置绝对过期时刻
    pub async fn store(
        &self,
        content: Value,
        kind: MemoryKind,
        metadata: Map<String, Value>,
        tags: HashSet<String>,
        ttl: Option<Duration>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let mut metadata = metadata;

        let processed: Value = match content {
            Value::Object(_) | Value::Array(_) => {
                let shape = if content.is_object() { "object" } else { "array" };
                metadata.insert(CONTENT_TYPE_KEY.to_string(), Value::String(shape.to_string()));
                // 序列化 Value 不会失败
                Value::String(serde_json::to_string(&content).unwrap_or_default())
            }
            Value::String(s) => {
                if serde_json::from_str::<Value>(&s).is_ok() {
                    metadata.insert(
                        CONTENT_TYPE_KEY.to_string(),
                        Value::String("json_string".to_string()),
                    );
                }
                Value::String(s)
            }
            other => other,
        };

        let embedding = match &processed {
            Value::String(s) if !s.trim().is_empty() => Some(self.embed(s).await),
            _ => None,
        };

        let now = Utc::now();
        let record = MemoryRecord {
            id: id.clone(),
            kind,
            content: processed,
            created_at: now,
            metadata,
            tags,
            expires_at: ttl.map(|d| now + d),
            embedding,
        };

        self.records.write().await.insert(id.clone(), record);
        tracing::debug!("memory stored: {} ({})", &id[..8], kind.as_str());
        id
    }

    /// 按查询检索：kind 过滤 → 标签交集过滤 → （有 text 时）相似度排序与阈值截断 → limit 截断
    ///
    /// 读取侧还原结构化内容；未标记的短字符串若形似 JSON 字面量会被机会性重解析，
    /// 该启发式可能对「恰好长得像 JSON」的普通字符串误判。
    pub async fn retrieve(&self, query: &MemoryQuery) -> Vec<MemoryRecord> {
        let records = self.records.read().await;
        let mut candidates: Vec<&MemoryRecord> = records
            .values()
            .filter(|r| query.kind.map(|k| r.kind == k).unwrap_or(true))
            .filter(|r| match &query.tags {
                Some(tags) => tags.iter().any(|t| r.tags.contains(t)),
                None => true,
            })
            .collect();

        let mut results: Vec<MemoryRecord> = if let Some(text) = &query.text {
            let q_embed = self.embed(text).await;
            let mut scored: Vec<(&MemoryRecord, f32)> = candidates
                .iter()
                .filter_map(|r| {
                    r.embedding
                        .as_ref()
                        .map(|e| (*r, cosine_similarity(&q_embed, e)))
                })
                .filter(|(_, sim)| *sim >= query.threshold)
                .collect();
            // 相似度降序；并列时按创建时间降序 + id 保证确定性
            scored.sort_by(|a, b| {
                b.1.total_cmp(&a.1)
                    .then(b.0.created_at.cmp(&a.0.created_at))
                    .then(a.0.id.cmp(&b.0.id))
            });
            scored.into_iter().map(|(r, _)| r.clone()).collect()
        } else {
            // 无排序文本时按创建时间降序（新→旧），截断后保留最新的一批；
            // id 兜底保证相同查询返回相同顺序
            candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
            candidates.into_iter().cloned().collect()
        };

        results.truncate(query.limit);
        tracing::debug!("retrieved {} memories", results.len());

        for record in &mut results {
            restore_content(record);
        }
        results
    }

    /// 单条读取，应用与 retrieve 相同的内容还原
    pub async fn get(&self, id: &str) -> Option<MemoryRecord> {
        let records = self.records.read().await;
        let mut record = records.get(id).cloned()?;
        restore_content(&mut record);
        Some(record)
    }

    /// 删除一条记录；不存在时为空操作
    pub async fn delete(&self, id: &str) {
        if self.records.write().await.remove(id).is_some() {
            tracing::debug!("memory deleted: {}", &id[..8.min(id.len())]);
        }
    }

    /// 清理所有过期记录，返回移除条数；缓存超限时截断为最近插入的尾部
    pub async fn cleanup(&self) -> usize {
        let now = Utc::now();
        let removed = {
            let mut records = self.records.write().await;
            let before = records.len();
            records.retain(|_, r| !r.is_expired(now));
            before - records.len()
        };

        let mut cache = self.cache.lock().await;
        if cache.len() >= self.cache_max {
            cache.truncate_to_tail(self.cache_keep);
            tracing::debug!("embedding cache truncated to {} entries", self.cache_keep);
        }

        if removed > 0 {
            tracing::debug!("cleaned {} expired memories", removed);
        }
        removed
    }

    /// 按 kind 统计存量
    pub async fn stats(&self) -> MemoryStats {
        let records = self.records.read().await;
        let mut stats = MemoryStats {
            total: records.len(),
            ..Default::default()
        };
        for r in records.values() {
            match r.kind {
                MemoryKind::Working => stats.working += 1,
                MemoryKind::Episodic => stats.episodic += 1,
                MemoryKind::Procedural => stats.procedural += 1,
                MemoryKind::Semantic => stats.semantic += 1,
            }
        }
        stats
    }

    /// 记录是否携带结构化内容（写入时为对象 / 数组）
    pub async fn is_structured(&self, id: &str) -> bool {
        let records = self.records.read().await;
        records
            .get(id)
            .and_then(|r| r.meta_str(CONTENT_TYPE_KEY))
            .map(|t| t == "object" || t == "array")
            .unwrap_or(false)
    }

    /// 当前嵌入缓存条数（测试与监控用）
    pub async fn embed_cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

/// 读取侧内容还原：标记过的内容反序列化回原形态；
/// 未标记但形似 JSON 字面量的短字符串做机会性重解析（可能误判）。
fn restore_content(record: &mut MemoryRecord) {
    let Value::String(s) = &record.content else {
        return;
    };

    match record.meta_str(CONTENT_TYPE_KEY) {
        Some("object") | Some("array") | Some("json_string") => {
            if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                record.content = parsed;
                record.metadata.remove(CONTENT_TYPE_KEY);
            }
        }
        _ => {
            let trimmed = s.trim();
            let looks_structured = trimmed.len() < REPARSE_MAX_LEN
                && ((trimmed.starts_with('{') && trimmed.ends_with('}'))
                    || (trimmed.starts_with('[') && trimmed.ends_with(']')));
            if looks_structured {
                if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
                    record.content = parsed;
                }
            }
        }
    }
}
