//! 记忆层：共享记录存储、数据模型、伪嵌入向量化

pub mod store;
pub mod types;
pub mod vectorizer;

pub use store::MemoryStore;
pub use types::{MemoryKind, MemoryQuery, MemoryRecord, MemoryStats};
pub use vectorizer::{cosine_similarity, HashVectorizer, TextVectorizer};
