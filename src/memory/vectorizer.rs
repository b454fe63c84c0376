//! 文本向量化：确定性伪嵌入
//!
//! HashVectorizer 基于 md5 单向哈希生成定长单位向量：相同文本永远得到相同向量，
//! 相似度是「词面哈希相似」而非语义相似。接口抽象为 TextVectorizer，
//! 后续可替换为真实嵌入模型而不触及检索 / 评分逻辑。

/// 文本 → 定长向量。实现必须是确定性的：同一文本两次调用返回相同向量。
pub trait TextVectorizer: Send + Sync {
    fn vectorize(&self, text: &str) -> Vec<f32>;

    /// 输出向量维度
    fn dimension(&self) -> usize;
}

/// md5 伪嵌入：16 字节摘要映射到 [0,1] 后做 L2 归一化
#[derive(Debug, Default, Clone)]
pub struct HashVectorizer;

impl HashVectorizer {
    pub fn new() -> Self {
        Self
    }
}

impl TextVectorizer for HashVectorizer {
    fn vectorize(&self, text: &str) -> Vec<f32> {
        let digest = md5::compute(text.as_bytes());
        let mut v: Vec<f32> = digest.iter().map(|b| *b as f32 / 255.0).collect();
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }

    fn dimension(&self) -> usize {
        16
    }
}

/// 余弦相似度；任一向量为零向量或长度不一致时返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vectorize_deterministic() {
        let v = HashVectorizer::new();
        let a = v.vectorize("hello world");
        let b = v.vectorize("hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), v.dimension());
    }

    #[test]
    fn test_vectorize_unit_norm() {
        let v = HashVectorizer::new();
        let a = v.vectorize("some text");
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_different_text_different_vector() {
        let v = HashVectorizer::new();
        assert_ne!(v.vectorize("alpha"), v.vectorize("beta"));
    }

    #[test]
    fn test_cosine_self_similarity() {
        let v = HashVectorizer::new();
        let a = v.vectorize("identical");
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_cosine_zero_and_mismatch() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
