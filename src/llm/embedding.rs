//! 嵌入：将文本编码为固定维度向量，供长期记忆与情景记忆检索
//!
//! HashingEmbedder 为本地实现：分词后对每个词做 FNV-1a 哈希，映射到带符号的桶并做 L2 归一化。
//! 接入真实嵌入服务时实现 Embedder 即可，维度须与 memory.embedding_dim 一致。

use crate::memory::tokenizer::tokenize;

pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;

    fn embed(&self, text: &str) -> Vec<f32>;
}

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

impl Embedder for HashingEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        for token in tokenize(text) {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dim as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::vector_index::cosine_similarity;

    #[test]
    fn test_embedding_is_deterministic_and_normalized() {
        let e = HashingEmbedder::new(64);
        let a = e.embed("fetch weather data for Berlin");
        assert_eq!(a.len(), 64);
        assert_eq!(a, e.embed("fetch weather data for Berlin"));
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_similar_texts_score_higher() {
        let e = HashingEmbedder::new(256);
        let base = e.embed("summarize quarterly sales report");
        let close = e.embed("summarize the sales report");
        let far = e.embed("compile kernel module");
        assert!(cosine_similarity(&base, &close) > cosine_similarity(&base, &far));
    }

    #[test]
    fn test_empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(8);
        assert!(e.embed("").iter().all(|x| *x == 0.0));
    }
}
