//! 向量索引：固定维度嵌入上的最近邻检索（余弦相似度）
//!
//! 索引由若干定长分段（segment）组成，插入只追加到最后一个分段，写满后新开分段，
//! 因此增量插入不需要重建。每个向量在插入时预先计算范数，检索时做一次线性扫描。
//! 并发控制由持有方负责（LongTermStore / EpisodicStore 外包一层 RwLock）。

use std::collections::HashMap;

use uuid::Uuid;

use crate::memory::MemoryError;

/// 单个分段的容量
const SEGMENT_CAPACITY: usize = 1024;

/// 检索命中：条目 ID 与余弦相似度（[-1, 1]）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorHit {
    pub id: Uuid,
    pub similarity: f32,
}

#[derive(Debug, Default)]
struct Segment {
    ids: Vec<Uuid>,
    /// 行主序扁平存储，每行 dim 个分量
    vectors: Vec<f32>,
    norms: Vec<f32>,
}

impl Segment {
    fn len(&self) -> usize {
        self.ids.len()
    }
}

#[derive(Debug)]
pub struct VectorIndex {
    dim: usize,
    segments: Vec<Segment>,
    /// id -> (segment, row)
    positions: HashMap<Uuid, (usize, usize)>,
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// 余弦相似度；任一向量范数为 0 时返回 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = norm(a);
    let norm_b = norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

impl VectorIndex {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            segments: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.positions.contains_key(id)
    }

    fn check_dim(&self, v: &[f32]) -> Result<(), MemoryError> {
        if v.len() != self.dim {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dim,
                actual: v.len(),
            });
        }
        Ok(())
    }

    /// 插入向量；同一 id 重复插入时原地覆盖
    pub fn insert(&mut self, id: Uuid, vector: &[f32]) -> Result<(), MemoryError> {
        self.check_dim(vector)?;

        if let Some(&(seg, row)) = self.positions.get(&id) {
            let segment = &mut self.segments[seg];
            let start = row * self.dim;
            segment.vectors[start..start + self.dim].copy_from_slice(vector);
            segment.norms[row] = norm(vector);
            return Ok(());
        }

        let need_new = self
            .segments
            .last()
            .map_or(true, |s| s.len() >= SEGMENT_CAPACITY);
        if need_new {
            self.segments.push(Segment::default());
        }
        let seg_idx = self.segments.len() - 1;
        let segment = &mut self.segments[seg_idx];
        let row = segment.len();
        segment.ids.push(id);
        segment.vectors.extend_from_slice(vector);
        segment.norms.push(norm(vector));
        self.positions.insert(id, (seg_idx, row));
        Ok(())
    }

    /// 对全部条目打分，按相似度降序（相同分数按 id 升序，保证确定性）
    pub fn score_all(&self, query: &[f32]) -> Result<Vec<VectorHit>, MemoryError> {
        self.check_dim(query)?;
        let query_norm = norm(query);

        let mut hits = Vec::with_capacity(self.len());
        for segment in &self.segments {
            for (row, id) in segment.ids.iter().enumerate() {
                let start = row * self.dim;
                let v = &segment.vectors[start..start + self.dim];
                let denom = query_norm * segment.norms[row];
                let similarity = if denom == 0.0 {
                    0.0
                } else {
                    v.iter().zip(query).map(|(x, y)| x * y).sum::<f32>() / denom
                };
                hits.push(VectorHit { id: *id, similarity });
            }
        }
        hits.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(hits)
    }

    /// 返回最相近的 k 个条目
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<VectorHit>, MemoryError> {
        let mut hits = self.score_all(query)?;
        hits.truncate(k);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &[0.0, 1.0, 0.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_search_orders_by_similarity() {
        let mut index = VectorIndex::new(3);
        let near = Uuid::new_v4();
        let far = Uuid::new_v4();
        index.insert(far, &[0.0, 1.0, 0.0]).unwrap();
        index.insert(near, &[1.0, 0.1, 0.0]).unwrap();

        let hits = index.search(&[1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, near);
    }

    #[test]
    fn test_dimension_mismatch_is_error() {
        let mut index = VectorIndex::new(3);
        let err = index.insert(Uuid::new_v4(), &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, MemoryError::DimensionMismatch { expected: 3, actual: 2 }));

        index.insert(Uuid::new_v4(), &[1.0, 2.0, 3.0]).unwrap();
        assert!(index.search(&[1.0; 4], 5).is_err());
    }

    #[test]
    fn test_incremental_insert_spans_segments() {
        let mut index = VectorIndex::new(2);
        for i in 0..(SEGMENT_CAPACITY + 5) {
            index.insert(Uuid::new_v4(), &[i as f32, 1.0]).unwrap();
        }
        assert_eq!(index.len(), SEGMENT_CAPACITY + 5);
        assert_eq!(index.segment_count(), 2);
        assert_eq!(index.search(&[1.0, 0.0], 3).unwrap().len(), 3);
    }

    #[test]
    fn test_reinsert_overwrites() {
        let mut index = VectorIndex::new(2);
        let id = Uuid::new_v4();
        index.insert(id, &[1.0, 0.0]).unwrap();
        index.insert(id, &[0.0, 1.0]).unwrap();
        assert_eq!(index.len(), 1);
        let hits = index.search(&[0.0, 1.0], 1).unwrap();
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }
}
