
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::models::ChunkId;

/// Cosine similarity of two equal-length vectors; zero when either has zero norm
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}

/// Result order: higher score first, then lower id
#[inline]
pub fn rank_order(a: (f32, ChunkId), b: (f32, ChunkId)) -> Ordering {
    b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1))
}

/// Heap entry ordered so that the *worst* ranked candidate is the greatest
#[derive(Debug)]
struct Candidate<T> {
    score: f32,
    id: ChunkId,
    item: T,
}

impl<T> PartialEq for Candidate<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T> Eq for Candidate<T> {}

impl<T> PartialOrd for Candidate<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Candidate<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        rank_order((self.score, self.id), (other.score, other.id))
    }
}

/// Keeps the best `k` scored items seen so far in O(k) memory
#[derive(Debug)]
pub struct TopK<T> {
    k: usize,
    heap: BinaryHeap<Candidate<T>>,
}

impl<T> TopK<T> {
    #[inline]
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k.saturating_add(1).min(1024)),
        }
    }

    /// Whether an item with this score and id would currently make the cut
    #[inline]
    pub fn accepts(&self, score: f32, id: ChunkId) -> bool {
        if self.k == 0 {
            return false;
        }
        if self.heap.len() < self.k {
            return true;
        }
        self.heap
            .peek()
            .is_some_and(|worst| rank_order((score, id), (worst.score, worst.id)) == Ordering::Less)
    }

    #[inline]
    pub fn push(&mut self, score: f32, id: ChunkId, item: T) {
        if !self.accepts(score, id) {
            return;
        }
        self.heap.push(Candidate { score, id, item });
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drain into ranked order, best first
    #[inline]
    pub fn into_sorted(self) -> Vec<(f32, T)> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|candidate| (candidate.score, candidate.item))
            .collect()
    }
}

/// Sort scored items into result order in place
#[inline]
pub fn sort_ranked<T>(items: &mut [T], key: impl Fn(&T) -> (f32, ChunkId)) {
    items.sort_by(|a, b| rank_order(key(a), key(b)));
}
