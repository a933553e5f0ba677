//! Vector memory interface and in-memory implementation

use std::sync::Mutex;

use serde_json::{Map, Value};

use crate::events::now_secs;

/// One retrieved memory
#[derive(Debug, Clone)]
pub struct MemoryHit {
    pub id: String,
    pub text: String,
    pub metadata: Map<String, Value>,
    pub score: f32,
}

/// Vector store contract consumed by skills and the planner
pub trait VectorStore: Send + Sync {
    /// Top-k nearest entries by similarity
    fn query(&self, embedding: &[f32], top_k: usize) -> Vec<MemoryHit>;

    /// Insert or replace an entry
    fn upsert(&self, id: &str, embedding: Vec<f32>, text: String, metadata: Map<String, Value>);

    /// Drop entries older than the watermark; returns removed count
    fn delete_older_than(&self, ts: f64) -> usize;
}

struct Entry {
    id: String,
    embedding: Vec<f32>,
    text: String,
    metadata: Map<String, Value>,
    created_at: f64,
}

/// Cosine-similarity store backed by a plain vector
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: Mutex<Vec<Entry>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

impl VectorStore for InMemoryVectorStore {
    fn query(&self, embedding: &[f32], top_k: usize) -> Vec<MemoryHit> {
        let entries = self.entries.lock().unwrap();
        let mut scored: Vec<MemoryHit> = entries
            .iter()
            .map(|entry| MemoryHit {
                id: entry.id.clone(),
                text: entry.text.clone(),
                metadata: entry.metadata.clone(),
                score: cosine(embedding, &entry.embedding),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        scored
    }

    fn upsert(&self, id: &str, embedding: Vec<f32>, text: String, metadata: Map<String, Value>) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|entry| entry.id != id);
        entries.push(Entry {
            id: id.to_string(),
            embedding,
            text,
            metadata,
            created_at: now_secs(),
        });
    }

    fn delete_older_than(&self, ts: f64) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|entry| entry.created_at >= ts);
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(items: &[(&str, Vec<f32>)]) -> InMemoryVectorStore {
        let store = InMemoryVectorStore::new();
        for (id, embedding) in items {
            store.upsert(id, embedding.clone(), format!("text-{}", id), Map::new());
        }
        store
    }

    #[test]
    fn test_query_ranks_by_similarity() {
        let store = store_with(&[
            ("aligned", vec![1.0, 0.0]),
            ("orthogonal", vec![0.0, 1.0]),
            ("opposite", vec![-1.0, 0.0]),
        ]);

        let hits = store.query(&[1.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "aligned");
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_upsert_replaces() {
        let store = store_with(&[("a", vec![1.0, 0.0])]);
        store.upsert("a", vec![0.0, 1.0], "updated".to_string(), Map::new());
        assert_eq!(store.len(), 1);

        let hits = store.query(&[0.0, 1.0], 1);
        assert_eq!(hits[0].text, "updated");
    }

    #[test]
    fn test_delete_older_than() {
        let store = store_with(&[("old", vec![1.0])]);
        let removed = store.delete_older_than(now_secs() + 10.0);
        assert_eq!(removed, 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_mismatched_dimensions_score_zero() {
        let store = store_with(&[("a", vec![1.0, 0.0, 0.0])]);
        let hits = store.query(&[1.0, 0.0], 1);
        assert_eq!(hits[0].score, 0.0);
    }
}
