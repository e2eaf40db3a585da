//! Vector store seam — similarity search backing for the memory graph.
//!
//! A durable store (Chroma, LanceDB, ...) implements [`VectorStore`];
//! [`InMemoryVectorStore`] is the bundled implementation. Ranking runs on
//! the blocking pool so scoring large stores never stalls the event loop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::BureauError;

/// Equality filter applied to entry metadata during a query.
#[derive(Debug, Clone)]
pub struct VectorFilter {
    pub field: String,
    pub equals: Value,
}

/// A ranked query hit.
#[derive(Debug, Clone)]
pub struct ScoredId {
    pub id: String,
    pub score: f32,
}

/// Storage contract for embedded memory content.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(
        &self,
        id: &str,
        vector: Vec<f32>,
        metadata: HashMap<String, Value>,
        text: &str,
    ) -> Result<(), BureauError>;

    /// Top-`k` entries by similarity, optionally filtered by metadata
    /// equality before ranking.
    async fn query(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: Option<VectorFilter>,
    ) -> Result<Vec<ScoredId>, BureauError>;

    /// Remove an entry. Unknown ids are a no-op.
    async fn delete(&self, id: &str) -> Result<(), BureauError>;

    /// Merge the given fields into an entry's metadata.
    async fn update_metadata(
        &self,
        id: &str,
        partial: HashMap<String, Value>,
    ) -> Result<(), BureauError>;
}

#[derive(Clone)]
struct VectorEntry {
    vector: Vec<f32>,
    metadata: HashMap<String, Value>,
}

/// In-memory cosine-similarity store.
pub struct InMemoryVectorStore {
    entries: Arc<RwLock<HashMap<String, VectorEntry>>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(
        &self,
        id: &str,
        vector: Vec<f32>,
        metadata: HashMap<String, Value>,
        _text: &str,
    ) -> Result<(), BureauError> {
        self.entries
            .write()
            .await
            .insert(id.to_string(), VectorEntry { vector, metadata });
        Ok(())
    }

    async fn query(
        &self,
        vector: Vec<f32>,
        k: usize,
        filter: Option<VectorFilter>,
    ) -> Result<Vec<ScoredId>, BureauError> {
        let candidates: Vec<(String, VectorEntry)> = {
            let entries = self.entries.read().await;
            entries
                .iter()
                .filter(|(_, entry)| match &filter {
                    Some(f) => entry.metadata.get(&f.field) == Some(&f.equals),
                    None => true,
                })
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect()
        };

        let ranked = tokio::task::spawn_blocking(move || {
            let mut scored: Vec<ScoredId> = candidates
                .into_iter()
                .map(|(id, entry)| ScoredId {
                    score: cosine(&vector, &entry.vector),
                    id,
                })
                .collect();
            scored.sort_by(|a, b| b.score.total_cmp(&a.score));
            scored.truncate(k);
            scored
        })
        .await
        .map_err(|e| BureauError::Delivery(format!("ranking task failed: {}", e)))?;

        Ok(ranked)
    }

    async fn delete(&self, id: &str) -> Result<(), BureauError> {
        self.entries.write().await.remove(id);
        Ok(())
    }

    async fn update_metadata(
        &self,
        id: &str,
        partial: HashMap<String, Value>,
    ) -> Result<(), BureauError> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.metadata.extend(partial);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(kind: &str) -> HashMap<String, Value> {
        HashMap::from([("type".to_string(), json!(kind))])
    }

    #[tokio::test]
    async fn test_query_ranks_by_similarity() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("a", vec![1.0, 0.0], meta("knowledge"), "a")
            .await
            .unwrap();
        store
            .upsert("b", vec![0.0, 1.0], meta("knowledge"), "b")
            .await
            .unwrap();

        let hits = store.query(vec![0.9, 0.1], 2, None).await.unwrap();
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "b");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_metadata_filter() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("a", vec![1.0, 0.0], meta("knowledge"), "a")
            .await
            .unwrap();
        store
            .upsert("b", vec![1.0, 0.0], meta("skill"), "b")
            .await
            .unwrap();

        let hits = store
            .query(
                vec![1.0, 0.0],
                10,
                Some(VectorFilter {
                    field: "type".to_string(),
                    equals: json!("skill"),
                }),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "b");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("a", vec![1.0], HashMap::new(), "a")
            .await
            .unwrap();
        store.delete("a").await.unwrap();
        store.delete("a").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_metadata_merges() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("a", vec![1.0], meta("knowledge"), "a")
            .await
            .unwrap();
        store
            .update_metadata(
                "a",
                HashMap::from([("consent_level".to_string(), json!("public"))]),
            )
            .await
            .unwrap();

        let hits = store
            .query(
                vec![1.0],
                1,
                Some(VectorFilter {
                    field: "consent_level".to_string(),
                    equals: json!("public"),
                }),
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
