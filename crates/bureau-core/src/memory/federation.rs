//! Memory federation — search and sharing across per-office graphs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::BureauError;
use crate::memory::{CreateMemory, SharedMemoryGraph};
use crate::models::memory::{ConsentLevel, MemoryNode};

/// A federated search hit, tagged with the graph it came from.
#[derive(Debug, Clone)]
pub struct FederatedHit {
    pub office_id: String,
    pub node: MemoryNode,
}

/// Registry of per-office memory graphs.
pub struct MemoryFederation {
    graphs: RwLock<HashMap<String, Arc<SharedMemoryGraph>>>,
}

impl MemoryFederation {
    pub fn new() -> Self {
        Self {
            graphs: RwLock::new(HashMap::new()),
        }
    }

    /// Register an office's graph in the federation.
    pub async fn register_office(&self, office_id: &str, graph: Arc<SharedMemoryGraph>) {
        self.graphs
            .write()
            .await
            .insert(office_id.to_string(), graph);
        info!("[Federation] office registered: {}", office_id);
    }

    pub async fn unregister_office(&self, office_id: &str) -> bool {
        self.graphs.write().await.remove(office_id).is_some()
    }

    pub async fn graph(&self, office_id: &str) -> Option<Arc<SharedMemoryGraph>> {
        self.graphs.read().await.get(office_id).cloned()
    }

    pub async fn office_ids(&self) -> Vec<String> {
        self.graphs.read().await.keys().cloned().collect()
    }

    /// Fan a query concurrently across office graphs and merge the hits.
    /// A graph whose search fails contributes nothing; the failure is
    /// logged, not propagated.
    pub async fn federated_search(
        &self,
        query: &str,
        requesting_office: &str,
        target_offices: Option<&[String]>,
        limit: usize,
        min_consent: ConsentLevel,
    ) -> Vec<FederatedHit> {
        let graphs: Vec<(String, Arc<SharedMemoryGraph>)> = {
            let registry = self.graphs.read().await;
            match target_offices {
                Some(targets) => targets
                    .iter()
                    .filter_map(|id| registry.get(id).map(|g| (id.clone(), g.clone())))
                    .collect(),
                None => registry
                    .iter()
                    .map(|(id, g)| (id.clone(), g.clone()))
                    .collect(),
            }
        };

        let mut searches = JoinSet::new();
        for (office_id, graph) in graphs {
            let query = query.to_string();
            let requester = requesting_office.to_string();
            searches.spawn(async move {
                let result = graph
                    .search_memories(&query, &requester, limit, None, min_consent)
                    .await;
                (office_id, result)
            });
        }

        let mut hits: Vec<FederatedHit> = Vec::new();
        while let Some(joined) = searches.join_next().await {
            match joined {
                Ok((office_id, Ok(nodes))) => {
                    hits.extend(nodes.into_iter().map(|node| FederatedHit {
                        office_id: office_id.clone(),
                        node,
                    }));
                }
                Ok((office_id, Err(e))) => {
                    warn!("[Federation] search failed for {}: {}", office_id, e);
                }
                Err(e) => warn!("[Federation] search task panicked: {}", e),
            }
        }

        // TODO: rank by query similarity instead of access count.
        hits.sort_by(|a, b| b.node.access_count.cmp(&a.node.access_count));
        hits.truncate(limit);
        hits
    }

    /// Copy (never move) a node from one office's graph into another's,
    /// under the given consent level, with provenance recorded in the tags
    /// and metadata.
    pub async fn cross_office_memory_share(
        &self,
        source_office: &str,
        target_office: &str,
        memory_id: &str,
        consent_level: ConsentLevel,
    ) -> Result<bool, BureauError> {
        let (source, target) = {
            let registry = self.graphs.read().await;
            match (registry.get(source_office), registry.get(target_office)) {
                (Some(s), Some(t)) => (s.clone(), t.clone()),
                _ => return Ok(false),
            }
        };

        let Some(node) = source.get_memory(memory_id, source_office).await? else {
            return Ok(false);
        };

        let mut tags = node.tags.clone();
        tags.push(format!("shared_from:{}", source_office));
        let mut metadata = node.metadata.clone();
        metadata.insert(
            "original_office".to_string(),
            serde_json::json!(source_office),
        );
        metadata.insert(
            "original_memory_id".to_string(),
            serde_json::json!(memory_id),
        );

        target
            .create_memory(
                CreateMemory::new(
                    target_office,
                    format!("[Shared from {}] {}", source_office, node.title),
                    node.content.clone(),
                )
                .memory_type(node.memory_type)
                .consent(consent_level)
                .ttl_seconds(node.ttl_seconds)
                .tags(tags)
                .metadata(metadata),
            )
            .await?;

        info!(
            "[Federation] shared {} from {} to {}",
            memory_id, source_office, target_office
        );
        Ok(true)
    }
}

impl Default for MemoryFederation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedding;
    use crate::memory::MemoryGraphConfig;
    use crate::vector::InMemoryVectorStore;

    fn graph() -> Arc<SharedMemoryGraph> {
        SharedMemoryGraph::start(
            MemoryGraphConfig::default(),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(HashEmbedding::new(64)),
            None,
        )
    }

    #[tokio::test]
    async fn test_search_tags_owning_office() {
        let federation = MemoryFederation::new();
        let banker = graph();
        let tarot = graph();
        federation.register_office("banker", banker.clone()).await;
        federation.register_office("tarot", tarot.clone()).await;

        banker
            .create_memory(
                CreateMemory::new("banker", "rates", "interest rates are rising")
                    .consent(ConsentLevel::Public),
            )
            .await
            .unwrap();

        let targets = ["banker".to_string(), "tarot".to_string()];
        let hits = federation
            .federated_search(
                "interest rates",
                "economist",
                Some(&targets),
                10,
                ConsentLevel::Public,
            )
            .await;

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].office_id, "banker");
        assert_eq!(hits[0].node.title, "rates");
    }

    #[tokio::test]
    async fn test_search_ranks_by_access_count() {
        let federation = MemoryFederation::new();
        let banker = graph();
        federation.register_office("banker", banker.clone()).await;

        let cold = banker
            .create_memory(
                CreateMemory::new("banker", "cold", "market outlook")
                    .consent(ConsentLevel::Public),
            )
            .await
            .unwrap();
        let hot = banker
            .create_memory(
                CreateMemory::new("banker", "hot", "market outlook")
                    .consent(ConsentLevel::Public),
            )
            .await
            .unwrap();
        for _ in 0..5 {
            banker.get_memory(&hot.id, "banker").await.unwrap();
        }

        let hits = federation
            .federated_search("market outlook", "economist", None, 10, ConsentLevel::Public)
            .await;
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].node.id, hot.id);
        assert_eq!(hits[1].node.id, cold.id);
    }

    #[tokio::test]
    async fn test_share_copies_with_provenance() {
        let federation = MemoryFederation::new();
        let banker = graph();
        let tarot = graph();
        federation.register_office("banker", banker.clone()).await;
        federation.register_office("tarot", tarot.clone()).await;

        let node = banker
            .create_memory(
                CreateMemory::new("banker", "rates", "interest rates are rising")
                    .consent(ConsentLevel::Private),
            )
            .await
            .unwrap();

        let shared = federation
            .cross_office_memory_share("banker", "tarot", &node.id, ConsentLevel::Shared)
            .await
            .unwrap();
        assert!(shared);

        // The source still owns its original.
        assert!(banker.get_memory(&node.id, "banker").await.unwrap().is_some());

        let copies = tarot.get_office_memories("tarot", false).await;
        assert_eq!(copies.len(), 1);
        let copy = &copies[0];
        assert_eq!(copy.title, "[Shared from banker] rates");
        assert_eq!(copy.consent_level, ConsentLevel::Shared);
        assert!(copy.tags.contains(&"shared_from:banker".to_string()));
        assert_eq!(copy.metadata["original_memory_id"], node.id.as_str());
    }

    #[tokio::test]
    async fn test_share_unknown_office_or_node_is_negative() {
        let federation = MemoryFederation::new();
        let banker = graph();
        federation.register_office("banker", banker.clone()).await;

        assert!(!federation
            .cross_office_memory_share("banker", "missing", "id", ConsentLevel::Shared)
            .await
            .unwrap());
        assert!(!federation
            .cross_office_memory_share("banker", "banker", "missing-node", ConsentLevel::Shared)
            .await
            .unwrap());
    }
}
