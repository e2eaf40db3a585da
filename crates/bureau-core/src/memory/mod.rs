//! Shared Memory Graph — TTL- and consent-gated knowledge store.
//!
//! Nodes live in a resident index mirrored into a vector store for
//! similarity search. Every read applies the consent rule; expired nodes
//! are lazily swept on read and periodically purged by a background task.

pub mod federation;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::MessageBroker;
use crate::embedding::EmbeddingProvider;
use crate::error::BureauError;
use crate::models::memory::{ConsentLevel, MemoryNode, MemoryType, SubgraphEdge, SubgraphNode};
use crate::vector::{VectorFilter, VectorStore};

pub use federation::{FederatedHit, MemoryFederation};

/// Memory graph configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryGraphConfig {
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Over-fetch factor applied before consent filtering trims results.
    #[serde(default = "default_search_overfetch")]
    pub search_overfetch: usize,
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
}

fn default_ttl_secs() -> i64 {
    3600
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_search_overfetch() -> usize {
    2
}
fn default_channel_prefix() -> String {
    "bureau".to_string()
}

impl Default for MemoryGraphConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            search_overfetch: default_search_overfetch(),
            channel_prefix: default_channel_prefix(),
        }
    }
}

/// Parameters for creating a memory node.
#[derive(Debug, Clone)]
pub struct CreateMemory {
    pub office_id: String,
    pub title: String,
    pub content: String,
    pub memory_type: MemoryType,
    pub consent_level: ConsentLevel,
    /// `None` falls back to the configured default TTL.
    pub ttl_seconds: Option<i64>,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

impl CreateMemory {
    pub fn new(
        office_id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            office_id: office_id.into(),
            title: title.into(),
            content: content.into(),
            memory_type: MemoryType::Knowledge,
            consent_level: ConsentLevel::Restricted,
            ttl_seconds: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = memory_type;
        self
    }

    pub fn consent(mut self, consent_level: ConsentLevel) -> Self {
        self.consent_level = consent_level;
        self
    }

    pub fn ttl_seconds(mut self, ttl: i64) -> Self {
        self.ttl_seconds = Some(ttl);
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Exported subgraph around a center node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySubgraph {
    pub nodes: Vec<SubgraphNode>,
    pub edges: Vec<SubgraphEdge>,
}

struct GraphInner {
    nodes: HashMap<String, MemoryNode>,
    /// Explicit grants: receiving office → ids it may read.
    grants: HashMap<String, HashSet<String>>,
}

/// One office federation member: a consent-gated, TTL-bounded node index
/// mirrored into a vector store.
pub struct SharedMemoryGraph {
    config: MemoryGraphConfig,
    inner: Arc<RwLock<GraphInner>>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    broker: Option<Arc<dyn MessageBroker>>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SharedMemoryGraph {
    /// Build the graph and start its background sweep task.
    pub fn start(
        config: MemoryGraphConfig,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        broker: Option<Arc<dyn MessageBroker>>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let graph = Arc::new(Self {
            config,
            inner: Arc::new(RwLock::new(GraphInner {
                nodes: HashMap::new(),
                grants: HashMap::new(),
            })),
            vectors,
            embedder,
            broker,
            shutdown_tx,
            sweeper: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::sweep_loop(
            graph.clone(),
            graph.shutdown_tx.subscribe(),
        ));
        // start() is called from sync constructors, so park the handle
        // without going through the async lock.
        *graph.sweeper.try_lock().expect("fresh sweeper lock") = Some(handle);

        graph
    }

    pub fn config(&self) -> &MemoryGraphConfig {
        &self.config
    }

    pub async fn node_count(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    /// Create a node: embed, index, mirror to the vector store, announce.
    /// The node becomes visible in both stores within this one call.
    pub async fn create_memory(&self, params: CreateMemory) -> Result<MemoryNode, BureauError> {
        let embedding = self.embedder.embed(&params.content).await?;

        let mut node = MemoryNode::new(
            params.office_id,
            params.title,
            params.content,
            params.memory_type,
            params.consent_level,
            params.ttl_seconds.unwrap_or(self.config.default_ttl_secs),
        );
        node.embedding = embedding;
        node.tags = params.tags;
        node.metadata = params.metadata;

        {
            let mut inner = self.inner.write().await;
            inner.nodes.insert(node.id.clone(), node.clone());
            self.vectors
                .upsert(
                    &node.id,
                    node.embedding.clone(),
                    vector_metadata(&node),
                    &node.content,
                )
                .await?;
        }

        self.publish_event(
            "memory_created",
            serde_json::json!({
                "id": node.id,
                "office_id": node.office_id,
                "type": node.memory_type,
                "consent_level": node.consent_level,
            }),
        )
        .await;

        Ok(node)
    }

    /// Fetch a node, applying expiry and the consent rule. Successful reads
    /// update `accessed_at`/`access_count` under the index write lock, so a
    /// concurrent delete cannot interleave with the mutation.
    pub async fn get_memory(
        &self,
        memory_id: &str,
        requesting_office: &str,
    ) -> Result<Option<MemoryNode>, BureauError> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        let (expired, allowed) = match inner.nodes.get(memory_id) {
            None => return Ok(None),
            Some(node) => (
                node.is_expired(now),
                has_access(node, &inner.grants, requesting_office),
            ),
        };

        if expired {
            inner.nodes.remove(memory_id);
            self.vectors.delete(memory_id).await?;
            drop(inner);
            self.publish_event("memory_deleted", serde_json::json!({ "memory_id": memory_id }))
                .await;
            return Ok(None);
        }

        if !allowed {
            return Ok(None);
        }

        let node = inner.nodes.get_mut(memory_id).expect("checked above");
        node.touch(now);
        Ok(Some(node.clone()))
    }

    /// Similarity search gated by consent. Over-fetches from the vector
    /// store, then filters each hit through the access rule and the
    /// `min_consent` openness floor before truncating to `limit`.
    pub async fn search_memories(
        &self,
        query: &str,
        requesting_office: &str,
        limit: usize,
        type_filter: Option<MemoryType>,
        min_consent: ConsentLevel,
    ) -> Result<Vec<MemoryNode>, BureauError> {
        let query_vector = self.embedder.embed(query).await?;
        let filter = type_filter.map(|t| VectorFilter {
            field: "type".to_string(),
            equals: serde_json::json!(t.as_str()),
        });

        let hits = self
            .vectors
            .query(
                query_vector,
                limit.saturating_mul(self.config.search_overfetch.max(1)),
                filter,
            )
            .await?;

        let mut results = Vec::new();
        for hit in hits {
            if let Some(node) = self.get_memory(&hit.id, requesting_office).await? {
                if node.consent_level.rank() <= min_consent.rank() {
                    results.push(node);
                    if results.len() >= limit {
                        break;
                    }
                }
            }
        }
        Ok(results)
    }

    /// Connect two nodes with a symmetric edge. Requires read access to
    /// both and ownership of at least one.
    pub async fn connect_memories(
        &self,
        first_id: &str,
        second_id: &str,
        requesting_office: &str,
    ) -> Result<bool, BureauError> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        let readable = |id: &str, inner: &GraphInner| -> bool {
            inner
                .nodes
                .get(id)
                .map(|n| !n.is_expired(now) && has_access(n, &inner.grants, requesting_office))
                .unwrap_or(false)
        };
        if !readable(first_id, &*inner) || !readable(second_id, &*inner) {
            return Ok(false);
        }

        let owns_first = inner.nodes[first_id].office_id == requesting_office;
        let owns_second = inner.nodes[second_id].office_id == requesting_office;
        if !owns_first && !owns_second {
            return Ok(false);
        }

        inner
            .nodes
            .get_mut(first_id)
            .expect("checked above")
            .connections
            .insert(second_id.to_string());
        inner
            .nodes
            .get_mut(second_id)
            .expect("checked above")
            .connections
            .insert(first_id.to_string());
        drop(inner);

        self.publish_event(
            "memories_connected",
            serde_json::json!({
                "first": first_id,
                "second": second_id,
                "office_id": requesting_office,
            }),
        )
        .await;
        Ok(true)
    }

    /// Change a node's consent level. Owner-only; effective immediately.
    pub async fn update_consent(
        &self,
        memory_id: &str,
        new_consent: ConsentLevel,
        requesting_office: &str,
    ) -> Result<bool, BureauError> {
        let old_consent = {
            let mut inner = self.inner.write().await;
            let Some(node) = inner.nodes.get_mut(memory_id) else {
                return Ok(false);
            };
            if node.office_id != requesting_office {
                return Ok(false);
            }
            let old = node.consent_level;
            node.consent_level = new_consent;
            old
        };

        self.vectors
            .update_metadata(
                memory_id,
                HashMap::from([(
                    "consent_level".to_string(),
                    serde_json::json!(new_consent.as_str()),
                )]),
            )
            .await?;

        self.publish_event(
            "consent_updated",
            serde_json::json!({
                "memory_id": memory_id,
                "old_consent": old_consent,
                "new_consent": new_consent,
                "office_id": requesting_office,
            }),
        )
        .await;
        Ok(true)
    }

    /// Change a node's TTL. Owner-only; effective for subsequent reads.
    pub async fn update_ttl(
        &self,
        memory_id: &str,
        new_ttl_seconds: i64,
        requesting_office: &str,
    ) -> Result<bool, BureauError> {
        {
            let mut inner = self.inner.write().await;
            let Some(node) = inner.nodes.get_mut(memory_id) else {
                return Ok(false);
            };
            if node.office_id != requesting_office {
                return Ok(false);
            }
            node.ttl_seconds = new_ttl_seconds;
        }

        self.vectors
            .update_metadata(
                memory_id,
                HashMap::from([(
                    "ttl_seconds".to_string(),
                    serde_json::json!(new_ttl_seconds),
                )]),
            )
            .await?;
        Ok(true)
    }

    /// Delete a node from the index and the vector store. Idempotent: a
    /// second call reports `false` instead of failing.
    pub async fn delete_memory(&self, memory_id: &str, force: bool) -> Result<bool, BureauError> {
        {
            let mut inner = self.inner.write().await;
            let existed = inner.nodes.remove(memory_id).is_some();
            if !existed && !force {
                return Ok(false);
            }
            self.vectors.delete(memory_id).await?;
        }

        self.publish_event("memory_deleted", serde_json::json!({ "memory_id": memory_id }))
            .await;
        Ok(true)
    }

    /// Grant another office read access to specific nodes. Only ids owned
    /// by `granting_office` are granted; returns how many were.
    pub async fn grant_office_access(
        &self,
        granting_office: &str,
        receiving_office: &str,
        memory_ids: &[String],
    ) -> Result<usize, BureauError> {
        let granted = {
            let mut inner = self.inner.write().await;
            let mut granted = 0;
            for memory_id in memory_ids {
                let owned = inner
                    .nodes
                    .get(memory_id)
                    .map(|n| n.office_id == granting_office)
                    .unwrap_or(false);
                if owned {
                    inner
                        .grants
                        .entry(receiving_office.to_string())
                        .or_default()
                        .insert(memory_id.clone());
                    granted += 1;
                }
            }
            granted
        };

        self.publish_event(
            "access_granted",
            serde_json::json!({
                "granting_office": granting_office,
                "receiving_office": receiving_office,
                "memory_count": granted,
            }),
        )
        .await;
        Ok(granted)
    }

    /// All nodes an office owns, plus (optionally) nodes shared with it.
    pub async fn get_office_memories(
        &self,
        office_id: &str,
        include_shared: bool,
    ) -> Vec<MemoryNode> {
        let now = Utc::now();
        let inner = self.inner.read().await;
        inner
            .nodes
            .values()
            .filter(|node| !node.is_expired(now))
            .filter(|node| {
                node.office_id == office_id
                    || (include_shared && has_access(node, &inner.grants, office_id))
            })
            .cloned()
            .collect()
    }

    /// Breadth-first subgraph export around `center_id`, bounded by
    /// `depth`. Each node is visited once and the access rule applies at
    /// every hop; edges of an included node are listed even when their far
    /// end is not readable.
    pub async fn get_memory_graph(
        &self,
        center_id: &str,
        depth: usize,
        requesting_office: &str,
    ) -> MemorySubgraph {
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        let mut subgraph = MemorySubgraph {
            nodes: Vec::new(),
            edges: Vec::new(),
        };
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<(String, usize)> = VecDeque::new();
        frontier.push_back((center_id.to_string(), 0));

        while let Some((id, hop)) = frontier.pop_front() {
            if hop > depth || !visited.insert(id.clone()) {
                continue;
            }

            let accessible = inner
                .nodes
                .get(&id)
                .map(|n| !n.is_expired(now) && has_access(n, &inner.grants, requesting_office))
                .unwrap_or(false);
            if !accessible {
                continue;
            }

            let node = inner.nodes.get_mut(&id).expect("checked above");
            node.touch(now);
            subgraph.nodes.push(SubgraphNode {
                id: node.id.clone(),
                title: node.title.clone(),
                memory_type: node.memory_type,
                office_id: node.office_id.clone(),
                consent_level: node.consent_level,
            });

            for connected in node.connections.clone() {
                subgraph.edges.push(SubgraphEdge {
                    source: id.clone(),
                    target: connected.clone(),
                });
                frontier.push_back((connected, hop + 1));
            }
        }

        subgraph
    }

    /// Purge every expired node, regardless of consent level. Returns how
    /// many were removed.
    pub async fn sweep_expired(&self) -> Result<usize, BureauError> {
        let now = Utc::now();
        let expired: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .nodes
                .values()
                .filter(|n| n.is_expired(now))
                .map(|n| n.id.clone())
                .collect()
        };

        for id in &expired {
            if let Err(e) = self.delete_memory(id, true).await {
                warn!("[MemoryGraph] failed to sweep {}: {}", id, e);
            }
        }
        Ok(expired.len())
    }

    async fn sweep_loop(graph: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval =
            std::time::Duration::from_secs(graph.config.sweep_interval_secs.max(1));
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match graph.sweep_expired().await {
                Ok(0) => {}
                Ok(swept) => info!("[MemoryGraph] swept {} expired nodes", swept),
                Err(e) => warn!("[MemoryGraph] sweep failed: {}", e),
            }
        }
        debug!("[MemoryGraph] sweeper stopped");
    }

    async fn publish_event(&self, event_type: &str, data: Value) {
        let Some(broker) = &self.broker else {
            return;
        };
        let channel = format!("{}:memory:{}", self.config.channel_prefix, event_type);
        let payload = serde_json::json!({
            "event_type": event_type,
            "timestamp": Utc::now(),
            "data": data,
        });
        match serde_json::to_vec(&payload) {
            Ok(bytes) => {
                if let Err(e) = broker.publish(&channel, bytes).await {
                    debug!("[MemoryGraph] event publish failed: {}", e);
                }
            }
            Err(e) => debug!("[MemoryGraph] event serialization failed: {}", e),
        }
    }

    /// Stop the background sweep task.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.sweeper.lock().await.take() {
            let _ = handle.await;
        }
        info!("[MemoryGraph] shut down");
    }
}

/// Consent rule: owner always; PUBLIC/SHARED for anyone; RESTRICTED only
/// with an explicit grant; PRIVATE never for non-owners.
fn has_access(
    node: &MemoryNode,
    grants: &HashMap<String, HashSet<String>>,
    requesting_office: &str,
) -> bool {
    if node.office_id == requesting_office {
        return true;
    }
    match node.consent_level {
        ConsentLevel::Public | ConsentLevel::Shared => true,
        ConsentLevel::Restricted => grants
            .get(requesting_office)
            .map(|ids| ids.contains(&node.id))
            .unwrap_or(false),
        ConsentLevel::Private => false,
    }
}

fn vector_metadata(node: &MemoryNode) -> HashMap<String, Value> {
    HashMap::from([
        ("office_id".to_string(), serde_json::json!(node.office_id)),
        ("type".to_string(), serde_json::json!(node.memory_type.as_str())),
        (
            "consent_level".to_string(),
            serde_json::json!(node.consent_level.as_str()),
        ),
        ("created_at".to_string(), serde_json::json!(node.created_at)),
        ("ttl_seconds".to_string(), serde_json::json!(node.ttl_seconds)),
    ])
}
