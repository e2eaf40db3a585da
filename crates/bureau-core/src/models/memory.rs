//! Memory node model for the shared memory graph.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of knowledge a memory node carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Knowledge,
    Experience,
    Skill,
    Relationship,
    Decision,
    Strategy,
    Emotion,
    Context,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Knowledge => "knowledge",
            Self::Experience => "experience",
            Self::Skill => "skill",
            Self::Relationship => "relationship",
            Self::Decision => "decision",
            Self::Strategy => "strategy",
            Self::Emotion => "emotion",
            Self::Context => "context",
        }
    }
}

/// Visibility policy for a memory node.
///
/// Owners always have access. `Public` and `Shared` are readable by any
/// office, `Restricted` only with an explicit grant, `Private` never.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentLevel {
    Private,
    Restricted,
    Shared,
    Public,
}

impl ConsentLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Restricted => "restricted",
            Self::Shared => "shared",
            Self::Public => "public",
        }
    }

    /// Openness rank: PUBLIC(0) < SHARED(1) < RESTRICTED(2) < PRIVATE(3).
    /// A node qualifies for a search floor when its rank ≤ the floor's rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Public => 0,
            Self::Shared => 1,
            Self::Restricted => 2,
            Self::Private => 3,
        }
    }
}

/// A single node in the shared memory graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
    /// Owning office.
    pub office_id: String,
    pub consent_level: ConsentLevel,
    pub ttl_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub access_count: u64,
    /// Symmetric edge set: ids of connected nodes.
    #[serde(default)]
    pub connections: HashSet<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl MemoryNode {
    pub fn new(
        office_id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        memory_type: MemoryType,
        consent_level: ConsentLevel,
        ttl_seconds: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            memory_type,
            title: title.into(),
            content: content.into(),
            embedding: Vec::new(),
            office_id: office_id.into(),
            consent_level,
            ttl_seconds,
            created_at: now,
            accessed_at: now,
            access_count: 0,
            connections: HashSet::new(),
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Age-based expiry. A non-positive TTL never expires.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ttl_seconds > 0 && (now - self.created_at).num_seconds() > self.ttl_seconds
    }

    /// Record a successful read.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.accessed_at = now;
        self.access_count += 1;
    }
}

/// Node summary in an exported subgraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphNode {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    pub office_id: String,
    pub consent_level: ConsentLevel,
}

/// Undirected edge in an exported subgraph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubgraphEdge {
    pub source: String,
    pub target: String,
}
