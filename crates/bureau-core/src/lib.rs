//! Bureau Core — transport-agnostic coordination domain for office agents.
//!
//! This crate couples the three subsystems that let independent
//! domain-specific "offices" collaborate:
//!
//! - **Message Router** (`router`) — pub/sub routing, request/response
//!   correlation, per-office bounded queues, background listener and
//!   heartbeat loops, and a lightweight cross-office step relay.
//! - **Shared Memory Graph** (`memory`) — TTL- and consent-gated knowledge
//!   nodes with similarity search, symmetric connections, subgraph export,
//!   and cross-office federation.
//! - **Workflow Engine** (`workflow`) — sequential, parallel, and
//!   DAG-shaped multi-office plans with synthesis and a durable execution
//!   log.
//!
//! External collaborators sit behind traits (`broker`, `vector`,
//! `embedding`, `executor`), each shipping with an in-process
//! implementation, so the crate has **no transport dependency** and is
//! suitable for embedding in servers, desktop apps, and CLIs alike.

pub mod broker;
pub mod db;
pub mod embedding;
pub mod error;
pub mod executor;
pub mod memory;
pub mod models;
pub mod router;
pub mod store;
pub mod vector;
pub mod workflow;

// Convenience re-exports
pub use broker::{InProcessBroker, MessageBroker};
pub use db::Database;
pub use embedding::{EmbeddingProvider, HashEmbedding};
pub use error::BureauError;
pub use executor::{OfficeExecutor, RemoteOfficeExecutor};
pub use memory::{CreateMemory, MemoryFederation, MemoryGraphConfig, SharedMemoryGraph};
pub use models::{ConsentLevel, MemoryNode, MemoryType, Message, MessagePriority, MessageType};
pub use router::{MessageRouter, OfficeHandler, RouterConfig};
pub use store::ExecutionStore;
pub use vector::{InMemoryVectorStore, VectorStore};
pub use workflow::{WorkflowEngine, WorkflowEngineConfig};
