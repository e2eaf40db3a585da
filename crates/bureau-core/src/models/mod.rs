pub mod memory;
pub mod message;
pub mod workflow;

pub use memory::{ConsentLevel, MemoryNode, MemoryType, SubgraphEdge, SubgraphNode};
pub use message::{Message, MessagePriority, MessageType};
pub use workflow::{
    ExecutionRecord, SynthesisResult, TaskResult, TaskSpec, TaskStatus, WorkflowDefinition,
    WorkflowMode, WorkflowOutcome, WorkflowReport, WorkflowSpec, WorkflowTask,
};
