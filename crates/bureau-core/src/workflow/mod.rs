//! Workflow Engine — multi-office plan orchestration.

pub mod engine;

pub use engine::{
    EngineStats, TaskStatusLine, WorkflowEngine, WorkflowEngineConfig, WorkflowStatus,
};
