//! Workflow model — tasks, definitions, execution records.
//!
//! A workflow YAML defines a multi-office plan:
//!
//! ```yaml
//! name: "Cosmic Market Timing"
//! description: "Blend astrological, economic, and market views"
//! mode: parallel
//! synthesis_office: "philosopher"
//!
//! tasks:
//!   - office: "astrologist"
//!     action: "analyze_transits"
//!     input_context:
//!       date_range: "next_30_days"
//!   - office: "economist"
//!     action: "analyze_trends"
//! ```
//!
//! In `graph` mode a task may list `dependencies` by the ids of sibling
//! tasks; the engine runs whatever is ready, in waves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BureauError;

/// Workflow execution modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowMode {
    /// Tasks run in listed order; each output feeds the next task's context.
    #[default]
    Sequential,
    /// All tasks launch at once; no cross-task context.
    Parallel,
    /// DAG scheduling driven by `dependencies`.
    Graph,
}

impl WorkflowMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Graph => "graph",
        }
    }
}

/// Task execution status.
///
/// `Pending → Running → {Completed, Failed}`; `Skipped` is reachable only
/// from `Pending` when an earlier failure aborts the rest of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Caller-side task description used when creating a workflow.
///
/// `id` may be supplied so sibling `dependencies` can reference it; when
/// omitted the engine assigns one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub office: String,
    pub action: String,
    #[serde(default)]
    pub input_context: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Full workflow plan loaded from YAML or built in code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub mode: WorkflowMode,
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub synthesis_office: Option<String>,
}

impl WorkflowSpec {
    /// Parse a workflow spec from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, BureauError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| BureauError::Serialization(format!("workflow yaml: {}", e)))
    }

    /// Load a workflow spec from a file path.
    pub fn from_file(path: &str) -> Result<Self, BureauError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BureauError::Serialization(format!("read workflow file '{}': {}", path, e))
        })?;
        Self::from_yaml(&content)
    }
}

/// Single task in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    pub id: String,
    /// Office that executes this task.
    pub office: String,
    pub action: String,
    #[serde(default)]
    pub input_context: Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowTask {
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// Complete workflow definition held by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub mode: WorkflowMode,
    pub tasks: Vec<WorkflowTask>,
    pub synthesis_office: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one task execution, as reported to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub office: String,
    pub action: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: i64,
}

/// Synthesized final result across all task outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisResult {
    pub synthesis_office: String,
    pub synthesis: Value,
    pub task_count: usize,
    pub successful_count: usize,
}

/// Overall outcome of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowOutcome {
    Completed,
    Partial,
}

/// Full report for one workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub workflow_id: String,
    pub duration_ms: i64,
    pub task_results: Vec<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result: Option<SynthesisResult>,
    pub outcome: WorkflowOutcome,
}

/// Durable execution-log row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub duration_ms: i64,
    pub task_count: usize,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_result: Option<Value>,
    pub created_at: DateTime<Utc>,
}
