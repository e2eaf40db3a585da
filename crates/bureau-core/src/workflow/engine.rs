//! Workflow engine — runs multi-office plans.
//!
//! The engine:
//!   1. Validates and stores workflow definitions
//!   2. Executes tasks sequentially, all at once, or in DAG waves
//!   3. Delegates each task to its office's registered executor
//!      (a clearly marked stub result stands in when none is registered)
//!   4. Optionally synthesizes a final result through a synthesis office
//!   5. Appends every run to the durable execution log and, when a memory
//!      graph is wired in, records a tagged TTL-bounded summary node

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::BureauError;
use crate::executor::{stub_result, OfficeExecutor};
use crate::memory::{CreateMemory, SharedMemoryGraph};
use crate::models::memory::{ConsentLevel, MemoryType};
use crate::models::workflow::{
    ExecutionRecord, SynthesisResult, TaskResult, TaskSpec, TaskStatus, WorkflowDefinition,
    WorkflowMode, WorkflowOutcome, WorkflowReport, WorkflowSpec, WorkflowTask,
};
use crate::store::ExecutionStore;

/// Workflow engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEngineConfig {
    /// Simulated work for stub executors, in milliseconds.
    #[serde(default)]
    pub stub_delay_ms: u64,
    /// TTL for the summary node recorded after a synthesized run.
    #[serde(default = "default_summary_ttl_secs")]
    pub summary_ttl_secs: i64,
    #[serde(default = "default_summary_consent")]
    pub summary_consent: ConsentLevel,
}

fn default_summary_ttl_secs() -> i64 {
    172_800
}
fn default_summary_consent() -> ConsentLevel {
    ConsentLevel::Shared
}

impl Default for WorkflowEngineConfig {
    fn default() -> Self {
        Self {
            stub_delay_ms: 0,
            summary_ttl_secs: default_summary_ttl_secs(),
            summary_consent: default_summary_consent(),
        }
    }
}

/// Per-task line in a status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusLine {
    pub id: String,
    pub office: String,
    pub action: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// Status report for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub workflow_id: String,
    pub name: String,
    pub mode: WorkflowMode,
    pub tasks: Vec<TaskStatusLine>,
}

/// Engine-level statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStats {
    pub total_workflows: usize,
    pub total_executions: i64,
    pub registered_executors: Vec<String>,
    pub recent_executions: Vec<ExecutionRecord>,
}

struct EngineInner {
    workflows: HashMap<String, WorkflowDefinition>,
    executors: HashMap<String, Arc<dyn OfficeExecutor>>,
}

/// Orchestrates multi-office collaboration workflows.
pub struct WorkflowEngine {
    config: WorkflowEngineConfig,
    inner: Arc<RwLock<EngineInner>>,
    store: ExecutionStore,
    memory: Option<Arc<SharedMemoryGraph>>,
}

impl WorkflowEngine {
    pub fn new(
        config: WorkflowEngineConfig,
        store: ExecutionStore,
        memory: Option<Arc<SharedMemoryGraph>>,
    ) -> Self {
        Self {
            config,
            inner: Arc::new(RwLock::new(EngineInner {
                workflows: HashMap::new(),
                executors: HashMap::new(),
            })),
            store,
            memory,
        }
    }

    /// Register the executor for an office. Replaces any previous one.
    pub async fn register_executor(&self, office: &str, executor: Arc<dyn OfficeExecutor>) {
        self.inner
            .write()
            .await
            .executors
            .insert(office.to_string(), executor);
    }

    /// Create a workflow definition. Dependencies must reference sibling
    /// task ids.
    pub async fn create_workflow(
        &self,
        name: &str,
        description: &str,
        specs: Vec<TaskSpec>,
        mode: WorkflowMode,
        synthesis_office: Option<String>,
    ) -> Result<String, BureauError> {
        let tasks: Vec<WorkflowTask> = specs
            .into_iter()
            .map(|spec| WorkflowTask {
                id: spec.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                office: spec.office,
                action: spec.action,
                input_context: if spec.input_context.is_null() {
                    Value::Object(Map::new())
                } else {
                    spec.input_context
                },
                dependencies: spec.dependencies,
                status: TaskStatus::Pending,
                result: None,
                error: None,
                started_at: None,
                finished_at: None,
            })
            .collect();

        let mut ids = HashSet::new();
        for task in &tasks {
            if !ids.insert(task.id.clone()) {
                return Err(BureauError::InvalidWorkflow(format!(
                    "duplicate task id {}",
                    task.id
                )));
            }
        }
        for task in &tasks {
            for dep in &task.dependencies {
                if dep == &task.id {
                    return Err(BureauError::InvalidWorkflow(format!(
                        "task {} depends on itself",
                        task.id
                    )));
                }
                if !ids.contains(dep) {
                    return Err(BureauError::InvalidWorkflow(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
            }
        }

        let workflow = WorkflowDefinition {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            mode,
            tasks,
            synthesis_office,
            created_at: Utc::now(),
        };
        let workflow_id = workflow.id.clone();
        self.inner
            .write()
            .await
            .workflows
            .insert(workflow_id.clone(), workflow);
        Ok(workflow_id)
    }

    /// Create a workflow from a parsed spec (YAML path).
    pub async fn create_workflow_from_spec(&self, spec: WorkflowSpec) -> Result<String, BureauError> {
        self.create_workflow(
            &spec.name,
            &spec.description,
            spec.tasks,
            spec.mode,
            spec.synthesis_office,
        )
        .await
    }

    /// Execute a workflow according to its mode and return the full report.
    pub async fn execute_workflow(&self, workflow_id: &str) -> Result<WorkflowReport, BureauError> {
        let (mut tasks, name, mode, synthesis_office) = {
            let inner = self.inner.read().await;
            let workflow = inner
                .workflows
                .get(workflow_id)
                .ok_or_else(|| BureauError::NotFound(format!("workflow {}", workflow_id)))?;
            (
                workflow.tasks.clone(),
                workflow.name.clone(),
                workflow.mode,
                workflow.synthesis_office.clone(),
            )
        };
        let executors = self.inner.read().await.executors.clone();

        info!(
            "[WorkflowEngine] executing '{}': {} tasks, {} mode",
            name,
            tasks.len(),
            mode.as_str()
        );
        let started = Instant::now();

        match mode {
            WorkflowMode::Sequential => self.run_sequential(&mut tasks, &executors).await,
            WorkflowMode::Parallel => self.run_parallel(&mut tasks, &executors).await,
            WorkflowMode::Graph => self.run_graph(&mut tasks, &executors).await?,
        }

        let final_result = match &synthesis_office {
            Some(office) => Some(self.synthesize(office, &name, &tasks, &executors).await),
            None => None,
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        let succeeded = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let failed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();

        let record = ExecutionRecord {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            workflow_name: name.clone(),
            duration_ms,
            task_count: tasks.len(),
            succeeded,
            failed,
            final_result: final_result
                .as_ref()
                .map(|s| serde_json::to_value(s).unwrap_or(Value::Null)),
            created_at: Utc::now(),
        };
        self.store.append(&record).await?;

        self.record_summary(&name, &tasks, final_result.as_ref()).await;

        {
            let mut inner = self.inner.write().await;
            if let Some(workflow) = inner.workflows.get_mut(workflow_id) {
                workflow.tasks = tasks.clone();
            }
        }

        let task_results: Vec<TaskResult> = tasks
            .iter()
            .map(|t| TaskResult {
                task_id: t.id.clone(),
                office: t.office.clone(),
                action: t.action.clone(),
                status: t.status,
                output: t.result.clone(),
                error: t.error.clone(),
                duration_ms: t.duration_ms().unwrap_or(0),
            })
            .collect();

        info!(
            "[WorkflowEngine] '{}' finished: {}/{} succeeded in {}ms",
            name,
            succeeded,
            tasks.len(),
            duration_ms
        );

        Ok(WorkflowReport {
            workflow_id: workflow_id.to_string(),
            duration_ms,
            task_results,
            final_result,
            outcome: if failed == 0 {
                WorkflowOutcome::Completed
            } else {
                WorkflowOutcome::Partial
            },
        })
    }

    /// Strict order; each completed task's output feeds later tasks as
    /// `{office}_result`. The first failure halts the plan and the
    /// remaining tasks are marked skipped.
    async fn run_sequential(
        &self,
        tasks: &mut [WorkflowTask],
        executors: &HashMap<String, Arc<dyn OfficeExecutor>>,
    ) {
        let mut context: Map<String, Value> = Map::new();
        let mut halted = false;

        for task in tasks.iter_mut() {
            if halted {
                task.status = TaskStatus::Skipped;
                continue;
            }

            for (key, value) in &context {
                merge_context(&mut task.input_context, key, value.clone());
            }

            run_task(executors, task, self.config.stub_delay_ms).await;

            if task.status == TaskStatus::Completed {
                context.insert(
                    format!("{}_result", task.office),
                    task.result.clone().unwrap_or(Value::Null),
                );
            } else {
                warn!(
                    "[WorkflowEngine] task {} ({}) failed, halting sequence",
                    task.id, task.office
                );
                halted = true;
            }
        }
    }

    /// All tasks at once; failures come back as values at the join point.
    async fn run_parallel(
        &self,
        tasks: &mut [WorkflowTask],
        executors: &HashMap<String, Arc<dyn OfficeExecutor>>,
    ) {
        let mut wave = JoinSet::new();
        for (index, task) in tasks.iter().enumerate() {
            let mut task = task.clone();
            let executors = executors.clone();
            let stub_delay_ms = self.config.stub_delay_ms;
            wave.spawn(async move {
                run_task(&executors, &mut task, stub_delay_ms).await;
                (index, task)
            });
        }

        while let Some(joined) = wave.join_next().await {
            match joined {
                Ok((index, task)) => tasks[index] = task,
                Err(e) => warn!("[WorkflowEngine] task aborted: {}", e),
            }
        }
        for task in tasks.iter_mut() {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Failed;
                task.error = Some("task aborted".to_string());
                task.finished_at = Some(Utc::now());
            }
        }
    }

    /// DAG execution: repeatedly run the ready set (dependencies all
    /// completed) as a concurrent wave. When nothing is ready but tasks
    /// remain, either an upstream failure made them unreachable (marked
    /// skipped) or the dependencies are cyclic (surfaced as an error).
    async fn run_graph(
        &self,
        tasks: &mut [WorkflowTask],
        executors: &HashMap<String, Arc<dyn OfficeExecutor>>,
    ) -> Result<(), BureauError> {
        let office_of: HashMap<String, String> = tasks
            .iter()
            .map(|t| (t.id.clone(), t.office.clone()))
            .collect();
        let mut completed: HashSet<String> = HashSet::new();
        let mut outputs: HashMap<String, Value> = HashMap::new();

        loop {
            let ready: Vec<usize> = tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| {
                    t.status == TaskStatus::Pending
                        && t.dependencies.iter().all(|d| completed.contains(d))
                })
                .map(|(i, _)| i)
                .collect();

            if ready.is_empty() {
                let remaining: Vec<String> = tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::Pending)
                    .map(|t| t.id.clone())
                    .collect();
                if remaining.is_empty() {
                    break;
                }
                if tasks.iter().any(|t| t.status == TaskStatus::Failed) {
                    warn!(
                        "[WorkflowEngine] {} tasks unreachable after upstream failure",
                        remaining.len()
                    );
                    for task in tasks.iter_mut() {
                        if task.status == TaskStatus::Pending {
                            task.status = TaskStatus::Skipped;
                        }
                    }
                    break;
                }
                return Err(BureauError::StuckDependencies { stuck: remaining });
            }

            for &index in &ready {
                let dependencies = tasks[index].dependencies.clone();
                for dep in dependencies {
                    if let Some(output) = outputs.get(&dep) {
                        let key = format!("{}_result", office_of[&dep]);
                        merge_context(&mut tasks[index].input_context, &key, output.clone());
                    }
                }
            }

            let mut wave = JoinSet::new();
            for &index in &ready {
                let mut task = tasks[index].clone();
                let executors = executors.clone();
                let stub_delay_ms = self.config.stub_delay_ms;
                wave.spawn(async move {
                    run_task(&executors, &mut task, stub_delay_ms).await;
                    (index, task)
                });
            }
            while let Some(joined) = wave.join_next().await {
                match joined {
                    Ok((index, task)) => tasks[index] = task,
                    Err(e) => warn!("[WorkflowEngine] task aborted: {}", e),
                }
            }

            for &index in &ready {
                let task = &mut tasks[index];
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Failed;
                    task.error = Some("task aborted".to_string());
                    task.finished_at = Some(Utc::now());
                }
                if task.status == TaskStatus::Completed {
                    completed.insert(task.id.clone());
                    outputs.insert(task.id.clone(), task.result.clone().unwrap_or(Value::Null));
                }
            }
        }
        Ok(())
    }

    /// Aggregate successful outputs and failed offices, then ask the
    /// synthesis office for a final result.
    async fn synthesize(
        &self,
        synthesis_office: &str,
        workflow_name: &str,
        tasks: &[WorkflowTask],
        executors: &HashMap<String, Arc<dyn OfficeExecutor>>,
    ) -> SynthesisResult {
        let mut task_outputs = Map::new();
        let mut successful: Vec<String> = Vec::new();
        let mut failed: Vec<String> = Vec::new();
        for task in tasks {
            match task.status {
                TaskStatus::Completed => {
                    task_outputs.insert(
                        task.office.clone(),
                        task.result.clone().unwrap_or(Value::Null),
                    );
                    successful.push(task.office.clone());
                }
                TaskStatus::Failed => failed.push(task.office.clone()),
                _ => {}
            }
        }

        let aggregated = serde_json::json!({
            "workflow_name": workflow_name,
            "task_outputs": task_outputs,
            "successful_tasks": successful,
            "failed_tasks": failed,
        });

        let synthesis = match executors.get(synthesis_office) {
            Some(executor) => match executor.execute("synthesize", &aggregated).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        "[WorkflowEngine] synthesis by {} failed: {}",
                        synthesis_office, e
                    );
                    serde_json::json!({ "error": e.to_string() })
                }
            },
            None => stub_result(synthesis_office, "synthesize", &aggregated),
        };

        SynthesisResult {
            synthesis_office: synthesis_office.to_string(),
            synthesis,
            task_count: tasks.len(),
            successful_count: successful.len(),
        }
    }

    /// Park a tagged, TTL-bounded summary node in the memory graph.
    async fn record_summary(
        &self,
        name: &str,
        tasks: &[WorkflowTask],
        final_result: Option<&SynthesisResult>,
    ) {
        let (Some(memory), Some(final_result)) = (&self.memory, final_result) else {
            return;
        };

        let mut tags = vec!["workflow".to_string(), name.to_string()];
        tags.extend(tasks.iter().map(|t| t.office.clone()));

        let params = CreateMemory::new(
            "system",
            format!("Workflow: {}", name),
            format!("Workflow '{}' result: {}", name, final_result.synthesis),
        )
        .memory_type(MemoryType::Context)
        .consent(self.config.summary_consent)
        .ttl_seconds(self.config.summary_ttl_secs)
        .tags(tags);

        if let Err(e) = memory.create_memory(params).await {
            warn!("[WorkflowEngine] summary node failed: {}", e);
        }
    }

    /// Per-task status for a workflow; `None` if unknown.
    pub async fn workflow_status(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        let inner = self.inner.read().await;
        inner.workflows.get(workflow_id).map(|workflow| WorkflowStatus {
            workflow_id: workflow.id.clone(),
            name: workflow.name.clone(),
            mode: workflow.mode,
            tasks: workflow
                .tasks
                .iter()
                .map(|t| TaskStatusLine {
                    id: t.id.clone(),
                    office: t.office.clone(),
                    action: t.action.clone(),
                    status: t.status,
                    duration_ms: t.duration_ms(),
                })
                .collect(),
        })
    }

    /// Engine statistics: definition count, execution count, executors,
    /// recent runs.
    pub async fn stats(&self) -> Result<EngineStats, BureauError> {
        let (total_workflows, registered_executors) = {
            let inner = self.inner.read().await;
            (
                inner.workflows.len(),
                inner.executors.keys().cloned().collect(),
            )
        };
        Ok(EngineStats {
            total_workflows,
            total_executions: self.store.count().await?,
            registered_executors,
            recent_executions: self.store.recent(5).await?,
        })
    }
}

/// Run one task against its office's executor, recording status, result,
/// and timing on the task itself. Executor failures become task failures.
async fn run_task(
    executors: &HashMap<String, Arc<dyn OfficeExecutor>>,
    task: &mut WorkflowTask,
    stub_delay_ms: u64,
) {
    task.status = TaskStatus::Running;
    task.started_at = Some(Utc::now());

    let outcome = match executors.get(&task.office) {
        Some(executor) => executor.execute(&task.action, &task.input_context).await,
        None => {
            if stub_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(stub_delay_ms)).await;
            }
            Ok(stub_result(&task.office, &task.action, &task.input_context))
        }
    };

    match outcome {
        Ok(output) => {
            task.status = TaskStatus::Completed;
            task.result = Some(output);
        }
        Err(e) => {
            task.status = TaskStatus::Failed;
            task.error = Some(e.to_string());
        }
    }
    task.finished_at = Some(Utc::now());
}

fn merge_context(input: &mut Value, key: &str, value: Value) {
    if !input.is_object() {
        *input = Value::Object(Map::new());
    }
    input
        .as_object_mut()
        .expect("coerced to object")
        .insert(key.to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::embedding::HashEmbedding;
    use crate::memory::MemoryGraphConfig;
    use crate::vector::InMemoryVectorStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    struct RecordingExecutor {
        office: String,
        log: Arc<StdMutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl OfficeExecutor for RecordingExecutor {
        async fn execute(&self, action: &str, context: &Value) -> Result<Value, BureauError> {
            self.log.lock().unwrap().push(self.office.clone());
            if self.fail {
                return Err(BureauError::Handler(format!("{} refused", self.office)));
            }
            let context_keys: Vec<String> = context
                .as_object()
                .map(|o| o.keys().cloned().collect())
                .unwrap_or_default();
            Ok(json!({
                "office": self.office,
                "action": action,
                "context_keys": context_keys,
            }))
        }
    }

    fn engine() -> WorkflowEngine {
        WorkflowEngine::new(
            WorkflowEngineConfig::default(),
            ExecutionStore::new(Database::open_in_memory().unwrap()),
            None,
        )
    }

    async fn register(
        engine: &WorkflowEngine,
        log: &Arc<StdMutex<Vec<String>>>,
        office: &str,
        fail: bool,
    ) {
        engine
            .register_executor(
                office,
                Arc::new(RecordingExecutor {
                    office: office.to_string(),
                    log: log.clone(),
                    fail,
                }),
            )
            .await;
    }

    fn spec(office: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec {
            id: Some(office.to_string()),
            office: office.to_string(),
            action: format!("act_{}", office),
            input_context: Value::Null,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_sequential_halts_on_failure() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        register(&engine, &log, "a", false).await;
        register(&engine, &log, "b", true).await;
        register(&engine, &log, "c", false).await;

        let id = engine
            .create_workflow(
                "halting",
                "",
                vec![spec("a", &[]), spec("b", &[]), spec("c", &[])],
                WorkflowMode::Sequential,
                None,
            )
            .await
            .unwrap();
        let report = engine.execute_workflow(&id).await.unwrap();

        assert_eq!(report.outcome, WorkflowOutcome::Partial);
        assert_eq!(report.task_results[0].status, TaskStatus::Completed);
        assert_eq!(report.task_results[1].status, TaskStatus::Failed);
        assert_eq!(report.task_results[2].status, TaskStatus::Skipped);
        // c's executor never ran.
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_sequential_context_flows_forward() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        register(&engine, &log, "a", false).await;
        register(&engine, &log, "b", false).await;

        let id = engine
            .create_workflow(
                "context",
                "",
                vec![spec("a", &[]), spec("b", &[])],
                WorkflowMode::Sequential,
                None,
            )
            .await
            .unwrap();
        let report = engine.execute_workflow(&id).await.unwrap();

        let b_keys = &report.task_results[1].output.as_ref().unwrap()["context_keys"];
        assert!(b_keys
            .as_array()
            .unwrap()
            .iter()
            .any(|k| k.as_str() == Some("a_result")));
    }

    #[tokio::test]
    async fn test_parallel_runs_everything() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        register(&engine, &log, "a", false).await;
        register(&engine, &log, "b", true).await;
        register(&engine, &log, "c", false).await;

        let id = engine
            .create_workflow(
                "parallel",
                "",
                vec![spec("a", &[]), spec("b", &[]), spec("c", &[])],
                WorkflowMode::Parallel,
                None,
            )
            .await
            .unwrap();
        let report = engine.execute_workflow(&id).await.unwrap();

        // A failure does not keep the siblings from running.
        assert_eq!(log.lock().unwrap().len(), 3);
        assert_eq!(report.outcome, WorkflowOutcome::Partial);
        let by_office = |office: &str| {
            report
                .task_results
                .iter()
                .find(|r| r.office == office)
                .unwrap()
                .status
        };
        assert_eq!(by_office("a"), TaskStatus::Completed);
        assert_eq!(by_office("b"), TaskStatus::Failed);
        assert_eq!(by_office("c"), TaskStatus::Completed);

        // No cross-task context in parallel mode.
        let a_keys = report
            .task_results
            .iter()
            .find(|r| r.office == "a")
            .unwrap()
            .output
            .as_ref()
            .unwrap()["context_keys"]
            .as_array()
            .unwrap()
            .len();
        assert_eq!(a_keys, 0);
    }

    #[tokio::test]
    async fn test_graph_diamond_ordering() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        for office in ["a", "b", "c", "d"] {
            register(&engine, &log, office, false).await;
        }

        let id = engine
            .create_workflow(
                "diamond",
                "",
                vec![
                    spec("a", &[]),
                    spec("b", &["a"]),
                    spec("c", &["a"]),
                    spec("d", &["b", "c"]),
                ],
                WorkflowMode::Graph,
                None,
            )
            .await
            .unwrap();
        let report = engine.execute_workflow(&id).await.unwrap();

        assert_eq!(report.outcome, WorkflowOutcome::Completed);
        let order = log.lock().unwrap().clone();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], "a");
        assert_eq!(order[3], "d");

        // d saw both dependency outputs.
        let d_keys = report
            .task_results
            .iter()
            .find(|r| r.office == "d")
            .unwrap()
            .output
            .as_ref()
            .unwrap()["context_keys"]
            .clone();
        let d_keys: Vec<String> = serde_json::from_value(d_keys).unwrap();
        assert!(d_keys.contains(&"b_result".to_string()));
        assert!(d_keys.contains(&"c_result".to_string()));
    }

    #[tokio::test]
    async fn test_graph_failure_reports_unreachable() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        register(&engine, &log, "a", true).await;
        for office in ["b", "c", "d"] {
            register(&engine, &log, office, false).await;
        }

        let id = engine
            .create_workflow(
                "doomed",
                "",
                vec![
                    spec("a", &[]),
                    spec("b", &["a"]),
                    spec("c", &["a"]),
                    spec("d", &["b", "c"]),
                ],
                WorkflowMode::Graph,
                None,
            )
            .await
            .unwrap();
        let report = engine.execute_workflow(&id).await.unwrap();

        assert_eq!(report.outcome, WorkflowOutcome::Partial);
        let by_office = |office: &str| {
            report
                .task_results
                .iter()
                .find(|r| r.office == office)
                .unwrap()
                .status
        };
        assert_eq!(by_office("a"), TaskStatus::Failed);
        assert_eq!(by_office("b"), TaskStatus::Skipped);
        assert_eq!(by_office("c"), TaskStatus::Skipped);
        assert_eq!(by_office("d"), TaskStatus::Skipped);
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_graph_cycle_is_surfaced() {
        let engine = engine();
        let id = engine
            .create_workflow(
                "cyclic",
                "",
                vec![spec("x", &["y"]), spec("y", &["x"])],
                WorkflowMode::Graph,
                None,
            )
            .await
            .unwrap();

        match engine.execute_workflow(&id).await {
            Err(BureauError::StuckDependencies { stuck }) => {
                assert_eq!(stuck.len(), 2);
                assert!(stuck.contains(&"x".to_string()));
                assert!(stuck.contains(&"y".to_string()));
            }
            other => panic!("expected stuck dependencies, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_unregistered_office_gets_stub() {
        let engine = engine();
        let id = engine
            .create_workflow(
                "stubbed",
                "",
                vec![spec("ghost", &[])],
                WorkflowMode::Sequential,
                None,
            )
            .await
            .unwrap();
        let report = engine.execute_workflow(&id).await.unwrap();

        let output = report.task_results[0].output.as_ref().unwrap();
        assert_eq!(output["stub"], true);
        assert_eq!(report.task_results[0].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_synthesis_aggregates_outputs_and_failures() {
        let engine = engine();
        let log = Arc::new(StdMutex::new(Vec::new()));
        register(&engine, &log, "a", false).await;
        register(&engine, &log, "b", true).await;

        struct InspectingSynthesizer;
        #[async_trait]
        impl OfficeExecutor for InspectingSynthesizer {
            async fn execute(&self, action: &str, context: &Value) -> Result<Value, BureauError> {
                assert_eq!(action, "synthesize");
                Ok(json!({
                    "echoed_outputs": context["task_outputs"].clone(),
                    "echoed_failed": context["failed_tasks"].clone(),
                }))
            }
        }
        engine
            .register_executor("philosopher", Arc::new(InspectingSynthesizer))
            .await;

        let id = engine
            .create_workflow(
                "synth",
                "",
                vec![spec("a", &[]), spec("b", &[])],
                WorkflowMode::Parallel,
                Some("philosopher".to_string()),
            )
            .await
            .unwrap();
        let report = engine.execute_workflow(&id).await.unwrap();

        let synthesis = report.final_result.unwrap();
        assert_eq!(synthesis.synthesis_office, "philosopher");
        assert_eq!(synthesis.successful_count, 1);
        assert!(synthesis.synthesis["echoed_outputs"]["a"].is_object());
        assert_eq!(synthesis.synthesis["echoed_failed"][0], "b");
    }

    #[tokio::test]
    async fn test_synthesis_stub_fallback() {
        let engine = engine();
        let id = engine
            .create_workflow(
                "synth-stub",
                "",
                vec![spec("a", &[])],
                WorkflowMode::Sequential,
                Some("poet".to_string()),
            )
            .await
            .unwrap();
        let report = engine.execute_workflow(&id).await.unwrap();

        let synthesis = report.final_result.unwrap();
        assert_eq!(synthesis.synthesis["stub"], true);
    }

    #[tokio::test]
    async fn test_execution_log_is_appended() {
        let engine = engine();
        let id = engine
            .create_workflow(
                "logged",
                "",
                vec![spec("a", &[])],
                WorkflowMode::Sequential,
                None,
            )
            .await
            .unwrap();
        engine.execute_workflow(&id).await.unwrap();
        engine.execute_workflow(&id).await.unwrap();

        let stats = engine.stats().await.unwrap();
        assert_eq!(stats.total_workflows, 1);
        assert_eq!(stats.total_executions, 2);
        assert_eq!(stats.recent_executions[0].workflow_name, "logged");
    }

    #[tokio::test]
    async fn test_summary_node_recorded_in_memory_graph() {
        let memory = SharedMemoryGraph::start(
            MemoryGraphConfig::default(),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(HashEmbedding::new(64)),
            None,
        );
        let engine = WorkflowEngine::new(
            WorkflowEngineConfig::default(),
            ExecutionStore::new(Database::open_in_memory().unwrap()),
            Some(memory.clone()),
        );

        let id = engine
            .create_workflow(
                "remembered",
                "",
                vec![spec("a", &[])],
                WorkflowMode::Sequential,
                Some("poet".to_string()),
            )
            .await
            .unwrap();
        engine.execute_workflow(&id).await.unwrap();

        let summaries = memory.get_office_memories("system", false).await;
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].tags.contains(&"workflow".to_string()));
        assert!(summaries[0].tags.contains(&"a".to_string()));
        assert_eq!(summaries[0].consent_level, ConsentLevel::Shared);
        memory.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_dependency_is_rejected() {
        let engine = engine();
        let result = engine
            .create_workflow(
                "broken",
                "",
                vec![spec("a", &["ghost"])],
                WorkflowMode::Graph,
                None,
            )
            .await;
        assert!(matches!(result, Err(BureauError::InvalidWorkflow(_))));
    }

    #[tokio::test]
    async fn test_status_reflects_run() {
        let engine = engine();
        let id = engine
            .create_workflow(
                "status",
                "",
                vec![spec("a", &[])],
                WorkflowMode::Sequential,
                None,
            )
            .await
            .unwrap();

        let before = engine.workflow_status(&id).await.unwrap();
        assert_eq!(before.tasks[0].status, TaskStatus::Pending);

        engine.execute_workflow(&id).await.unwrap();

        let after = engine.workflow_status(&id).await.unwrap();
        assert_eq!(after.tasks[0].status, TaskStatus::Completed);
        assert!(engine.workflow_status("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_create_from_yaml_spec() {
        let engine = engine();
        let spec = WorkflowSpec::from_yaml(
            r#"
name: "From Yaml"
mode: graph
tasks:
  - id: "one"
    office: "a"
    action: "go"
  - id: "two"
    office: "b"
    action: "go"
    dependencies: ["one"]
"#,
        )
        .unwrap();
        let id = engine.create_workflow_from_spec(spec).await.unwrap();
        let report = engine.execute_workflow(&id).await.unwrap();
        assert_eq!(report.outcome, WorkflowOutcome::Completed);
    }
}
