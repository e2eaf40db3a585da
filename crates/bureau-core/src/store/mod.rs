//! Durable stores over the SQLite database.

use chrono::Utc;
use rusqlite::Row;

use crate::db::Database;
use crate::error::BureauError;
use crate::models::workflow::ExecutionRecord;

/// Append-only log of workflow executions.
#[derive(Clone)]
pub struct ExecutionStore {
    db: Database,
}

impl ExecutionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn append(&self, record: &ExecutionRecord) -> Result<(), BureauError> {
        let r = record.clone();
        self.db
            .with_conn_async(move |conn| {
                conn.execute(
                    "INSERT INTO workflow_executions
                     (id, workflow_id, workflow_name, duration_ms, task_count, succeeded, failed, final_result, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        r.id,
                        r.workflow_id,
                        r.workflow_name,
                        r.duration_ms,
                        r.task_count,
                        r.succeeded,
                        r.failed,
                        r.final_result
                            .as_ref()
                            .map(|v| serde_json::to_string(v).unwrap_or_default()),
                        r.created_at.timestamp_millis(),
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<ExecutionRecord>, BureauError> {
        self.db
            .with_conn_async(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, workflow_id, workflow_name, duration_ms, task_count, succeeded, failed, final_result, created_at
                     FROM workflow_executions ORDER BY created_at DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![limit], |row| Ok(row_to_record(row)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    pub async fn count(&self) -> Result<i64, BureauError> {
        self.db
            .with_conn_async(|conn| {
                conn.query_row("SELECT COUNT(*) FROM workflow_executions", [], |row| {
                    row.get(0)
                })
            })
            .await
    }
}

fn row_to_record(row: &Row<'_>) -> ExecutionRecord {
    let final_result: Option<String> = row.get(7).unwrap_or(None);
    let created_ms: i64 = row.get(8).unwrap_or(0);

    ExecutionRecord {
        id: row.get(0).unwrap_or_default(),
        workflow_id: row.get(1).unwrap_or_default(),
        workflow_name: row.get(2).unwrap_or_default(),
        duration_ms: row.get(3).unwrap_or(0),
        task_count: row.get::<_, i64>(4).unwrap_or(0) as usize,
        succeeded: row.get::<_, i64>(5).unwrap_or(0) as usize,
        failed: row.get::<_, i64>(6).unwrap_or(0) as usize,
        final_result: final_result.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: chrono::DateTime::from_timestamp_millis(created_ms)
            .unwrap_or_else(Utc::now),
    }
}
