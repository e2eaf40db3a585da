//! Core error type for the Bureau coordination domain.
//!
//! `BureauError` covers infrastructure failures (broker, storage,
//! serialization) and orchestration dead-ends. Consent denials and lookup
//! misses on read paths are negative results (`Ok(None)` / `Ok(false)`),
//! not errors, so call sites stay simple.

#[derive(Debug, thiserror::Error)]
pub enum BureauError {
    /// Broker unreachable, or a publish failed after bounded retries.
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// No response arrived in time, after exhausting the retry cap.
    #[error("No response for message {message_id} after {attempts} attempts")]
    Timeout { message_id: String, attempts: u32 },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// A graph workflow has no ready task but not every task is terminal.
    #[error("Workflow cannot progress; stuck tasks: {stuck:?}")]
    StuckDependencies { stuck: Vec<String> },

    /// An office handler or executor failed. Caught at the dispatch point
    /// and recorded as a message or task failure.
    #[error("Handler error: {0}")]
    Handler(String),

    /// A workflow definition references an unknown sibling task id, or is
    /// otherwise malformed.
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),
}

impl From<serde_json::Error> for BureauError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
