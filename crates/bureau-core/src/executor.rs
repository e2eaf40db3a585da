//! Office executor seam — the single contract an office exposes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BureauError;
use crate::models::message::MessagePriority;
use crate::router::MessageRouter;

/// One office, one contract: perform `action` against `context`.
///
/// Failures are caught by the caller and recorded as task or message
/// failures; they never propagate uncaught.
#[async_trait]
pub trait OfficeExecutor: Send + Sync {
    async fn execute(&self, action: &str, context: &Value) -> Result<Value, BureauError>;
}

/// Stand-in output produced when no executor is registered for an office.
/// The `stub` marker keeps it distinguishable from any real result.
pub fn stub_result(office: &str, action: &str, context: &Value) -> Value {
    let received: Vec<String> = context
        .as_object()
        .map(|obj| obj.keys().cloned().collect())
        .unwrap_or_default();
    serde_json::json!({
        "stub": true,
        "message": format!("stub executor: {} has no handler for {}", office, action),
        "input_received": received,
        "timestamp": chrono::Utc::now(),
    })
}

/// Drives a remote office over the router's request/response channel.
///
/// Lets the workflow engine treat an office on the other side of the broker
/// exactly like a local [`OfficeExecutor`].
pub struct RemoteOfficeExecutor {
    router: Arc<MessageRouter>,
    office_id: String,
    origin: String,
    timeout: Duration,
}

impl RemoteOfficeExecutor {
    pub fn new(
        router: Arc<MessageRouter>,
        office_id: impl Into<String>,
        origin: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            router,
            office_id: office_id.into(),
            origin: origin.into(),
            timeout,
        }
    }
}

#[async_trait]
impl OfficeExecutor for RemoteOfficeExecutor {
    async fn execute(&self, action: &str, context: &Value) -> Result<Value, BureauError> {
        let response = self
            .router
            .send_request(
                &self.origin,
                &self.office_id,
                action,
                context.clone(),
                MessagePriority::Normal,
                Some(self.timeout),
            )
            .await?;

        if let Some(error) = response.payload.get("error") {
            return Err(BureauError::Handler(format!(
                "{} rejected {}: {}",
                self.office_id, action, error
            )));
        }
        Ok(response
            .payload
            .get("result")
            .cloned()
            .unwrap_or_else(|| response.payload.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_result_is_marked() {
        let out = stub_result("banker", "forecast", &serde_json::json!({"horizon": "1m"}));
        assert_eq!(out["stub"], true);
        assert_eq!(out["input_received"][0], "horizon");
    }
}
