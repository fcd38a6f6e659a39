//! The `email` job handler

use async_trait::async_trait;
use messaging::{Job, JobHandler, ProcessingError};
use opentelemetry::trace::TraceContextExt;
use opentelemetry::{Context, KeyValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::info;

pub const EMAIL_JOB_TYPE: &str = "email";

/// Payload of an `email` job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to: String,
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

impl Default for EmailPayload {
    fn default() -> Self {
        Self {
            to: "admin@example.com".to_string(),
            subject: "test subject".to_string(),
            body: "test body".to_string(),
        }
    }
}

/// Pretends to send the email: waits `send_delay`, then logs it.
///
/// Anything other than a JSON object is rejected as a permanent error.
/// Missing fields are logged as empty.
#[derive(Debug, Clone)]
pub struct EmailHandler {
    send_delay: Duration,
}

impl EmailHandler {
    pub fn new(send_delay: Duration) -> Self {
        Self { send_delay }
    }
}

#[async_trait]
impl JobHandler for EmailHandler {
    async fn handle(&self, cx: &Context, job: &Job) -> Result<(), ProcessingError> {
        let payload = job
            .payload
            .as_object()
            .ok_or_else(|| ProcessingError::permanent("invalid payload type"))?;

        let field = |name: &str| payload.get(name).and_then(Value::as_str).unwrap_or_default();
        let to = field("to").to_string();
        let subject = field("subject").to_string();

        cx.span().set_attribute(KeyValue::new("email.to", to.clone()));

        tokio::time::sleep(self.send_delay).await;

        info!(job_id = %job.id, to = %to, subject = %subject, "Sending email");
        Ok(())
    }
}
