//! Error types for the broker, the job processor and job handlers.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error categories decide what happens to a job whose handler failed.
///
/// - **Transient**: may succeed later, eligible for requeue
/// - **Permanent**: will never succeed, always dropped
/// - **RateLimited**: upstream asked us to slow down, eligible for requeue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Permanent,
    RateLimited,
}

impl ErrorCategory {
    /// Whether a requeue policy is allowed to put the job back on the queue.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::RateLimited => "rate_limited",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a [`JobHandler`](crate::JobHandler).
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Temporary failure (network timeout, service unavailable)
    #[error("transient error: {message}")]
    Transient {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Unrecoverable failure (invalid payload, business rule violation)
    #[error("permanent error: {message}")]
    Permanent {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Rate limited by an upstream service
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The handler did not finish within the configured timeout
    #[error("handler timed out after {0:?}")]
    Timeout(Duration),
}

impl ProcessingError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    pub fn transient_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
            source: None,
        }
    }

    pub fn permanent_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Permanent {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Rate limited error carrying the upstream's retry-after hint.
    pub fn rate_limited_with_retry(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ProcessingError::Transient { .. } | ProcessingError::Timeout(_) => {
                ErrorCategory::Transient
            }
            ProcessingError::Permanent { .. } => ErrorCategory::Permanent,
            ProcessingError::RateLimited { .. } => ErrorCategory::RateLimited,
        }
    }

    /// Upstream retry-after hint, if the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProcessingError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Transport-level failure reported by a [`BrokerClient`](crate::BrokerClient).
///
/// The broker layers never retry; every variant is surfaced to the caller.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connection(String),

    #[error("failed to open channel: {0}")]
    Channel(String),

    #[error("failed to declare queue '{queue}': {reason}")]
    Declare { queue: String, reason: String },

    #[error("failed to publish to '{routing_key}': {reason}")]
    Publish { routing_key: String, reason: String },

    #[error("message to '{0}' is unroutable")]
    Unroutable(String),

    #[error("failed to consume from '{queue}': {reason}")]
    Consume { queue: String, reason: String },

    #[error("failed to settle delivery {delivery_tag}: {reason}")]
    Ack { delivery_tag: u64, reason: String },

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error("channel is closed")]
    ChannelClosed,
}

impl BrokerError {
    /// Short machine-friendly label used in span attributes and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BrokerError::Connection(_) => "connection",
            BrokerError::Channel(_) => "channel",
            BrokerError::Declare { .. } => "declare",
            BrokerError::Publish { .. } => "publish",
            BrokerError::Unroutable(_) => "unroutable",
            BrokerError::Consume { .. } => "consume",
            BrokerError::Ack { .. } => "ack",
            BrokerError::UnknownDeliveryTag(_) => "unknown_delivery_tag",
            BrokerError::ChannelClosed => "channel_closed",
        }
    }
}

/// Error returned by [`JobProcessor`](crate::JobProcessor) operations.
#[derive(Debug, Error)]
pub enum JobProcessorError {
    #[error("failed to marshal job: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("failed to publish job: {0}")]
    Publish(#[source] BrokerError),

    #[error("failed to start consumer: {0}")]
    Consume(#[source] BrokerError),

    #[error("failed to unmarshal job: {0}")]
    Deserialization(#[source] serde_json::Error),

    #[error("no handler for job type: {0}")]
    NoHandler(String),

    #[error("handler already registered for job type: {0}")]
    DuplicateHandler(String),

    #[error("consumer already running for queue: {0}")]
    ConsumerAlreadyRunning(String),

    #[error("no consumer running for queue: {0}")]
    ConsumerNotRunning(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_error_category() {
        assert_eq!(
            ProcessingError::transient("network timeout").category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            ProcessingError::permanent("invalid email").category(),
            ErrorCategory::Permanent
        );
        assert_eq!(
            ProcessingError::rate_limited("too many requests").category(),
            ErrorCategory::RateLimited
        );
        assert_eq!(
            ProcessingError::Timeout(Duration::from_secs(1)).category(),
            ErrorCategory::Transient
        );
    }

    #[test]
    fn test_only_permanent_is_not_retryable() {
        assert!(ErrorCategory::Transient.is_retryable());
        assert!(ErrorCategory::RateLimited.is_retryable());
        assert!(!ErrorCategory::Permanent.is_retryable());
    }

    #[test]
    fn test_retry_after_hint() {
        let err = ProcessingError::rate_limited_with_retry("slow down", Duration::from_secs(7));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(ProcessingError::transient("x").retry_after(), None);
    }

    #[test]
    fn test_processor_error_messages() {
        let err = JobProcessorError::DuplicateHandler("email".into());
        assert_eq!(err.to_string(), "handler already registered for job type: email");

        let err = JobProcessorError::NoHandler("sms".into());
        assert_eq!(err.to_string(), "no handler for job type: sms");

        let err = JobProcessorError::Publish(BrokerError::ChannelClosed);
        assert_eq!(err.to_string(), "failed to publish job: channel is closed");
    }

    #[test]
    fn test_broker_error_kind() {
        assert_eq!(BrokerError::UnknownDeliveryTag(3).kind(), "unknown_delivery_tag");
        assert_eq!(BrokerError::Unroutable("q".into()).kind(), "unroutable");
    }
}
