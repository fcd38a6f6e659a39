//! Job handlers.

use crate::error::ProcessingError;
use crate::job::Job;
use async_trait::async_trait;
use opentelemetry::Context;
use std::future::Future;
use std::marker::PhantomData;

/// Executes jobs of one type.
///
/// `cx` carries the `execute.handler` span; spans a handler opens for its own
/// work should use it as parent.
///
/// # Error Handling
///
/// The error category decides what happens next:
/// - `Permanent`: the job is dropped
/// - `Transient` / `RateLimited`: the handler's [`RequeuePolicy`](crate::RequeuePolicy) applies
///
/// # Example
///
/// ```rust,ignore
/// struct EmailHandler { mailer: Arc<Mailer> }
///
/// #[async_trait]
/// impl JobHandler for EmailHandler {
///     async fn handle(&self, _cx: &Context, job: &Job) -> Result<(), ProcessingError> {
///         let to = job.payload["to"].as_str()
///             .ok_or_else(|| ProcessingError::permanent("missing recipient"))?;
///         self.mailer.send(to).await
///             .map_err(|e| ProcessingError::transient_with_source("send failed", e))
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, cx: &Context, job: &Job) -> Result<(), ProcessingError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
///
/// The closure receives owned copies so the returned future can be `'static`.
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap `f` as a handler.
///
/// ```rust,ignore
/// processor.register_handler("email", handler_fn(|_cx, job| async move {
///     println!("sending {}", job.id);
///     Ok(())
/// }))?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Context, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(Context, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessingError>> + Send + 'static,
{
    async fn handle(&self, cx: &Context, job: &Job) -> Result<(), ProcessingError> {
        (self.f)(cx.clone(), job.clone()).await
    }
}

/// Accepts every job.
#[derive(Debug, Clone, Default)]
pub struct NoOpHandler;

#[async_trait]
impl JobHandler for NoOpHandler {
    async fn handle(&self, _cx: &Context, _job: &Job) -> Result<(), ProcessingError> {
        Ok(())
    }
}

/// Fails every job with the same error.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    message: String,
    transient: bool,
}

impl FailingHandler {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn handle(&self, _cx: &Context, _job: &Job) -> Result<(), ProcessingError> {
        if self.transient {
            Err(ProcessingError::transient(&self.message))
        } else {
            Err(ProcessingError::permanent(&self.message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_handler_fn_receives_job() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler = handler_fn(move |_cx, job: Job| {
            let counter = counter.clone();
            async move {
                assert_eq!(job.job_type, "email");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let job = Job::new("email", json!({}));
        handler.handle(&Context::new(), &job).await.unwrap();
        handler.handle(&Context::new(), &job).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_handler_categories() {
        let job = Job::new("email", json!({}));

        let err = FailingHandler::transient("smtp down")
            .handle(&Context::new(), &job)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transient);

        let err = FailingHandler::permanent("bad address")
            .handle(&Context::new(), &job)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Permanent);
    }

    #[tokio::test]
    async fn test_noop_handler() {
        let job = Job::new("anything", json!(null));
        assert!(NoOpHandler.handle(&Context::new(), &job).await.is_ok());
    }
}
