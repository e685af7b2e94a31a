//! Deletion handlers
//!
//! A handler deletes one resource of one logical type. Providers expose a
//! set of handlers keyed by method name; handler files add more.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::future::Future;
use std::sync::Arc;

use tidyrun_common::TrackedResource;

use crate::error::DeleteError;

/// Deletes a single tracked resource
#[async_trait]
pub trait DeleteHandler: Send + Sync {
    async fn delete(&self, resource: &TrackedResource) -> Result<(), DeleteError>;
}

/// Handler backed by a closure
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> DeleteHandler for FnHandler<F>
where
    F: Fn(TrackedResource) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DeleteError>> + Send,
{
    async fn delete(&self, resource: &TrackedResource) -> Result<(), DeleteError> {
        (self.f)(resource.clone()).await
    }
}

/// Wrap a closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn DeleteHandler>
where
    F: Fn(TrackedResource) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), DeleteError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Map an HTTP status to a deletion outcome.
///
/// 2xx and 404 count as deleted. 429 and 5xx are transient, every other
/// status is permanent.
pub fn classify_status(status: StatusCode, request: &str) -> Result<(), DeleteError> {
    if status.is_success() || status == StatusCode::NOT_FOUND {
        Ok(())
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(DeleteError::transient(format!("{} returned {}", request, status)))
    } else {
        Err(DeleteError::permanent(format!("{} returned {}", request, status)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(200, None ; "ok")]
    #[test_case(204, None ; "no content")]
    #[test_case(404, None ; "already gone")]
    #[test_case(429, Some(true) ; "rate limited")]
    #[test_case(503, Some(true) ; "unavailable")]
    #[test_case(401, Some(false) ; "unauthorized")]
    fn status_classification(code: u16, retryable: Option<bool>) {
        let status = StatusCode::from_u16(code).unwrap();
        let result = classify_status(status, "DELETE /x");
        assert_eq!(result.as_ref().err().map(|e| e.is_retryable()), retryable);
    }

    #[tokio::test]
    async fn closure_handler_receives_resource() {
        let handler = handler_fn(|r: TrackedResource| async move {
            if r.id == "ok" {
                Ok(())
            } else {
                Err(DeleteError::permanent(format!("refused {}", r.id)))
            }
        });

        assert!(handler.delete(&TrackedResource::new("row", "ok")).await.is_ok());
        let err = handler
            .delete(&TrackedResource::new("row", "nope"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "refused nope");
    }
}
