//! Async-query pipeline: the manager's worker pool expressed as a tower
//! service stack.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use apex_data_core::{DataSourceError, Params, QueryContext, Record};
use tokio::task::JoinHandle;
use tower::{Service, ServiceBuilder};
use tracing::Instrument;

use super::middleware::{LoadShedLayer, LoadShedService, TimeoutLayer, TimeoutService};
use crate::traits::ExternalDataSource;

/// One query dispatched through [`DataSourceManager::query_async`](super::DataSourceManager::query_async).
#[derive(Clone)]
pub struct AsyncQuery {
    pub source: Arc<dyn ExternalDataSource>,
    pub query: String,
    pub params: Params,
    pub timeout: Duration,
    pub context: QueryContext,
}

pub type QueryFuture =
    Pin<Box<dyn Future<Output = Result<Vec<Record>, DataSourceError>> + Send>>;

/// Innermost service: runs the query on its adapter inside the call's span.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryService;

impl Service<AsyncQuery> for QueryService {
    type Response = Vec<Record>;
    type Error = DataSourceError;
    type Future = QueryFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: AsyncQuery) -> Self::Future {
        let span = request.context.span();
        Box::pin(
            async move {
                let rows = request.source.query(&request.query, &request.params).await;
                match &rows {
                    Ok(rows) => tracing::debug!(rows = rows.len(), "async query completed"),
                    Err(err) => tracing::debug!(error = %err, "async query failed"),
                }
                rows
            }
            .instrument(span),
        )
    }
}

/// The assembled stack: load shedding outermost, then the timeout.
pub type QueryPipeline = LoadShedService<TimeoutService<QueryService>>;

/// Builds the async-query pipeline.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject once `max_concurrent` queries are in flight
/// 2. `TimeoutLayer` -- bound each query by its own timeout
#[must_use]
pub fn build_query_pipeline(max_concurrent: usize) -> QueryPipeline {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(max_concurrent))
        .layer(TimeoutLayer)
        .service(QueryService)
}

/// Pending result of an async query. Resolves to the query's rows or its
/// error; a task that was aborted during shutdown resolves to
/// `GENERAL_ERROR`.
#[derive(Debug)]
pub struct QueryHandle {
    source: String,
    task: JoinHandle<Result<Vec<Record>, DataSourceError>>,
}

impl QueryHandle {
    pub(crate) fn new(
        source: impl Into<String>,
        task: JoinHandle<Result<Vec<Record>, DataSourceError>>,
    ) -> Self {
        Self {
            source: source.into(),
            task,
        }
    }

    #[must_use]
    pub fn source_name(&self) -> &str {
        &self.source
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancels the query. Awaiting the handle afterwards yields an error.
    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Future for QueryHandle {
    type Output = Result<Vec<Record>, DataSourceError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(join)) => {
                let message = if join.is_cancelled() {
                    "Async query was cancelled"
                } else {
                    "Async query panicked"
                };
                Poll::Ready(Err(
                    DataSourceError::general(message).in_context(&this.source, "query_async")
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use apex_data_core::{DataSourceType, ErrorKind, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::testing::StubDataSource;

    fn request(source: Arc<StubDataSource>, timeout: Duration) -> AsyncQuery {
        AsyncQuery {
            source,
            query: "SELECT 1".into(),
            params: Params::new(),
            timeout,
            context: QueryContext::new("stub", "query_async"),
        }
    }

    #[tokio::test]
    async fn pipeline_routes_to_the_adapter() {
        let stub = Arc::new(StubDataSource::new("stub", DataSourceType::Database));
        let rows = build_query_pipeline(4)
            .oneshot(request(stub.clone(), Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(rows[0]["query"], Value::from("SELECT 1"));
        assert_eq!(stub.query_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pipeline_enforces_the_timeout() {
        let stub = Arc::new(StubDataSource::new("stub", DataSourceType::Database));
        stub.set_delay(Duration::from_secs(5));
        let err = build_query_pipeline(4)
            .oneshot(request(stub, Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn aborted_handle_resolves_to_general_error() {
        let handle = QueryHandle::new(
            "stub",
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }),
        );
        assert_eq!(handle.source_name(), "stub");
        handle.abort();
        let err = handle.await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::General);
        assert_eq!(err.source_name(), Some("stub"));
    }
}
