//! Per-query timeout enforcement.

use std::task::{Context, Poll};

use apex_data_core::{DataSourceError, Record};
use tower::{Layer, Service};

use crate::manager::pipeline::{AsyncQuery, QueryFuture};

/// Tower layer that bounds each query by its own `AsyncQuery::timeout`.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer;

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
}

impl<S> Service<AsyncQuery> for TimeoutService<S>
where
    S: Service<AsyncQuery, Response = Vec<Record>, Error = DataSourceError> + Send,
    S::Future: Send + 'static,
{
    type Response = Vec<Record>;
    type Error = DataSourceError;
    type Future = QueryFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: AsyncQuery) -> Self::Future {
        let timeout = request.timeout;
        let source = request.context.source_name.clone();
        let fut = self.inner.call(request);
        Box::pin(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(DataSourceError::timeout(format!(
                    "Query timed out after {}ms",
                    timeout.as_millis()
                ))
                .in_context(&source, "query_async")),
            }
        })
    }
}
