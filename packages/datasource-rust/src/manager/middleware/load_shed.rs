//! Load shedding for async queries.
//!
//! Rejects a query outright when `max_concurrent` queries are already in
//! flight instead of queueing it behind them.

use std::sync::Arc;
use std::task::{Context, Poll};

use apex_data_core::{DataSourceError, Record};
use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::manager::pipeline::{AsyncQuery, QueryFuture};

/// Tower layer that caps concurrent async queries with a semaphore.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
}

impl LoadShedLayer {
    /// A zero limit is raised to one so the pipeline can make progress.
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
}

impl<S> LoadShedService<S> {
    /// Permits currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl<S> Service<AsyncQuery> for LoadShedService<S>
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
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            let source = request.context.source_name.clone();
            tracing::warn!(source = %source, "async query rejected: capacity exhausted");
            return Box::pin(async move {
                Err(DataSourceError::execution("Async query capacity exhausted")
                    .in_context(&source, "query_async")
                    .with_retryable(true))
            });
        };

        let fut = self.inner.call(request);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use apex_data_core::{DataSourceType, ErrorKind, Params, QueryContext};
    use tower::ServiceExt;

    use super::*;
    use crate::testing::StubDataSource;

    /// Holds every request for `delay` before answering with no rows.
    #[derive(Clone)]
    struct SlowService {
        delay: Duration,
    }

    impl Service<AsyncQuery> for SlowService {
        type Response = Vec<Record>;
        type Error = DataSourceError;
        type Future = QueryFuture;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _request: AsyncQuery) -> Self::Future {
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(Vec::new())
            })
        }
    }

    fn query() -> AsyncQuery {
        AsyncQuery {
            source: Arc::new(StubDataSource::new("orders", DataSourceType::Database)),
            query: "SELECT 1".into(),
            params: Params::new(),
            timeout: Duration::from_secs(1),
            context: QueryContext::new("orders", "query_async"),
        }
    }

    #[tokio::test]
    async fn allows_queries_under_limit() {
        let layer = LoadShedLayer::new(2);
        let svc = layer.layer(SlowService {
            delay: Duration::ZERO,
        });
        assert!(svc.oneshot(query()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_when_overloaded() {
        let layer = LoadShedLayer::new(1);
        let mut busy = layer.layer(SlowService {
            delay: Duration::from_millis(500),
        });
        let first = busy.call(query());

        let err = layer
            .layer(SlowService {
                delay: Duration::ZERO,
            })
            .oneshot(query())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.is_retryable());
        assert_eq!(err.source_name(), Some("orders"));

        assert!(first.await.is_ok());
        assert_eq!(busy.available(), 1);
    }

    #[test]
    fn zero_limit_still_admits_one() {
        let svc = LoadShedLayer::new(0).layer(SlowService {
            delay: Duration::ZERO,
        });
        assert_eq!(svc.available(), 1);
    }
}
