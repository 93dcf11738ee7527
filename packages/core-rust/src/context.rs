use tracing::Span;
use uuid::Uuid;

/// Per-call diagnostic context, passed explicitly instead of living in
/// thread-local state. Adapters and the manager enter [`span`](Self::span)
/// so every log line of a call carries the same correlation id.
#[derive(Debug, Clone)]
pub struct QueryContext {
    /// Unique id shared by every log line of one logical call.
    pub correlation_id: String,
    /// Name of the data source handling the call.
    pub source_name: String,
    /// Operation being performed (`query`, `get_data`, ...).
    pub operation: &'static str,
}

impl QueryContext {
    /// Creates a context with a fresh correlation id.
    #[must_use]
    pub fn new(source_name: impl Into<String>, operation: &'static str) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            source_name: source_name.into(),
            operation,
        }
    }

    /// Same correlation id, different source. Used when a call fans out.
    #[must_use]
    pub fn for_source(&self, source_name: impl Into<String>) -> Self {
        Self {
            correlation_id: self.correlation_id.clone(),
            source_name: source_name.into(),
            operation: self.operation,
        }
    }

    #[must_use]
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "datasource",
            correlation_id = %self.correlation_id,
            source = %self.source_name,
            operation = self.operation,
        )
    }
}
