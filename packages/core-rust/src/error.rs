//! Error taxonomy shared by every adapter, the registry and the manager.
//!
//! Backend-native failures are wrapped into a [`DataSourceError`] at the
//! adapter boundary. The [`ErrorKind`] tells callers what went wrong and the
//! retryable flag tells them whether trying again can help.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// Result alias used across the data layer.
pub type Result<T> = std::result::Result<T, DataSourceError>;

/// Shared, cloneable error cause.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// The nine failure categories a data-layer call can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Connection,
    Configuration,
    Execution,
    DataFormat,
    Timeout,
    Authentication,
    NotFound,
    CircuitBreaker,
    General,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 9] = [
        Self::Connection,
        Self::Configuration,
        Self::Execution,
        Self::DataFormat,
        Self::Timeout,
        Self::Authentication,
        Self::NotFound,
        Self::CircuitBreaker,
        Self::General,
    ];

    /// Stable code, e.g. `CONNECTION_ERROR`.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Connection => "CONNECTION_ERROR",
            Self::Configuration => "CONFIGURATION_ERROR",
            Self::Execution => "EXECUTION_ERROR",
            Self::DataFormat => "DATA_FORMAT_ERROR",
            Self::Timeout => "TIMEOUT_ERROR",
            Self::Authentication => "AUTHENTICATION_ERROR",
            Self::NotFound => "NOT_FOUND_ERROR",
            Self::CircuitBreaker => "CIRCUIT_BREAKER_ERROR",
            Self::General => "GENERAL_ERROR",
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Connection => "Connection failed",
            Self::Configuration => "Configuration error",
            Self::Execution => "Execution failed",
            Self::DataFormat => "Data format error",
            Self::Timeout => "Operation timed out",
            Self::Authentication => "Authentication failed",
            Self::NotFound => "Resource not found",
            Self::CircuitBreaker => "Circuit breaker activated",
            Self::General => "General error",
        }
    }

    /// Retryability used by the per-kind constructors on [`DataSourceError`].
    #[must_use]
    pub fn is_retryable_by_default(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Execution | Self::Timeout | Self::CircuitBreaker
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ---------------------------------------------------------------------------
// DataSourceError
// ---------------------------------------------------------------------------

/// A failed data-layer call.
///
/// `Display` renders `[CODE] message`; [`detailed_message`](Self::detailed_message)
/// adds the source name, the operation and the retryable marker.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[{}] {}", .kind.code(), .message)]
pub struct DataSourceError {
    kind: ErrorKind,
    message: String,
    source_name: Option<String>,
    operation: Option<String>,
    retryable: bool,
    #[source]
    cause: Option<Cause>,
}

impl DataSourceError {
    /// Creates a non-retryable error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source_name: None,
            operation: None,
            retryable: false,
            cause: None,
        }
    }

    fn with_default_retry(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message).with_retryable(kind.is_retryable_by_default())
    }

    /// Retryable `CONNECTION_ERROR`.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::with_default_retry(ErrorKind::Connection, message)
    }

    /// Non-retryable `CONFIGURATION_ERROR`.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_default_retry(ErrorKind::Configuration, message)
    }

    /// Retryable `EXECUTION_ERROR`.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::with_default_retry(ErrorKind::Execution, message)
    }

    /// Non-retryable `DATA_FORMAT_ERROR`.
    #[must_use]
    pub fn data_format(message: impl Into<String>) -> Self {
        Self::with_default_retry(ErrorKind::DataFormat, message)
    }

    /// Retryable `TIMEOUT_ERROR`.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::with_default_retry(ErrorKind::Timeout, message)
    }

    /// Non-retryable `AUTHENTICATION_ERROR`.
    #[must_use]
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::with_default_retry(ErrorKind::Authentication, message)
    }

    /// Non-retryable `NOT_FOUND_ERROR`.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_default_retry(ErrorKind::NotFound, message)
    }

    /// Retryable `CIRCUIT_BREAKER_ERROR`. Callers should back off.
    #[must_use]
    pub fn circuit_breaker(message: impl Into<String>) -> Self {
        Self::with_default_retry(ErrorKind::CircuitBreaker, message)
    }

    /// Non-retryable `GENERAL_ERROR`.
    #[must_use]
    pub fn general(message: impl Into<String>) -> Self {
        Self::with_default_retry(ErrorKind::General, message)
    }

    #[must_use]
    pub fn with_source(mut self, source_name: impl Into<String>) -> Self {
        self.source_name = Some(source_name.into());
        self
    }

    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    #[must_use]
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Attaches an already shared cause.
    #[must_use]
    pub fn with_shared_cause(mut self, cause: Cause) -> Self {
        self.cause = Some(cause);
        self
    }

    /// Fills in the source name and operation only where they are still unset.
    #[must_use]
    pub fn in_context(mut self, source_name: &str, operation: &str) -> Self {
        if self.source_name.is_none() {
            self.source_name = Some(source_name.to_string());
        }
        if self.operation.is_none() {
            self.operation = Some(operation.to_string());
        }
        self
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn source_name(&self) -> Option<&str> {
        self.source_name.as_deref()
    }

    #[must_use]
    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    #[must_use]
    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }

    /// Multi-line rendering for logs and error reports.
    #[must_use]
    pub fn detailed_message(&self) -> String {
        let mut out = format!("[{}] {}", self.kind.code(), self.message);
        if let Some(name) = &self.source_name {
            out.push_str("\nData Source: ");
            out.push_str(name);
        }
        if let Some(op) = &self.operation {
            out.push_str("\nOperation: ");
            out.push_str(op);
        }
        if self.retryable {
            out.push_str("\n[Retryable]");
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn codes_and_descriptions() {
        assert_eq!(ErrorKind::ALL.len(), 9);
        assert_eq!(ErrorKind::Connection.code(), "CONNECTION_ERROR");
        assert_eq!(ErrorKind::CircuitBreaker.code(), "CIRCUIT_BREAKER_ERROR");
        assert_eq!(ErrorKind::General.code(), "GENERAL_ERROR");
        assert_eq!(ErrorKind::Timeout.description(), "Operation timed out");
        assert_eq!(ErrorKind::NotFound.description(), "Resource not found");
        assert_eq!(
            ErrorKind::CircuitBreaker.description(),
            "Circuit breaker activated"
        );
    }

    #[test]
    fn default_retryability_per_kind() {
        assert!(DataSourceError::connection("x").is_retryable());
        assert!(!DataSourceError::configuration("x").is_retryable());
        assert!(DataSourceError::execution("x").is_retryable());
        assert!(!DataSourceError::data_format("x").is_retryable());
        assert!(DataSourceError::timeout("x").is_retryable());
        assert!(!DataSourceError::authentication("x").is_retryable());
        assert!(!DataSourceError::not_found("x").is_retryable());
        assert!(DataSourceError::circuit_breaker("x").is_retryable());
        assert!(!DataSourceError::general("x").is_retryable());
    }

    #[test]
    fn plain_constructor_is_not_retryable() {
        let err = DataSourceError::new(ErrorKind::Execution, "boom");
        assert!(!err.is_retryable());
        assert!(err.source_name().is_none());
        assert!(err.operation().is_none());
        assert!(err.cause().is_none());
    }

    #[test]
    fn display_is_code_and_message() {
        let err = DataSourceError::timeout("slow backend");
        assert_eq!(err.to_string(), "[TIMEOUT_ERROR] slow backend");
    }

    #[test]
    fn detailed_message_includes_context() {
        let err = DataSourceError::connection("Test connection failed")
            .with_source("test-db")
            .with_operation("connect");
        let detailed = err.detailed_message();
        assert!(detailed.contains("[CONNECTION_ERROR]"));
        assert!(detailed.contains("Test connection failed"));
        assert!(detailed.contains("Data Source: test-db"));
        assert!(detailed.contains("Operation: connect"));
        assert!(detailed.contains("[Retryable]"));
    }

    #[test]
    fn detailed_message_minimal() {
        let detailed = DataSourceError::general("oops").detailed_message();
        assert!(detailed.contains("[GENERAL_ERROR]"));
        assert!(!detailed.contains("Data Source:"));
        assert!(!detailed.contains("Operation:"));
        assert!(!detailed.contains("[Retryable]"));
    }

    #[test]
    fn cause_is_exposed_as_error_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = DataSourceError::not_found("file missing").with_cause(io);
        let source = err.source().expect("source");
        assert_eq!(source.to_string(), "missing");
    }

    #[test]
    fn in_context_keeps_existing_values() {
        let err = DataSourceError::execution("x")
            .with_source("first")
            .in_context("second", "query");
        assert_eq!(err.source_name(), Some("first"));
        assert_eq!(err.operation(), Some("query"));
    }
}
