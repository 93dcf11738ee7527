//! Reachability state of one adapter.

use std::fmt;

use serde::Serialize;

use crate::clock::now_millis;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    NotInitialized,
    Connecting,
    Connected,
    Disconnected,
    Error,
    ShuttingDown,
    Shutdown,
}

impl ConnectionState {
    #[must_use]
    pub fn display_name(self) -> &'static str {
        match self {
            Self::NotInitialized => "Not Initialized",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::Error => "Error",
            Self::ShuttingDown => "Shutting Down",
            Self::Shutdown => "Shutdown",
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::NotInitialized => "Data source has not been initialized",
            Self::Connecting => "Data source is establishing connection",
            Self::Connected => "Data source is connected and operational",
            Self::Disconnected => "Data source is disconnected",
            Self::Error => "Data source connection has an error",
            Self::ShuttingDown => "Data source is being shut down",
            Self::Shutdown => "Data source has been shut down",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Current state of one adapter plus a human-readable message.
///
/// Owned and mutated only by its adapter. Transitions go through
/// [`update`](Self::update), which carries the connection counters forward.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    state: ConnectionState,
    message: String,
    cause: Option<String>,
    last_updated: u64,
    last_connected: Option<u64>,
    connection_attempts: u64,
    successful_connections: u64,
}

impl ConnectionStatus {
    fn with_state(state: ConnectionState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
            cause: None,
            last_updated: now_millis(),
            last_connected: None,
            connection_attempts: 0,
            successful_connections: 0,
        }
    }

    #[must_use]
    pub fn not_initialized() -> Self {
        Self::with_state(ConnectionState::NotInitialized, "Data source not initialized")
    }

    #[must_use]
    pub fn connecting() -> Self {
        Self::with_state(ConnectionState::Connecting, "Establishing connection")
    }

    /// Connected status. `None` uses the default message.
    #[must_use]
    pub fn connected(message: Option<&str>) -> Self {
        let mut status = Self::with_state(
            ConnectionState::Connected,
            message.unwrap_or("Connected successfully"),
        );
        status.last_connected = Some(status.last_updated);
        status
    }

    #[must_use]
    pub fn disconnected(message: Option<&str>) -> Self {
        Self::with_state(
            ConnectionState::Disconnected,
            message.unwrap_or("Disconnected"),
        )
    }

    /// Error status with an optional rendered cause.
    #[must_use]
    pub fn error(message: Option<&str>, cause: Option<&dyn std::error::Error>) -> Self {
        let mut status =
            Self::with_state(ConnectionState::Error, message.unwrap_or("Connection error"));
        status.cause = cause.map(ToString::to_string);
        status
    }

    #[must_use]
    pub fn shutting_down() -> Self {
        Self::with_state(ConnectionState::ShuttingDown, "Data source shutting down")
    }

    #[must_use]
    pub fn shutdown() -> Self {
        Self::with_state(ConnectionState::Shutdown, "Data source shut down")
    }

    /// Moves to `next`, keeping the connection history.
    ///
    /// Entering `Connecting` counts an attempt and entering `Connected`
    /// counts a success.
    pub fn update(&mut self, next: ConnectionStatus) {
        let attempts = self.connection_attempts
            + u64::from(next.state == ConnectionState::Connecting);
        let successes = self.successful_connections
            + u64::from(next.state == ConnectionState::Connected);
        let last_connected = next.last_connected.or(self.last_connected);
        *self = ConnectionStatus {
            connection_attempts: attempts,
            successful_connections: successes,
            last_connected,
            ..next
        };
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    #[must_use]
    pub fn last_updated(&self) -> u64 {
        self.last_updated
    }

    #[must_use]
    pub fn last_connected(&self) -> Option<u64> {
        self.last_connected
    }

    #[must_use]
    pub fn connection_attempts(&self) -> u64 {
        self.connection_attempts
    }

    #[must_use]
    pub fn successful_connections(&self) -> u64 {
        self.successful_connections
    }

    /// `true` only while connected.
    #[must_use]
    pub fn is_operational(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.state == ConnectionState::Error
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::not_initialized()
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.state, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_messages() {
        assert_eq!(
            ConnectionStatus::not_initialized().message(),
            "Data source not initialized"
        );
        assert_eq!(ConnectionStatus::connecting().message(), "Establishing connection");
        assert_eq!(
            ConnectionStatus::connected(None).message(),
            "Connected successfully"
        );
        assert_eq!(ConnectionStatus::disconnected(None).message(), "Disconnected");
        assert_eq!(ConnectionStatus::error(None, None).message(), "Connection error");
        assert_eq!(ConnectionStatus::shutdown().message(), "Data source shut down");
    }

    #[test]
    fn only_connected_is_operational() {
        assert!(ConnectionStatus::connected(Some("ok")).is_operational());
        for status in [
            ConnectionStatus::not_initialized(),
            ConnectionStatus::connecting(),
            ConnectionStatus::disconnected(None),
            ConnectionStatus::error(None, None),
            ConnectionStatus::shutting_down(),
            ConnectionStatus::shutdown(),
        ] {
            assert!(!status.is_operational(), "{status}");
        }
        assert!(ConnectionStatus::error(None, None).is_error());
        assert!(!ConnectionStatus::shutdown().is_error());
    }

    #[test]
    fn update_carries_connection_history() {
        let mut status = ConnectionStatus::not_initialized();
        assert_eq!(status.connection_attempts(), 0);

        status.update(ConnectionStatus::connecting());
        status.update(ConnectionStatus::connected(None));
        let connected_at = status.last_connected();
        assert!(connected_at.is_some());

        status.update(ConnectionStatus::connecting());
        let io = std::io::Error::other("refused");
        status.update(ConnectionStatus::error(Some("lost"), Some(&io)));

        assert_eq!(status.state(), ConnectionState::Error);
        assert_eq!(status.cause(), Some("refused"));
        assert_eq!(status.connection_attempts(), 2);
        assert_eq!(status.successful_connections(), 1);
        assert_eq!(status.last_connected(), connected_at);
    }

    #[test]
    fn state_names() {
        assert_eq!(ConnectionState::ShuttingDown.display_name(), "Shutting Down");
        assert_eq!(
            ConnectionState::Connected.description(),
            "Data source is connected and operational"
        );
    }
}
