//! Connection state and the health snapshot published to callers.

use serde::Serialize;

/// Internal state of the connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    /// No pool exists.
    Disconnected,
    /// The connect-with-retry loop is running.
    Connecting,
    /// The pool is open and the health probe is running.
    Connected,
    /// The database feature is disabled by configuration.
    Degraded,
}

impl PoolState {
    pub fn health_status(self) -> HealthStatus {
        match self {
            Self::Disconnected => HealthStatus::Unhealthy,
            Self::Connecting => HealthStatus::Connecting,
            Self::Connected => HealthStatus::Healthy,
            Self::Degraded => HealthStatus::Disabled,
        }
    }
}

/// Externally reported status label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Disabled,
    Connecting,
    Healthy,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Connecting => "connecting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of database connectivity, readable without waiting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub connected: bool,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl HealthSnapshot {
    pub fn new(state: PoolState, last_error: Option<String>) -> Self {
        Self {
            connected: state == PoolState::Connected,
            status: state.health_status(),
            last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(PoolState::Connected.health_status(), HealthStatus::Healthy);
        assert_eq!(PoolState::Connecting.health_status(), HealthStatus::Connecting);
        assert_eq!(PoolState::Disconnected.health_status(), HealthStatus::Unhealthy);
        assert_eq!(PoolState::Degraded.health_status(), HealthStatus::Disabled);
    }

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = HealthSnapshot::new(PoolState::Connecting, Some("refused".into()));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"connected": false, "status": "connecting", "last_error": "refused"})
        );

        let snapshot = HealthSnapshot::new(PoolState::Connected, None);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json, serde_json::json!({"connected": true, "status": "healthy"}));
    }
}
