//! HTTP surface: service info and the health endpoint.
//!
//! `/health` reads the lifecycle manager's published snapshot and never
//! waits on the database, so it answers during an outage.

use crate::error::{DbError, DbResult};
use crate::models::{HealthSnapshot, HealthStatus};
use crate::repository::Repository;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// Maximum wait for in-flight requests once a shutdown signal arrives.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceHealth {
    /// `healthy` or `degraded`
    pub status: &'static str,
    pub service: &'static str,
    pub database: HealthSnapshot,
}

impl ServiceHealth {
    /// Overall status from the database snapshot. A disabled database is an
    /// intentional configuration and does not degrade the service.
    pub fn from_snapshot(database: HealthSnapshot) -> Self {
        let status = match database.status {
            HealthStatus::Connecting | HealthStatus::Unhealthy => "degraded",
            HealthStatus::Healthy | HealthStatus::Disabled => "healthy",
        };
        Self {
            status,
            service: env!("CARGO_PKG_NAME"),
            database,
        }
    }
}

/// Shared handler state: the configured repository and, through it, the
/// lifecycle manager.
#[derive(Clone)]
pub struct AppState {
    repository: Repository,
}

impl AppState {
    pub fn new(repository: Repository) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .with_state(state)
}

async fn root(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "message": format!("{} is running", env!("CARGO_PKG_NAME")),
        "version": env!("CARGO_PKG_VERSION"),
        "max_list_limit": state.repository.max_list_limit(),
    }))
}

async fn health(State(state): State<AppState>) -> Json<ServiceHealth> {
    Json(ServiceHealth::from_snapshot(
        state.repository.lifecycle().health_snapshot(),
    ))
}

impl IntoResponse for DbError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let mut body = json!({ "error": self.to_string() });
        if let Some(suggestion) = self.suggestion() {
            body["suggestion"] = json!(suggestion);
        }
        (status, Json(body)).into_response()
    }
}

/// Serve until SIGINT or SIGTERM.
///
/// After the first signal in-flight requests get [`GRACEFUL_TIMEOUT`] to
/// finish; a second signal stops immediately.
pub async fn serve(state: AppState, bind_addr: &str) -> DbResult<()> {
    let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
        DbError::internal(format!("Failed to bind to {}: {}", bind_addr, e))
    })?;
    info!(addr = %bind_addr, "HTTP server listening");

    let shutdown_notify = std::sync::Arc::new(tokio::sync::Notify::new());
    let notify = shutdown_notify.clone();
    let shutdown_signal = async move {
        wait_for_signal().await;
        notify.notify_one();
    };

    let server = axum::serve(listener, router(state)).with_graceful_shutdown(shutdown_signal);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
                return Err(DbError::internal(format!("HTTP server error: {}", e)));
            }
            info!("HTTP server stopped");
        }
        _ = async {
            shutdown_notify.notified().await;
            info!(
                timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                "Waiting for requests to finish (send signal again to force exit)..."
            );
            tokio::select! {
                _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => {
                    warn!("Graceful shutdown timeout, forcing exit");
                }
                _ = wait_for_signal() => {
                    warn!("Received second signal, forcing immediate exit");
                }
            }
        } => {}
    }

    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSettings;
    use crate::db::LifecycleManager;
    use crate::models::PoolState;

    fn disabled_state(max_list_limit: u32) -> AppState {
        let lifecycle = LifecycleManager::new(DatabaseSettings::disabled(), Vec::new());
        AppState::new(Repository::new(lifecycle).with_max_list_limit(max_list_limit))
    }

    #[test]
    fn test_overall_status() {
        let cases = [
            (PoolState::Connected, "healthy"),
            (PoolState::Degraded, "healthy"),
            (PoolState::Connecting, "degraded"),
            (PoolState::Disconnected, "degraded"),
        ];
        for (state, expected) in cases {
            let health = ServiceHealth::from_snapshot(HealthSnapshot::new(state, None));
            assert_eq!(health.status, expected, "{:?}", state);
        }
    }

    #[tokio::test]
    async fn test_health_handler_reports_disabled() {
        let Json(body) = health(State(disabled_state(100))).await;
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["status"], "healthy");
        assert_eq!(value["database"]["status"], "disabled");
        assert_eq!(value["database"]["connected"], false);
        assert!(value["database"].get("last_error").is_none());
    }

    #[tokio::test]
    async fn test_root_reports_version_and_list_limit() {
        let state = disabled_state(25);
        assert_eq!(state.repository().max_list_limit(), 25);
        let Json(body) = root(State(state)).await;
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["max_list_limit"], 25);
    }

    #[test]
    fn test_error_status_mapping() {
        let response = DbError::invalid_input("bad column").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = DbError::FeatureDisabled.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = DbError::PoolClosed
            .with_operation("list", "users")
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = DbError::decode("bad row").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
