use crate::{
    inverter::InverterError,
    service::{ActivePower, InverterQueryService, ServiceError},
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn router(service: Arc<InverterQueryService>) -> Router {
    Router::new()
        .route("/active_power", get(active_power))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn active_power(
    State(service): State<Arc<InverterQueryService>>,
) -> Result<Json<ActivePower>, ApiError> {
    Ok(Json(service.read_active_power().await?))
}

/// Serves the API until Ctrl-C or SIGTERM
pub async fn serve(listener: TcpListener, service: Arc<InverterQueryService>) -> anyhow::Result<()> {
    info!("Serving HTTP on {}", listener.local_addr()?);
    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cant listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Cant listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown requested");
}

#[derive(Debug)]
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ServiceError::Uninitialized => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Inverter(InverterError::Communication(_)) => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Inverter(InverterError::Protocol(_) | InverterError::Device(_)) => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!("Request failed with {status}: {}", self.0);
        (status, Json(json!({ "detail": self.0.to_string() }))).into_response()
    }
}
