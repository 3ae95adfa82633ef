pub mod error;
pub mod v1;

use anyhow::Result;
use axum::{http::StatusCode, Router};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::{auth::AuthConfig, config::Config, controller::ControlLoop};

pub fn router(control: Arc<ControlLoop>, cfg: &Config) -> Result<Router> {
    let token = cfg
        .auth
        .token
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("auth.token is required to serve the API"))?;

    let app = Router::new().nest("/api/v1", v1::router(control, AuthConfig::new(token)));
    Ok(with_layers(
        app,
        Duration::from_secs(cfg.server.request_timeout_seconds),
    ))
}

/// Body limit, request timeout (408) and request tracing
fn with_layers(app: Router, request_timeout: Duration) -> Router {
    app.layer(
        ServiceBuilder::new()
            .layer(axum::extract::DefaultBodyLimit::max(64 * 1024))
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                request_timeout,
            )),
    )
    .layer(TraceLayer::new_for_http())
}
