use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

use super::error::ApiError;
use crate::{
    auth::{require_bearer, AuthConfig},
    controller::{BoostReport, ControlLoop, DeviceHealth, LoopStatus},
    domain::{BoostOrder, BoostRequest, DeviceId},
};

pub fn router(control: Arc<ControlLoop>, auth: AuthConfig) -> Router {
    let protected = Router::new()
        .route("/status", get(get_status))
        .route("/devices/:id/reset", post(reset_device))
        .route("/devices/:id/boost", put(request_boost).delete(clear_boost))
        .route("/boost/run", post(run_boost))
        .route_layer(middleware::from_fn_with_state(auth, require_bearer));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(protected)
        .with_state(control)
}

pub async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

pub async fn get_status(State(control): State<Arc<ControlLoop>>) -> Json<LoopStatus> {
    Json(control.status().await)
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub device: DeviceId,
    pub health: DeviceHealth,
}

pub async fn reset_device(
    State(control): State<Arc<ControlLoop>>,
    Path(id): Path<String>,
) -> Result<Json<ResetResponse>, ApiError> {
    let device = DeviceId::new(id);
    if !control.reset_device(&device).await {
        return Err(ApiError::NotFound(format!("device {device}")));
    }
    Ok(Json(ResetResponse {
        device,
        health: DeviceHealth::Unknown,
    }))
}

/// Body of `PUT /devices/:id/boost`; exactly one of `energy_kwh` and `target_soc`
#[derive(Debug, Deserialize, Validate)]
pub struct BoostBody {
    #[validate(range(min = 0.1, max = 200.0))]
    pub energy_kwh: Option<f64>,
    #[validate(range(min = 0.0, max = 100.0))]
    pub target_soc: Option<f64>,
    #[validate(range(min = 0.1, max = 50.0))]
    pub rate_kw: Option<f64>,
    #[validate(range(max = 23))]
    pub by_hour: Option<u32>,
    pub complete_by: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub keep_existing: bool,
}

impl From<BoostBody> for BoostOrder {
    fn from(body: BoostBody) -> Self {
        Self {
            energy_kwh: body.energy_kwh,
            target_soc: body.target_soc,
            rate_kw: body.rate_kw,
            by_hour: body.by_hour,
            complete_by: body.complete_by,
            keep_existing: body.keep_existing,
        }
    }
}

pub async fn request_boost(
    State(control): State<Arc<ControlLoop>>,
    Path(id): Path<String>,
    Json(body): Json<BoostBody>,
) -> Result<(StatusCode, Json<BoostRequest>), ApiError> {
    body.validate()?;
    let device = DeviceId::new(id);
    let order = BoostOrder::from(body);
    let request = control
        .resolve_order(&device, &order, Local::now().fixed_offset())
        .await?;
    control.set_request(&device, request.clone()).await;
    Ok((StatusCode::ACCEPTED, Json(request)))
}

pub async fn clear_boost(
    State(control): State<Arc<ControlLoop>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let device = DeviceId::new(id);
    if !control.set_request(&device, BoostRequest::clear()).await {
        return Err(ApiError::NotFound(format!("device {device}")));
    }
    Ok(StatusCode::ACCEPTED)
}

/// Run a boost pass now instead of waiting for the next cadence
pub async fn run_boost(
    State(control): State<Arc<ControlLoop>>,
) -> Result<Json<BoostReport>, ApiError> {
    Ok(Json(control.boost_tick().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{Collaborators, LoopSettings, ManagedDevice, ModeDecisionEngine};
    use crate::domain::Thresholds;
    use crate::hardware::SimulatedSite;
    use crate::optimizer::{BoostScheduler, SchedulerConstraints};
    use crate::prices::SimulatedPriceProvider;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const TOKEN: &str = "test-token";

    fn app() -> Router {
        let site = Arc::new(SimulatedSite::new(1).with_device("zappi-1", 40.0, Some(30.0), 0.0));
        let control = ControlLoop::new(
            Collaborators {
                states: site.clone(),
                commands: site,
                prices: Arc::new(SimulatedPriceProvider::default()),
            },
            ModeDecisionEngine::new(0.0),
            BoostScheduler::new(SchedulerConstraints::default()),
            LoopSettings::default(),
            vec![ManagedDevice::new("zappi-1", Thresholds::disabled(40.0))],
        );
        router(Arc::new(control), AuthConfig::new(TOKEN))
    }

    fn authed(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {TOKEN}"));
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_healthz_needs_no_token() {
        let response = app()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_requires_token() {
        let response = app()
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"], "Unauthorized");

        let response = app().oneshot(authed("GET", "/status", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let status = json_body(response).await;
        assert_eq!(status["devices"]["zappi-1"]["health"]["state"], "UNKNOWN");
    }

    #[tokio::test]
    async fn test_boost_request_is_queued() {
        let app = app();
        let response = app
            .clone()
            .oneshot(authed(
                "PUT",
                "/devices/zappi-1/boost",
                Some(json!({"energy_kwh": 6.0, "by_hour": 7, "rate_kw": 3.6})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let request = json_body(response).await;
        assert_eq!(request["energy_target_kwh"], 6.0);
        assert_eq!(request["rate_kw"], 3.6);

        let status = json_body(app.oneshot(authed("GET", "/status", None)).await.unwrap()).await;
        assert_eq!(status["pending"]["zappi-1"]["energy_target_kwh"], 6.0);
    }

    #[tokio::test]
    async fn test_boost_request_errors() {
        let unknown = app()
            .oneshot(authed("PUT", "/devices/eddi-9/boost", Some(json!({"energy_kwh": 1.0}))))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let ambiguous = app()
            .oneshot(authed(
                "PUT",
                "/devices/zappi-1/boost",
                Some(json!({"energy_kwh": 1.0, "target_soc": 80.0})),
            ))
            .await
            .unwrap();
        assert_eq!(ambiguous.status(), StatusCode::BAD_REQUEST);

        let invalid = app()
            .oneshot(authed("PUT", "/devices/zappi-1/boost", Some(json!({"energy_kwh": 1.0, "by_hour": 30}))))
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(invalid).await["error"], "ValidationError");

        // no poll has run, so the vehicle SOC is not known yet
        let no_soc = app()
            .oneshot(authed("PUT", "/devices/zappi-1/boost", Some(json!({"target_soc": 80.0}))))
            .await
            .unwrap();
        assert_eq!(no_soc.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_reset_and_clear() {
        let response = app()
            .oneshot(authed("POST", "/devices/zappi-1/reset", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["health"], "UNKNOWN");

        let response = app()
            .oneshot(authed("POST", "/devices/eddi-9/reset", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app()
            .oneshot(authed("DELETE", "/devices/zappi-1/boost", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_run_boost_reports() {
        let response = app().oneshot(authed("POST", "/boost/run", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = json_body(response).await;
        assert!(report["errors"].as_object().unwrap().is_empty());
    }
}
