//! HTTP surface of the Execution Service.
//!
//! `POST /v1/redeem` takes a `RedeemRequest` as JSON and always answers `200`
//! with a `RedeemReply` once authorized; failures travel inside the reply.
//! `GET /health` is unauthenticated.

use crate::application::settlement::RedemptionService;
use crate::domain::outcome::FailureKind;
use crate::domain::redemption::{RedeemReply, RedeemRequest};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

pub const REDEEM_PATH: &str = "/v1/redeem";
pub const HEALTH_PATH: &str = "/health";

pub struct ServiceState {
    service: RedemptionService,
    auth_token: Option<String>,
}

impl ServiceState {
    pub fn new(service: RedemptionService, auth_token: Option<String>) -> Self {
        Self {
            service,
            auth_token,
        }
    }
}

pub fn router(state: Arc<ServiceState>) -> Router {
    Router::new()
        .route(REDEEM_PATH, post(redeem))
        .route(HEALTH_PATH, get(health))
        .with_state(state)
}

/// Serves until `shutdown` resolves, then lets open requests finish.
pub async fn serve<F>(listener: TcpListener, state: Arc<ServiceState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(addr = %listener.local_addr()?, "execution service listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[instrument(skip_all)]
async fn redeem(
    State(state): State<Arc<ServiceState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RedeemReply>, StatusCode> {
    authorize(&headers, state.auth_token.as_deref())?;

    let request: RedeemRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "malformed redeem request");
            return Ok(Json(RedeemReply::failed(
                FailureKind::Validation,
                format!("malformed request: {e}"),
            )));
        }
    };

    let deadline = Instant::now() + state.service.settings().request_budget;
    Ok(Json(state.service.execute(&request, deadline).await))
}

fn authorize(headers: &HeaderMap, expected: Option<&str>) -> Result<(), StatusCode> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if token == expected {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}
