pub mod admin;
pub mod caller;
pub mod health;
pub mod verify;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::warn;

use crate::services::{CallerInfo, RouteClass};
use crate::state::AppState;

const MAX_BODY_BYTES: usize = 64 * 1024;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/verify", post(verify::verify_license))
        .nest("/api/admin", admin::router(state.clone()))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Per-IP limits for every route class except verification, which the
/// verification service limits itself.
async fn rate_limit_middleware(
    State(state): State<AppState>,
    caller: CallerInfo,
    req: Request,
    next: Next,
) -> Response {
    let class = RouteClass::for_path(req.uri().path());
    if class == RouteClass::Verify {
        return next.run(req).await;
    }

    if state.limiter.allow(&caller.ip, class, state.clock.now()) {
        return next.run(req).await;
    }

    warn!("Rate limit exceeded for {} on {}", caller.ip, req.uri().path());
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "success": false,
            "error": "rate_limited",
            "message": "Too many requests, please try again later",
        })),
    )
        .into_response()
}
