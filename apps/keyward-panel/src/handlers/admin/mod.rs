pub mod licenses;
pub mod logs;

use axum::{
    Json, Router,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde_json::json;
use tracing::warn;

use crate::services::{CallerInfo, RouteClass};
use crate::state::AppState;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/licenses", get(licenses::list).post(licenses::create))
        .route("/licenses/stats", get(licenses::stats))
        .route("/licenses/compact", post(licenses::compact))
        .route("/licenses/{id}", get(licenses::show).delete(licenses::delete))
        .route("/licenses/{id}/note", put(licenses::update_note))
        .route("/licenses/{id}/disable", post(licenses::disable))
        .route("/licenses/{id}/enable", post(licenses::enable))
        .route("/licenses/{id}/unbind", post(licenses::unbind))
        .route("/licenses/{id}/extend", post(licenses::extend))
        .route("/logs", get(logs::recent_actions))
        .route("/logs/usage", get(logs::usage))
        .route("/logs/usage/export", get(logs::export_usage))
        .route("/devices/{device_id}/history", get(logs::device_history))
        .route_layer(middleware::from_fn_with_state(state, require_admin))
}

/// Bearer-token guard for every admin route. Failed attempts count against
/// the caller's login limit; once it is exhausted even a valid token waits
/// for the window to pass.
async fn require_admin(
    State(state): State<AppState>,
    caller: CallerInfo,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.config.admin_token.as_deref() else {
        return reject(StatusCode::FORBIDDEN, "admin_disabled", "Admin API is disabled");
    };

    let now = state.clock.now();
    if state.limiter.is_exhausted(&caller.ip, RouteClass::Login, now) {
        warn!("Too many failed admin logins from {}", caller.ip);
        return reject(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "Too many failed attempts, please try again later",
        );
    }

    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    if presented == Some(expected) {
        return next.run(req).await;
    }

    state.limiter.allow(&caller.ip, RouteClass::Login, now);
    warn!("Rejected admin request from {} to {}", caller.ip, req.uri().path());
    reject(StatusCode::UNAUTHORIZED, "unauthorized", "Missing or invalid admin token")
}

fn reject(status: StatusCode, error: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "success": false,
            "error": error,
            "message": message,
        })),
    )
        .into_response()
}
