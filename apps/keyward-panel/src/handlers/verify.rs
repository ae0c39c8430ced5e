use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use crate::error::{LicenseError, LicenseResult};
use crate::services::{CallerInfo, VerificationOutcome};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub license_key: String,
    #[serde(default, alias = "machine_code")]
    pub device_id: String,
}

pub async fn verify_license(
    State(state): State<AppState>,
    caller: CallerInfo,
    Json(payload): Json<VerifyRequest>,
) -> LicenseResult<Response> {
    // Device ids are opaque and compared byte for byte; only blank ones are
    // refused.
    let key = payload.license_key.trim();
    let device_id = payload.device_id.as_str();
    if key.is_empty() || device_id.trim().is_empty() {
        return Err(LicenseError::InvalidArgument(
            "license_key and device_id are required".to_string(),
        ));
    }

    let outcome = state.verification.verify(&caller, key, device_id).await?;
    Ok(outcome_response(&outcome))
}

fn outcome_response(outcome: &VerificationOutcome) -> Response {
    if let Some(entitlement) = outcome.entitlement() {
        let body = json!({
            "success": true,
            "status": outcome.as_str(),
            "message": outcome.message(),
            "license_id": entitlement.license_id,
            "expires_at": entitlement.expires_at,
            "remaining_days": entitlement.remaining_days,
        });
        return (StatusCode::OK, Json(body)).into_response();
    }

    let status = match outcome {
        VerificationOutcome::NotFound => StatusCode::NOT_FOUND,
        VerificationOutcome::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::FORBIDDEN,
    };
    let body = json!({
        "success": false,
        "error": outcome.as_str(),
        "message": outcome.message(),
    });
    (status, Json(body)).into_response()
}
