use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use keyward_db::models::license::{LicenseFilter, LicenseStatus};
use serde::Deserialize;
use serde_json::json;

use crate::error::{LicenseError, LicenseResult};
use crate::services::{CallerInfo, KeyFormat};
use crate::state::AppState;

const HISTORY_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub status: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub count: i64,
    pub days: i64,
    pub format: Option<KeyFormat>,
}

#[derive(Debug, Deserialize)]
pub struct NoteRequest {
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExtendRequest {
    pub days: i64,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> LicenseResult<impl IntoResponse> {
    let status = match query.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<LicenseStatus>()
                .map_err(LicenseError::InvalidArgument)?,
        ),
    };
    let filter = LicenseFilter {
        status,
        search: query.search.filter(|s| !s.trim().is_empty()),
    };

    let page = state
        .admin
        .list(&filter, query.page.unwrap_or(1), query.per_page.unwrap_or(20))
        .await?;
    Ok(Json(page))
}

pub async fn create(
    State(state): State<AppState>,
    caller: CallerInfo,
    Json(payload): Json<CreateRequest>,
) -> LicenseResult<impl IntoResponse> {
    let ids = state
        .admin
        .create_many(&caller, payload.count, payload.days, payload.format.as_ref())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "count": ids.len(), "ids": ids })),
    ))
}

pub async fn stats(State(state): State<AppState>) -> LicenseResult<impl IntoResponse> {
    let licenses = state.admin.stats().await?;
    let usage = state.logs.usage_stats().await?;
    Ok(Json(json!({ "licenses": licenses, "usage": usage })))
}

pub async fn compact(
    State(state): State<AppState>,
    caller: CallerInfo,
) -> LicenseResult<impl IntoResponse> {
    let report = state.admin.compact_all(&caller).await?;
    Ok(Json(report))
}

/// License detail with its most recent verification attempts.
pub async fn show(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> LicenseResult<impl IntoResponse> {
    let license = state.admin.get(id).await?;
    let history = state.logs.license_history(&license.key, HISTORY_LIMIT).await?;
    Ok(Json(json!({ "license": license, "history": history })))
}

pub async fn update_note(
    State(state): State<AppState>,
    caller: CallerInfo,
    Path(id): Path<i64>,
    Json(payload): Json<NoteRequest>,
) -> LicenseResult<impl IntoResponse> {
    Ok(Json(state.admin.update_note(&caller, id, payload.note).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    caller: CallerInfo,
    Path(id): Path<i64>,
) -> LicenseResult<impl IntoResponse> {
    state.admin.delete(&caller, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn disable(
    State(state): State<AppState>,
    caller: CallerInfo,
    Path(id): Path<i64>,
) -> LicenseResult<impl IntoResponse> {
    Ok(Json(state.admin.disable(&caller, id).await?))
}

pub async fn enable(
    State(state): State<AppState>,
    caller: CallerInfo,
    Path(id): Path<i64>,
) -> LicenseResult<impl IntoResponse> {
    Ok(Json(state.admin.enable(&caller, id).await?))
}

pub async fn unbind(
    State(state): State<AppState>,
    caller: CallerInfo,
    Path(id): Path<i64>,
) -> LicenseResult<impl IntoResponse> {
    Ok(Json(state.admin.unbind(&caller, id).await?))
}

pub async fn extend(
    State(state): State<AppState>,
    caller: CallerInfo,
    Path(id): Path<i64>,
    Json(payload): Json<ExtendRequest>,
) -> LicenseResult<impl IntoResponse> {
    Ok(Json(state.admin.extend_expiry(&caller, id, payload.days).await?))
}
