use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use keyward_db::models::audit::UsageLogFilter;
use serde::Deserialize;

use crate::error::{LicenseError, LicenseResult};
use crate::services::export_service::usage_logs_csv;
use crate::state::AppState;

const DEFAULT_EXPORT_LIMIT: i64 = 1000;
const MAX_EXPORT_LIMIT: i64 = 10_000;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub license_key: Option<String>,
    #[serde(alias = "machine_code")]
    pub device_id: Option<String>,
    pub outcome: Option<String>,
    pub success: Option<bool>,
    /// RFC 3339 timestamp or `YYYY-MM-DD` (start of day).
    pub from: Option<String>,
    /// RFC 3339 timestamp or `YYYY-MM-DD` (end of day).
    pub until: Option<String>,
    pub limit: Option<i64>,
}

impl UsageQuery {
    fn filter(&self) -> LicenseResult<UsageLogFilter> {
        Ok(UsageLogFilter {
            license_key: self.license_key.clone(),
            device_id: self.device_id.clone(),
            outcome: self.outcome.clone(),
            success: self.success,
            since: self.from.as_deref().map(|raw| parse_bound(raw, false)).transpose()?,
            until: self.until.as_deref().map(|raw| parse_bound(raw, true)).transpose()?,
        })
    }
}

fn parse_bound(raw: &str, end_of_day: bool) -> LicenseResult<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }

    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| LicenseError::InvalidArgument(format!("invalid date '{}'", raw)))?;
    let time = if end_of_day {
        NaiveTime::from_hms_opt(23, 59, 59)
    } else {
        NaiveTime::from_hms_opt(0, 0, 0)
    }
    .ok_or_else(|| LicenseError::InvalidArgument(format!("invalid date '{}'", raw)))?;
    Ok(day.and_time(time).and_utc())
}

pub async fn recent_actions(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> LicenseResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    Ok(Json(state.logs.recent_admin_actions(limit).await?))
}

pub async fn usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> LicenseResult<impl IntoResponse> {
    let filter = query.filter()?;
    let page = state
        .logs
        .paginate_usage(&filter, query.page.unwrap_or(1), query.per_page.unwrap_or(50))
        .await?;
    Ok(Json(page))
}

pub async fn export_usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> LicenseResult<impl IntoResponse> {
    let filter = query.filter()?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EXPORT_LIMIT)
        .clamp(1, MAX_EXPORT_LIMIT);
    let logs = state.logs.export_usage(&filter, limit).await?;
    let body = usage_logs_csv(&logs)?;

    let filename = format!(
        "attachment; filename=\"usage_logs_{}.csv\"",
        state.clock.now().format("%Y-%m-%d")
    );
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, filename),
        ],
        body,
    ))
}

/// Recent verification attempts made by one device, across all keys.
pub async fn device_history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> LicenseResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(state.logs.device_history(&device_id, limit).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_date_bounds_cover_whole_days() {
        assert_eq!(
            parse_bound("2025-03-04", false).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 4, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_bound("2025-03-04", true).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 4, 23, 59, 59).unwrap()
        );
        assert_eq!(
            parse_bound("2025-03-04T10:00:00+02:00", true).unwrap(),
            Utc.with_ymd_and_hms(2025, 3, 4, 8, 0, 0).unwrap()
        );
        assert!(matches!(
            parse_bound("yesterday", false),
            Err(LicenseError::InvalidArgument(_))
        ));
    }
}
