use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use keyward_db::StoreError;
use serde_json::json;
use thiserror::Error;

/// Hard errors surfaced by the license core. Verification rejections are not
/// errors; they are `VerificationOutcome` values.
#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("license not found")]
    NotFound,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("could not generate a unique license key")]
    DuplicateKey,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("license store unavailable")]
    StoreUnavailable(#[source] StoreError),

    #[error("export failed: {0}")]
    Export(#[from] csv::Error),
}

pub type LicenseResult<T> = Result<T, LicenseError>;

impl LicenseError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::DuplicateKey => "duplicate_key",
            Self::Conflict(_) => "conflict",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::Export(_) => "export_failed",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::DuplicateKey | Self::Conflict(_) => StatusCode::CONFLICT,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Export(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for LicenseError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => Self::NotFound,
            StoreError::DuplicateKey => Self::DuplicateKey,
            StoreError::Busy => Self::Conflict("license table is being compacted".to_string()),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            other @ StoreError::Unavailable(_) => Self::StoreUnavailable(other),
        }
    }
}

impl IntoResponse for LicenseError {
    fn into_response(self) -> Response {
        match &self {
            Self::StoreUnavailable(source) => tracing::error!("License store error: {}", source),
            Self::Export(e) => tracing::error!("Log export error: {}", e),
            _ => {}
        }

        let body = Json(json!({
            "success": false,
            "error": self.kind(),
            "message": self.to_string(),
        }));
        (self.status_code(), body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_taxonomy() {
        assert!(matches!(LicenseError::from(StoreError::NotFound(3)), LicenseError::NotFound));
        assert!(matches!(LicenseError::from(StoreError::DuplicateKey), LicenseError::DuplicateKey));
        assert!(matches!(LicenseError::from(StoreError::Busy), LicenseError::Conflict(_)));
        assert!(matches!(
            LicenseError::from(StoreError::Unavailable(sqlx::Error::PoolClosed)),
            LicenseError::StoreUnavailable(_)
        ));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(LicenseError::NotFound.into_response().status(), StatusCode::NOT_FOUND);
        assert_eq!(
            LicenseError::InvalidArgument("count".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            LicenseError::Conflict("busy".into()).into_response().status(),
            StatusCode::CONFLICT
        );
    }
}
