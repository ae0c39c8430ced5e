use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("license {0} not found")]
    NotFound(i64),

    #[error("license key already exists")]
    DuplicateKey,

    /// The table is held exclusively by a compaction, or a compaction was
    /// requested while mutations were in flight.
    #[error("license table is busy")]
    Busy,

    #[error("conflicting write: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                if db_err.message().contains("license_key") {
                    return StoreError::DuplicateKey;
                }
                return StoreError::Conflict(db_err.message().to_string());
            }
        }
        StoreError::Unavailable(err)
    }
}
