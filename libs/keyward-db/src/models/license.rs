use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stored as an integer column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[repr(i64)]
pub enum LicenseStatus {
    /// Never verified.
    Unused = 0,
    /// Verified and tied to one device.
    Bound = 1,
    /// Administratively revoked, regardless of binding.
    Disabled = 2,
}

impl LicenseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unused => "unused",
            Self::Bound => "bound",
            Self::Disabled => "disabled",
        }
    }
}

impl std::str::FromStr for LicenseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unused" | "0" => Ok(Self::Unused),
            "bound" | "used" | "1" => Ok(Self::Bound),
            "disabled" | "2" => Ok(Self::Disabled),
            other => Err(format!("unknown license status '{}'", other)),
        }
    }
}

/// Timestamps are unix seconds in the table; sqlx decodes them directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct LicenseRecord {
    pub id: i64,
    #[sqlx(rename = "license_key")]
    pub key: String,
    pub status: LicenseStatus,
    pub device_id: Option<String>,
    pub duration_days: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

impl LicenseRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A license about to be inserted. New licenses always start `Unused`.
#[derive(Debug, Clone)]
pub struct NewLicense {
    pub key: String,
    pub duration_days: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub note: Option<String>,
}

/// Partial update. `None` leaves a column untouched; the nested `Option`
/// on nullable columns distinguishes "set to NULL" from "leave alone".
#[derive(Debug, Clone, Default)]
pub struct LicensePatch {
    pub status: Option<LicenseStatus>,
    pub device_id: Option<Option<String>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<Option<DateTime<Utc>>>,
    pub note: Option<Option<String>>,
}

impl LicensePatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.device_id.is_none()
            && self.expires_at.is_none()
            && self.last_used_at.is_none()
            && self.note.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LicenseFilter {
    pub status: Option<LicenseStatus>,
    /// Substring match on key, device id and note.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub last_page: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompactionReport {
    pub reordered_count: i64,
    pub new_max_id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, FromRow)]
pub struct LicenseStats {
    pub total: i64,
    pub unused: i64,
    pub bound: i64,
    pub disabled: i64,
    pub expiring_within_7_days: i64,
}
