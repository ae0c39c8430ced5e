use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct UsageLog {
    pub id: i64,
    pub license_key: String,
    pub device_id: Option<String>,
    pub outcome: String,
    pub success: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AdminLog {
    pub id: i64,
    pub action: String,
    pub details: Option<String>,
    pub outcome: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, FromRow)]
pub struct UsageStats {
    pub total_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
}

#[derive(Debug, Clone)]
pub struct NewUsageLog {
    pub license_key: String,
    pub device_id: Option<String>,
    pub outcome: String,
    pub success: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAdminLog {
    pub action: String,
    pub details: Option<String>,
    pub outcome: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Filters for browsing `usage_logs`. Key and device match as substrings,
/// `outcome` exactly, and the time bounds are inclusive.
#[derive(Debug, Clone, Default)]
pub struct UsageLogFilter {
    pub license_key: Option<String>,
    pub device_id: Option<String>,
    pub outcome: Option<String>,
    pub success: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}
