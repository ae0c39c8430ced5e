use keyward_db::models::audit::UsageLog;
use serde::Serialize;

use crate::error::LicenseResult;

#[derive(Serialize)]
struct UsageRow<'a> {
    created_at: String,
    license_key: &'a str,
    device_id: Option<&'a str>,
    outcome: &'a str,
    success: bool,
    ip_address: Option<&'a str>,
    user_agent: Option<&'a str>,
}

/// Renders usage entries as CSV with a header row, one line per attempt.
pub fn usage_logs_csv(logs: &[UsageLog]) -> LicenseResult<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for log in logs {
        writer.serialize(UsageRow {
            created_at: log.created_at.to_rfc3339(),
            license_key: &log.license_key,
            device_id: log.device_id.as_deref(),
            outcome: &log.outcome,
            success: log.success,
            ip_address: log.ip_address.as_deref(),
            user_agent: log.user_agent.as_deref(),
        })?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))?;
    Ok(bytes)
}
