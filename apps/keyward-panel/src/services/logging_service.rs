use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keyward_db::models::audit::{NewAdminLog, NewUsageLog};
use keyward_db::repositories::LogRepository;
use serde::Serialize;
use tracing::{info, warn};

pub const VERIFY_OPERATION: &str = "license.verify";

/// Who is calling, as far as the transport layer can tell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallerInfo {
    pub ip: String,
    pub user_agent: Option<String>,
}

impl CallerInfo {
    pub fn new(ip: impl Into<String>, user_agent: Option<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent,
        }
    }

    /// Identity used for operations started from the command line.
    pub fn local_cli() -> Self {
        Self::new("127.0.0.1", Some(format!("keyward-cli/{}", env!("CARGO_PKG_VERSION"))))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub operation: &'static str,
    /// License key, or a description of the ids touched.
    pub subject: String,
    pub device_id: Option<String>,
    pub outcome: String,
    pub success: bool,
    pub ip: String,
    pub user_agent: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        operation: &'static str,
        subject: impl Into<String>,
        outcome: impl Into<String>,
        success: bool,
        caller: &CallerInfo,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            operation,
            subject: subject.into(),
            device_id: None,
            outcome: outcome.into(),
            success,
            ip: caller.ip.clone(),
            user_agent: caller.user_agent.clone(),
            at,
        }
    }

    pub fn with_device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }
}

/// Receives one event per verification attempt and per admin mutation.
/// Implementations must not fail the calling operation.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Writes verification attempts to `usage_logs` and everything else to
/// `admin_logs`.
pub struct LoggingService {
    logs: LogRepository,
}

impl LoggingService {
    pub fn new(logs: LogRepository) -> Self {
        Self { logs }
    }
}

#[async_trait]
impl AuditSink for LoggingService {
    async fn record(&self, event: AuditEvent) {
        info!(
            operation = event.operation,
            subject = %event.subject,
            outcome = %event.outcome,
            success = event.success,
            ip = %event.ip,
            "audit"
        );

        let result = if event.operation == VERIFY_OPERATION {
            self.logs
                .insert_usage(&NewUsageLog {
                    license_key: event.subject,
                    device_id: event.device_id,
                    outcome: event.outcome,
                    success: event.success,
                    ip_address: Some(event.ip),
                    user_agent: event.user_agent,
                    created_at: event.at,
                })
                .await
        } else {
            self.logs
                .insert_admin(&NewAdminLog {
                    action: event.operation.to_string(),
                    details: Some(event.subject),
                    outcome: event.outcome,
                    ip_address: Some(event.ip),
                    user_agent: event.user_agent,
                    created_at: event.at,
                })
                .await
        };

        if let Err(e) = result {
            warn!("Failed to persist audit event: {}", e);
        }
    }
}
