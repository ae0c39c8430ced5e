use keyward_db::repositories::LicenseStore;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{LicenseError, LicenseResult};
use crate::services::license_service::{LicenseStateMachine, Transition, VerificationOutcome};
use crate::services::logging_service::{AuditEvent, AuditSink, CallerInfo, VERIFY_OPERATION};
use crate::services::rate_limit_service::{RateLimiter, RouteClass};

// A lost conditional write is re-decided against fresh state this many times.
const MAX_ATTEMPTS: usize = 2;

pub struct VerificationService {
    store: Arc<dyn LicenseStore>,
    limiter: Arc<RateLimiter>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl VerificationService {
    pub fn new(
        store: Arc<dyn LicenseStore>,
        limiter: Arc<RateLimiter>,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            limiter,
            audit,
            clock,
        }
    }

    /// Rate check, state transition, persistence and audit for one
    /// verification attempt. Rejections come back as outcomes; only store
    /// failures and repeatedly lost races are errors.
    pub async fn verify(
        &self,
        caller: &CallerInfo,
        key: &str,
        device_id: &str,
    ) -> LicenseResult<VerificationOutcome> {
        let now = self.clock.now();

        let result = if self.limiter.allow(&caller.ip, RouteClass::Verify, now) {
            self.resolve(key, device_id, now).await
        } else {
            warn!("Verification rate limit exceeded for {}", caller.ip);
            Ok(VerificationOutcome::RateLimited)
        };

        let (outcome, success) = match &result {
            Ok(outcome) => (outcome.as_str(), outcome.is_success()),
            Err(e) => (e.kind(), false),
        };
        self.audit
            .record(
                AuditEvent::new(VERIFY_OPERATION, key, outcome, success, caller, now)
                    .with_device(device_id),
            )
            .await;

        result
    }

    async fn resolve(
        &self,
        key: &str,
        device_id: &str,
        now: chrono::DateTime<chrono::Utc>,
    ) -> LicenseResult<VerificationOutcome> {
        for attempt in 1..=MAX_ATTEMPTS {
            let record = self.store.find_by_key(key).await?;

            match LicenseStateMachine::decide(record.as_ref(), device_id, now) {
                Transition::Reject(outcome) => {
                    debug!("Verification of {} rejected: {}", key, outcome.as_str());
                    return Ok(outcome);
                }
                Transition::Bind(entitlement) => {
                    if self.store.bind_device(key, device_id, now).await? {
                        return Ok(VerificationOutcome::BoundNow(entitlement));
                    }
                }
                Transition::Refresh(entitlement) => {
                    if self.store.touch(key, device_id, now).await? {
                        return Ok(VerificationOutcome::Verified(entitlement));
                    }
                }
            }

            warn!("License {} changed during verification (attempt {})", key, attempt);
        }

        Err(LicenseError::Conflict(format!(
            "license {} kept changing during verification",
            key
        )))
    }
}
