use chrono::{DateTime, Utc};
use keyward_db::models::license::{LicenseRecord, LicenseStatus};
use serde::Serialize;

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Entitlement {
    pub license_id: i64,
    pub expires_at: DateTime<Utc>,
    pub remaining_days: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// First successful verification; the license is now bound to the caller.
    BoundNow(Entitlement),
    Verified(Entitlement),
    NotFound,
    Disabled,
    Expired,
    DeviceMismatch,
    RateLimited,
}

impl VerificationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::BoundNow(_) | Self::Verified(_))
    }

    pub fn entitlement(&self) -> Option<&Entitlement> {
        match self {
            Self::BoundNow(e) | Self::Verified(e) => Some(e),
            _ => None,
        }
    }

    pub fn remaining_days(&self) -> Option<i64> {
        self.entitlement().map(|e| e.remaining_days)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BoundNow(_) => "bound",
            Self::Verified(_) => "verified",
            Self::NotFound => "not_found",
            Self::Disabled => "disabled",
            Self::Expired => "expired",
            Self::DeviceMismatch => "device_mismatch",
            Self::RateLimited => "rate_limited",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::BoundNow(_) => "License verified and bound to this device",
            Self::Verified(_) => "License verified",
            Self::NotFound => "License does not exist",
            Self::Disabled => "License has been disabled",
            Self::Expired => "License has expired",
            Self::DeviceMismatch => "License is bound to another device",
            Self::RateLimited => "Too many requests, please try again later",
        }
    }
}

/// What the caller must persist for a verification to take effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Terminal rejection, nothing to write.
    Reject(VerificationOutcome),
    /// Claim the unbound license for the device.
    Bind(Entitlement),
    /// Same device again; only `last_used_at` moves.
    Refresh(Entitlement),
}

pub struct LicenseStateMachine;

impl LicenseStateMachine {
    /// Decides a verification against the stored record. Disabled wins over
    /// expiry, and expiry is checked before any binding so an expired unbound
    /// license never binds.
    pub fn decide(record: Option<&LicenseRecord>, device_id: &str, now: DateTime<Utc>) -> Transition {
        let Some(record) = record else {
            return Transition::Reject(VerificationOutcome::NotFound);
        };

        if record.status == LicenseStatus::Disabled {
            return Transition::Reject(VerificationOutcome::Disabled);
        }

        if record.is_expired_at(now) {
            return Transition::Reject(VerificationOutcome::Expired);
        }

        let entitlement = Entitlement {
            license_id: record.id,
            expires_at: record.expires_at,
            remaining_days: remaining_days(record.expires_at, now),
        };

        match record.device_id.as_deref() {
            None => Transition::Bind(entitlement),
            Some(bound) if bound == device_id => Transition::Refresh(entitlement),
            Some(_) => Transition::Reject(VerificationOutcome::DeviceMismatch),
        }
    }
}

/// Whole days left, rounded up, never negative.
pub fn remaining_days(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (expires_at - now).num_milliseconds();
    if millis <= 0 {
        return 0;
    }
    (millis + DAY_MILLIS - 1) / DAY_MILLIS
}
