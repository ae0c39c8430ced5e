use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Verify,
    /// Failed admin credential checks; not derived from the path.
    Login,
    Api,
    Other,
}

impl RouteClass {
    pub fn for_path(path: &str) -> Self {
        if path.starts_with("/api/verify") {
            Self::Verify
        } else if path.starts_with("/api/") {
            Self::Api
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimit {
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub verify: RateLimit,
    pub login: RateLimit,
    pub api: RateLimit,
    pub default: RateLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            verify: RateLimit::new(10, 60),
            login: RateLimit::new(5, 60),
            api: RateLimit::new(100, 60),
            default: RateLimit::new(1000, 60),
        }
    }
}

impl RateLimitConfig {
    pub fn limit_for(&self, class: RouteClass) -> RateLimit {
        match class {
            RouteClass::Verify => self.verify,
            RouteClass::Login => self.login,
            RouteClass::Api => self.api,
            RouteClass::Other => self.default,
        }
    }
}

/// In-process sliding-window counter keyed by (identity, route class).
/// State is lost on restart.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<(String, RouteClass), Vec<DateTime<Utc>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admits and records the request unless the window is already full.
    pub fn allow(&self, identity: &str, class: RouteClass, now: DateTime<Utc>) -> bool {
        let limit = self.config.limit_for(class);
        let window = Duration::seconds(limit.window_secs as i64);

        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let hits = windows.entry((identity.to_string(), class)).or_default();
        hits.retain(|t| now - *t < window);

        if hits.len() >= limit.max_requests as usize {
            debug!("Rate limit reached for {} on {:?}", identity, class);
            return false;
        }

        hits.push(now);
        true
    }

    /// True when the window is full, without recording anything.
    pub fn is_exhausted(&self, identity: &str, class: RouteClass, now: DateTime<Utc>) -> bool {
        let limit = self.config.limit_for(class);
        let window = Duration::seconds(limit.window_secs as i64);

        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let live = windows
            .get(&(identity.to_string(), class))
            .map(|hits| hits.iter().filter(|t| now - **t < window).count())
            .unwrap_or(0);
        live >= limit.max_requests as usize
    }

    /// Drops keys whose entries have all aged out. Returns how many were removed.
    pub fn purge_idle(&self, now: DateTime<Utc>) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|(_, class), hits| {
            let window = Duration::seconds(self.config.limit_for(*class).window_secs as i64);
            hits.retain(|t| now - *t < window);
            !hits.is_empty()
        });
        before - windows.len()
    }

    #[cfg(test)]
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
