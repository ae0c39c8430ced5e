use keyward_db::repositories::{LicenseRepository, LicenseStore, LogRepository};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::PanelConfig;
use crate::services::{
    AuditSink, KeyGenerator, LifecycleAdmin, RateLimiter, VerificationService,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PanelConfig>,
    pub verification: Arc<VerificationService>,
    pub admin: Arc<LifecycleAdmin>,
    pub limiter: Arc<RateLimiter>,
    pub logs: LogRepository,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Wires every service from its collaborators. Called once at startup.
    pub fn new(
        config: PanelConfig,
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        keys: KeyGenerator,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let store: Arc<dyn LicenseStore> = Arc::new(LicenseRepository::new(pool.clone()));
        Self::with_store(config, store, LogRepository::new(pool), clock, keys, audit)
    }

    pub fn with_store(
        config: PanelConfig,
        store: Arc<dyn LicenseStore>,
        logs: LogRepository,
        clock: Arc<dyn Clock>,
        keys: KeyGenerator,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));

        let verification = Arc::new(VerificationService::new(
            store.clone(),
            limiter.clone(),
            audit.clone(),
            clock.clone(),
        ));
        let admin = Arc::new(LifecycleAdmin::new(
            store,
            Arc::new(keys),
            config.key_format.clone(),
            audit,
            clock.clone(),
        ));

        Self {
            config: Arc::new(config),
            verification,
            admin,
            limiter,
            logs,
            clock,
        }
    }
}
