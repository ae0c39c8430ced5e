use chrono::Duration;
use keyward_db::StoreError;
use keyward_db::models::license::{
    CompactionReport, LicenseFilter, LicensePatch, LicenseRecord, LicenseStats, LicenseStatus,
    NewLicense, Page,
};
use keyward_db::repositories::LicenseStore;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{LicenseError, LicenseResult};
use crate::services::key_service::{KeyFormat, KeyGenerator};
use crate::services::logging_service::{AuditEvent, AuditSink, CallerInfo};

pub const MAX_BATCH: i64 = 1000;
pub const MAX_DURATION_DAYS: i64 = 3650;
const KEY_ATTEMPTS: usize = 3;

/// Administrative lifecycle of licenses. Every mutation is audited, whether
/// it succeeds or not.
pub struct LifecycleAdmin {
    store: Arc<dyn LicenseStore>,
    keys: Arc<KeyGenerator>,
    key_format: KeyFormat,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl LifecycleAdmin {
    pub fn new(
        store: Arc<dyn LicenseStore>,
        keys: Arc<KeyGenerator>,
        key_format: KeyFormat,
        audit: Arc<dyn AuditSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            keys,
            key_format,
            audit,
            clock,
        }
    }

    pub fn key_format(&self) -> &KeyFormat {
        &self.key_format
    }

    /// Generates and inserts `count` licenses valid for `duration_days` from
    /// now. Each insert reuses the first id gap when there is one. Licenses
    /// created before a failure are kept.
    pub async fn create_many(
        &self,
        caller: &CallerInfo,
        count: i64,
        duration_days: i64,
        format: Option<&KeyFormat>,
    ) -> LicenseResult<Vec<i64>> {
        let mut created = Vec::new();
        let result = self
            .create_batch(caller, count, duration_days, format, &mut created)
            .await;

        if let Err(e) = &result {
            let subject = format!("count={} created={}", count, created.len());
            self.record(caller, "license.create", subject, Err(e)).await;
        } else {
            info!("Created {} licenses valid for {} days", created.len(), duration_days);
        }

        result.map(|_| created)
    }

    async fn create_batch(
        &self,
        caller: &CallerInfo,
        count: i64,
        duration_days: i64,
        format: Option<&KeyFormat>,
        created: &mut Vec<i64>,
    ) -> LicenseResult<()> {
        if !(1..=MAX_BATCH).contains(&count) {
            return Err(LicenseError::InvalidArgument(format!(
                "count must be between 1 and {}",
                MAX_BATCH
            )));
        }
        if !(1..=MAX_DURATION_DAYS).contains(&duration_days) {
            return Err(LicenseError::InvalidArgument(format!(
                "duration must be between 1 and {} days",
                MAX_DURATION_DAYS
            )));
        }
        let format = match format {
            Some(custom) => {
                custom
                    .validate()
                    .map_err(|e| LicenseError::InvalidArgument(e.to_string()))?;
                custom
            }
            None => &self.key_format,
        };

        for _ in 0..count {
            let (id, key) = self.insert_fresh(format, duration_days).await?;
            created.push(id);
            self.record(caller, "license.create", describe(id, Some(&key)), Ok(()))
                .await;
        }
        Ok(())
    }

    async fn insert_fresh(&self, format: &KeyFormat, duration_days: i64) -> LicenseResult<(i64, String)> {
        for attempt in 1..=KEY_ATTEMPTS {
            let key = self
                .keys
                .generate(format)
                .map_err(|e| LicenseError::InvalidArgument(e.to_string()))?;
            let now = self.clock.now();
            let license = NewLicense {
                key: key.clone(),
                duration_days,
                created_at: now,
                expires_at: now + Duration::days(duration_days),
                note: None,
            };

            match self.store.create(&license).await {
                Ok(id) => return Ok((id, key)),
                Err(StoreError::DuplicateKey) => {
                    warn!("Generated key collided (attempt {}/{})", attempt, KEY_ATTEMPTS);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LicenseError::DuplicateKey)
    }

    pub async fn find_by_key(&self, key: &str) -> LicenseResult<Option<LicenseRecord>> {
        Ok(self.store.find_by_key(key).await?)
    }

    pub async fn get(&self, id: i64) -> LicenseResult<LicenseRecord> {
        self.store.find_by_id(id).await?.ok_or(LicenseError::NotFound)
    }

    pub async fn list(
        &self,
        filter: &LicenseFilter,
        page: i64,
        per_page: i64,
    ) -> LicenseResult<Page<LicenseRecord>> {
        Ok(self.store.paginate(filter, page, per_page).await?)
    }

    pub async fn stats(&self) -> LicenseResult<LicenseStats> {
        Ok(self.store.stats(self.clock.now()).await?)
    }

    pub async fn disable(&self, caller: &CallerInfo, id: i64) -> LicenseResult<LicenseRecord> {
        let patch = LicensePatch {
            status: Some(LicenseStatus::Disabled),
            ..Default::default()
        };
        self.apply(caller, "license.disable", id, patch).await
    }

    /// Manual override; a never-bound license stays without a device and
    /// binds on its next verification.
    pub async fn enable(&self, caller: &CallerInfo, id: i64) -> LicenseResult<LicenseRecord> {
        let patch = LicensePatch {
            status: Some(LicenseStatus::Bound),
            ..Default::default()
        };
        self.apply(caller, "license.enable", id, patch).await
    }

    pub async fn unbind(&self, caller: &CallerInfo, id: i64) -> LicenseResult<LicenseRecord> {
        let patch = LicensePatch {
            status: Some(LicenseStatus::Unused),
            device_id: Some(None),
            last_used_at: Some(None),
            ..Default::default()
        };
        self.apply(caller, "license.unbind", id, patch).await
    }

    /// Moves `expires_at` by `delta_days`; negative values shorten the grant.
    pub async fn extend_expiry(
        &self,
        caller: &CallerInfo,
        id: i64,
        delta_days: i64,
    ) -> LicenseResult<LicenseRecord> {
        if delta_days == 0 || delta_days.abs() > MAX_DURATION_DAYS {
            let err = LicenseError::InvalidArgument(format!(
                "days must be non-zero and within +/-{}",
                MAX_DURATION_DAYS
            ));
            self.record(caller, "license.extend", describe(id, None), Err(&err))
                .await;
            return Err(err);
        }

        let result = self
            .store
            .shift_expiry(id, Duration::days(delta_days))
            .await
            .map_err(LicenseError::from);
        let subject = format!(
            "{} days={:+}",
            describe(id, result.as_ref().ok().map(|r| r.key.as_str())),
            delta_days
        );
        self.record(caller, "license.extend", subject, result.as_ref().map(|_| ()))
            .await;
        result
    }

    /// Blank notes clear the column.
    pub async fn update_note(
        &self,
        caller: &CallerInfo,
        id: i64,
        note: Option<String>,
    ) -> LicenseResult<LicenseRecord> {
        let note = note
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        let patch = LicensePatch {
            note: Some(note),
            ..Default::default()
        };
        self.apply(caller, "license.note", id, patch).await
    }

    pub async fn delete(&self, caller: &CallerInfo, id: i64) -> LicenseResult<()> {
        let result = match self.get(id).await {
            Ok(record) => self.store.delete(id).await.map(|_| record).map_err(Into::into),
            Err(e) => Err(e),
        };
        let subject = describe(id, result.as_ref().ok().map(|r| r.key.as_str()));
        self.record(caller, "license.delete", subject, result.as_ref().map(|_| ()))
            .await;
        result.map(|_| ())
    }

    /// Renumbers every license to `1..=N`. Fails with `Conflict` while other
    /// mutations are in flight.
    pub async fn compact_all(&self, caller: &CallerInfo) -> LicenseResult<CompactionReport> {
        let result = self.store.compact_all().await.map_err(LicenseError::from);
        let subject = match &result {
            Ok(report) => format!(
                "reordered={} max_id={}",
                report.reordered_count, report.new_max_id
            ),
            Err(_) => "all".to_string(),
        };
        self.record(caller, "license.compact", subject, result.as_ref().map(|_| ()))
            .await;
        result
    }

    async fn apply(
        &self,
        caller: &CallerInfo,
        operation: &'static str,
        id: i64,
        patch: LicensePatch,
    ) -> LicenseResult<LicenseRecord> {
        let result = match self.get(id).await {
            Ok(_) => match self.store.update(id, &patch).await {
                Ok(()) => self.get(id).await,
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e),
        };
        let subject = describe(id, result.as_ref().ok().map(|r| r.key.as_str()));
        self.record(caller, operation, subject, result.as_ref().map(|_| ()))
            .await;
        result
    }

    async fn record(
        &self,
        caller: &CallerInfo,
        operation: &'static str,
        subject: String,
        result: Result<(), &LicenseError>,
    ) {
        let (outcome, success) = match result {
            Ok(()) => ("ok", true),
            Err(e) => (e.kind(), false),
        };
        self.audit
            .record(AuditEvent::new(
                operation,
                subject,
                outcome,
                success,
                caller,
                self.clock.now(),
            ))
            .await;
    }
}

fn describe(id: i64, key: Option<&str>) -> String {
    match key {
        Some(key) => format!("id={} key={}", id, key),
        None => format!("id={}", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{harness, harness_with_keys};
    use chrono::Duration;
    use rand::{SeedableRng, rngs::StdRng};

    fn admin_caller() -> CallerInfo {
        CallerInfo::new("192.168.1.10", Some("admin-ui".to_string()))
    }

    #[tokio::test]
    async fn test_create_many_sets_expiry_from_now() {
        let h = harness().await;
        let ids = h.state.admin.create_many(&admin_caller(), 3, 30, None).await.unwrap();
        assert_eq!(ids, vec![1, 2, 3]);

        for id in ids {
            let record = h.state.admin.get(id).await.unwrap();
            assert_eq!(record.status, LicenseStatus::Unused);
            assert_eq!(record.duration_days, 30);
            assert_eq!(record.created_at, h.clock.now());
            assert_eq!(record.expires_at, h.clock.now() + Duration::days(30));
            assert_eq!(record.key.len(), 18);
            assert!(record.key.starts_with("zz"));
        }
    }

    #[tokio::test]
    async fn test_create_many_validates_arguments() {
        let h = harness().await;
        let admin = &h.state.admin;
        let caller = admin_caller();

        for (count, days) in [(0, 30), (1001, 30), (1, 0), (1, 3651)] {
            assert!(matches!(
                admin.create_many(&caller, count, days, None).await,
                Err(LicenseError::InvalidArgument(_))
            ));
        }

        let bad_formats = [
            KeyFormat {
                prefix: "toolong".to_string(),
                length: 4,
                ..KeyFormat::default()
            },
            KeyFormat {
                length: 200_000,
                ..KeyFormat::default()
            },
            KeyFormat {
                prefix: "x".repeat(64),
                length: 100,
                ..KeyFormat::default()
            },
        ];
        for format in &bad_formats {
            assert!(matches!(
                admin.create_many(&caller, 3, 30, Some(format)).await,
                Err(LicenseError::InvalidArgument(_))
            ));
        }
        assert_eq!(admin.stats().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn test_create_many_with_custom_format() {
        let h = harness().await;
        let format = KeyFormat {
            prefix: "PRO-".to_string(),
            length: 12,
            charset: "ABCDEF".to_string(),
        };
        let ids = h.state.admin.create_many(&admin_caller(), 2, 7, Some(&format)).await.unwrap();
        for id in ids {
            let key = h.state.admin.get(id).await.unwrap().key;
            assert!(crate::services::key_service::validate_format(&key, &format));
        }
    }

    #[tokio::test]
    async fn test_colliding_key_is_regenerated() {
        let h = harness_with_keys(KeyGenerator::with_rng(StdRng::seed_from_u64(77))).await;
        let twin = KeyGenerator::with_rng(StdRng::seed_from_u64(77));
        let taken = twin.generate(&KeyFormat::default()).unwrap();
        let now = h.clock.now();
        h.repo
            .create(&NewLicense {
                key: taken.clone(),
                duration_days: 1,
                created_at: now,
                expires_at: now + Duration::days(1),
                note: None,
            })
            .await
            .unwrap();

        let ids = h.state.admin.create_many(&admin_caller(), 1, 30, None).await.unwrap();
        let record = h.state.admin.get(ids[0]).await.unwrap();
        assert_ne!(record.key, taken);
        assert_eq!(h.state.admin.stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_exhausted_key_space_surfaces_duplicate_key() {
        let h = harness().await;
        let tiny = KeyFormat {
            prefix: "zz".to_string(),
            length: 3,
            charset: "a".to_string(),
        };
        h.state.admin.create_many(&admin_caller(), 1, 30, Some(&tiny)).await.unwrap();

        let err = h
            .state
            .admin
            .create_many(&admin_caller(), 1, 30, Some(&tiny))
            .await
            .unwrap_err();
        assert!(matches!(err, LicenseError::DuplicateKey));

        let last = h.audit.events().pop().unwrap();
        assert_eq!(last.operation, "license.create");
        assert_eq!(last.outcome, "duplicate_key");
        assert!(!last.success);
    }

    #[tokio::test]
    async fn test_status_overrides() {
        let h = harness().await;
        let caller = admin_caller();
        let id = h.state.admin.create_many(&caller, 1, 30, None).await.unwrap()[0];

        let disabled = h.state.admin.disable(&caller, id).await.unwrap();
        assert_eq!(disabled.status, LicenseStatus::Disabled);

        let enabled = h.state.admin.enable(&caller, id).await.unwrap();
        assert_eq!(enabled.status, LicenseStatus::Bound);
        assert_eq!(enabled.device_id, None);
    }

    #[tokio::test]
    async fn test_unbind_clears_binding() {
        let h = harness().await;
        let caller = admin_caller();
        let id = h.state.admin.create_many(&caller, 1, 30, None).await.unwrap()[0];
        let key = h.state.admin.get(id).await.unwrap().key;
        h.state.verification.verify(&caller, &key, "pc-1").await.unwrap();

        let record = h.state.admin.unbind(&caller, id).await.unwrap();
        assert_eq!(record.status, LicenseStatus::Unused);
        assert_eq!(record.device_id, None);
        assert_eq!(record.last_used_at, None);
    }

    #[tokio::test]
    async fn test_extend_expiry_both_directions() {
        let h = harness().await;
        let caller = admin_caller();
        let id = h.state.admin.create_many(&caller, 1, 30, None).await.unwrap()[0];
        let original = h.state.admin.get(id).await.unwrap();

        let longer = h.state.admin.extend_expiry(&caller, id, 10).await.unwrap();
        assert_eq!(longer.expires_at, original.expires_at + Duration::days(10));
        assert_eq!(longer.status, original.status);

        let shorter = h.state.admin.extend_expiry(&caller, id, -25).await.unwrap();
        assert_eq!(shorter.expires_at, original.expires_at - Duration::days(15));

        for bad in [0, 3651, -3651] {
            assert!(matches!(
                h.state.admin.extend_expiry(&caller, id, bad).await,
                Err(LicenseError::InvalidArgument(_))
            ));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_extends_are_not_lost() {
        let h = harness().await;
        let caller = admin_caller();
        let id = h.state.admin.create_many(&caller, 1, 30, None).await.unwrap()[0];
        let original = h.state.admin.get(id).await.unwrap();

        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let admin = h.state.admin.clone();
                let caller = caller.clone();
                tokio::spawn(async move { admin.extend_expiry(&caller, id, 1).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = h.state.admin.get(id).await.unwrap();
        assert_eq!(stored.expires_at, original.expires_at + Duration::days(40));
        let extends = h
            .audit
            .operations()
            .into_iter()
            .filter(|op| *op == "license.extend")
            .count();
        assert_eq!(extends, 40);
    }

    #[tokio::test]
    async fn test_note_update_and_clear() {
        let h = harness().await;
        let caller = admin_caller();
        let id = h.state.admin.create_many(&caller, 1, 30, None).await.unwrap()[0];

        let noted = h
            .state
            .admin
            .update_note(&caller, id, Some("  reseller batch 4 ".to_string()))
            .await
            .unwrap();
        assert_eq!(noted.note.as_deref(), Some("reseller batch 4"));

        let cleared = h.state.admin.update_note(&caller, id, Some("   ".to_string())).await.unwrap();
        assert_eq!(cleared.note, None);
    }

    #[tokio::test]
    async fn test_mutations_on_missing_license_are_not_found_and_audited() {
        let h = harness().await;
        let caller = admin_caller();

        assert!(matches!(h.state.admin.disable(&caller, 42).await, Err(LicenseError::NotFound)));
        assert!(matches!(h.state.admin.unbind(&caller, 42).await, Err(LicenseError::NotFound)));
        assert!(matches!(h.state.admin.extend_expiry(&caller, 42, 5).await, Err(LicenseError::NotFound)));
        assert!(matches!(h.state.admin.delete(&caller, 42).await, Err(LicenseError::NotFound)));
        assert!(matches!(h.state.admin.get(42).await, Err(LicenseError::NotFound)));

        let events = h.audit.events();
        assert_eq!(
            h.audit.operations(),
            vec!["license.disable", "license.unbind", "license.extend", "license.delete"]
        );
        assert!(events.iter().all(|e| !e.success && e.outcome == "not_found"));
        assert_eq!(events[0].subject, "id=42");
        assert_eq!(events[0].ip, "192.168.1.10");
    }

    #[tokio::test]
    async fn test_delete_then_create_reuses_gap() {
        let h = harness().await;
        let caller = admin_caller();
        h.state.admin.create_many(&caller, 3, 30, None).await.unwrap();

        h.state.admin.delete(&caller, 2).await.unwrap();
        let ids = h.state.admin.create_many(&caller, 2, 30, None).await.unwrap();
        assert_eq!(ids, vec![2, 4]);
    }

    #[tokio::test]
    async fn test_compaction_through_admin() {
        let h = harness().await;
        let caller = admin_caller();
        h.state.admin.create_many(&caller, 7, 30, None).await.unwrap();
        for id in [2, 4, 5, 6] {
            h.state.admin.delete(&caller, id).await.unwrap();
        }

        let report = h.state.admin.compact_all(&caller).await.unwrap();
        assert_eq!(report.new_max_id, 3);
        assert_eq!(report.reordered_count, 3);

        let ids = h.state.admin.create_many(&caller, 1, 30, None).await.unwrap();
        assert_eq!(ids, vec![4]);

        let compact = h
            .audit
            .events()
            .into_iter()
            .find(|e| e.operation == "license.compact")
            .unwrap();
        assert_eq!(compact.subject, "reordered=3 max_id=3");
    }

    #[tokio::test]
    async fn test_stats_reflect_lifecycle() {
        let h = harness().await;
        let caller = admin_caller();
        let ids = h.state.admin.create_many(&caller, 4, 5, None).await.unwrap();
        h.state.admin.create_many(&caller, 1, 60, None).await.unwrap();

        let key = h.state.admin.get(ids[0]).await.unwrap().key;
        h.state.verification.verify(&caller, &key, "pc").await.unwrap();
        h.state.admin.disable(&caller, ids[1]).await.unwrap();

        let stats = h.state.admin.stats().await.unwrap();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.unused, 3);
        assert_eq!(stats.bound, 1);
        assert_eq!(stats.disabled, 1);
        assert_eq!(stats.expiring_within_7_days, 4);
    }
}
