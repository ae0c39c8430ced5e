use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::like_pattern;
use crate::error::{StoreError, StoreResult};
use crate::models::license::{
    CompactionReport, LicenseFilter, LicensePatch, LicenseRecord, LicenseStats, LicenseStatus,
    NewLicense, Page,
};

pub const MAX_PER_PAGE: i64 = 100;

/// Smallest positive id missing below the current maximum, or NULL.
const NEXT_GAP_SQL: &str = r#"
    SELECT MIN(gap) FROM (
        SELECT 1 AS gap
        WHERE EXISTS (SELECT 1 FROM licenses)
          AND NOT EXISTS (SELECT 1 FROM licenses WHERE id = 1)
        UNION ALL
        SELECT t1.id + 1 AS gap
        FROM licenses t1
        LEFT JOIN licenses t2 ON t2.id = t1.id + 1
        WHERE t2.id IS NULL
          AND t1.id < (SELECT MAX(id) FROM licenses)
    )
"#;

/// Durable table of license records.
#[async_trait]
pub trait LicenseStore: Send + Sync {
    async fn find_by_key(&self, key: &str) -> StoreResult<Option<LicenseRecord>>;

    async fn find_by_id(&self, id: i64) -> StoreResult<Option<LicenseRecord>>;

    /// Inserts at the first id gap when one exists, otherwise appends.
    async fn create(&self, license: &NewLicense) -> StoreResult<i64>;

    async fn find_reusable_id(&self) -> StoreResult<Option<i64>>;

    async fn update(&self, id: i64, patch: &LicensePatch) -> StoreResult<()>;

    /// Moves `expires_at` by `delta` in a single statement and returns the
    /// updated record.
    async fn shift_expiry(&self, id: i64, delta: Duration) -> StoreResult<LicenseRecord>;

    /// Binds `device_id` only if the license is still unbound and not
    /// disabled. Returns `false` when another writer got there first.
    /// Keyed by license key since compaction may renumber ids in between.
    async fn bind_device(&self, key: &str, device_id: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Advances `last_used_at` only while `device_id` still holds the binding.
    async fn touch(&self, key: &str, device_id: &str, now: DateTime<Utc>) -> StoreResult<bool>;

    async fn delete(&self, id: i64) -> StoreResult<()>;

    /// Renumbers every record to `1..=N` in ascending id order and resets the
    /// creation sequence to `N + 1`. All-or-nothing.
    async fn compact_all(&self) -> StoreResult<CompactionReport>;

    async fn paginate(
        &self,
        filter: &LicenseFilter,
        page: i64,
        per_page: i64,
    ) -> StoreResult<Page<LicenseRecord>>;

    async fn stats(&self, now: DateTime<Utc>) -> StoreResult<LicenseStats>;
}

#[derive(Debug, Clone)]
pub struct LicenseRepository {
    pool: SqlitePool,
    // Shared by every mutation, held exclusively by compaction.
    gate: Arc<RwLock<()>>,
}

impl LicenseRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            gate: Arc::new(RwLock::new(())),
        }
    }

    async fn reset_sequence_to_max(&self) {
        let result = sqlx::query(
            "UPDATE sqlite_sequence SET seq = (SELECT COALESCE(MAX(id), 0) FROM licenses) WHERE name = 'licenses'",
        )
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!("Failed to reset license id sequence: {}", e);
        }
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &LicenseFilter) {
    qb.push(" WHERE 1 = 1");

    if let Some(status) = filter.status {
        qb.push(" AND status = ").push_bind(status);
    }

    if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let pattern = like_pattern(term);
        qb.push(" AND (license_key LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR device_id LIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR note LIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
}

#[async_trait]
impl LicenseStore for LicenseRepository {
    async fn find_by_key(&self, key: &str) -> StoreResult<Option<LicenseRecord>> {
        let license = sqlx::query_as::<_, LicenseRecord>("SELECT * FROM licenses WHERE license_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(license)
    }

    async fn find_by_id(&self, id: i64) -> StoreResult<Option<LicenseRecord>> {
        let license = sqlx::query_as::<_, LicenseRecord>("SELECT * FROM licenses WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(license)
    }

    async fn create(&self, license: &NewLicense) -> StoreResult<i64> {
        let _shared = self.gate.read().await;

        // Gap lookup and insert run as one statement so two creates can't
        // claim the same hole.
        let sql = format!(
            r#"
            INSERT INTO licenses
                (id, license_key, status, device_id, duration_days, created_at, expires_at, last_used_at, note)
            VALUES (({}), ?, ?, NULL, ?, ?, ?, NULL, ?)
            RETURNING id
            "#,
            NEXT_GAP_SQL
        );

        let id: i64 = sqlx::query_scalar(&sql)
            .bind(&license.key)
            .bind(LicenseStatus::Unused)
            .bind(license.duration_days)
            .bind(license.created_at.timestamp())
            .bind(license.expires_at.timestamp())
            .bind(&license.note)
            .fetch_one(&self.pool)
            .await?;

        debug!("Created license {} with id {}", license.key, id);
        Ok(id)
    }

    async fn find_reusable_id(&self) -> StoreResult<Option<i64>> {
        let gap: Option<i64> = sqlx::query_scalar(NEXT_GAP_SQL)
            .fetch_one(&self.pool)
            .await?;
        Ok(gap)
    }

    async fn update(&self, id: i64, patch: &LicensePatch) -> StoreResult<()> {
        let _shared = self.gate.read().await;

        if patch.is_empty() {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM licenses WHERE id = ?)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
            return if exists { Ok(()) } else { Err(StoreError::NotFound(id)) };
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE licenses SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(status) = patch.status {
                set.push("status = ").push_bind_unseparated(status);
            }
            if let Some(device_id) = &patch.device_id {
                set.push("device_id = ").push_bind_unseparated(device_id.clone());
            }
            if let Some(expires_at) = patch.expires_at {
                set.push("expires_at = ").push_bind_unseparated(expires_at.timestamp());
            }
            if let Some(last_used_at) = patch.last_used_at {
                set.push("last_used_at = ")
                    .push_bind_unseparated(last_used_at.map(|t| t.timestamp()));
            }
            if let Some(note) = &patch.note {
                set.push("note = ").push_bind_unseparated(note.clone());
            }
        }
        qb.push(" WHERE id = ").push_bind(id);

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn shift_expiry(&self, id: i64, delta: Duration) -> StoreResult<LicenseRecord> {
        let _shared = self.gate.read().await;

        let license = sqlx::query_as::<_, LicenseRecord>(
            "UPDATE licenses SET expires_at = expires_at + ? WHERE id = ? RETURNING *",
        )
        .bind(delta.num_seconds())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        license.ok_or(StoreError::NotFound(id))
    }

    async fn bind_device(&self, key: &str, device_id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let _shared = self.gate.read().await;

        let result = sqlx::query(
            r#"
            UPDATE licenses
            SET device_id = ?, status = ?, last_used_at = ?
            WHERE license_key = ? AND device_id IS NULL AND status != ?
            "#,
        )
        .bind(device_id)
        .bind(LicenseStatus::Bound)
        .bind(now.timestamp())
        .bind(key)
        .bind(LicenseStatus::Disabled)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn touch(&self, key: &str, device_id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let _shared = self.gate.read().await;

        let result = sqlx::query(
            "UPDATE licenses SET last_used_at = ? WHERE license_key = ? AND device_id = ? AND status != ?",
        )
        .bind(now.timestamp())
        .bind(key)
        .bind(device_id)
        .bind(LicenseStatus::Disabled)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, id: i64) -> StoreResult<()> {
        let _shared = self.gate.read().await;

        let result = sqlx::query("DELETE FROM licenses WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        self.reset_sequence_to_max().await;
        Ok(())
    }

    async fn compact_all(&self) -> StoreResult<CompactionReport> {
        let _exclusive = self.gate.try_write().map_err(|_| StoreError::Busy)?;

        let mut tx = self.pool.begin().await?;

        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM licenses ORDER BY id ASC")
            .fetch_all(&mut *tx)
            .await?;

        // Ascending order guarantees the target id is always free: every
        // lower id has already been moved into 1..new_id.
        let mut moved = 0;
        for (idx, old_id) in ids.iter().enumerate() {
            let new_id = idx as i64 + 1;
            if new_id != *old_id {
                sqlx::query("UPDATE licenses SET id = ? WHERE id = ?")
                    .bind(new_id)
                    .bind(old_id)
                    .execute(&mut *tx)
                    .await?;
                moved += 1;
            }
        }

        let count = ids.len() as i64;
        sqlx::query("UPDATE sqlite_sequence SET seq = ? WHERE name = 'licenses'")
            .bind(count)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!("Compacted {} licenses ({} renumbered), next id {}", count, moved, count + 1);
        Ok(CompactionReport {
            reordered_count: count,
            new_max_id: count,
        })
    }

    async fn paginate(
        &self,
        filter: &LicenseFilter,
        page: i64,
        per_page: i64,
    ) -> StoreResult<Page<LicenseRecord>> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_PER_PAGE);
        let offset = (page - 1) * per_page;

        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM licenses");
        push_filter(&mut count_qb, filter);
        let total = count_qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM licenses");
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY id ASC LIMIT ")
            .push_bind(per_page)
            .push(" OFFSET ")
            .push_bind(offset);

        let data = qb
            .build_query_as::<LicenseRecord>()
            .fetch_all(&self.pool)
            .await?;

        Ok(Page {
            data,
            total,
            page,
            per_page,
            last_page: ((total + per_page - 1) / per_page).max(1),
        })
    }

    async fn stats(&self, now: DateTime<Utc>) -> StoreResult<LicenseStats> {
        let horizon = now + Duration::days(7);

        let stats = sqlx::query_as::<_, LicenseStats>(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 0 THEN 1 ELSE 0 END), 0) AS unused,
                COALESCE(SUM(CASE WHEN status = 1 THEN 1 ELSE 0 END), 0) AS bound,
                COALESCE(SUM(CASE WHEN status = 2 THEN 1 ELSE 0 END), 0) AS disabled,
                COALESCE(SUM(CASE WHEN expires_at BETWEEN ? AND ? THEN 1 ELSE 0 END), 0)
                    AS expiring_within_7_days
            FROM licenses
            "#,
        )
        .bind(now.timestamp())
        .bind(horizon.timestamp())
        .fetch_one(&self.pool)
        .await?;

        Ok(stats)
    }
}
