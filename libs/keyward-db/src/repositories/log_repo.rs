use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use super::like_pattern;
use crate::error::StoreResult;
use crate::models::audit::{AdminLog, NewAdminLog, NewUsageLog, UsageLog, UsageLogFilter, UsageStats};
use crate::models::license::Page;
use crate::repositories::license_repo::MAX_PER_PAGE;

/// Storage for verification attempts (`usage_logs`) and administrative
/// actions (`admin_logs`).
#[derive(Debug, Clone)]
pub struct LogRepository {
    pool: SqlitePool,
}

fn push_usage_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &UsageLogFilter) {
    qb.push(" WHERE 1 = 1");

    let term = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(like_pattern)
    };
    if let Some(pattern) = term(&filter.license_key) {
        qb.push(" AND license_key LIKE ").push_bind(pattern).push(" ESCAPE '\\'");
    }
    if let Some(pattern) = term(&filter.device_id) {
        qb.push(" AND device_id LIKE ").push_bind(pattern).push(" ESCAPE '\\'");
    }
    if let Some(outcome) = filter.outcome.as_deref().map(str::trim).filter(|o| !o.is_empty()) {
        qb.push(" AND outcome = ").push_bind(outcome.to_string());
    }
    if let Some(success) = filter.success {
        qb.push(" AND success = ").push_bind(success);
    }
    if let Some(since) = filter.since {
        qb.push(" AND created_at >= ").push_bind(since.timestamp());
    }
    if let Some(until) = filter.until {
        qb.push(" AND created_at <= ").push_bind(until.timestamp());
    }
}

impl LogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_usage(&self, entry: &NewUsageLog) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO usage_logs (license_key, device_id, outcome, success, ip_address, user_agent, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&entry.license_key)
        .bind(&entry.device_id)
        .bind(&entry.outcome)
        .bind(entry.success)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.created_at.timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn insert_admin(&self, entry: &NewAdminLog) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO admin_logs (action, details, outcome, ip_address, user_agent, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&entry.action)
        .bind(&entry.details)
        .bind(&entry.outcome)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.created_at.timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn license_history(&self, license_key: &str, limit: i64) -> StoreResult<Vec<UsageLog>> {
        let logs = sqlx::query_as::<_, UsageLog>(
            "SELECT * FROM usage_logs WHERE license_key = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(license_key)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    /// Every key a device has presented, newest first.
    pub async fn device_history(&self, device_id: &str, limit: i64) -> StoreResult<Vec<UsageLog>> {
        let logs = sqlx::query_as::<_, UsageLog>(
            "SELECT * FROM usage_logs WHERE device_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    pub async fn paginate_usage(
        &self,
        filter: &UsageLogFilter,
        page: i64,
        per_page: i64,
    ) -> StoreResult<Page<UsageLog>> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_PER_PAGE);

        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM usage_logs");
        push_usage_filter(&mut count_qb, filter);
        let total = count_qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM usage_logs");
        push_usage_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(per_page)
            .push(" OFFSET ")
            .push_bind((page - 1) * per_page);
        let data = qb.build_query_as::<UsageLog>().fetch_all(&self.pool).await?;

        Ok(Page {
            data,
            total,
            page,
            per_page,
            last_page: ((total + per_page - 1) / per_page).max(1),
        })
    }

    /// Newest matching entries, up to `limit`, for bulk export.
    pub async fn export_usage(&self, filter: &UsageLogFilter, limit: i64) -> StoreResult<Vec<UsageLog>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM usage_logs");
        push_usage_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ").push_bind(limit);
        let logs = qb.build_query_as::<UsageLog>().fetch_all(&self.pool).await?;
        Ok(logs)
    }

    pub async fn recent_admin_actions(&self, limit: i64) -> StoreResult<Vec<AdminLog>> {
        let logs = sqlx::query_as::<_, AdminLog>(
            "SELECT * FROM admin_logs ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    pub async fn usage_stats(&self) -> StoreResult<UsageStats> {
        let stats = sqlx::query_as::<_, UsageStats>(
            r#"
            SELECT
                COUNT(*) AS total_requests,
                COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS successful_requests,
                COALESCE(SUM(CASE WHEN success = 1 THEN 0 ELSE 1 END), 0) AS failed_requests
            FROM usage_logs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    /// Deletes usage and admin entries created before `cutoff`. Returns the
    /// number of rows removed across both tables.
    pub async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await?;

        let usage = sqlx::query("DELETE FROM usage_logs WHERE created_at < ?")
            .bind(cutoff.timestamp())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let admin = sqlx::query("DELETE FROM admin_logs WHERE created_at < ?")
            .bind(cutoff.timestamp())
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(usage + admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_in_memory;
    use chrono::{Duration, TimeZone};

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 8, 0, 0).unwrap()
    }

    fn usage(key: &str, outcome: &str, success: bool, created_at: DateTime<Utc>) -> NewUsageLog {
        NewUsageLog {
            license_key: key.to_string(),
            device_id: Some("device-1".to_string()),
            outcome: outcome.to_string(),
            success,
            ip_address: Some("10.0.0.1".to_string()),
            user_agent: Some("client/1.0".to_string()),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_usage_history_and_stats() {
        let repo = LogRepository::new(connect_in_memory().await.unwrap());
        repo.insert_usage(&usage("zz1", "bound", true, at(1))).await.unwrap();
        repo.insert_usage(&usage("zz1", "device_mismatch", false, at(2))).await.unwrap();
        repo.insert_usage(&usage("zz2", "not_found", false, at(3))).await.unwrap();

        let history = repo.license_history("zz1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].outcome, "device_mismatch");
        assert!(!history[0].success);
        assert_eq!(history[1].created_at, at(1));

        let stats = repo.usage_stats().await.unwrap();
        assert_eq!(
            stats,
            UsageStats {
                total_requests: 3,
                successful_requests: 1,
                failed_requests: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_paginate_usage_applies_filters() {
        let repo = LogRepository::new(connect_in_memory().await.unwrap());
        repo.insert_usage(&usage("zzalpha", "bound", true, at(1))).await.unwrap();
        repo.insert_usage(&usage("zzalpha", "device_mismatch", false, at(2))).await.unwrap();
        repo.insert_usage(&usage("zzbeta", "verified", true, at(3))).await.unwrap();
        let mut other_device = usage("zzbeta", "verified", true, at(4));
        other_device.device_id = Some("laptop-9".to_string());
        repo.insert_usage(&other_device).await.unwrap();

        let all = repo.paginate_usage(&UsageLogFilter::default(), 1, 3).await.unwrap();
        assert_eq!(all.total, 4);
        assert_eq!(all.last_page, 2);
        assert_eq!(all.data[0].created_at, at(4));

        let by_key = UsageLogFilter {
            license_key: Some("alpha".to_string()),
            ..Default::default()
        };
        assert_eq!(repo.paginate_usage(&by_key, 1, 10).await.unwrap().total, 2);

        let failures = UsageLogFilter {
            success: Some(false),
            ..Default::default()
        };
        let page = repo.paginate_usage(&failures, 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.data[0].outcome, "device_mismatch");

        let window = UsageLogFilter {
            since: Some(at(2)),
            until: Some(at(3)),
            ..Default::default()
        };
        assert_eq!(repo.paginate_usage(&window, 1, 10).await.unwrap().total, 2);

        let by_outcome = UsageLogFilter {
            outcome: Some("verified".to_string()),
            device_id: Some("laptop".to_string()),
            ..Default::default()
        };
        let page = repo.paginate_usage(&by_outcome, 1, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.data[0].device_id.as_deref(), Some("laptop-9"));

        let exported = repo.export_usage(&UsageLogFilter::default(), 2).await.unwrap();
        assert_eq!(exported.len(), 2);
        assert_eq!(exported[1].created_at, at(3));
    }

    #[tokio::test]
    async fn test_device_history_is_exact_match() {
        let repo = LogRepository::new(connect_in_memory().await.unwrap());
        repo.insert_usage(&usage("zz1", "bound", true, at(1))).await.unwrap();
        repo.insert_usage(&usage("zz2", "device_mismatch", false, at(2))).await.unwrap();
        let mut similar = usage("zz3", "bound", true, at(3));
        similar.device_id = Some("device-10".to_string());
        repo.insert_usage(&similar).await.unwrap();

        let history = repo.device_history("device-1", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].license_key, "zz2");
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_an_error() {
        let repo = LogRepository::new(connect_in_memory().await.unwrap());
        sqlx::query(
            "INSERT INTO usage_logs (license_key, outcome, success, created_at) VALUES ('zz1', 'bound', 1, 'garbage')",
        )
        .execute(&repo.pool)
        .await
        .unwrap();

        assert!(repo.license_history("zz1", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_purge_removes_only_old_entries() {
        let repo = LogRepository::new(connect_in_memory().await.unwrap());
        repo.insert_usage(&usage("zz1", "verified", true, at(1))).await.unwrap();
        repo.insert_usage(&usage("zz1", "verified", true, at(20))).await.unwrap();
        repo.insert_admin(&NewAdminLog {
            action: "license.disable".to_string(),
            details: Some("id=1".to_string()),
            outcome: "ok".to_string(),
            ip_address: None,
            user_agent: None,
            created_at: at(2),
        })
        .await
        .unwrap();

        let removed = repo.purge_older_than(at(10)).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(repo.license_history("zz1", 10).await.unwrap().len(), 1);
        assert!(repo.recent_admin_actions(10).await.unwrap().is_empty());

        let removed = repo.purge_older_than(at(20) - Duration::seconds(1)).await.unwrap();
        assert_eq!(removed, 0);
    }
}
