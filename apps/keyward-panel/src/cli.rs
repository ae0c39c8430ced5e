use anyhow::{Context, Result};
use chrono::Duration;

use crate::services::CallerInfo;
use crate::services::key_service::validate_format;
use crate::state::AppState;

pub async fn create_licenses(state: &AppState, count: i64, days: i64) -> Result<()> {
    let ids = state
        .admin
        .create_many(&CallerInfo::local_cli(), count, days, None)
        .await
        .context("Failed to create licenses")?;

    println!("Created {} license(s) valid for {} days:", ids.len(), days);
    for id in ids {
        let license = state.admin.get(id).await?;
        println!("  #{:<6} {}  expires {}", license.id, license.key, license.expires_at.format("%Y-%m-%d %H:%M"));
    }
    Ok(())
}

pub async fn print_stats(state: &AppState) -> Result<()> {
    let licenses = state.admin.stats().await.context("Failed to read license stats")?;
    let usage = state.logs.usage_stats().await.context("Failed to read usage stats")?;

    println!("\n=== KEYWARD LICENSES ===");
    println!("Total:            {}", licenses.total);
    println!("Unused:           {}", licenses.unused);
    println!("Bound:            {}", licenses.bound);
    println!("Disabled:         {}", licenses.disabled);
    println!("Expiring (7d):    {}", licenses.expiring_within_7_days);
    println!("--- verification ---");
    println!("Requests:         {}", usage.total_requests);
    println!("Successful:       {}", usage.successful_requests);
    println!("Failed:           {}", usage.failed_requests);
    println!("========================\n");
    Ok(())
}

pub async fn compact(state: &AppState) -> Result<()> {
    let report = state
        .admin
        .compact_all(&CallerInfo::local_cli())
        .await
        .context("Compaction failed")?;
    println!(
        "Renumbered {} license(s); next id will be {}.",
        report.reordered_count,
        report.new_max_id + 1
    );
    Ok(())
}

pub async fn purge_logs(state: &AppState, days: Option<i64>) -> Result<()> {
    let days = days.unwrap_or(state.config.log_retention_days);
    if days < 1 {
        anyhow::bail!("--days must be at least 1");
    }
    let cutoff = state.clock.now() - Duration::days(days);
    let removed = state
        .logs
        .purge_older_than(cutoff)
        .await
        .context("Failed to purge logs")?;
    println!("Removed {} log entries older than {} days.", removed, days);
    Ok(())
}

/// Diagnostic lookup for a key reported by a customer.
pub async fn check_key(state: &AppState, key: &str) -> Result<()> {
    let key = key.trim();
    let well_formed = validate_format(key, state.admin.key_format());
    println!("Format:  {}", if well_formed { "ok" } else { "does not match the configured key format" });

    match state.admin.find_by_key(key).await? {
        Some(license) => {
            let now = state.clock.now();
            println!("License: #{} ({})", license.id, license.status.as_str());
            println!("Device:  {}", license.device_id.as_deref().unwrap_or("-"));
            println!(
                "Expires: {}{}",
                license.expires_at.format("%Y-%m-%d %H:%M"),
                if license.is_expired_at(now) { " (expired)" } else { "" }
            );
            if let Some(note) = &license.note {
                println!("Note:    {}", note);
            }
        }
        None => println!("License: not found"),
    }
    Ok(())
}
