mod cli;
mod clock;
mod config;
mod error;
mod handlers;
mod services;
mod state;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use keyward_db::repositories::LogRepository;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clock::SystemClock;
use config::PanelConfig;
use services::{KeyGenerator, LoggingService};
use state::AppState;

const SWEEP_INTERVAL_SECS: u64 = 60;
const RETENTION_INTERVAL_SECS: u64 = 24 * 60 * 60;

#[derive(Parser)]
#[command(name = "keyward")]
#[command(about = "License issuing and device-bound verification service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server
    Serve,
    /// License administration
    Licenses {
        #[command(subcommand)]
        subcommand: LicenseCommands,
    },
    /// Audit log maintenance
    Logs {
        #[command(subcommand)]
        subcommand: LogCommands,
    },
}

#[derive(Subcommand)]
enum LicenseCommands {
    /// Generate new licenses
    Create {
        #[arg(long, default_value_t = 1)]
        count: i64,
        /// Validity in days, counted from now
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Show license and verification counts
    Stats,
    /// Renumber all licenses to a contiguous id range
    Compact,
    /// Inspect a single key
    Check { key: String },
}

#[derive(Subcommand)]
enum LogCommands {
    /// Delete audit entries older than the retention period
    Purge {
        #[arg(long)]
        days: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: no .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    let (config, source) = PanelConfig::load().context("Failed to load configuration")?;
    let _guard = init_tracing(&config.log_dir);
    tracing::info!("Keyward {} starting, config from {}", env!("CARGO_PKG_VERSION"), source);

    let pool = keyward_db::connect(&config.database_url)
        .await
        .context("Failed to open license database")?;

    let audit = Arc::new(LoggingService::new(LogRepository::new(pool.clone())));
    let state = AppState::new(config, pool, Arc::new(SystemClock), KeyGenerator::new(), audit);

    match cli.command {
        Commands::Serve => run_server(state).await?,
        Commands::Licenses { subcommand } => match subcommand {
            LicenseCommands::Create { count, days } => cli::create_licenses(&state, count, days).await?,
            LicenseCommands::Stats => cli::print_stats(&state).await?,
            LicenseCommands::Compact => cli::compact(&state).await?,
            LicenseCommands::Check { key } => cli::check_key(&state, &key).await?,
        },
        Commands::Logs { subcommand } => match subcommand {
            LogCommands::Purge { days } => cli::purge_logs(&state, days).await?,
        },
    }

    Ok(())
}

fn init_tracing(log_dir: &str) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::never(log_dir, "keyward.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "keyward_panel=debug,keyward_db=info,tower_http=info,sqlx=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stdout))
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    guard
}

async fn run_server(state: AppState) -> Result<()> {
    if !state.config.admin_enabled() {
        tracing::warn!("ADMIN_TOKEN is not set, admin API is disabled");
    }

    start_limiter_sweeper(state.clone());
    start_retention_loop(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.listen_port));
    let app = handlers::router(state);

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

fn start_limiter_sweeper(state: AppState) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            tick.tick().await;
            let removed = state.limiter.purge_idle(state.clock.now());
            if removed > 0 {
                tracing::debug!("Dropped {} idle rate limit windows", removed);
            }
        }
    });
}

fn start_retention_loop(state: AppState) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(RETENTION_INTERVAL_SECS));
        loop {
            tick.tick().await;
            let cutoff = state.clock.now() - chrono::Duration::days(state.config.log_retention_days);
            match state.logs.purge_older_than(cutoff).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!("Purged {} expired audit entries", removed),
                Err(e) => tracing::warn!("Audit retention purge failed: {}", e),
            }
        }
    });
}

#[cfg(test)]
pub(crate) mod test_support {
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use keyward_db::repositories::{LicenseRepository, LogRepository};
    use rand::{SeedableRng, rngs::StdRng};
    use std::sync::Arc;

    use crate::clock::ManualClock;
    use crate::config::PanelConfig;
    use crate::services::logging_service::memory::MemoryAuditSink;
    use crate::services::rate_limit_service::RateLimitConfig;
    use crate::services::logging_service::AuditEvent;
    use crate::services::{AuditSink, KeyGenerator, LoggingService};
    use crate::state::AppState;

    pub struct Harness {
        pub state: AppState,
        pub repo: LicenseRepository,
        pub clock: Arc<ManualClock>,
        pub audit: Arc<MemoryAuditSink>,
    }

    /// Persists like production and keeps a copy for assertions.
    struct RecordingSink {
        db: LoggingService,
        memory: Arc<MemoryAuditSink>,
    }

    #[async_trait]
    impl AuditSink for RecordingSink {
        async fn record(&self, event: AuditEvent) {
            self.memory.record(event.clone()).await;
            self.db.record(event).await;
        }
    }

    pub async fn harness() -> Harness {
        build(PanelConfig::default(), seeded_keys()).await
    }

    pub async fn harness_with_limits(rate_limit: RateLimitConfig) -> Harness {
        let config = PanelConfig {
            rate_limit,
            ..PanelConfig::default()
        };
        build(config, seeded_keys()).await
    }

    pub async fn harness_with_keys(keys: KeyGenerator) -> Harness {
        build(PanelConfig::default(), keys).await
    }

    pub async fn harness_with_config(config: PanelConfig) -> Harness {
        build(config, seeded_keys()).await
    }

    fn seeded_keys() -> KeyGenerator {
        KeyGenerator::with_rng(StdRng::seed_from_u64(7))
    }

    async fn build(config: PanelConfig, keys: KeyGenerator) -> Harness {
        let pool = keyward_db::connect_in_memory().await.unwrap();
        let repo = LicenseRepository::new(pool.clone());
        let logs = LogRepository::new(pool);
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap()));
        let audit = Arc::new(MemoryAuditSink::default());
        let sink = Arc::new(RecordingSink {
            db: LoggingService::new(logs.clone()),
            memory: audit.clone(),
        });

        let state = AppState::with_store(config, Arc::new(repo.clone()), logs, clock.clone(), keys, sink);
        Harness {
            state,
            repo,
            clock,
            audit,
        }
    }
}
