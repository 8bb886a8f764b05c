use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate::config::{DriverConfig, LoggingConfig, TollgateConfig};
use tollgate::ratelimit::{AllowRequest, RateLimiter, ReserveRequest};
use tollgate::store::SqlDriver;

/// Tollgate admin tool: make one-off rate limit decisions against the
/// configured store, or prepare its schema.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// YAML configuration file (environment variables TOLLGATE__* override it)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reserve tokens, possibly in the future, and print the reservation
    Reserve {
        #[command(flatten)]
        bucket: BucketArgs,
        /// How far ahead a reservation may be scheduled, in milliseconds
        #[arg(long, default_value_t = 0)]
        max_future_reserve_ms: u64,
    },
    /// Check whether tokens can be taken right now
    Allow {
        #[command(flatten)]
        bucket: BucketArgs,
    },
    /// Create the PostgreSQL table if it does not exist
    InitSchema,
}

#[derive(Debug, Args)]
struct BucketArgs {
    /// Bucket key
    #[arg(long)]
    key: String,
    /// Time one token costs, in milliseconds
    #[arg(long)]
    per_token_ms: u64,
    /// Bucket capacity
    #[arg(long)]
    burst: u64,
    /// Tokens to take
    #[arg(long, default_value_t = 1)]
    tokens: u64,
}

#[derive(Debug, Serialize)]
struct ReservationOutput {
    key: String,
    ok: bool,
    time_to_act: String,
    now: String,
    delay_ms: Option<u128>,
    retry_after_ms: Option<u128>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TollgateConfig::load(cli.config.as_deref())?;
    init_tracing(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting tollgate");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    match cli.command {
        Command::Reserve {
            bucket,
            max_future_reserve_ms,
        } => {
            let limiter = RateLimiter::new(config.build_driver().await?);
            let request = ReserveRequest::new(
                bucket.key,
                Duration::from_millis(bucket.per_token_ms),
                bucket.burst,
                bucket.tokens,
            )
            .with_max_future_reserve(Duration::from_millis(max_future_reserve_ms));

            let r = limiter.reserve(&cancel, request).await?;
            let output = ReservationOutput {
                key: r.request().key().to_string(),
                ok: r.is_ok(),
                time_to_act: r.time_to_act().to_rfc3339(),
                now: r.now().to_rfc3339(),
                delay_ms: r.is_ok().then(|| r.delay_from(r.now()).as_millis()),
                retry_after_ms: (!r.is_ok()).then(|| r.retry_after_from(r.now()).as_millis()),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Allow { bucket } => {
            let limiter = RateLimiter::new(config.build_driver().await?);
            let request = AllowRequest::new(
                bucket.key,
                Duration::from_millis(bucket.per_token_ms),
                bucket.burst,
                bucket.tokens,
            );
            let ok = limiter.allow(&cancel, request).await?;
            println!("{}", serde_json::json!({ "ok": ok }));
        }
        Command::InitSchema => {
            // build_driver hides the concrete type, so connect directly
            let driver = connect_sql(&config).await?;
            driver.ensure_schema().await?;
            info!(table = %driver.table(), "Schema ready");
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect_sql(config: &TollgateConfig) -> anyhow::Result<SqlDriver> {
    let DriverConfig::Postgres {
        url,
        table,
        max_connections,
        ..
    } = &config.driver
    else {
        anyhow::bail!("init-schema requires the postgres driver");
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(*max_connections)
        .connect(url)
        .await?;
    Ok(SqlDriver::with_table(pool, table.clone())?)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling");
        }
    }
}
