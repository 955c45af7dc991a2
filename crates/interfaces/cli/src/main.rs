//! Operator CLI for the notevault core.
//!
//! Exit codes: 0 success, 64 configuration error, 65 data error,
//! 69 external service unavailable at startup, 70 internal error,
//! 130 interrupted.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use notevault_config::AppConfig;
use notevault_queue::{Queue, QueueSettings};
use notevault_runtime::{BuildError, build, build_core, run};
use notevault_store::{Store, StoreOptions};

#[derive(Debug, Parser)]
#[command(name = "notevault", version, about = "Chat-to-vault knowledge bot core")]
struct Cli {
    /// Accept migration checksum mismatches instead of aborting.
    #[arg(long, global = true)]
    accept_migration_drift: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the bot.
    Run,
    /// Apply pending schema migrations and exit.
    Migrate,
    /// Run startup self-tests and exit 0 or 1.
    Verify,
    /// Move a dead-letter item back to pending.
    ReplayDead {
        #[arg(value_name = "SEQ")]
        seq: i64,
    },
    /// Force a relational↔vector reconciliation pass.
    Reconcile,
    /// Print this month's token usage per provider.
    Usage,
}

fn init_logging(config: &AppConfig, to_file: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_new(&config.runtime.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if to_file {
        let _ = std::fs::create_dir_all(config.logs_dir());
        let appender = tracing_appender::rolling::daily(config.logs_dir(), "notevault.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(64);
        }
    };
    let _log_guard = init_logging(&config, matches!(cli.command, Commands::Run));

    let code = match dispatch(&cli, &config).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %err, "command failed");
            eprintln!("error: {err}");
            err.exit_code()
        }
    };
    ExitCode::from(code.clamp(0, 255) as u8)
}

async fn dispatch(cli: &Cli, config: &AppConfig) -> Result<i32, BuildError> {
    let checksum_override = cli.accept_migration_drift;
    match &cli.command {
        Commands::Run => {
            let app = build(config, checksum_override).await?;
            run(app).await?;
            // The loop only returns after an interrupt.
            Ok(130)
        }
        Commands::Migrate => {
            let store = Store::open(
                config.store_path(),
                StoreOptions {
                    checksum_override,
                    enable_fts: true,
                },
            )?;
            info!(path = %store.path().display(), "migrations applied");
            println!("migrations up to date");
            Ok(0)
        }
        Commands::Verify => Ok(verify(config, checksum_override).await),
        Commands::ReplayDead { seq } => {
            let store = Store::open(
                config.store_path(),
                StoreOptions {
                    checksum_override,
                    enable_fts: true,
                },
            )?;
            let queue = Queue::new(
                store,
                QueueSettings {
                    max_attempts: config.queue.max_attempts,
                    soft_cap: config.queue.soft_cap,
                },
            );
            let new_seq = queue.replay_dead(*seq).await?;
            println!("dead item {seq} requeued as {new_seq}");
            Ok(0)
        }
        Commands::Reconcile => {
            let core = build_core(config, checksum_override).await?;
            let report = core.sync.reconcile().await?;
            println!(
                "reconciled: {} upserted, {} skipped, {} purged, {} deferred",
                report.upserted, report.skipped, report.purged, report.deferred
            );
            Ok(0)
        }
        Commands::Usage => {
            let core = build_core(config, checksum_override).await?;
            let report = core.governor.monthly_report().await?;
            if report.is_empty() {
                println!("no usage recorded this month");
            }
            for entry in report {
                println!(
                    "{}: {} in / {} out tokens, ${:.4}",
                    entry.provider,
                    entry.input_tokens,
                    entry.output_tokens,
                    entry.cost_micro_usd as f64 / 1_000_000.0
                );
            }
            Ok(0)
        }
    }
}

/// Self-tests for the `verify` command; prints each check and exits
/// 0 only when all pass.
async fn verify(config: &AppConfig, checksum_override: bool) -> i32 {
    let mut failed = false;
    let mut check = |name: &str, ok: bool, detail: String| {
        println!("{} {name}{}", if ok { "ok  " } else { "FAIL" }, detail);
        failed |= !ok;
    };

    // Core and git checks each own the data stores in turn; holding
    // both at once would double-open the vector collection.
    match build_core(config, checksum_override).await {
        Ok(core) => {
            check("store", true, format!(" (fts: {})", core.store.fts_enabled()));
            match core.vector.verify() {
                Ok(()) => check("vector canary", true, String::new()),
                Err(err) => check("vector canary", false, format!(": {err}")),
            }
            match core.queue.stats().await {
                Ok(stats) => check(
                    "queue",
                    true,
                    format!(
                        " ({} pending, {} leased, {} dead)",
                        stats.pending, stats.leased, stats.dead
                    ),
                ),
                Err(err) => check("queue", false, format!(": {err}")),
            }
        }
        Err(err) => check("core", false, format!(": {err}")),
    }

    if config.validate_git().is_ok() {
        match build(config, checksum_override).await {
            Ok(app) => check("git workspace", true, format!(" (instance {})", app.git.instance_id())),
            Err(err) => check("git workspace", false, format!(": {err}")),
        }
    } else {
        println!("skip git workspace (credentials not configured)");
    }

    if failed { 1 } else { 0 }
}
