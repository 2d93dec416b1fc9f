use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cloudledger_config::LedgerConfig;
use cloudledgerd::app;
use cloudledgerd::{JobOutcome, Scheduler};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cloudledgerd")]
#[command(about = "Cloud inventory reconciliation with point-in-time history", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (default: discovered, see `check`)
    #[arg(short, long, global = true, env = "CLOUDLEDGER_CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile every job once, then exit
    Run {
        /// Only this resource kind
        #[arg(short, long)]
        resource: Option<String>,
        /// Only this scope
        #[arg(short, long)]
        scope: Option<String>,
        /// Use an in-memory store instead of the configured database
        #[arg(long)]
        dry_run: bool,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Reconcile on a fixed interval until Ctrl-C
    Serve,
    /// Validate the config and list the jobs it defines
    Check,
    /// Print the SQL schema of every configured resource
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let (path, config) = load(cli.config.as_deref())?;
    tracing::debug!(path = %path.display(), "Loaded config");

    match cli.command {
        Commands::Run {
            resource,
            scope,
            dry_run,
            json,
        } => run(&config, resource.as_deref(), scope.as_deref(), dry_run, json).await,
        Commands::Serve => serve(&config).await,
        Commands::Check => check(&path, &config),
        Commands::Schema => schema(&config),
    }
}

fn load(explicit: Option<&Path>) -> Result<(PathBuf, LedgerConfig)> {
    match explicit {
        Some(path) => {
            let config = cloudledger_config::load_config(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            Ok((path.to_path_buf(), config))
        }
        None => Ok(cloudledger_config::discover()?),
    }
}

async fn run(
    config: &LedgerConfig,
    resource: Option<&str>,
    scope: Option<&str>,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let store = app::open_store(config, dry_run).await?;
    let jobs = app::select_jobs(app::build_jobs(config, store).await?, resource, scope);
    if jobs.is_empty() {
        anyhow::bail!("No job matches the given filters");
    }

    let scheduler = Scheduler::new(app::scheduler_config(&config.schedule));
    let mut failed = 0;
    let mut reports = Vec::new();

    for job in &jobs {
        let key = job.key();
        let outcome = scheduler.run_once(job).await;
        match &outcome {
            JobOutcome::Completed { run, sweep, .. } => {
                if !json {
                    println!("{} {}: {}", "✓".green(), key.to_string().bold(), run);
                    if let Some(sweep) = sweep {
                        println!("    sweep: {}", sweep);
                    }
                }
                reports.push(serde_json::json!({"job": key.to_string(), "run": run, "sweep": sweep}));
            }
            JobOutcome::Failed { error, attempts } => {
                failed += 1;
                if !json {
                    println!(
                        "{} {}: {} {}",
                        "✗".red(),
                        key.to_string().bold(),
                        error,
                        format!("({} attempts)", attempts).dimmed()
                    );
                }
                reports.push(serde_json::json!({
                    "job": key.to_string(),
                    "error": error.to_string(),
                    "attempts": attempts,
                }));
            }
            JobOutcome::Skipped => {}
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }
    if failed > 0 {
        anyhow::bail!("{} of {} jobs failed", failed, jobs.len());
    }
    Ok(())
}

async fn serve(config: &LedgerConfig) -> Result<()> {
    let store = app::open_store(config, false).await?;
    let jobs = app::build_jobs(config, store).await?;
    let scheduler = Arc::new(Scheduler::new(app::scheduler_config(&config.schedule)));

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        shutdown.cancel();
    });

    scheduler.serve(jobs, cancel).await;
    Ok(())
}

fn check(path: &Path, config: &LedgerConfig) -> Result<()> {
    println!("{} {}", "Config:".bold(), path.display());
    println!("{} {}", "Database:".bold(), config.database.url);
    println!("{} {}", "API:".bold(), config.api.base_url);
    println!(
        "{} every {}s, timeout {}s, {} attempts",
        "Schedule:".bold(),
        config.schedule.interval_secs,
        config.schedule.run_timeout_secs,
        config.schedule.retry.max_attempts
    );
    println!();

    for resource in &config.resources {
        let descriptor = resource.descriptor()?;
        println!(
            "{} {} ({} fields, {} opaque, {} collections)",
            "•".cyan(),
            descriptor.name.bold(),
            descriptor.scalar_fields.len(),
            descriptor.opaque_fields.len(),
            descriptor.children.len()
        );
        println!("    path: {}", resource.path_for(&descriptor));
        for scope in &config.scopes {
            println!("    job:  {}@{}", descriptor.name, scope);
        }
    }

    println!();
    println!("{}", "Config is valid".green());
    Ok(())
}

fn schema(config: &LedgerConfig) -> Result<()> {
    for descriptor in config.descriptors()? {
        println!("-- {}", descriptor.name);
        for statement in cloudledger_sqlite::schema_statements(&descriptor) {
            println!("{};", statement);
        }
        println!();
    }
    Ok(())
}
