use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use lotwatch_client::SourceCollector;
use lotwatch_core::campaign::{CampaignOutcome, CampaignResult};
use lotwatch_core::config::{ConfigSource, EngineConfig, FileConfigSource, StaticConfigSource};
use lotwatch_core::engine::{Engine, EngineStatus};
use lotwatch_core::models::{SourceKind, TargetKey};
use lotwatch_core::traits::{NullStore, RecordStore};
use lotwatch_db::{Database, DatabaseConfig, RecordFilter, StoredRecord};

#[derive(Parser)]
#[command(
    name = "lotwatch",
    version,
    about = "Collect real-estate listings and parcels across target areas"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one collection campaign
    Run {
        /// Path to the JSON campaign configuration
        #[arg(short, long, env = "LOTWATCH_CONFIG", default_value = "lotwatch.json")]
        config: PathBuf,

        /// API key for API collectors that do not configure their own
        #[arg(long, env = "LOTWATCH_API_KEY", hide_env_values = true)]
        api_key: Option<String>,

        /// Collect without persisting records or the campaign result
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Print the campaign result as JSON instead of a summary
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Validate the configuration and collector health without collecting
    Check {
        #[arg(short, long, env = "LOTWATCH_CONFIG", default_value = "lotwatch.json")]
        config: PathBuf,

        #[arg(long, env = "LOTWATCH_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },

    /// Show recent campaigns
    History {
        /// Number of campaigns to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Export stored records as CSV
    Export {
        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only records from this collector
        #[arg(long)]
        source: Option<String>,

        /// Only records for this target key
        #[arg(long)]
        key: Option<String>,

        /// Only records collected on or after this date (YYYY-MM-DD)
        #[arg(long)]
        since: Option<NaiveDate>,

        /// Maximum number of records
        #[arg(short, long)]
        limit: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lotwatch=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            api_key,
            dry_run,
            json,
        } => cmd_run(&config, api_key.as_deref(), dry_run, json).await,
        Commands::Check { config, api_key } => cmd_check(&config, api_key.as_deref()).await,
        Commands::History { limit } => {
            let db = connect_db().await?;
            cmd_history(&db, limit).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Export {
            output,
            source,
            key,
            since,
            limit,
        } => {
            let db = connect_db().await?;
            let filter = RecordFilter {
                source,
                target_key: key.map(TargetKey::new),
                since: since.and_then(|d| d.and_hms_opt(0, 0, 0)).map(|dt| dt.and_utc()),
                limit,
            };
            cmd_export(&db, &filter, output.as_deref()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Connect to PostgreSQL using DATABASE_URL and apply migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;
    Ok(db)
}

/// Read the configuration file and build its collectors.
async fn load(
    path: &Path,
    api_key: Option<&str>,
) -> Result<(StaticConfigSource, Vec<SourceCollector>)> {
    let mut config = FileConfigSource::new(path)
        .load()
        .await
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    if let Some(key) = api_key {
        apply_api_key(&mut config, key);
    }
    let collectors = SourceCollector::build_all(&config).context("Invalid collector settings")?;
    Ok((StaticConfigSource(config), collectors))
}

/// Hand `key` to API collectors that configure neither a key nor a key variable.
fn apply_api_key(config: &mut EngineConfig, key: &str) {
    for registration in config
        .collectors
        .iter_mut()
        .filter(|r| r.kind == SourceKind::Api)
    {
        if registration.settings.is_null() {
            registration.settings = serde_json::json!({});
        }
        if let Some(settings) = registration.settings.as_object_mut()
            && !settings.contains_key("api_key")
            && !settings.contains_key("api_key_env")
        {
            settings.insert("api_key".into(), key.into());
        }
    }
}

async fn cmd_run(
    path: &Path,
    api_key: Option<&str>,
    dry_run: bool,
    json: bool,
) -> Result<ExitCode> {
    let (source, collectors) = load(path, api_key).await?;

    let result = if dry_run {
        tracing::info!("Dry run: nothing will be persisted");
        run_engine(collectors, NullStore, &source).await?
    } else {
        let db = connect_db().await?;
        let result = run_engine(collectors, db.record_repo(), &source).await?;
        db.campaign_repo()
            .save(&result)
            .await
            .context("Failed to save campaign result")?;
        result
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_result(&result);
    }
    Ok(exit_code(result.outcome))
}

async fn run_engine<S: RecordStore>(
    collectors: Vec<SourceCollector>,
    store: S,
    source: &StaticConfigSource,
) -> Result<CampaignResult> {
    let mut engine = Engine::new(collectors, store);
    engine
        .initialize(source)
        .await
        .context("Engine initialization failed")?;
    warn_disabled(&engine.status());

    let campaign = engine.run_campaign();
    tokio::pin!(campaign);
    let result = tokio::select! {
        result = &mut campaign => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupt received, letting in-flight units finish");
            let (result, ()) = tokio::join!(campaign, engine.shutdown());
            result
        }
    };
    engine.shutdown().await;

    result.context("Campaign did not run")
}

async fn cmd_check(path: &Path, api_key: Option<&str>) -> Result<ExitCode> {
    let (source, collectors) = load(path, api_key).await?;
    let mut engine = Engine::new(collectors, NullStore);
    engine
        .initialize(&source)
        .await
        .context("Engine initialization failed")?;

    let status = engine.status();
    println!("Engine {}", status.state);
    for collector in &status.collectors {
        println!(
            "  {:<20} {:<8} {:<10} {}",
            collector.name,
            collector.kind,
            collector.state,
            collector.reason.as_deref().unwrap_or("")
        );
    }
    println!(
        "  proxies: {} total, {} healthy",
        status.pool.total, status.pool.healthy
    );
    engine.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

fn warn_disabled(status: &EngineStatus) {
    for collector in status.collectors.iter().filter(|c| c.reason.is_some()) {
        tracing::warn!(
            collector = %collector.name,
            reason = collector.reason.as_deref().unwrap_or_default(),
            "Collector disabled"
        );
    }
}

fn exit_code(outcome: CampaignOutcome) -> ExitCode {
    if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_result(result: &CampaignResult) {
    println!(
        "Campaign {} ({}) finished: {}",
        result.campaign_id, result.strategy, result.outcome
    );
    println!(
        "  {:.1}s, {} keys, {} items, {:.0}% of units succeeded",
        result.duration_ms as f64 / 1000.0,
        result.keys_attempted,
        result.total_items,
        result.success_ratio * 100.0
    );
    let flags: Vec<&str> = [
        (result.budget_expired, "budget expired"),
        (result.cancelled, "cancelled"),
        (result.resource_exhausted, "resources exhausted"),
    ]
    .into_iter()
    .filter_map(|(set, label)| set.then_some(label))
    .collect();
    if !flags.is_empty() {
        println!("  interrupted: {}", flags.join(", "));
    }

    println!(
        "\n  {:<20} {:<8} {:<10} {:>6} {:>6} {:>8} {:>6} {:>7}",
        "collector", "kind", "state", "units", "ok", "items", "dups", "errors"
    );
    for (name, summary) in &result.collectors {
        println!(
            "  {:<20} {:<8} {:<10} {:>6} {:>6} {:>8} {:>6} {:>7}",
            name,
            summary.kind,
            summary.state,
            summary.attempted,
            summary.succeeded,
            summary.items,
            summary.duplicates,
            summary.error_count()
        );
        if let Some(reason) = &summary.disabled_reason {
            println!("    disabled: {reason}");
        }
    }

    let errors = result.errors_by_class();
    if !errors.is_empty() {
        let parts: Vec<String> = errors
            .iter()
            .map(|(class, count)| format!("{class}={count}"))
            .collect();
        println!("\n  errors: {}", parts.join(" "));
    }
}

async fn cmd_history(db: &Database, limit: usize) -> Result<()> {
    let campaigns = db.campaign_repo().list_recent(limit).await?;

    if campaigns.is_empty() {
        println!("No campaigns recorded yet");
        return Ok(());
    }

    println!("Recent campaigns:\n");
    for campaign in &campaigns {
        println!(
            "  {} {} {:<10} {:<17} {:>7} items {:>4} keys {:>4.0}% ok {:.1}s",
            campaign.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            campaign.id,
            campaign.strategy,
            campaign.outcome,
            campaign.total_items,
            campaign.keys_attempted,
            campaign.success_ratio * 100.0,
            campaign.duration_ms as f64 / 1000.0,
        );
    }
    println!("\nTotal: {} campaigns", campaigns.len());
    Ok(())
}

async fn cmd_export(db: &Database, filter: &RecordFilter, output: Option<&Path>) -> Result<()> {
    let records = db.record_repo().list(filter).await?;

    let written = match output {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            write_csv(file, &records)?
        }
        None => write_csv(io::stdout().lock(), &records)?,
    };
    tracing::info!(records = written, "Export complete");
    Ok(())
}

#[derive(Serialize)]
struct CsvRow<'a> {
    id: String,
    source: &'a str,
    kind: &'static str,
    target_key: &'a str,
    external_id: &'a str,
    address: Option<&'a str>,
    price: Option<i64>,
    area_sq_ft: Option<f64>,
    content_hash: &'a str,
    collected_at: String,
}

fn write_csv<W: Write>(out: W, records: &[StoredRecord]) -> Result<usize> {
    let mut writer = csv::Writer::from_writer(out);
    for stored in records {
        let record = &stored.record;
        writer.serialize(CsvRow {
            id: stored.id.to_string(),
            source: &record.source,
            kind: record.kind.as_str(),
            target_key: record.target_key.as_str(),
            external_id: &record.external_id,
            address: record.address.as_deref(),
            price: record.price,
            area_sq_ft: record.area_sq_ft,
            content_hash: &record.content_hash,
            collected_at: record.collected_at.to_rfc3339(),
        })?;
    }
    writer.flush()?;
    Ok(records.len())
}
