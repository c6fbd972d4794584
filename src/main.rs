mod cli;
mod config;
mod controller;
mod db;
mod error;
mod logic;
mod models;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use config::Config;
use controller::{ControllerClient, IrrigationController, RateLimitRegistry};
use db::{Database, Inventory};
use logic::RuleEngine;
use models::{ExecutionResult, Rule};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level())),
        )
        .init();

    let registry = RateLimitRegistry::new();

    match &cli.command {
        Commands::Init => {
            Config::setup_interactive()?;
            Ok(())
        }
        Commands::Run => run_once(&cli, &registry).await,
        Commands::Daemon { interval } => run_daemon(&cli, &registry, *interval).await,
        Commands::Check => run_check(&cli, &registry).await,
        Commands::Import { file } => run_import(&cli, file),
        Commands::Rules => list_rules(&cli),
        Commands::Stop { device_id } => stop_device(&cli, &registry, device_id).await,
    }
}

fn open_database(cli: &Cli) -> Result<Database> {
    let path = Config::db_path(cli.data_dir.as_ref())?;
    Database::open(&path).with_context(|| format!("failed to open database at {}", path.display()))
}

fn build_engine(config: &Config, db: Database, registry: &RateLimitRegistry) -> Result<RuleEngine> {
    let controller: Option<Arc<dyn IrrigationController>> = if config.controller.has_credential()
    {
        Some(Arc::new(ControllerClient::new(
            config.controller.clone(),
            registry,
        )?))
    } else {
        tracing::warn!("controller.api_key is not set; evaluation passes will be skipped");
        None
    };
    Ok(RuleEngine::new(db, controller, &config.engine))
}

async fn run_once(cli: &Cli, registry: &RateLimitRegistry) -> Result<()> {
    let config = Config::load(cli.config.clone())?;
    let db = open_database(cli)?;
    let engine = build_engine(&config, db, registry)?;

    let summary = engine.run_pass().await;
    match summary.aborted {
        Some(reason) => println!("Pass skipped: {}", reason),
        None => {
            println!(
                "Evaluated {} rule(s): {} matched, {} triggered, {} in cooldown, {} failed",
                summary.rules_evaluated,
                summary.rules_matched,
                summary.rules_triggered,
                summary.rules_held_back,
                summary.rules_failed
            );
            if summary.rate_limited {
                println!("Controller API was rate limited during this pass");
            }
        }
    }
    Ok(())
}

async fn run_daemon(
    cli: &Cli,
    registry: &RateLimitRegistry,
    interval_override: Option<u64>,
) -> Result<()> {
    let config = Config::load(cli.config.clone())?;
    let minutes = interval_override.unwrap_or(config.engine.interval_minutes);
    if minutes == 0 {
        bail!("interval must be at least one minute");
    }

    let db = open_database(cli)?;
    let engine = build_engine(&config, db, registry)?;

    tracing::info!(interval_minutes = minutes, "Starting evaluation loop");
    let mut ticker = tokio::time::interval(Duration::from_secs(minutes * 60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => engine.run_evaluation_pass().await,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received Ctrl+C, stopping");
                break;
            }
        }
    }
    Ok(())
}

async fn run_check(cli: &Cli, registry: &RateLimitRegistry) -> Result<()> {
    let config = Config::load(cli.config.clone())?;
    println!("Config OK");
    println!("  Controller: {}", config.controller.base_url);
    println!(
        "  Engine:     every {} min, {} day trend window, source '{}'",
        config.engine.interval_minutes, config.engine.history_days, config.engine.watering_source
    );

    let db = open_database(cli)?;
    println!("Database: {}", db.path().display());

    let records = db.list_rules()?;
    let invalid = records
        .iter()
        .cloned()
        .filter_map(|r| Rule::from_record(r).err())
        .inspect(|e| println!("  {}", e))
        .count();
    println!("  {} rule(s), {} invalid", records.len(), invalid);
    println!("  {} device(s), {} zone(s)", db.get_known_devices()?.len(), db.list_zones()?.len());

    if !config.controller.has_credential() {
        println!("Controller: API key not configured");
        return Ok(());
    }

    let client = ControllerClient::new(config.controller.clone(), registry)?;
    if !client.test_connection().await? {
        println!("Controller: OFFLINE");
        return Ok(());
    }
    println!("Controller: OK");

    for device in client.list_devices().await? {
        println!("  {} ({})", device.name, device.id);
        for zone in &device.zones {
            let state = if zone.enabled { "" } else { " [disabled]" };
            println!("    zone {}: {} ({}){}", zone.zone_number, zone.name, zone.id, state);
        }
    }

    let tracker = client.tracker();
    let state = tracker.state();
    println!(
        "Rate limit for {}: remaining {} of {}{}",
        tracker.api(),
        state
            .remaining
            .map_or_else(|| "?".to_string(), |r| r.to_string()),
        state.limit.map_or_else(|| "?".to_string(), |l| l.to_string()),
        state
            .reset_time
            .map(|t| format!(", resets {}", t.to_rfc3339()))
            .unwrap_or_default()
    );
    if tracker.is_limited() {
        println!("  currently rate limited");
    }
    Ok(())
}

fn run_import(cli: &Cli, file: &Path) -> Result<()> {
    let inventory = Inventory::from_path(file)
        .with_context(|| format!("failed to read inventory {}", file.display()))?;
    let db = open_database(cli)?;
    let summary = db.import_inventory(&inventory)?;
    println!(
        "Imported {} device(s), {} zone(s), {} rule(s), {} reading(s)",
        summary.devices, summary.zones, summary.rules, summary.readings
    );
    Ok(())
}

fn list_rules(cli: &Cli) -> Result<()> {
    let db = open_database(cli)?;
    let records = db.list_rules()?;
    if records.is_empty() {
        println!("No rules. Use `raincheck import <file>` to add some.");
        return Ok(());
    }

    for record in records {
        let last_run = record
            .last_run_at
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "never".into());
        let status = if record.enabled { "on " } else { "off" };
        println!("[{}] #{} {} (last run: {})", status, record.id, record.name, last_run);

        if let Some(ref raw) = record.last_result {
            match serde_json::from_str::<ExecutionResult>(raw) {
                Ok(result) => println!(
                    "      {}: ok {:?}, failed {:?}, skipped {:?}",
                    result.action,
                    result.successful_targets,
                    result.failed_targets,
                    result.skipped_targets
                ),
                Err(_) => println!("      {}", raw),
            }
        }
        if let Err(e) = Rule::from_record(record) {
            println!("      invalid: {}", e);
        }
    }

    let audit = db.recent_audit_entries(10)?;
    if !audit.is_empty() {
        println!();
        println!("Recent activity:");
        for entry in audit {
            println!(
                "  {} {} {}",
                entry.timestamp.format("%Y-%m-%d %H:%M"),
                entry.action.as_str(),
                entry.rule_name
            );
        }
    }
    Ok(())
}

async fn stop_device(cli: &Cli, registry: &RateLimitRegistry, device_id: &str) -> Result<()> {
    let config = Config::load(cli.config.clone())?;
    let client = ControllerClient::new(config.controller, registry)?;
    match client.stop(device_id).await {
        Ok(()) => {
            println!("Stopped watering on {}", device_id);
            Ok(())
        }
        Err(e) if e.is_invalid_target() => {
            bail!("Controller does not recognise device {}: {}", device_id, e)
        }
        Err(e) if e.is_rate_limited() => {
            let reset = e
                .reset_at()
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "an unknown time".to_string());
            bail!("Controller is rate limited until {}, try again later", reset)
        }
        Err(e) => Err(e).with_context(|| format!("failed to stop watering on {}", device_id)),
    }
}
