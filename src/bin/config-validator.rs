//! # Reprocessor Configuration Validator
//!
//! Command-line tool for validating reprocessor configuration files across
//! environments before starting the reprocessing loop.

use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use reprocessor_core::config::{ConfigManager, ReprocessorConfig};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate reprocessor configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production, ...)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory path (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format for `dump` (pretty, json)
    #[arg(long, default_value = "pretty")]
    format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate every configuration section
    All,

    /// Validate one section
    Component {
        /// Section name (reprocessing, fan_out, work_source, logging)
        name: String,
    },

    /// Print the effective configuration with credentials masked
    Dump,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::All) | None => validate_all(&cli),
        Some(Commands::Component { name }) => validate_component(&cli, name),
        Some(Commands::Dump) => dump(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {e:#}");
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> anyhow::Result<std::sync::Arc<ConfigManager>> {
    ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), &cli.environment)
        .with_context(|| format!("loading configuration for '{}'", cli.environment))
}

fn validate_all(cli: &Cli) -> anyhow::Result<()> {
    println!("🔧 Validating Reprocessor Configuration");
    println!("Environment: {}", cli.environment);
    if let Some(config_dir) = &cli.config_dir {
        println!("Config Directory: {}", config_dir.display());
    }
    println!();

    let manager = load(cli)?;
    println!("✅ Configuration loaded and validated");

    let config = manager.config();
    report_reprocessing(config);
    report_fan_out(config);
    report_work_source(config);
    report_logging(config, manager.environment());

    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn validate_component(cli: &Cli, name: &str) -> anyhow::Result<()> {
    println!("🔧 Validating Component: {name}");
    let manager = load(cli)?;
    let config = manager.config();

    match name.to_lowercase().replace('-', "_").as_str() {
        "reprocessing" => {
            config.reprocessing.validate()?;
            report_reprocessing(config);
        }
        "fan_out" => {
            config.fan_out.validate()?;
            report_fan_out(config);
        }
        "work_source" => {
            config.work_source.validate()?;
            report_work_source(config);
        }
        "logging" => report_logging(config, manager.environment()),
        other => bail!("Unknown component: {other}"),
    }

    println!("✅ Component '{name}' validation passed!");
    Ok(())
}

fn dump(cli: &Cli) -> anyhow::Result<()> {
    let manager = load(cli)?;
    let sanitized = manager.debug_config();
    let rendered = match cli.format.as_str() {
        "json" => serde_json::to_string(&sanitized)?,
        "pretty" => serde_json::to_string_pretty(&sanitized)?,
        other => bail!("Unknown output format: {other}"),
    };
    println!("{rendered}");
    Ok(())
}

fn report_reprocessing(config: &ReprocessorConfig) {
    let reprocessing = &config.reprocessing;
    println!("🔁 Reprocessing");
    println!("   ✅ Batch size: {}", reprocessing.max_results_to_load);
    println!("   ✅ Concurrency ceiling: {}", reprocessing.max_concurrent);
    println!(
        "   ✅ Empty poll interval: {:?}",
        reprocessing.empty_poll_interval()
    );
    match reprocessing.item_timeout() {
        Some(timeout) => println!("   ✅ Item timeout: {timeout:?}"),
        None => println!("   ℹ️  Item timeout not set"),
    }
}

fn report_fan_out(config: &ReprocessorConfig) {
    let fan_out = &config.fan_out;
    println!("🚀 Fan-out");
    println!("   ✅ Child task: {}", fan_out.task_ref);
    println!("   ✅ Execution timeout: {:?}", fan_out.execution_timeout());
    println!("   ✅ Detach mode: {:?}", fan_out.detach_mode);
    println!(
        "   ✅ Retry waits: {:?}",
        fan_out.retry.schedule(10)
    );
}

fn report_work_source(config: &ReprocessorConfig) {
    let work_source = &config.work_source;
    println!("🗄️  Work source");
    println!(
        "   ✅ Table: {} ({} / {})",
        work_source.table, work_source.id_column, work_source.touched_column
    );
    println!("   ✅ Lease: {:?}", work_source.lease());
    if work_source.database_url.is_some() {
        println!("   ✅ Database URL configured");
    } else {
        println!("   ℹ️  Database URL not configured (in-memory work source only)");
    }
}

fn report_logging(config: &ReprocessorConfig, environment: &str) {
    println!("📝 Logging");
    println!("   ✅ Level: {}", config.logging.level_for(environment));
    println!("   ✅ Format: {:?}", config.logging.format);
}
