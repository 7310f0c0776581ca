use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use marketsnap::config::{self, ScheduleFile, DEFAULT_CONFIG_PATH};
use marketsnap::health::{self, CollectionSchedule, HealthReport};
use marketsnap::runner::{self, RunOptions};

#[derive(Parser)]
#[command(
    name = "marketsnap",
    about = "Scheduled market-data snapshot runner",
    version,
    long_about = None
)]
struct Cli {
    /// Log line format on stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect one snapshot: fetch with retries, save, notify
    RunOnce {
        /// Configuration file (JSON, or TOML by extension)
        #[arg(long, env = "MARKETSNAP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Collect even when weekend collection is disabled
        #[arg(long)]
        force: bool,
    },

    /// Show recent data files, last success and disk space
    Status {
        /// Configuration file (JSON, or TOML by extension)
        #[arg(long, env = "MARKETSNAP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Include log files, free space and schedule details
        #[arg(long)]
        detailed: bool,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Write a configuration template
    InitConfig {
        /// Where to write it
        #[arg(long, env = "MARKETSNAP_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Replace an existing file
        #[arg(long)]
        overwrite: bool,

        /// Include placeholder email and Slack sections
        #[arg(long)]
        with_notifications: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::RunOnce { config, force } => {
            let result = runner::run_once(&config, RunOptions { force }).await;
            match (result.stored_path(), result.error_detail()) {
                (Some(path), _) => println!(
                    "{} after {} attempt(s): {}",
                    result.outcome(),
                    result.attempts_made(),
                    path.display()
                ),
                (None, Some(detail)) => println!("{}: {}", result.outcome(), detail),
                (None, None) => println!("{}", result.outcome()),
            }
            Ok(ExitCode::from(result.exit_code()))
        }
        Commands::Status {
            config,
            detailed,
            json,
        } => {
            let report = build_status(&config);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_status(&config, &report, detailed);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::InitConfig {
            config,
            overwrite,
            with_notifications,
        } => {
            init_config(&config, overwrite, with_notifications)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout is reserved for command output.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Never fails: an unreadable config falls back to defaults with a warning.
fn build_status(config_path: &Path) -> HealthReport {
    let (file, config_warning) = match ScheduleFile::read(config_path) {
        Ok(file) => (file, None),
        Err(e) => (
            ScheduleFile::default(),
            Some(format!("{e}; showing default locations")),
        ),
    };

    let min_free_bytes = file.min_free_mb.saturating_mul(1024 * 1024);
    let mut report = health::check(&file.data_dir, &file.log_dir, min_free_bytes);
    if let Some(warning) = config_warning {
        report.warnings.insert(warning);
    }

    let schedule = config::parse_collection_time(&file.daily_collection_time)
        .map_err(anyhow::Error::from)
        .and_then(|time| CollectionSchedule::new(time, !file.weekend_collection));
    match schedule {
        Ok(schedule) => health::check_schedule(&mut report, &schedule, file.run_budget(), Local::now()),
        Err(e) => {
            report.warnings.insert(format!("cannot compute schedule: {e:#}"));
        }
    }
    report
}

fn print_status(config_path: &Path, report: &HealthReport, detailed: bool) {
    let local = |t: DateTime<Utc>| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string();

    println!("\nmarketsnap status ({})", local(report.checked_at));
    println!("{:<18} {}", "Config:", config_path.display());
    match report.last_successful_run {
        Some(t) => println!(
            "{:<18} {} ({})",
            "Last success:",
            local(t),
            health::humanize_age(report.checked_at - t)
        ),
        None => println!("{:<18} never", "Last success:"),
    }
    if let Some(next) = report.next_collection {
        println!("{:<18} {}", "Next collection:", local(next));
    }

    println!("\nRecent data files:");
    if report.recent_files.is_empty() {
        println!("  (none)");
    }
    for file in &report.recent_files {
        println!("  {:<32} {}", file.name, file.age);
    }

    if detailed {
        println!(
            "\n{:<18} {} file(s), {} bytes",
            "Data files:", report.data_file_count, report.data_dir_bytes
        );
        println!("\nLog files:");
        if report.log_files.is_empty() {
            println!("  (none)");
        }
        for log in &report.log_files {
            println!("  {:<32} {} bytes", log.name, log.size_bytes);
        }
        println!("\n{:<18} {} MiB", "Free space:", report.free_space_bytes / (1024 * 1024));
    }

    if report.is_healthy() {
        println!("\nStatus: OK");
    } else {
        println!("\nWarnings:");
        for warning in &report.warnings {
            println!("  - {}", warning);
        }
    }
}

fn init_config(path: &Path, overwrite: bool, with_notifications: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "{} already exists (pass --overwrite to replace it)",
            path.display()
        );
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let template = ScheduleFile::template(with_notifications);
    let content = if config::is_toml_path(path) {
        template.to_toml().context("Failed to render TOML template")?
    } else {
        template.to_pretty_json()
    };
    std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Wrote configuration template to {}", path.display());
    Ok(())
}
