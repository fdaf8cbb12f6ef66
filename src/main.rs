// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Taxis CLI: AI-assisted file organization

use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use taxis::config::AppConfig;
use taxis::coordinator::{Coordinator, OrganizerEvent};
use taxis::db::Database;
use taxis::drives::monitor::spawn_monitor;
use taxis::memory::DestinationMemory;
use taxis::ollama::{CompletionProvider, OllamaClient};
use taxis::{Result, TaxisError};

/// Taxis CLI - AI File Organization Engine
#[derive(Parser, Debug)]
#[command(name = "taxis")]
#[command(author = "Jonathan D. A. Jewell <hyperpolymath>")]
#[command(version = "0.1.0")]
#[command(about = "AI-assisted file organization", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (JSON format)
    #[arg(short, long, default_value = "config.json", global = true)]
    config: PathBuf,

    /// Enable verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable trace logging (most verbose)
    #[arg(long, global = true)]
    trace: bool,

    /// Suppress non-essential output (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Plan and execute an organization cycle for a directory
    Organize {
        /// Directory to organize
        path: PathBuf,

        /// Preferred destination root
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// Plan and preview without executing
        #[arg(long)]
        dry_run: bool,

        /// Execute without asking for confirmation
        #[arg(short, long)]
        yes: bool,

        /// Skip the AI provider health check on startup
        #[arg(long)]
        skip_health_check: bool,
    },

    /// List known drives and their connection state
    Drives {
        /// Force a fresh discovery scan
        #[arg(long)]
        rescan: bool,
    },

    /// Show learned destination mappings
    Memory {
        /// Show series mappings instead of categories
        #[arg(long)]
        series: bool,
    },

    /// Show the file action audit trail
    History {
        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "20")]
        count: usize,
    },

    /// Show AI engine and database status
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Initialize a new Taxis setup
    Init {
        /// Directory to initialize (default: current)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Force overwrite existing configuration
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Generate default configuration file
    Generate {
        /// Output file path
        #[arg(short, long, default_value = "config.json")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Some(Commands::Organize {
            path,
            dest,
            dry_run,
            yes,
            skip_health_check,
        }) => run_organize(config, path, dest, dry_run, yes, skip_health_check).await,
        Some(Commands::Drives { rescan }) => run_drives(config, rescan),
        Some(Commands::Memory { series }) => run_memory(config, series),
        Some(Commands::History { count }) => run_history(config, count),
        Some(Commands::Status) => run_status(config).await,
        Some(Commands::Config { action }) => run_config_command(config, action, &cli.config),
        Some(Commands::Init { dir, force }) => run_init(dir, force),
        None => {
            eprintln!("No command given. Try: taxis organize <dir>");
            Ok(())
        }
    }
}

fn open_stores(config: &AppConfig) -> Result<(Database, Arc<DestinationMemory>)> {
    let db = Database::open(&config.database.path)?;
    let memory = Arc::new(DestinationMemory::new(
        &config.user_id,
        db.clone(),
        config.learning.clone(),
    ));
    Ok((db, memory))
}

/// Run one organize cycle with preview
async fn run_organize(
    config: AppConfig,
    path: PathBuf,
    dest: Option<PathBuf>,
    dry_run: bool,
    yes: bool,
    skip_health_check: bool,
) -> Result<()> {
    let provider = Arc::new(OllamaClient::new(&config.ai_engine));

    if !skip_health_check {
        info!("Checking AI provider availability...");
        provider.health_check().await?;
        if !provider.model_available().await.unwrap_or(false) {
            warn!(
                "Model '{}' not found on the provider; generation may fail",
                config.ai_engine.model
            );
        }
    }

    let (db, memory) = open_stores(&config)?;

    // Hotplug events accumulate while we work and are applied at the
    // next plan() call.
    match spawn_monitor(&config.drives) {
        Ok(rx) => memory.attach_monitor(rx),
        Err(e) => warn!("drive monitor unavailable: {}", e),
    }

    let coordinator = Coordinator::new(config, db, memory, provider);

    let planned = coordinator.plan(&path, dest).await?;

    if planned.plan.is_empty() {
        println!("Nothing to do for {:?}", path);
        return Ok(());
    }

    println!("Planned operations:");
    for (i, (op, why)) in planned
        .plan
        .operations
        .iter()
        .zip(planned.plan.explanations.iter())
        .enumerate()
    {
        println!("  {:>2}. [{}] {}", i + 1, op.kind(), why);
        if let Some(fallback) = &planned.plan.fallback_operations[i] {
            println!("      fallback: [{}]", fallback.kind());
        }
    }

    if dry_run {
        println!("\nDry run, nothing executed.");
        return Ok(());
    }

    if !yes && !confirm("Execute these operations?")? {
        println!("Aborted.");
        return Ok(());
    }

    // Print progress as the executor works through the batch.
    let mut events = coordinator.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrganizerEvent::OperationCompleted { index, result, .. } => {
                    let mark = if result.success { "ok" } else { "FAILED" };
                    let detail = result
                        .error_message
                        .map(|m| format!(" ({})", m))
                        .unwrap_or_default();
                    println!(
                        "  {:>2}. {} {}{}{}",
                        index + 1,
                        result.operation.kind(),
                        mark,
                        if result.fallback_used { " [fallback]" } else { "" },
                        detail
                    );
                }
                OrganizerEvent::BatchCompleted(_) => break,
                _ => {}
            }
        }
    });

    let summary = coordinator.execute(planned).await?;
    let _ = printer.await;

    println!(
        "\nDone: {} succeeded, {} failed, {} skipped",
        summary.succeeded, summary.failed, summary.skipped
    );
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn run_drives(config: AppConfig, rescan: bool) -> Result<()> {
    let (_, memory) = open_stores(&config)?;

    let drives = if rescan {
        memory.drives()?
    } else {
        let known = memory.registry().list()?;
        if known.is_empty() {
            memory.drives()?
        } else {
            known
        }
    };

    if drives.is_empty() {
        println!("No drives known.");
        return Ok(());
    }

    println!("Known drives:");
    for drive in drives {
        println!(
            "  [{}] {} at {:?} ({}, {}) last seen {}",
            if drive.is_connected { "up" } else { "--" },
            drive.label,
            drive.current_path,
            drive.drive_type.as_str(),
            drive.identifier_type.as_str(),
            drive.last_seen.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

fn run_memory(config: AppConfig, series: bool) -> Result<()> {
    let (_, memory) = open_stores(&config)?;

    if series {
        let mappings = memory.series()?;
        if mappings.is_empty() {
            println!("No series learned yet.");
            return Ok(());
        }
        println!("Series destinations:");
        for m in mappings {
            println!(
                "  {} -> {:?} ('{}', confidence {:.2}, used {}x)",
                m.series_name, m.destination_path, m.season_structure, m.confidence_score, m.usage_count
            );
        }
    } else {
        let mappings = memory.mappings()?;
        if mappings.is_empty() {
            println!("No destinations learned yet.");
            return Ok(());
        }
        println!("Learned destinations:");
        for m in mappings {
            println!(
                "  {} -> {:?} (confidence {:.2}, used {}x)",
                m.file_category, m.destination_path, m.confidence_score, m.usage_count
            );
        }
    }
    Ok(())
}

fn run_history(config: AppConfig, count: usize) -> Result<()> {
    let db = Database::open(&config.database.path)?;
    let actions = db.recent_actions(&config.user_id, count)?;

    if actions.is_empty() {
        println!("No recorded actions.");
        return Ok(());
    }

    println!("Recent actions:");
    for action in actions {
        let status = if action.success { "ok" } else { "FAILED" };
        let detail = action
            .error_message
            .as_deref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default();
        println!(
            "  {} {:<12} {} {} -> {}{}",
            action.timestamp.format("%Y-%m-%d %H:%M"),
            action.action_type,
            status,
            action.source_path.as_deref().unwrap_or("-"),
            action.destination_path.as_deref().unwrap_or("-"),
            detail,
        );
    }
    Ok(())
}

async fn run_status(config: AppConfig) -> Result<()> {
    let client = OllamaClient::new(&config.ai_engine);

    println!("Taxis v0.1.0 Status");
    println!("===================");

    match client.health_check().await {
        Ok(()) => println!("AI engine: Running"),
        Err(e) => println!("AI engine: Error - {}", e),
    }

    match client.list_models().await {
        Ok(models) => {
            println!("\nAvailable models:");
            for m in &models {
                let marker = if m.starts_with(&config.ai_engine.model) {
                    "->"
                } else {
                    "  "
                };
                println!("  {} {}", marker, m);
            }
        }
        Err(e) => println!("  Error listing models: {}", e),
    }

    match Database::open(&config.database.path) {
        Ok(db) => {
            let stats = db.get_stats(&config.user_id)?;
            println!("\nDatabase ({}):", config.database.path);
            println!("  Mappings: {}", stats.mapping_count);
            println!("  Series: {}", stats.series_count);
            println!("  Drives: {}", stats.drive_count);
            println!("  Actions: {}", stats.action_count);
        }
        Err(e) => println!("\nDatabase: Error - {}", e),
    }

    println!("\nConfiguration:");
    println!("  User: {}", config.user_id);
    println!("  Model: {}", config.ai_engine.model);
    println!("  Mount roots: {:?}", config.drives.mount_roots);

    Ok(())
}

fn run_config_command(config: AppConfig, action: ConfigCommands, config_path: &Path) -> Result<()> {
    match action {
        ConfigCommands::Show => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        ConfigCommands::Generate { output } => {
            let default_config = AppConfig::default();
            default_config.save(&output)?;
            println!("Generated config at {:?}", output);
        }
        ConfigCommands::Validate => {
            println!("Configuration at {:?} is valid", config_path);
            println!("  User: {}", config.user_id);
            println!("  Model: {}", config.ai_engine.model);
            println!("  Database: {}", config.database.path);
        }
    }
    Ok(())
}

fn run_init(dir: Option<PathBuf>, force: bool) -> Result<()> {
    let target = dir.unwrap_or_else(|| PathBuf::from("."));
    let config_path = target.join("config.json");

    if config_path.exists() && !force {
        return Err(TaxisError::Config(
            "config.json already exists. Use --force to overwrite".to_string(),
        ));
    }

    std::fs::create_dir_all(&target)?;
    let config = AppConfig::default();
    config.save(&config_path)?;

    println!("Taxis initialized in {:?}", target);
    println!("\nCreated:");
    println!("  - config.json");
    println!("\nNext steps:");
    println!("  1. Start Ollama and pull a model");
    println!("  2. Organize a folder: taxis organize ~/Downloads --dry-run");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["taxis"]).unwrap();
        assert!(!cli.verbose);
    }

    #[test]
    fn test_cli_organize_command() {
        let cli = Cli::try_parse_from(["taxis", "organize", "/tmp/dl", "--dry-run", "--yes"]).unwrap();

        match cli.command {
            Some(Commands::Organize { path, dry_run, yes, .. }) => {
                assert!(dry_run);
                assert!(yes);
                assert_eq!(path, PathBuf::from("/tmp/dl"));
            }
            _ => panic!("Expected Organize command"),
        }
    }

    #[test]
    fn test_cli_history_count() {
        let cli = Cli::try_parse_from(["taxis", "history", "-n", "5"]).unwrap();
        match cli.command {
            Some(Commands::History { count }) => assert_eq!(count, 5),
            _ => panic!("Expected History command"),
        }
    }
}
