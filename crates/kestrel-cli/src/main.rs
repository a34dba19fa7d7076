//! Kestrel CLI
//!
//! Command-line interface for the Kestrel Telegram bot

mod logging;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use kestrel_capture::{build_engine, CaptureFilter, CaptureReport, CaptureRequest};
use kestrel_config::Config;
use kestrel_core::{KestrelRuntime, DEFAULT_BOT_NAME};
use kestrel_providers::{build_provider, GenerateRequest, ProviderRouter};
use kestrel_router::{Intent, PromptTemplates};
use kestrel_storage::{Journal, KnowledgeBase};
use kestrel_telegram::TelegramAdapter;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

const DB_FILE: &str = "kestrel.db";
const EXAMPLE_CONFIG: &str = include_str!("../../../config/config.example.toml");

#[derive(Parser)]
#[command(name = "kestrel")]
#[command(about = "Telegram bot for local language models, with browser traffic capture", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log level (overrides core.log_level; RUST_LOG overrides both)
    #[arg(short, long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot in the foreground
    Start,

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },

    /// Test connections and credentials
    Test {
        #[command(subcommand)]
        action: TestCommands,
    },

    /// Send one prompt through the configured backend
    Ask {
        /// Prompt text
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,

        /// Backend name (default: backend.default_provider)
        #[arg(short, long)]
        provider: Option<String>,
    },

    /// Capture the API traffic of one page and print the filtered report
    Capture {
        url: String,

        /// Ask the model to summarize the captured flow
        #[arg(short, long)]
        summarize: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Log management commands
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the example configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Show current configuration (secrets redacted)
    Show,
    /// Validate configuration
    Validate,
}

#[derive(Subcommand)]
enum TestCommands {
    /// Check every bot token with getMe
    Telegram,
    /// Check model backends
    Backend {
        /// Backend name to test (default: all)
        name: Option<String>,
    },
}

#[derive(Subcommand)]
enum LogCommands {
    /// Show log files and sizes
    List,
    /// Delete old logs
    Clean {
        /// Keep only N days of logs
        #[arg(short, long, default_value_t = logging::LOG_RETENTION_DAYS)]
        days: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => {
            let config = load_config(cli.config.as_deref())?;
            let data_dir = config.data_dir();
            fs::create_dir_all(&data_dir)
                .with_context(|| format!("creating {}", data_dir.display()))?;

            let level = resolve_log_level(cli.log_level.as_deref(), &config);
            let _logging_guard = logging::init_logging(&data_dir.join("logs"), &level)?;

            let journal = Journal::new(data_dir.join(DB_FILE))?;
            let runtime = KestrelRuntime::new(config, journal)?;
            info!(
                accounts = ?runtime.account_tags(),
                "Starting Kestrel runtime in foreground..."
            );
            runtime.run().await?;
        }

        Commands::Config { action } => match action {
            ConfigCommands::Init { force } => init_config(cli.config.as_deref(), force)?,
            ConfigCommands::Show => match load_config(cli.config.as_deref()) {
                Ok(config) => {
                    println!("Current configuration:");
                    println!("{}", serde_json::to_string_pretty(&redacted_config(&config)?)?);
                }
                Err(e) => eprintln!("Error loading config: {:#}", e),
            },
            ConfigCommands::Validate => match load_config(cli.config.as_deref()) {
                Ok(_) => println!("Configuration is valid."),
                Err(e) => {
                    eprintln!("Configuration is invalid: {:#}", e);
                    std::process::exit(1);
                }
            },
        },

        Commands::Test { action } => {
            let config = load_config(cli.config.as_deref())?;
            logging::init_stderr(&resolve_log_level(cli.log_level.as_deref(), &config))?;
            match action {
                TestCommands::Telegram => {
                    println!("Testing Telegram bot connection...\n");
                    test_telegram_bots(&config).await?;
                }
                TestCommands::Backend { name } => {
                    println!("Testing model backends...\n");
                    test_backends(&config, name.as_deref()).await?;
                }
            }
        }

        Commands::Ask { prompt, provider } => {
            let config = load_config(cli.config.as_deref())?;
            logging::init_stderr(cli.log_level.as_deref().unwrap_or("warn"))?;
            ask(&config, &prompt.join(" "), provider.as_deref()).await?;
        }

        Commands::Capture {
            url,
            summarize,
            json,
        } => {
            let config = load_config(cli.config.as_deref())?;
            logging::init_stderr(cli.log_level.as_deref().unwrap_or("warn"))?;
            capture(&config, &url, summarize, json).await?;
        }

        Commands::Logs { action } => {
            let config = load_config(cli.config.as_deref())?;
            let manager = logging::LogManager::new(config.data_dir().join("logs"));
            match action {
                LogCommands::List => {
                    let files = manager.log_files()?;
                    println!(
                        "Log files ({} total):\n",
                        logging::LogManager::format_size(manager.total_size()?)
                    );
                    for file in files {
                        let metadata = fs::metadata(&file)?;
                        let modified: chrono::DateTime<chrono::Local> = metadata.modified()?.into();
                        println!(
                            "  {} ({}, modified {})",
                            file.file_name()
                                .map(|n| n.to_string_lossy().into_owned())
                                .unwrap_or_default(),
                            logging::LogManager::format_size(metadata.len()),
                            modified.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                }
                LogCommands::Clean { days } => {
                    let deleted = manager.cleanup_old_logs(days)?;
                    println!("Cleaned {} old log file(s)", deleted);
                }
            }
        }
    }

    Ok(())
}

fn config_path(config_path: Option<&str>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(kestrel_config::expand_user_path(path)),
        None => Config::default_path().ok_or_else(|| anyhow!("No config directory found")),
    }
}

fn load_config(path: Option<&str>) -> Result<Config> {
    let path = config_path(path)?;
    if !path.exists() {
        anyhow::bail!(
            "No config file at {} (run `kestrel config init`)",
            path.display()
        );
    }
    Config::load(&path).with_context(|| format!("loading {}", path.display()))
}

fn resolve_log_level(flag: Option<&str>, config: &Config) -> String {
    flag.or(config.core.log_level.as_deref())
        .map(str::trim)
        .filter(|level| !level.is_empty())
        .unwrap_or("info")
        .to_string()
}

fn init_config(path: Option<&str>, force: bool) -> Result<()> {
    let path = config_path(path)?;
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, EXAMPLE_CONFIG)?;

    println!("Configuration created at: {}", path.display());
    println!("\nEdit the file to add your bot token and backend, then run:");
    println!("  kestrel test telegram   - Check the bot token");
    println!("  kestrel test backend    - Check the model backend");
    println!("  kestrel start           - Run the bot");
    Ok(())
}

fn redacted_config(config: &Config) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(config)?;

    if let Some(accounts) = value
        .get_mut("telegram")
        .and_then(|t| t.get_mut("accounts"))
        .and_then(|a| a.as_array_mut())
    {
        for account in accounts {
            if let Some(token) = account.get_mut("bot_token") {
                *token = json!("***REDACTED***");
            }
        }
    }

    if let Some(providers) = value
        .get_mut("backend")
        .and_then(|b| b.get_mut("providers"))
        .and_then(|p| p.as_array_mut())
    {
        for provider in providers {
            if let Some(api_key) = provider.get_mut("api_key").filter(|k| !k.is_null()) {
                *api_key = json!("***REDACTED***");
            }
        }
    }

    Ok(value)
}

fn prompt_templates(config: &Config) -> PromptTemplates {
    let persona = config
        .core
        .persona_file
        .as_deref()
        .and_then(|path| fs::read_to_string(kestrel_config::expand_user_path(path)).ok());
    PromptTemplates::new(
        config
            .core
            .bot_name
            .clone()
            .unwrap_or_else(|| DEFAULT_BOT_NAME.to_string()),
        persona,
    )
}

async fn ask(config: &Config, text: &str, provider: Option<&str>) -> Result<()> {
    let router = ProviderRouter::from_config(&config.backend)?;
    let knowledge = KnowledgeBase::new(config.knowledge_base_dir()).load(5, 500);
    let (system, prompt) = prompt_templates(config).general(text, &knowledge);

    let request =
        GenerateRequest::new(system, prompt).with_timeout(Intent::General.generation_timeout());
    let response = router.generate(&request, provider).await?;

    println!("{}", response.text);
    eprintln!(
        "\n({:.2}s, model {})",
        response.elapsed.as_secs_f64(),
        response.model
    );
    Ok(())
}

async fn capture(config: &Config, url: &str, summarize: bool, as_json: bool) -> Result<()> {
    let engine = build_engine(&config.capture);
    let request = CaptureRequest::from_config(url, &config.capture);
    let outcome = engine.capture(&request).await?;
    let report = CaptureReport::from_outcome(&outcome, &CaptureFilter::from_config(&config.capture));
    let rendered = report.render(config.capture.max_body_chars);

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", rendered);
    }

    let data_dir = config.data_dir();
    if fs::create_dir_all(&data_dir).is_ok() {
        match Journal::new(data_dir.join(DB_FILE)) {
            Ok(journal) => {
                if let Err(e) = journal.record_capture(
                    url,
                    report.final_url.as_deref(),
                    report.total_entries,
                    report.entries.len(),
                    report.elapsed.as_millis() as u64,
                ) {
                    warn!("Failed to record capture: {}", e);
                }
            }
            Err(e) => warn!("Journal unavailable: {}", e),
        }
    }

    if summarize {
        if report.is_empty() {
            println!("\nNo API requests were observed; nothing to summarize.");
            return Ok(());
        }
        let router = ProviderRouter::from_config(&config.backend)?;
        let (system, prompt) = prompt_templates(config).capture_summary(url, &rendered);
        let intent = Intent::Capture {
            url: url.to_string(),
        };
        let request =
            GenerateRequest::new(system, prompt).with_timeout(intent.generation_timeout());
        let response = router.generate(&request, None).await?;
        println!("\n--- Summary ({}) ---\n{}", response.model, response.text);
    }

    Ok(())
}

async fn test_telegram_bots(config: &Config) -> Result<()> {
    let accounts = config
        .telegram
        .as_ref()
        .map(|t| t.accounts.as_slice())
        .unwrap_or_default();
    if accounts.is_empty() {
        println!("No Telegram accounts configured.");
        return Ok(());
    }

    let mut fail_count = 0;
    for (idx, account) in accounts.iter().enumerate() {
        println!(
            "Testing account #{} (bot_id: {})...",
            idx + 1,
            account.account_tag()
        );
        let adapter = TelegramAdapter::new(account, config.data_dir(), None, None);
        match adapter.get_me().await {
            Ok(user) => println!(
                "  ✓ SUCCESS: @{} ({})",
                user.username.as_deref().unwrap_or("unknown"),
                user.first_name.as_deref().unwrap_or("unknown")
            ),
            Err(e) => {
                println!("  ✗ FAILED: {:#}", e);
                fail_count += 1;
            }
        }
    }

    println!(
        "\n{} of {} account(s) OK",
        accounts.len() - fail_count,
        accounts.len()
    );
    if fail_count > 0 {
        anyhow::bail!("{} Telegram account(s) failed", fail_count);
    }
    Ok(())
}

async fn test_backends(config: &Config, name: Option<&str>) -> Result<()> {
    let selected: Vec<_> = config
        .backend
        .providers
        .iter()
        .filter(|p| name.is_none_or(|n| p.name == n))
        .collect();
    if selected.is_empty() {
        match name {
            Some(n) => anyhow::bail!("No backend named '{}'", n),
            None => {
                println!("No backends configured.");
                return Ok(());
            }
        }
    }

    let mut fail_count = 0;
    for provider_config in selected {
        println!(
            "Testing backend '{}' ({})...",
            provider_config.name,
            provider_config.kind.as_str()
        );
        let provider = match build_provider(provider_config) {
            Ok(provider) => provider,
            Err(e) => {
                println!("  ✗ FAILED: {:#}", e);
                fail_count += 1;
                continue;
            }
        };
        println!("  Model: {}", provider.model());

        let started = Instant::now();
        match provider.health_check().await {
            Ok(true) => println!(
                "  ✓ SUCCESS ({:.2}s)",
                started.elapsed().as_secs_f64()
            ),
            Ok(false) => {
                println!("  ✗ FAILED: backend reachable but not healthy");
                fail_count += 1;
            }
            Err(e) => {
                println!("  ✗ FAILED: {:#}", e);
                fail_count += 1;
            }
        }
    }

    if fail_count > 0 {
        anyhow::bail!("{} backend(s) failed", fail_count);
    }
    Ok(())
}
