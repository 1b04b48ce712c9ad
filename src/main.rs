use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use loginguard::config::settings::{LoggingConfig, Settings};
use loginguard::engine::orchestrator::AnalysisBackends;
use loginguard::engine::service::AuthRiskService;
use loginguard::models::context::AuthContext;
use loginguard::storage::profile::open_profile_store;

const DEFAULT_CONFIG_PATH: &str = "/etc/loginguard/loginguard.toml";

/// Parse the `--config` CLI flag. Defaults to `/etc/loginguard/loginguard.toml`.
fn parse_config_path() -> String {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = String::from(DEFAULT_CONFIG_PATH);

    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config" {
            if let Some(path) = args.get(i + 1) {
                config_path = path.clone();
            }
            i += 2;
        } else {
            i += 1;
        }
    }

    config_path
}

/// Initialise the `tracing` subscriber: console (plain or JSON) plus an
/// append-mode log file when one is configured.
fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let file_layer = if config.file.is_empty() {
        None
    } else {
        let path = Path::new(&config.file);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        }
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", config.file))?;

        Some(
            fmt::layer()
                .with_writer(Arc::new(log_file))
                .with_ansi(false)
                .with_target(true),
        )
    };

    // stdout carries command responses, so console logs go to stderr.
    let (console_layer, json_layer) = if config.json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr).with_target(true)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr).with_target(true)), None)
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},loginguard=debug", config.level)));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

/// One line of input on stdin.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Command {
    Analyze {
        context: AuthContext,
    },
    Outcome {
        user_id: String,
        context: AuthContext,
        success: bool,
    },
    Feedback {
        user_id: String,
        context: AuthContext,
        feedback: HashMap<String, Value>,
    },
    Health,
    Metrics,
    Errors {
        #[serde(default = "default_error_limit")]
        limit: usize,
    },
}

fn default_error_limit() -> usize {
    20
}

/// Run one command and build its response line.
async fn handle_command(service: &AuthRiskService, line: &str) -> Value {
    let command: Command = match serde_json::from_str(line) {
        Ok(c) => c,
        Err(e) => {
            warn!("Rejected malformed command: {}", e);
            return json!({ "ok": false, "error": format!("invalid command: {}", e) });
        }
    };

    let result = match command {
        Command::Analyze { context } => serde_json::to_value(service.analyze_login_attempt(&context).await),
        Command::Outcome {
            user_id,
            context,
            success,
        } => {
            service.update_user_behavioral_profile(&user_id, &context, success);
            Ok(json!({ "queued": true }))
        }
        Command::Feedback {
            user_id,
            context,
            feedback,
        } => {
            service.provide_feedback(&user_id, &context, &feedback);
            Ok(json!({ "queued": true }))
        }
        Command::Health => serde_json::to_value(service.get_health_status()),
        Command::Metrics => Ok(json!({
            "processing": service.get_processing_metrics(),
            "learning": service.learning_stats(),
        })),
        Command::Errors { limit } => serde_json::to_value(service.get_error_history(limit)),
    };

    match result {
        Ok(value) => json!({ "ok": true, "result": value }),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            json!({ "ok": false, "error": "serialization failure" })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---------------------------------------------------------------
    // 1. Configuration
    // ---------------------------------------------------------------
    let config_path = parse_config_path();
    let config_found = Path::new(&config_path).exists();
    let settings = if config_found {
        Settings::load(&config_path)?
    } else {
        Settings::default()
    };
    let settings = Arc::new(settings);

    // ---------------------------------------------------------------
    // 2. Logging
    // ---------------------------------------------------------------
    init_tracing(&settings.logging)?;

    info!("Starting loginguard risk service");
    if config_found {
        info!("Config loaded from {}", config_path);
    } else {
        warn!("Config file {} not found, using built-in defaults", config_path);
    }

    // ---------------------------------------------------------------
    // 3. Storage
    // ---------------------------------------------------------------
    let profiles = open_profile_store(&settings.storage)?;

    // ---------------------------------------------------------------
    // 4. Analysis backends
    // ---------------------------------------------------------------
    let backends = AnalysisBackends::heuristic(&settings, profiles)?;

    // ---------------------------------------------------------------
    // 5. Service
    // ---------------------------------------------------------------
    let service = AuthRiskService::new(settings.clone(), backends)?;
    service.initialize();

    info!("loginguard is running. Reading commands from stdin, Ctrl+C to shut down.");

    // ---------------------------------------------------------------
    // 6. Command loop
    // ---------------------------------------------------------------
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let response = handle_command(&service, &line).await;
                        let mut out = response.to_string();
                        out.push('\n');
                        stdout.write_all(out.as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read command: {}", e);
                        break;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C");
                break;
            }
        }
    }

    // ---------------------------------------------------------------
    // 7. Shutdown
    // ---------------------------------------------------------------
    info!("Shutting down loginguard...");
    service.shutdown().await;
    info!("loginguard shut down gracefully");
    Ok(())
}
