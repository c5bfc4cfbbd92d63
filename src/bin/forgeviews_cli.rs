//! ForgeViews CLI - render and inspect views from the command line
//!
//! Commands: render, exists, compile, prune
//! Outputs JSON to stdout, logs to stderr
//! Exit codes: 0 success, 1 usage or load error, 2 render failure

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use forgeviews_core::{Dictionary, Engine, EngineConfig, ViewError};

#[derive(Parser)]
#[command(name = "forgeviews-cli")]
#[command(about = "ForgeViews CLI - View Compiler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to views directory
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Persist compiled views here instead of in memory
    #[arg(short, long)]
    cache_dir: Option<PathBuf>,

    /// JSON engine config; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Map faults back to template source lines
    #[arg(short, long)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a view
    Render {
        /// View identity, e.g. layouts/main
        view: String,

        /// JSON object passed as the data dictionary
        #[arg(long, default_value = "{}")]
        data: String,
    },

    /// Check whether a view exists
    Exists { view: String },

    /// Compile a view and its layouts into the cache
    Compile { view: String },

    /// Remove cache entries of earlier revisions of a view
    Prune { view: String },
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(e) => eprintln!("Failed to encode output: {}", e),
    }
}

fn failure(error: impl std::fmt::Display) -> Value {
    json!({ "success": false, "error": error.to_string() })
}

fn load_config(cli: &Cli) -> Result<EngineConfig, ViewError> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(root) = &cli.root {
        config.root = root.clone();
    }
    if let Some(dir) = &cli.cache_dir {
        config.cache_dir = Some(dir.clone());
    }
    if cli.debug {
        config.debug = true;
    }
    Ok(config)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let engine = match load_config(&cli).and_then(Engine::new) {
        Ok(engine) => engine,
        Err(e) => {
            print_json(&failure(format!("Failed to load engine: {}", e)));
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Render { view, data } => {
            let data: Dictionary = match serde_json::from_str(&data) {
                Ok(d) => d,
                Err(e) => {
                    print_json(&failure(format!("Invalid data: {}", e)));
                    return ExitCode::FAILURE;
                }
            };

            match engine.render(&view, data) {
                Ok(html) => {
                    print_json(&json!({ "success": true, "view": view, "html": html }));
                    ExitCode::SUCCESS
                }
                Err(ViewError::View(exception)) => {
                    print_json(&json!({ "success": false, "exception": exception }));
                    ExitCode::from(2)
                }
                Err(e) if e.is_execution_fault() => {
                    // Source and variables stay out of production output
                    tracing::error!(view = %view, error = %e, "view render failed");
                    print_json(&failure("View render failed"));
                    ExitCode::from(2)
                }
                Err(e) => {
                    print_json(&failure(e));
                    ExitCode::from(2)
                }
            }
        }

        Commands::Exists { view } => {
            let exists = engine.view_exists(&view);
            print_json(&json!({ "view": view, "exists": exists }));
            ExitCode::SUCCESS
        }

        Commands::Compile { view } => match engine.compile(&view) {
            Ok(chain) => {
                let compiled: Vec<_> = chain
                    .iter()
                    .map(|fragment| {
                        json!({
                            "view": fragment.view,
                            "fingerprint": fragment.fingerprint,
                            "parent": fragment.parent,
                            "blocks": fragment.block_names,
                        })
                    })
                    .collect();
                print_json(&json!({ "success": true, "chain": compiled }));
                ExitCode::SUCCESS
            }
            Err(e) => {
                print_json(&failure(e));
                ExitCode::FAILURE
            }
        },

        Commands::Prune { view } => match engine.prune_cache(&view) {
            Ok(removed) => {
                print_json(&json!({ "success": true, "view": view, "removed": removed }));
                ExitCode::SUCCESS
            }
            Err(e) => {
                print_json(&failure(e));
                ExitCode::FAILURE
            }
        },
    }
}
