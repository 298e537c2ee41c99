//! Tessera CLI: inspect and evaluate bindings from the command line.
//!
//! ```text
//! tessera deps --kind script-query 'SELECT @region'
//! tessera eval --kind script-query --globals g.json '{"region": @region}'
//! tessera config
//! ```
//!
//! `eval` runs script kinds on a worker pool whose runner renders `@name`
//! placeholders with global values and parses the result as JSON.

mod template;

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tessera_bindings::{Binding, EvaluatorRegistry};
use tessera_config::TesseraConfig;
use tessera_globals::{GlobalStore, SharedGlobals};
use tessera_pool::WorkerPool;
use tessera_types::{EvalError, GlobalsMap};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Evaluate dashboard bindings against a set of globals")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the globals a binding depends on
    Deps {
        /// Binding kind (global, none, script-js, script-query, kernel)
        #[arg(long)]
        kind: String,
        text: String,
    },
    /// Evaluate one binding and print its value as JSON
    Eval {
        #[arg(long)]
        kind: String,
        /// Cancellation group the evaluation runs under
        #[arg(long, default_value = "cli")]
        group: String,
        /// JSON file of `{"name": {"type": ..., "value": ...}}` globals
        #[arg(long)]
        globals: Option<PathBuf>,
        text: String,
    },
    /// Print the effective configuration
    Config,
}

fn init_tracing(default_filter: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warnings.push(format!(
                    "Failed to create log dir {}: {e}",
                    parent.display()
                ));
                continue;
            }
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.tessera/logs/tessera.log
    if let Some(dir) = tessera_config::data_dir() {
        candidates.push(dir.join("logs").join("tessera.log"));
    }

    // Fallback: ./.tessera/logs/tessera.log
    candidates.push(PathBuf::from(".tessera").join("logs").join("tessera.log"));

    candidates
}

fn load_globals(path: &Path) -> Result<SharedGlobals> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read globals from {}", path.display()))?;
    let map: GlobalsMap = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse globals in {}", path.display()))?;

    let mut store = GlobalStore::new();
    for (name, global) in map {
        store
            .add_global(&name, global.type_tag, global.value)
            .with_context(|| format!("invalid global '{name}'"))?;
    }
    store.set_clean();
    Ok(SharedGlobals::new(store))
}

fn print_deps(config: &TesseraConfig, kind: String, text: String) -> Result<()> {
    let registry = EvaluatorRegistry::builder(SharedGlobals::default())
        .config(config.bindings.clone())
        .build();
    let deps = registry.globals_for_binding(&Binding::new(kind, text));
    println!("{}", serde_json::to_string(&deps)?);
    Ok(())
}

async fn eval(
    config: TesseraConfig,
    kind: String,
    group: String,
    globals: Option<PathBuf>,
    text: String,
) -> Result<()> {
    let globals = match globals {
        Some(path) => load_globals(&path)?,
        None => SharedGlobals::default(),
    };

    let pool = WorkerPool::builder(template::factory)
        .config(config.pool)
        .globals(globals.clone())
        .start();
    let registry = EvaluatorRegistry::builder(globals)
        .pool(pool.clone())
        .config(config.bindings)
        .build();

    let binding = Binding::new(kind, text);
    tracing::info!(kind = %binding.kind, group = %group, "Evaluating from command line");
    let result = registry.evaluate(&group, &binding).await;
    pool.shutdown().await;

    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(EvalError::Canceled) => bail!("evaluation was canceled"),
        Err(err) => Err(err).context("evaluation failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = TesseraConfig::load();
    init_tracing(
        config
            .as_ref()
            .map_or("info", |config| config.logging.filter.as_str()),
    );
    if let Err(err) = &config {
        tracing::warn!(path = %err.path().display(), "{err}");
    }
    let config = config.context("failed to load configuration")?;

    match cli.command {
        Commands::Deps { kind, text } => print_deps(&config, kind, text),
        Commands::Eval {
            kind,
            group,
            globals,
            text,
        } => eval(config, kind, group, globals, text).await,
        Commands::Config => {
            let path = tessera_config::config_path()
                .map_or_else(|| "<none>".to_string(), |p| p.display().to_string());
            println!("# {path}");
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}
