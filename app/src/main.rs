mod activity;
mod console;
mod form;
mod repl;

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::Parser;
use directories::BaseDirs;
use stompmiru_broker::LoopbackBroker;
use stompmiru_storage::{ConfigStore, FileKeyValueStore};

use crate::console::Console;

type Result<T> = anyhow::Result<T>;

/// Interactive console for STOMP brokers: keep connection profiles, connect,
/// subscribe and watch what arrives.
#[derive(Debug, Parser)]
#[command(name = "stompmiru", version)]
struct Args {
    /// Directory holding the stored profiles.
    #[arg(long, env = "STOMPMIRU_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("stompmiru failed: {err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log);
    let config_dir = match args.config_dir {
        Some(dir) => ensure_dir(dir)?,
        None => resolve_config_dir()?,
    };
    tracing::info!("Using config directory {}", config_dir.display());

    let store = ConfigStore::load(FileKeyValueStore::new(&config_dir));
    let broker = LoopbackBroker::new();
    let console = Console::new(store, Arc::new(broker.clone()));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;
    runtime.block_on(repl::run(console, broker))
}

fn init_tracing(default_filter: &str) {
    use std::sync::OnceLock;
    static INIT: OnceLock<()> = OnceLock::new();
    INIT.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    });
}

fn resolve_config_dir() -> Result<PathBuf> {
    let base_dirs = BaseDirs::new().context("Unable to determine config directory")?;
    let dir_name = if cfg!(target_os = "linux") {
        "stompmiru"
    } else {
        "StompMiru"
    };
    ensure_dir(base_dirs.config_dir().join(dir_name))
}

fn ensure_dir(dir: PathBuf) -> Result<PathBuf> {
    fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(dir)
}
