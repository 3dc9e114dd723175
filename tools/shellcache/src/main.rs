//! Command-line host for the shellcache offline service worker.
//!
//! Runs the worker against a real origin with the cache store persisted to a
//! JSON snapshot between invocations.
//!
//! ## Usage
//!
//! ```bash
//! # Precache and activate the configured release
//! shellcache --config worker.json install
//!
//! # Fetch through the active worker (relative URLs resolve against the scope)
//! shellcache --config worker.json fetch ./manifest.json
//!
//! # See what an offline navigation gets
//! shellcache --config worker.json fetch ./history --navigate --offline
//!
//! # Inspect the store
//! shellcache --store ./store.json caches --name hesaplayicilar-v1.0.0
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use shellcache_common::{
    init_logging, LogConfig, LogFormat, OptionExt, Result, ResultExt, ShellCacheError,
};
use shellcache_net::{Fetcher, HttpFetcher, LoaderConfig, MemoryFetcher, Request};
use shellcache_sw::{CacheStorage, ServiceWorkerContainer, ServiceWorkerEvent, WorkerConfig};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "shellcache")]
#[command(about = "Offline cache service worker host")]
struct Cli {
    /// Worker config file (JSON); built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Cache store snapshot file [default: <local data dir>/shellcache/store.json]
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    /// Cap the store at this many body bytes
    #[arg(long, global = true)]
    quota: Option<u64>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Precache the configured release and activate it
    Install,

    /// Fetch a URL through the active worker and print the body
    Fetch {
        /// Absolute URL, or relative to the worker scope
        url: String,
        /// Send as a document navigation
        #[arg(long)]
        navigate: bool,
        /// Simulate a network with no connectivity
        #[arg(long)]
        offline: bool,
    },

    /// List caches in the store
    Caches {
        /// List the request keys of one cache
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Print the effective worker config
    Config,
}

#[derive(Debug, Serialize)]
struct CacheSummary {
    name: String,
    entries: usize,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    if let Err(e) = init_logging(LogConfig::from_verbosity(cli.verbose).with_format(format)) {
        eprintln!("warning: {e}");
    }

    if let Err(e) = run(&cli).await {
        error!(category = e.category(), error = %e, "Command failed");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };

    let store = match &cli.store {
        Some(path) => path.clone(),
        None => default_store()?,
    };

    match &cli.command {
        Commands::Install => install(&store, cli.quota, config).await,
        Commands::Fetch {
            url,
            navigate,
            offline,
        } => fetch(&store, cli.quota, config, url, *navigate, *offline).await,
        Commands::Caches { name } => list_caches(&store, cli.quota, name.as_deref()).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn install(store: &Path, quota: Option<u64>, config: WorkerConfig) -> Result<()> {
    let storage = open_store(store, quota).await?;
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(&config.scope, LoaderConfig::default())?);
    let (container, mut events) =
        ServiceWorkerContainer::new(config.scope.clone(), Arc::clone(&storage), fetcher);

    let namespace = config.namespace()?;
    let result = container.register(config).await;
    print_events(&mut events);
    let id = result?;

    container.wait_idle().await;
    storage.save_snapshot(store).await?;
    info!(worker = id.raw(), cache = %namespace, "Install finished");
    println!(
        "{namespace}: {} entries",
        storage.entry_count(&namespace.to_string()).await
    );
    Ok(())
}

async fn fetch(
    store: &Path,
    quota: Option<u64>,
    config: WorkerConfig,
    url: &str,
    navigate: bool,
    offline: bool,
) -> Result<()> {
    let storage = open_store(store, quota).await?;
    let fetcher: Arc<dyn Fetcher> = if offline {
        let fetcher = MemoryFetcher::new(&config.scope);
        fetcher.set_offline(true);
        Arc::new(fetcher)
    } else {
        Arc::new(HttpFetcher::new(&config.scope, LoaderConfig::default())?)
    };

    let url = config.resolve(url)?;
    let (container, mut events) =
        ServiceWorkerContainer::new(config.scope.clone(), Arc::clone(&storage), fetcher);
    container.resume(config).await.map_err(|e| {
        ShellCacheError::lifecycle_with_source("no installed worker; run `shellcache install` first", e)
    })?;

    let request = if navigate {
        Request::navigate(url)
    } else {
        Request::get(url)
    };
    let response = container.handle_fetch(request).await?;
    container.wait_idle().await;
    print_events(&mut events);
    storage.save_snapshot(store).await?;

    eprintln!("{} {}", response.status, response.status_text);
    for (name, value) in response.headers.iter() {
        eprintln!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()));
    }
    std::io::stdout()
        .write_all(&response.body)
        .context("writing response body")?;
    Ok(())
}

async fn list_caches(store: &Path, quota: Option<u64>, name: Option<&str>) -> Result<()> {
    let storage = open_store(store, quota).await?;

    if let Some(name) = name {
        let keys = storage
            .request_keys(name)
            .await
            .ok_or_not_found(format!("cache {name}"))?;
        for key in keys {
            println!("{key}");
        }
        return Ok(());
    }

    let mut summaries = Vec::new();
    for name in storage.keys().await {
        let entries = storage.entry_count(&name).await;
        summaries.push(CacheSummary { name, entries });
    }
    println!("{}", serde_json::to_string_pretty(&summaries)?);
    eprintln!("{} bytes in use", storage.usage().await);
    Ok(())
}

fn default_store() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir().ok_or_not_found("local data directory")?;
    Ok(data_dir.join("shellcache").join("store.json"))
}

async fn open_store(path: &Path, quota: Option<u64>) -> Result<Arc<CacheStorage>> {
    let storage = CacheStorage::load_snapshot(path, quota).await?;
    Ok(Arc::new(storage))
}

fn print_events(events: &mut UnboundedReceiver<ServiceWorkerEvent>) {
    while let Ok(event) = events.try_recv() {
        match event {
            ServiceWorkerEvent::StateChange {
                worker_id,
                new_state,
                ..
            } => eprintln!("worker {}: {:?}", worker_id.raw(), new_state),
            ServiceWorkerEvent::CacheDeleted { name } => eprintln!("deleted cache {name}"),
            other => info!(event = ?other, "Worker event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fetch() {
        let cli = Cli::try_parse_from([
            "shellcache",
            "-vv",
            "--store",
            "/tmp/store.json",
            "fetch",
            "./index.html",
            "--navigate",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/store.json")));
        match cli.command {
            Commands::Fetch {
                url,
                navigate,
                offline,
            } => {
                assert_eq!(url, "./index.html");
                assert!(navigate);
                assert!(!offline);
            }
            _ => panic!("expected fetch"),
        }
    }

    #[tokio::test]
    async fn test_caches_on_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "shellcache",
            "--store",
            dir.path().join("store.json").to_str().unwrap(),
            "caches",
            "--name",
            "calc-v1.0.0",
        ])
        .unwrap();

        let err = run(&cli).await.unwrap_err();
        assert_eq!(err.category(), "not_found");
    }

    #[tokio::test]
    async fn test_fetch_without_install_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "shellcache",
            "--store",
            dir.path().join("store.json").to_str().unwrap(),
            "fetch",
            "./",
            "--offline",
        ])
        .unwrap();

        let err = run(&cli).await.unwrap_err();
        assert_eq!(err.category(), "lifecycle");
    }
}
