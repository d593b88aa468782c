use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vaultsync::cache::SqliteStore;
use vaultsync::config::Config;
use vaultsync::event::EventHandler;
use vaultsync::net::HttpFetcher;
use vaultsync::notify::NotificationIntent;
use vaultsync::platform::{Platform, WindowClient};
use vaultsync::sync::{SyncQueue, VaultBackend, SYNC_TAG};
use vaultsync::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "vaultsync")]
#[command(about = "Offline cache and deferred-sync worker for the vault app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/vaultsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the directory holding cache.db, queue.db and logs
  #[arg(short, long)]
  data_dir: Option<PathBuf>,
}

/// Platform adapter for headless daemon operation: there is no window
/// surface, so notifications go to the log and clicks cannot be routed.
/// Embedding hosts provide a real implementation instead.
struct HeadlessPlatform;

impl Platform for HeadlessPlatform {
  fn windows(&self) -> Vec<WindowClient> {
    Vec::new()
  }

  fn focus_window(&self, id: u64) -> Result<()> {
    Err(eyre!("no window surface (window {})", id))
  }

  fn open_window(&self, url: &str) -> Result<WindowClient> {
    Err(eyre!("no window surface to open {}", url))
  }

  fn claim_clients(&self, generation: &str) -> Result<()> {
    info!(generation, "generation active");
    Ok(())
  }

  fn show_notification(&self, intent: &NotificationIntent) -> Result<u64> {
    info!(title = %intent.title, body = %intent.body, url = %intent.target_url, "notification");
    Ok(0)
  }

  fn close_notification(&self, _id: u64) -> Result<()> {
    Ok(())
  }
}

fn init_logging(data_dir: &Path) -> Result<tracing_appender::non_blocking::WorkerGuard> {
  let appender = tracing_appender::rolling::daily(data_dir.join("logs"), "vaultsync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override data directory if specified on command line
  let config = if let Some(data_dir) = args.data_dir {
    Config {
      data_dir: Some(data_dir),
      ..config
    }
  } else {
    config
  };

  let data_dir = config.data_dir()?;
  std::fs::create_dir_all(&data_dir)
    .map_err(|e| eyre!("Failed to create data directory {}: {}", data_dir.display(), e))?;
  let _log_guard = init_logging(&data_dir)?;

  // Persistent stores
  let store = Arc::new(SqliteStore::open(&data_dir.join("cache.db"))?);
  let queue = Arc::new(SyncQueue::open(&data_dir.join("queue.db"))?);

  let timeout = Duration::from_secs(config.sync.request_timeout_secs);
  let fetcher = HttpFetcher::new(timeout)?;
  let backend = VaultBackend::new(&config)?;

  // Event sources: connectivity probe fires the sync trigger on
  // offline→online edges, ctrl-c requests shutdown
  let events = EventHandler::new();
  events.spawn_shutdown_signal();
  events.spawn_connectivity_probe(
    fetcher.clone(),
    config.probe_url()?,
    Duration::from_secs(config.sync.probe_interval_secs),
    SYNC_TAG.to_string(),
  );

  let mut worker = Worker::new(
    &config,
    store,
    queue,
    backend,
    Arc::new(HeadlessPlatform),
    fetcher,
    events,
  )?;

  info!(generation = %config.generation_label(), "vaultsync worker starting");
  worker.run().await
}
