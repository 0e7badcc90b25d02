mod config;
mod logging;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

use smartcart_store::backup;
use smartcart_store::connectivity::ManualConnectivity;
use smartcart_store::kv::{Kv, SqliteStorage};
use smartcart_store::migration::{MigrationEngine, CURRENT_VERSION};
use smartcart_store::store::SliceKey;
use smartcart_store::sync::UnavailableRemote;
use smartcart_store::{DataLayer, DataLayerOptions};

#[derive(Parser, Debug)]
#[command(name = "smartcart")]
#[command(about = "Inspect and maintain the SmartCart local data store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/smartcart/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Data directory (overrides config and SMARTCART_DATA_DIR)
  #[arg(short, long)]
  data_dir: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show schema version, stored slices, queue and cache state
  Status,
  /// Run pending schema migrations
  Migrate,
  /// Clear one slice, or all of them
  Clear {
    /// lists, malls, settings or prices
    slice: Option<String>,
  },
  /// Inspect or clear the cache
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Inspect or clear the sync queue
  #[command(subcommand)]
  Queue(QueueCommand),
  /// Write a backup of all slices
  Backup { path: PathBuf },
  /// Replace all slices with the contents of a backup
  Restore { path: PathBuf },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  Stats,
  Clear,
  Get { key: String },
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  List,
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;
  if let Some(dir) = args.data_dir {
    config.data_dir = Some(dir);
  }
  let data_dir = config.data_dir()?;

  let _log_guard = logging::init(&config.log.level, &data_dir, args.verbose)?;

  // Every command goes through init so migrations run before any slice is read
  let storage = SqliteStorage::open_in(&data_dir)?;
  let data = DataLayer::init(
    Kv::new(storage),
    Arc::new(UnavailableRemote),
    Arc::new(ManualConnectivity::new(config.sync.start_online)),
    DataLayerOptions {
      default_ttl: config.default_ttl(),
    },
  )
  .await;

  let result = run(&data, args.command).await;
  data.dispose();
  result
}

async fn run(data: &DataLayer, command: Command) -> Result<()> {
  match command {
    Command::Status => {
      let (stored, target) = schema_versions(data).await?;
      println!("schema version: {stored} (target {target})");
      println!("startup migration: {:?}", data.migration());
      for key in SliceKey::ALL {
        let present = data.store().load_raw(key).await.is_some();
        println!("slice {key}: {}", if present { "stored" } else { "empty" });
      }
      println!("sync: {}", serde_json::to_string_pretty(&data.sync().get_status())?);
      println!("cache: {}", serde_json::to_string_pretty(&data.cache().stats().await?)?);
    }
    Command::Migrate => {
      println!("{:?}", data.migration());
    }
    Command::Clear { slice: Some(name) } => {
      let key = parse_slice(&name)?;
      data.store().clear(key).await?;
      println!("cleared {key}");
    }
    Command::Clear { slice: None } => {
      data.store().clear_all().await?;
      println!("cleared all slices");
    }
    Command::Cache(CacheCommand::Stats) => {
      println!("{}", serde_json::to_string_pretty(&data.cache().stats().await?)?);
    }
    Command::Cache(CacheCommand::Clear) => {
      let removed = data.cache().clear().await?;
      println!("removed {removed} persisted entries");
    }
    Command::Cache(CacheCommand::Get { key }) => match data.cache().lookup::<Value>(&key).await {
      Some(hit) => {
        println!("source: {:?}", hit.source);
        if let Some(at) = hit.cached_at {
          println!("cached at: {}", at.to_rfc3339());
        }
        println!("{}", serde_json::to_string_pretty(&hit.data)?);
      }
      None => println!("miss"),
    },
    Command::Queue(QueueCommand::List) => {
      let status = data.sync().get_status();
      for change in &status.queue {
        println!(
          "{}\t{}\t{}\t{}",
          change.id,
          change.change_type,
          change.created_at.to_rfc3339(),
          change.payload
        );
      }
      println!("{} pending", status.queue_length);
    }
    Command::Queue(QueueCommand::Clear) => {
      data.sync().clear_queue().await?;
      println!("sync queue cleared");
    }
    Command::Backup { path } => {
      let summary = backup::create_backup(data.store(), &path).await?;
      println!(
        "wrote {} slices to {}",
        summary.slices.len(),
        summary.path.display()
      );
    }
    Command::Restore { path } => {
      let summary = backup::restore_backup(data.store(), &path).await?;
      println!(
        "restored {} slices from backup taken {}",
        summary.slices.len(),
        summary.timestamp.to_rfc3339()
      );
    }
  }

  Ok(())
}

/// Persisted and target schema versions.
async fn schema_versions(data: &DataLayer) -> Result<(u32, u32)> {
  let stored = MigrationEngine::new(data.store().clone())
    .current_version()
    .await?;
  Ok((stored, CURRENT_VERSION))
}

fn parse_slice(name: &str) -> Result<SliceKey> {
  SliceKey::from_name(name).ok_or_else(|| {
    let names: Vec<_> = SliceKey::ALL.iter().map(|k| k.name()).collect();
    eyre!("Unknown slice '{}'. Expected one of: {}", name, names.join(", "))
  })
}
