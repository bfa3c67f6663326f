use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use fieldsync::api::{ApiError, ApiRequest, RemoteApi, RemoteClient};
use fieldsync::cache::{CacheResult, Cacheable, OfflineCache};
use fieldsync::config::Config;
use fieldsync::db::{Database, SqliteStore};
use fieldsync::entities::{Client, WarehouseTransfer, CLIENTS, WAREHOUSE_TRANSFERS};
use fieldsync::handlers::{ClientSyncHandler, TransferSyncHandler};
use fieldsync::logging;
use fieldsync::sync::{
  HandlerRegistry, OperationKind, SyncConfig, SyncContext, SyncJob, SyncManager, SyncWorker,
};
use fieldsync::telemetry::{FanoutLog, HttpRemoteLog, RemoteLog, TracingLog};
use reqwest::Method;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline cache and background sync for field-sales data")]
#[command(version)]
struct Cli {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Inspect and drive the sync queue
  #[command(subcommand)]
  Sync(SyncCommand),
  /// Inspect and maintain the offline cache
  #[command(subcommand)]
  Cache(CacheCommand),
}

#[derive(Subcommand, Debug)]
enum SyncCommand {
  /// Run the scheduler until interrupted
  Run {
    /// Drain currently due jobs and exit
    #[arg(long)]
    once: bool,
  },
  /// Queue a mutation for synchronization
  Enqueue {
    entity_type: String,
    entity_id: String,
    #[arg(long, value_parser = parse_operation)]
    op: OperationKind,
    /// Drop not-yet-started jobs for the same entity
    #[arg(long)]
    replace: bool,
    /// Extra context passed to the handler
    #[arg(long = "data", value_parser = parse_key_val)]
    data: Vec<(String, String)>,
  },
  /// Show the jobs recorded for an entity
  Status(EntityArgs),
  /// Remove not-yet-started jobs for an entity
  Cancel(EntityArgs),
  /// Delete finished jobs older than the given age
  Purge {
    #[arg(long, default_value_t = 7)]
    days: u64,
  },
}

#[derive(Args, Debug)]
struct EntityArgs {
  entity_type: String,
  entity_id: String,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Print the cached items and their freshness
  Show { entity: String },
  /// Delete the cached snapshot
  Clear { entity: String },
  /// Fetch from the server unless the cache is fresh
  Refresh {
    entity: String,
    /// Ignore a fresh cache
    #[arg(long)]
    force: bool,
  },
}

fn parse_operation(s: &str) -> Result<OperationKind, String> {
  s.parse()
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
  let (key, value) = s
    .split_once('=')
    .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
  if key.is_empty() {
    return Err(format!("empty key in '{}'", s));
  }
  Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let cli = Cli::parse();
  let config = Config::load(cli.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  match cli.command {
    Command::Sync(command) => run_sync(&config, command).await,
    Command::Cache(command) => run_cache(&config, command).await,
  }
}

fn remote_api(config: &Config) -> Result<Arc<dyn RemoteApi>> {
  Ok(Arc::new(RemoteClient::new(&config.api)?))
}

fn build_manager(config: &Config) -> Result<SyncManager> {
  let db = Arc::new(Database::open(&config.sync.database_path()?)?);
  let api = remote_api(config)?;
  let store = Arc::new(SqliteStore::new(Arc::clone(&db)));

  let mut registry = HandlerRegistry::new();
  registry
    .register(ClientSyncHandler::new(store.clone(), Arc::clone(&api)))
    .register(TransferSyncHandler::new(store, Arc::clone(&api)));

  let remote_log: Arc<dyn RemoteLog> = match &config.api.log_endpoint {
    Some(endpoint) => Arc::new(FanoutLog(vec![
      Arc::new(TracingLog),
      Arc::new(HttpRemoteLog::new(api, endpoint.clone())),
    ])),
    None => Arc::new(TracingLog),
  };

  let worker = SyncWorker::new(Arc::new(registry), remote_log);
  Ok(SyncManager::new(db, worker, &config.sync))
}

/// Transmission preset for an entity type.
fn sync_config(config: &Config, entity_type: &str) -> SyncConfig {
  let preset = match entity_type {
    CLIENTS => SyncConfig::with_attachments(entity_type),
    _ => SyncConfig::standard(entity_type),
  };
  preset.with_retry_policy(config.sync.retry)
}

async fn run_sync(config: &Config, command: SyncCommand) -> Result<()> {
  let manager = build_manager(config)?;

  match command {
    SyncCommand::Run { once: true } => {
      let attempts = manager.run_pending().await?;
      let pending = manager.pending_count().await?;
      println!("Ran {} attempt(s), {} job(s) still pending", attempts, pending);
    }
    SyncCommand::Run { once: false } => {
      manager.start().await?;
      info!("Press Ctrl-C to stop");
      tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
      manager.shutdown().await?;
    }
    SyncCommand::Enqueue {
      entity_type,
      entity_id,
      op,
      replace,
      data,
    } => {
      let mut context: SyncContext = data.into_iter().collect();
      if context.user_id().is_none() {
        if let Some(user_id) = &config.api.user_id {
          context = context.with(SyncContext::USER_ID, user_id.as_str());
        }
      }
      let sync_config = sync_config(config, &entity_type);
      let id = manager
        .enqueue(&entity_id, op, sync_config, context, replace)
        .await?;
      println!("Enqueued job {}", id);
    }
    SyncCommand::Status(args) => {
      let jobs = manager.jobs_for(&args.entity_type, &args.entity_id).await?;
      if jobs.is_empty() {
        println!("No jobs for {} {}", args.entity_type, args.entity_id);
      }
      for job in &jobs {
        println!("{}", describe_job(job));
      }
    }
    SyncCommand::Cancel(args) => {
      let removed = manager.cancel(&args.entity_type, &args.entity_id).await?;
      println!("Cancelled {} job(s)", removed);
    }
    SyncCommand::Purge { days } => {
      let purged = manager
        .purge_finished(Duration::from_secs(days * 24 * 60 * 60))
        .await?;
      println!("Purged {} finished job(s)", purged);
    }
  }

  Ok(())
}

fn format_millis(ms: i64) -> String {
  chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms)
    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
    .unwrap_or_else(|| ms.to_string())
}

fn describe_job(job: &SyncJob) -> String {
  let mut line = format!(
    "#{:<6} {:<7} {:<19} attempts={} updated={}",
    job.id,
    job.operation.kind(),
    job.state,
    job.attempts,
    format_millis(job.updated_at)
  );
  if job.state.is_pending() {
    line.push_str(&format!(" next={}", format_millis(job.run_at)));
  }
  if let Some(error) = &job.last_error {
    line.push_str(&format!(" error={}", error));
  }
  line
}

async fn run_cache(config: &Config, command: CacheCommand) -> Result<()> {
  let entity = match &command {
    CacheCommand::Show { entity }
    | CacheCommand::Clear { entity }
    | CacheCommand::Refresh { entity, .. } => entity.clone(),
  };

  match entity.as_str() {
    CLIENTS => cache_command::<Client>(config, command, CLIENTS).await,
    WAREHOUSE_TRANSFERS => {
      cache_command::<WarehouseTransfer>(config, command, "warehouse-transfers").await
    }
    other => Err(eyre!(
      "Unknown entity '{}' (expected {} or {})",
      other,
      CLIENTS,
      WAREHOUSE_TRANSFERS
    )),
  }
}

async fn cache_command<T: Cacheable>(
  config: &Config,
  command: CacheCommand,
  remote_path: &str,
) -> Result<()> {
  let cache = OfflineCache::<T>::new(
    &config.cache.dir()?,
    config.cache.settings_for(T::entity_type()),
  );

  let result = match command {
    CacheCommand::Clear { .. } => {
      cache.clear().await?;
      println!("Cleared {}", cache.path().display());
      return Ok(());
    }
    CacheCommand::Show { .. } => cache.get().await,
    CacheCommand::Refresh { force, .. } => {
      if force {
        cache.clear().await?;
      }
      let api = remote_api(config)?;
      let request = ApiRequest::empty(Method::GET, remote_path);
      cache
        .fetch_list(|| async move {
          let body = api.send(request).await?;
          serde_json::from_value::<Vec<T>>(body).map_err(|e| ApiError::Decode(e.to_string()))
        })
        .await
    }
  };

  print_cache_result(T::entity_type(), &result)
}

fn print_cache_result<T: Cacheable>(entity: &str, result: &CacheResult<Vec<T>>) -> Result<()> {
  let status = match result {
    CacheResult::Success { .. } => "fresh",
    CacheResult::Expired { .. } => "expired",
    CacheResult::Empty => "empty",
    CacheResult::Error(e) => return Err(eyre!("Cache error for {}: {}", entity, e)),
  };

  println!("{}: {}", entity, status);
  if let Some(metadata) = result.metadata() {
    println!(
      "  written {} (version {}, source {:?}, age {}s)",
      format_millis(metadata.timestamp),
      metadata.version,
      metadata.source,
      metadata.age().as_secs()
    );
  }
  if let Some(items) = result.data() {
    for item in items {
      println!("  {}", serde_json::to_string(item)?);
    }
  }
  Ok(())
}
