//! slatecache - maintenance CLI for the offline content cache.
//!
//! Opens the on-disk cache for the configured device, wires the HTTP
//! client and runs one command against it.

use std::io;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use slatecache_core::{
    Config, ContentService, DeviceCredentials, Drawing, Entity, EntityKind, Event, Fetched,
    FileStore, GetOptions, HttpContentClient, Note, SharedPolicy,
};

// ============================================================================
// Constants
// ============================================================================

/// Used when neither the config file nor the environment names a server
const DEFAULT_SERVER_URL: &str = "http://localhost:8080";

const ENV_SERVER_URL: &str = "SLATECACHE_SERVER_URL";
const ENV_DEVICE_ID: &str = "SLATECACHE_DEVICE_ID";
const ENV_TOKEN: &str = "SLATECACHE_TOKEN";
const ENV_LOG_FILE: &str = "SLATECACHE_LOG_FILE";

const USAGE: &str = "usage: slatecache <command>

commands:
  stats                          show cache size and sync state
  evict                          expire and trim the cache now
  sync [scope]                   push unsynced local changes
  get <kind> <id> [--refresh]    read one entity, cache first
  preload <kind> <scope> <id>... fetch entities ahead of use";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Stats,
    Evict,
    Sync { scope: Option<String> },
    Get { kind: EntityKind, id: String, refresh: bool },
    Preload { kind: EntityKind, scope: String, ids: Vec<String> },
}

fn parse_kind(value: &str) -> Result<EntityKind> {
    value.parse::<EntityKind>().map_err(|e| anyhow!(e))
}

fn parse_args(args: &[String]) -> Result<Command> {
    let command = args.first().ok_or_else(|| anyhow!(USAGE))?;
    match command.as_str() {
        "stats" => Ok(Command::Stats),
        "evict" => Ok(Command::Evict),
        "sync" => Ok(Command::Sync {
            scope: args.get(1).cloned(),
        }),
        "get" => {
            let (kind, id) = match (args.get(1), args.get(2)) {
                (Some(kind), Some(id)) => (parse_kind(kind)?, id.clone()),
                _ => bail!(USAGE),
            };
            let refresh = args[3..].iter().any(|a| a == "--refresh");
            Ok(Command::Get { kind, id, refresh })
        }
        "preload" => {
            if args.len() < 4 {
                bail!(USAGE);
            }
            Ok(Command::Preload {
                kind: parse_kind(&args[1])?,
                scope: args[2].clone(),
                ids: args[3..].to_vec(),
            })
        }
        other => bail!("unknown command '{}'\n\n{}", other, USAGE),
    }
}

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr; with `SLATECACHE_LOG_FILE=1` they are also written to a
/// daily file under the cache directory. The returned guard flushes on drop.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let log_dir = std::env::var(ENV_LOG_FILE)
        .ok()
        .filter(|v| v == "1")
        .and_then(|_| config.cache_dir().ok())
        .map(|dir| dir.join("logs"));

    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "slatecache.log"));
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

/// Config file values, overridden by the environment
fn load_config() -> Result<Config> {
    let mut config = Config::load()?;
    if let Ok(url) = std::env::var(ENV_SERVER_URL) {
        config.server_url = Some(url);
    }
    if let Ok(device) = std::env::var(ENV_DEVICE_ID) {
        config.device_id = Some(device);
    }
    Ok(config)
}

fn build_client(config: &Config) -> Result<HttpContentClient> {
    let url = config.server_url.as_deref().unwrap_or(DEFAULT_SERVER_URL);
    let mut client = HttpContentClient::new(url)?;
    match (config.device_id.clone(), std::env::var(ENV_TOKEN).ok()) {
        (Some(device_id), Some(token)) => {
            client.set_credentials(DeviceCredentials { device_id, token })
        }
        _ => info!("No device credentials configured, sending unauthenticated requests"),
    }
    Ok(client)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let config = load_config()?;
    let _log_guard = init_tracing(&config);

    let cache_dir = config.cache_dir()?;
    info!(dir = %cache_dir.display(), "Opening cache");
    let store = FileStore::open(cache_dir).await?;
    let client = build_client(&config)?;

    let service = ContentService::new(
        Arc::new(store),
        Arc::new(client),
        SharedPolicy::new(config.policy.clone()),
    );
    if let Some(report) = service.startup().await? {
        if report.removed() > 0 {
            eprintln!(
                "Startup eviction removed {} entries ({} bytes)",
                report.removed(),
                report.bytes_freed
            );
        }
    }

    let result = run(&service, command).await;
    service.shutdown().await;
    result
}

async fn run(service: &ContentService, command: Command) -> Result<()> {
    match command {
        Command::Stats => {
            let stats = service.get_cache_stats().await?;
            let status = service.sync_status().await?;
            let policy = service.policy();
            println!("entries:     {}", stats.count);
            println!(
                "size:        {} / {} bytes",
                stats.size_bytes, policy.max_size_bytes
            );
            println!("unsynced:    {}", status.dirty_count);
            if let Some(failure) = status.last_failure {
                println!("last error:  {} ({}): {}", failure.key, failure.at, failure.reason);
            }
        }
        Command::Evict => {
            let report = service.evict().await?;
            println!(
                "expired {}, evicted {}, freed {} bytes, {} -> {} bytes",
                report.expired,
                report.evicted,
                report.bytes_freed,
                report.size_before,
                report.size_after
            );
            if report.over_budget {
                println!("cache is still over budget: remaining entries hold unsynced changes");
            } else if report.pass_limit_reached {
                println!("stopped after {} passes, run again to continue", report.passes);
            }
        }
        Command::Sync { scope } => {
            let report = service.sync_pending(scope.as_deref()).await?;
            println!(
                "synced {} of {} ({} conflicts, {} failed)",
                report.synced, report.attempted, report.conflicts, report.failed
            );
            if report.offline {
                println!("server unreachable, remaining changes kept for later");
            }
        }
        Command::Get { kind, id, refresh } => {
            let options = GetOptions {
                force_refresh: refresh,
            };
            match kind {
                EntityKind::Event => print_fetched(service.get::<Event>(&id, options).await?)?,
                EntityKind::Note => print_fetched(service.get::<Note>(&id, options).await?)?,
                EntityKind::Drawing => print_fetched(service.get::<Drawing>(&id, options).await?)?,
            }
        }
        Command::Preload { kind, scope, ids } => {
            let report = service.preload(kind, ids, scope).join().await;
            println!(
                "stored {}, already cached {}, missing {}, failed batches {}",
                report.stored, report.already_cached, report.missing, report.failed_batches
            );
        }
    }
    Ok(())
}

fn print_fetched<T: Entity>(fetched: Fetched<T>) -> Result<()> {
    if let Some(ref reason) = fetched.degraded {
        eprintln!("warning: served from cache, server unreachable: {}", reason);
    }
    eprintln!(
        "source: {:?}, version {}{}",
        fetched.source,
        fetched.version,
        if fetched.is_dirty { ", unsynced" } else { "" }
    );
    println!("{}", serde_json::to_string_pretty(&fetched.value)?);
    Ok(())
}
