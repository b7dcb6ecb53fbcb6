use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::FutureExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gamecache::config::Config;
use gamecache::rank::board_members;
use gamecache::store::{MemoryConnector, MemoryStore, StoreConnection, StoreConnector};
use gamecache::CacheContext;
use gamecache_core::cache::{decode_type_name, encode_type_name, rank_set_id, storage_key_for};
use gamecache_core::registration::{RegistrationRecord, REGISTRATION_KEY};

/// gamecache - inspect a game server's entity cache
#[derive(Parser, Debug)]
#[command(name = "gamecache")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Use an empty in-process store instead of Redis
    #[arg(long, global = true)]
    memory: bool,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "GAMECACHE_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the configured endpoints answer
    Ping,
    /// Print the registration record
    Info,
    /// Escape an entity type name for use in a key
    EncodeKey { type_name: String },
    /// Reverse `encode-key`
    DecodeKey { key: String },
    /// Dump a leaderboard's members and scores
    Rank {
        /// Entity type name, e.g. `Game.PlayerRank`
        type_name: String,
        /// Leaderboard key
        key: String,
        /// Number of entries, all when omitted
        #[arg(long, short)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "gamecache=info".into());
    if cli.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    match &cli.command {
        Command::EncodeKey { type_name } => {
            println!("{}", encode_type_name(type_name));
            return Ok(());
        }
        Command::DecodeKey { key } => {
            println!("{}", decode_type_name(key));
            return Ok(());
        }
        _ => {}
    }

    let config = Config::from_env();
    if cli.memory {
        return run(MemoryConnector::new(MemoryStore::new()), &config, &cli.command).await;
    }
    run_redis(&config, &cli.command).await
}

#[cfg(feature = "redis")]
async fn run_redis(config: &Config, command: &Command) -> Result<()> {
    let settings = config.to_settings()?;
    let connector = gamecache::store::RedisConnector::new(settings.connect_timeout);
    run(connector, config, command).await
}

#[cfg(not(feature = "redis"))]
async fn run_redis(_config: &Config, _command: &Command) -> Result<()> {
    bail!("built without the redis feature; pass --memory")
}

async fn run<C: StoreConnector>(connector: C, config: &Config, command: &Command) -> Result<()> {
    let mut context = CacheContext::new(connector, config.to_settings()?)?
        .with_serializer(config.serializer()?);
    if let Some(name) = &config.secondary_name {
        context = context.with_secondary_name(name.clone());
    }

    let outcome = execute(&context, command).await;
    context.shutdown();
    outcome
}

async fn execute<C: StoreConnector>(context: &CacheContext<C>, command: &Command) -> Result<()> {
    match command {
        Command::Ping => {
            if !context.manager().check_connectivity().await {
                bail!("store is unreachable");
            }
            for stats in context.manager().stats() {
                println!(
                    "{}: {} live, {} idle, max {}",
                    stats.endpoint, stats.live, stats.idle, stats.max_size
                );
            }
            println!("PONG");
        }
        Command::Info => {
            let stored = context
                .manager()
                .with_read_only_connection(|conn| {
                    async move { conn.get(REGISTRATION_KEY).await }.boxed()
                })
                .await?;
            let record = match stored {
                Some(bytes) => RegistrationRecord::from_json(&bytes)?,
                None => bail!("no registration record at {}", REGISTRATION_KEY),
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Rank {
            type_name,
            key,
            count,
        } => {
            let set_id = rank_set_id(&storage_key_for(type_name), key);
            let members = context
                .manager()
                .with_read_only_connection(|conn| {
                    let set_id = set_id.clone();
                    async move { board_members(conn, &set_id).await }.boxed()
                })
                .await
                .with_context(|| format!("reading leaderboard {}", set_id))?;

            let limit = count.unwrap_or(members.len());
            for (position, (member, score)) in members.into_iter().take(limit).enumerate() {
                println!(
                    "{:>4}  {:>12}  {}",
                    position + 1,
                    score,
                    String::from_utf8_lossy(&member)
                );
            }
        }
        Command::EncodeKey { .. } | Command::DecodeKey { .. } => {}
    }
    Ok(())
}
