//! mimir - cached upstream query tool
//!
//! Runs queries through the full cache stack and maintains the local stores.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use mimir::store::{FileBackend, PersistentStore};
use mimir::{CacheKey, Config, InterceptingTransport, MimirBuilder, RequestKind, UpstreamRequest};

/// Mimir CLI
#[derive(Parser)]
#[command(name = "mimir")]
#[command(version)]
#[command(about = "Tiered, failure-tolerant upstream data access")]
struct Args {
    /// Config file (default: ~/.mimir/config.toml, then /etc/mimir/config.toml)
    #[arg(short, long, env = "MIMIR_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a GraphQL query through the cache
    Query {
        /// Logical query name, used in the cache key
        name: String,
        /// Query document (or omit to read from stdin)
        query: Option<String>,
        /// Variables as a JSON object; also keyed into the cache
        #[arg(long, default_value = "{}")]
        variables: String,
        /// Caching category of the request
        #[arg(short, long, value_enum, default_value_t = Kind::Static)]
        kind: Kind,
        /// Time to live in seconds
        #[arg(long, default_value_t = 3600)]
        ttl: u64,
        /// Use lite data mode
        #[arg(long)]
        lite: bool,
    },

    /// Delete expired entries from the persistent store
    Cleanup,

    /// Delete response stores left behind by other versions
    Purge,
}

#[derive(Clone, Copy, ValueEnum)]
enum Kind {
    Static,
    Dynamic,
    Uncached,
}

impl From<Kind> for RequestKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Static => RequestKind::StaticQuery,
            Kind::Dynamic => RequestKind::DynamicQuery,
            Kind::Uncached => RequestKind::Uncached,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    match args.command {
        Command::Query {
            name,
            query,
            variables,
            kind,
            ttl,
            lite,
        } => {
            let query = read_input(query)?;
            let variables: serde_json::Value = serde_json::from_str(&variables)?;
            let gateway = MimirBuilder::from_config(&config)
                .lite_mode(config.lite_mode || lite)
                .build()
                .await?;

            let key = CacheKey::new(name).params(variables.clone());
            let request = UpstreamRequest::graphql(kind.into(), query, variables);
            let body: serde_json::Value = gateway
                .query(&key, Duration::from_secs(ttl), request)
                .await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }

        Command::Cleanup => {
            let Some(path) = &config.store.path else {
                println!("store is in-memory, nothing to clean");
                return Ok(());
            };
            let store = PersistentStore::new(Arc::new(FileBackend::open(path).await));
            let removed = store.cleanup().await;
            println!("removed {removed} expired entries from {}", path.display());
        }

        Command::Purge => {
            let Some(intercept) = config.intercept.clone() else {
                println!("interception is not configured");
                return Ok(());
            };
            let network = Arc::new(mimir::ReqwestTransport::new());
            let nic = InterceptingTransport::open(network, intercept).await;
            let deleted = nic.activate().await;
            if deleted.is_empty() {
                println!("no outdated stores");
            } else {
                for name in deleted {
                    println!("deleted {name}");
                }
            }
        }
    }

    Ok(())
}

/// Use the argument if given, otherwise read stdin (when not a terminal).
fn read_input(arg: Option<String>) -> io::Result<String> {
    match arg {
        Some(text) => Ok(text),
        None => {
            let stdin = io::stdin();
            if stdin.is_terminal() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no query given and stdin is a terminal",
                ));
            }
            let mut buf = String::new();
            stdin.lock().read_to_string(&mut buf)?;
            Ok(buf.trim().to_string())
        }
    }
}
