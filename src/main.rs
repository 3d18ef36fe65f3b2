use anyhow::{Context, Result};
use clap::Parser;
use custom_ratelimit::config::PluginConfig;
use custom_ratelimit::decision::Admission;
use custom_ratelimit::middleware::AdmissionState;
use custom_ratelimit::server::Server;
use custom_ratelimit::store::MemoryStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "custom-ratelimit", version, about)]
struct Args {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    bind_addr: SocketAddr,

    /// Path to the JSON plugin configuration
    #[arg(long, env = "PLUGIN_CONFIG")]
    config: PathBuf,

    /// Service id folded into every rate limit identity
    #[arg(long, env = "SERVICE_ID")]
    service_id: Option<String>,

    /// Count in process instead of Redis (single instance only)
    #[arg(long, env = "MEMORY_STORE")]
    memory_store: bool,

    /// Expired key sweep interval for the in-memory store, in seconds
    #[arg(long, env = "CLEANUP_INTERVAL", default_value_t = 60)]
    cleanup_interval_secs: u64,

    /// Largest request body buffered for body rules, in bytes
    #[arg(long, env = "BODY_LIMIT", default_value_t = 1024 * 1024)]
    body_limit: usize,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("custom_ratelimit={},tower_http=debug", args.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read {}", args.config.display()))?;
    let config = PluginConfig::from_json(&raw).context("failed to parse plugin configuration")?;

    tracing::info!("Starting custom-ratelimit");
    tracing::info!(
        "Configuration: bind_addr={}, redis={}:{}, qps={}",
        args.bind_addr,
        config.redis_host,
        config.redis_port,
        config.qps
    );

    let admission = if args.memory_store {
        let store = Arc::new(MemoryStore::new());
        spawn_cleanup(store.clone(), Duration::from_secs(args.cleanup_interval_secs.max(1)));
        Admission::new(&config, store)
    } else {
        Admission::connect(&config)
    };

    let mut state = AdmissionState::new(admission).with_body_limit(args.body_limit);
    if let Some(service_id) = args.service_id {
        state = state.with_service_id(service_id);
    }

    Server::new(state, args.bind_addr)
        .run()
        .await
        .context("server error")?;

    Ok(())
}

fn spawn_cleanup(store: Arc<MemoryStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let purged = store.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "purged expired counters");
            }
        }
    });
}
