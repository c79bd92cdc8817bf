use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use offcache::cache::CacheStorage;
use offcache::config::{AppConfig, LogFormat};
use offcache::fetch::{Fetch, NetworkFetcher};
use offcache::proxy::ProxyService;
use offcache::server::Server;
use offcache::telemetry::init_tracing;
use offcache::worker::{LoggingHost, Registration, Worker};

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "Offline-first caching proxy for the library front end")]
#[command(version)]
struct Args {
    /// Path to a config file (TOML, JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<String>,

    /// Backend origin the worker serves
    #[arg(short, long)]
    origin: Option<String>,

    /// Directory for persistent cache stores (in-memory when unset)
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.proxy.listen = listen;
    }
    if let Some(origin) = args.origin {
        config.worker.origin = origin;
    }
    if let Some(dir) = args.cache_dir {
        config.proxy.cache_dir = Some(dir);
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging);

    let storage = match &config.proxy.cache_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "using persistent cache storage");
            CacheStorage::open_dir(dir).await?
        }
        None => CacheStorage::in_memory(),
    };

    let origin = config.worker.origin_url()?;
    let fetcher: Arc<dyn Fetch> = Arc::new(NetworkFetcher::new());
    let worker = Worker::new(
        config.worker,
        Arc::new(storage),
        Arc::clone(&fetcher),
        Arc::new(LoggingHost),
    )?;

    let registration = Arc::new(Registration::new());
    registration.register(Arc::new(worker)).await?;

    let proxy = ProxyService::new(registration, fetcher, origin.clone());
    let server = Server::bind(&config.proxy.listen).await?;
    server
        .run_until(
            origin,
            move |request| {
                let proxy = proxy.clone();
                async move { proxy.handle(request).await }
            },
            async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            },
        )
        .await?;

    info!("offcache stopped");
    Ok(())
}
