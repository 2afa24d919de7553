//! # SOCKS5 Gateway
//!
//! A multi-tenant SOCKS5 (RFC 1928) proxy: username/password-authenticated
//! CONNECT relaying, per-user token-bucket throttling, policy-driven
//! destination filtering, and batched traffic accounting against a SQLite
//! store.
//!
//! ## Architecture
//!
//! - **socks5**: wire parsing/encoding for the greeting, auth, and request
//!   PDUs.
//! - **session**: the per-connection state machine and the bidirectional
//!   relay.
//! - **cache**: hot-reloadable snapshots of filter rules and user
//!   credentials, plus the short-lived auth-result cache.
//! - **limiter**: per-user token-bucket throttling.
//! - **traffic**: the batched traffic-log buffer and the heartbeat
//!   publisher.
//! - **store**: the SQLite persistence layer, accessed only from the
//!   blocking pool.
//! - **server**: the accept loop tying the above together.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;

mod cache;
mod config;
mod error;
mod host_extract;
mod limiter;
mod server;
mod session;
mod socks5;
mod store;
mod traffic;

use cache::Caches;
use config::Config;
use limiter::Limiter;
use session::Services;
use store::Store;
use traffic::{ConnectionCounters, Heartbeat, TrafficBuffer};

const FILTER_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
const USER_REFRESH_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Parser, Debug)]
#[command(name = "socks5-gateway", about = "Multi-tenant SOCKS5 proxy gateway")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the listen address from the config file (host:port).
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("failed to load configuration from {}: {e}", cli.config.display());
            std::process::exit(78); // EX_CONFIG
        }
    };

    if let Some(listen) = &cli.listen {
        match listen.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => {
                    config.server.host = host.to_string();
                    config.server.port = port;
                }
                Err(_) => {
                    eprintln!("--listen must be host:port, got {listen:?}");
                    std::process::exit(78);
                }
            },
            None => {
                eprintln!("--listen must be host:port, got {listen:?}");
                std::process::exit(78);
            }
        }
    }

    let log_level = match config.log.level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new().filter_level(log_level).init();

    log::info!("starting socks5-gateway, config = {}", cli.config.display());

    let store = match Store::open(&config.database.path) {
        Ok(store) => store,
        Err(e) => {
            log::error!("failed to open store at {}: {e}", config.database.path);
            std::process::exit(74); // EX_IOERR
        }
    };

    let limiter = Arc::new(Limiter::new());
    let caches = Caches::new(store.clone(), config.auth.super_password.clone());
    let traffic = TrafficBuffer::new(store.clone(), config.proxy.batch_size);
    let counters = Arc::new(ConnectionCounters::default());
    let shutdown = CancellationToken::new();

    // Prime both caches before accepting connections.
    caches.refresh_filters().await;
    caches.refresh_users(&limiter).await;

    let services = Arc::new(Services {
        caches: caches.clone(),
        limiter: limiter.clone(),
        traffic: traffic.clone(),
        counters: counters.clone(),
        config: config.clone(),
        shutdown: shutdown.clone(),
    });

    let mut background = tokio::task::JoinSet::new();

    background.spawn({
        let caches = caches.clone();
        let shutdown = shutdown.clone();
        async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(FILTER_REFRESH_INTERVAL) => caches.refresh_filters().await,
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    });

    background.spawn({
        let caches = caches.clone();
        let limiter = limiter.clone();
        let shutdown = shutdown.clone();
        async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(USER_REFRESH_INTERVAL) => caches.refresh_users(&limiter).await,
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    });

    background.spawn({
        let traffic = traffic.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(config.proxy.flush_interval);
        async move {
            traffic.run_periodic_flush(interval, shutdown).await;
        }
    });

    background.spawn({
        let counters = counters.clone();
        let store = store.clone();
        let shutdown = shutdown.clone();
        let heartbeat_interval = Duration::from_secs(config.proxy.heartbeat_interval);
        let proxy_host = config.server.host.clone();
        let proxy_port = config.server.port;
        async move {
            let heartbeat = Heartbeat::new(proxy_host, proxy_port, counters, store);
            heartbeat.run(heartbeat_interval, shutdown).await;
        }
    });

    let ctrlc_fired = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        let ctrlc_fired = ctrlc_fired.clone();
        ctrlc::set_handler(move || {
            if !ctrlc_fired.swap(true, Ordering::SeqCst) {
                log::info!("shutdown signal received, draining connections...");
                shutdown.cancel();
            }
        })
        .expect("failed to install signal handler");
    }

    let listen_addr = config.listen_addr();
    if let Err(e) = server::run(&listen_addr, services).await {
        log::error!("accept loop exited with error: {e}");
        shutdown.cancel();
        // Still drain so the offline heartbeat and any queued traffic
        // records are written before exiting non-zero.
        while background.join_next().await.is_some() {}
        std::process::exit(74); // EX_IOERR, matching the store-open failure path
    }

    // Drain background tasks (periodic flush/heartbeat write their final
    // record on seeing `shutdown` cancelled).
    while background.join_next().await.is_some() {}

    log::info!("socks5-gateway exited cleanly");
}
