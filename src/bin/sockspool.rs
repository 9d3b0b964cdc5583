//! sockspool daemon
//!
//! Usage: sockspool [OPTIONS]
//!
//! Options:
//!   --config <FILE>   Path to configuration file (default: config.toml)
//!   --listen <ADDR>   Override the configured listen address
//!   --mode <MODE>     Override the configured mode (transparent | socks5)
//!   --version         Print version information
//!   -h, --help        Print help information

use std::env;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use sockspool::backend::{Backend, Pool};
use sockspool::balancer::Balancer;
use sockspool::config::{Config, LogFormat, Mode};
use sockspool::health::HealthChecker;
use sockspool::proxy::{Socks5Server, TransparentServer};
use sockspool::web::StatsServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut config_path = "config.toml".to_string();
    let mut listen_override: Option<String> = None;
    let mut mode_override: Option<Mode> = None;

    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            "--version" => {
                println!("sockspool v{}", sockspool::VERSION);
                return Ok(());
            }
            "--config" => {
                i += 1;
                config_path = args
                    .get(i)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a file path"))?;
            }
            "--listen" => {
                i += 1;
                listen_override = Some(
                    args.get(i)
                        .cloned()
                        .ok_or_else(|| anyhow::anyhow!("--listen requires an address"))?,
                );
            }
            "--mode" => {
                i += 1;
                let raw = args
                    .get(i)
                    .ok_or_else(|| anyhow::anyhow!("--mode requires a value"))?;
                mode_override = Some(raw.parse()?);
            }
            other => {
                eprintln!("Unknown option: {other}");
                print_usage();
                anyhow::bail!("invalid arguments");
            }
        }
        i += 1;
    }

    let mut config = Config::load(&config_path)?;
    if let Some(listen) = listen_override {
        config.listen = listen;
    }
    if let Some(mode) = mode_override {
        config.mode = mode;
    }

    init_tracing(&config);

    tracing::info!(version = sockspool::VERSION, "sockspool starting");
    tracing::info!(
        listen = %config.listen,
        mode = %config.mode,
        backends = config.backends.len(),
        "configuration loaded"
    );

    // Build the backend pool, expanding port ranges.
    let pool = Arc::new(Pool::new());
    for entry in config.expand_backends() {
        tracing::info!(backend = %entry.address, name = %entry.name, "added backend");
        pool.add(Arc::new(Backend::new(
            entry.address,
            entry.name,
            config.health.failure_threshold,
        )));
    }
    tracing::info!(total = pool.count(), "backend pool initialized");

    let token = CancellationToken::new();

    let balancer = Arc::new(Balancer::new(Arc::clone(&pool), &config.balancer));
    Arc::clone(&balancer).spawn_cleanup(&token);

    let checker = Arc::new(HealthChecker::new(Arc::clone(&pool), &config.health));
    checker.start(&token)?;

    if let Some(web) = &config.web {
        let stats = StatsServer::new(web.listen.clone(), Arc::clone(&pool));
        stats.start(&token).await?;
    }

    enum Server {
        Transparent(TransparentServer),
        Socks5(Socks5Server),
    }

    let server = match config.mode {
        Mode::Transparent => {
            let server = TransparentServer::new(
                config.listen.clone(),
                Arc::clone(&balancer),
                config.health.failure_threshold,
            );
            server.start(&token).await?;
            Server::Transparent(server)
        }
        Mode::Socks5 => {
            let server = Socks5Server::new(config.listen.clone(), Arc::clone(&balancer));
            server.start(&token).await?;
            Server::Socks5(server)
        }
    };

    tracing::info!("startup complete");

    wait_for_shutdown().await;
    tracing::info!("shutdown signal received");

    token.cancel();

    if let Err(e) = checker.stop().await {
        tracing::warn!(error = %e, "failed to stop health checker");
    }

    let stopped = match &server {
        Server::Transparent(s) => s.stop().await,
        Server::Socks5(s) => s.stop().await,
    };
    stopped.map_err(|e| anyhow::anyhow!("failed to stop server: {e}"))?;

    tracing::info!("shutdown complete");
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log.level.clone()));

    match config.log.format {
        LogFormat::Text => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .json()
                .init();
        }
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn print_usage() {
    println!(
        r#"sockspool - reverse load balancer for SOCKS5 proxy pools

USAGE:
    sockspool [OPTIONS]

OPTIONS:
    --config <FILE>    Path to configuration file (default: config.toml)
    --listen <ADDR>    Override the configured listen address
    --mode <MODE>      Override the configured mode: transparent | socks5
    --version          Print version information
    -h, --help         Print help information

EXAMPLES:
    Run with the default config file:
        sockspool

    Run as a SOCKS5 terminating proxy on a custom port:
        sockspool --config pool.toml --mode socks5 --listen 0.0.0.0:1080
"#
    );
}
