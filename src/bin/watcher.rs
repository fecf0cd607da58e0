use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use transfer_watch::config::Config;
use transfer_watch::dispatch::Dispatcher;
use transfer_watch::registry::SubscriptionRegistry;
use transfer_watch::rpc::RpcClient;
use transfer_watch::scanner::Scanner;
use transfer_watch::server;
use transfer_watch::watchlist::WatchSet;

const DEFAULT_TOKEN_DECIMALS: u8 = 18;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    info!("Starting token transfer watcher");

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("Token address: {:?}", config.token_address);
    info!("RPC URLs: {} endpoint(s) configured", config.rpc_urls.len());

    let watch = Arc::new(WatchSet::new());
    let report = watch.load_file(&config.watch_addresses_file)?;
    for rejected in &report.rejected {
        warn!("{}", rejected);
    }
    info!(
        "Watching {} address(es) from {}",
        watch.len(),
        config.watch_addresses_file.display()
    );
    if watch.is_empty() {
        anyhow::bail!(
            "No valid addresses in {}",
            config.watch_addresses_file.display()
        );
    }

    let client = RpcClient::new(&config.rpc_urls, config.token_address)?;
    info!("RPC client connected");

    let token_decimals = match config.token_decimals {
        Some(decimals) => decimals,
        None => {
            let metadata = client.token_metadata().await;
            if let (Some(name), Some(symbol)) = (&metadata.name, &metadata.symbol) {
                info!("Monitoring token: {} ({})", name, symbol);
            }
            metadata.decimals.unwrap_or_else(|| {
                warn!(
                    "Could not read token decimals, assuming {}",
                    DEFAULT_TOKEN_DECIMALS
                );
                DEFAULT_TOKEN_DECIMALS
            })
        }
    };

    let registry = Arc::new(SubscriptionRegistry::new());
    let dispatcher = Dispatcher::new(
        registry.clone(),
        config.explorer_tx_url.clone(),
        config.send_timeout,
    );
    let shutdown = CancellationToken::new();

    let listener = tokio::net::TcpListener::bind(&config.ws_listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.ws_listen_addr))?;
    let server_task = tokio::spawn(server::serve(
        listener,
        registry.clone(),
        shutdown.clone(),
    ));

    let heartbeat_registry = registry.clone();
    let heartbeat_shutdown = shutdown.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = heartbeat_shutdown.cancelled() => break,
                _ = interval.tick() => {
                    info!(
                        "{} subscriber connection(s) across {} address(es)",
                        heartbeat_registry.connection_count(),
                        heartbeat_registry.address_count()
                    );
                }
            }
        }
    });

    let scanner = Scanner::new(client, watch, dispatcher, &config, token_decimals);
    let scanner_task = tokio::spawn(scanner.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping...");
    shutdown.cancel();

    if let Err(e) = scanner_task.await? {
        error!("Scanner error: {}", e);
        return Err(e);
    }
    if let Err(e) = server_task.await? {
        error!("Server error: {}", e);
        return Err(e);
    }
    heartbeat_task.await?;

    info!("Stopped");
    Ok(())
}
