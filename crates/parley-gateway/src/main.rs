use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use parley_gateway::{
    build_cors_layer, config::GatewayConfig, db, relay::RelayServer, router, signal, AppState,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

const TOKEN_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    parley_common::init_tracing_with_default("parley_gateway=info,tower_http=info");

    let config = GatewayConfig::parse();

    let pool = db::connect(&config.database_url, 5)
        .await
        .with_context(|| format!("failed to open database {}", config.database_url))?;
    info!("connected to gateway database");

    let relay = RelayServer::start(&config.relay, Arc::new(pool.clone()))
        .await
        .context("failed to start TURN relay")?;

    let state = AppState::new(pool.clone(), relay.settings().issuer());
    let hub = state.hub.clone();

    let sweep_pool = pool.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TOKEN_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            match db::delete_expired_tokens(&sweep_pool).await {
                Ok(count) if count > 0 => info!("removed {} expired access tokens", count),
                Ok(_) => {}
                Err(err) => warn!("failed to remove expired access tokens: {}", err),
            }
        }
    });

    let app = router(state, build_cors_layer(&config.allowed_origins));

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!("gateway listening on {}", listener.local_addr()?);

    let shutdown_hub = hub.clone();
    let shutdown_pool = pool.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Upgraded sockets are not tracked by the server, so their calls
            // are ended here rather than left to the socket tasks.
            for call_id in shutdown_hub.shutdown() {
                signal::end_call(&shutdown_pool, call_id).await;
            }
        })
        .await?;

    relay.close().await?;
    pool.close().await;
    info!("gateway stopped");
    Ok(())
}
