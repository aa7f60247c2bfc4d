//! Market Stream - Binance demo feed
//!
//! Subscribes to depth and trade streams for the configured symbols, keeps
//! the connection alive across failures and serves health and metrics.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, trace, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use market_stream::{BinanceDecoder, Config, FeedClient, FeedMetrics, HeartbeatProbe};

/// State served by the health endpoints
struct AppState {
    client: FeedClient,
    registry: prometheus::Registry,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Market Stream");

    let config = Config::load()?;
    info!(symbols = ?config.symbols, endpoint = %config.ws_endpoint, "Configuration loaded");

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(FeedMetrics::registered(&registry)?);
    let health_port = config.health_port;
    let symbols = config.symbols.clone();

    let client = FeedClient::builder(config, BinanceDecoder::new())
        .heartbeat(HeartbeatProbe::Ping)
        .metrics(metrics)
        .on_liveness(|error| {
            if let Some(e) = error {
                warn!(error = %e, "Liveness check failed");
            }
        })
        .connect()
        .await?;

    for (index, stream) in BinanceDecoder::streams_for(&symbols).into_iter().enumerate() {
        let payload = BinanceDecoder::subscribe_message(std::slice::from_ref(&stream), index as u64 + 1);

        if stream.ends_with("@trade") {
            client
                .subscribe_trades(stream, payload, |batch| {
                    for trade in &batch.trades {
                        trace!(
                            symbol = %batch.symbol,
                            id = trade.id,
                            side = ?trade.side,
                            price = %trade.price,
                            quantity = %trade.quantity,
                            "Trade"
                        );
                    }
                })
                .await?;
        } else {
            client
                .subscribe_depth(stream, payload, |snapshot| {
                    if let (Some(bid), Some(ask)) = (snapshot.best_bid(), snapshot.best_ask()) {
                        info!(
                            symbol = %snapshot.symbol,
                            best_bid = %bid.price,
                            best_ask = %ask.price,
                            mid_price = ?snapshot.mid_price(),
                            spread_bps = ?snapshot.spread_bps(),
                            "Order book update"
                        );
                    }
                })
                .await?;
        }
    }

    let state = Arc::new(AppState {
        client: client.clone(),
        registry,
    });
    tokio::spawn(async move {
        if let Err(e) = start_health_server(state, health_port).await {
            warn!(error = %e, "Health server error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    client.close().await;

    Ok(())
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(state: Arc<AppState>, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let connection = state.client.state();
    let status = if connection.is_connected() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if connection.is_connected() { "healthy" } else { "degraded" },
            "component": "market-stream",
            "connection": format!("{:?}", connection),
            "subscriptions": state.client.subscription_count().await,
            "timestamp": chrono::Utc::now().to_rfc3339()
        })),
    )
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<String, StatusCode> {
    use prometheus::{Encoder, TextEncoder};
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&state.registry.gather(), &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
