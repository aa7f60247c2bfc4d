//! End-to-end run against a local tokio-tungstenite server

mod common;

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use common::{test_config, trade_frame, WAIT};
use market_stream::{BinanceDecoder, Config, ConnectionState, FeedClient, HeartbeatProbe};

/// Accepts connections forever. Each connection acks a `SUBSCRIBE`, pushes one
/// trade whose id is the connection number and, for the first connection
/// only, drops the socket right after.
async fn spawn_server() -> (String, mpsc::UnboundedReceiver<(u64, String)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut connection = 0u64;
        while let Ok((stream, _)) = listener.accept().await {
            connection += 1;
            let n = connection;
            let seen = seen_tx.clone();

            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else { return };
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else { continue };
                    let _ = seen.send((n, text.clone()));
                    if text.contains("SUBSCRIBE") {
                        let _ = ws.send(Message::Text(r#"{"result":null,"id":1}"#.to_string())).await;
                        let _ = ws.send(Message::Text(trade_frame(n))).await;
                        if n == 1 {
                            return;
                        }
                    }
                }
            });
        }
    });

    (format!("ws://{}", addr), seen_rx)
}

#[tokio::test]
async fn test_trades_flow_and_subscription_survives_server_drop() {
    let (url, mut seen) = spawn_server().await;
    let config = Config {
        ws_endpoint: url,
        reconnect_delay_ms: 20,
        ..test_config()
    };

    let client = FeedClient::builder(config, BinanceDecoder::new())
        .heartbeat(HeartbeatProbe::Ping)
        .connect()
        .await
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    let (trades_tx, mut trades) = mpsc::unbounded_channel();
    let streams = vec!["btcusdt@trade".to_string()];
    client
        .subscribe_trades(
            "btcusdt@trade",
            BinanceDecoder::subscribe_message(&streams, 1),
            move |batch| {
                for trade in &batch.trades {
                    let _ = trades_tx.send(trade.id);
                }
            },
        )
        .await
        .unwrap();

    let (first_conn, first_payload) = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(first_conn, 1);
    assert!(first_payload.contains("btcusdt@trade"));
    assert_eq!(timeout(WAIT, trades.recv()).await.unwrap(), Some(1));

    // server dropped the first socket; the payload is replayed verbatim
    let (second_conn, second_payload) = timeout(WAIT, seen.recv()).await.unwrap().unwrap();
    assert_eq!(second_conn, 2);
    assert_eq!(second_payload, first_payload);
    assert_eq!(timeout(WAIT, trades.recv()).await.unwrap(), Some(2));

    tokio_test::assert_ok!(timeout(Duration::from_secs(3), client.close()).await);
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_unreachable_endpoint_fails_initial_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = Config {
        ws_endpoint: format!("ws://{}", addr),
        ..test_config()
    };
    let result = FeedClient::builder(config, BinanceDecoder::new()).connect().await;
    assert!(matches!(result, Err(market_stream::FeedError::Connect(_))));
}
