//! TCP position listener
//!
//! Accepts connections from a position feed (phone bridge, replay tool).
//! Protocol: one JSON object per line
//! - `{"latitude": 12.97, "longitude": 77.59}` - position fix
//! - `{"lost": "<reason>"}` - feed lost its fix or was denied access

use crate::domain::types::{Coordinate, PositionEvent};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PositionLine {
    Fix { latitude: f64, longitude: f64 },
    Lost { lost: String },
}

/// Parse one protocol line
pub fn parse_position_line(line: &str) -> Result<PositionEvent, String> {
    let parsed: PositionLine = serde_json::from_str(line).map_err(|e| e.to_string())?;
    match parsed {
        PositionLine::Fix { latitude, longitude } => Coordinate::new(latitude, longitude)
            .map(PositionEvent::Fix)
            .map_err(|e| e.to_string()),
        PositionLine::Lost { lost } => Ok(PositionEvent::Lost(lost)),
    }
}

/// Bind and serve the position listener on `0.0.0.0:<port>`
pub async fn start_position_listener(
    port: u16,
    position_tx: mpsc::Sender<PositionEvent>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!(port = %port, "position_listener_started");
    serve_positions(listener, position_tx, shutdown).await;
    Ok(())
}

/// Accept loop on an already bound listener
pub async fn serve_positions(
    listener: TcpListener,
    position_tx: mpsc::Sender<PositionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    info!("position_listener_shutdown");
                    return;
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let tx = position_tx.clone();
                        tokio::spawn(async move {
                            handle_position_connection(socket, addr, tx).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "position_listener_accept_failed");
                    }
                }
            }
        }
    }
}

async fn handle_position_connection(
    socket: TcpStream,
    addr: SocketAddr,
    position_tx: mpsc::Sender<PositionEvent>,
) {
    info!(peer = %addr, "position_feed_connected");
    let mut lines = BufReader::new(socket).lines();

    // Rate-limit drop warnings to 1 per second
    let mut last_drop_warn = Instant::now() - Duration::from_secs(2);

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let event = match parse_position_line(line) {
            Ok(event) => event,
            Err(e) => {
                warn!(peer = %addr, line = %line, error = %e, "position_line_invalid");
                continue;
            }
        };

        match position_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if last_drop_warn.elapsed() > Duration::from_secs(1) {
                    warn!(peer = %addr, "position_dropped: channel full");
                    last_drop_warn = Instant::now();
                }
            }
            Err(TrySendError::Closed(_)) => {
                debug!(peer = %addr, "position_channel_closed");
                break;
            }
        }
    }

    info!(peer = %addr, "position_feed_disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_parse_fix() {
        let event = parse_position_line(r#"{"latitude": 12.9716, "longitude": 77.5946}"#).unwrap();
        assert_eq!(event, PositionEvent::Fix(Coordinate::new(12.9716, 77.5946).unwrap()));
    }

    #[test]
    fn test_parse_lost() {
        let event = parse_position_line(r#"{"lost": "permission denied"}"#).unwrap();
        assert_eq!(event, PositionEvent::Lost("permission denied".to_string()));
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(parse_position_line("hello").is_err());
        assert!(parse_position_line(r#"{"latitude": 95.0, "longitude": 0.0}"#).is_err());
        assert!(parse_position_line(r#"{"latitude": 12.0}"#).is_err());
    }

    #[tokio::test]
    async fn test_listener_forwards_valid_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve_positions(listener, tx, shutdown_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"{\"latitude\": 1.5, \"longitude\": 2.5}\nnot json\n{\"lost\": \"tunnel\"}\n")
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first, PositionEvent::Fix(Coordinate::new(1.5, 2.5).unwrap()));
        let second = rx.recv().await.unwrap();
        assert_eq!(second, PositionEvent::Lost("tunnel".to_string()));

        shutdown_tx.send(true).unwrap();
        server.await.unwrap();
    }
}
