use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{parse_snapshot, VehicleSnapshot};

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("Channel is not open")]
    NotConnected,
    #[error("Encode error: {0}")]
    Encode(String),
}

/// Connection lifecycle of the push transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    /// Fixed wait between reconnect attempts after a non-normal closure.
    pub reconnect_interval: Duration,
    /// Reconnect attempts before giving up for good.
    pub max_reconnect_attempts: u32,
}

impl Default for RealtimeOptions {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(3),
            max_reconnect_attempts: 5,
        }
    }
}

/// Push-based snapshot transport over a websocket, with bounded automatic
/// reconnection. Inbound text frames are decoded as full snapshots and
/// broadcast to subscribers; malformed frames are logged and dropped.
pub struct RealtimeChannel {
    state_rx: watch::Receiver<ChannelState>,
    updates_tx: broadcast::Sender<VehicleSnapshot>,
    outbound_tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
}

impl RealtimeChannel {
    pub fn connect(url: String, options: RealtimeOptions) -> Self {
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        // Capacity 16 - subscribers only care about the latest snapshot.
        let (updates_tx, _) = broadcast::channel(16);
        let (outbound_tx, outbound_rx) = mpsc::channel(16);
        let shutdown = CancellationToken::new();

        tokio::spawn(run_connection(
            url,
            options,
            state_tx,
            updates_tx.clone(),
            outbound_rx,
            shutdown.clone(),
        ));

        Self {
            state_rx,
            updates_tx,
            outbound_tx,
            shutdown,
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Subscribe to inbound snapshots. Each subscriber gets every snapshot
    /// delivered after the point of subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<VehicleSnapshot> {
        self.updates_tx.subscribe()
    }

    /// Send a raw text frame.
    pub async fn send_text(&self, text: String) -> Result<(), RealtimeError> {
        if !self.is_open() {
            warn!("Realtime channel is not open, dropping outbound message");
            return Err(RealtimeError::NotConnected);
        }
        self.outbound_tx
            .send(text)
            .await
            .map_err(|_| RealtimeError::NotConnected)
    }

    /// Serialize a non-string payload to JSON and send it.
    pub async fn send_json<T: Serialize>(&self, payload: &T) -> Result<(), RealtimeError> {
        let text =
            serde_json::to_string(payload).map_err(|e| RealtimeError::Encode(e.to_string()))?;
        self.send_text(text).await
    }

    /// Close the channel and stop reconnecting. Safe to call repeatedly.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Outcome of one established connection, deciding whether to reconnect.
enum SessionEnd {
    Shutdown,
    NormalClosure,
    Lost,
}

async fn run_connection(
    url: String,
    options: RealtimeOptions,
    state_tx: watch::Sender<ChannelState>,
    updates_tx: broadcast::Sender<VehicleSnapshot>,
    mut outbound_rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) {
    let mut attempts = 0u32;

    loop {
        state_tx.send_replace(ChannelState::Connecting);

        let connect = tokio::select! {
            _ = shutdown.cancelled() => {
                state_tx.send_replace(ChannelState::Closed);
                return;
            }
            result = connect_async(url.as_str()) => result,
        };

        match connect {
            Ok((stream, _response)) => {
                info!(url = %url, "Realtime channel connected");
                state_tx.send_replace(ChannelState::Open);
                attempts = 0;

                let end = run_session(
                    stream,
                    &state_tx,
                    &updates_tx,
                    &mut outbound_rx,
                    &shutdown,
                )
                .await;
                state_tx.send_replace(ChannelState::Closed);

                match end {
                    SessionEnd::Shutdown | SessionEnd::NormalClosure => return,
                    SessionEnd::Lost => {}
                }
            }
            Err(e) => {
                warn!(url = %url, error = %e, "Realtime connection failed");
                state_tx.send_replace(ChannelState::Closed);
            }
        }

        attempts += 1;
        if attempts > options.max_reconnect_attempts {
            warn!(
                attempts,
                "Realtime channel exhausted reconnect attempts, giving up"
            );
            return;
        }
        info!(
            attempt = attempts,
            max = options.max_reconnect_attempts,
            "Reconnecting realtime channel"
        );

        tokio::select! {
            _ = shutdown.cancelled() => {
                state_tx.send_replace(ChannelState::Closed);
                return;
            }
            _ = tokio::time::sleep(options.reconnect_interval) => {}
        }
    }
}

async fn run_session<S>(
    stream: S,
    state_tx: &watch::Sender<ChannelState>,
    updates_tx: &broadcast::Sender<VehicleSnapshot>,
    outbound_rx: &mut mpsc::Receiver<String>,
    shutdown: &CancellationToken,
) -> SessionEnd
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Sink<Message>
        + Unpin,
{
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                state_tx.send_replace(ChannelState::Closing);
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
            Some(outbound) = outbound_rx.recv() => {
                if write.send(Message::Text(outbound)).await.is_err() {
                    return SessionEnd::Lost;
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match parse_snapshot(&text) {
                        Ok(snapshot) => {
                            // Send errors just mean no one is listening.
                            let _ = updates_tx.send(snapshot);
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to parse realtime message");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let normal = frame
                            .as_ref()
                            .map(|f| f.code == CloseCode::Normal)
                            .unwrap_or(false);
                        debug!(normal, "Realtime channel closed by peer");
                        return if normal {
                            SessionEnd::NormalClosure
                        } else {
                            SessionEnd::Lost
                        };
                    }
                    // Pings are answered by the protocol layer.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Realtime channel error");
                        return SessionEnd::Lost;
                    }
                    None => return SessionEnd::Lost,
                }
            }
        }
    }
}
