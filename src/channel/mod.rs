//! Duplex Message Channel
//!
//! Runs a message-framed, bidirectional connection as two pumps sharing one
//! close signal:
//!
//! - the inbound pump reads one frame at a time, enforces the message size
//!   limit and the keepalive deadline, and forwards payloads to the session
//!   through a bounded queue
//! - the outbound pump drains a bounded queue to the transport, coalescing
//!   queued messages into one frame, and sends a ping when idle
//!
//! Either pump failing cancels the [`CancellationToken`]; everything attached
//! to the connection selects on it and unwinds. Cancelling twice is harmless.
//!
//! The pumps are generic over a [`Frame`] stream/sink pair so they run the same
//! over a WebSocket ([`websocket`]) or an in-memory transport.

pub mod websocket;

use std::fmt::Display;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::admission::{PoolSaturated, WorkerPool};
use crate::config::LimitsConfig;

/// Queue depth in both directions
pub const QUEUE_DEPTH: usize = 16;

// ============================================================================
// Types
// ============================================================================

/// One transport-level message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("keepalive timeout")]
    Timeout,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("outbound queue full")]
    QueueFull,

    #[error("connection closed")]
    Closed,
}

/// Per-connection limits and timers
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub max_message_bytes: usize,
    /// Inbound deadline, refreshed by every pong
    pub pong_wait: Duration,
    /// Idle interval before a ping is sent
    pub ping_period: Duration,
    /// Timeout for a single transport write
    pub write_wait: Duration,
}

impl From<&LimitsConfig> for ChannelConfig {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_message_bytes: limits.max_message_bytes,
            pong_wait: limits.pong_wait(),
            ping_period: limits.ping_period(),
            write_wait: limits.write_wait(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

// ============================================================================
// Connection Handles
// ============================================================================

/// Non-blocking sender into the outbound queue
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<String>,
    close: CancellationToken,
}

impl Outbound {
    /// Queue a message. A full queue means the peer is not keeping up and
    /// terminates the connection.
    pub fn send(&self, message: impl Into<String>) -> Result<(), ChannelError> {
        match self.tx.try_send(message.into()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.close.cancel();
                Err(ChannelError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    /// Queue a JSON-encoded message
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), ChannelError> {
        let message =
            serde_json::to_string(value).map_err(|e| ChannelError::Transport(e.to_string()))?;
        self.send(message)
    }
}

/// Session-facing side of an open connection
pub struct Connection {
    /// Payloads in arrival order
    pub inbound: mpsc::Receiver<Vec<u8>>,
    pub outbound: Outbound,
    /// Shared close signal
    pub close: CancellationToken,
}

impl Connection {
    /// Next inbound payload, or `None` once the connection is closing.
    ///
    /// Payloads the inbound pump already queued are handed out before the
    /// close signal is honored, so a peer that sends its last message and
    /// hangs up straight away still has that message seen.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        tokio::select! {
            biased;

            message = self.inbound.recv() => message,
            _ = self.close.cancelled() => None,
        }
    }
}

// ============================================================================
// Opening
// ============================================================================

/// Start both pumps on the background pool and hand back the session side.
pub fn open<St, Si, E1, E2>(
    stream: St,
    sink: Si,
    config: ChannelConfig,
    pool: &WorkerPool,
) -> Result<Connection, PoolSaturated>
where
    St: Stream<Item = Result<Frame, E1>> + Unpin + Send + 'static,
    Si: Sink<Frame, Error = E2> + Unpin + Send + 'static,
    E1: Display + Send + 'static,
    E2: Display + Send + 'static,
{
    let close = CancellationToken::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_DEPTH);
    let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);

    let reader_close = close.clone();
    let reader_config = config.clone();
    pool.spawn("inbound_pump", async move {
        let result = read_pump(stream, inbound_tx, &reader_config, &reader_close).await;
        finish("inbound", result, &reader_close);
    })?;

    let writer_close = close.clone();
    let spawned = pool.spawn("outbound_pump", async move {
        let result = write_pump(sink, outbound_rx, &config, &writer_close).await;
        finish("outbound", result, &writer_close);
    });
    if let Err(e) = spawned {
        close.cancel();
        return Err(e);
    }

    Ok(Connection {
        inbound: inbound_rx,
        outbound: Outbound {
            tx: outbound_tx,
            close: close.clone(),
        },
        close,
    })
}

fn finish(pump: &'static str, result: Result<(), ChannelError>, close: &CancellationToken) {
    match result {
        Ok(()) => tracing::debug!(pump, "Pump stopped"),
        Err(ChannelError::PeerClosed) => tracing::debug!(pump, "Peer closed connection"),
        Err(e) => tracing::info!(pump, error = %e, "Connection terminated"),
    }
    close.cancel();
}

// ============================================================================
// Pumps
// ============================================================================

async fn read_pump<St, E>(
    mut stream: St,
    inbound: mpsc::Sender<Vec<u8>>,
    config: &ChannelConfig,
    close: &CancellationToken,
) -> Result<(), ChannelError>
where
    St: Stream<Item = Result<Frame, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let frame = tokio::select! {
            _ = close.cancelled() => return Ok(()),
            next = tokio::time::timeout_at(deadline, stream.next()) => match next {
                Err(_) => return Err(ChannelError::Timeout),
                Ok(None) => return Err(ChannelError::PeerClosed),
                Ok(Some(Err(e))) => return Err(ChannelError::Transport(e.to_string())),
                Ok(Some(Ok(frame))) => frame,
            },
        };

        let payload = match frame {
            Frame::Pong(_) => {
                deadline = Instant::now() + config.pong_wait;
                continue;
            }
            Frame::Ping(_) => continue,
            Frame::Close => return Err(ChannelError::PeerClosed),
            Frame::Text(text) => text.into_bytes(),
            Frame::Binary(data) => data,
        };

        if payload.len() > config.max_message_bytes {
            return Err(ChannelError::MessageTooLarge {
                size: payload.len(),
                limit: config.max_message_bytes,
            });
        }

        // Waiting here is the backpressure: nothing more is read until the
        // session has room.
        tokio::select! {
            _ = close.cancelled() => return Ok(()),
            sent = inbound.send(payload) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn write_pump<Si, E>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<String>,
    config: &ChannelConfig,
    close: &CancellationToken,
) -> Result<(), ChannelError>
where
    Si: Sink<Frame, Error = E> + Unpin,
    E: Display,
{
    let mut ticker =
        tokio::time::interval_at(Instant::now() + config.ping_period, config.ping_period);

    let result = loop {
        tokio::select! {
            biased;

            message = outbound.recv() => match message {
                Some(first) => {
                    let batch = Frame::Text(coalesce(first, &mut outbound));
                    if let Err(e) = write_frame(&mut sink, batch, config.write_wait).await {
                        break Err(e);
                    }
                    ticker.reset();
                }
                None => break Ok(()),
            },
            _ = close.cancelled() => {
                // Flush what the session queued before closing
                outbound.close();
                if let Ok(last) = outbound.try_recv() {
                    let batch = Frame::Text(coalesce(last, &mut outbound));
                    if let Err(e) = write_frame(&mut sink, batch, config.write_wait).await {
                        break Err(e);
                    }
                }
                break Ok(());
            }
            _ = ticker.tick() => {
                let ping = Frame::Ping(Vec::new());
                if let Err(e) = write_frame(&mut sink, ping, config.write_wait).await {
                    break Err(e);
                }
            }
        }
    };

    if result.is_ok() {
        let _ = write_frame(&mut sink, Frame::Close, config.write_wait).await;
    }
    let _ = sink.close().await;
    result
}

/// Join everything already queued behind `first` into one newline-separated message
fn coalesce(first: String, outbound: &mut mpsc::Receiver<String>) -> String {
    let mut batch = first;
    while let Ok(next) = outbound.try_recv() {
        batch.push('\n');
        batch.push_str(&next);
    }
    batch
}

async fn write_frame<Si, E>(
    sink: &mut Si,
    frame: Frame,
    timeout: Duration,
) -> Result<(), ChannelError>
where
    Si: Sink<Frame, Error = E> + Unpin,
    E: Display,
{
    match tokio::time::timeout(timeout, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ChannelError::Transport(e.to_string())),
        Err(_) => Err(ChannelError::Timeout),
    }
}

// ============================================================================
// Tests
// ============================================================================
