//! Duplex message channels to the remote executor.
//!
//! A [`Connector`] opens a [`Channel`]: an outbound sender of text frames and
//! a receiver of [`ChannelEvent`]s. The connection manager never sees sockets,
//! only this pair, which keeps the transport swappable.

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Something that happened on an open channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// One inbound text frame.
    Message(String),
    /// The remote side closed the connection.
    Closed,
    /// The connection failed.
    Error(String),
}

/// An open connection. Dropping `outbound` closes the write side.
pub struct Channel {
    pub outbound: mpsc::UnboundedSender<String>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new channel. Resolves once the channel is usable.
    async fn connect(&self) -> Result<Channel>;

    /// Human-readable endpoint description for logs.
    fn describe(&self) -> String;
}

/// Newline-delimited JSON frames over TCP.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Channel> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("failed to connect to {}", self.addr))?;
        stream.set_nodelay(true)?;
        info!("Connected to remote executor at {}", self.addr);

        let (read_half, mut write_half) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ChannelEvent>();

        // Writer: drains outbound frames until the sender side is dropped.
        let writer_events = events_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let written = async {
                    write_half.write_all(frame.as_bytes()).await?;
                    write_half.write_all(b"\n").await?;
                    write_half.flush().await
                }
                .await;
                if let Err(e) = written {
                    let _ = writer_events.send(ChannelEvent::Error(format!("write failed: {}", e)));
                    return;
                }
            }
            debug!("Outbound channel dropped; shutting down writer");
            let _ = write_half.shutdown().await;
        });

        // Reader: one event per line, then Closed/Error.
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        let _ = events_tx.send(ChannelEvent::Closed);
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        if events_tx.send(ChannelEvent::Message(trimmed.to_string())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = events_tx.send(ChannelEvent::Error(format!("read failed: {}", e)));
                        break;
                    }
                }
            }
        });

        Ok(Channel {
            outbound: outbound_tx,
            events: events_rx,
        })
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}
