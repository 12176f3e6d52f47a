//! In-memory connector and executor doubles shared by the test modules.

#![cfg(test)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::transport::{Channel, ChannelEvent, Connector};

/// The executor's side of one mock connection.
pub struct ServerEnd {
    pub frames: mpsc::UnboundedReceiver<String>,
    pub events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ServerEnd {
    /// Next outbound frame from the client, parsed.
    pub async fn next_frame(&mut self) -> Option<Value> {
        let raw = self.frames.recv().await?;
        Some(serde_json::from_str(&raw).expect("client sent invalid JSON"))
    }

    pub fn reply_raw(&self, raw: impl Into<String>) {
        let _ = self.events.send(ChannelEvent::Message(raw.into()));
    }

    pub fn reply_ok(&self, frame: &Value, result: Value) {
        self.reply_raw(json!({ "requestId": frame["requestId"], "result": result }).to_string());
    }

    pub fn reply_err(&self, frame: &Value, message: &str) {
        self.reply_raw(json!({ "requestId": frame["requestId"], "error": message }).to_string());
    }

    pub fn close(&self) {
        let _ = self.events.send(ChannelEvent::Closed);
    }
}

/// Connector whose channels are handed to the test through a queue.
pub struct MockConnector {
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    latency: Mutex<Duration>,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            attempts: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            latency: Mutex::new(Duration::ZERO),
            servers: tx,
        });
        (connector, rx)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Channel> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("connection refused");
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = self.servers.send(ServerEnd {
            frames: outbound_rx,
            events: events_tx,
        });
        Ok(Channel {
            outbound: outbound_tx,
            events: events_rx,
        })
    }

    fn describe(&self) -> String {
        "mock://executor".to_string()
    }
}

/// Minimal executor: remembers registered bodies and answers `execute` with
/// `eval(body, args)`. Executing an unregistered function is a remote error.
pub fn spawn_executor<F>(mut server: ServerEnd, eval: F) -> JoinHandle<()>
where
    F: Fn(&str, &[Value]) -> std::result::Result<Value, String> + Send + 'static,
{
    tokio::spawn(async move {
        let mut functions: HashMap<String, String> = HashMap::new();
        while let Some(frame) = server.next_frame().await {
            let function_id = frame["functionId"].as_str().unwrap_or_default().to_string();
            match frame["type"].as_str() {
                Some("register") => {
                    let body = frame["functionBody"].as_str().unwrap_or_default().to_string();
                    functions.insert(function_id, body);
                    server.reply_ok(&frame, json!(true));
                }
                Some("execute") => {
                    let args = frame["args"].as_array().cloned().unwrap_or_default();
                    match functions.get(&function_id) {
                        Some(body) => match eval(body, &args) {
                            Ok(result) => server.reply_raw(
                                json!({
                                    "requestId": frame["requestId"],
                                    "result": result,
                                    "markerId": function_id,
                                })
                                .to_string(),
                            ),
                            Err(message) => server.reply_err(&frame, &message),
                        },
                        None => server.reply_err(&frame, &format!("unknown function {}", function_id)),
                    }
                }
                _ => server.reply_err(&frame, "unknown frame type"),
            }
        }
    })
}
