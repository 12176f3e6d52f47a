//! Request/reply correlation over the single shared channel.
//!
//! Every outbound frame carries a fresh `requestId`. The correlator keeps one
//! [`PendingRequest`] per id until either the matching reply arrives or the
//! per-kind timeout fires; whichever removes the entry from the table first
//! settles the caller, so each call settles exactly once. Replies may arrive
//! in any order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{ClientError, ClientResult};
use crate::protocol::{OutboundFrame, ReplyFrame, RequestKind, RequestPayload};
use crate::telemetry::{LogBuffer, LogLevel};
use crate::types::{MarkerId, RequestId};

pub const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_millis(10000);

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    pub register_timeout: Duration,
    pub execute_timeout: Duration,
    /// Reject new calls while this many are outstanding. `None` means unbounded.
    pub max_outstanding: Option<usize>,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            register_timeout: DEFAULT_REGISTER_TIMEOUT,
            execute_timeout: DEFAULT_EXECUTE_TIMEOUT,
            max_outstanding: None,
        }
    }
}

/// A settled reply: the result value plus the executor's marker tag, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub value: Value,
    pub marker_id: Option<MarkerId>,
}

struct PendingRequest {
    kind: RequestKind,
    created_at: Instant,
    responder: oneshot::Sender<ClientResult<Reply>>,
    timeout: JoinHandle<()>,
}

type PendingTable = Arc<Mutex<HashMap<RequestId, PendingRequest>>>;

pub struct Correlator {
    pending: PendingTable,
    outbound: RwLock<Option<mpsc::UnboundedSender<String>>>,
    log: Arc<LogBuffer>,
    config: CorrelatorConfig,
}

impl Correlator {
    pub fn new(log: Arc<LogBuffer>, config: CorrelatorConfig) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            outbound: RwLock::new(None),
            log,
            config,
        }
    }

    pub fn config(&self) -> &CorrelatorConfig {
        &self.config
    }

    /// Route subsequent frames to a newly opened channel.
    pub fn attach(&self, sender: mpsc::UnboundedSender<String>) {
        *self.outbound.write() = Some(sender);
    }

    /// Forget the current channel. Outstanding calls are left to time out.
    pub fn detach(&self) {
        *self.outbound.write() = None;
    }

    pub fn is_attached(&self) -> bool {
        self.outbound.read().is_some()
    }

    /// Number of calls awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send a frame and wait for its reply or timeout.
    pub async fn send(&self, payload: RequestPayload) -> ClientResult<Reply> {
        let rx = self.dispatch(payload)?;
        rx.await.unwrap_or_else(|_| {
            Err(ClientError::Transport("reply channel dropped".to_string()))
        })
    }

    /// Register, transmit, and hand back the receiver the caller will await.
    fn dispatch(&self, payload: RequestPayload) -> ClientResult<oneshot::Receiver<ClientResult<Reply>>> {
        let sender = self
            .outbound
            .read()
            .clone()
            .ok_or(ClientError::NotConnected)?;

        let kind = payload.kind();
        let request_id = RequestId::generate();
        let frame = OutboundFrame {
            request_id: request_id.clone(),
            payload,
        };
        let encoded = serde_json::to_string(&frame)
            .map_err(|e| ClientError::Transport(format!("failed to encode frame: {}", e)))?;

        let (tx, rx) = oneshot::channel();
        {
            // Insert before transmitting so a fast reply always finds its entry.
            let mut table = self.pending.lock();
            if let Some(limit) = self.config.max_outstanding
                && table.len() >= limit
            {
                return Err(ClientError::TooManyOutstanding(limit));
            }
            let timeout = self.spawn_timeout(request_id.clone(), kind);
            table.insert(
                request_id.clone(),
                PendingRequest {
                    kind,
                    created_at: Instant::now(),
                    responder: tx,
                    timeout,
                },
            );
        }

        if sender.send(encoded).is_err() {
            if let Some(entry) = self.pending.lock().remove(&request_id) {
                entry.timeout.abort();
            }
            self.log.warn(format!("Failed to send {} {}: channel closed", kind.as_str(), request_id));
            return Err(ClientError::Transport("channel closed".to_string()));
        }

        self.log.debug(format!("Sent {} request {}", kind.as_str(), request_id));
        Ok(rx)
    }

    fn spawn_timeout(&self, request_id: RequestId, kind: RequestKind) -> JoinHandle<()> {
        let after = match kind {
            RequestKind::Register => self.config.register_timeout,
            RequestKind::Execute => self.config.execute_timeout,
        };
        let pending = Arc::clone(&self.pending);
        let log = Arc::clone(&self.log);

        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(entry) = pending.lock().remove(&request_id) else {
                return;
            };
            log.append(
                LogLevel::Warn,
                format!("{} request {} timed out", kind.as_str(), request_id),
                Some(json!({ "afterMs": after.as_millis() as u64 })),
            );
            let err = match kind {
                RequestKind::Register => ClientError::RegistrationTimeout { request_id, after },
                RequestKind::Execute => ClientError::ExecutionTimeout { request_id, after },
            };
            let _ = entry.responder.send(Err(err));
        })
    }

    /// Handle one inbound frame. Malformed or unmatched frames are dropped.
    pub fn on_message(&self, raw: &str) {
        let reply: ReplyFrame = match serde_json::from_str(raw) {
            Ok(reply) => reply,
            Err(e) => {
                self.log.debug(format!("Dropping unparseable frame: {}", e));
                return;
            }
        };

        let Some(request_id) = reply.request_id.clone() else {
            self.log.debug("Dropping frame without requestId");
            return;
        };

        let Some(entry) = self.pending.lock().remove(&request_id) else {
            self.log.debug(format!("Dropping reply for unknown request {}", request_id));
            return;
        };
        entry.timeout.abort();

        let elapsed = entry.created_at.elapsed();
        let outcome = match reply.outcome() {
            Ok(value) => {
                self.log.debug(format!(
                    "{} request {} settled in {}ms",
                    entry.kind.as_str(),
                    request_id,
                    elapsed.as_millis()
                ));
                Ok(Reply {
                    value,
                    marker_id: reply.marker_id,
                })
            }
            Err(message) => {
                self.log.append(
                    LogLevel::Warn,
                    format!("{} request {} failed remotely: {}", entry.kind.as_str(), request_id, message),
                    None,
                );
                Err(ClientError::RemoteExecution(message))
            }
        };
        // The caller may have given up waiting; that is not an error here.
        let _ = entry.responder.send(outcome);
    }
}
