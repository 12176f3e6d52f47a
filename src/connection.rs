//! Connection lifecycle: connect, replay, reconnect.
//!
//! ```text
//! Disconnected --connect()--> Connecting --open--> Connected
//!      ^                          |                   |
//!      +-------- error -----------+---- close/error --+
//!               (reconnect after ReconnectPolicy delay)
//! ```
//!
//! Every transition into `Connected` replays the whole registry to the
//! executor. While connected, markers that a rescan adds or edits are
//! registered as they are found. Requests still pending when the channel drops are not failed
//! eagerly; they settle through their own timeouts.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::correlator::{Correlator, Reply};
use crate::error::{ClientError, ClientResult};
use crate::protocol::RequestPayload;
use crate::registry::{Marker, MarkerRegistry};
use crate::telemetry::{LogBuffer, LogLevel};
use crate::transport::{ChannelEvent, Connector};
use crate::types::MarkerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Delay before each reconnect attempt.
///
/// A multiplier of 1.0 gives a fixed delay; larger values back off
/// exponentially up to `max_delay`. The attempt counter resets on open.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(3000),
            multiplier: 1.0,
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay.as_millis() as f64;
        let cap = self.max_delay.max(self.delay).as_millis() as f64;
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        Duration::from_millis((base * factor).min(cap) as u64)
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    correlator: Arc<Correlator>,
    registry: Arc<MarkerRegistry>,
    log: Arc<LogBuffer>,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    /// Set while a connect attempt is in flight.
    connecting: AtomicBool,
    shut_down: AtomicBool,
    /// Set while a reconnect timer is armed; at most one is armed at a time.
    retry_pending: AtomicBool,
    failures: AtomicU32,
    pump: Mutex<Option<JoinHandle<()>>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        correlator: Arc<Correlator>,
        registry: Arc<MarkerRegistry>,
        log: Arc<LogBuffer>,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            correlator,
            registry,
            log,
            policy,
            state,
            connecting: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            retry_pending: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            pump: Mutex::new(None),
            reconnect: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until connected. Returns `false` if `timeout` elapses first.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == ConnectionState::Connected)).await,
            Ok(Ok(_))
        )
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            self.log.debug(format!("Connection state {:?} -> {:?}", prev, next));
        }
    }

    /// Make one connect attempt. On failure a retry is scheduled.
    ///
    /// Returns `Ok` without doing anything when already connected or when
    /// another attempt is in flight.
    pub async fn connect(self: &Arc<Self>) -> ClientResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ClientError::NotConnected);
        }
        if self.is_connected() {
            return Ok(());
        }
        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.log.debug("Connect attempt already in flight");
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        self.log.info(format!("Connecting to {}", self.connector.describe()));

        match self.connector.connect().await {
            Ok(channel) => {
                if self.shut_down.load(Ordering::SeqCst) {
                    self.set_state(ConnectionState::Disconnected);
                    self.connecting.store(false, Ordering::SeqCst);
                    return Err(ClientError::NotConnected);
                }
                self.failures.store(0, Ordering::SeqCst);
                self.correlator.attach(channel.outbound);
                self.set_state(ConnectionState::Connected);
                self.connecting.store(false, Ordering::SeqCst);
                self.log.info(format!("Connected to {}", self.connector.describe()));

                let pump = tokio::spawn(Arc::clone(self).pump(channel.events));
                *self.pump.lock() = Some(pump);
                self.spawn_replay();
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                self.connecting.store(false, Ordering::SeqCst);
                self.log.append(
                    LogLevel::Error,
                    format!("Failed to connect to {}: {:#}", self.connector.describe(), e),
                    None,
                );
                self.schedule_reconnect();
                Err(ClientError::Transport(format!("{:#}", e)))
            }
        }
    }

    /// Dispatch channel events until the channel closes or fails.
    async fn pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        let reason = loop {
            match events.recv().await {
                Some(ChannelEvent::Message(raw)) => self.correlator.on_message(&raw),
                Some(ChannelEvent::Closed) | None => break "closed by remote".to_string(),
                Some(ChannelEvent::Error(e)) => break e,
            }
        };
        self.on_disconnect(&reason);
    }

    fn on_disconnect(self: &Arc<Self>, reason: &str) {
        self.correlator.detach();
        self.set_state(ConnectionState::Disconnected);
        self.log.append(
            LogLevel::Warn,
            format!("Connection lost: {}", reason),
            Some(json!({ "pending": self.correlator.outstanding() })),
        );
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        if self.retry_pending.swap(true, Ordering::SeqCst) {
            self.log.debug("Reconnect already scheduled");
            return;
        }
        let attempt = self.failures.fetch_add(1, Ordering::SeqCst);
        let delay = self.policy.delay_for(attempt);
        self.log.info(format!("Reconnecting in {}ms", delay.as_millis()));

        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.retry_pending.store(false, Ordering::SeqCst);
            // Failures are logged and rescheduled inside connect().
            let _ = this.connect().await;
        });
        *self.reconnect.lock() = Some(handle);
    }

    /// Re-register every known marker. Failures are logged per marker.
    fn spawn_replay(self: &Arc<Self>) {
        let markers = self.registry.list_all();
        if markers.is_empty() {
            return;
        }
        self.log.info(format!("Replaying {} markers", markers.len()));

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let total = markers.len();
            let mut set = JoinSet::new();
            for marker in markers {
                let this = Arc::clone(&this);
                set.spawn(async move {
                    let result = this.register(&marker.id, &marker.code_body).await;
                    (marker.id, result)
                });
            }

            let mut failed = 0usize;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, Ok(_))) => {}
                    Ok((id, Err(e))) => {
                        failed += 1;
                        this.log.warn(format!("Replay of marker {} failed: {}", id, e));
                    }
                    Err(e) => {
                        failed += 1;
                        this.log.error(format!("Replay task failed: {}", e));
                    }
                }
            }
            this.log.info(format!("Replay complete: {}/{} registered", total - failed, total));
        });
    }

    /// Register markers from a scanner change feed while connected.
    ///
    /// Changes seen while disconnected are skipped; the next replay sends
    /// them. Registrations run one at a time so edits arrive in order.
    pub fn spawn_change_sync(
        self: &Arc<Self>,
        mut changes: mpsc::UnboundedReceiver<Marker>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(marker) = changes.recv().await {
                if !this.is_connected() {
                    continue;
                }
                match this.register(&marker.id, &marker.code_body).await {
                    Ok(_) => this.log.info(format!("Registered changed marker {}", marker.id)),
                    Err(e) => this.log.warn(format!(
                        "Registration of changed marker {} failed: {}",
                        marker.id, e
                    )),
                };
            }
        })
    }

    /// Ship a code body to the executor under `id`.
    pub async fn register(&self, id: &MarkerId, code: &str) -> ClientResult<Value> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let reply = self
            .correlator
            .send(RequestPayload::register(id.clone(), code))
            .await?;
        Ok(reply.value)
    }

    /// Run a registered marker on the executor.
    pub async fn execute(&self, id: &MarkerId, args: Vec<Value>) -> ClientResult<Reply> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.correlator
            .send(RequestPayload::execute(id.clone(), args))
            .await
    }

    /// Stop reconnecting and drop the current channel.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        if let Some(handle) = self.reconnect.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
        self.correlator.detach();
        self.set_state(ConnectionState::Disconnected);
        self.log.info("Connection manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::CorrelatorConfig;
    use crate::registry::{LineRange, Marker, MarkerKind};
    use crate::telemetry::LogQuery;
    use crate::testing::{MockConnector, ServerEnd};
    use crate::types::SourceLocator;

    struct Fixture {
        manager: Arc<ConnectionManager>,
        connector: Arc<MockConnector>,
        servers: mpsc::UnboundedReceiver<ServerEnd>,
        registry: Arc<MarkerRegistry>,
        log: Arc<LogBuffer>,
    }

    fn fixture() -> Fixture {
        let log = Arc::new(LogBuffer::default());
        let registry = Arc::new(MarkerRegistry::new());
        let correlator = Arc::new(Correlator::new(log.clone(), CorrelatorConfig::default()));
        let (connector, servers) = MockConnector::new();
        let manager = Arc::new(ConnectionManager::new(
            connector.clone(),
            correlator,
            registry.clone(),
            log.clone(),
            ReconnectPolicy::default(),
        ));
        Fixture {
            manager,
            connector,
            servers,
            registry,
            log,
        }
    }

    fn add_marker(registry: &MarkerRegistry, line: usize, body: &str) -> MarkerId {
        let marker = Marker::new(
            SourceLocator::new("app.js"),
            MarkerKind::Block,
            body.to_string(),
            LineRange { start: line, end: line + 2 },
        );
        let id = marker.id.clone();
        registry.upsert(marker);
        id
    }

    #[tokio::test]
    async fn calls_reject_while_disconnected() {
        let fx = fixture();
        assert_eq!(fx.manager.state(), ConnectionState::Disconnected);

        let id = MarkerId::new("mk_x");
        assert_eq!(
            fx.manager.execute(&id, vec![]).await.unwrap_err(),
            ClientError::NotConnected
        );
        assert_eq!(
            fx.manager.register(&id, "1").await.unwrap_err(),
            ClientError::NotConnected
        );
        assert_eq!(fx.connector.attempts(), 0);
    }

    #[tokio::test]
    async fn connect_replays_registry() {
        let mut fx = fixture();
        let a = add_marker(&fx.registry, 0, "return 'a';");
        let b = add_marker(&fx.registry, 10, "return 'b';");

        fx.manager.connect().await.unwrap();
        assert_eq!(fx.manager.state(), ConnectionState::Connected);

        let mut server = fx.servers.recv().await.unwrap();
        let mut registered = Vec::new();
        for _ in 0..2 {
            let frame = server.next_frame().await.unwrap();
            assert_eq!(frame["type"], "register");
            registered.push(frame["functionId"].as_str().unwrap().to_string());
            server.reply_ok(&frame, json!(true));
        }
        registered.sort();
        let mut expected = vec![a.into_inner(), b.into_inner()];
        expected.sort();
        assert_eq!(registered, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failed_replay_does_not_block_others() {
        let mut fx = fixture();
        add_marker(&fx.registry, 0, "bad");
        add_marker(&fx.registry, 10, "good");
        fx.manager.connect().await.unwrap();

        let mut server = fx.servers.recv().await.unwrap();
        for _ in 0..2 {
            let frame = server.next_frame().await.unwrap();
            if frame["functionBody"] == "bad" {
                server.reply_err(&frame, "SyntaxError");
            } else {
                server.reply_ok(&frame, json!(true));
            }
        }

        // Let the replay task drain; well short of the register timeout.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            fx.log.snapshot(&LogQuery::default().contains("Replay of marker")).len(),
            1
        );
        assert_eq!(
            fx.log.snapshot(&LogQuery::default().contains("Replay complete: 1/2")).len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_close_and_replays_again() {
        let mut fx = fixture();
        add_marker(&fx.registry, 0, "return 1;");
        fx.manager.connect().await.unwrap();

        let mut first = fx.servers.recv().await.unwrap();
        let frame = first.next_frame().await.unwrap();
        first.reply_ok(&frame, json!(true));
        first.close();

        let mut rx = fx.manager.subscribe();
        rx.wait_for(|s| *s == ConnectionState::Disconnected).await.unwrap();
        assert!(!fx.manager.is_connected());
        assert_eq!(
            fx.manager.execute(&MarkerId::new("mk_x"), vec![]).await.unwrap_err(),
            ClientError::NotConnected
        );

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(fx.connector.attempts(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.connector.attempts(), 2);
        assert!(fx.manager.is_connected());

        let mut second = fx.servers.recv().await.unwrap();
        let replayed = second.next_frame().await.unwrap();
        assert_eq!(replayed["type"], "register");
        assert_eq!(replayed["functionBody"], "return 1;");
        // Nothing was sent on the dead channel while disconnected.
        assert!(first.frames.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_retries_after_fixed_delay() {
        let fx = fixture();
        fx.connector.fail_next(2);

        assert!(fx.manager.connect().await.unwrap_err().is_transport());
        assert_eq!(fx.manager.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(3050)).await;
        assert_eq!(fx.connector.attempts(), 2);
        assert!(!fx.manager.is_connected());

        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(fx.connector.attempts(), 3);
        assert!(fx.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_connect_failure_does_not_arm_second_retry_timer() {
        let fx = fixture();
        fx.connector.fail_next(100);

        assert!(fx.manager.connect().await.is_err());
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(fx.manager.connect().await.is_err());
        assert_eq!(fx.connector.attempts(), 2);

        // One fixed-delay loop from t=0: retries at 3s, 6s, ..., 27s.
        tokio::time::sleep(Duration::from_millis(28_500)).await;
        assert_eq!(fx.connector.attempts(), 11);
        assert_eq!(
            fx.log.snapshot(&LogQuery::default().contains("Reconnect already scheduled")).len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_once_per_failed_retry() {
        let log = Arc::new(LogBuffer::default());
        let (connector, _servers) = MockConnector::new();
        let manager = Arc::new(ConnectionManager::new(
            connector.clone(),
            Arc::new(Correlator::new(log.clone(), CorrelatorConfig::default())),
            Arc::new(MarkerRegistry::new()),
            log.clone(),
            ReconnectPolicy {
                delay: Duration::from_millis(1000),
                multiplier: 2.0,
                max_delay: Duration::from_millis(8000),
            },
        ));
        connector.fail_next(100);

        assert!(manager.connect().await.is_err());
        assert!(manager.connect().await.is_err());
        // Attempts at 0, 0, then retries at 1s, 3s, 7s.
        tokio::time::sleep(Duration::from_millis(7500)).await;
        assert_eq!(connector.attempts(), 5);
        assert_eq!(
            log.snapshot(&LogQuery::default().contains("Reconnecting in 8000ms")).len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn only_one_connect_in_flight() {
        let fx = fixture();
        fx.connector.set_latency(Duration::from_millis(100));

        let (a, b) = tokio::join!(fx.manager.connect(), fx.manager.connect());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(fx.connector.attempts(), 1);
        assert!(fx.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_calls_time_out_after_disconnect() {
        let mut fx = fixture();
        fx.manager.connect().await.unwrap();
        let mut server = fx.servers.recv().await.unwrap();

        let manager = fx.manager.clone();
        let call = tokio::spawn(async move { manager.execute(&MarkerId::new("mk_1"), vec![]).await });
        let _frame = server.next_frame().await.unwrap();
        server.close();

        let started = tokio::time::Instant::now();
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::ExecutionTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(9000));
    }

    #[tokio::test(start_paused = true)]
    async fn change_feed_registers_only_while_connected() {
        let mut fx = fixture();
        let (tx, rx) = mpsc::unbounded_channel();
        fx.manager.spawn_change_sync(rx);

        let offline = Marker::new(
            SourceLocator::new("app.js"),
            MarkerKind::Block,
            "return 'offline';".to_string(),
            LineRange { start: 0, end: 2 },
        );
        tx.send(offline).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.connector.attempts(), 0);

        fx.manager.connect().await.unwrap();
        let mut server = fx.servers.recv().await.unwrap();
        let id = add_marker(&fx.registry, 5, "return 'live';");
        tx.send(fx.registry.get(id.as_str()).unwrap()).unwrap();

        let frame = server.next_frame().await.unwrap();
        assert_eq!(frame["type"], "register");
        assert_eq!(frame["functionId"], id.as_str());
        assert_eq!(frame["functionBody"], "return 'live';");
        server.reply_ok(&frame, json!(true));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            fx.log.snapshot(&LogQuery::default().contains("Registered changed marker")).len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_reconnecting() {
        let mut fx = fixture();
        fx.manager.connect().await.unwrap();
        let server = fx.servers.recv().await.unwrap();
        server.close();

        let mut rx = fx.manager.subscribe();
        rx.wait_for(|s| *s == ConnectionState::Disconnected).await.unwrap();
        fx.manager.shutdown();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.connector.attempts(), 1);
        assert!(fx.manager.connect().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_connected_times_out() {
        let fx = fixture();
        assert!(!fx.manager.wait_connected(Duration::from_millis(50)).await);
        fx.manager.connect().await.unwrap();
        assert!(fx.manager.wait_connected(Duration::from_millis(50)).await);
    }

    #[test]
    fn backoff_policy() {
        let fixed = ReconnectPolicy::default();
        assert_eq!(fixed.delay_for(0), Duration::from_millis(3000));
        assert_eq!(fixed.delay_for(7), Duration::from_millis(3000));

        let exp = ReconnectPolicy {
            delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(5000),
        };
        assert_eq!(exp.delay_for(0), Duration::from_millis(1000));
        assert_eq!(exp.delay_for(1), Duration::from_millis(2000));
        assert_eq!(exp.delay_for(2), Duration::from_millis(4000));
        assert_eq!(exp.delay_for(3), Duration::from_millis(5000));
        assert_eq!(exp.delay_for(40), Duration::from_millis(5000));
    }
}
