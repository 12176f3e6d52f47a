//! The service context wiring every component together.
//!
//! One `MarkerRuntime` is built at startup; components receive their
//! collaborators from it by `Arc` instead of reaching for process globals.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::correlator::Correlator;
use crate::error::ClientResult;
use crate::facade::ExecutionFacade;
use crate::registry::MarkerRegistry;
use crate::scanner::{MarkerScanner, ScanReport};
use crate::source::SourceFetcher;
use crate::telemetry::LogBuffer;
use crate::transport::Connector;

pub struct MarkerRuntime {
    config: ClientConfig,
    log: Arc<LogBuffer>,
    registry: Arc<MarkerRegistry>,
    scanner: Arc<MarkerScanner>,
    correlator: Arc<Correlator>,
    connection: Arc<ConnectionManager>,
    facade: Arc<ExecutionFacade>,
    rescan: Mutex<Option<JoinHandle<()>>>,
    change_sync: Mutex<Option<JoinHandle<()>>>,
}

impl MarkerRuntime {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        fetcher: Arc<dyn SourceFetcher>,
    ) -> Self {
        let log = Arc::new(LogBuffer::new(config.log_capacity));
        let registry = Arc::new(MarkerRegistry::new());
        let scanner = Arc::new(MarkerScanner::new(
            registry.clone(),
            fetcher,
            log.clone(),
            config.tokens.clone(),
        ));
        let correlator = Arc::new(Correlator::new(log.clone(), config.correlator()));
        let connection = Arc::new(ConnectionManager::new(
            connector,
            correlator.clone(),
            registry.clone(),
            log.clone(),
            config.reconnect_policy(),
        ));
        let facade = Arc::new(ExecutionFacade::new(
            Some(connection.clone()),
            registry.clone(),
            log.clone(),
        ));

        Self {
            config,
            log,
            registry,
            scanner,
            correlator,
            connection,
            facade,
            rescan: Mutex::new(None),
            change_sync: Mutex::new(None),
        }
    }

    /// Scan configured sources, start connecting, and start periodic rescans.
    ///
    /// Markers found by later scans are registered as soon as they appear
    /// while connected; the initial scan is sent by the connect replay.
    ///
    /// A failed first connect is not an error here: the retry is already
    /// scheduled and callers observe the state through [`connection`](Self::connection).
    pub async fn start(&self) -> ScanReport {
        let locators = self.config.source_locators();
        let report = self.scanner.scan_all(&locators).await;
        info!(
            "Initial scan: {} markers from {} sources",
            report.markers.len(),
            locators.len()
        );

        let changes = self.scanner.watch_changes();
        *self.change_sync.lock() = Some(self.connection.spawn_change_sync(changes));

        let _ = self.connection.connect().await;

        if let Some(interval) = self.config.rescan_interval() {
            let handle = self.scanner.clone().spawn_periodic_rescan(locators, interval);
            *self.rescan.lock() = Some(handle);
        }
        report
    }

    /// Attempt a connection now, without waiting for a scheduled retry.
    pub async fn connect(&self) -> ClientResult<()> {
        self.connection.connect().await
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.rescan.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.change_sync.lock().take() {
            handle.abort();
        }
        self.connection.shutdown();
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<LogBuffer> {
        &self.log
    }

    pub fn registry(&self) -> &Arc<MarkerRegistry> {
        &self.registry
    }

    pub fn scanner(&self) -> &Arc<MarkerScanner> {
        &self.scanner
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn facade(&self) -> &Arc<ExecutionFacade> {
        &self.facade
    }
}
