// Leaf components
mod error;
mod types;
pub mod telemetry;
pub mod registry;

// Discovery
pub mod source;
pub mod scanner;

// Remote channel
pub mod protocol;
pub mod transport;
pub mod correlator;
pub mod connection;

// Public surface
pub mod facade;
pub mod config;
pub mod runtime;

#[cfg(test)]
mod testing;

// Re-export key types
pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionState, ReconnectPolicy};
pub use correlator::{Correlator, CorrelatorConfig, Reply};
pub use error::{ClientError, ClientResult, ScanAnomaly};
pub use facade::ExecutionFacade;
pub use registry::{LineRange, Marker, MarkerKind, MarkerRegistry};
pub use runtime::MarkerRuntime;
pub use scanner::{MarkerScanner, ScanReport, ScanTokens};
pub use source::{DefaultSourceFetcher, SourceFetcher, StaticSourceFetcher};
pub use telemetry::{LogBuffer, LogEntry, LogLevel, LogQuery};
pub use transport::{Channel, ChannelEvent, Connector, TcpConnector};
pub use types::{MarkerId, RequestId, SourceLocator};

use std::sync::Arc;
use anyhow::Result;

/// Convenience function to build a runtime talking TCP to `config.endpoint`
/// and reading sources from disk or HTTP.
pub fn create_runtime(config: ClientConfig) -> Result<Arc<MarkerRuntime>> {
    let connector = Arc::new(TcpConnector::new(config.endpoint.clone()));
    let fetcher = Arc::new(DefaultSourceFetcher::new()?);
    Ok(Arc::new(MarkerRuntime::new(config, connector, fetcher)))
}
