//! The API surface calling code should use to run markers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Value, json};

use crate::connection::ConnectionManager;
use crate::error::{ClientError, ClientResult};
use crate::registry::{MarkerKind, MarkerRegistry};
use crate::telemetry::{LogBuffer, LogLevel};
use crate::types::MarkerId;

pub struct ExecutionFacade {
    connection: Option<Arc<ConnectionManager>>,
    registry: Arc<MarkerRegistry>,
    log: Arc<LogBuffer>,
    /// Last successful result per registered marker, keyed by the executor's tag.
    results: RwLock<HashMap<MarkerId, Value>>,
}

impl ExecutionFacade {
    pub fn new(
        connection: Option<Arc<ConnectionManager>>,
        registry: Arc<MarkerRegistry>,
        log: Arc<LogBuffer>,
    ) -> Self {
        Self {
            connection,
            registry,
            log,
            results: RwLock::new(HashMap::new()),
        }
    }

    /// Execute a marker by id. Remote errors are returned unmodified.
    pub async fn execute(&self, marker_id: &MarkerId, args: Vec<Value>) -> ClientResult<Value> {
        let Some(connection) = self.connection.as_ref().filter(|c| c.is_connected()) else {
            self.log.append(
                LogLevel::Warn,
                format!("Cannot execute {}: not connected", marker_id),
                Some(json!({ "markerId": marker_id })),
            );
            return Err(ClientError::NotConnected);
        };

        match connection.execute(marker_id, args).await {
            Ok(reply) => {
                // Only markers the registry knows get a cache slot.
                let tag = reply
                    .marker_id
                    .filter(|tag| self.registry.get(tag.as_str()).is_some())
                    .unwrap_or_else(|| marker_id.clone());
                if self.registry.get(tag.as_str()).is_some() {
                    self.results.write().insert(tag, reply.value.clone());
                }
                Ok(reply.value)
            }
            Err(e) => {
                self.log.append(
                    LogLevel::Error,
                    format!("Execution of {} failed: {}", marker_id, e),
                    Some(json!({ "markerId": marker_id })),
                );
                Err(e)
            }
        }
    }

    /// First block marker whose locator and body contain the given substrings.
    pub fn resolve_marker_by_content(
        &self,
        source_substring: &str,
        code_substring: &str,
    ) -> Option<MarkerId> {
        self.registry
            .list_all()
            .into_iter()
            .find(|m| {
                m.kind == MarkerKind::Block
                    && m.source_locator.as_str().contains(source_substring)
                    && m.code_body.contains(code_substring)
            })
            .map(|m| m.id)
    }

    /// Most recent successful result recorded for `marker_id`.
    pub fn last_result(&self, marker_id: &str) -> Option<Value> {
        self.results.read().get(marker_id).cloned()
    }
}
