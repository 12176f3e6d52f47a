//! Marker discovery in source text.
//!
//! Two forms are recognized:
//!
//! ```text
//! // @eserver-line
//! return Date.now();          <- single-line marker (trimmed)
//!
//! // @eserver-begin
//! const x = args[0];          <- block marker body, lines kept verbatim
//! return x * 2;
//! // @eserver-end
//! ```
//!
//! Anomalies (unterminated or nested blocks, orphan end tokens) never abort a
//! scan; they are reported to the log buffer and the offending block is
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ScanAnomaly;
use crate::registry::{LineRange, Marker, MarkerKind, MarkerRegistry};
use crate::source::SourceFetcher;
use crate::telemetry::{LogBuffer, LogLevel};
use crate::types::SourceLocator;

/// Tokens recognized by the scanner. Matching is by substring, so the tokens
/// may sit inside any comment syntax.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScanTokens {
    pub register_next_line: String,
    pub begin: String,
    pub end: String,
}

impl Default for ScanTokens {
    fn default() -> Self {
        Self {
            register_next_line: "@eserver-line".to_string(),
            begin: "@eserver-begin".to_string(),
            end: "@eserver-end".to_string(),
        }
    }
}

/// Outcome of a scan pass over several locators.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub markers: Vec<Marker>,
    pub failed: Vec<SourceLocator>,
}

struct OpenBlock {
    start: usize,
    lines: Vec<String>,
}

pub struct MarkerScanner {
    registry: Arc<MarkerRegistry>,
    fetcher: Arc<dyn SourceFetcher>,
    log: Arc<LogBuffer>,
    tokens: ScanTokens,
    changes: Mutex<Option<mpsc::UnboundedSender<Marker>>>,
}

impl MarkerScanner {
    pub fn new(
        registry: Arc<MarkerRegistry>,
        fetcher: Arc<dyn SourceFetcher>,
        log: Arc<LogBuffer>,
        tokens: ScanTokens,
    ) -> Self {
        Self {
            registry,
            fetcher,
            log,
            tokens,
            changes: Mutex::new(None),
        }
    }

    pub fn tokens(&self) -> &ScanTokens {
        &self.tokens
    }

    /// Feed of markers that are new or whose body changed, from later scans on.
    ///
    /// Only one feed exists; calling this again replaces the previous one.
    pub fn watch_changes(&self) -> mpsc::UnboundedReceiver<Marker> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.changes.lock() = Some(tx);
        rx
    }

    /// Scan one source text, upsert every marker found, and return them.
    pub fn scan_source(&self, locator: &SourceLocator, text: &str) -> Vec<Marker> {
        let lines: Vec<&str> = text.lines().collect();
        let mut found = Vec::new();
        let mut open: Option<OpenBlock> = None;
        let mut idx = 0;

        while idx < lines.len() {
            let line = lines[idx];

            if line.contains(self.tokens.begin.as_str()) {
                if let Some(prev) = open.take() {
                    self.anomaly(ScanAnomaly::NestedBegin {
                        locator: locator.clone(),
                        line: idx,
                        discarded: prev.start,
                    });
                }
                open = Some(OpenBlock {
                    start: idx,
                    lines: Vec::new(),
                });
            } else if line.contains(self.tokens.end.as_str()) {
                match open.take() {
                    Some(block) => found.push(Marker::new(
                        locator.clone(),
                        MarkerKind::Block,
                        block.lines.join("\n"),
                        LineRange {
                            start: block.start,
                            end: idx,
                        },
                    )),
                    None => self.anomaly(ScanAnomaly::OrphanEnd {
                        locator: locator.clone(),
                        line: idx,
                    }),
                }
            } else if let Some(block) = open.as_mut() {
                block.lines.push(line.to_string());
            } else if line.contains(self.tokens.register_next_line.as_str()) {
                match lines.get(idx + 1) {
                    Some(next) => {
                        found.push(Marker::new(
                            locator.clone(),
                            MarkerKind::SingleLine,
                            next.trim().to_string(),
                            LineRange {
                                start: idx,
                                end: idx + 1,
                            },
                        ));
                        // The body line is consumed even if it holds a token.
                        idx += 1;
                    }
                    None => self.anomaly(ScanAnomaly::DanglingLineToken {
                        locator: locator.clone(),
                        line: idx,
                    }),
                }
            }

            idx += 1;
        }

        if let Some(block) = open {
            self.anomaly(ScanAnomaly::UnterminatedBlock {
                locator: locator.clone(),
                line: block.start,
            });
        }

        for marker in &found {
            let previous = self.registry.upsert(marker.clone());
            let replaced = previous.is_some();
            let changed = previous
                .is_none_or(|p| p.kind != marker.kind || p.code_body != marker.code_body);
            if changed && let Some(feed) = self.changes.lock().as_ref() {
                let _ = feed.send(marker.clone());
            }
            self.log.append(
                LogLevel::Info,
                format!(
                    "Found {} marker {} at {}:{}",
                    match marker.kind {
                        MarkerKind::SingleLine => "single-line",
                        MarkerKind::Block => "block",
                    },
                    marker.id,
                    marker.source_locator,
                    marker.line_range.start
                ),
                Some(json!({ "markerId": marker.id, "replaced": replaced, "changed": changed })),
            );
        }

        found
    }

    /// Fetch and scan every locator. A failed fetch is logged and skipped.
    pub async fn scan_all(&self, locators: &[SourceLocator]) -> ScanReport {
        let mut report = ScanReport::default();
        for locator in locators {
            match self.fetcher.fetch(locator).await {
                Ok(text) => report.markers.extend(self.scan_source(locator, &text)),
                Err(e) => {
                    self.log.append(
                        LogLevel::Error,
                        format!("Failed to fetch source `{}`: {:#}", locator, e),
                        Some(json!({ "locator": locator })),
                    );
                    report.failed.push(locator.clone());
                }
            }
        }
        self.log.debug(format!(
            "Scan pass complete: {} markers, {} failed locators",
            report.markers.len(),
            report.failed.len()
        ));
        report
    }

    /// Re-run [`scan_all`](Self::scan_all) every `interval` until aborted.
    pub fn spawn_periodic_rescan(
        self: Arc<Self>,
        locators: Vec<SourceLocator>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; the initial scan is the caller's.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.scan_all(&locators).await;
            }
        })
    }

    fn anomaly(&self, anomaly: ScanAnomaly) {
        self.log.warn(format!("Scan anomaly: {}", anomaly));
    }
}
