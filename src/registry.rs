//! In-memory marker registry.
//!
//! Written by the scanner, read by the connection manager (replay) and the
//! facade. Entries are only ever overwritten by a rescan of the same
//! `(locator, start line)`; nothing is evicted.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{MarkerId, SourceLocator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    /// Body taken from the line after a register-next-line token.
    SingleLine,
    /// Body delimited by begin/end tokens.
    Block,
}

/// 0-based, inclusive span of source lines covered by a marker and its tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRange {
    pub start: usize,
    pub end: usize,
}

/// A code fragment discovered in source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub id: MarkerId,
    pub source_locator: SourceLocator,
    pub kind: MarkerKind,
    pub code_body: String,
    pub line_range: LineRange,
}

impl Marker {
    pub fn new(
        source_locator: SourceLocator,
        kind: MarkerKind,
        code_body: String,
        line_range: LineRange,
    ) -> Self {
        Self {
            id: MarkerId::derive(&source_locator, line_range.start),
            source_locator,
            kind,
            code_body,
            line_range,
        }
    }
}

#[derive(Default)]
pub struct MarkerRegistry {
    markers: RwLock<HashMap<MarkerId, Marker>>,
}

impl MarkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite. Returns the entry that was replaced, if any.
    pub fn upsert(&self, marker: Marker) -> Option<Marker> {
        self.markers.write().insert(marker.id.clone(), marker)
    }

    pub fn get(&self, id: &str) -> Option<Marker> {
        self.markers.read().get(id).cloned()
    }

    /// All markers ordered by source locator, then start line.
    pub fn list_all(&self) -> Vec<Marker> {
        let mut all: Vec<Marker> = self.markers.read().values().cloned().collect();
        all.sort_by(|a, b| {
            a.source_locator
                .cmp(&b.source_locator)
                .then(a.line_range.start.cmp(&b.line_range.start))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.markers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.read().is_empty()
    }
}
