//! Contiguous-from-start unit progress
//!
//! Units are dispatched in increasing ordinal order but may complete in any
//! order. The marker only ever names a unit whose predecessors are all
//! complete, so a checkpoint of the marker is never ahead of durable work.
//! Units that finished past a gap are kept in `completed_ahead` so a resume
//! skips them as well.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitProgress {
    /// Ordinal of the last unit in the completed prefix
    marker: Option<u64>,

    /// Key of the marker unit (entity ID, range start, stream name)
    #[serde(rename = "resume_key")]
    marker_key: Option<String>,

    /// Completed units beyond the marker
    completed_ahead: BTreeSet<u64>,

    /// Dispatched ordinals, oldest first
    #[serde(skip)]
    pending: VecDeque<(u64, String)>,
}

impl UnitProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn marker(&self) -> Option<u64> {
        self.marker
    }

    /// Key of the last unit of the completed prefix
    pub fn resume_key(&self) -> Option<&str> {
        self.marker_key.as_deref()
    }

    /// Number of completed units past the marker
    pub fn completed_ahead(&self) -> usize {
        self.completed_ahead.len()
    }

    /// Returns true if the unit finished in this or a previous run
    pub fn is_done(&self, ordinal: u64) -> bool {
        self.marker.is_some_and(|m| ordinal <= m) || self.completed_ahead.contains(&ordinal)
    }

    /// Records that a unit has been handed out
    ///
    /// Ordinals must be dispatched in strictly increasing order.
    pub fn dispatch(&mut self, ordinal: u64, key: impl Into<String>) {
        debug_assert!(
            self.pending.back().map_or(true, |(last, _)| *last < ordinal),
            "units must be dispatched in increasing order"
        );
        self.pending.push_back((ordinal, key.into()));
    }

    /// Records that a unit finished, successfully or not
    pub fn complete(&mut self, ordinal: u64) {
        self.completed_ahead.insert(ordinal);
        self.advance();
    }

    /// Records a unit that was already done in a previous run
    ///
    /// Units covered by the marker need no bookkeeping and are ignored.
    pub fn skip(&mut self, ordinal: u64, key: impl Into<String>) {
        if self.marker.is_some_and(|m| ordinal <= m) {
            return;
        }
        self.dispatch(ordinal, key);
        self.complete(ordinal);
    }

    fn advance(&mut self) {
        while let Some((front, _)) = self.pending.front() {
            if !self.completed_ahead.remove(front) {
                break;
            }
            if let Some((ordinal, key)) = self.pending.pop_front() {
                self.marker = Some(ordinal);
                self.marker_key = Some(key);
            }
        }
    }
}
