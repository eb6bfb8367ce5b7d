//! Explicit crawl state with load/save boundaries
//!
//! Checkpoint layout for a job named `J`:
//!
//! | File | Content |
//! |------|---------|
//! | `J-state.json.gz` | phase, unit progress, open stream positions and seen keys |
//! | `J-<set>.txt.gz` | one identifier per line |
//! | `J-failed.txt.gz` | keys of streams that exhausted their retries |
//!
//! Sets are written before the state document so that a crash between the
//! two leaves the stream positions behind the sets, never ahead of them.

use crate::crawler::{PageRequest, SeenKeys};
use crate::state::{CrawlPhase, IdSet, UnitProgress};
use crate::storage::{tagged_map, CheckpointStore};
use crate::{CheckpointResult, VodsweepError};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const STATE_VERSION: u32 = 1;

/// Saved position of one stream of an unfinished unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum StreamPosition {
    /// The next page to request
    Open {
        next: PageRequest,
        /// Keys the stream's de-duplicating accumulator already returned
        #[serde(default, with = "tagged_map", skip_serializing_if = "IndexMap::is_empty")]
        seen: SeenKeys,
    },
    /// Pagination ended (no next page, terminal response, or stopper)
    Finished,
    /// Gave up after exhausting retries
    Failed,
}

impl StreamPosition {
    /// An open position with nothing accumulated yet
    pub fn open(next: PageRequest) -> Self {
        Self::Open {
            next,
            seen: SeenKeys::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    phase: CrawlPhase,
    progress: UnitProgress,
    #[serde(with = "tagged_map")]
    streams: IndexMap<String, StreamPosition>,
    sets: Vec<String>,
    #[serde(default)]
    config_hash: Option<String>,
    saved_at: DateTime<Utc>,
}

/// All resumable progress of one crawl job
#[derive(Debug, Clone)]
pub struct CrawlState {
    job: String,
    phase: CrawlPhase,
    progress: UnitProgress,
    streams: IndexMap<String, StreamPosition>,
    sets: BTreeMap<String, IdSet>,
    failed: IdSet,
    config_hash: Option<String>,
    saved_at: Option<DateTime<Utc>>,
    saves: u64,
}

impl CrawlState {
    /// Creates an empty state starting in `phase`
    pub fn new(job: impl Into<String>, phase: CrawlPhase) -> Self {
        Self {
            job: job.into(),
            phase,
            progress: UnitProgress::new(),
            streams: IndexMap::new(),
            sets: BTreeMap::new(),
            failed: IdSet::new(),
            config_hash: None,
            saved_at: None,
            saves: 0,
        }
    }

    /// Loads the state of `job`, or a fresh state starting in `initial_phase`
    ///
    /// `set_names` lists sets the caller will collect into; they are loaded
    /// alongside any set recorded in the state document.
    pub fn load<S: CheckpointStore>(
        store: &S,
        job: &str,
        initial_phase: CrawlPhase,
        set_names: &[String],
    ) -> CheckpointResult<Self> {
        let mut state = Self::new(job, initial_phase);

        let mut names: Vec<String> = set_names.to_vec();
        match store.load_json::<StateDocument>(&state.state_name())? {
            Some(doc) => {
                tracing::info!(
                    "Resuming job {} in phase {} (resume key: {}, {} open streams, saved {})",
                    job,
                    doc.phase,
                    doc.progress.resume_key().unwrap_or("none"),
                    doc.streams.len(),
                    doc.saved_at
                );
                if doc.version != STATE_VERSION {
                    tracing::warn!(
                        "State document version {} differs from {}",
                        doc.version,
                        STATE_VERSION
                    );
                }
                state.phase = doc.phase;
                state.progress = doc.progress;
                state.streams = doc.streams;
                state.config_hash = doc.config_hash;
                state.saved_at = Some(doc.saved_at);
                names.extend(doc.sets);
            }
            None => tracing::info!("No prior state for job {}", job),
        }

        names.sort();
        names.dedup();
        for name in names {
            let ids = store
                .load_lines(&state.set_file(&name))?
                .unwrap_or_default();
            if !ids.is_empty() {
                tracing::info!("Loaded {} entries into set {}", ids.len(), name);
            }
            state.sets.insert(name, IdSet::from_saved(ids));
        }

        if let Some(failed) = store.load_lines(&state.failed_file())? {
            state.failed = IdSet::from_saved(failed);
        }

        Ok(state)
    }

    /// Starts over, truncating any checkpoints a previous run left behind
    pub fn fresh<S: CheckpointStore>(
        store: &S,
        job: &str,
        phase: CrawlPhase,
        set_names: &[String],
    ) -> CheckpointResult<Self> {
        let mut state = Self::new(job, phase);
        for name in set_names {
            store.save_lines(&state.set_file(name), std::iter::empty::<&str>())?;
            state.sets.insert(name.clone(), IdSet::new());
        }
        store.save_lines(&state.failed_file(), std::iter::empty::<&str>())?;
        state.save(store)?;
        Ok(state)
    }

    /// Writes dirty sets, the failed set, then the state document
    pub fn save<S: CheckpointStore>(&mut self, store: &S) -> CheckpointResult<()> {
        for (name, set) in self.sets.iter_mut() {
            if set.is_dirty() {
                store.save_lines(&format!("{}-{}.txt", self.job, name), set.iter())?;
                set.mark_saved();
            }
        }

        if self.failed.is_dirty() {
            store.save_lines(&self.failed_file(), self.failed.iter())?;
            self.failed.mark_saved();
        }

        let saved_at = Utc::now();
        let doc = StateDocument {
            version: STATE_VERSION,
            phase: self.phase,
            progress: self.progress.clone(),
            streams: self.streams.clone(),
            sets: self.sets.keys().cloned().collect(),
            config_hash: self.config_hash.clone(),
            saved_at,
        };
        store.save_json(&self.state_name(), &doc)?;
        self.saved_at = Some(saved_at);
        self.saves += 1;
        Ok(())
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn phase(&self) -> CrawlPhase {
        self.phase
    }

    /// Moves to the next phase, clearing per-phase progress
    pub fn advance_phase(&mut self, to: CrawlPhase) -> Result<(), VodsweepError> {
        self.phase = self.phase.transition(to)?;
        self.progress = UnitProgress::new();
        self.streams.clear();
        tracing::info!("Job {} entering phase {}", self.job, self.phase);
        Ok(())
    }

    pub fn progress(&self) -> &UnitProgress {
        &self.progress
    }

    pub fn progress_mut(&mut self) -> &mut UnitProgress {
        &mut self.progress
    }

    pub fn stream_position(&self, key: &str) -> Option<&StreamPosition> {
        self.streams.get(key)
    }

    pub fn set_stream_position(&mut self, key: impl Into<String>, position: StreamPosition) {
        self.streams.insert(key.into(), position);
    }

    /// Drops the saved positions of a completed unit's streams
    pub fn clear_stream_positions<'a, I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        for key in keys {
            self.streams.shift_remove(key);
        }
    }

    /// Number of streams with a saved open position
    pub fn open_streams(&self) -> usize {
        self.streams.values().filter(|p| p.is_open()).count()
    }

    pub fn set(&self, name: &str) -> Option<&IdSet> {
        self.sets.get(name)
    }

    /// Returns the named set, creating it if needed
    pub fn set_mut(&mut self, name: &str) -> &mut IdSet {
        self.sets.entry(name.to_string()).or_default()
    }

    /// Adds `id` to the named set, returning true if it was new
    pub fn insert(&mut self, set: &str, id: impl Into<String>) -> bool {
        self.set_mut(set).insert(id)
    }

    pub fn sets(&self) -> impl Iterator<Item = (&str, &IdSet)> {
        self.sets.iter().map(|(name, set)| (name.as_str(), set))
    }

    pub fn failed(&self) -> &IdSet {
        &self.failed
    }

    pub fn record_failure(&mut self, key: impl Into<String>) {
        self.failed.insert(key);
    }

    pub fn config_hash(&self) -> Option<&str> {
        self.config_hash.as_deref()
    }

    /// Records the hash of the configuration driving this run
    ///
    /// Returns false if a different hash was recorded by an earlier run.
    pub fn record_config_hash(&mut self, hash: &str) -> bool {
        let unchanged = self.config_hash.as_deref().map_or(true, |prev| prev == hash);
        self.config_hash = Some(hash.to_string());
        unchanged
    }

    /// When the state document was last written, if ever
    pub fn saved_at(&self) -> Option<DateTime<Utc>> {
        self.saved_at
    }

    /// Number of times this state has been saved by this process
    pub fn save_count(&self) -> u64 {
        self.saves
    }

    fn state_name(&self) -> String {
        format!("{}-state.json", self.job)
    }

    fn set_file(&self, set: &str) -> String {
        format!("{}-{}.txt", self.job, set)
    }

    fn failed_file(&self) -> String {
        format!("{}-failed.txt", self.job)
    }
}
