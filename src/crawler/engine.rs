//! Crawl engine
//!
//! The engine pulls units from a work source, keeps a bounded pool of open
//! streams busy and feeds every page through merge, collection, the
//! caller's handler, the stopper and the cursor. The driving task is the only
//! writer of `CrawlState`; spawned fetch tasks only return bodies.

use crate::config::CrawlerConfig;
use crate::crawler::controls::Controls;
use crate::crawler::fetcher::RetryingFetcher;
use crate::crawler::merge::{merge_for, MergeStrategy};
use crate::crawler::source::{field_values, StreamSpec, WorkSource, WorkUnit};
use crate::crawler::PageRequest;
use crate::state::{CrawlState, StreamPosition};
use crate::storage::CheckpointStore;
use crate::{FetchError, FetchResult, VodsweepError};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Caller hooks run as pages arrive and streams end
pub trait PageHandler {
    /// Called on every page after collection rules are applied
    fn on_page(&mut self, state: &mut CrawlState, stream: &str, items: &[Value]);

    /// Called once a stream leaves the pool, with its accumulator
    ///
    /// `merge.merged(field)` holds the latest value of every item the stream
    /// returned since this process opened it.
    fn on_stream_end(
        &mut self,
        _state: &mut CrawlState,
        _stream: &str,
        _merge: &dyn MergeStrategy,
    ) {
    }
}

impl<F> PageHandler for F
where
    F: FnMut(&mut CrawlState, &str, &[Value]),
{
    fn on_page(&mut self, state: &mut CrawlState, stream: &str, items: &[Value]) {
        self(state, stream, items)
    }
}

/// Handler for runs that only need the configured collection rules
struct Discard;

impl PageHandler for Discard {
    fn on_page(&mut self, _: &mut CrawlState, _: &str, _: &[Value]) {}
}

/// Checkpoint and progress cadence
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub checkpoint_every_pages: u32,
    pub flush_interval: Duration,
    pub progress_every_pages: u32,
}

impl From<&CrawlerConfig> for EngineSettings {
    fn from(config: &CrawlerConfig) -> Self {
        Self {
            checkpoint_every_pages: config.checkpoint_every_pages.max(1),
            flush_interval: Duration::from_secs(config.flush_interval_secs.max(1)),
            progress_every_pages: config.progress_every_pages.max(1),
        }
    }
}

/// Summary of one engine run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CrawlReport {
    pub pages: u64,
    pub items: u64,
    pub units_completed: u64,
    /// Units already completed by a previous run
    pub units_skipped: u64,
    pub streams_failed: u64,
    pub streams_stopped: u64,
    /// True when the run drained after a shutdown request
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// A stream with its accumulator and next request
struct OpenStream {
    spec: StreamSpec,
    unit: u64,
    merge: Box<dyn MergeStrategy>,
    next: PageRequest,
}

struct ActiveUnit {
    key: String,
    remaining: usize,
    stream_keys: Vec<String>,
}

/// How a stream left the pool
enum StreamEnd {
    Finished,
    Failed,
}

pub struct CrawlEngine {
    fetcher: RetryingFetcher,
    settings: EngineSettings,
    cancel: CancellationToken,
    concurrency: watch::Receiver<usize>,
}

impl CrawlEngine {
    pub fn new(fetcher: RetryingFetcher, settings: EngineSettings, controls: &Controls) -> Self {
        Self {
            fetcher,
            settings,
            cancel: controls.cancel_token(),
            concurrency: controls.subscribe(),
        }
    }

    /// Runs `source` to exhaustion or until a shutdown request
    pub async fn run<W, S>(
        &self,
        source: &mut W,
        state: &mut CrawlState,
        store: &S,
    ) -> Result<CrawlReport, VodsweepError>
    where
        W: WorkSource + ?Sized,
        S: CheckpointStore,
    {
        self.run_with_handler(source, state, store, &mut Discard).await
    }

    /// Like `run`, calling `handler` on every page's new items
    pub async fn run_with_handler<W, S, H>(
        &self,
        source: &mut W,
        state: &mut CrawlState,
        store: &S,
        handler: &mut H,
    ) -> Result<CrawlReport, VodsweepError>
    where
        W: WorkSource + ?Sized,
        S: CheckpointStore,
        H: PageHandler + ?Sized,
    {
        let mut run = Run::new(&self.settings, source.total());

        run.report.units_skipped = source.resume(state.progress());
        tracing::info!(
            "Starting {} crawl for job {} ({} units{})",
            state.phase(),
            state.job(),
            run.total.map_or_else(|| "unknown".to_string(), |t| t.to_string()),
            state
                .progress()
                .resume_key()
                .map(|k| format!(", resuming after {}", k))
                .unwrap_or_default()
        );

        let mut in_flight: JoinSet<FetchResult<Value>> = JoinSet::new();
        let mut fetching: HashMap<Id, OpenStream> = HashMap::new();
        let mut limit = self.concurrency.clone();
        let mut limit_open = true;
        let mut source_exhausted = false;
        let mut announced_drain = false;

        let mut flush = tokio::time::interval(self.settings.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        flush.tick().await;

        loop {
            let draining = self.cancel.is_cancelled();
            if draining && !announced_drain {
                announced_drain = true;
                tracing::info!(
                    "Shutdown requested; waiting for {} in-flight requests",
                    in_flight.len()
                );
            }

            if !draining {
                let max = *limit.borrow();
                while in_flight.len() < max {
                    if let Some(stream) = run.ready.pop_front() {
                        let fetcher = self.fetcher.clone();
                        let request = stream.next.clone();
                        let task = in_flight.spawn(async move { fetcher.fetch(&request).await });
                        fetching.insert(task.id(), stream);
                        continue;
                    }
                    if source_exhausted {
                        break;
                    }
                    match source.next_unit() {
                        Some(unit) => run.open_unit(unit, state),
                        None => {
                            tracing::debug!("Work source exhausted");
                            source_exhausted = true;
                        }
                    }
                }
            }

            if in_flight.is_empty() {
                if draining {
                    run.report.cancelled = true;
                    break;
                }
                if source_exhausted && run.ready.is_empty() {
                    break;
                }
            }

            tokio::select! {
                Some(joined) = in_flight.join_next_with_id(), if !in_flight.is_empty() => {
                    match joined {
                        Ok((id, result)) => match fetching.remove(&id) {
                            Some(stream) => run.handle_result(stream, result, state, handler),
                            None => tracing::warn!("Fetch task {} finished without a stream", id),
                        },
                        Err(e) => match fetching.remove(&e.id()) {
                            Some(stream) => run.handle_task_failure(stream, e, state, handler),
                            None => tracing::error!("Fetch task failed: {}", e),
                        },
                    }
                    if run.pages_since_save >= u64::from(self.settings.checkpoint_every_pages) {
                        run.checkpoint(state, store)?;
                    }
                }
                _ = self.cancel.cancelled(), if !draining => {}
                _ = flush.tick() => {
                    if run.dirty {
                        tracing::debug!("Periodic checkpoint");
                        run.checkpoint(state, store)?;
                    }
                }
                changed = limit.changed(), if limit_open => {
                    match changed {
                        Ok(()) => tracing::info!("Concurrency limit set to {}", *limit.borrow()),
                        Err(_) => limit_open = false,
                    }
                }
            }
        }

        if run.dirty || run.report.cancelled {
            run.checkpoint(state, store)?;
        }
        run.report.elapsed = run.started.elapsed();

        let report = run.report;
        tracing::info!(
            "{} crawl {}: {} pages, {} items, {} units completed ({} skipped), {} streams failed in {:?}",
            state.phase(),
            if report.cancelled { "drained" } else { "completed" },
            report.pages,
            report.items,
            report.units_completed,
            report.units_skipped,
            report.streams_failed,
            report.elapsed
        );
        Ok(report)
    }
}

/// Bookkeeping of one `run` call, owned by the driving task
struct Run<'a> {
    settings: &'a EngineSettings,
    report: CrawlReport,
    units: HashMap<u64, ActiveUnit>,
    ready: VecDeque<OpenStream>,
    total: Option<u64>,
    started: Instant,
    pages_since_save: u64,
    dirty: bool,
}

impl<'a> Run<'a> {
    fn new(settings: &'a EngineSettings, total: Option<u64>) -> Self {
        Self {
            settings,
            report: CrawlReport::default(),
            units: HashMap::new(),
            ready: VecDeque::new(),
            total,
            started: Instant::now(),
            pages_since_save: 0,
            dirty: false,
        }
    }

    fn open_unit(&mut self, unit: WorkUnit, state: &mut CrawlState) {
        let WorkUnit {
            ordinal,
            key,
            streams,
            rejected,
        } = unit;

        if state.progress().is_done(ordinal) {
            tracing::trace!("Skipping completed unit {}", key);
            state.progress_mut().skip(ordinal, key);
            self.report.units_skipped += 1;
            self.dirty = true;
            return;
        }

        state.progress_mut().dispatch(ordinal, key.clone());
        self.dirty = true;

        for (stream_key, reason) in rejected {
            tracing::error!("Cannot build stream {}: {}", stream_key, reason);
            state.record_failure(stream_key);
            self.report.streams_failed += 1;
        }

        let mut active = ActiveUnit {
            key,
            remaining: 0,
            stream_keys: Vec::with_capacity(streams.len()),
        };

        for spec in streams {
            active.stream_keys.push(spec.key.clone());
            let mut merge = merge_for(&spec.merge);
            let next = match state.stream_position(&spec.key) {
                Some(StreamPosition::Open { next, seen }) => {
                    tracing::debug!(
                        "Resuming stream {} at {} ({} items already seen)",
                        spec.key,
                        next.url,
                        seen.values().map(Vec::len).sum::<usize>()
                    );
                    merge.seed(seen);
                    next.clone()
                }
                Some(StreamPosition::Finished) | Some(StreamPosition::Failed) => continue,
                None => {
                    state.set_stream_position(
                        spec.key.clone(),
                        StreamPosition::open(spec.first.clone()),
                    );
                    spec.first.clone()
                }
            };
            active.remaining += 1;
            self.ready.push_back(OpenStream {
                merge,
                unit: ordinal,
                next,
                spec,
            });
        }

        if active.remaining == 0 {
            self.complete_unit(ordinal, active, state);
        } else {
            self.units.insert(ordinal, active);
        }
    }

    fn handle_result<H>(
        &mut self,
        mut stream: OpenStream,
        result: FetchResult<Value>,
        state: &mut CrawlState,
        handler: &mut H,
    ) where
        H: PageHandler + ?Sized,
    {
        self.dirty = true;
        let body = match result {
            Ok(body) => body,
            Err(FetchError::Exhausted { attempts, .. }) => {
                tracing::error!(
                    "Stream {} failed after {} attempts; recorded as failed",
                    stream.spec.key,
                    attempts
                );
                state.record_failure(stream.spec.key.clone());
                self.report.streams_failed += 1;
                self.end_stream(stream, StreamEnd::Failed, state, handler);
                return;
            }
            Err(e) => {
                tracing::warn!("Stream {} ended: {}", stream.spec.key, e);
                self.end_stream(stream, StreamEnd::Finished, state, handler);
                return;
            }
        };

        let items = stream.merge.merge(&body);
        let hit_known = stream
            .spec
            .stop_on_known
            .as_deref()
            .is_some_and(|set| yields_known(&stream.spec, set, &items, state));

        for rule in &stream.spec.collect {
            for item in &items {
                for value in field_values(item, &rule.field) {
                    state.insert(&rule.set, value);
                }
            }
        }
        handler.on_page(state, &stream.spec.key, &items);

        self.report.pages += 1;
        self.report.items += items.len() as u64;
        self.pages_since_save += 1;
        if self.report.pages % u64::from(self.settings.progress_every_pages) == 0 {
            self.log_progress(state);
        }

        let stopped = hit_known
            || stream
                .spec
                .stopper
                .as_ref()
                .is_some_and(|stop| (**stop)(items.as_slice()));
        if stopped {
            tracing::debug!(
                "Stream {} stopped early after {} items",
                stream.spec.key,
                stream.merge.len()
            );
            self.report.streams_stopped += 1;
            self.end_stream(stream, StreamEnd::Finished, state, handler);
            return;
        }

        match stream.spec.cursor.next_request(&stream.next, &body) {
            Ok(Some(next)) => {
                state.set_stream_position(
                    stream.spec.key.clone(),
                    StreamPosition::Open {
                        next: next.clone(),
                        seen: stream.merge.seen_keys(),
                    },
                );
                stream.next = next;
                self.ready.push_back(stream);
            }
            Ok(None) => {
                tracing::debug!(
                    "Stream {} finished with {} items",
                    stream.spec.key,
                    stream.merge.len()
                );
                self.end_stream(stream, StreamEnd::Finished, state, handler);
            }
            Err(e) => {
                tracing::warn!("Stream {} ended: {}", stream.spec.key, e);
                self.end_stream(stream, StreamEnd::Finished, state, handler);
            }
        }
    }

    /// A fetch task panicked or was aborted; the stream is given up like an
    /// exhausted one
    fn handle_task_failure<H>(
        &mut self,
        stream: OpenStream,
        error: JoinError,
        state: &mut CrawlState,
        handler: &mut H,
    ) where
        H: PageHandler + ?Sized,
    {
        self.dirty = true;
        tracing::error!(
            "Fetch task for stream {} failed: {}; recorded as failed",
            stream.spec.key,
            error
        );
        state.record_failure(stream.spec.key.clone());
        self.report.streams_failed += 1;
        self.end_stream(stream, StreamEnd::Failed, state, handler);
    }

    fn end_stream<H>(
        &mut self,
        stream: OpenStream,
        end: StreamEnd,
        state: &mut CrawlState,
        handler: &mut H,
    ) where
        H: PageHandler + ?Sized,
    {
        handler.on_stream_end(state, &stream.spec.key, &*stream.merge);
        let position = match end {
            StreamEnd::Finished => StreamPosition::Finished,
            StreamEnd::Failed => StreamPosition::Failed,
        };
        state.set_stream_position(stream.spec.key, position);

        let done = match self.units.get_mut(&stream.unit) {
            Some(unit) => {
                unit.remaining = unit.remaining.saturating_sub(1);
                unit.remaining == 0
            }
            None => false,
        };
        if done {
            if let Some(unit) = self.units.remove(&stream.unit) {
                self.complete_unit(stream.unit, unit, state);
            }
        }
    }

    fn complete_unit(&mut self, ordinal: u64, unit: ActiveUnit, state: &mut CrawlState) {
        tracing::debug!("Unit {} complete", unit.key);
        state.progress_mut().complete(ordinal);
        state.clear_stream_positions(unit.stream_keys.iter().map(String::as_str));
        self.report.units_completed += 1;
    }

    fn checkpoint<S: CheckpointStore>(
        &mut self,
        state: &mut CrawlState,
        store: &S,
    ) -> Result<(), VodsweepError> {
        state.save(store)?;
        self.pages_since_save = 0;
        self.dirty = false;
        Ok(())
    }

    fn log_progress(&self, state: &CrawlState) {
        let done = self.report.units_completed + self.report.units_skipped;
        let percent = self
            .total
            .filter(|t| *t > 0)
            .map(|t| format!(" ({:.1}%)", done as f64 * 100.0 / t as f64))
            .unwrap_or_default();
        let rate = self.report.pages as f64 / self.started.elapsed().as_secs_f64().max(0.001);
        tracing::info!(
            "Progress: {}/{} units{}, {} pages, {} items, {} failed, {:.2} pages/sec (resume key: {})",
            done,
            self.total.map_or_else(|| "?".to_string(), |t| t.to_string()),
            percent,
            self.report.pages,
            self.report.items,
            self.report.streams_failed,
            rate,
            state.progress().resume_key().unwrap_or("none")
        );
    }
}

/// True if any of the page's values for `set` was already collected
fn yields_known(spec: &StreamSpec, set: &str, items: &[Value], state: &CrawlState) -> bool {
    let Some(known) = state.set(set) else {
        return false;
    };
    spec.collect
        .iter()
        .filter(|rule| rule.set == set)
        .any(|rule| {
            items
                .iter()
                .flat_map(|item| field_values(item, &rule.field))
                .any(|value| known.contains(&value))
        })
}
