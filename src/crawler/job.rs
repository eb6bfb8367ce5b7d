//! Phase driver for a configured crawl job
//!
//! A job runs its phases in order against one `CrawlState`:
//!
//! - pipeline mode: `Discovery` (site-wide `[[stream]]`s), then `Entities`
//!   (the `[entities]` templates once per discovered ID), then `Done`
//! - scan mode: `Scan` (the `[scan]` ID ranges), then `Done`
//!
//! A drained phase leaves the state in that phase so the next start
//! resumes it.

use crate::config::Config;
use crate::crawler::controls::Controls;
use crate::crawler::engine::{CrawlEngine, CrawlReport, EngineSettings};
use crate::crawler::fetcher::RetryingFetcher;
use crate::crawler::source::{EntitySource, IdRangeSource, StreamListSource, WorkSource};
use crate::state::{CrawlPhase, CrawlState};
use crate::storage::{open_store, CheckpointStore, GzipFileStore};
use crate::{ConfigError, VodsweepError};
use std::path::Path;

/// Which phase sequence a job runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    Pipeline,
    Scan,
}

impl JobMode {
    pub fn initial_phase(&self) -> CrawlPhase {
        match self {
            Self::Pipeline => CrawlPhase::Discovery,
            Self::Scan => CrawlPhase::Scan,
        }
    }

    fn runs(&self, phase: CrawlPhase) -> bool {
        match self {
            Self::Pipeline => matches!(
                phase,
                CrawlPhase::Discovery | CrawlPhase::Entities | CrawlPhase::Done
            ),
            Self::Scan => matches!(phase, CrawlPhase::Scan | CrawlPhase::Done),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub mode: JobMode,
    /// Ignore any saved state and start from the first phase
    pub fresh: bool,
}

/// Reports of every phase run by one `run_job` call
#[derive(Debug, Clone, Default)]
pub struct JobSummary {
    pub phases: Vec<(CrawlPhase, CrawlReport)>,
    pub cancelled: bool,
}

impl JobSummary {
    pub fn pages(&self) -> u64 {
        self.phases.iter().map(|(_, r)| r.pages).sum()
    }

    pub fn streams_failed(&self) -> u64 {
        self.phases.iter().map(|(_, r)| r.streams_failed).sum()
    }
}

/// Loads (or starts) the configured job and runs it to `Done` or a drain
pub async fn run_job(
    config: &Config,
    config_hash: &str,
    options: JobOptions,
    controls: &Controls,
) -> Result<JobSummary, VodsweepError> {
    let store = open_store(Path::new(&config.output.checkpoint_dir))?;
    let job = config.output.job.as_str();
    let initial = options.mode.initial_phase();

    let mut state = if options.fresh {
        tracing::info!("Starting job {} fresh, discarding saved state", job);
        CrawlState::fresh(&store, job, initial, &config.set_names())?
    } else {
        CrawlState::load(&store, job, initial, &config.set_names())?
    };

    if !options.mode.runs(state.phase()) {
        return Err(VodsweepError::Job(format!(
            "job '{}' is in phase {}, which this mode does not run; pass --scan to match it or --fresh to restart",
            job,
            state.phase()
        )));
    }

    if !state.record_config_hash(config_hash) {
        tracing::warn!("Configuration changed since job {} was last saved", job);
    }

    let fetcher = RetryingFetcher::from_config(config)?;
    let engine = CrawlEngine::new(fetcher, EngineSettings::from(&config.crawler), controls);
    let mut summary = JobSummary::default();

    while !state.phase().is_terminal() {
        let phase = state.phase();
        let report = match build_source(config, &state)? {
            Some(mut source) => engine.run(source.as_mut(), &mut state, &store).await?,
            None => {
                tracing::info!("Nothing configured for phase {}", phase);
                CrawlReport::default()
            }
        };

        let cancelled = report.cancelled;
        summary.phases.push((phase, report));
        if cancelled {
            summary.cancelled = true;
            tracing::info!("Job {} drained in phase {}", job, phase);
            return Ok(summary);
        }

        if let Some(next) = phase.successor() {
            state.advance_phase(next)?;
            state.save(&store)?;
        }
    }

    tracing::info!(
        "Job {} is done: {} pages this run, {} failed streams on record",
        job,
        summary.pages(),
        state.failed().len()
    );
    Ok(summary)
}

/// Builds the work source for the state's current phase
fn build_source(
    config: &Config,
    state: &CrawlState,
) -> Result<Option<Box<dyn WorkSource>>, VodsweepError> {
    let source: Box<dyn WorkSource> = match state.phase() {
        CrawlPhase::Discovery => {
            if config.streams.is_empty() {
                return Ok(None);
            }
            Box::new(StreamListSource::from_config(&config.streams)?)
        }
        CrawlPhase::Entities => {
            let Some(entities) = &config.entities else {
                return Ok(None);
            };
            let ids: Vec<String> = match (&entities.source_set, &entities.source_file) {
                (Some(set), _) => state
                    .set(set)
                    .map(|ids| ids.iter().map(str::to_string).collect())
                    .unwrap_or_default(),
                (None, Some(file)) => read_id_file(Path::new(file))?,
                (None, None) => Vec::new(),
            };
            tracing::info!("Crawling {} entities", ids.len());
            Box::new(EntitySource::new(ids, entities.streams.clone()))
        }
        CrawlPhase::Scan => {
            let Some(scan) = &config.scan else {
                return Err(ConfigError::Validation(
                    "scan mode needs a [scan] section".to_string(),
                )
                .into());
            };
            Box::new(IdRangeSource::from_config(scan)?)
        }
        CrawlPhase::Done => return Ok(None),
    };
    Ok(Some(source))
}

/// Reads entity IDs from a plain or gzip checkpoint-style file
fn read_id_file(path: &Path) -> Result<Vec<String>, VodsweepError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return Err(ConfigError::Validation(format!(
            "Invalid entity source file {}",
            path.display()
        ))
        .into());
    };

    let store = GzipFileStore::new(dir)?;
    match store.load_id_list(name)? {
        Some(ids) => Ok(ids),
        None => Err(ConfigError::Validation(format!(
            "Entity source file {} does not exist",
            path.display()
        ))
        .into()),
    }
}
