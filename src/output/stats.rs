//! Statistics read back from a job's checkpoints
//!
//! This module loads the saved state of a job without crawling and prints a
//! summary of where it stands.

use crate::config::Config;
use crate::state::{CrawlPhase, CrawlState};
use crate::storage::CheckpointStore;
use crate::CheckpointResult;
use chrono::{DateTime, Utc};

/// Snapshot of a job's saved progress
#[derive(Debug, Clone)]
pub struct CrawlStatistics {
    pub job: String,

    /// Phase the job will run next
    pub phase: CrawlPhase,

    /// Key of the last unit of the completed prefix
    pub resume_key: Option<String>,

    /// Units completed past the resume point
    pub completed_ahead: usize,

    /// Streams of unfinished units with a saved next page
    pub open_streams: usize,

    /// Membership sets and their sizes, by name
    pub sets: Vec<(String, usize)>,

    /// Keys of streams that exhausted their retries
    pub failed: Vec<String>,

    pub config_hash: Option<String>,

    /// None if the job has never been checkpointed
    pub saved_at: Option<DateTime<Utc>>,
}

impl CrawlStatistics {
    /// Builds a snapshot from a loaded state
    pub fn from_state(state: &CrawlState) -> Self {
        Self {
            job: state.job().to_string(),
            phase: state.phase(),
            resume_key: state.progress().resume_key().map(str::to_string),
            completed_ahead: state.progress().completed_ahead(),
            open_streams: state.open_streams(),
            sets: state
                .sets()
                .map(|(name, set)| (name.to_string(), set.len()))
                .collect(),
            failed: state.failed().iter().map(str::to_string).collect(),
            config_hash: state.config_hash().map(str::to_string),
            saved_at: state.saved_at(),
        }
    }

    pub fn has_checkpoint(&self) -> bool {
        self.saved_at.is_some()
    }
}

/// Loads the saved state of the configured job
pub fn load_statistics<S: CheckpointStore>(
    store: &S,
    config: &Config,
) -> CheckpointResult<CrawlStatistics> {
    let initial = if config.streams.is_empty() && config.entities.is_none() && config.scan.is_some()
    {
        CrawlPhase::Scan
    } else {
        CrawlPhase::Discovery
    };
    let state = CrawlState::load(store, &config.output.job, initial, &config.set_names())?;
    Ok(CrawlStatistics::from_state(&state))
}

/// Prints statistics to stdout in a formatted manner
pub fn print_statistics(stats: &CrawlStatistics) {
    println!("=== Job Statistics: {} ===\n", stats.job);

    let Some(saved_at) = stats.saved_at else {
        println!("No checkpoint found; the job has not run yet.");
        return;
    };

    println!("Progress:");
    println!("  Phase: {}", stats.phase);
    println!("  Last saved: {}", saved_at);
    println!(
        "  Resume point: {}",
        stats.resume_key.as_deref().unwrap_or("start")
    );
    println!("  Units completed past resume point: {}", stats.completed_ahead);
    println!("  Open streams: {}", stats.open_streams);
    if let Some(hash) = &stats.config_hash {
        println!("  Config hash: {}", hash);
    }
    println!();

    if !stats.sets.is_empty() {
        println!("Sets:");
        for (name, count) in &stats.sets {
            println!("  {}: {}", name, count);
        }
        println!();
    }

    if stats.failed.is_empty() {
        println!("No failed streams");
    } else {
        println!("Failed Streams ({}):", stats.failed.len());
        for key in stats.failed.iter().take(50) {
            println!("  - {}", key);
        }
        if stats.failed.len() > 50 {
            println!("  ... and {} more", stats.failed.len() - 50);
        }
    }
}
