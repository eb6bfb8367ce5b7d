//! Vodsweep: a resumable, rate-limited paginated crawl engine
//!
//! This crate drives paginated JSON APIs to exhaustion while respecting
//! per-endpoint rate limits, retrying transient failures, and checkpointing
//! progress to gzip-compressed files so an interrupted crawl resumes where
//! it left off.

pub mod config;
pub mod crawler;
pub mod output;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for Vodsweep operations
#[derive(Debug, Error)]
pub enum VodsweepError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid phase transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: state::CrawlPhase,
        to: state::CrawlPhase,
    },

    #[error("Job error: {0}")]
    Job(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Outcome of a fetch that could not produce a usable page
///
/// Rate-limited and transient failures never surface here: the fetcher
/// retries them internally and only reports `Exhausted` once the retry cap
/// is hit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The stream cannot continue (404, invalid pagination)
    #[error("Terminal response from {url}: HTTP {status}")]
    Terminal { url: String, status: u16 },

    /// Retry cap exceeded
    #[error("Gave up on {url} after {attempts} attempts: {last_error}")]
    Exhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },

    /// Response parsed but lacks the structure needed to continue
    #[error("Malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
}

/// Checkpoint store errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint IO error for {name}: {source}")]
    Io {
        name: String,
        source: std::io::Error,
    },

    #[error("Checkpoint {name} is not valid JSON: {source}")]
    Json {
        name: String,
        source: serde_json::Error,
    },

    #[error("Checkpoint {name} is corrupt: {message}")]
    Corrupt { name: String, message: String },
}

/// Result type alias for Vodsweep operations
pub type Result<T> = std::result::Result<T, VodsweepError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for fetch operations
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Result type alias for checkpoint operations
pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{CrawlEngine, CrawlReport, PageRequest};
pub use state::{CrawlPhase, CrawlState};
pub use storage::{CheckpointStore, GzipFileStore};
