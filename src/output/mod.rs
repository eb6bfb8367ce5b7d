//! Output module for reporting on crawl jobs
//!
//! This module handles:
//! - Reading a job's checkpoints back as statistics
//! - Printing those statistics for the `--stats` mode

pub mod stats;

pub use stats::{load_statistics, print_statistics, CrawlStatistics};
