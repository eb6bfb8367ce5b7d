//! Storage module for persisting crawl checkpoints
//!
//! This module handles all durable state for the crawler:
//! - The `CheckpointStore` trait (named blobs, line sets, JSON documents)
//! - The gzip file implementation with legacy uncompressed fallback
//! - The tagged-map serde adapter used by structured checkpoints

mod gzip;
pub mod tagged_map;
mod traits;

pub use gzip::GzipFileStore;
pub use traits::CheckpointStore;

use crate::CheckpointError;
use std::path::Path;

/// Opens the checkpoint store for a configured directory
pub fn open_store(dir: &Path) -> Result<GzipFileStore, CheckpointError> {
    GzipFileStore::new(dir)
}
