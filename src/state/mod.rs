//! State module for tracking crawl progress
//!
//! This module holds everything a crawl job needs to resume after an
//! interruption.
//!
//! # Components
//!
//! - `CrawlPhase`: Which phase of a multi-phase job is running
//! - `UnitProgress`: Contiguous-from-start marker over work units
//! - `IdSet`: Append-only identifier set with dirty tracking
//! - `CrawlState`: The job's phase, progress, stream positions and sets, with
//!   explicit load and save against a checkpoint store

mod crawl_state;
mod id_set;
mod phase;
mod progress;

// Re-export main types
pub use crawl_state::{CrawlState, StreamPosition};
pub use id_set::IdSet;
pub use phase::CrawlPhase;
pub use progress::UnitProgress;
