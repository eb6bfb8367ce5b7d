//! Crawler module for paginated API crawling
//!
//! This module contains the core crawling logic, including:
//! - Per-endpoint-class rate limiting
//! - HTTP fetching with retry logic
//! - Pagination cursors and item merging
//! - Work sources fanning out over streams, entities and ID ranges
//! - The engine driving a bounded pool of open streams
//! - The phase driver running a configured job
//! - Runtime controls (stdin commands, signals)

pub mod controls;
pub mod cursor;
mod engine;
pub mod fetcher;
mod job;
pub mod limiter;
pub mod merge;
mod request;
pub mod source;

pub use controls::Controls;
pub use cursor::PageCursor;
pub use engine::{CrawlEngine, CrawlReport, EngineSettings, PageHandler};
pub use fetcher::{build_http_client, RetryingFetcher};
pub use job::{run_job, JobMode, JobOptions, JobSummary};
pub use limiter::{EndpointTable, RateLimiter};
pub use merge::{MergeStrategy, SeenKeys};
pub use request::PageRequest;
pub use source::{
    parse_id_ranges, EntitySource, IdRange, IdRangeSource, StreamListSource, StreamSpec,
    WorkSource, WorkUnit,
};
