//! Configuration module for Vodsweep
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use vodsweep::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("crawl.toml")).unwrap();
//! println!("Crawler will keep {} streams in flight", config.crawler.concurrency);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    CollectRule, Config, CrawlerConfig, EndpointConfig, EntitiesConfig, MergeConfig,
    OutputConfig, PaginationStyle, RetryConfig, ScanConfig, StreamConfig, UserAgentConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
