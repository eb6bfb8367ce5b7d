use serde::Deserialize;
use std::collections::BTreeMap;

/// Main configuration structure for Vodsweep
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub crawler: CrawlerConfig,
    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub output: OutputConfig,
    #[serde(default, rename = "endpoint")]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default, rename = "stream")]
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub entities: Option<EntitiesConfig>,
    #[serde(default)]
    pub scan: Option<ScanConfig>,
}

impl Config {
    /// Names of every membership set the configuration reads or writes
    pub fn set_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .streams
            .iter()
            .chain(self.entities.iter().flat_map(|e| e.streams.iter()))
            .flat_map(|s| s.collect.iter().map(|rule| rule.set.clone()))
            .chain(self.scan.iter().flat_map(|s| s.collect.iter().map(|rule| rule.set.clone())))
            .chain(self.entities.iter().filter_map(|e| e.source_set.clone()))
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Crawl engine behavior configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CrawlerConfig {
    /// Maximum number of streams with a request in flight
    pub concurrency: u32,

    /// Save a checkpoint after this many completed pages
    #[serde(default = "default_checkpoint_every_pages")]
    pub checkpoint_every_pages: u32,

    /// Save a checkpoint at least this often while pages are arriving (seconds)
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Log a progress line after this many completed pages
    #[serde(default = "default_progress_every_pages")]
    pub progress_every_pages: u32,

    /// Per-request timeout handed to the HTTP client (seconds)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Minimum spacing for requests matching no `[[endpoint]]` (milliseconds)
    #[serde(default = "default_interval_ms")]
    pub default_interval_ms: u64,
}

fn default_checkpoint_every_pages() -> u32 {
    1
}

fn default_flush_interval_secs() -> u64 {
    10
}

fn default_progress_every_pages() -> u32 {
    50
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_interval_ms() -> u64 {
    590
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserAgentConfig {
    /// Name of the crawler
    pub crawler_name: String,

    /// Version of the crawler
    pub crawler_version: String,

    /// URL with information about the crawler
    pub contact_url: String,

    /// Email address for crawler-related contact
    pub contact_email: String,
}

/// Retry and backoff policy for failed requests
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    /// Retries after the initial attempt before giving up
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Sleep after a transient failure (milliseconds)
    #[serde(default = "default_transient_delay_ms")]
    pub transient_delay_ms: u64,

    /// Sleep after a rate-limit response without a reset hint (milliseconds)
    #[serde(default = "default_rate_limited_delay_ms")]
    pub rate_limited_delay_ms: u64,

    /// Lower bound for sleeps derived from a rate-limit reset header (milliseconds)
    #[serde(default = "default_reset_floor_ms")]
    pub reset_floor_ms: u64,
}

fn default_max_retries() -> u32 {
    15
}

fn default_transient_delay_ms() -> u64 {
    10_000
}

fn default_rate_limited_delay_ms() -> u64 {
    90_000
}

fn default_reset_floor_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            transient_delay_ms: default_transient_delay_ms(),
            rate_limited_delay_ms: default_rate_limited_delay_ms(),
            reset_floor_ms: default_reset_floor_ms(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OutputConfig {
    /// Directory holding the gzip checkpoint files
    pub checkpoint_dir: String,

    /// Job name, used as the prefix of every checkpoint file
    pub job: String,
}

/// An endpoint class sharing one rate budget
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointConfig {
    /// Class name used in logs
    pub name: String,

    /// Request URLs starting with this prefix belong to the class
    pub prefix: String,

    /// Minimum time between two requests of this class (milliseconds)
    pub interval_ms: u64,

    /// Static headers sent with every request of this class
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// How a stream finds its next page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaginationStyle {
    /// `pagination.links[rel=next].uri`
    Link,
    /// `pagination.page` / `pagination.pages` with the page inside `_r`
    PageNumber,
    /// `pagination.cursor` copied into `after`
    Token,
    /// No pagination metadata
    Single,
}

/// How page items are accumulated
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MergeConfig {
    /// Append every element of one array field
    Flat { field: String },
    /// De-duplicate the named array fields by item key
    ById {
        fields: Vec<String>,
        #[serde(default = "default_id_key")]
        key: String,
    },
}

fn default_id_key() -> String {
    "id".to_string()
}

/// Copies one item field into a named membership set
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CollectRule {
    /// Target set name
    pub set: String,

    /// Dotted path into the item (e.g. `owner.id`)
    pub field: String,
}

/// A paginated stream; in `[entities]` the url and body may contain `{id}`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StreamConfig {
    /// Stream name, unique within its section
    pub name: String,

    /// First page URL
    pub url: String,

    /// JSON body; when present the request is sent as POST
    #[serde(default)]
    pub body: Option<serde_json::Value>,

    pub pagination: PaginationStyle,

    pub merge: MergeConfig,

    #[serde(default)]
    pub collect: Vec<CollectRule>,

    /// Stop paginating once a page yields a value already in this set
    #[serde(default)]
    pub stop_on_known: Option<String>,
}

/// Per-entity crawl configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EntitiesConfig {
    /// Membership set (filled by discovery) listing the entity IDs
    #[serde(default)]
    pub source_set: Option<String>,

    /// Plain file listing the entity IDs, used when no set is named
    #[serde(default)]
    pub source_file: Option<String>,

    /// Stream templates expanded once per entity
    #[serde(rename = "stream")]
    pub streams: Vec<StreamConfig>,
}

/// Numeric ID-space scan configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScanConfig {
    /// Inclusive ID ranges, e.g. `"1000-50000"`
    pub ranges: Vec<String>,

    /// Number of IDs requested per page
    pub page_size: u64,

    /// Base URL for every page request
    pub url: String,

    /// Query parameter repeated once per ID
    pub id_param: String,

    pub merge: MergeConfig,

    #[serde(default)]
    pub collect: Vec<CollectRule>,
}
