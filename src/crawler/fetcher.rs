//! HTTP fetcher with retry and rate limiting
//!
//! This module handles all HTTP requests for the crawler, including:
//! - Building HTTP clients with proper user agent strings
//! - Waiting on the endpoint class's rate budget before each attempt
//! - Retry logic for rate-limited and transient failures
//! - Error classification into terminal and exhausted outcomes

use crate::config::{Config, RetryConfig, UserAgentConfig};
use crate::crawler::limiter::{EndpointTable, RateLimiter};
use crate::crawler::PageRequest;
use crate::{FetchError, FetchResult};
use regex::Regex;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Response header carrying the epoch second a rate-limit window resets
const RATELIMIT_RESET: &str = "ratelimit-reset";

fn rate_limit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)rate ?limit|too many requests").expect("rate limit pattern is valid")
    })
}

/// Why an attempt should be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryClass {
    /// The server asked us to slow down
    RateLimited,
    /// Anything else that may succeed later
    Transient,
}

/// Result of a single attempt
#[derive(Debug)]
enum Attempt {
    Page(Value),
    Terminal(u16),
    Retry {
        class: RetryClass,
        delay: Duration,
        message: String,
    },
}

/// Builds an HTTP client with proper configuration
///
/// The user agent has the form `CrawlerName/Version (+ContactURL; ContactEmail)`.
pub fn build_http_client(
    config: &UserAgentConfig,
    timeout: Duration,
) -> Result<Client, reqwest::Error> {
    let user_agent = format!(
        "{}/{} (+{}; {})",
        config.crawler_name, config.crawler_version, config.contact_url, config.contact_email
    );

    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Fetches pages, retrying until success, a terminal response, or the cap
///
/// Cloning is cheap; every clone shares the client and the rate limiter.
///
/// # Retry Logic
///
/// | Condition | Action |
/// |-----------|--------|
/// | HTTP 404 | Immediate → Terminal |
/// | Body contains "Invalid pagination" | Immediate → Terminal |
/// | HTTP 429 with `Ratelimit-Reset` | Sleep until reset (floor applies), retry |
/// | Body mentions rate limiting | Sleep the long delay, retry |
/// | Other non-success status | Sleep the short delay, retry |
/// | Transport error / undecodable body | Sleep the short delay, retry |
/// | More than `max-retries` retries | Exhausted |
#[derive(Debug, Clone)]
pub struct RetryingFetcher {
    client: Client,
    limiter: Arc<RateLimiter>,
    endpoints: Arc<EndpointTable>,
    retry: RetryConfig,
}

impl RetryingFetcher {
    pub fn new(
        client: Client,
        limiter: Arc<RateLimiter>,
        endpoints: Arc<EndpointTable>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            limiter,
            endpoints,
            retry,
        }
    }

    /// Builds a fetcher with its own client and limiter from the configuration
    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        let client = build_http_client(
            &config.user_agent,
            Duration::from_secs(config.crawler.request_timeout_secs),
        )?;
        let endpoints = Arc::new(EndpointTable::from_config(config));
        let limiter = Arc::new(RateLimiter::from_table(&endpoints));
        Ok(Self::new(client, limiter, endpoints, config.retry.clone()))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Fetches one page and parses it as JSON
    pub async fn fetch(&self, request: &PageRequest) -> FetchResult<Value> {
        let class = self.endpoints.classify(&request.url);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            self.limiter.acquire(class).await;

            let (retry_class, delay, message) = match self.attempt(request).await {
                Attempt::Page(body) => {
                    if is_suspicious(&body) {
                        tracing::warn!(
                            "{} {} returned an empty body: {}",
                            request.method(),
                            request.url,
                            body
                        );
                    }
                    return Ok(body);
                }
                Attempt::Terminal(status) => {
                    tracing::debug!(
                        "{} {} is terminal (HTTP {})",
                        request.method(),
                        request.url,
                        status
                    );
                    return Err(FetchError::Terminal {
                        url: request.url.to_string(),
                        status,
                    });
                }
                Attempt::Retry {
                    class: retry_class,
                    delay,
                    message,
                } => (retry_class, delay, message),
            };

            if attempts > self.retry.max_retries {
                tracing::error!(
                    "Giving up on {} {} after {} attempts: {}",
                    request.method(),
                    request.url,
                    attempts,
                    message
                );
                return Err(FetchError::Exhausted {
                    url: request.url.to_string(),
                    attempts,
                    last_error: message,
                });
            }

            tracing::warn!(
                "{} {} failed (attempt {}, {:?}): {}; retrying in {:?}",
                request.method(),
                request.url,
                attempts,
                retry_class,
                message,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, request: &PageRequest) -> Attempt {
        let response = match self.build(request).send().await {
            Ok(response) => response,
            Err(e) => {
                let message = if e.is_timeout() {
                    "Request timeout".to_string()
                } else if e.is_connect() {
                    format!("Connection failed: {}", e)
                } else {
                    e.to_string()
                };
                return self.transient(message);
            }
        };

        let status = response.status();
        if !status.is_success() {
            return self.classify_failure(response).await;
        }

        match response.bytes().await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(body) => Attempt::Page(body),
                Err(e) => self.transient(format!("Undecodable body: {}", e)),
            },
            Err(e) => self.transient(format!("Failed to read body: {}", e)),
        }
    }

    fn build(&self, request: &PageRequest) -> RequestBuilder {
        let mut builder = match &request.body {
            Some(body) => self.client.post(request.url.clone()).json(body),
            None => self.client.get(request.url.clone()),
        };
        if let Some(headers) = self.endpoints.headers(&request.url) {
            for (name, value) in headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        builder
    }

    async fn classify_failure(&self, response: Response) -> Attempt {
        let status = response.status();
        let reset = reset_header(&response);
        let text = response.text().await.unwrap_or_default();

        if status == StatusCode::NOT_FOUND || text.contains("Invalid pagination") {
            return Attempt::Terminal(status.as_u16());
        }

        let message = format!("HTTP {}: {}", status.as_u16(), truncate(&text, 200));
        let floor = Duration::from_millis(self.retry.reset_floor_ms);

        match reset {
            Some(reset) if status == StatusCode::TOO_MANY_REQUESTS => Attempt::Retry {
                class: RetryClass::RateLimited,
                delay: delay_until_reset(reset, chrono::Utc::now().timestamp_millis()).max(floor),
                message,
            },
            _ if rate_limit_pattern().is_match(&text) => Attempt::Retry {
                class: RetryClass::RateLimited,
                delay: Duration::from_millis(self.retry.rate_limited_delay_ms),
                message,
            },
            _ => self.transient(message),
        }
    }

    fn transient(&self, message: String) -> Attempt {
        Attempt::Retry {
            class: RetryClass::Transient,
            delay: Duration::from_millis(self.retry.transient_delay_ms),
            message,
        }
    }
}

fn reset_header(response: &Response) -> Option<i64> {
    response
        .headers()
        .get(RATELIMIT_RESET)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Time from `now_ms` until the epoch second `reset`, zero if already past
fn delay_until_reset(reset: i64, now_ms: i64) -> Duration {
    let wait = reset.saturating_mul(1000).saturating_sub(now_ms);
    Duration::from_millis(u64::try_from(wait).unwrap_or(0))
}

/// `null`, `{}` and `[]` bodies usually mean the API silently failed
fn is_suspicious(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
