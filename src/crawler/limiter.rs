//! Per-endpoint-class request spacing
//!
//! Every endpoint class has one shared "earliest next request" instant.
//! Each acquisition reserves a slot with `next = max(now, next) + interval`
//! and sleeps until the start of that slot, so N concurrent callers are
//! serialized to one request per interval with no burst allowance.

use crate::config::Config;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use url::Url;

/// Class used for URLs matching no configured prefix
pub const DEFAULT_CLASS: &str = "default";

/// A group of URLs sharing one rate budget
#[derive(Debug, Clone)]
pub struct EndpointClass {
    pub name: String,
    pub prefix: String,
    pub interval: Duration,
    pub headers: BTreeMap<String, String>,
}

/// Maps request URLs to endpoint classes by longest matching prefix
#[derive(Debug, Clone)]
pub struct EndpointTable {
    /// Sorted longest prefix first
    classes: Vec<EndpointClass>,
    default_interval: Duration,
}

impl EndpointTable {
    pub fn new(mut classes: Vec<EndpointClass>, default_interval: Duration) -> Self {
        classes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self {
            classes,
            default_interval,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let classes = config
            .endpoints
            .iter()
            .map(|endpoint| EndpointClass {
                name: endpoint.name.clone(),
                prefix: endpoint.prefix.clone(),
                interval: Duration::from_millis(endpoint.interval_ms),
                headers: endpoint.headers.clone(),
            })
            .collect();
        Self::new(
            classes,
            Duration::from_millis(config.crawler.default_interval_ms),
        )
    }

    /// Returns the class name for `url`
    pub fn classify(&self, url: &Url) -> &str {
        self.find(url)
            .map(|class| class.name.as_str())
            .unwrap_or(DEFAULT_CLASS)
    }

    /// Static headers to send with a request to `url`
    pub fn headers(&self, url: &Url) -> Option<&BTreeMap<String, String>> {
        self.find(url).map(|class| &class.headers)
    }

    /// Intervals of every class, including the default class
    pub fn intervals(&self) -> impl Iterator<Item = (&str, Duration)> {
        self.classes
            .iter()
            .map(|class| (class.name.as_str(), class.interval))
            .chain(std::iter::once((DEFAULT_CLASS, self.default_interval)))
    }

    fn find(&self, url: &Url) -> Option<&EndpointClass> {
        let url = url.as_str();
        self.classes
            .iter()
            .find(|class| url.starts_with(&class.prefix))
    }
}

#[derive(Debug)]
struct Budget {
    interval: Duration,
    next: Mutex<Option<Instant>>,
}

/// Shared rate limiter over a fixed set of endpoint classes
#[derive(Debug)]
pub struct RateLimiter {
    budgets: HashMap<String, Budget>,
}

impl RateLimiter {
    pub fn new<'a, I>(intervals: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, Duration)>,
    {
        let budgets = intervals
            .into_iter()
            .map(|(name, interval)| {
                (
                    name.to_string(),
                    Budget {
                        interval,
                        next: Mutex::new(None),
                    },
                )
            })
            .collect();
        Self { budgets }
    }

    pub fn from_table(table: &EndpointTable) -> Self {
        Self::new(table.intervals())
    }

    /// Suspends until a request of `class` may be sent
    ///
    /// Unknown classes and zero intervals are not limited.
    pub async fn acquire(&self, class: &str) {
        let Some(budget) = self.budgets.get(class) else {
            return;
        };
        if budget.interval.is_zero() {
            return;
        }

        let slot = {
            let mut next = budget.next.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let slot = next.map_or(now, |n| n.max(now));
            *next = Some(slot + budget.interval);
            slot
        };

        if slot > Instant::now() {
            tracing::trace!("Waiting {:?} for {} budget", slot - Instant::now(), class);
            sleep_until(slot).await;
        }
    }

    pub fn interval(&self, class: &str) -> Option<Duration> {
        self.budgets.get(class).map(|budget| budget.interval)
    }
}
