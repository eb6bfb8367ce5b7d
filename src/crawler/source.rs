//! Work sources
//!
//! A source hands the engine work units in increasing ordinal order. Each
//! unit owns one or more streams; the unit completes once every stream has
//! ended.
//!
//! | Source | Unit | Ordinal | Key |
//! |--------|------|---------|-----|
//! | `StreamListSource` | one configured stream | index | stream name |
//! | `EntitySource` | one entity ID, all templates | index in the ID list | entity ID |
//! | `IdRangeSource` | one page of IDs | last ID of the page | `start-end` |

use crate::config::{CollectRule, MergeConfig, ScanConfig, StreamConfig};
use crate::crawler::cursor::{cursor_for, PageCursor, SinglePageCursor};
use crate::crawler::merge::key_string;
use crate::crawler::PageRequest;
use crate::state::UnitProgress;
use crate::ConfigError;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Placeholder replaced by the entity ID in stream templates
pub const ID_PLACEHOLDER: &str = "{id}";

/// Caller-supplied early stop, evaluated on each page's new items
pub type Stopper = Arc<dyn Fn(&[Value]) -> bool + Send + Sync>;

/// One cursor's pagination sequence
#[derive(Clone)]
pub struct StreamSpec {
    /// Durable identity, used for saved positions and the failed set
    pub key: String,
    pub first: PageRequest,
    pub cursor: Arc<dyn PageCursor>,
    pub merge: MergeConfig,
    pub collect: Vec<CollectRule>,
    /// Stop once a page yields a value already in this set
    pub stop_on_known: Option<String>,
    pub stopper: Option<Stopper>,
}

impl StreamSpec {
    pub fn new(
        key: impl Into<String>,
        first: PageRequest,
        cursor: Arc<dyn PageCursor>,
        merge: MergeConfig,
    ) -> Self {
        Self {
            key: key.into(),
            first,
            cursor,
            merge,
            collect: Vec::new(),
            stop_on_known: None,
            stopper: None,
        }
    }

    pub fn with_collect(mut self, collect: Vec<CollectRule>) -> Self {
        self.collect = collect;
        self
    }

    pub fn with_stop_on_known(mut self, set: Option<String>) -> Self {
        self.stop_on_known = set;
        self
    }

    pub fn with_stopper<F>(mut self, stopper: F) -> Self
    where
        F: Fn(&[Value]) -> bool + Send + Sync + 'static,
    {
        self.stopper = Some(Arc::new(stopper));
        self
    }

    /// Builds a stream from its configuration, substituting `{id}` if given
    pub fn from_config(
        key: impl Into<String>,
        config: &StreamConfig,
        id: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let url_text = match id {
            Some(id) => config.url.replace(ID_PLACEHOLDER, id),
            None => config.url.clone(),
        };
        let url = Url::parse(&url_text)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", url_text, e)))?;

        let first = match &config.body {
            Some(body) => {
                let body = match id {
                    Some(id) => substitute(body, id),
                    None => body.clone(),
                };
                PageRequest::post(url, body)
            }
            None => PageRequest::get(url),
        };

        Ok(Self::new(key, first, cursor_for(config.pagination), config.merge.clone())
            .with_collect(config.collect.clone())
            .with_stop_on_known(config.stop_on_known.clone()))
    }
}

impl fmt::Debug for StreamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSpec")
            .field("key", &self.key)
            .field("first", &self.first)
            .field("merge", &self.merge)
            .field("collect", &self.collect)
            .field("stop_on_known", &self.stop_on_known)
            .field("stopper", &self.stopper.is_some())
            .finish()
    }
}

/// A schedulable piece of work
#[derive(Debug, Clone)]
pub struct WorkUnit {
    pub ordinal: u64,
    pub key: String,
    pub streams: Vec<StreamSpec>,
    /// Streams that could not be built, with the reason
    pub rejected: Vec<(String, String)>,
}

impl WorkUnit {
    pub fn new(ordinal: u64, key: impl Into<String>, streams: Vec<StreamSpec>) -> Self {
        Self {
            ordinal,
            key: key.into(),
            streams,
            rejected: Vec::new(),
        }
    }
}

/// Produces work units in strictly increasing ordinal order
pub trait WorkSource: Send {
    fn next_unit(&mut self) -> Option<WorkUnit>;

    /// Total number of units, when known up front
    fn total(&self) -> Option<u64> {
        None
    }

    /// Positions the source after the completed prefix of a previous run
    ///
    /// Returns how many units the source passed over without yielding them.
    fn resume(&mut self, _progress: &UnitProgress) -> u64 {
        0
    }
}

/// One unit per configured stream
#[derive(Debug)]
pub struct StreamListSource {
    streams: std::vec::IntoIter<StreamSpec>,
    total: u64,
    ordinal: u64,
}

impl StreamListSource {
    pub fn new(streams: Vec<StreamSpec>) -> Self {
        Self {
            total: streams.len() as u64,
            streams: streams.into_iter(),
            ordinal: 0,
        }
    }

    pub fn from_config(streams: &[StreamConfig]) -> Result<Self, ConfigError> {
        let specs = streams
            .iter()
            .map(|stream| StreamSpec::from_config(stream.name.clone(), stream, None))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(specs))
    }
}

impl WorkSource for StreamListSource {
    fn next_unit(&mut self) -> Option<WorkUnit> {
        let stream = self.streams.next()?;
        let unit = WorkUnit::new(self.ordinal, stream.key.clone(), vec![stream]);
        self.ordinal += 1;
        Some(unit)
    }

    fn total(&self) -> Option<u64> {
        Some(self.total)
    }
}

/// One unit per entity ID, expanding every stream template
#[derive(Debug)]
pub struct EntitySource {
    ids: Vec<String>,
    templates: Vec<StreamConfig>,
    position: usize,
}

impl EntitySource {
    pub fn new(ids: Vec<String>, templates: Vec<StreamConfig>) -> Self {
        Self {
            ids,
            templates,
            position: 0,
        }
    }
}

impl WorkSource for EntitySource {
    fn next_unit(&mut self) -> Option<WorkUnit> {
        let id = self.ids.get(self.position)?;
        let ordinal = self.position as u64;
        self.position += 1;

        let mut unit = WorkUnit::new(ordinal, id.clone(), Vec::new());
        for template in &self.templates {
            let key = format!("{}:{}", id, template.name);
            match StreamSpec::from_config(key.clone(), template, Some(id)) {
                Ok(stream) => unit.streams.push(stream),
                Err(e) => unit.rejected.push((key, e.to_string())),
            }
        }
        Some(unit)
    }

    fn total(&self) -> Option<u64> {
        Some(self.ids.len() as u64)
    }
}

/// An inclusive range of numeric IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IdRange {
    pub start: u64,
    pub end: u64,
}

impl IdRange {
    /// Number of pages of `page_size` IDs covering the range
    pub fn pages(&self, page_size: u64) -> u64 {
        (self.end - self.start) / page_size + 1
    }
}

impl fmt::Display for IdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Parses `start-end` ranges (or single IDs), sorted by start
///
/// Overlapping ranges are rejected.
pub fn parse_id_ranges(ranges: &[String]) -> Result<Vec<IdRange>, ConfigError> {
    let mut parsed = Vec::with_capacity(ranges.len());
    for text in ranges {
        let invalid = || ConfigError::Validation(format!("Invalid ID range '{}'", text));
        let (start, end) = match text.trim().split_once('-') {
            Some((start, end)) => (start.trim(), end.trim()),
            None => (text.trim(), text.trim()),
        };
        let start: u64 = start.parse().map_err(|_| invalid())?;
        let end: u64 = end.parse().map_err(|_| invalid())?;
        if start > end {
            return Err(invalid());
        }
        parsed.push(IdRange { start, end });
    }

    parsed.sort();
    for pair in parsed.windows(2) {
        if pair[1].start <= pair[0].end {
            return Err(ConfigError::Validation(format!(
                "ID ranges {} and {} overlap",
                pair[0], pair[1]
            )));
        }
    }
    Ok(parsed)
}

/// Fixed-size pages over numeric ID ranges, each a single-page unit
#[derive(Debug)]
pub struct IdRangeSource {
    ranges: Vec<IdRange>,
    page_size: u64,
    url: Url,
    id_param: String,
    merge: MergeConfig,
    collect: Vec<CollectRule>,
    range: usize,
    next_id: u64,
}

impl IdRangeSource {
    pub fn new(
        ranges: Vec<IdRange>,
        page_size: u64,
        url: Url,
        id_param: impl Into<String>,
        merge: MergeConfig,
    ) -> Self {
        let next_id = ranges.first().map_or(0, |r| r.start);
        Self {
            ranges,
            page_size: page_size.max(1),
            url,
            id_param: id_param.into(),
            merge,
            collect: Vec::new(),
            range: 0,
            next_id,
        }
    }

    pub fn from_config(config: &ScanConfig) -> Result<Self, ConfigError> {
        let ranges = parse_id_ranges(&config.ranges)?;
        let url = Url::parse(&config.url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", config.url, e)))?;
        let mut source = Self::new(
            ranges,
            config.page_size,
            url,
            config.id_param.clone(),
            config.merge.clone(),
        );
        source.collect = config.collect.clone();
        Ok(source)
    }

    fn request_for(&self, start: u64, end: u64) -> PageRequest {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            for id in start..=end {
                query.append_pair(&self.id_param, &id.to_string());
            }
        }
        PageRequest::get(url)
    }
}

impl WorkSource for IdRangeSource {
    fn next_unit(&mut self) -> Option<WorkUnit> {
        loop {
            let range = *self.ranges.get(self.range)?;
            if self.next_id < range.start {
                self.next_id = range.start;
            }
            if self.next_id > range.end {
                self.range += 1;
                continue;
            }

            let start = self.next_id;
            let end = start.saturating_add(self.page_size - 1).min(range.end);
            match end.checked_add(1) {
                Some(next) => self.next_id = next,
                None => self.range += 1,
            }

            let key = format!("{}-{}", start, end);
            let stream = StreamSpec::new(
                key.clone(),
                self.request_for(start, end),
                Arc::new(SinglePageCursor),
                self.merge.clone(),
            )
            .with_collect(self.collect.clone());
            return Some(WorkUnit::new(end, key, vec![stream]));
        }
    }

    fn total(&self) -> Option<u64> {
        Some(self.ranges.iter().map(|r| r.pages(self.page_size)).sum())
    }

    fn resume(&mut self, progress: &UnitProgress) -> u64 {
        let Some(marker) = progress.marker() else {
            return 0;
        };
        self.next_id = marker.saturating_add(1);

        let page_size = self.page_size;
        let skipped = self
            .ranges
            .iter()
            .map(|range| {
                if marker >= range.end {
                    range.pages(page_size)
                } else if marker < range.start {
                    0
                } else {
                    (marker - range.start + 1) / page_size
                }
            })
            .sum();
        tracing::info!(
            "Resuming scan after ID {} (last page {}, {} pages already done)",
            marker,
            progress.resume_key().unwrap_or("?"),
            skipped
        );
        skipped
    }
}

/// Values at a dotted path inside an item
///
/// Arrays fan out: `players.id` yields the `id` of every element of
/// `players`, and an array at the end of the path yields each element.
pub fn field_values(item: &Value, path: &str) -> Vec<String> {
    let mut current = vec![item];
    for part in path.split('.') {
        current = current
            .into_iter()
            .flat_map(|value| match value {
                Value::Array(values) => values.iter().filter_map(|v| v.get(part)).collect(),
                other => other.get(part).into_iter().collect::<Vec<_>>(),
            })
            .collect();
    }

    current
        .into_iter()
        .flat_map(|value| match value {
            Value::Array(values) => values.iter().filter_map(key_string).collect(),
            other => key_string(other).into_iter().collect::<Vec<_>>(),
        })
        .collect()
}

/// Replaces `{id}` in every string of a JSON value
fn substitute(value: &Value, id: &str) -> Value {
    match value {
        Value::String(s) => Value::String(s.replace(ID_PLACEHOLDER, id)),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, id)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, id)))
                .collect(),
        ),
        other => other.clone(),
    }
}
