//! Checkpoint store trait
//!
//! The trait exposes raw byte blobs; the provided methods layer the two
//! checkpoint encodings on top (newline-delimited identifier sets and JSON
//! documents).

use crate::{CheckpointError, CheckpointResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Durable key/value store of named checkpoints
///
/// Implementations rewrite a checkpoint as a whole on every save. Readers
/// see either the previous or the new content, never a mix, only as far as
/// the implementation's write is atomic.
pub trait CheckpointStore: Send + Sync {
    /// Persists `data` under `name`, replacing any previous content
    fn save(&self, name: &str, data: &[u8]) -> CheckpointResult<()>;

    /// Loads the checkpoint named `name`
    ///
    /// Returns `Ok(None)` when the checkpoint has never been written.
    fn load(&self, name: &str) -> CheckpointResult<Option<Vec<u8>>>;

    /// Saves identifiers one per line
    fn save_lines<'a, I>(&self, name: &str, lines: I) -> CheckpointResult<()>
    where
        I: IntoIterator<Item = &'a str>,
        Self: Sized,
    {
        let mut text = String::new();
        for line in lines {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(line);
        }
        self.save(name, text.as_bytes())
    }

    /// Loads identifiers saved by `save_lines`, one per line
    fn load_lines(&self, name: &str) -> CheckpointResult<Option<Vec<String>>> {
        Ok(self.load_text(name)?.map(|text| {
            text.lines()
                .map(|line| line.strip_suffix('\r').unwrap_or(line))
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        }))
    }

    /// Loads a hand-written identifier list separated by whitespace or commas
    fn load_id_list(&self, name: &str) -> CheckpointResult<Option<Vec<String>>> {
        Ok(self.load_text(name)?.map(|text| {
            text.split(|c: char| c.is_whitespace() || c == ',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        }))
    }

    /// Loads a checkpoint as UTF-8 text
    fn load_text(&self, name: &str) -> CheckpointResult<Option<String>> {
        let Some(data) = self.load(name)? else {
            return Ok(None);
        };
        String::from_utf8(data)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt {
                name: name.to_string(),
                message: e.to_string(),
            })
    }

    /// Saves a value as JSON
    fn save_json<T: Serialize>(&self, name: &str, value: &T) -> CheckpointResult<()>
    where
        Self: Sized,
    {
        let data = serde_json::to_vec(value).map_err(|source| CheckpointError::Json {
            name: name.to_string(),
            source,
        })?;
        self.save(name, &data)
    }

    /// Loads a JSON value
    fn load_json<T: DeserializeOwned>(&self, name: &str) -> CheckpointResult<Option<T>>
    where
        Self: Sized,
    {
        let Some(data) = self.load(name)? else {
            return Ok(None);
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| CheckpointError::Json {
                name: name.to_string(),
                source,
            })
    }
}
