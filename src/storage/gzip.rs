//! Gzip file checkpoint store
//!
//! Every checkpoint `name` lives at `<dir>/<name>.gz`. Writes go to a
//! sibling temp file which is then renamed over the target. Reads fall back
//! to an uncompressed `<dir>/<name>` so state files written before
//! compression was introduced still load.

use crate::storage::traits::CheckpointStore;
use crate::{CheckpointError, CheckpointResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Gzip-compressed, whole-file-rewrite checkpoint store
#[derive(Debug, Clone)]
pub struct GzipFileStore {
    dir: PathBuf,
}

impl GzipFileStore {
    /// Opens a store rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl AsRef<Path>) -> CheckpointResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            name: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    /// Directory holding the checkpoint files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the compressed file for `name`
    pub fn compressed_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.gz", name))
    }

    /// Path of the legacy uncompressed file for `name`
    pub fn raw_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn read_optional(path: &Path, name: &str) -> CheckpointResult<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CheckpointError::Io {
                name: name.to_string(),
                source,
            }),
        }
    }
}

impl CheckpointStore for GzipFileStore {
    fn save(&self, name: &str, data: &[u8]) -> CheckpointResult<()> {
        let io_err = |source| CheckpointError::Io {
            name: name.to_string(),
            source,
        };

        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
        encoder.write_all(data).map_err(io_err)?;
        let compressed = encoder.finish().map_err(io_err)?;

        let target = self.compressed_path(name);
        let tmp = self.dir.join(format!(".{}.gz.tmp", name));
        fs::write(&tmp, &compressed).map_err(io_err)?;
        fs::rename(&tmp, &target).map_err(io_err)?;

        tracing::debug!(
            "Saved checkpoint {} ({} bytes, {} compressed)",
            target.display(),
            data.len(),
            compressed.len()
        );
        Ok(())
    }

    fn load(&self, name: &str) -> CheckpointResult<Option<Vec<u8>>> {
        if let Some(compressed) = Self::read_optional(&self.compressed_path(name), name)? {
            let mut decoder = GzDecoder::new(compressed.as_slice());
            let mut data = Vec::new();
            match decoder.read_to_end(&mut data) {
                Ok(_) => return Ok(Some(data)),
                Err(e) => {
                    tracing::warn!(
                        "Checkpoint {} failed to decompress ({}), trying uncompressed copy",
                        name,
                        e
                    );
                    return match Self::read_optional(&self.raw_path(name), name)? {
                        Some(raw) => Ok(Some(raw)),
                        None => Err(CheckpointError::Corrupt {
                            name: name.to_string(),
                            message: e.to_string(),
                        }),
                    };
                }
            }
        }

        let raw = Self::read_optional(&self.raw_path(name), name)?;
        if raw.is_some() {
            tracing::info!("Loaded uncompressed legacy checkpoint {}", name);
        }
        Ok(raw)
    }
}
