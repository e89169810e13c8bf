//! Staging of request inputs.
//!
//! Uploaded bytes are written to a uniquely named file in the staging
//! directory: `upload_<random>.tmp-<original name>`. The correlation key is
//! the stem of that name (`upload_<random>`), which is also the stem the
//! conversion tool uses for its output. Keeping the original name as a
//! suffix preserves its extension so the tool can classify the input.

use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::naming;

/// Prefix of every staged upload.
pub const UPLOAD_PREFIX: &str = "upload_";

/// Staging failures.
#[derive(Debug, Error)]
pub enum StagingError {
    /// The upload contained no bytes.
    #[error("upload is empty")]
    Empty,

    /// The upload exceeded the per-file limit.
    #[error("upload exceeds the {limit} byte limit")]
    TooLarge { limit: u64 },

    /// Reading the upload stream failed.
    #[error("failed to read upload: {0}")]
    Read(String),

    #[error("staging I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Where a staged input came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOrigin {
    /// Written by the staging area; owned by the request.
    Uploaded,
    /// A path the caller named directly; never deleted.
    CallerSupplied,
}

/// An input ready for conversion.
#[derive(Debug, Clone)]
pub struct StagedInput {
    pub correlation_key: String,
    pub stored_path: PathBuf,
    pub original_name: String,
    pub origin: InputOrigin,
}

impl StagedInput {
    /// Whether cleanup is allowed to remove `stored_path`.
    pub fn is_owned(&self) -> bool {
        self.origin == InputOrigin::Uploaded
    }
}

/// Limits applied while staging uploads.
#[derive(Debug, Clone)]
pub struct StagingLimits {
    /// Per-file upload limit in bytes.
    pub max_upload_bytes: u64,
    /// Uploads up to this size are buffered in memory before being written.
    pub in_memory_threshold: usize,
}

/// Directory holding staged uploads.
#[derive(Debug, Clone)]
pub struct StagingArea {
    dir: PathBuf,
    limits: StagingLimits,
}

impl StagingArea {
    /// Creates the staging area, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>, limits: StagingLimits) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, limits })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `source` to a new uniquely named file.
    ///
    /// The file is created before the first byte is read, so it exists on
    /// disk for the whole upload. Bytes are buffered in memory up to the
    /// in-memory threshold and then spilled; the threshold only delays the
    /// writes. The file is deleted unless staging completes: on any error, and
    /// when the returned future is dropped before it finishes.
    ///
    /// # Arguments
    /// * `source` - Stream of upload chunks
    /// * `original_name` - Client-supplied name; only its final component is kept
    ///
    /// # Returns
    /// The staged input, owned by the service, keyed by its `upload_<random>` stem.
    ///
    /// # Errors
    /// * `StagingError::Empty` - the stream carried no bytes
    /// * `StagingError::TooLarge` - more than `max_upload_bytes` were sent
    /// * `StagingError::Read` - the stream itself failed
    /// * `StagingError::Io` - the file could not be created or written
    pub async fn stage<S, B, E>(&self, source: S, original_name: &str) -> Result<StagedInput, StagingError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let original_name = sanitize(original_name);

        // Reserve the unique name; the temp file deletes itself until kept
        let temp = tempfile::Builder::new()
            .prefix(UPLOAD_PREFIX)
            .suffix(&format!(".tmp-{}", original_name))
            .tempfile_in(&self.dir)?;

        // Copy through a second handle so `temp` keeps owning the path
        let mut file = File::from_std(temp.as_file().try_clone()?);
        let copied = self.copy_stream(source, &mut file).await;
        drop(file);

        let size = match copied {
            Ok(size) => size,
            Err(e) => {
                debug!("Discarding partial upload {}: {}", temp.path().display(), e);
                return Err(e);
            }
        };

        // Complete: hand the file over to the request's cleanup guard
        let (_, stored_path) = temp.keep().map_err(|e| StagingError::Io(e.error))?;
        let correlation_key = correlation_key_for(&stored_path);
        info!(
            correlation_key = %correlation_key,
            original_name = %original_name,
            size_bytes = size,
            "Staged upload"
        );
        Ok(StagedInput {
            correlation_key,
            stored_path,
            original_name,
            origin: InputOrigin::Uploaded,
        })
    }

    async fn copy_stream<S, B, E>(&self, source: S, file: &mut File) -> Result<u64, StagingError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        futures::pin_mut!(source);
        let mut buffer: Vec<u8> = Vec::new();
        let mut spilled = false;
        let mut total: u64 = 0;

        while let Some(chunk) = source.next().await {
            let chunk = chunk.map_err(|e| StagingError::Read(e.to_string()))?;
            let bytes = chunk.as_ref();

            total += bytes.len() as u64;
            if total > self.limits.max_upload_bytes {
                return Err(StagingError::TooLarge {
                    limit: self.limits.max_upload_bytes,
                });
            }

            if spilled {
                file.write_all(bytes).await?;
            } else if buffer.len() + bytes.len() > self.limits.in_memory_threshold {
                debug!("Upload exceeded in-memory threshold, spilling to disk");
                file.write_all(&buffer).await?;
                file.write_all(bytes).await?;
                buffer = Vec::new();
                spilled = true;
            } else {
                buffer.extend_from_slice(bytes);
            }
        }

        if total == 0 {
            return Err(StagingError::Empty);
        }
        if !spilled {
            file.write_all(&buffer).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(total)
    }

    /// Uses a file already on disk as the input, without copying it.
    pub fn resolve_local(&self, path: impl Into<PathBuf>) -> StagedInput {
        let stored_path = path.into();
        let original_name = stored_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| stored_path.to_string_lossy().into_owned());

        StagedInput {
            correlation_key: naming::stem(&original_name).to_string(),
            stored_path,
            original_name,
            origin: InputOrigin::CallerSupplied,
        }
    }

    /// Removes leftover uploads. Returns the number of files deleted.
    pub fn purge(&self) -> usize {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read staging directory {}: {}", self.dir.display(), e);
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let is_upload = entry.file_name().to_string_lossy().starts_with(UPLOAD_PREFIX);
            if is_upload && std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Purged {} leftover staged file(s)", removed);
        }
        removed
    }
}

fn correlation_key_for(stored_path: &Path) -> String {
    let name = stored_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    naming::stem(&name).to_string()
}

/// Keeps only the final component of a client-supplied file name.
fn sanitize(original_name: &str) -> String {
    let base = naming::base_name(original_name.trim());
    match base {
        "" | "." | ".." => "upload".to_string(),
        name => name.to_string(),
    }
}
