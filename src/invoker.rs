//! Runs one conversion on a pooled converter.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cleanup;
use crate::error::ServiceError;
use crate::naming;
use crate::pool::ConverterPool;
use crate::staging::StagedInput;

/// Artifact produced for a request. Valid until the response body has been
/// sent, after which cleanup removes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionResult {
    pub output_file: PathBuf,
    /// `stem(original name).pdf`, suggested to the caller.
    pub download_name: String,
}

/// Borrows a converter, runs it, and always gives it back.
#[derive(Clone)]
pub struct ConversionInvoker {
    pool: ConverterPool,
    output_dir: PathBuf,
    borrow_timeout: Option<Duration>,
}

impl ConversionInvoker {
    pub fn new(pool: ConverterPool, output_dir: impl Into<PathBuf>, borrow_timeout: Option<Duration>) -> Self {
        Self {
            pool,
            output_dir: output_dir.into(),
            borrow_timeout,
        }
    }

    pub fn pool(&self) -> &ConverterPool {
        &self.pool
    }

    /// Converts a staged input.
    ///
    /// The converter runs on the blocking thread pool and is returned to the
    /// pool when that task ends, whether it succeeded, failed, or panicked.
    /// If the caller stops waiting, the artifact is discarded once the tool
    /// finishes, unless the artifact path is the caller's own input file.
    ///
    /// # Arguments
    /// * `input` - Staged upload or caller-supplied file to convert
    ///
    /// # Returns
    /// The artifact path and the name suggested to the client. The artifact
    /// stays on disk until the request's cleanup guard runs.
    ///
    /// # Errors
    /// * `ServiceError::PoolExhausted` / `ConstructionFailed` - no converter could be borrowed
    /// * `ServiceError::UnsupportedInputType`, `ToolExecutionFailed`, `OutputUnavailable` - classified tool failures
    /// * `ServiceError::Unexpected` - the converter panicked; its handle is destroyed
    pub async fn convert(&self, input: &StagedInput) -> Result<ConversionResult, ServiceError> {
        // Borrow first; nothing is written until a converter is available
        let mut worker = self.pool.borrow(self.borrow_timeout).await?;
        let handle_id = worker.id();
        debug!("Running converter {} on {}", handle_id, input.stored_path.display());

        // Arm the abandonment marker for the artifact this key will produce
        let expected = naming::expected_output(&self.output_dir, &input.correlation_key);
        let protected = !input.is_owned() && cleanup::same_file(&input.stored_path, &expected);
        if protected {
            warn!(
                "Input {} is at the output path; it will not be discarded",
                input.stored_path.display()
            );
        }
        let mut abandonment = Abandonment::new((!protected).then(|| expected.clone()));
        let abandoned = abandonment.flag();

        // Run the tool off the async runtime; the handle goes back in the task
        let stored_path = input.stored_path.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = worker.converter().convert(&stored_path);
            drop(worker);
            if abandoned.load(Ordering::SeqCst) && !protected {
                if let Ok(ref produced) = result {
                    discard(produced);
                }
            }
            result
        })
        .await;
        abandonment.disarm();

        // A join error means the converter panicked

        let produced = joined
            .map_err(|e| ServiceError::Unexpected(format!("converter {} aborted: {}", handle_id, e)))??;

        if produced != expected {
            warn!(
                "Converter output does not follow the naming convention: expected={}, produced={}",
                expected.display(),
                produced.display()
            );
        }

        Ok(ConversionResult {
            output_file: produced,
            download_name: naming::download_name(&input.original_name),
        })
    }

    /// Version string of the conversion tool.
    pub async fn version(&self) -> Result<String, ServiceError> {
        let mut worker = self
            .pool
            .borrow(self.borrow_timeout)
            .await
            .map_err(|e| ServiceError::VersionUnavailable(e.to_string()))?;

        tokio::task::spawn_blocking(move || worker.converter().version())
            .await
            .map_err(|e| ServiceError::VersionUnavailable(e.to_string()))?
            .map_err(|e| ServiceError::VersionUnavailable(e.to_string()))
    }
}

/// Marks a conversion whose caller stopped waiting.
///
/// Dropping it while armed sets the flag and removes any artifact already
/// written; the blocking task removes one written later. Without an output
/// path only the flag is set.
struct Abandonment {
    abandoned: Arc<AtomicBool>,
    output: Option<PathBuf>,
    armed: bool,
}

impl Abandonment {
    fn new(output: Option<PathBuf>) -> Self {
        Self {
            abandoned: Arc::new(AtomicBool::new(false)),
            output,
            armed: true,
        }
    }

    fn flag(&self) -> Arc<AtomicBool> {
        self.abandoned.clone()
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Abandonment {
    fn drop(&mut self) {
        if self.armed {
            self.abandoned.store(true, Ordering::SeqCst);
            if let Some(ref output) = self.output {
                discard(output);
            }
        }
    }
}

fn discard(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Discarded abandoned output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to discard abandoned output {}: {}", path.display(), e),
    }
}
