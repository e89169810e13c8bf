//! End-of-request cleanup.
//!
//! Every conversion request creates one [`CleanupGuard`] before doing any
//! work. Staging records the correlation key in it, and the guard deletes the
//! correlated output (and the staged upload) exactly once: when the request
//! finishes explicitly, or when the guard is dropped along with the response
//! body, a failed handler, or a panicking task.

use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::naming;
use crate::staging::StagedInput;

/// Outcome of removing one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Deleted,
    /// Nothing to delete; not an error.
    Missing,
    /// Deletion failed and was logged.
    Failed,
    /// The path is the caller's own input and was left alone.
    Kept,
}

/// What a cleanup pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub output: Removal,
    pub input: Option<Removal>,
}

/// Request-scoped owner of the correlation key.
#[derive(Debug)]
pub struct CleanupGuard {
    output_dir: PathBuf,
    correlation_key: Option<String>,
    staged_input: Option<PathBuf>,
    caller_input: Option<PathBuf>,
    done: bool,
}

impl CleanupGuard {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            correlation_key: None,
            staged_input: None,
            caller_input: None,
            done: false,
        }
    }

    /// Records the staged input. A caller-supplied path is never deleted,
    /// not even when it is where the converted output would be.
    pub fn record(&mut self, staged: &StagedInput) {
        debug!(correlation_key = %staged.correlation_key, "Recorded correlation key");
        self.correlation_key = Some(staged.correlation_key.clone());
        if staged.is_owned() {
            self.staged_input = Some(staged.stored_path.clone());
            self.caller_input = None;
        } else {
            self.staged_input = None;
            self.caller_input = Some(staged.stored_path.clone());
        }
    }

    pub fn correlation_key(&self) -> Option<&str> {
        self.correlation_key.as_deref()
    }

    /// Runs cleanup now. Later calls, and the eventual drop, do nothing.
    ///
    /// Returns `None` when cleanup already ran or no key was recorded.
    pub fn finish(&mut self) -> Option<CleanupReport> {
        if std::mem::replace(&mut self.done, true) {
            return None;
        }
        let key = self.correlation_key.take()?;

        let output = naming::expected_output(&self.output_dir, &key);
        let is_caller_file = self
            .caller_input
            .take()
            .is_some_and(|input| same_file(&input, &output));
        let report = CleanupReport {
            output: if is_caller_file { Removal::Kept } else { remove(&output) },
            input: self.staged_input.take().map(|path| remove(&path)),
        };

        match report.output {
            Removal::Deleted => debug!("Converted file was deleted: {}", key),
            Removal::Missing => debug!("No converted file to delete: {}", key),
            Removal::Failed => warn!("Converted file NOT deleted: {}", key),
            Removal::Kept => warn!("Output path is the caller's input, NOT deleted: {}", output.display()),
        }
        Some(report)
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Whether both paths name the same existing file.
pub fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn remove(path: &Path) -> Removal {
    match std::fs::remove_file(path) {
        Ok(()) => Removal::Deleted,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Removal::Missing,
        Err(e) => {
            warn!("Failed to delete {}: {}", path.display(), e);
            Removal::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::InputOrigin;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn uploaded(dir: &Path, key: &str) -> StagedInput {
        let stored_path = dir.join(format!("{}.tmp-report.docx", key));
        fs::write(&stored_path, "input").unwrap();
        StagedInput {
            correlation_key: key.to_string(),
            stored_path,
            original_name: "report.docx".to_string(),
            origin: InputOrigin::Uploaded,
        }
    }

    #[test]
    fn test_deletes_output_and_staged_input() {
        let staging = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let staged = uploaded(staging.path(), "upload_ab12");
        fs::write(out.path().join("upload_ab12.pdf"), "%PDF").unwrap();

        let mut guard = CleanupGuard::new(out.path());
        guard.record(&staged);
        let report = guard.finish().unwrap();

        assert_eq!(
            report,
            CleanupReport {
                output: Removal::Deleted,
                input: Some(Removal::Deleted),
            }
        );
        assert!(!out.path().join("upload_ab12.pdf").exists());
        assert!(!staged.stored_path.exists());
    }

    #[test]
    fn test_missing_output_is_not_an_error() {
        let staging = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let staged = uploaded(staging.path(), "upload_zz");

        let mut guard = CleanupGuard::new(out.path());
        guard.record(&staged);
        let report = guard.finish().unwrap();

        assert_eq!(report.output, Removal::Missing);
        assert_eq!(report.input, Some(Removal::Deleted));
    }

    #[test]
    fn test_caller_supplied_input_is_kept() {
        let local = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let input = local.path().join("thesis.docx");
        fs::write(&input, "mine").unwrap();
        fs::write(out.path().join("thesis.pdf"), "%PDF").unwrap();

        let staged = StagedInput {
            correlation_key: "thesis".to_string(),
            stored_path: input.clone(),
            original_name: "thesis.docx".to_string(),
            origin: InputOrigin::CallerSupplied,
        };
        let mut guard = CleanupGuard::new(out.path());
        guard.record(&staged);
        let report = guard.finish().unwrap();

        assert_eq!(report.output, Removal::Deleted);
        assert_eq!(report.input, None);
        assert!(input.exists());
    }

    #[test]
    fn test_no_key_is_a_no_op() {
        let out = TempDir::new().unwrap();
        let mut guard = CleanupGuard::new(out.path());

        assert_eq!(guard.finish(), None);
    }

    #[test]
    fn test_runs_exactly_once() {
        let staging = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let staged = uploaded(staging.path(), "upload_once");

        let mut guard = CleanupGuard::new(out.path());
        guard.record(&staged);
        assert!(guard.finish().is_some());

        // A new file with the same name must survive later calls and the drop.
        fs::write(out.path().join("upload_once.pdf"), "%PDF").unwrap();
        assert_eq!(guard.finish(), None);
        drop(guard);
        assert!(out.path().join("upload_once.pdf").exists());
    }

    #[test]
    fn test_drop_runs_cleanup() {
        let staging = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let staged = uploaded(staging.path(), "upload_drop");
        fs::write(out.path().join("upload_drop.pdf"), "%PDF").unwrap();

        {
            let mut guard = CleanupGuard::new(out.path());
            guard.record(&staged);
        }

        assert!(!out.path().join("upload_drop.pdf").exists());
        assert!(!staged.stored_path.exists());
    }

    #[test]
    fn test_caller_file_at_output_path_is_kept() {
        let out = TempDir::new().unwrap();
        let input = out.path().join("thesis.pdf");
        fs::write(&input, "%PDF caller").unwrap();

        let staged = StagedInput {
            correlation_key: "thesis".to_string(),
            // Same file, reached through a different spelling.
            stored_path: out.path().join(".").join("thesis.pdf"),
            original_name: "thesis.pdf".to_string(),
            origin: InputOrigin::CallerSupplied,
        };
        let mut guard = CleanupGuard::new(out.path());
        guard.record(&staged);
        let report = guard.finish().unwrap();

        assert_eq!(report.output, Removal::Kept);
        assert_eq!(report.input, None);
        assert_eq!(fs::read_to_string(&input).unwrap(), "%PDF caller");
    }

    #[test]
    fn test_same_file() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.pdf");
        fs::write(&a, "x").unwrap();

        assert!(same_file(&a, &dir.path().join(".").join("a.pdf")));
        assert!(!same_file(&a, &dir.path().join("b.pdf")));
    }
}
