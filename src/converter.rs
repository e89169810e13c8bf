//! PDF/A conversion via an external command-line tool.
//!
//! The tool is invoked as `<program> [args...] <input> <output_dir>` and is
//! expected to write `<output_dir>/<stem of input name>.pdf`. That naming
//! contract is what lets request cleanup find the artifact later (see
//! [`crate::naming`]); [`CommandConverter`] verifies it after every run.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::naming;
use crate::pool::{FactoryError, WorkerFactory};

/// Failures reported by a converter.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// The input could not be classified as a convertible document.
    #[error("unknown file type: {0}")]
    UnknownFileType(String),

    /// The tool could not be run, crashed, or exited unsuccessfully.
    #[error("external tool failed: {0}")]
    ExternalTool(String),

    /// The tool reported success but left no artifact behind.
    #[error("generated file unavailable: {0}")]
    GeneratedFileUnavailable(String),
}

/// A converter instance as held by the pool.
#[cfg_attr(test, mockall::automock)]
pub trait PdfaConverter: Send {
    /// Converts `input`, returning the path of the produced artifact.
    fn convert(&mut self, input: &Path) -> Result<PathBuf, ConversionError>;

    /// Version string of the underlying tool.
    fn version(&mut self) -> Result<String, ConversionError>;

    /// Whether this instance can still be used.
    fn is_healthy(&self) -> bool;
}

/// How to run the external tool.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    pub program: String,
    /// Arguments placed before the input and output directory.
    pub args: Vec<String>,
    pub output_dir: PathBuf,
    /// Lowercase input extensions the tool accepts.
    pub supported_types: Vec<String>,
}

impl ToolCommand {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    fn supports(&self, input: &Path) -> bool {
        input
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.supported_types.iter().any(|t| *t == ext)
            })
            .unwrap_or(false)
    }
}

/// Converter backed by the external command-line tool.
pub struct CommandConverter {
    tool: Arc<ToolCommand>,
    version: String,
    healthy: bool,
}

impl CommandConverter {
    /// Creates a converter, probing the tool for its version.
    ///
    /// # Errors
    ///
    /// Fails when the program cannot be started or does not report a version.
    pub fn new(tool: Arc<ToolCommand>) -> Result<Self, ConversionError> {
        let version = probe_version(&tool)?;
        debug!("Converter ready: program={}, version={}", tool.program, version);
        Ok(Self {
            tool,
            version,
            healthy: true,
        })
    }

    fn spawn_failed(&mut self, e: std::io::Error) -> ConversionError {
        if e.kind() == std::io::ErrorKind::NotFound {
            self.healthy = false;
        }
        ConversionError::ExternalTool(format!("failed to run {}: {}", self.tool.program, e))
    }
}

fn probe_version(tool: &ToolCommand) -> Result<String, ConversionError> {
    let output = tool
        .command()
        .arg("--version")
        .output()
        .map_err(|e| ConversionError::ExternalTool(format!("failed to run {}: {}", tool.program, e)))?;

    if !output.status.success() {
        return Err(ConversionError::ExternalTool(format!(
            "{} --version exited with {}",
            tool.program, output.status
        )));
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ConversionError::ExternalTool(format!("{} reported no version", tool.program)))
}

impl PdfaConverter for CommandConverter {
    fn convert(&mut self, input: &Path) -> Result<PathBuf, ConversionError> {
        let file_name = input
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ConversionError::UnknownFileType(input.display().to_string()))?;

        if !self.tool.supports(input) {
            return Err(ConversionError::UnknownFileType(format!(
                "cannot convert {}",
                file_name
            )));
        }

        fs::create_dir_all(&self.tool.output_dir).map_err(|e| {
            ConversionError::ExternalTool(format!(
                "cannot create output directory {}: {}",
                self.tool.output_dir.display(),
                e
            ))
        })?;

        info!("Converting to PDF/A: input={}", input.display());

        let output = self
            .tool
            .command()
            .arg(input)
            .arg(&self.tool.output_dir)
            .output()
            .map_err(|e| self.spawn_failed(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                "Conversion tool failed: input={}, status={}, stderr={}",
                file_name,
                output.status,
                stderr.trim()
            );
            return Err(ConversionError::ExternalTool(format!(
                "{} exited with {}: {}",
                self.tool.program,
                output.status,
                stderr.trim()
            )));
        }

        let produced = naming::expected_output(&self.tool.output_dir, naming::stem(file_name));
        if !produced.is_file() {
            return Err(ConversionError::GeneratedFileUnavailable(format!(
                "expected {} after converting {}",
                produced.display(),
                file_name
            )));
        }

        info!("PDF/A conversion complete: output={}", produced.display());
        Ok(produced)
    }

    fn version(&mut self) -> Result<String, ConversionError> {
        Ok(self.version.clone())
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }
}

/// Builds [`CommandConverter`]s for the pool.
pub struct CommandConverterFactory {
    tool: Arc<ToolCommand>,
}

impl CommandConverterFactory {
    pub fn new(tool: ToolCommand) -> Self {
        Self {
            tool: Arc::new(tool),
        }
    }
}

impl WorkerFactory for CommandConverterFactory {
    fn create(&self) -> Result<Box<dyn PdfaConverter>, FactoryError> {
        debug!("Creating new converter instance in pool");
        CommandConverter::new(self.tool.clone())
            .map(|c| Box::new(c) as Box<dyn PdfaConverter>)
            .map_err(|e| FactoryError(e.to_string()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const FAKE_TOOL: &str = r#"
if [ "$1" = "--version" ]; then echo "pdfa-fake 2.1.0"; exit 0; fi
name=$(basename "$1")
cp "$1" "$2/${name%%.*}.pdf"
"#;

    fn tool(script: &str, output_dir: &Path) -> Arc<ToolCommand> {
        Arc::new(ToolCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string(), "pdfa-fake".to_string()],
            output_dir: output_dir.to_path_buf(),
            supported_types: vec!["docx".to_string(), "txt".to_string()],
        })
    }

    #[test]
    fn test_convert_writes_stem_named_output() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let input = dir.path().join("upload_k3Y.tmp-notes.txt");
        fs::write(&input, "hello").unwrap();

        let mut converter = CommandConverter::new(tool(FAKE_TOOL, &out)).unwrap();
        let produced = converter.convert(&input).unwrap();

        assert_eq!(produced, out.join("upload_k3Y.pdf"));
        assert!(produced.exists());
    }

    #[test]
    fn test_version_is_probed_at_construction() {
        let dir = TempDir::new().unwrap();
        let mut converter = CommandConverter::new(tool(FAKE_TOOL, dir.path())).unwrap();

        assert_eq!(converter.version().unwrap(), "pdfa-fake 2.1.0");
        assert!(converter.is_healthy());
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("image.xyz");
        fs::write(&input, "data").unwrap();

        let mut converter = CommandConverter::new(tool(FAKE_TOOL, dir.path())).unwrap();
        let result = converter.convert(&input);

        assert!(matches!(result, Err(ConversionError::UnknownFileType(_))));
    }

    #[test]
    fn test_tool_failure() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("broken.docx");
        fs::write(&input, "data").unwrap();
        let script = r#"if [ "$1" = "--version" ]; then echo v1; exit 0; fi
echo "corrupt input" >&2; exit 3"#;

        let mut converter = CommandConverter::new(tool(script, dir.path())).unwrap();
        let err = converter.convert(&input).unwrap_err();

        match err {
            ConversionError::ExternalTool(msg) => assert!(msg.contains("corrupt input")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_missing_output() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("empty.txt");
        fs::write(&input, "data").unwrap();
        let script = r#"if [ "$1" = "--version" ]; then echo v1; fi; exit 0"#;

        let mut converter = CommandConverter::new(tool(script, dir.path())).unwrap();
        let result = converter.convert(&input);

        assert!(matches!(result, Err(ConversionError::GeneratedFileUnavailable(_))));
    }

    #[test]
    fn test_factory_fails_for_missing_program() {
        let factory = CommandConverterFactory::new(ToolCommand {
            program: "/nonexistent/pdfa-convert".to_string(),
            args: vec![],
            output_dir: PathBuf::from("/tmp"),
            supported_types: vec![],
        });

        assert!(factory.create().is_err());
    }
}
