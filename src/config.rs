//! Service configuration, read once at startup.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::converter::ToolCommand;
use crate::pool::PoolConfig;
use crate::staging::StagingLimits;

/// Names an optional dotenv-style properties file.
pub const PROPS_FILE_VAR: &str = "PDFA_SERVICE_PROPS";

const MB: u64 = 1024 * 1024;

const DEFAULT_SUPPORTED_TYPES: &[&str] = &[
    "doc", "docx", "odt", "rtf", "txt", "xls", "xlsx", "ods", "ppt", "pptx", "odp", "htm",
    "html", "jpg", "jpeg", "png", "tif", "tiff", "pdf",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("failed to load {path}: {message}")]
    PropertiesFile { path: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub max_pool_size: usize,
    pub min_idle: usize,
    /// `None` waits indefinitely.
    pub borrow_timeout: Option<Duration>,
    pub maintenance_interval: Duration,
    pub max_upload_bytes: u64,
    pub max_request_bytes: usize,
    pub in_memory_bytes: usize,
    pub staging_dir: PathBuf,
    pub output_dir: PathBuf,
    pub tool_program: String,
    pub tool_args: Vec<String>,
    pub supported_types: Vec<String>,
    pub otlp_endpoint: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let tmp = env::temp_dir();
        ServiceConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_pool_size: 10,
            min_idle: 3,
            borrow_timeout: Some(Duration::from_secs(60)),
            maintenance_interval: Duration::from_secs(30),
            max_upload_bytes: 40 * MB,
            max_request_bytes: (50 * MB) as usize,
            in_memory_bytes: (3 * MB) as usize,
            staging_dir: tmp.join("pdfa-staging"),
            output_dir: tmp.join("pdfa-output"),
            tool_program: "pdfa-convert".to_string(),
            tool_args: Vec::new(),
            supported_types: DEFAULT_SUPPORTED_TYPES.iter().map(|s| s.to_string()).collect(),
            otlp_endpoint: None,
        }
    }
}

impl ServiceConfig {
    /// Loads the properties file (if any) into the environment, then reads
    /// the configuration from it.
    pub fn load() -> Result<Self, ConfigError> {
        load_properties()?;
        Self::from_env()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Absent or blank
    /// keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = ServiceConfig::default();

        let max_pool_size = match get("PDFA_MAX_POOL_SIZE") {
            Some(v) => parse_positive("PDFA_MAX_POOL_SIZE", &v)?,
            None => defaults.max_pool_size,
        };
        let min_idle = parse_or("PDFA_MIN_IDLE", get("PDFA_MIN_IDLE"), defaults.min_idle)?
            .min(max_pool_size);

        let borrow_timeout = match get("PDFA_BORROW_TIMEOUT_SECS") {
            Some(v) => match parse::<u64>("PDFA_BORROW_TIMEOUT_SECS", &v)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            None => defaults.borrow_timeout,
        };

        let maintenance_interval = match get("PDFA_POOL_MAINTENANCE_SECS") {
            Some(v) => Duration::from_secs(parse_positive::<u64>("PDFA_POOL_MAINTENANCE_SECS", &v)?),
            None => defaults.maintenance_interval,
        };

        let max_upload_bytes = match get("PDFA_MAX_UPLOAD_MB") {
            Some(v) => parse_positive::<u64>("PDFA_MAX_UPLOAD_MB", &v)? * MB,
            None => defaults.max_upload_bytes,
        };
        let max_request_bytes = match get("PDFA_MAX_REQUEST_MB") {
            Some(v) => (parse_positive::<u64>("PDFA_MAX_REQUEST_MB", &v)? * MB) as usize,
            None => defaults.max_request_bytes,
        };
        let in_memory_bytes = match get("PDFA_IN_MEMORY_MB") {
            Some(v) => (parse::<u64>("PDFA_IN_MEMORY_MB", &v)? * MB) as usize,
            None => defaults.in_memory_bytes,
        };

        let supported_types = match get("PDFA_SUPPORTED_TYPES") {
            Some(v) => v
                .split(',')
                .map(|t| t.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            None => defaults.supported_types,
        };

        Ok(ServiceConfig {
            bind_addr: parse_or("PDFA_BIND_ADDR", get("PDFA_BIND_ADDR"), defaults.bind_addr)?,
            max_pool_size,
            min_idle,
            borrow_timeout,
            maintenance_interval,
            max_upload_bytes,
            max_request_bytes,
            in_memory_bytes,
            staging_dir: get("PDFA_STAGING_DIR").map(PathBuf::from).unwrap_or(defaults.staging_dir),
            output_dir: get("PDFA_OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.output_dir),
            tool_program: get("PDFA_TOOL").unwrap_or(defaults.tool_program),
            tool_args: get("PDFA_TOOL_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            supported_types,
            otlp_endpoint: get("OTEL_EXPORTER_OTLP_ENDPOINT"),
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_total: self.max_pool_size,
            min_idle: self.min_idle,
        }
    }

    pub fn staging_limits(&self) -> StagingLimits {
        StagingLimits {
            max_upload_bytes: self.max_upload_bytes,
            in_memory_threshold: self.in_memory_bytes,
        }
    }

    pub fn tool_command(&self) -> ToolCommand {
        ToolCommand {
            program: self.tool_program.clone(),
            args: self.tool_args.clone(),
            output_dir: self.output_dir.clone(),
            supported_types: self.supported_types.clone(),
        }
    }
}

/// Loads `$PDFA_SERVICE_PROPS` if it names a readable file, else `.env` if
/// present. Existing environment variables are never overridden.
///
/// Returns the file that was loaded.
pub fn load_properties() -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = env::var_os(PROPS_FILE_VAR).map(PathBuf::from) {
        if path.is_file() {
            return load_file(&path).map(Some);
        }
    }
    Ok(dotenvy::dotenv().ok())
}

fn load_file(path: &Path) -> Result<PathBuf, ConfigError> {
    dotenvy::from_path(path).map_err(|e| ConfigError::PropertiesFile {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(path.to_path_buf())
}

fn parse<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        value: value.to_string(),
    })
}

fn parse_positive<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let parsed: T = parse(key, value)?;
    if parsed <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(parsed)
}

fn parse_or<T: FromStr>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        Some(v) => parse(key, &v),
        None => Ok(default),
    }
}
