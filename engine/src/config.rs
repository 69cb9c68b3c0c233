//! Run configuration.
//!
//! A `TransferConfig` is built once at startup from environment variables,
//! validated, and passed down by reference. Recognised variables:
//!
//! | Variable               | Meaning                               | Default       |
//! |------------------------|---------------------------------------|---------------|
//! | `SOURCE_HOST`          | source endpoint host                  | required      |
//! | `SOURCE_PORT`          | source endpoint port                  | 21            |
//! | `SOURCE_USER`          | source login                          | required      |
//! | `SOURCE_PASSWORD`      | source password                       | required      |
//! | `TARGET_HOST`          | target endpoint host                  | required      |
//! | `TARGET_PORT`          | target endpoint port                  | 21            |
//! | `TARGET_USER`          | target login                          | required      |
//! | `TARGET_PASSWORD`      | target password                       | required      |
//! | `TRANSFER_PATH`        | remote directory, relative to login   | required      |
//! | `TARGET_PATH`          | target directory                      | TRANSFER_PATH |
//! | `USE_CHUNKING`         | split large trees into chunks         | false         |
//! | `MAX_CHUNK_SIZE`       | chunk byte budget                     | 52428800      |
//! | `COMPRESSION_LEVEL`    | 1-9, above 1 uploads archives         | 1             |
//! | `CONNECT_TIMEOUT_SECS` | session establishment timeout         | 30            |
//! | `DATA_TIMEOUT_SECS`    | idle data transfer timeout            | 300           |
//! | `MAX_RETRIES`          | attempts per operation                | 3             |
//! | `RETRY_DELAY_SECS`     | first backoff delay                   | 2             |
//! | `STAGING_DIR`          | local scratch root                    | tmp_trans     |

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::compress::CompressionLevel;
use crate::error::EngineError;
use crate::retry::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};

pub const DEFAULT_PORT: u16 = 21;
pub const DEFAULT_CHUNK_SIZE: u64 = 52_428_800;
pub const DEFAULT_STAGING_DIR: &str = "tmp_trans";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DATA_TIMEOUT: Duration = Duration::from_secs(300);

/// Address and credentials of one endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-operation timeouts. There is no timeout on the run as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Establishing the control connection
    pub connect: Duration,
    /// Idle time on a control or data connection
    pub data: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: DEFAULT_CONNECT_TIMEOUT,
            data: DEFAULT_DATA_TIMEOUT,
        }
    }
}

/// Everything a run needs to know, validated.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub source: EndpointConfig,
    pub target: EndpointConfig,

    /// Directory on the source, relative to the login directory
    pub source_path: String,

    /// Directory on the target the tree is copied into
    pub target_path: String,

    pub use_chunking: bool,

    /// Byte budget per chunk
    pub max_chunk_size: u64,

    pub compression_level: CompressionLevel,

    pub timeouts: Timeouts,

    pub retry: RetryPolicy,

    /// Local scratch root; each run stages into its own subdirectory
    pub staging_dir: PathBuf,
}

impl TransferConfig {
    /// Build from the process environment.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment, a map in tests).
    ///
    /// Values that are present but blank count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let required = |key: &str| get(key).ok_or_else(|| EngineError::config(key, "must be set"));

        let source = EndpointConfig {
            host: required("SOURCE_HOST")?,
            port: parse_port("SOURCE_PORT", get("SOURCE_PORT"))?,
            user: required("SOURCE_USER")?,
            password: required("SOURCE_PASSWORD")?,
        };
        let target = EndpointConfig {
            host: required("TARGET_HOST")?,
            port: parse_port("TARGET_PORT", get("TARGET_PORT"))?,
            user: required("TARGET_USER")?,
            password: required("TARGET_PASSWORD")?,
        };

        let source_path = required("TRANSFER_PATH")?;
        let target_path = get("TARGET_PATH").unwrap_or_else(|| source_path.clone());

        let use_chunking = match get("USE_CHUNKING") {
            Some(v) => parse_bool("USE_CHUNKING", &v)?,
            None => false,
        };
        let max_chunk_size = match get("MAX_CHUNK_SIZE") {
            Some(v) => parse_u64("MAX_CHUNK_SIZE", &v)?,
            None => DEFAULT_CHUNK_SIZE,
        };
        let compression_level = match get("COMPRESSION_LEVEL") {
            Some(v) => {
                let level = parse_u64("COMPRESSION_LEVEL", &v)?;
                let level = u32::try_from(level)
                    .map_err(|_| EngineError::config("COMPRESSION_LEVEL", "must be between 1 and 9"))?;
                CompressionLevel::new(level)?
            }
            None => CompressionLevel::default(),
        };

        let timeouts = Timeouts {
            connect: get("CONNECT_TIMEOUT_SECS")
                .map(|v| parse_u64("CONNECT_TIMEOUT_SECS", &v).map(Duration::from_secs))
                .transpose()?
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            data: get("DATA_TIMEOUT_SECS")
                .map(|v| parse_u64("DATA_TIMEOUT_SECS", &v).map(Duration::from_secs))
                .transpose()?
                .unwrap_or(DEFAULT_DATA_TIMEOUT),
        };

        let max_attempts = match get("MAX_RETRIES") {
            Some(v) => u32::try_from(parse_u64("MAX_RETRIES", &v)?)
                .map_err(|_| EngineError::config("MAX_RETRIES", "value too large"))?,
            None => DEFAULT_MAX_ATTEMPTS,
        };
        let base_delay = get("RETRY_DELAY_SECS")
            .map(|v| parse_u64("RETRY_DELAY_SECS", &v).map(Duration::from_secs))
            .transpose()?
            .unwrap_or(DEFAULT_BASE_DELAY);

        let staging_dir = get("STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_DIR));

        let config = TransferConfig {
            source,
            target,
            source_path,
            target_path,
            use_chunking,
            max_chunk_size,
            compression_level,
            timeouts,
            retry: RetryPolicy::new(max_attempts, base_delay),
            staging_dir,
        };
        config.validate()?;
        Ok(config)
    }

    /// Point both ends of the run at `path` (the `--path` override).
    pub fn set_transfer_path(&mut self, path: &str) {
        self.source_path = path.to_string();
        self.target_path = path.to_string();
    }

    /// Check the invariants every component relies on.
    ///
    /// Call again after applying command-line overrides.
    pub fn validate(&self) -> Result<(), EngineError> {
        for (prefix, endpoint) in [("SOURCE", &self.source), ("TARGET", &self.target)] {
            if endpoint.host.trim().is_empty() {
                return Err(EngineError::config(&format!("{}_HOST", prefix), "must not be empty"));
            }
            if endpoint.user.trim().is_empty() {
                return Err(EngineError::config(&format!("{}_USER", prefix), "must not be empty"));
            }
            if endpoint.port == 0 {
                return Err(EngineError::config(
                    &format!("{}_PORT", prefix),
                    "must be between 1 and 65535",
                ));
            }
        }
        if self.source_path.trim().is_empty() {
            return Err(EngineError::config("TRANSFER_PATH", "must not be empty"));
        }
        if self.target_path.trim().is_empty() {
            return Err(EngineError::config("TARGET_PATH", "must not be empty"));
        }
        if self.max_chunk_size == 0 {
            return Err(EngineError::config("MAX_CHUNK_SIZE", "must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::config("MAX_RETRIES", "must be at least 1"));
        }
        Ok(())
    }
}

fn parse_port(key: &str, value: Option<String>) -> Result<u16, EngineError> {
    let Some(value) = value else {
        return Ok(DEFAULT_PORT);
    };
    match value.parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(port as u16),
        _ => Err(EngineError::config(
            key,
            format!("'{}' is not a port between 1 and 65535", value),
        )),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, EngineError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(EngineError::config(key, format!("'{}' is not a boolean", value))),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64, EngineError> {
    value
        .parse::<u64>()
        .map_err(|_| EngineError::config(key, format!("'{}' is not a non-negative integer", value)))
}
