use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Worker settings, read from `VULNSCAN_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub bind_address: String,
    pub database_url: String,
    /// Unpacked module sources, laid out as `<module>@<version>`.
    pub modules_root: PathBuf,
    pub vulndb_dir: PathBuf,
    pub scanner: PathBuf,
    pub go: PathBuf,
    pub scan_timeout: Duration,
    pub worker_version: String,
    /// Helper that runs the scanner inside the sandbox. Unset means scans
    /// run directly.
    pub sandbox_program: Option<PathBuf>,
    pub sandbox_args: Vec<String>,
    /// Where binaries are built for binary and compare scans. Must be
    /// visible inside the sandbox.
    pub build_dir: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads settings through `lookup`; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let get_or = |name: &str, default: &str| get(name).unwrap_or_else(|| default.to_string());

        let scan_timeout = match get("VULNSCAN_SCAN_TIMEOUT_SECS") {
            None => Duration::from_secs(600),
            Some(value) => match value.trim().parse::<u64>() {
                Ok(0) => {
                    return Err(ConfigError::Invalid {
                        name: "VULNSCAN_SCAN_TIMEOUT_SECS",
                        value,
                        reason: "must be positive".to_string(),
                    })
                }
                Ok(secs) => Duration::from_secs(secs),
                Err(e) => {
                    return Err(ConfigError::Invalid {
                        name: "VULNSCAN_SCAN_TIMEOUT_SECS",
                        value,
                        reason: e.to_string(),
                    })
                }
            },
        };

        Ok(Self {
            bind_address: get_or("VULNSCAN_BIND_ADDRESS", "0.0.0.0:8000"),
            database_url: get_or("VULNSCAN_DATABASE_URL", "sqlite://vulnscan.db"),
            modules_root: get_or("VULNSCAN_MODULES_ROOT", "./modules").into(),
            vulndb_dir: get_or("VULNSCAN_VULNDB_DIR", "./vulndb").into(),
            scanner: get_or("VULNSCAN_SCANNER", "govulncheck").into(),
            go: get_or("VULNSCAN_GO", "go").into(),
            scan_timeout,
            worker_version: get_or("VULNSCAN_WORKER_VERSION", env!("CARGO_PKG_VERSION")),
            sandbox_program: get("VULNSCAN_SANDBOX").map(PathBuf::from),
            sandbox_args: get("VULNSCAN_SANDBOX_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            build_dir: get("VULNSCAN_BUILD_DIR").map(PathBuf::from),
        })
    }
}
