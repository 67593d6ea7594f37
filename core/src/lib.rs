// vulnscan Core Library
// 扫描结果流水线：协议解码、漏洞归一化、工作版本比对、扫描执行与结果聚合

pub mod aggregate;
pub mod normalize;
pub mod pipeline;
pub mod protocol;
pub mod request;
pub mod runner;
pub mod sort_version;
pub mod store;
pub mod toolchain;
pub mod vulndb;
pub mod work_version;

// 重新导出常用类型
pub use aggregate::{aggregate, aggregate_comparison, AggregateInput, ScanResult, Vuln};
pub use normalize::{normalize_finding, normalize_findings};
pub use pipeline::{PipelineOutcome, ScanPipeline};
pub use protocol::{decode_stream, Finding, Frame, Message, MessageDecoder, MessageHandler};
pub use request::{ModuleUrlPath, QueryParams, ScanMode, ScanRequest};
pub use runner::{ScanAttempt, ScanRunner, ScanStats};
pub use store::{ResultStore, SqliteResultStore, WorkState};
pub use work_version::{should_skip, SchemaVersion, WorkVersion, WorkVersionTracker};

pub mod error {
    use std::sync::OnceLock;
    use std::time::Duration;

    use regex::Regex;
    use serde::{Deserialize, Serialize};
    use thiserror::Error;

    use crate::protocol::ProtocolError;

    #[derive(Error, Debug)]
    pub enum ScanError {
        #[error("{0}")]
        Protocol(#[from] ProtocolError),

        /// The scanner exited unsuccessfully. The message is its trimmed
        /// stderr, or the exit status when stderr is empty.
        #[error("{}", scanner_exit_message(.status, .stderr))]
        ScannerExecution { status: Option<i32>, stderr: String },

        #[error("scan timed out after {0:?}")]
        Timeout(Duration),

        #[error("invariant violation: {0}")]
        InvariantViolation(String),

        #[error("build failed: {stderr}")]
        Build { stderr: String },

        #[error("sandbox error: {0}")]
        Sandbox(String),

        #[error("toolchain error: {0}")]
        Toolchain(String),

        #[error("vulnerability database error: {0}")]
        VulnDb(String),

        #[error("module not found: {0}")]
        ModuleNotFound(String),

        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),
    }

    pub type Result<T> = std::result::Result<T, ScanError>;

    fn scanner_exit_message(status: &Option<i32>, stderr: &str) -> String {
        let stderr = stderr.trim();
        match status {
            _ if !stderr.is_empty() => stderr.to_string(),
            Some(code) => format!("scanner exited with status {}", code),
            None => "scanner was terminated by a signal".to_string(),
        }
    }

    /// Coarse classification of a failed scan, stored next to the error text.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum ErrorCategory {
        Timeout,
        BuildFailure,
        ScannerPanic,
        ScannerFailure,
        MemoryLimit,
        TooManyOpenFiles,
        MalformedOutput,
        Vulndb,
        Toolchain,
        ModuleNotFound,
        Sandbox,
        Invariant,
        Io,
    }

    impl ErrorCategory {
        pub const ALL: [ErrorCategory; 13] = [
            ErrorCategory::Timeout,
            ErrorCategory::BuildFailure,
            ErrorCategory::ScannerPanic,
            ErrorCategory::ScannerFailure,
            ErrorCategory::MemoryLimit,
            ErrorCategory::TooManyOpenFiles,
            ErrorCategory::MalformedOutput,
            ErrorCategory::Vulndb,
            ErrorCategory::Toolchain,
            ErrorCategory::ModuleNotFound,
            ErrorCategory::Sandbox,
            ErrorCategory::Invariant,
            ErrorCategory::Io,
        ];

        pub fn as_str(&self) -> &'static str {
            match self {
                ErrorCategory::Timeout => "timeout",
                ErrorCategory::BuildFailure => "build-failure",
                ErrorCategory::ScannerPanic => "scanner-panic",
                ErrorCategory::ScannerFailure => "scanner-failure",
                ErrorCategory::MemoryLimit => "memory-limit",
                ErrorCategory::TooManyOpenFiles => "too-many-open-files",
                ErrorCategory::MalformedOutput => "malformed-output",
                ErrorCategory::Vulndb => "vulndb",
                ErrorCategory::Toolchain => "toolchain",
                ErrorCategory::ModuleNotFound => "module-not-found",
                ErrorCategory::Sandbox => "sandbox",
                ErrorCategory::Invariant => "invariant",
                ErrorCategory::Io => "io",
            }
        }

        pub fn parse(s: &str) -> Option<ErrorCategory> {
            Self::ALL.into_iter().find(|c| c.as_str() == s)
        }

        /// Failures that may go away on their own; a row carrying one of
        /// these never suppresses a rescan.
        pub fn is_retryable(&self) -> bool {
            matches!(
                self,
                ErrorCategory::Timeout
                    | ErrorCategory::MemoryLimit
                    | ErrorCategory::TooManyOpenFiles
                    | ErrorCategory::Io
                    | ErrorCategory::Sandbox
                    | ErrorCategory::Vulndb
            )
        }
    }

    impl std::fmt::Display for ErrorCategory {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// Returns true if a stored category string should force a rescan.
    /// Unknown categories are treated as retryable.
    pub fn is_retryable_category(category: &str) -> bool {
        if category.is_empty() {
            return false;
        }
        ErrorCategory::parse(category).map_or(true, |c| c.is_retryable())
    }

    // Ordered: the first matching pattern wins.
    fn stderr_patterns() -> &'static [(Regex, ErrorCategory)] {
        static PATTERNS: OnceLock<Vec<(Regex, ErrorCategory)>> = OnceLock::new();
        PATTERNS.get_or_init(|| {
            let table = [
                (r"(?m)^panic:|goroutine \d+ \[running\]", ErrorCategory::ScannerPanic),
                (r"(?i)too many open files", ErrorCategory::TooManyOpenFiles),
                (r"(?i)timed out|deadline exceeded", ErrorCategory::Timeout),
                (
                    r"(?i)out of memory|cannot allocate memory|signal: killed",
                    ErrorCategory::MemoryLimit,
                ),
                (
                    r"(?i)go\.mod|go\.sum|no go files|cannot find (main )?module|build constraints exclude|could not import|packages contain errors",
                    ErrorCategory::BuildFailure,
                ),
                (r"(?i)\b(db|database|vulndb|vuln\.go\.dev)\b", ErrorCategory::Vulndb),
            ];
            table
                .into_iter()
                .filter_map(|(pattern, category)| match Regex::new(pattern) {
                    Ok(re) => Some((re, category)),
                    Err(e) => {
                        tracing::error!("invalid stderr pattern {}: {}", pattern, e);
                        None
                    }
                })
                .collect()
        })
    }

    /// Classifies scanner stderr text.
    pub fn categorize_stderr(stderr: &str) -> ErrorCategory {
        stderr_patterns()
            .iter()
            .find(|(re, _)| re.is_match(stderr))
            .map(|(_, category)| *category)
            .unwrap_or(ErrorCategory::ScannerFailure)
    }

    impl ScanError {
        pub fn category(&self) -> ErrorCategory {
            match self {
                ScanError::Protocol(_) => ErrorCategory::MalformedOutput,
                ScanError::ScannerExecution { status: None, stderr } if stderr.trim().is_empty() => {
                    // Terminated by a signal without saying anything, most often the OOM killer.
                    ErrorCategory::MemoryLimit
                }
                ScanError::ScannerExecution { stderr, .. } => categorize_stderr(stderr),
                ScanError::Timeout(_) => ErrorCategory::Timeout,
                ScanError::InvariantViolation(_) => ErrorCategory::Invariant,
                ScanError::Build { stderr } => match categorize_stderr(stderr) {
                    ErrorCategory::MemoryLimit => ErrorCategory::MemoryLimit,
                    ErrorCategory::TooManyOpenFiles => ErrorCategory::TooManyOpenFiles,
                    _ => ErrorCategory::BuildFailure,
                },
                // The helper forwards the inner failure as text.
                ScanError::Sandbox(message) => match categorize_stderr(message) {
                    ErrorCategory::ScannerFailure => ErrorCategory::Sandbox,
                    category => category,
                },
                ScanError::Toolchain(_) => ErrorCategory::Toolchain,
                ScanError::VulnDb(_) => ErrorCategory::Vulndb,
                ScanError::ModuleNotFound(_) => ErrorCategory::ModuleNotFound,
                ScanError::Io(_) => ErrorCategory::Io,
            }
        }
    }

}
