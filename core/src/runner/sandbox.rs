// Scans executed behind an isolation boundary. The boundary itself is an
// external wrapper command; what crosses it is one JSON document on stdout.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::process::{run_process, MemoryProbe, NoMemoryProbe};
use super::{ScanAttempt, ScanExecutor, ScanInvocation, ScanStats};
use crate::error::{Result, ScanError};
use crate::protocol::Finding;

/// Raw scan output and statistics, as printed by the sandbox helper.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxResponse {
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub stats: ScanStats,
}

/// A document printed by the helper when the scan failed. Any document with
/// an `error` key is a failure, whatever the key holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxError {
    pub error: String,
    /// Set when the scanner itself exited unsuccessfully.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scanner_exit: Option<ScannerExit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerExit {
    pub status: Option<i32>,
    pub stderr: String,
}

impl SandboxError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            scanner_exit: None,
        }
    }

    pub fn from_scan_error(err: &ScanError) -> Self {
        let scanner_exit = match err {
            ScanError::ScannerExecution { status, stderr } => Some(ScannerExit {
                status: *status,
                stderr: stderr.clone(),
            }),
            _ => None,
        };
        Self {
            error: err.to_string(),
            scanner_exit,
        }
    }

    /// A scanner failure comes back exactly as a direct run reports it.
    pub fn into_scan_error(self) -> ScanError {
        match self.scanner_exit {
            Some(exit) => ScanError::ScannerExecution {
                status: exit.status,
                stderr: exit.stderr,
            },
            None if self.error.trim().is_empty() => {
                ScanError::Sandbox("helper reported a failure without a message".to_string())
            }
            None => ScanError::Sandbox(self.error),
        }
    }
}

fn check_error_document(output: &[u8]) -> Result<()> {
    let doc: serde_json::Value = serde_json::from_slice(output)
        .map_err(|e| ScanError::Sandbox(format!("unreadable sandbox response: {}", e)))?;
    if doc.get("error").is_none() {
        return Ok(());
    }
    let err: SandboxError = serde_json::from_value(doc)
        .map_err(|e| ScanError::Sandbox(format!("unreadable sandbox error: {}", e)))?;
    Err(err.into_scan_error())
}

impl SandboxResponse {
    /// Parses helper output; an `{"error": ...}` document becomes an error.
    pub fn from_bytes(output: &[u8]) -> Result<Self> {
        check_error_document(output)?;
        serde_json::from_slice(output)
            .map_err(|e| ScanError::Sandbox(format!("unreadable sandbox response: {}", e)))
    }

    pub fn from_attempt(attempt: ScanAttempt) -> (Self, Option<ScanError>) {
        match attempt.outcome {
            Ok(findings) => (
                Self {
                    findings,
                    stats: attempt.stats,
                },
                None,
            ),
            Err(e) => (
                Self {
                    findings: Vec::new(),
                    stats: attempt.stats,
                },
                Some(e),
            ),
        }
    }
}

/// Binary and source results for one main package.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComparePair {
    pub binary_results: SandboxResponse,
    pub source_results: SandboxResponse,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_category: String,
}

impl ComparePair {
    /// Pairs two attempts, recording whichever side failed in `error`.
    pub fn from_attempts(binary: ScanAttempt, source: ScanAttempt) -> Self {
        let (binary_results, binary_err) = SandboxResponse::from_attempt(binary);
        let (source_results, source_err) = SandboxResponse::from_attempt(source);

        let mut errors = Vec::new();
        let mut category = None;
        for (side, err) in [("binary", binary_err), ("source", source_err)] {
            if let Some(err) = err {
                category.get_or_insert(err.category());
                errors.push(format!("{}: {}", side, err));
            }
        }

        Self {
            binary_results,
            source_results,
            error: errors.join("; "),
            error_category: category.map(|c| c.to_string()).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompareResponse {
    /// Keyed by import path of the main package.
    pub findings_for_mod: BTreeMap<String, ComparePair>,
}

impl CompareResponse {
    pub fn from_bytes(output: &[u8]) -> Result<Self> {
        check_error_document(output)?;
        serde_json::from_slice(output)
            .map_err(|e| ScanError::Sandbox(format!("unreadable compare response: {}", e)))
    }
}

/// Runs the helper through a wrapper command (for example a container
/// runtime) and reads a [`SandboxResponse`] from its stdout.
///
/// The helper is invoked as
/// `<program> <args...> <scanner> <mode> <pattern> <module_dir> <vulndb_dir>`.
pub struct SandboxExecutor {
    program: PathBuf,
    args: Vec<String>,
    probe: Arc<dyn MemoryProbe>,
}

impl SandboxExecutor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            probe: Arc::new(NoMemoryProbe),
        }
    }
}

#[async_trait]
impl ScanExecutor for SandboxExecutor {
    fn name(&self) -> &str {
        "sandbox"
    }

    async fn execute(&self, invocation: &ScanInvocation) -> ScanAttempt {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&invocation.scanner)
            .arg(invocation.mode.flag().unwrap_or("source"))
            .arg(&invocation.pattern)
            .arg(invocation.module_dir.as_deref().unwrap_or_else(|| std::path::Path::new("")))
            .arg(invocation.vulndb.dir());

        let run = run_process(cmd, invocation.timeout, self.probe.as_ref()).await;
        let outer_stats = ScanStats {
            scan_seconds: run.elapsed.as_secs_f64(),
            scan_memory: run.peak_memory_kb,
            build_seconds: None,
        };

        let finished = match run.result {
            Ok(finished) => finished,
            Err(e) => return ScanAttempt::failed(outer_stats, e),
        };
        if !finished.status.success() {
            return ScanAttempt::failed(
                outer_stats,
                ScanError::Sandbox(format!("sandbox exited with {}: {}", finished.status, finished.stderr.trim())),
            );
        }

        match SandboxResponse::from_bytes(&finished.stdout) {
            Ok(response) => ScanAttempt {
                stats: response.stats,
                outcome: Ok(response.findings),
            },
            Err(e) => ScanAttempt::failed(outer_stats, e),
        }
    }
}
