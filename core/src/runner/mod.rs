// Runner module - 扫描执行模块
// 调用外部扫描器，采集耗时与内存，并把输出交给协议解码器

pub mod process;
pub mod sandbox;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::ScanError;
use crate::protocol::{decode_stream, Finding, FindingCollector};
use crate::request::ScanMode;
use crate::toolchain::Toolchain;
use crate::vulndb::VulnDb;

pub use process::{default_memory_probe, MemoryProbe, NoMemoryProbe, ProcStatusProbe};
pub use sandbox::{ComparePair, CompareResponse, SandboxError, SandboxExecutor, SandboxResponse};

/// Monitoring information for one scanner run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanStats {
    /// Wall-clock time of the scan, in seconds.
    pub scan_seconds: f64,
    /// Peak memory of the scanner, in kB; 0 where it cannot be measured.
    pub scan_memory: u64,
    /// Time spent building the binary before a binary-mode scan.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_seconds: Option<f64>,
}

/// Everything needed to start the scanner once.
#[derive(Debug, Clone)]
pub struct ScanInvocation {
    pub scanner: PathBuf,
    pub mode: ScanMode,
    pub pattern: String,
    pub module_dir: Option<PathBuf>,
    pub vulndb: VulnDb,
    pub timeout: Duration,
}

impl ScanInvocation {
    /// `-mode <flag> -json -db <uri> [-C <dir>] <pattern>`
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-mode".into(),
            self.mode.flag().unwrap_or("source").into(),
            "-json".into(),
            "-db".into(),
            self.vulndb.uri().into(),
        ];
        if let Some(dir) = &self.module_dir {
            args.push("-C".into());
            args.push(dir.clone().into_os_string());
        }
        args.push(self.pattern.clone().into());
        args
    }
}

/// Stats are kept whether or not the scan succeeded.
#[derive(Debug)]
pub struct ScanAttempt {
    pub stats: ScanStats,
    pub outcome: Result<Vec<Finding>, ScanError>,
}

impl ScanAttempt {
    pub fn failed(stats: ScanStats, err: ScanError) -> Self {
        Self {
            stats,
            outcome: Err(err),
        }
    }
}

/// Something that can run one scanner invocation.
#[async_trait]
pub trait ScanExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, invocation: &ScanInvocation) -> ScanAttempt;
}

/// Runs the scanner directly as a child process.
pub struct ProcessExecutor {
    probe: Arc<dyn MemoryProbe>,
}

impl ProcessExecutor {
    pub fn new(probe: Arc<dyn MemoryProbe>) -> Self {
        Self { probe }
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(default_memory_probe())
    }
}

#[async_trait]
impl ScanExecutor for ProcessExecutor {
    fn name(&self) -> &str {
        "process"
    }

    async fn execute(&self, invocation: &ScanInvocation) -> ScanAttempt {
        let mut cmd = Command::new(&invocation.scanner);
        cmd.args(invocation.args());

        let run = process::run_process(cmd, invocation.timeout, self.probe.as_ref()).await;
        let stats = ScanStats {
            scan_seconds: run.elapsed.as_secs_f64(),
            scan_memory: run.peak_memory_kb,
            build_seconds: None,
        };

        let finished = match run.result {
            Ok(finished) => finished,
            Err(e) => return ScanAttempt::failed(stats, e),
        };

        // Output of a failed scanner is never parsed.
        if !finished.status.success() {
            return ScanAttempt::failed(
                stats,
                ScanError::ScannerExecution {
                    status: finished.status.code(),
                    stderr: finished.stderr,
                },
            );
        }

        let mut collector = FindingCollector::new();
        let outcome = decode_stream(finished.stdout.as_slice(), &mut collector)
            .map(|()| collector.into_findings())
            .map_err(ScanError::from);

        ScanAttempt { stats, outcome }
    }
}

/// Runs scans of one module in source, binary or compare mode.
pub struct ScanRunner {
    scanner: PathBuf,
    vulndb: VulnDb,
    toolchain: Toolchain,
    timeout: Duration,
    build_root: Option<PathBuf>,
    direct: Arc<dyn ScanExecutor>,
    sandbox: Option<Arc<dyn ScanExecutor>>,
}

impl ScanRunner {
    pub fn new(scanner: impl Into<PathBuf>, vulndb: VulnDb, toolchain: Toolchain, timeout: Duration) -> Self {
        Self {
            scanner: scanner.into(),
            vulndb,
            toolchain,
            timeout,
            build_root: None,
            direct: Arc::new(ProcessExecutor::default()),
            sandbox: None,
        }
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.direct = Arc::new(ProcessExecutor::new(probe));
        self
    }

    pub fn with_direct_executor(mut self, executor: Arc<dyn ScanExecutor>) -> Self {
        self.direct = executor;
        self
    }

    pub fn with_sandbox(mut self, executor: Arc<dyn ScanExecutor>) -> Self {
        self.sandbox = Some(executor);
        self
    }

    /// Directory that binary builds go to, instead of the system temp dir.
    /// A sandbox must be able to see it.
    pub fn with_build_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.build_root = Some(dir.into());
        self
    }

    pub fn vulndb(&self) -> &VulnDb {
        &self.vulndb
    }

    fn executor(&self, insecure: bool) -> &dyn ScanExecutor {
        match (&self.sandbox, insecure) {
            (Some(sandbox), false) => sandbox.as_ref(),
            (None, false) => {
                tracing::warn!("no sandbox configured, running scanner directly");
                self.direct.as_ref()
            }
            (_, true) => self.direct.as_ref(),
        }
    }

    /// Runs one scan of `pattern` in source or binary mode.
    pub async fn run(&self, mode: ScanMode, pattern: &str, module_dir: Option<&Path>, insecure: bool) -> ScanAttempt {
        if mode == ScanMode::Compare {
            return ScanAttempt::failed(
                ScanStats::default(),
                ScanError::InvariantViolation("compare mode is not a single scan".to_string()),
            );
        }

        let invocation = ScanInvocation {
            scanner: self.scanner.clone(),
            mode,
            pattern: pattern.to_string(),
            module_dir: module_dir.map(Path::to_path_buf),
            vulndb: self.vulndb.clone(),
            timeout: self.timeout,
        };

        let executor = self.executor(insecure);
        tracing::info!(executor = executor.name(), mode = %mode, pattern, "running scanner");
        let attempt = executor.execute(&invocation).await;
        match &attempt.outcome {
            Ok(findings) => tracing::info!(
                findings = findings.len(),
                seconds = attempt.stats.scan_seconds,
                memory_kb = attempt.stats.scan_memory,
                "scan finished"
            ),
            Err(e) => tracing::warn!(category = %e.category(), "scan failed: {}", e),
        }
        attempt
    }

    /// Builds `package` from `module_dir` on the host, then scans the binary.
    ///
    /// The binary lands in a fresh directory under the build dir (see
    /// [`ScanRunner::with_build_dir`]); a sandboxed scan reads it from there.
    pub async fn run_binary(&self, module_dir: &Path, package: &str, insecure: bool) -> ScanAttempt {
        let mut builder = tempfile::Builder::new();
        builder.prefix("vulnscan-bin");
        let out_dir = match &self.build_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        };
        let out_dir = match out_dir {
            Ok(dir) => dir,
            Err(e) => return ScanAttempt::failed(ScanStats::default(), e.into()),
        };
        let name = package.rsplit('/').find(|s| !s.is_empty() && *s != ".").unwrap_or("main");
        let binary = out_dir.path().join(name);

        let build_time = match self.toolchain.build(module_dir, package, &binary).await {
            Ok(elapsed) => elapsed,
            Err(e) => return ScanAttempt::failed(ScanStats::default(), e),
        };

        let mut attempt = self
            .run(ScanMode::Binary, &binary.to_string_lossy(), None, insecure)
            .await;
        attempt.stats.build_seconds = Some(build_time.as_secs_f64());
        attempt
    }

    /// Scans every main package of the module both ways.
    pub async fn compare(&self, module_dir: &Path, insecure: bool) -> Result<CompareResponse, ScanError> {
        let packages = self.toolchain.main_packages(module_dir).await?;
        if packages.is_empty() {
            return Err(ScanError::Build {
                stderr: "module has no main packages".to_string(),
            });
        }

        let mut response = CompareResponse::default();
        for package in packages {
            let binary = self.run_binary(module_dir, &package, insecure).await;
            let source = self.run(ScanMode::Source, &package, Some(module_dir), insecure).await;
            let pair = ComparePair::from_attempts(binary, source);
            if !pair.error.is_empty() {
                tracing::warn!(package = %package, "comparison incomplete: {}", pair.error);
            }
            response.findings_for_mod.insert(package, pair);
        }
        Ok(response)
    }
}
