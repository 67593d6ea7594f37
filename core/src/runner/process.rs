use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::error::ScanError;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

/// Best-effort peak memory measurement of a running process.
pub trait MemoryProbe: Send + Sync {
    /// Peak resident memory of `pid` so far, in kB, if it can be measured.
    fn sample(&self, pid: u32) -> Option<u64>;
}

impl<F> MemoryProbe for F
where
    F: Fn(u32) -> Option<u64> + Send + Sync,
{
    fn sample(&self, pid: u32) -> Option<u64> {
        self(pid)
    }
}

/// Measures nothing; reported peak memory stays zero.
pub struct NoMemoryProbe;

impl MemoryProbe for NoMemoryProbe {
    fn sample(&self, _pid: u32) -> Option<u64> {
        None
    }
}

/// Reads the high-water mark (`VmHWM`) from `/proc/<pid>/status`.
pub struct ProcStatusProbe;

impl MemoryProbe for ProcStatusProbe {
    fn sample(&self, pid: u32) -> Option<u64> {
        let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
        parse_vm_hwm(&status)
    }
}

fn parse_vm_hwm(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmHWM:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

pub fn default_memory_probe() -> Arc<dyn MemoryProbe> {
    if cfg!(target_os = "linux") {
        Arc::new(ProcStatusProbe)
    } else {
        Arc::new(NoMemoryProbe)
    }
}

/// Output of a process that ran to completion, successfully or not.
#[derive(Debug)]
pub struct Finished {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Timing and memory are known even when the run failed.
#[derive(Debug)]
pub struct ProcessRun {
    pub elapsed: Duration,
    pub peak_memory_kb: u64,
    pub result: Result<Finished, ScanError>,
}

async fn read_all<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Runs `command` to completion, capturing both pipes and sampling memory.
///
/// `timeout` bounds the whole run, draining the pipes included: a descendant
/// that keeps a pipe open past the deadline does not hold the caller up. On
/// expiry the child is killed and the run reports [`ScanError::Timeout`].
pub async fn run_process(mut command: Command, timeout: Duration, probe: &dyn MemoryProbe) -> ProcessRun {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let start = Instant::now();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ProcessRun {
                elapsed: start.elapsed(),
                peak_memory_kb: 0,
                result: Err(ScanError::Io(e)),
            }
        }
    };
    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let mut peak_memory_kb = 0u64;
    let finished = {
        let wait = async {
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = ticker.tick() => {
                        if let Some(kb) = pid.and_then(|pid| probe.sample(pid)) {
                            peak_memory_kb = peak_memory_kb.max(kb);
                        }
                    }
                    status = child.wait() => break status,
                }
            }
        };
        // Pipes drain while the child runs so a chatty child never blocks on a full pipe.
        let run = async { tokio::try_join!(wait, read_all(stdout), read_all(stderr)) };
        tokio::time::timeout(timeout, run).await
    };
    let elapsed = start.elapsed();

    let result = match finished {
        Ok(Ok((status, stdout, stderr))) => Ok(Finished {
            status,
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        }),
        Ok(Err(e)) => {
            kill(&mut child, pid).await;
            Err(ScanError::Io(e))
        }
        Err(_) => {
            kill(&mut child, pid).await;
            tracing::warn!(pid = ?pid, timeout = ?timeout, "process killed after timeout");
            Err(ScanError::Timeout(timeout))
        }
    };

    ProcessRun {
        elapsed,
        peak_memory_kb,
        result,
    }
}

async fn kill(child: &mut tokio::process::Child, pid: Option<u32>) {
    if let Err(e) = child.kill().await {
        tracing::debug!(pid = ?pid, "kill failed, process already gone: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vm_hwm() {
        let status = "Name:\tgovulncheck\nVmPeak:\t  900000 kB\nVmHWM:\t  123456 kB\nVmRSS:\t  100000 kB\n";
        assert_eq!(parse_vm_hwm(status), Some(123456));
        assert_eq!(parse_vm_hwm("Name:\tzombie\n"), None);
    }

    #[test]
    fn closures_are_probes() {
        let probe = |pid: u32| Some(u64::from(pid) * 2);
        assert_eq!(MemoryProbe::sample(&probe, 21), Some(42));
        assert_eq!(NoMemoryProbe.sample(1), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_both_pipes() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let run = run_process(cmd, Duration::from_secs(10), &NoMemoryProbe).await;
        let finished = run.result.unwrap();
        assert_eq!(finished.status.code(), Some(3));
        assert_eq!(finished.stdout, b"out\n");
        assert_eq!(finished.stderr, "err\n");
        assert_eq!(run.peak_memory_kb, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kills_on_timeout() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30");
        let started = Instant::now();
        let run = run_process(cmd, Duration::from_millis(200), &NoMemoryProbe).await;
        assert!(matches!(run.result, Err(ScanError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(run.elapsed >= Duration::from_millis(200));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deadline_covers_open_pipes() {
        // The shell exits at once; its background child keeps stdout open.
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 4 & exit 0");
        let started = Instant::now();
        let run = run_process(cmd, Duration::from_millis(500), &NoMemoryProbe).await;
        assert!(matches!(run.result, Err(ScanError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_is_sampled() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 0.3");
        let probe = |_pid: u32| Some(2048);
        let run = run_process(cmd, Duration::from_secs(10), &probe).await;
        assert!(run.result.is_ok());
        assert_eq!(run.peak_memory_kb, 2048);
    }

    #[tokio::test]
    async fn missing_program_is_io_error() {
        let cmd = Command::new("/definitely/not/a/real/program");
        let run = run_process(cmd, Duration::from_secs(1), &NoMemoryProbe).await;
        assert!(matches!(run.result, Err(ScanError::Io(_))));
    }
}
