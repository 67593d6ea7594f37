// Runs the scanner once inside the sandbox and prints the outcome as a single
// JSON document on stdout.
//
//   vulnscan-sandbox <scanner> <mode> <pattern> <module_dir> <vulndb_dir>

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use vulnscan_core::runner::{ProcessExecutor, SandboxError, SandboxResponse, ScanExecutor, ScanInvocation};
use vulnscan_core::vulndb::VulnDb;
use vulnscan_core::ScanMode;

fn invocation(args: &[String], timeout: Duration) -> Result<ScanInvocation> {
    let [scanner, mode, pattern, module_dir, vulndb_dir] = args else {
        bail!("usage: vulnscan-sandbox <scanner> <mode> <pattern> <module_dir> <vulndb_dir>");
    };
    let mode: ScanMode = mode.parse().context("bad mode")?;
    if mode == ScanMode::Compare {
        bail!("compare mode runs two scans; invoke the helper once per side");
    }

    Ok(ScanInvocation {
        scanner: PathBuf::from(scanner),
        mode,
        pattern: pattern.clone(),
        module_dir: (!module_dir.is_empty()).then(|| PathBuf::from(module_dir)),
        vulndb: VulnDb::new(vulndb_dir),
        timeout,
    })
}

fn scan_timeout() -> Result<Duration> {
    match std::env::var("VULNSCAN_SCAN_TIMEOUT_SECS") {
        Ok(secs) => Ok(Duration::from_secs(
            secs.trim().parse().context("VULNSCAN_SCAN_TIMEOUT_SECS")?,
        )),
        Err(_) => Ok(Duration::from_secs(600)),
    }
}

fn print_error(err: &SandboxError) -> Result<()> {
    println!("{}", serde_json::to_string(err)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the response document; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "vulnscan_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = match scan_timeout().and_then(|timeout| invocation(&args, timeout)) {
        Ok(invocation) => invocation,
        Err(e) => return print_error(&SandboxError::new(format!("{:#}", e))),
    };

    let attempt = ProcessExecutor::default().execute(&invocation).await;
    match SandboxResponse::from_attempt(attempt) {
        (response, None) => println!("{}", serde_json::to_string(&response)?),
        (_, Some(e)) => print_error(&SandboxError::from_scan_error(&e))?,
    }
    Ok(())
}
