use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::error::{Result, ScanError};
use crate::runner::process::{run_process, NoMemoryProbe};

/// The Go toolchain used to report versions, list and build packages.
#[derive(Debug, Clone)]
pub struct Toolchain {
    go: PathBuf,
    timeout: Duration,
}

impl Toolchain {
    pub fn new(go: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            go: go.into(),
            timeout,
        }
    }

    /// `go env GOVERSION`, e.g. `go1.21.4`.
    pub async fn version(&self) -> Result<String> {
        let mut cmd = Command::new(&self.go);
        cmd.args(["env", "GOVERSION"]);
        let stdout = self.run(cmd, "go env").await?;
        let version = String::from_utf8_lossy(&stdout).trim().to_string();
        if version.is_empty() {
            return Err(ScanError::Toolchain("go env GOVERSION printed nothing".to_string()));
        }
        Ok(version)
    }

    /// Import paths of all main packages in the module rooted at `module_dir`.
    pub async fn main_packages(&self, module_dir: &Path) -> Result<Vec<String>> {
        let mut cmd = Command::new(&self.go);
        cmd.args(["list", "-f", r#"{{if eq .Name "main"}}{{.ImportPath}}{{end}}"#, "./..."])
            .current_dir(module_dir);
        let stdout = self.run(cmd, "go list").await.map_err(as_build_failure)?;
        Ok(String::from_utf8_lossy(&stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Builds `package` into `output`, returning how long the build took.
    pub async fn build(&self, module_dir: &Path, package: &str, output: &Path) -> Result<Duration> {
        let mut cmd = Command::new(&self.go);
        cmd.arg("build")
            .arg("-o")
            .arg(output)
            .arg(package)
            .current_dir(module_dir);

        let run = run_process(cmd, self.timeout, &NoMemoryProbe).await;
        let finished = run.result?;
        if !finished.status.success() {
            return Err(ScanError::Build {
                stderr: finished.stderr,
            });
        }
        tracing::debug!(package, elapsed = ?run.elapsed, "built binary");
        Ok(run.elapsed)
    }

    async fn run(&self, cmd: Command, what: &str) -> Result<Vec<u8>> {
        let run = run_process(cmd, self.timeout, &NoMemoryProbe).await;
        let finished = run.result.map_err(|e| match e {
            ScanError::Io(e) => ScanError::Toolchain(format!("{}: {}", what, e)),
            other => other,
        })?;
        if !finished.status.success() {
            return Err(ScanError::Toolchain(format!("{}: {}", what, finished.stderr.trim())));
        }
        Ok(finished.stdout)
    }
}

fn as_build_failure(err: ScanError) -> ScanError {
    match err {
        ScanError::Toolchain(stderr) => ScanError::Build { stderr },
        other => other,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_go(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("go");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn reports_version() {
        let dir = tempfile::tempdir().unwrap();
        let go = fake_go(dir.path(), "echo go1.21.4");
        let toolchain = Toolchain::new(go, Duration::from_secs(10));
        assert_eq!(toolchain.version().await.unwrap(), "go1.21.4");
    }

    #[tokio::test]
    async fn missing_go_is_a_toolchain_error() {
        let toolchain = Toolchain::new("/no/such/go", Duration::from_secs(10));
        assert!(matches!(toolchain.version().await, Err(ScanError::Toolchain(_))));
    }

    #[tokio::test]
    async fn lists_main_packages() {
        let dir = tempfile::tempdir().unwrap();
        let go = fake_go(dir.path(), "printf 'example.com/m/cmd/a\\n\\nexample.com/m/cmd/b\\n'");
        let toolchain = Toolchain::new(go, Duration::from_secs(10));
        let packages = toolchain.main_packages(dir.path()).await.unwrap();
        assert_eq!(packages, vec!["example.com/m/cmd/a", "example.com/m/cmd/b"]);
    }

    #[tokio::test]
    async fn failed_build_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let go = fake_go(dir.path(), "echo 'no Go files in /src' >&2; exit 1");
        let toolchain = Toolchain::new(go, Duration::from_secs(10));
        let err = toolchain
            .build(dir.path(), "./cmd/a", &dir.path().join("a"))
            .await
            .unwrap_err();
        match err {
            ScanError::Build { stderr } => assert!(stderr.contains("no Go files")),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
