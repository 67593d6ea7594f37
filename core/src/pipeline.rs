use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::aggregate::{aggregate, aggregate_comparison, AggregateInput, ScanResult};
use crate::error::ScanError;
use crate::request::{ModuleUrlPath, ScanMode, ScanRequest};
use crate::runner::{ScanAttempt, ScanRunner, ScanStats};
use crate::store::{ResultStore, StoreError};
use crate::work_version::{WorkVersion, WorkVersionTracker};

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PipelineOutcome {
    /// A stored result is still valid.
    Skipped,
    /// The module was scanned; `persisted` is false for serve requests.
    Scanned { rows: Vec<ScanResult>, persisted: bool },
}

/// Module version metadata in module proxy `.info` format.
#[derive(Deserialize)]
struct ModuleInfo {
    #[serde(rename = "Time")]
    time: Option<DateTime<Utc>>,
}

/// Runs one scan request start to finish: work-version check, scan,
/// aggregation, persistence.
///
/// Per-scan failures end up in rows; only store failures are returned.
pub struct ScanPipeline {
    store: Arc<dyn ResultStore>,
    tracker: WorkVersionTracker,
    runner: ScanRunner,
    modules_root: PathBuf,
}

impl ScanPipeline {
    pub fn new(
        store: Arc<dyn ResultStore>,
        tracker: WorkVersionTracker,
        runner: ScanRunner,
        modules_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            tracker,
            runner,
            modules_root: modules_root.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub fn tracker(&self) -> &WorkVersionTracker {
        &self.tracker
    }

    /// `<modules_root>/<module>@<version>`
    pub fn module_dir(&self, target: &ModuleUrlPath) -> PathBuf {
        self.modules_root.join(format!("{}@{}", target.module, target.version))
    }

    pub async fn scan(&self, request: &ScanRequest) -> Result<PipelineOutcome, StoreError> {
        let name = request.name();
        let current = match self.tracker.compute_current().await {
            Ok(wv) => Some(wv),
            Err(e) => {
                tracing::warn!(module = %name, "cannot compute work version, scanning anyway: {}", e);
                None
            }
        };

        if !request.serve && self.tracker.should_skip(&request.target, current.as_ref()).await? {
            tracing::info!(module = %name, "skipping scan");
            return Ok(PipelineOutcome::Skipped);
        }

        let created_at = Utc::now();
        let rows = self.scan_rows(request, current.as_ref(), created_at).await;

        if !request.serve {
            for row in &rows {
                self.store.insert(row).await?;
            }
        }
        tracing::info!(
            module = %name,
            mode = %request.mode,
            rows = rows.len(),
            persisted = !request.serve,
            "scan complete"
        );
        Ok(PipelineOutcome::Scanned {
            rows,
            persisted: !request.serve,
        })
    }

    async fn scan_rows(
        &self,
        request: &ScanRequest,
        work_version: Option<&WorkVersion>,
        created_at: DateTime<Utc>,
    ) -> Vec<ScanResult> {
        let dir = self.module_dir(&request.target);
        let row_for = |mode_label: &str, attempt: &ScanAttempt, commit_time| {
            aggregate(AggregateInput {
                request,
                scan_mode: mode_label,
                stats: &attempt.stats,
                outcome: attempt.outcome.as_ref().map(Vec::as_slice),
                work_version,
                commit_time,
                created_at,
            })
        };

        if !is_dir(&dir).await {
            let attempt = ScanAttempt::failed(
                ScanStats::default(),
                ScanError::ModuleNotFound(format!("{} (looked in {})", request.name(), dir.display())),
            );
            return vec![row_for(request.mode.label(), &attempt, None)];
        }
        let commit_time = self.commit_time(&request.target).await;
        let suffix = request.target.suffix.trim_matches('/');

        match request.mode {
            ScanMode::Source => {
                let pattern = if suffix.is_empty() {
                    "./...".to_string()
                } else {
                    format!("./{}/...", suffix)
                };
                let attempt = self
                    .runner
                    .run(ScanMode::Source, &pattern, Some(&dir), request.insecure)
                    .await;
                vec![row_for(ScanMode::Source.label(), &attempt, commit_time)]
            }
            ScanMode::Binary => {
                let package = if suffix.is_empty() {
                    ".".to_string()
                } else {
                    format!("./{}", suffix)
                };
                let attempt = self.runner.run_binary(&dir, &package, request.insecure).await;
                vec![row_for(ScanMode::Binary.label(), &attempt, commit_time)]
            }
            ScanMode::Compare => match self.runner.compare(&dir, request.insecure).await {
                Ok(response) => aggregate_comparison(request, &response, work_version, commit_time, created_at),
                Err(e) => {
                    let attempt = ScanAttempt::failed(ScanStats::default(), e);
                    vec![row_for(ScanMode::Compare.label(), &attempt, commit_time)]
                }
            },
        }
    }

    /// Commit time from `<modules_root>/<module>@<version>.info`, if present.
    async fn commit_time(&self, target: &ModuleUrlPath) -> Option<DateTime<Utc>> {
        let path = self
            .modules_root
            .join(format!("{}@{}.info", target.module, target.version));
        let content = tokio::fs::read(&path).await.ok()?;
        match serde_json::from_slice::<ModuleInfo>(&content) {
            Ok(info) => info.time,
            Err(e) => {
                tracing::warn!(path = %path.display(), "unreadable module info: {}", e);
                None
            }
        }
    }
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}
