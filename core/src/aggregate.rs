use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{categorize_stderr, ScanError};
use crate::normalize::normalize_findings;
use crate::protocol::Finding;
use crate::request::{ScanMode, ScanRequest};
use crate::runner::{CompareResponse, ScanStats};
use crate::sort_version::for_sorting;
use crate::work_version::WorkVersion;

pub use crate::normalize::Vuln;

/// One scan of one module version in one mode, as stored.
///
/// A row with a non-empty `error` never carries vulns. Rows are not updated
/// once written; a newer row supersedes an older one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub created_at: DateTime<Utc>,
    pub module_path: String,
    pub version: String,
    pub suffix: String,
    pub sort_version: String,
    pub imported_by: i64,
    pub error: String,
    pub error_category: String,
    pub commit_time: Option<DateTime<Utc>>,
    pub scan_seconds: f64,
    /// Only set for scans of a freshly built binary.
    pub build_seconds: Option<f64>,
    pub scan_memory: i64,
    pub scan_mode: String,
    /// Absent when the work version could not be computed.
    #[serde(flatten)]
    pub work_version: Option<WorkVersion>,
    pub vulns: Vec<Vuln>,
}

impl ScanResult {
    /// Records `err` and drops any vulns gathered so far.
    pub fn add_error(&mut self, err: &ScanError) {
        self.error = err.to_string();
        self.error_category = err.category().to_string();
        self.vulns.clear();
    }

    fn set_error_text(&mut self, error: &str, category: &str) {
        self.error = error.to_string();
        self.error_category = if category.is_empty() {
            categorize_stderr(error).to_string()
        } else {
            category.to_string()
        };
        self.vulns.clear();
    }

    pub fn is_consistent(&self) -> bool {
        self.error.is_empty() || self.vulns.is_empty()
    }
}

/// Inputs of one row.
pub struct AggregateInput<'a> {
    pub request: &'a ScanRequest,
    pub scan_mode: &'a str,
    pub stats: &'a ScanStats,
    pub outcome: Result<&'a [Finding], &'a ScanError>,
    pub work_version: Option<&'a WorkVersion>,
    pub commit_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

fn base_row(
    request: &ScanRequest,
    scan_mode: &str,
    stats: &ScanStats,
    work_version: Option<&WorkVersion>,
    commit_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
) -> ScanResult {
    ScanResult {
        created_at,
        module_path: request.target.module.clone(),
        version: request.target.version.clone(),
        suffix: request.target.suffix.clone(),
        sort_version: for_sorting(&request.target.version),
        imported_by: request.imported_by,
        error: String::new(),
        error_category: String::new(),
        commit_time,
        scan_seconds: stats.scan_seconds,
        build_seconds: stats.build_seconds,
        scan_memory: i64::try_from(stats.scan_memory).unwrap_or(i64::MAX),
        scan_mode: scan_mode.to_string(),
        work_version: work_version.cloned(),
        vulns: Vec::new(),
    }
}

/// Builds the row for one scan attempt.
pub fn aggregate(input: AggregateInput<'_>) -> ScanResult {
    let mut row = base_row(
        input.request,
        input.scan_mode,
        input.stats,
        input.work_version,
        input.commit_time,
        input.created_at,
    );

    match input.outcome {
        Ok(findings) => match normalize_findings(findings) {
            Ok(vulns) => row.vulns = vulns,
            Err(e) => {
                tracing::error!(module = %row.module_path, "dropping findings: {}", e);
                row.add_error(&e);
            }
        },
        Err(e) => row.add_error(e),
    }
    row
}

/// Two rows per compared package: `COMPARE - BINARY` and `COMPARE - SOURCE`.
///
/// The package import path goes into `suffix`. Source rows keep only called
/// vulns, which is what a binary scan can see. A pair error lands on both rows.
pub fn aggregate_comparison(
    request: &ScanRequest,
    response: &CompareResponse,
    work_version: Option<&WorkVersion>,
    commit_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
) -> Vec<ScanResult> {
    let mut rows = Vec::with_capacity(response.findings_for_mod.len() * 2);
    for (package, pair) in &response.findings_for_mod {
        let sides = [
            (ScanMode::Binary, &pair.binary_results),
            (ScanMode::Source, &pair.source_results),
        ];
        for (side, results) in sides {
            let mut row = base_row(
                request,
                ScanMode::compare_label(side),
                &results.stats,
                work_version,
                commit_time,
                created_at,
            );
            row.suffix = package.clone();
            if side == ScanMode::Source {
                row.build_seconds = None;
            }

            if !pair.error.is_empty() {
                row.set_error_text(&pair.error, &pair.error_category);
            } else {
                match normalize_findings(&results.findings) {
                    Ok(mut vulns) => {
                        if side == ScanMode::Source {
                            vulns.retain(|v| v.called);
                        }
                        row.vulns = vulns;
                    }
                    Err(e) => row.add_error(&e),
                }
            }
            rows.push(row);
        }
    }
    rows
}
