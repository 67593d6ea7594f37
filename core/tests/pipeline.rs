#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use vulnscan_core::store::ResultStore;
use vulnscan_core::toolchain::Toolchain;
use vulnscan_core::vulndb::VulnDb;
use vulnscan_core::{
    PipelineOutcome, QueryParams, ScanMode, ScanPipeline, ScanRequest, ScanRunner, SchemaVersion,
    SqliteResultStore, WorkVersionTracker,
};

const FINDINGS: &str = r#"{"config":{"protocol_version":"v0.1.0","scanner_name":"govulncheck"}}
{"progress":{"message":"Scanning your code"}}
{"osv":{"id":"GO-2023-0001","summary":"bad parse"}}
{"finding":{"osv":"GO-2023-0001","trace":[{"module":"example.com/dep","version":"v1.0.0","package":"example.com/dep/parse","function":"Parse"},{"module":"example.com/m","package":"example.com/m","function":"main"}]}}
{"finding":{"osv":"GO-2023-0002","trace":[{"module":"example.com/dep","version":"v1.0.0","package":"example.com/dep/util"}]}}
"#;

// `go build -o <out> <package>` records the package and writes a stub binary.
const GO: &str = r#"case "$1" in
env) echo go1.21.4 ;;
list) printf 'example.com/m/cmd/a\nexample.com/m/cmd/b\n' ;;
build) echo "$4" >> "$(dirname "$0")/built"; printf '#!/bin/sh\n' > "$3" ;;
*) exit 1 ;;
esac"#;

struct Fixture {
    dir: TempDir,
    store: Arc<SqliteResultStore>,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("vulndb/index")).unwrap();
        std::fs::write(
            root.join("vulndb/index/db.json"),
            r#"{"modified":"2023-06-01T12:00:00Z"}"#,
        )
        .unwrap();
        std::fs::create_dir_all(root.join("modules/example.com/m@v1.2.0")).unwrap();
        std::fs::write(
            root.join("modules/example.com/m@v1.2.0.info"),
            r#"{"Version":"v1.2.0","Time":"2023-03-04T05:06:07Z"}"#,
        )
        .unwrap();
        script(&root.join("bin/go"), GO);

        Self {
            dir,
            store: Arc::new(SqliteResultStore::in_memory().await.unwrap()),
        }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn scanner(&self, body: &str) -> PathBuf {
        let path = self.root().join("bin/govulncheck");
        script(&path, body);
        path
    }

    fn pipeline(&self, scanner: PathBuf, worker_version: &str) -> ScanPipeline {
        let root = self.root();
        let toolchain = Toolchain::new(root.join("bin/go"), Duration::from_secs(10));
        let vulndb = VulnDb::new(root.join("vulndb"));
        let tracker = WorkVersionTracker::new(
            self.store.clone(),
            toolchain.clone(),
            vulndb.clone(),
            worker_version,
            SchemaVersion::of_result_schema(),
        );
        let runner = ScanRunner::new(scanner, vulndb, toolchain, Duration::from_secs(10));
        ScanPipeline::new(self.store.clone(), tracker, runner, root.join("modules"))
    }
}

fn script(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn request(path: &str, mut query: QueryParams) -> ScanRequest {
    query.imported_by.get_or_insert(0);
    ScanRequest::parse(path, query).unwrap()
}

fn source_scanner() -> String {
    format!("cat <<'EOF'\n{}EOF", FINDINGS)
}

#[tokio::test]
async fn source_scan_is_stored() {
    let fixture = Fixture::new().await;
    let pipeline = fixture.pipeline(fixture.scanner(&source_scanner()), "0.1.0");
    let req = request(
        "/example.com/m/@v/v1.2.0",
        QueryParams {
            imported_by: Some(7),
            insecure: true,
            ..Default::default()
        },
    );

    let rows = match pipeline.scan(&req).await.unwrap() {
        PipelineOutcome::Scanned { rows, persisted } => {
            assert!(persisted);
            rows
        }
        PipelineOutcome::Skipped => panic!("nothing stored yet, must not skip"),
    };
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.scan_mode, "SOURCE");
    assert_eq!(row.imported_by, 7);
    assert!(row.error.is_empty(), "unexpected error {}", row.error);
    assert_eq!(row.vulns.len(), 2);
    assert_eq!(row.vulns[0].id, "GO-2023-0001");
    assert_eq!(row.vulns[0].package_path, "example.com/dep/parse");
    assert_eq!(row.commit_time.unwrap().to_rfc3339(), "2023-03-04T05:06:07+00:00");

    let wv = row.work_version.as_ref().unwrap();
    assert_eq!(wv.toolchain_version, "go1.21.4");
    assert_eq!(wv.worker_version, "0.1.0");

    let stored = fixture
        .store
        .latest("example.com/m", "v1.2.0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.vulns.len(), 2);
    assert_eq!(stored.work_version, row.work_version);
}

#[tokio::test]
async fn unchanged_work_version_skips_until_worker_changes() {
    let fixture = Fixture::new().await;
    let req = request(
        "/example.com/m@v1.2.0",
        QueryParams {
            insecure: true,
            ..Default::default()
        },
    );

    let first = fixture.pipeline(fixture.scanner(&source_scanner()), "0.1.0");
    assert!(matches!(first.scan(&req).await.unwrap(), PipelineOutcome::Scanned { .. }));
    assert!(matches!(first.scan(&req).await.unwrap(), PipelineOutcome::Skipped));

    let upgraded = fixture.pipeline(fixture.scanner(&source_scanner()), "0.2.0");
    assert!(matches!(upgraded.scan(&req).await.unwrap(), PipelineOutcome::Scanned { .. }));
}

#[tokio::test]
async fn serve_requests_never_skip_or_store() {
    let fixture = Fixture::new().await;
    let pipeline = fixture.pipeline(fixture.scanner(&source_scanner()), "0.1.0");
    let stored = request(
        "/example.com/m@v1.2.0",
        QueryParams {
            insecure: true,
            ..Default::default()
        },
    );
    pipeline.scan(&stored).await.unwrap();

    let served = request(
        "/example.com/m@v1.2.0",
        QueryParams {
            insecure: true,
            serve: true,
            ..Default::default()
        },
    );
    match pipeline.scan(&served).await.unwrap() {
        PipelineOutcome::Scanned { rows, persisted } => {
            assert!(!persisted);
            assert_eq!(rows.len(), 1);
        }
        PipelineOutcome::Skipped => panic!("serve requests always scan"),
    }
}

#[tokio::test]
async fn scanner_failure_is_recorded_and_retried() {
    let fixture = Fixture::new().await;
    let pipeline = fixture.pipeline(
        fixture.scanner("echo 'fetching vulndb: db unreachable' >&2; exit 1"),
        "0.1.0",
    );
    let req = request(
        "/example.com/m@v1.2.0",
        QueryParams {
            insecure: true,
            ..Default::default()
        },
    );

    pipeline.scan(&req).await.unwrap();
    let stored = fixture
        .store
        .latest("example.com/m", "v1.2.0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.error, "fetching vulndb: db unreachable");
    assert_eq!(stored.error_category, "vulndb");
    assert!(stored.vulns.is_empty());

    // vulndb failures are retryable, so the same work version rescans.
    assert!(matches!(pipeline.scan(&req).await.unwrap(), PipelineOutcome::Scanned { .. }));
}

#[tokio::test]
async fn binary_scan_builds_the_requested_package() {
    let fixture = Fixture::new().await;
    let pipeline = fixture.pipeline(fixture.scanner(&source_scanner()), "0.1.0");
    let req = request(
        "/example.com/m@v1.2.0/cmd/tool",
        QueryParams {
            mode: ScanMode::Binary,
            insecure: true,
            ..Default::default()
        },
    );

    let rows = match pipeline.scan(&req).await.unwrap() {
        PipelineOutcome::Scanned { rows, .. } => rows,
        PipelineOutcome::Skipped => panic!("nothing stored yet, must not skip"),
    };
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.scan_mode, "BINARY");
    assert_eq!(row.suffix, "cmd/tool");
    assert!(row.error.is_empty(), "unexpected error {}", row.error);
    assert!(row.build_seconds.is_some());
    assert_eq!(row.vulns.len(), 2);

    let built = std::fs::read_to_string(fixture.root().join("bin/built")).unwrap();
    assert_eq!(built.trim(), "./cmd/tool");
}

#[tokio::test]
async fn compare_scan_stores_both_sides_per_package() {
    let fixture = Fixture::new().await;
    let pipeline = fixture.pipeline(fixture.scanner(&source_scanner()), "0.1.0");
    let req = request(
        "/example.com/m@v1.2.0",
        QueryParams {
            mode: ScanMode::Compare,
            insecure: true,
            ..Default::default()
        },
    );

    let rows = match pipeline.scan(&req).await.unwrap() {
        PipelineOutcome::Scanned { rows, persisted } => {
            assert!(persisted);
            rows
        }
        PipelineOutcome::Skipped => panic!("nothing stored yet, must not skip"),
    };
    let labels: Vec<(&str, &str)> = rows.iter().map(|r| (r.scan_mode.as_str(), r.suffix.as_str())).collect();
    assert_eq!(
        labels,
        vec![
            ("COMPARE - BINARY", "example.com/m/cmd/a"),
            ("COMPARE - SOURCE", "example.com/m/cmd/a"),
            ("COMPARE - BINARY", "example.com/m/cmd/b"),
            ("COMPARE - SOURCE", "example.com/m/cmd/b"),
        ]
    );
    for row in &rows {
        assert!(row.error.is_empty(), "unexpected error {}", row.error);
        if row.scan_mode == "COMPARE - SOURCE" {
            assert!(row.build_seconds.is_none());
            let ids: Vec<&str> = row.vulns.iter().map(|v| v.id.as_str()).collect();
            assert_eq!(ids, vec!["GO-2023-0001"]);
        } else {
            assert!(row.build_seconds.is_some());
            assert_eq!(row.vulns.len(), 2);
        }
    }

    let built = std::fs::read_to_string(fixture.root().join("bin/built")).unwrap();
    assert_eq!(built.lines().collect::<Vec<_>>(), vec!["example.com/m/cmd/a", "example.com/m/cmd/b"]);
}

#[tokio::test]
async fn compare_without_packages_is_one_build_failure() {
    let fixture = Fixture::new().await;
    script(
        &fixture.root().join("bin/go"),
        "case \"$1\" in env) echo go1.21.4 ;; *) echo 'go: cannot find main module' >&2; exit 1 ;; esac",
    );
    let pipeline = fixture.pipeline(fixture.scanner(&source_scanner()), "0.1.0");
    let req = request(
        "/example.com/m@v1.2.0",
        QueryParams {
            mode: ScanMode::Compare,
            insecure: true,
            ..Default::default()
        },
    );

    match pipeline.scan(&req).await.unwrap() {
        PipelineOutcome::Scanned { rows, .. } => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].scan_mode, "COMPARE");
            assert_eq!(rows[0].error_category, "build-failure");
            assert!(rows[0].error.contains("cannot find main module"), "{}", rows[0].error);
        }
        PipelineOutcome::Skipped => panic!("nothing stored yet, must not skip"),
    }
}

#[tokio::test]
async fn malformed_output_is_not_retried() {
    let fixture = Fixture::new().await;
    let pipeline = fixture.pipeline(
        fixture.scanner(r#"echo '{"config":{},"finding":{}}'"#),
        "0.1.0",
    );
    let req = request(
        "/example.com/m@v1.2.0",
        QueryParams {
            insecure: true,
            ..Default::default()
        },
    );

    pipeline.scan(&req).await.unwrap();
    let stored = fixture
        .store
        .latest("example.com/m", "v1.2.0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.error_category, "malformed-output");
    assert!(matches!(pipeline.scan(&req).await.unwrap(), PipelineOutcome::Skipped));
}

#[tokio::test]
async fn missing_module_gets_an_error_row() {
    let fixture = Fixture::new().await;
    let pipeline = fixture.pipeline(fixture.scanner(&source_scanner()), "0.1.0");
    let req = request(
        "/example.com/gone@v0.0.1",
        QueryParams {
            mode: ScanMode::Binary,
            insecure: true,
            ..Default::default()
        },
    );

    match pipeline.scan(&req).await.unwrap() {
        PipelineOutcome::Scanned { rows, .. } => {
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].scan_mode, "BINARY");
            assert_eq!(rows[0].error_category, "module-not-found");
        }
        PipelineOutcome::Skipped => panic!("nothing stored yet, must not skip"),
    }
}

#[tokio::test]
async fn missing_vulndb_index_never_skips() {
    let fixture = Fixture::new().await;
    std::fs::remove_file(fixture.root().join("vulndb/index/db.json")).unwrap();
    let pipeline = fixture.pipeline(fixture.scanner(&source_scanner()), "0.1.0");
    let req = request(
        "/example.com/m@v1.2.0",
        QueryParams {
            insecure: true,
            ..Default::default()
        },
    );

    for _ in 0..2 {
        match pipeline.scan(&req).await.unwrap() {
            PipelineOutcome::Scanned { rows, .. } => assert!(rows[0].work_version.is_none()),
            PipelineOutcome::Skipped => panic!("rows without a work version are always rescanned"),
        }
    }
}

#[tokio::test]
async fn slow_scanner_times_out() {
    let fixture = Fixture::new().await;
    let root = fixture.root();
    let toolchain = Toolchain::new(root.join("bin/go"), Duration::from_secs(10));
    let vulndb = VulnDb::new(root.join("vulndb"));
    let tracker = WorkVersionTracker::new(
        fixture.store.clone(),
        toolchain.clone(),
        vulndb.clone(),
        "0.1.0",
        SchemaVersion::of_result_schema(),
    );
    let runner = ScanRunner::new(
        fixture.scanner("sleep 5"),
        vulndb,
        toolchain,
        Duration::from_millis(200),
    );
    let pipeline = ScanPipeline::new(fixture.store.clone(), tracker, runner, root.join("modules"));
    let req = request(
        "/example.com/m@v1.2.0",
        QueryParams {
            insecure: true,
            ..Default::default()
        },
    );

    match pipeline.scan(&req).await.unwrap() {
        PipelineOutcome::Scanned { rows, .. } => {
            assert_eq!(rows[0].error_category, "timeout");
            assert!(rows[0].scan_seconds < 5.0);
        }
        PipelineOutcome::Skipped => panic!("nothing stored yet, must not skip"),
    }
}
