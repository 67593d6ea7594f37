use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use vulnscan_core::runner::SandboxExecutor;
use vulnscan_core::toolchain::Toolchain;
use vulnscan_core::vulndb::VulnDb;
use vulnscan_core::{ResultStore, ScanPipeline, ScanRunner, SchemaVersion, SqliteResultStore, WorkVersionTracker};

use crate::config::WorkerConfig;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<ScanPipeline>,
    pub store: Arc<dyn ResultStore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl AppState {
    pub async fn new(config: &WorkerConfig) -> anyhow::Result<Self> {
        let store = SqliteResultStore::connect(&config.database_url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open result store {}: {}", config.database_url, e))?;
        tracing::info!("Result store at {}", config.database_url);

        let schema_version = SchemaVersion::of_result_schema();
        tracing::info!(schema_version = schema_version.as_str(), "Schema version");

        Ok(Self::with_store(config, Arc::new(store), schema_version))
    }

    pub fn with_store(config: &WorkerConfig, store: Arc<dyn ResultStore>, schema_version: SchemaVersion) -> Self {
        let toolchain = Toolchain::new(&config.go, config.scan_timeout);
        let vulndb = VulnDb::new(&config.vulndb_dir);
        let tracker = WorkVersionTracker::new(
            store.clone(),
            toolchain.clone(),
            vulndb.clone(),
            config.worker_version.clone(),
            schema_version,
        );

        let mut runner = ScanRunner::new(&config.scanner, vulndb, toolchain, config.scan_timeout);
        if let Some(program) = &config.sandbox_program {
            runner = runner.with_sandbox(Arc::new(SandboxExecutor::new(program, config.sandbox_args.clone())));
            if config.build_dir.is_none() {
                tracing::warn!("VULNSCAN_BUILD_DIR is not set, sandboxed binary scans read from the system temp dir");
            }
        }
        if let Some(dir) = &config.build_dir {
            runner = runner.with_build_dir(dir);
        }

        let pipeline = ScanPipeline::new(store.clone(), tracker, runner, &config.modules_root);
        Self {
            pipeline: Arc::new(pipeline),
            store,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Claims `key` for one scan; `None` if a scan of it is already running.
    pub fn claim(&self, key: &str) -> Option<InFlightGuard> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(key.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            key: key.to_string(),
            in_flight: self.in_flight.clone(),
        })
    }
}

/// Releases its claim when dropped.
pub struct InFlightGuard {
    key: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.key);
    }
}
