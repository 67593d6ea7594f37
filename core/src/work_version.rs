use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::Digest;

use crate::error::{is_retryable_category, Result};
use crate::request::ModuleUrlPath;
use crate::store::{schema_description, ResultStore, StoreError, WorkState};
use crate::toolchain::Toolchain;
use crate::vulndb::VulnDb;

/// Everything that influences the outcome of a scan.
///
/// Two equal work versions for the same module version mean a rescan would
/// produce the same result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkVersion {
    /// Toolchain version, which decides how standard library vulns are read.
    pub toolchain_version: String,
    /// Version of the scanning and processing logic.
    pub worker_version: String,
    /// Fingerprint of the stored row schema.
    pub schema_version: String,
    /// When the vulnerability database last changed.
    pub vulndb_last_modified: DateTime<Utc>,
}

impl WorkVersion {
    /// Absent work versions are never equal to anything, not even each other.
    pub fn equal(a: Option<&WorkVersion>, b: Option<&WorkVersion>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// Fingerprint of the result row schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaVersion(String);

impl SchemaVersion {
    /// Hashes a schema description.
    pub fn of(description: &str) -> Self {
        let mut hasher = sha1::Sha1::new();
        hasher.update(description.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        Self(digest.chars().take(16).collect())
    }

    /// Version of the schema the store writes. Computed once at startup and
    /// passed to whoever needs it.
    pub fn of_result_schema() -> Self {
        Self::of(&schema_description())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Skip a rescan only if both work versions exist and match, and the stored
/// row did not fail in a way worth retrying.
pub fn should_skip(current: Option<&WorkVersion>, stored: Option<&WorkState>) -> bool {
    let Some(stored) = stored else {
        return false;
    };
    WorkVersion::equal(current, stored.work_version.as_ref()) && !is_retryable_category(&stored.error_category)
}

/// Computes current work versions and compares them with stored ones.
pub struct WorkVersionTracker {
    store: Arc<dyn ResultStore>,
    toolchain: Toolchain,
    vulndb: VulnDb,
    worker_version: String,
    schema_version: SchemaVersion,
}

impl WorkVersionTracker {
    pub fn new(
        store: Arc<dyn ResultStore>,
        toolchain: Toolchain,
        vulndb: VulnDb,
        worker_version: impl Into<String>,
        schema_version: SchemaVersion,
    ) -> Self {
        Self {
            store,
            toolchain,
            vulndb,
            worker_version: worker_version.into(),
            schema_version,
        }
    }

    pub async fn compute_current(&self) -> Result<WorkVersion> {
        let toolchain_version = self.toolchain.version().await?;
        let vulndb_last_modified = self.vulndb.last_modified().await?;
        Ok(WorkVersion {
            toolchain_version,
            worker_version: self.worker_version.clone(),
            schema_version: self.schema_version.as_str().to_string(),
            vulndb_last_modified,
        })
    }

    pub async fn lookup_stored(&self, target: &ModuleUrlPath) -> std::result::Result<Option<WorkState>, StoreError> {
        self.store.read_work_state(&target.module, &target.version).await
    }

    /// Looks up the stored state for `target` and applies [`should_skip`].
    pub async fn should_skip(
        &self,
        target: &ModuleUrlPath,
        current: Option<&WorkVersion>,
    ) -> std::result::Result<bool, StoreError> {
        if current.is_none() {
            return Ok(false);
        }
        let stored = self.lookup_stored(target).await?;
        let skip = should_skip(current, stored.as_ref());
        if skip {
            tracing::info!(module = %target.module, version = %target.version, "work version unchanged");
        }
        Ok(skip)
    }
}
