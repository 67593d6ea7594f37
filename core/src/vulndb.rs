use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{Result, ScanError};

/// A local copy of the vulnerability database.
#[derive(Debug, Clone)]
pub struct VulnDb {
    dir: PathBuf,
}

#[derive(Deserialize)]
struct DbIndex {
    modified: DateTime<Utc>,
}

impl VulnDb {
    /// Relative directories are resolved against the current directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: absolute(dir.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `file://` URI of the database, as the scanner's `-db` flag expects.
    pub fn uri(&self) -> String {
        vulndb_uri(&self.dir)
    }

    /// Reads the `modified` timestamp from `index/db.json`.
    pub async fn last_modified(&self) -> Result<DateTime<Utc>> {
        let index_path = self.dir.join("index").join("db.json");
        let content = tokio::fs::read(&index_path).await.map_err(|e| {
            ScanError::VulnDb(format!("failed to read {}: {}", index_path.display(), e))
        })?;
        let index: DbIndex = serde_json::from_slice(&content).map_err(|e| {
            ScanError::VulnDb(format!("failed to parse {}: {}", index_path.display(), e))
        })?;
        Ok(index.modified)
    }
}

fn absolute(dir: PathBuf) -> PathBuf {
    if dir.has_root() {
        return dir;
    }
    let relative: PathBuf = dir.components().filter(|c| !matches!(c, Component::CurDir)).collect();
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(relative),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), "cannot resolve relative vulndb dir: {}", e);
            dir
        }
    }
}

/// Converts a database directory into a `file://` URI.
///
/// Separators become forward slashes; a path that does not start at a root
/// slash (a drive letter path) gets the empty authority form `file:///C:/...`.
pub fn vulndb_uri(dir: &Path) -> String {
    let slashed = dir.to_string_lossy().replace('\\', "/");
    if slashed.starts_with('/') {
        format!("file://{}", slashed)
    } else {
        format!("file:///{}", slashed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn unix_paths() {
        assert_eq!(vulndb_uri(Path::new("/srv/vulndb")), "file:///srv/vulndb");
    }

    #[test]
    fn relative_dirs_are_resolved() {
        let cwd = std::env::current_dir().unwrap();
        let db = VulnDb::new("./vulndb");
        assert_eq!(db.dir(), cwd.join("vulndb"));
        assert_eq!(db.uri(), vulndb_uri(&cwd.join("vulndb")));
        assert!(!db.uri().contains("/./"));
        assert_eq!(VulnDb::new("/srv/vulndb").uri(), "file:///srv/vulndb");
    }

    #[test]
    fn drive_letter_paths() {
        assert_eq!(vulndb_uri(Path::new(r"C:\vuln\db")), "file:///C:/vuln/db");
    }

    #[tokio::test]
    async fn reads_last_modified() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("index")).unwrap();
        std::fs::write(
            dir.path().join("index/db.json"),
            r#"{"modified":"2023-06-01T12:30:45.123456789Z"}"#,
        )
        .unwrap();

        let db = VulnDb::new(dir.path());
        let modified = db.last_modified().await.unwrap();
        let expected = Utc.with_ymd_and_hms(2023, 6, 1, 12, 30, 45).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        assert_eq!(modified, expected);
    }

    #[tokio::test]
    async fn missing_index_is_a_vulndb_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = VulnDb::new(dir.path()).last_modified().await.unwrap_err();
        assert!(matches!(err, ScanError::VulnDb(_)));
    }
}
