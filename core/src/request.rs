use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RequestError {
    #[error("invalid module path {0:?}: want <module>@<version>, <module>/@v/<version> or <module>/@latest")]
    InvalidPath(String),

    #[error("invalid query parameter: {0}")]
    InvalidParam(String),
}

/// How the scanner looks at the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScanMode {
    /// Analyze the module source.
    #[default]
    Source,
    /// Build a binary, then analyze the binary.
    Binary,
    /// Run both and keep the two results side by side.
    Compare,
}

impl ScanMode {
    /// Value of the scanner's `-mode` flag. Compare mode has none of its own.
    pub fn flag(&self) -> Option<&'static str> {
        match self {
            ScanMode::Source => Some("source"),
            ScanMode::Binary => Some("binary"),
            ScanMode::Compare => None,
        }
    }

    /// Label stored in the `scan_mode` column.
    pub fn label(&self) -> &'static str {
        match self {
            ScanMode::Source => "SOURCE",
            ScanMode::Binary => "BINARY",
            ScanMode::Compare => "COMPARE",
        }
    }

    /// Label for one side of a comparison run.
    pub fn compare_label(side: ScanMode) -> &'static str {
        match side {
            ScanMode::Binary => "COMPARE - BINARY",
            _ => "COMPARE - SOURCE",
        }
    }
}

impl FromStr for ScanMode {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "source" | "govulncheck" => Ok(ScanMode::Source),
            "binary" => Ok(ScanMode::Binary),
            "compare" => Ok(ScanMode::Compare),
            other => Err(RequestError::InvalidParam(format!("unknown mode {:?}", other))),
        }
    }
}

impl TryFrom<String> for ScanMode {
    type Error = RequestError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ScanMode> for String {
    fn from(mode: ScanMode) -> String {
        mode.label().to_ascii_lowercase()
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Module path, version and optional suffix taken from a request URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleUrlPath {
    pub module: String,
    pub version: String,
    /// Anything after the version, e.g. a package directory inside the module.
    pub suffix: String,
}

impl ModuleUrlPath {
    pub fn new(module: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            version: version.into(),
            suffix: String::new(),
        }
    }

    /// Parses one of
    ///   - `<module>/@v/<version>[/<suffix>]`
    ///   - `<module>@<version>[/<suffix>]`
    ///   - `<module>/@latest[/<suffix>]`
    pub fn parse(path: &str) -> Result<Self, RequestError> {
        let invalid = || RequestError::InvalidPath(path.to_string());
        let trimmed = path.trim_matches('/');

        let (module, version, suffix) = if let Some((module, rest)) = trimmed.split_once("/@v/") {
            let (version, suffix) = rest.split_once('/').unwrap_or((rest, ""));
            (module, version, suffix)
        } else if let Some((module, rest)) = trimmed.split_once("/@latest") {
            let suffix = match rest {
                "" => "",
                _ => rest.strip_prefix('/').ok_or_else(invalid)?,
            };
            (module, "latest", suffix)
        } else if let Some((module, rest)) = trimmed.split_once('@') {
            let (version, suffix) = rest.split_once('/').unwrap_or((rest, ""));
            (module, version, suffix)
        } else {
            return Err(invalid());
        };

        if module.contains('@') || version.contains('@') {
            return Err(invalid());
        }
        // Each part is joined onto a directory, so it must stay below it.
        let elements_ok = |part: &str| part.split('/').all(safe_element);
        if !elements_ok(module) || !safe_element(version) || (!suffix.is_empty() && !elements_ok(suffix)) {
            return Err(invalid());
        }

        Ok(Self {
            module: module.to_string(),
            version: version.to_string(),
            suffix: suffix.to_string(),
        })
    }

    pub fn path(&self) -> String {
        if self.suffix.is_empty() {
            format!("{}@{}", self.module, self.version)
        } else {
            format!("{}@{}/{}", self.module, self.version, self.suffix)
        }
    }
}

fn safe_element(element: &str) -> bool {
    !element.is_empty() && element != "." && element != ".." && !element.contains('\\') && !element.contains(':')
}

/// Query parameters of a scan request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryParams {
    /// Number of importers of the module; required, must not be negative.
    #[serde(rename = "importedby")]
    pub imported_by: Option<i64>,
    #[serde(default)]
    pub mode: ScanMode,
    /// Run outside the sandbox.
    #[serde(default)]
    pub insecure: bool,
    /// Hand the result back to the caller instead of persisting it.
    #[serde(default)]
    pub serve: bool,
}

/// One unit of work: what to scan and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanRequest {
    pub target: ModuleUrlPath,
    pub imported_by: i64,
    pub mode: ScanMode,
    pub insecure: bool,
    pub serve: bool,
}

impl ScanRequest {
    pub fn new(target: ModuleUrlPath, params: QueryParams) -> Result<Self, RequestError> {
        let imported_by = match params.imported_by {
            Some(n) if n >= 0 => n,
            _ => {
                return Err(RequestError::InvalidParam(
                    r#"missing or negative "importedby" query param"#.to_string(),
                ))
            }
        };
        Ok(Self {
            target,
            imported_by,
            mode: params.mode,
            insecure: params.insecure,
            serve: params.serve,
        })
    }

    /// Parses the path part and query parameters of a request.
    pub fn parse(path: &str, params: QueryParams) -> Result<Self, RequestError> {
        Self::new(ModuleUrlPath::parse(path)?, params)
    }

    pub fn name(&self) -> String {
        format!("{}@{}", self.target.module, self.target.version)
    }

    pub fn path(&self) -> String {
        self.target.path()
    }

    pub fn params(&self) -> String {
        format!(
            "importedby={}&mode={}&insecure={}&serve={}",
            self.imported_by,
            String::from(self.mode),
            self.insecure,
            self.serve
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_path_forms() {
        assert_eq!(
            ModuleUrlPath::parse("golang.org/x/net/@v/v0.7.0").unwrap(),
            ModuleUrlPath::new("golang.org/x/net", "v0.7.0")
        );
        assert_eq!(
            ModuleUrlPath::parse("/golang.org/x/net@v0.7.0").unwrap(),
            ModuleUrlPath::new("golang.org/x/net", "v0.7.0")
        );
        assert_eq!(
            ModuleUrlPath::parse("golang.org/x/net/@latest").unwrap(),
            ModuleUrlPath::new("golang.org/x/net", "latest")
        );
    }

    #[test]
    fn parses_suffix() {
        let p = ModuleUrlPath::parse("example.com/m@v1.2.0/cmd/tool").unwrap();
        assert_eq!(p.module, "example.com/m");
        assert_eq!(p.version, "v1.2.0");
        assert_eq!(p.suffix, "cmd/tool");
        assert_eq!(p.path(), "example.com/m@v1.2.0/cmd/tool");

        let p = ModuleUrlPath::parse("example.com/m/@v/v1.2.0/cmd").unwrap();
        assert_eq!(p.suffix, "cmd");

        let p = ModuleUrlPath::parse("example.com/m/@latest/cmd").unwrap();
        assert_eq!((p.version.as_str(), p.suffix.as_str()), ("latest", "cmd"));
    }

    #[test]
    fn rejects_bad_paths() {
        for bad in ["", "example.com/m", "@v1.0.0", "example.com/m@", "example.com/m/@latestx"] {
            assert!(ModuleUrlPath::parse(bad).is_err(), "{:?} should not parse", bad);
        }
    }

    #[test]
    fn paths_cannot_leave_the_modules_root() {
        for bad in [
            "../../../etc@v1",
            "/../etc@v1",
            "example.com/../../etc@v1",
            "example.com//m@v1.0.0",
            "example.com/./m@v1.0.0",
            "example.com/m@..",
            "example.com/m@v1.0.0/../../x",
            "example.com/m@v1.0.0/cmd//x",
            "../etc/@v/v1.0.0",
            "example.com/m/@latest/..",
            r"\etc@v1",
            r"example.com\..\m@v1",
            "C:/m@v1",
        ] {
            assert!(ModuleUrlPath::parse(bad).is_err(), "{:?} should not parse", bad);
        }
        assert!(ModuleUrlPath::parse("example.com/m@v1.0.0-rc.1+incompatible/cmd/tool").is_ok());
    }

    #[test]
    fn imported_by_is_required() {
        let target = ModuleUrlPath::new("m", "v1.0.0");
        assert!(ScanRequest::new(target.clone(), QueryParams::default()).is_err());

        let params = QueryParams {
            imported_by: Some(-1),
            ..Default::default()
        };
        assert!(ScanRequest::new(target.clone(), params).is_err());

        let params = QueryParams {
            imported_by: Some(3),
            mode: ScanMode::Binary,
            ..Default::default()
        };
        let req = ScanRequest::new(target, params).unwrap();
        assert_eq!(req.name(), "m@v1.0.0");
        assert_eq!(req.params(), "importedby=3&mode=binary&insecure=false&serve=false");
    }

    #[test]
    fn mode_names() {
        assert_eq!("GOVULNCHECK".parse::<ScanMode>().unwrap(), ScanMode::Source);
        assert_eq!("compare".parse::<ScanMode>().unwrap(), ScanMode::Compare);
        assert!("fast".parse::<ScanMode>().is_err());
        assert_eq!(ScanMode::Binary.flag(), Some("binary"));
        assert_eq!(ScanMode::Compare.flag(), None);
        assert_eq!(ScanMode::compare_label(ScanMode::Binary), "COMPARE - BINARY");
    }

    #[test]
    fn query_params_deserialize() {
        let params: QueryParams =
            serde_json::from_str(r#"{"importedby": 7, "mode": "binary", "serve": true}"#).unwrap();
        assert_eq!(params.imported_by, Some(7));
        assert_eq!(params.mode, ScanMode::Binary);
        assert!(params.serve);
        assert!(!params.insecure);
    }
}
