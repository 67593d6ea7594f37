use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};
use crate::protocol::Finding;

/// A vulnerability as recorded in a result row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vuln {
    pub id: String,
    pub package_path: String,
    pub module_path: String,
    pub version: String,
    /// True when the vulnerable symbol is reached, false when its package is
    /// only imported. Not persisted.
    #[serde(skip)]
    pub called: bool,
}

/// Flattens a finding into a [`Vuln`] using the first (vulnerable) frame.
pub fn normalize_finding(finding: &Finding) -> Result<Vuln> {
    let frame = finding.trace.first().ok_or_else(|| {
        ScanError::InvariantViolation(format!("finding {} has an empty trace", finding.osv))
    })?;

    Ok(Vuln {
        id: finding.osv.clone(),
        package_path: frame.package.clone(),
        module_path: frame.module.clone(),
        version: frame.version.clone(),
        called: !frame.function.is_empty(),
    })
}

/// Normalizes every finding, merging duplicates.
///
/// The scanner reports one vulnerability at module, package and symbol level;
/// records sharing id, package, module and version collapse into the first
/// one, which is marked called if any duplicate was.
pub fn normalize_findings(findings: &[Finding]) -> Result<Vec<Vuln>> {
    let mut vulns: Vec<Vuln> = Vec::with_capacity(findings.len());
    for finding in findings {
        let vuln = normalize_finding(finding)?;
        match vulns.iter_mut().find(|v| same_record(v, &vuln)) {
            Some(existing) => existing.called |= vuln.called,
            None => vulns.push(vuln),
        }
    }
    Ok(vulns)
}

fn same_record(a: &Vuln, b: &Vuln) -> bool {
    a.id == b.id
        && a.package_path == b.package_path
        && a.module_path == b.module_path
        && a.version == b.version
}
