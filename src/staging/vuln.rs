//! Vulnerability scanning step of the staging pipeline (§4.4).

use crate::model::{SeverityCounts, VulnResult, Vulnerability};
use crate::{Error, Result};

#[derive(Debug, serde::Deserialize)]
struct TrivyReport {
    #[serde(default, rename = "Results")]
    results: Vec<TrivyResult>,
}

#[derive(Debug, serde::Deserialize)]
struct TrivyResult {
    #[serde(default, rename = "Vulnerabilities")]
    vulnerabilities: Vec<TrivyVulnerability>,
}

#[derive(Debug, serde::Deserialize)]
struct TrivyVulnerability {
    #[serde(rename = "VulnerabilityID")]
    vulnerability_id: String,
    #[serde(rename = "Severity")]
    severity: String,
    #[serde(rename = "PkgName")]
    pkg_name: String,
    #[serde(rename = "InstalledVersion")]
    installed_version: String,
    #[serde(default, rename = "FixedVersion")]
    fixed_version: Option<String>,
    #[serde(default, rename = "Description")]
    description: Option<String>,
}

/// Parse a `trivy image --format json` report and decide whether any
/// requested severity has at least one finding.
pub fn parse_trivy_output(stdout: &str, blocking_severities: &[String]) -> Result<VulnResult> {
    let report: TrivyReport = serde_json::from_str(stdout)
        .map_err(|e| Error::ToolFailure(format!("failed to parse trivy output: {e}")))?;

    let mut counts = SeverityCounts::default();
    let mut vulnerabilities = Vec::new();

    for result in report.results {
        for vuln in result.vulnerabilities {
            match vuln.severity.to_ascii_uppercase().as_str() {
                "CRITICAL" => counts.critical += 1,
                "HIGH" => counts.high += 1,
                "MEDIUM" => counts.medium += 1,
                "LOW" => counts.low += 1,
                _ => counts.unknown += 1,
            }
            vulnerabilities.push(Vulnerability {
                id: vuln.vulnerability_id,
                severity: vuln.severity,
                package: vuln.pkg_name,
                installed_version: vuln.installed_version,
                fixed_version: vuln.fixed_version,
                description: vuln.description,
            });
        }
    }

    let blocked = blocking_severities.iter().any(|s| counts.get(s) > 0);

    Ok(VulnResult {
        counts,
        vulnerabilities,
        blocked,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_image_is_never_blocked() {
        let result = parse_trivy_output(r#"{"Results":[]}"#, &["CRITICAL".to_string(), "HIGH".to_string()]).unwrap();
        assert_eq!(result.counts.critical, 0);
        assert!(!result.blocked);
    }

    #[test]
    fn a_single_critical_finding_blocks_when_critical_is_requested() {
        let stdout = r#"{
            "Results": [{
                "Vulnerabilities": [{
                    "VulnerabilityID": "CVE-2024-0001",
                    "Severity": "CRITICAL",
                    "PkgName": "openssl",
                    "InstalledVersion": "1.0.0",
                    "FixedVersion": "1.0.1"
                }]
            }]
        }"#;
        let result = parse_trivy_output(stdout, &["CRITICAL".to_string(), "HIGH".to_string()]).unwrap();
        assert_eq!(result.counts.critical, 1);
        assert!(result.blocked);
    }

    #[test]
    fn findings_outside_the_requested_severities_do_not_block() {
        let stdout = r#"{
            "Results": [{
                "Vulnerabilities": [{
                    "VulnerabilityID": "CVE-2024-0002",
                    "Severity": "LOW",
                    "PkgName": "curl",
                    "InstalledVersion": "7.0.0"
                }]
            }]
        }"#;
        let result = parse_trivy_output(stdout, &["CRITICAL".to_string(), "HIGH".to_string()]).unwrap();
        assert_eq!(result.counts.low, 1);
        assert!(!result.blocked);
    }
}
