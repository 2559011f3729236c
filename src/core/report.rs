use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A parsed Dependency-Check report. Any well-formed JSON document is accepted;
/// the structure belongs to the external tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Report(Value);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeverityCount {
    pub severity: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    pub dependency_count: u64,
    pub vulnerable_dependency_count: u64,
    pub vulnerability_count: u64,
    pub by_severity: Vec<SeverityCount>,
}

impl Report {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn summary(&self) -> ReportSummary {
        let project_name = self
            .0
            .pointer("/projectInfo/name")
            .and_then(Value::as_str)
            .map(|s| s.to_string());
        let engine_version = self
            .0
            .pointer("/scanInfo/engineVersion")
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        let dependencies = self
            .0
            .get("dependencies")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut vulnerable_dependency_count: u64 = 0;
        let mut vulnerability_count: u64 = 0;
        let mut by_severity: BTreeMap<(u8, String), u64> = BTreeMap::new();

        for dep in dependencies {
            let vulns = dep
                .get("vulnerabilities")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            if vulns.is_empty() {
                continue;
            }
            vulnerable_dependency_count = vulnerable_dependency_count.saturating_add(1);
            for vuln in vulns {
                vulnerability_count = vulnerability_count.saturating_add(1);
                let severity = vuln
                    .get("severity")
                    .and_then(Value::as_str)
                    .map(|s| s.trim().to_ascii_uppercase())
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "UNKNOWN".to_string());
                let acc = by_severity
                    .entry((severity_rank(&severity), severity))
                    .or_insert(0);
                *acc = acc.saturating_add(1);
            }
        }

        ReportSummary {
            project_name,
            engine_version,
            dependency_count: dependencies.len() as u64,
            vulnerable_dependency_count,
            vulnerability_count,
            by_severity: by_severity
                .into_iter()
                .map(|((_, severity), count)| SeverityCount { severity, count })
                .collect(),
        }
    }
}

fn severity_rank(severity: &str) -> u8 {
    match severity {
        "CRITICAL" => 0,
        "HIGH" => 1,
        "MEDIUM" | "MODERATE" => 2,
        "LOW" => 3,
        "INFO" => 4,
        _ => 5,
    }
}
