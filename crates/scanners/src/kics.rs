//! KICS (infrastructure-as-code) adapter.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scanrelay_core::{
    config::KicsConfig,
    models::{Finding, Locator, ScanResult, ScannerKind, ScopeUnit, Severity},
    util::join_normalized,
};
use serde::Deserialize;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::{Invocation, Scanner, check_version, execute};

/// KICS exits with a non-zero code encoding the highest severity found.
const ACCEPTED_EXIT_CODES: &[i32] = &[0, 20, 30, 40, 50, 60];
const ARTIFACT_NAME: &str = "results.json";

#[derive(Debug, Clone)]
pub struct KicsScanner {
    config: KicsConfig,
}

impl KicsScanner {
    pub fn new(config: KicsConfig) -> Self { Self { config } }
}

#[async_trait]
impl Scanner for KicsScanner {
    fn kind(&self) -> ScannerKind { ScannerKind::Kics }

    fn scope_unit(&self) -> ScopeUnit { ScopeUnit::Files }

    async fn check_installed(&self) -> Result<String> {
        check_version(self.kind(), &self.config.binary, &["version"]).await
    }

    async fn run(&self, source: &Path, _project_label: &str) -> ScanResult {
        let output_dir = join_normalized(source, &self.config.output_dir);
        let args = vec![
            "scan".to_string(),
            "--no-progress".to_string(),
            "-p".to_string(),
            source.display().to_string(),
            "-o".to_string(),
            output_dir.display().to_string(),
            "--output-name".to_string(),
            "results".to_string(),
            "--report-formats".to_string(),
            "json".to_string(),
        ];
        execute(Invocation {
            kind: self.kind(),
            program: &self.config.binary,
            args,
            cwd: source,
            output_dir,
            artifact_name: ARTIFACT_NAME,
            accepted_exit_codes: ACCEPTED_EXIT_CODES,
            scope_unit: self.scope_unit(),
            parse,
        })
        .await
    }
}

#[derive(Deserialize)]
struct Report {
    #[serde(default)]
    files_scanned: u64,
    #[serde(default)]
    queries: Vec<Query>,
    start: Option<String>,
    end: Option<String>,
}

#[derive(Deserialize)]
struct Query {
    #[serde(default)]
    query_name: String,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    description: String,
    cwe: Option<String>,
    #[serde(default)]
    files: Vec<QueryFile>,
}

#[derive(Deserialize)]
struct QueryFile {
    #[serde(default)]
    file_name: String,
    line: Option<u32>,
}

/// Parse a KICS JSON report. Every affected file of a query becomes one finding.
pub fn parse(data: &[u8]) -> Result<ScanResult> {
    let report: Report = serde_json::from_slice(data).context("Invalid KICS report")?;
    let duration = scan_duration(report.start.as_deref(), report.end.as_deref());
    let mut findings = vec![];
    for query in report.queries {
        let severity = Severity::normalize(&query.severity);
        let external_id = query.cwe.filter(|cwe| !cwe.is_empty()).map(|cwe| {
            if cwe.chars().all(|c| c.is_ascii_digit()) { format!("CWE-{cwe}") } else { cwe }
        });
        let finding = |locator| Finding {
            severity,
            title: query.query_name.clone(),
            locator,
            description: query.description.clone(),
            external_id: external_id.clone(),
        };
        if query.files.is_empty() {
            findings.push(finding(Locator::File { path: String::new(), line: None }));
            continue;
        }
        for file in &query.files {
            findings.push(finding(Locator::File { path: file.file_name.clone(), line: file.line }));
        }
    }
    Ok(ScanResult::from_findings(findings, report.files_scanned, ScopeUnit::Files, duration))
}

fn scan_duration(start: Option<&str>, end: Option<&str>) -> f64 {
    let parse = |s: &str| OffsetDateTime::parse(s, &Rfc3339).ok();
    match (start.and_then(parse), end.and_then(parse)) {
        (Some(start), Some(end)) if end > start => (end - start).as_seconds_f64(),
        _ => 0.0,
    }
}
