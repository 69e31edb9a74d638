//! Black Duck (software composition analysis) adapter, driven through `bridge-cli`.
//!
//! Report layouts differ between online and offline runs, so entries are read field by field
//! with fallbacks rather than through a fixed schema.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use scanrelay_core::{
    config::BlackduckConfig,
    models::{Finding, Locator, ScanResult, ScannerKind, ScopeUnit, Severity},
    util::join_normalized,
};
use serde_json::Value;

use crate::{Invocation, Scanner, check_version, execute};

const ACCEPTED_EXIT_CODES: &[i32] = &[0];
const ARTIFACT_NAME: &str = "results.json";

#[derive(Debug, Clone)]
pub struct BlackduckScanner {
    config: BlackduckConfig,
}

impl BlackduckScanner {
    pub fn new(config: BlackduckConfig) -> Self { Self { config } }

    fn stage_args(&self, project_label: &str) -> Vec<String> {
        let mut args = vec!["--stage".to_string(), "blackduck".to_string()];
        match (&self.config.server_url, &self.config.api_token) {
            (Some(url), Some(token)) if !url.is_empty() && !token.is_empty() => {
                args.push(format!("--blackduck.url={url}"));
                args.push(format!("--blackduck.token={token}"));
                if !project_label.is_empty() {
                    args.push(format!("--blackduck.project.name={project_label}"));
                }
            }
            _ => {
                tracing::warn!("No Black Duck server configured, running in offline mode");
                args.push("--blackduck.offline.mode=true".to_string());
            }
        }
        args
    }
}

#[async_trait]
impl Scanner for BlackduckScanner {
    fn kind(&self) -> ScannerKind { ScannerKind::Blackduck }

    fn scope_unit(&self) -> ScopeUnit { ScopeUnit::Components }

    async fn check_installed(&self) -> Result<String> {
        check_version(self.kind(), &self.config.binary, &["--version"]).await
    }

    async fn run(&self, source: &Path, project_label: &str) -> ScanResult {
        let output_dir = join_normalized(source, &self.config.output_dir);
        let mut args = self.stage_args(project_label);
        args.push(format!("--blackduck.source.path={}", source.display()));
        args.push(format!("--blackduck.output.path={}", output_dir.display()));
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

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().filter_map(|key| value.get(key)?.as_str()).find(|s| !s.is_empty())
}

fn u64_field(value: &Value, keys: &[&str]) -> u64 {
    keys.iter().find_map(|key| value.get(key)?.as_u64()).unwrap_or(0)
}

/// Parse a Black Duck JSON report. Each vulnerability (or component, for reports without
/// vulnerability data) becomes one finding located at its package.
pub fn parse(data: &[u8]) -> Result<ScanResult> {
    let report: Value = serde_json::from_slice(data).context("Invalid Black Duck report")?;
    let entries = ["vulnerabilities", "components"]
        .iter()
        .find_map(|key| report.get(key)?.as_array())
        .map(Vec::as_slice)
        .unwrap_or_default();
    let findings = entries.iter().map(finding).collect::<Vec<_>>();
    let scanned = u64_field(&report, &["componentsScanned", "totalComponents"]);
    let duration = report.get("scanDuration").and_then(Value::as_f64).unwrap_or(0.0);
    let policy_violations = u64_field(&report, &["policyViolations"]);
    if policy_violations > 0 {
        tracing::info!("Black Duck reported {} policy violations", policy_violations);
    }
    Ok(ScanResult::from_findings(findings, scanned, ScopeUnit::Components, duration))
}

fn finding(entry: &Value) -> Finding {
    let severity =
        Severity::normalize(str_field(entry, &["severity", "vulnerabilitySeverity"]).unwrap_or(""));
    let name = str_field(entry, &["name", "componentName"]).unwrap_or("Unknown").to_string();
    let version = str_field(entry, &["version", "componentVersion"]).map(str::to_string);
    let external_id = str_field(entry, &["cve", "vulnerabilityId"]).map(str::to_string);
    let locator = Locator::Package { name, version };
    let title = str_field(entry, &["title", "vulnerabilityName"])
        .map(str::to_string)
        .unwrap_or_else(|| locator.to_string());
    Finding {
        severity,
        title,
        locator,
        description: str_field(entry, &["description"]).unwrap_or_default().to_string(),
        external_id,
    }
}
