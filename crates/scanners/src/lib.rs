//! Adapters around external scan tools.
//!
//! An adapter never fails: missing binaries, failing exit codes, absent or unparsable artifacts
//! all come back as a [`ScanResult`] with `success == false`, so the worker's control flow does
//! not depend on the health of the tool.

mod artifact;
pub mod blackduck;
pub mod kics;
mod process;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use scanrelay_core::{
    config::ScannersConfig,
    models::{ScanResult, ScannerKind, ScopeUnit},
};

pub use crate::{artifact::locate_artifact, blackduck::BlackduckScanner, kics::KicsScanner};
use crate::process::{CommandError, run_command};

/// Error message for a scan that produced no artifact.
pub const NO_RESULTS_MESSAGE: &str = "No results file generated";

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Scanner: Send + Sync {
    fn kind(&self) -> ScannerKind;

    /// What the scope metric of this scanner's results counts.
    fn scope_unit(&self) -> ScopeUnit;

    /// Verifies the tool is installed and returns its version string.
    async fn check_installed(&self) -> Result<String>;

    /// Scans `source` and returns the normalized result.
    async fn run(&self, source: &Path, project_label: &str) -> ScanResult;
}

/// Build the adapter for a scanner class.
pub fn scanner_for(kind: ScannerKind, config: &ScannersConfig) -> Arc<dyn Scanner> {
    match kind {
        ScannerKind::Kics => Arc::new(KicsScanner::new(config.kics.clone())),
        ScannerKind::Blackduck => Arc::new(BlackduckScanner::new(config.blackduck.clone())),
    }
}

/// Parse an artifact produced by a scanner class, outside of a scan run.
pub fn parse_artifact(kind: ScannerKind, data: &[u8]) -> Result<ScanResult> {
    match kind {
        ScannerKind::Kics => kics::parse(data),
        ScannerKind::Blackduck => blackduck::parse(data),
    }
}

/// One tool invocation, as prepared by an adapter.
pub(crate) struct Invocation<'a> {
    pub kind: ScannerKind,
    pub program: &'a str,
    pub args: Vec<String>,
    pub cwd: &'a Path,
    pub output_dir: PathBuf,
    pub artifact_name: &'a str,
    /// Exit codes that mean the tool ran to completion.
    pub accepted_exit_codes: &'a [i32],
    pub scope_unit: ScopeUnit,
    pub parse: fn(&[u8]) -> Result<ScanResult>,
}

pub(crate) async fn execute(invocation: Invocation<'_>) -> ScanResult {
    let Invocation {
        kind,
        program,
        args,
        cwd,
        output_dir,
        artifact_name,
        accepted_exit_codes,
        scope_unit,
        parse,
    } = invocation;
    let tool = kind.display_name();

    if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
        tracing::error!(
            "[{}] Failed to create output directory {}: {}",
            kind,
            output_dir.display(),
            e
        );
        return ScanResult::failed(scope_unit, format!("Failed to create output directory: {e}"));
    }

    tracing::info!("[{}] Running {} scan on {}", kind, tool, cwd.display());
    let start = Instant::now();
    let output = match run_command(program, &args, cwd).await {
        Ok(output) => output,
        Err(CommandError::NotFound) => {
            tracing::error!("[{}] Scanner binary not found: {}", kind, program);
            return ScanResult::failed(scope_unit, format!("Scanner binary not found: {program}"));
        }
        Err(CommandError::Spawn(e)) => {
            tracing::error!("[{}] Failed to start {}: {}", kind, program, e);
            return ScanResult::failed(scope_unit, format!("Failed to start {program}: {e}"));
        }
    };
    let elapsed = start.elapsed().as_secs_f64();
    tracing::info!("[{}] {} completed with exit code {:?}", kind, tool, output.code);
    if !output.stderr.is_empty() {
        tracing::debug!("[{}] {} stderr: {}", kind, tool, output.stderr);
    }

    let tool_error = match output.code {
        Some(code) if accepted_exit_codes.contains(&code) => None,
        Some(code) => Some(format!("{tool} exited with status {code}{}", output.stderr_tail())),
        None => Some(format!("{tool} was terminated by a signal")),
    };

    let Some(artifact) = locate_artifact(&output_dir, artifact_name) else {
        tracing::warn!("[{}] No results file in {}", kind, output_dir.display());
        return ScanResult::failed(scope_unit, NO_RESULTS_MESSAGE);
    };
    let data = match tokio::fs::read(&artifact).await {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!("[{}] Failed to read {}: {}", kind, artifact.display(), e);
            return ScanResult::failed(scope_unit, format!("Failed to read results: {e}"));
        }
    };
    let mut result = match parse(&data) {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!("[{}] Failed to parse results: {:#}", kind, e);
            return ScanResult::failed(scope_unit, format!("Failed to parse results: {e:#}"));
        }
    };
    if result.execution_seconds <= 0.0 {
        result.execution_seconds = elapsed;
    }
    tracing::info!(
        "[{}] Parsed {} issues from {} ({} {})",
        kind,
        result.total_issues,
        artifact.display(),
        result.scope_metric,
        result.scope_unit.noun()
    );
    match tool_error {
        Some(message) => result.with_failure(message),
        None => result,
    }
}

pub(crate) async fn check_version(
    kind: ScannerKind,
    program: &str,
    args: &[&str],
) -> Result<String> {
    let args = args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    let command = run_command(program, &args, Path::new("."));
    let output = tokio::time::timeout(VERSION_CHECK_TIMEOUT, command)
        .await
        .map_err(|_| anyhow::anyhow!("{} version check timed out", kind.display_name()))?;
    match output {
        Ok(output) if output.code == Some(0) => {
            let version =
                if output.stdout.trim().is_empty() { &output.stderr } else { &output.stdout };
            Ok(version.trim().to_string())
        }
        Ok(output) => {
            anyhow::bail!("{} returned error: {}", kind.display_name(), output.stderr.trim())
        }
        Err(CommandError::NotFound) => {
            anyhow::bail!("{} binary not found at: {}", kind.display_name(), program)
        }
        Err(CommandError::Spawn(e)) => Err(e.into()),
    }
}
