//! Turns a [`ScanResult`] into what gets posted back to the repository host: a PR comment, a
//! check-run conclusion and summary, and annotation batches.

use std::fmt::Write;

use scanrelay_core::{
    models::{
        Annotation, AnnotationLevel, Conclusion, Finding, Locator, ScanResult, ScannerKind,
        Severity,
    },
    util::truncate,
};
use serde::Serialize;

/// Upper bound of annotations accepted by a single check-run request.
pub const MAX_ANNOTATIONS_PER_REQUEST: usize = 50;
/// Path used for findings that are not located in a file, such as vulnerable packages.
pub const DEFAULT_MANIFEST_PATH: &str = "package-manifest";

const MAX_TOP_FINDINGS: usize = 10;
const MAX_TITLE_LEN: usize = 255;
const MAX_MESSAGE_LEN: usize = 4096;

/// Presentation settings for one scanner class.
#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub kind: ScannerKind,
    /// Worker name shown in the comment footer.
    pub app_name: String,
    pub manifest_path: String,
}

impl ReportOptions {
    pub fn new(kind: ScannerKind) -> Self {
        Self { kind, app_name: kind.app_name(), manifest_path: DEFAULT_MANIFEST_PATH.to_string() }
    }

    pub fn check_run_name(&self) -> String { format!("{} Security Scan", self.kind.display_name()) }

    pub fn check_run_title(&self) -> String {
        format!("{} Security Scan Results", self.kind.display_name())
    }
}

/// Findings ordered by decreasing severity; ties keep their input order.
pub fn sorted_findings(result: &ScanResult) -> Vec<&Finding> {
    let mut findings = result.findings.iter().collect::<Vec<_>>();
    findings.sort_by_key(|f| f.severity);
    findings
}

pub fn build_conclusion(result: &ScanResult) -> Conclusion {
    if !result.success || result.count(Severity::Critical) > 0 {
        Conclusion::Failure
    } else if result.count(Severity::High) > 0 {
        Conclusion::Neutral
    } else {
        Conclusion::Success
    }
}

/// Markdown body of the PR comment.
pub fn build_comment(result: &ScanResult, options: &ReportOptions) -> String {
    let icon = if !result.success {
        "❌"
    } else if result.total_issues == 0 {
        "✅"
    } else {
        "⚠️"
    };
    let mut out = format!("## {} {} Security Scan Results\n\n", icon, options.kind.display_name());
    if !result.success {
        let error = result.error_message.as_deref().unwrap_or("unknown error");
        writeln!(out, "> **Scan failed:** {}\n", error).ok();
    }

    out.push_str("| Severity | Count |\n");
    out.push_str("|----------|-------|\n");
    for &severity in Severity::classified() {
        writeln!(out, "| {} {} | {} |", severity.emoji(), severity, result.count(severity)).ok();
    }
    out.push('\n');

    out.push_str("| Metric | Value |\n");
    out.push_str("|--------|-------|\n");
    writeln!(out, "| {} | {} |", result.scope_unit.label(), result.scope_metric).ok();
    writeln!(out, "| Total Issues | {} |", result.total_issues).ok();
    writeln!(out, "| Scan Duration | {:.1}s |", result.execution_seconds).ok();
    out.push('\n');

    top_findings(result, &mut out);

    write!(out, "\n---\n🤖 *Scanned by {}*\n", options.app_name).ok();
    out
}

fn top_findings(result: &ScanResult, out: &mut String) {
    if result.findings.is_empty() {
        if result.success {
            out.push_str("✅ **No issues found!**\n");
        }
        return;
    }
    out.push_str("### Top Issues\n\n");
    let findings = sorted_findings(result);
    for finding in findings.iter().take(MAX_TOP_FINDINGS) {
        writeln!(out, "- **[{}]** {}", finding.severity, truncate(&finding.title, MAX_TITLE_LEN))
            .ok();
        if !finding.locator.is_empty() {
            writeln!(out, "  - `{}`", finding.locator).ok();
        }
        if let Some(id) = &finding.external_id {
            writeln!(out, "  - Reference: `{}`", id).ok();
        }
    }
    let remaining = findings.len().saturating_sub(MAX_TOP_FINDINGS);
    if remaining > 0 {
        write!(out, "\n*...and {} more*\n", remaining).ok();
    }
}

/// One annotation per finding, in report order.
pub fn build_annotations(result: &ScanResult, options: &ReportOptions) -> Vec<Annotation> {
    sorted_findings(result).into_iter().map(|finding| annotation(finding, options)).collect()
}

fn annotation(finding: &Finding, options: &ReportOptions) -> Annotation {
    let (path, line) = match &finding.locator {
        Locator::File { path, line } if !path.is_empty() => (path.clone(), line.unwrap_or(1)),
        _ => (options.manifest_path.clone(), 1),
    };
    let line = line.max(1);
    let mut message = if finding.description.is_empty() {
        "No description available".to_string()
    } else {
        finding.description.clone()
    };
    if let Locator::Package { .. } = finding.locator {
        write!(message, "\n\nPackage: {}", finding.locator).ok();
    }
    if let Some(id) = &finding.external_id {
        write!(message, "\nReference: {}", id).ok();
    }
    let title = if finding.title.is_empty() { "Security Issue" } else { finding.title.as_str() };
    Annotation {
        path,
        start_line: line,
        end_line: line,
        annotation_level: AnnotationLevel::from(finding.severity),
        title: truncate(title, MAX_TITLE_LEN),
        message: truncate(&message, MAX_MESSAGE_LEN),
    }
}

/// Splits annotations into request-sized batches. The first batch goes with the check-run
/// creation; the rest are sent as updates of the same check run.
pub fn annotation_batches(annotations: &[Annotation]) -> impl Iterator<Item = &[Annotation]> {
    annotations.chunks(MAX_ANNOTATIONS_PER_REQUEST)
}

/// One-line summary shown in the check-run output.
pub fn check_run_summary(result: &ScanResult) -> String {
    let summary = format!(
        "Found {} issues ({} {} scanned)",
        result.total_issues,
        result.scope_metric,
        result.scope_unit.noun()
    );
    match (&result.error_message, result.success) {
        (Some(error), false) => format!("{summary}. Scan failed: {error}"),
        _ => summary,
    }
}

/// Human-readable outcome sent in the completion callback.
pub fn callback_message(result: &ScanResult, kind: ScannerKind) -> String {
    if !result.success {
        let error = result.error_message.as_deref().unwrap_or("unknown error");
        return format!("Scan failed: {error}");
    }
    format!(
        "{} scan completed: {} issues found (CRITICAL={}, HIGH={}, MEDIUM={})",
        kind.display_name(),
        result.total_issues,
        result.count(Severity::Critical),
        result.count(Severity::High),
        result.count(Severity::Medium)
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckRunOutput {
    pub title: String,
    pub summary: String,
    pub annotations: Vec<Annotation>,
}

/// Body of a completed check-run creation request.
#[derive(Debug, Clone, Serialize)]
pub struct NewCheckRun {
    pub name: String,
    pub head_sha: String,
    pub status: &'static str,
    pub conclusion: Conclusion,
    pub output: CheckRunOutput,
}

impl NewCheckRun {
    pub fn completed(
        options: &ReportOptions,
        head_sha: &str,
        result: &ScanResult,
        annotations: Vec<Annotation>,
    ) -> Self {
        Self {
            name: options.check_run_name(),
            head_sha: head_sha.to_string(),
            status: "completed",
            conclusion: build_conclusion(result),
            output: CheckRunOutput {
                title: options.check_run_title(),
                summary: check_run_summary(result),
                annotations,
            },
        }
    }
}

/// Body of a check-run update carrying an additional annotation batch.
#[derive(Debug, Clone, Serialize)]
pub struct CheckRunUpdate {
    pub output: CheckRunOutput,
}

impl CheckRunUpdate {
    pub fn annotations(options: &ReportOptions, annotations: Vec<Annotation>) -> Self {
        Self {
            output: CheckRunOutput {
                title: options.check_run_title(),
                summary: "Additional annotations".to_string(),
                annotations,
            },
        }
    }
}
