use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique, time-ordered job identifier.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self { Self(Uuid::now_v7()) }

    /// Key of the job context entry in the context store.
    pub fn context_key(&self) -> String { format!("job:{}", self.0) }
}

impl Default for JobId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Display::fmt(&self.0, f) }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> { Uuid::parse_str(s.trim()).map(Self) }
}

/// A category of security scan, each with its own stream and worker pool.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerKind {
    /// Infrastructure-as-code analysis.
    Kics,
    /// Software composition (dependency) analysis.
    Blackduck,
}

impl ScannerKind {
    pub const fn variants() -> &'static [Self] { &[Self::Kics, Self::Blackduck] }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kics => "kics",
            Self::Blackduck => "blackduck",
        }
    }

    /// Human-readable tool name used in reports.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Kics => "KICS",
            Self::Blackduck => "Blackduck",
        }
    }

    /// Default application name reported in callbacks and comment footers.
    pub fn app_name(&self) -> String { format!("{}-worker", self.as_str()) }
}

impl FromStr for ScannerKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kics" => Ok(Self::Kics),
            "blackduck" | "black-duck" => Ok(Self::Blackduck),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ScannerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Event that triggers a scan, delivered by the webhook layer.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub repo_owner: String,
    pub repo_name: String,
    pub branch: String,
    pub pull_request_id: u64,
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub installation_id: Option<u64>,
}

/// Everything a worker needs to know about a job. Written once, never mutated.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobContext {
    pub id: JobId,
    pub repo_owner: String,
    pub repo_name: String,
    pub branch: String,
    pub pull_request_id: u64,
    pub commit_sha: String,
    pub installation_id: Option<u64>,
    #[serde(rename = "callbackURL", alias = "callbackUrl")]
    pub callback_url: String,
}

impl JobContext {
    pub fn from_event(id: JobId, event: TriggerEvent, callback_url: impl Into<String>) -> Self {
        Self {
            id,
            repo_owner: event.repo_owner,
            repo_name: event.repo_name,
            branch: event.branch,
            pull_request_id: event.pull_request_id,
            commit_sha: event.commit_sha,
            installation_id: event.installation_id,
            callback_url: callback_url.into(),
        }
    }

    /// `owner/name` label used for logging and scanner project names.
    pub fn full_name(&self) -> String { format!("{}/{}", self.repo_owner, self.repo_name) }
}

/// Stream entry payload. All richer data is resolved through [`JobContext`].
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: JobId,
    #[serde(default)]
    pub callback_url: String,
}

/// Completion notice posted by a worker to the dispatcher side.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub id: String,
    pub msg_base64: String,
    pub app_name: String,
}

/// Finding severity, ordered by decreasing urgency.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
    /// Catch-all for severities a tool reports that we do not recognize.
    Unknown,
}

impl Severity {
    /// Severities counted in the histogram.
    pub const fn classified() -> &'static [Self] {
        &[Self::Critical, Self::High, Self::Medium, Self::Low, Self::Info]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
            Self::Info => "INFO",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Critical => "🔴",
            Self::High => "🟠",
            Self::Medium => "🟡",
            Self::Low => "🔵",
            Self::Info => "⚪",
            Self::Unknown => "⚫",
        }
    }

    /// Case-insensitive parse that never fails; unrecognized values map to [`Severity::Unknown`].
    pub fn normalize(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "CRITICAL" => Self::Critical,
            "HIGH" => Self::High,
            "MEDIUM" | "MODERATE" => Self::Medium,
            "LOW" => Self::Low,
            "INFO" | "INFORMATIONAL" | "TRACE" => Self::Info,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Count of findings per classified severity.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeverityCounts(BTreeMap<Severity, u64>);

impl SeverityCounts {
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut counts = Self::default();
        for finding in findings {
            counts.add(finding.severity, 1);
        }
        counts
    }

    /// Adds to a bucket. Unclassified severities are not counted.
    pub fn add(&mut self, severity: Severity, count: u64) {
        if severity != Severity::Unknown {
            *self.0.entry(severity).or_default() += count;
        }
    }

    pub fn get(&self, severity: Severity) -> u64 { self.0.get(&severity).copied().unwrap_or(0) }

    pub fn total(&self) -> u64 { self.0.values().sum() }
}

impl FromIterator<(Severity, u64)> for SeverityCounts {
    fn from_iter<T: IntoIterator<Item = (Severity, u64)>>(iter: T) -> Self {
        let mut counts = Self::default();
        for (severity, count) in iter {
            counts.add(severity, count);
        }
        counts
    }
}

/// Where a finding was detected.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Locator {
    File { path: String, line: Option<u32> },
    Package { name: String, version: Option<String> },
}

impl Locator {
    /// True when there is nothing to point at, e.g. a query that matched no file.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::File { path, .. } => path.is_empty(),
            Self::Package { name, .. } => name.is_empty(),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { path, line: Some(line) } => write!(f, "{path}:{line}"),
            Self::File { path, line: None } => f.write_str(path),
            Self::Package { name, version: Some(version) } if !version.is_empty() => {
                write!(f, "{name}@{version}")
            }
            Self::Package { name, .. } => f.write_str(name),
        }
    }
}

/// One normalized issue detected by a scanner.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub title: String,
    pub locator: Locator,
    #[serde(default)]
    pub description: String,
    /// CVE or CWE identifier, when the tool provides one.
    #[serde(default)]
    pub external_id: Option<String>,
}

/// What the scope metric of a [`ScanResult`] counts.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeUnit {
    #[default]
    Files,
    Components,
}

impl ScopeUnit {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Files => "Files Scanned",
            Self::Components => "Components Scanned",
        }
    }

    pub fn noun(&self) -> &'static str {
        match self {
            Self::Files => "files",
            Self::Components => "components",
        }
    }
}

/// Canonical, scanner-agnostic scan result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub success: bool,
    pub total_issues: u64,
    pub severity_histogram: SeverityCounts,
    pub scope_metric: u64,
    #[serde(default)]
    pub scope_unit: ScopeUnit,
    pub execution_seconds: f64,
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl ScanResult {
    /// Successful result; the histogram and total are derived from `findings`.
    pub fn from_findings(
        findings: Vec<Finding>,
        scope_metric: u64,
        scope_unit: ScopeUnit,
        execution_seconds: f64,
    ) -> Self {
        Self {
            success: true,
            total_issues: findings.len() as u64,
            severity_histogram: SeverityCounts::from_findings(&findings),
            scope_metric,
            scope_unit,
            execution_seconds,
            findings,
            error_message: None,
        }
    }

    /// Failed result with no findings.
    pub fn failed(scope_unit: ScopeUnit, message: impl Into<String>) -> Self {
        Self {
            success: false,
            total_issues: 0,
            severity_histogram: SeverityCounts::default(),
            scope_metric: 0,
            scope_unit,
            execution_seconds: 0.0,
            findings: vec![],
            error_message: Some(message.into()),
        }
    }

    /// Marks an otherwise parsed result as failed, keeping its findings.
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(message.into());
        self
    }

    pub fn count(&self, severity: Severity) -> u64 { self.severity_histogram.get(severity) }
}

/// Tri-state check-run judgment.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conclusion {
    Success,
    Neutral,
    Failure,
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Neutral => "neutral",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationLevel {
    Notice,
    Warning,
    Failure,
}

impl From<Severity> for AnnotationLevel {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Critical | Severity::High => Self::Failure,
            Severity::Medium | Severity::Low => Self::Warning,
            Severity::Info | Severity::Unknown => Self::Notice,
        }
    }
}

/// Inline check-run annotation, in the repository host's wire shape.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub annotation_level: AnnotationLevel,
    pub title: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_normalize() {
        let cases: &[(&str, Severity)] = &[
            ("CRITICAL", Severity::Critical),
            ("high", Severity::High),
            (" Medium ", Severity::Medium),
            ("low", Severity::Low),
            ("Info", Severity::Info),
            ("TRACE", Severity::Info),
            ("blocker", Severity::Unknown),
            ("", Severity::Unknown),
        ];
        for &(value, expected) in cases {
            assert_eq!(Severity::normalize(value), expected, "{value:?}");
        }
    }

    #[test]
    fn test_histogram_skips_unknown() {
        let finding = |severity| Finding {
            severity,
            title: "t".into(),
            locator: Locator::File { path: "main.tf".into(), line: Some(1) },
            description: String::new(),
            external_id: None,
        };
        let result = ScanResult::from_findings(
            vec![finding(Severity::High), finding(Severity::Unknown), finding(Severity::High)],
            3,
            ScopeUnit::Files,
            1.5,
        );
        assert_eq!(result.total_issues, 3);
        assert_eq!(result.count(Severity::High), 2);
        assert_eq!(result.severity_histogram.total(), 2);
        assert!(result.severity_histogram.total() <= result.total_issues);
    }

    #[test]
    fn test_job_context_wire_shape() {
        let id: JobId = "0190b3c4-7f1e-7a2b-9c3d-4e5f60718293".parse().unwrap();
        let context = JobContext::from_event(
            id,
            TriggerEvent {
                repo_owner: "acme".into(),
                repo_name: "svc".into(),
                branch: "main".into(),
                pull_request_id: 7,
                commit_sha: "abc123".into(),
                installation_id: Some(42),
            },
            "http://dispatcher/callback",
        );
        let value = serde_json::to_value(&context).unwrap();
        assert_eq!(value["repoOwner"], "acme");
        assert_eq!(value["pullRequestId"], 7);
        assert_eq!(value["callbackURL"], "http://dispatcher/callback");
        assert!(value.get("callbackUrl").is_none());
        assert_eq!(context.id.context_key(), "job:0190b3c4-7f1e-7a2b-9c3d-4e5f60718293");
        let parsed: JobContext = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(parsed, context);

        let mut legacy = value;
        let callback = legacy.as_object_mut().unwrap().remove("callbackURL").unwrap();
        legacy["callbackUrl"] = callback;
        let parsed: JobContext = serde_json::from_value(legacy).unwrap();
        assert_eq!(parsed.callback_url, "http://dispatcher/callback");
    }

    #[test]
    fn test_queue_message_wire_shape() {
        let message: QueueMessage = serde_json::from_str(
            r#"{"id":"0190b3c4-7f1e-7a2b-9c3d-4e5f60718293","callback_url":"http://x/callback"}"#,
        )
        .unwrap();
        assert_eq!(message.callback_url, "http://x/callback");
        assert!(serde_json::from_str::<QueueMessage>(r#"{"id":"not-a-uuid"}"#).is_err());
    }

    #[test]
    fn test_locator_display() {
        assert_eq!(
            Locator::File { path: "a/b.tf".into(), line: Some(12) }.to_string(),
            "a/b.tf:12"
        );
        assert_eq!(
            Locator::Package { name: "lodash".into(), version: Some("4.17.20".into()) }
                .to_string(),
            "lodash@4.17.20"
        );
        assert!(Locator::File { path: String::new(), line: None }.is_empty());
        assert!(!Locator::Package { name: "lodash".into(), version: None }.is_empty());
    }
}
