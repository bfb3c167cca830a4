//! Typed results produced by each stage.

use serde::{Deserialize, Serialize};

/// Structured reading of the user's prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefactorSpec {
    pub title: String,
    pub goal: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefactorPlan {
    pub summary: String,
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub risks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Create,
    Modify,
    Delete,
}

impl ChangeOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
        }
    }
}

/// One file edit. `content` is the full new file body for create/modify.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub operation: ChangeOp,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeChanges {
    pub changes: Vec<FileChange>,
    #[serde(default)]
    pub summary: String,
}

impl CodeChanges {
    pub fn paths(&self) -> Vec<&str> {
        self.changes.iter().map(|c| c.path.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// One compiler or test diagnostic parsed from build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDiagnostic {
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub success: bool,
    pub command: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_ms: u64,
    pub diagnostics: Vec<BuildDiagnostic>,
    /// Last lines of combined output, kept for fix hints and reports.
    pub output_tail: Vec<String>,
}

impl ValidationResult {
    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrDescription {
    pub title: String,
    pub body: String,
    /// Suggested commit message; the title is used when absent.
    #[serde(default)]
    pub commit_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResult {
    pub branch: String,
    pub commit: String,
    pub remote: String,
}

/// Context handed to a re-transformation: what went wrong last time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixHint {
    pub attempt: u32,
    pub summary: String,
    #[serde(default)]
    pub diagnostics: Vec<BuildDiagnostic>,
    #[serde(default)]
    pub output_tail: Vec<String>,
    /// User-provided direction from a validation checkpoint.
    #[serde(default)]
    pub user_feedback: Option<String>,
}
