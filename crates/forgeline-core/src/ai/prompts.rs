//! System prompts and user-message builders for the stage agents.
//!
//! Every agent answers with a single JSON object; the shapes mirror the
//! artifact types in `pipeline::artifacts`.

use std::fmt::Write;

use crate::pipeline::artifacts::{
    CodeChanges, FixHint, RefactorPlan, RefactorSpec, ValidationResult,
};
use crate::pipeline::collaborators::{IntentContext, PlanContext};

pub const INTAKE_SYSTEM: &str = r#"You turn a developer's refactoring request into a precise specification.
Answer with one JSON object and nothing else:
{"title": string, "goal": string, "constraints": [string], "target_files": [string]}
"title" is a short imperative summary. "target_files" lists paths the request names explicitly, if any."#;

pub const PLAN_SYSTEM: &str = r#"You plan source-code refactorings for Java/Kotlin repositories.
Answer with one JSON object and nothing else:
{"summary": string, "steps": [{"description": string, "files": [string]}], "risks": [string]}
Paths are relative to the repository root. Keep the plan minimal and mechanical; every step must name the files it touches."#;

pub const TRANSFORM_SYSTEM: &str = r#"You apply a refactoring plan to source files.
Answer with one JSON object and nothing else:
{"summary": string, "changes": [{"path": string, "operation": "create"|"modify"|"delete", "content": string|null}]}
"content" is the COMPLETE new file body for create and modify, and null for delete. Paths are relative to the repository root.
When a previous attempt failed to build, fix the reported errors without undoing the refactoring."#;

pub const NARRATE_SYSTEM: &str = r#"You write pull request descriptions for automated refactorings.
Answer with one JSON object and nothing else:
{"title": string, "body": string, "commit_message": string}
The body is Markdown: what changed, why, and how it was verified."#;

pub const CLASSIFY_SYSTEM: &str = r#"You interpret a user's reply at a confirmation checkpoint of an automated refactoring pipeline.
Answer with one JSON object and nothing else:
{"action": "approve"|"modify"|"cancel"|"clarify", "extracted_override": string|null, "confidence": number}
- approve: the user agrees to continue.
- modify: the user wants a change. Put the requested change, branch name or commit message in "extracted_override".
- cancel: the user refuses or wants to stop.
- clarify: the reply is a question or is ambiguous.
"confidence" is between 0 and 1."#;

pub fn intake_message(prompt: &str) -> String {
    format!("Refactoring request:\n{}", prompt.trim())
}

pub fn plan_message(spec: &RefactorSpec, ctx: &PlanContext) -> String {
    let mut msg = String::new();
    let _ = writeln!(msg, "Specification:\n{}", to_pretty(spec));
    let _ = writeln!(msg, "\nRepository files:\n{}", ctx.repo_summary);
    if let Some(feedback) = &ctx.feedback {
        let _ = writeln!(msg, "\nThe user reviewed a previous plan and asked for: {}", feedback);
    }
    msg
}

/// `files` holds (path, current content) for files the plan touches.
pub fn transform_message(
    plan: &RefactorPlan,
    spec: &RefactorSpec,
    files: &[(String, String)],
    fix_hint: Option<&FixHint>,
) -> String {
    let mut msg = String::new();
    let _ = writeln!(msg, "Goal: {}", spec.goal);
    let _ = writeln!(msg, "\nPlan:\n{}", to_pretty(plan));

    if !files.is_empty() {
        let _ = writeln!(msg, "\nCurrent file contents:");
        for (path, content) in files {
            let _ = writeln!(msg, "\n--- {} ---\n{}", path, content);
        }
    }

    if let Some(hint) = fix_hint {
        let _ = writeln!(msg, "\nPrevious attempt {} failed: {}", hint.attempt, hint.summary);
        for d in hint.diagnostics.iter().take(40) {
            let location = match (&d.file, d.line) {
                (Some(file), Some(line)) => format!("{}:{}", file, line),
                (Some(file), None) => file.clone(),
                _ => "build".to_string(),
            };
            let _ = writeln!(msg, "- {:?} {}: {}", d.severity, location, d.message);
        }
        if hint.diagnostics.is_empty() && !hint.output_tail.is_empty() {
            let _ = writeln!(msg, "\nBuild output (tail):");
            for line in hint.output_tail.iter().rev().take(60).rev() {
                let _ = writeln!(msg, "{}", line);
            }
        }
        if let Some(feedback) = &hint.user_feedback {
            let _ = writeln!(msg, "\nThe user asked for: {}", feedback);
        }
    }
    msg
}

pub fn narrate_message(changes: &CodeChanges, validation: &ValidationResult) -> String {
    let mut msg = String::new();
    let _ = writeln!(msg, "Change summary: {}", changes.summary);
    let _ = writeln!(msg, "\nFiles:");
    for change in &changes.changes {
        let _ = writeln!(msg, "- {} {}", change.operation.as_str(), change.path);
    }
    let _ = writeln!(
        msg,
        "\nValidation: `{}` {} in {}ms",
        validation.command,
        if validation.success { "passed" } else { "failed" },
        validation.duration_ms
    );
    msg
}

pub fn classify_message(text: &str, ctx: &IntentContext) -> String {
    format!(
        "Checkpoint: {}\nThe user is being asked to confirm: {}\n\nUser reply:\n{}",
        ctx.checkpoint, ctx.summary, text
    )
}

fn to_pretty<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}
