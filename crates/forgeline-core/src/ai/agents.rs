//! LLM-backed stage collaborators.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::client::AiClient;
use super::prompts;
use crate::constants;
use crate::error::CollaboratorError;
use crate::pipeline::artifacts::{
    CodeChanges, FixHint, PrDescription, RefactorPlan, RefactorSpec, ValidationResult,
};
use crate::pipeline::collaborators::{
    CollabResult, IntakeAgent, IntentClassification, IntentClassifier, IntentContext,
    NarrateAgent, PlanAgent, PlanContext, TransformAgent, TransformContext,
};

/// Intake, plan, transform, narrate and intent classification over one client.
#[derive(Clone)]
pub struct LlmAgents {
    client: Arc<AiClient>,
}

impl LlmAgents {
    pub fn new(client: Arc<AiClient>) -> Self {
        Self { client }
    }

    async fn ask<T: DeserializeOwned>(&self, system: &str, user: &str, what: &str) -> CollabResult<T> {
        let reply = self.client.call_simple(system, user).await?;
        decode_json(&reply).map_err(|e| {
            tracing::warn!(what, error = %e, "Unusable model reply");
            CollaboratorError::Rejected(format!("{} reply was not valid JSON: {}", what, e))
        })
    }
}

#[async_trait]
impl IntakeAgent for LlmAgents {
    async fn intake(&self, prompt: &str) -> CollabResult<RefactorSpec> {
        self.ask(prompts::INTAKE_SYSTEM, &prompts::intake_message(prompt), "intake")
            .await
    }
}

#[async_trait]
impl PlanAgent for LlmAgents {
    async fn plan(&self, spec: &RefactorSpec, ctx: &PlanContext) -> CollabResult<RefactorPlan> {
        self.ask(prompts::PLAN_SYSTEM, &prompts::plan_message(spec, ctx), "plan")
            .await
    }
}

#[async_trait]
impl TransformAgent for LlmAgents {
    async fn transform(
        &self,
        plan: &RefactorPlan,
        ctx: &TransformContext,
        fix_hint: Option<&FixHint>,
    ) -> CollabResult<CodeChanges> {
        let files = read_plan_files(&ctx.repo_path, plan);
        let message = prompts::transform_message(plan, &ctx.spec, &files, fix_hint);
        self.ask(prompts::TRANSFORM_SYSTEM, &message, "transform").await
    }
}

#[async_trait]
impl NarrateAgent for LlmAgents {
    async fn narrate(
        &self,
        changes: &CodeChanges,
        validation: &ValidationResult,
    ) -> CollabResult<PrDescription> {
        self.ask(
            prompts::NARRATE_SYSTEM,
            &prompts::narrate_message(changes, validation),
            "narrate",
        )
        .await
    }
}

#[async_trait]
impl IntentClassifier for LlmAgents {
    async fn classify_intent(
        &self,
        text: &str,
        ctx: &IntentContext,
    ) -> CollabResult<IntentClassification> {
        self.ask(
            prompts::CLASSIFY_SYSTEM,
            &prompts::classify_message(text, ctx),
            "classify",
        )
        .await
    }
}

/// Current contents of every existing file the plan names, skipping
/// anything too large to inline.
fn read_plan_files(repo: &Path, plan: &RefactorPlan) -> Vec<(String, String)> {
    let mut seen = std::collections::BTreeSet::new();
    let mut files = Vec::new();
    for path in plan.steps.iter().flat_map(|s| s.files.iter()) {
        if !seen.insert(path.clone()) {
            continue;
        }
        let Ok(full) = crate::workspace::resolve_in_workspace(repo, path) else {
            continue;
        };
        match std::fs::metadata(&full) {
            Ok(meta) if meta.len() as usize <= constants::ai::MAX_INLINE_FILE_BYTES => {}
            _ => continue,
        }
        if let Ok(content) = std::fs::read_to_string(&full) {
            files.push((path.clone(), content));
        }
    }
    files
}

/// Parse a JSON object out of a model reply, tolerating code fences and
/// prose around it.
pub fn decode_json<T: DeserializeOwned>(reply: &str) -> Result<T, serde_json::Error> {
    let trimmed = strip_fences(reply.trim());
    match serde_json::from_str(trimmed) {
        Ok(value) => Ok(value),
        Err(first_err) => match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if end > start => serde_json::from_str(&trimmed[start..=end]),
            _ => Err(first_err),
        },
    }
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the language tag line
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}
