//! Checkpoint reply interpretation without a model, and a fallback wrapper
//! that uses it when the model-backed classifier fails.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::pipeline::collaborators::{
    CollabResult, IntentAction, IntentClassification, IntentClassifier, IntentContext,
};

static QUOTED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]+)"|'([^']+)'|`([^`]+)`"#).expect("valid regex"));

static BRANCH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bbranch\s+(?:to\s+|named\s+|called\s+)?([A-Za-z0-9._/\-]+)")
        .expect("valid regex")
});

const CANCEL_LEADS: &[&str] = &["no", "nope", "nah", "stop", "cancel", "abort", "don't", "dont"];
const CANCEL_PHRASES: &[&str] = &[
    "cancel",
    "abort",
    "too risky",
    "do not",
    "don't push",
    "never mind",
    "nevermind",
    "reject",
    "not now",
];
const MODIFY_PHRASES: &[&str] = &[
    "change",
    "instead",
    "modify",
    "but ",
    "rename",
    "call it",
    "use branch",
    "branch ",
    "commit message",
    "also ",
    "add ",
    "remove ",
    "update ",
    "except",
];
const APPROVE_WORDS: &[&str] = &[
    "yes", "y", "yep", "yeah", "ok", "okay", "sure", "approve", "approved", "lgtm", "proceed",
    "continue", "go", "ship", "push", "fine", "good", "great",
];

/// Deterministic keyword classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordIntentClassifier;

impl KeywordIntentClassifier {
    pub fn classify(&self, text: &str) -> IntentClassification {
        let lower = text.trim().to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !(c.is_alphanumeric() || c == '\''))
            .filter(|w| !w.is_empty())
            .collect();

        let Some(first) = words.first() else {
            return clarify();
        };

        if CANCEL_LEADS.contains(first) || CANCEL_PHRASES.iter().any(|p| lower.contains(p)) {
            return IntentClassification {
                action: IntentAction::Cancel,
                extracted_override: None,
                confidence: 0.8,
            };
        }

        if MODIFY_PHRASES.iter().any(|p| lower.contains(p)) {
            return IntentClassification {
                action: IntentAction::Modify,
                extracted_override: Some(extract_override(text)),
                confidence: 0.6,
            };
        }

        if words.iter().any(|w| APPROVE_WORDS.contains(w)) || lower.contains("looks good") {
            return IntentClassification {
                action: IntentAction::Approve,
                extracted_override: None,
                confidence: 0.7,
            };
        }

        clarify()
    }
}

fn clarify() -> IntentClassification {
    IntentClassification {
        action: IntentAction::Clarify,
        extracted_override: None,
        confidence: 0.0,
    }
}

/// Branch name, quoted text, or the whole reply, in that order.
fn extract_override(text: &str) -> String {
    if let Some(name) = BRANCH.captures(text).and_then(|c| c.get(1)) {
        return name.as_str().trim_end_matches(['.', ',']).to_string();
    }
    if let Some(caps) = QUOTED.captures(text) {
        if let Some(m) = caps.iter().skip(1).flatten().next() {
            return m.as_str().to_string();
        }
    }
    text.trim().to_string()
}

#[async_trait]
impl IntentClassifier for KeywordIntentClassifier {
    async fn classify_intent(
        &self,
        text: &str,
        _ctx: &IntentContext,
    ) -> CollabResult<IntentClassification> {
        Ok(self.classify(text))
    }
}

/// Tries `primary`, falls back to keywords when it errors.
pub struct FallbackIntentClassifier {
    primary: Arc<dyn IntentClassifier>,
    fallback: KeywordIntentClassifier,
}

impl FallbackIntentClassifier {
    pub fn new(primary: Arc<dyn IntentClassifier>) -> Self {
        Self {
            primary,
            fallback: KeywordIntentClassifier,
        }
    }
}

#[async_trait]
impl IntentClassifier for FallbackIntentClassifier {
    async fn classify_intent(
        &self,
        text: &str,
        ctx: &IntentContext,
    ) -> CollabResult<IntentClassification> {
        match self.primary.classify_intent(text, ctx).await {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::warn!(error = %e, "Intent classifier failed, using keyword fallback");
                Ok(self.fallback.classify(text))
            }
        }
    }
}
