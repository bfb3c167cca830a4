//! AI layer: API client, retry policy, prompts and the stage agents built on them.

pub mod agents;
pub mod client;
pub mod intent;
pub mod prompts;
pub mod retry;

pub use agents::LlmAgents;
pub use client::{AiClient, AiClientConfig};
pub use intent::{FallbackIntentClassifier, KeywordIntentClassifier};
