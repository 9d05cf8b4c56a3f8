//! Recursive analysis: the "analyze a sub-range" hook and its default
//! descriptive implementation.
//!
//! Analysis here is a bounded string transform over a message selection.
//! Hosts that want a model-backed analysis implement [`Analyzer`] and hand
//! it to the engine; depth accounting stays with the governor either way.

pub mod orchestrator;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::context::extract::{rank_words, Extractor};
use crate::context::Message;
use crate::sandbox::value::Value;

pub const DEFAULT_PROMPT: &str = "Analyze this subsection";

/// Input of one analysis call.
pub struct AnalysisRequest<'a> {
    pub messages: Vec<&'a Message>,
    pub prompt: &'a str,
    /// Level of this analysis, 1 for a top-level call
    pub depth: u32,
    pub extractor: &'a dyn Extractor,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub subsection_size: usize,
    pub summary: String,
    pub key_topics: Vec<String>,
    pub depth: u32,
    pub message_ids: Vec<u64>,
    pub prompt: String,
}

impl AnalysisResult {
    pub fn to_value(&self) -> Value {
        let mut d = BTreeMap::new();
        d.insert("subsection_size".to_string(), Value::from(self.subsection_size));
        d.insert("summary".to_string(), Value::from(self.summary.as_str()));
        d.insert("key_topics".to_string(), Value::from(self.key_topics.clone()));
        d.insert("depth".to_string(), Value::from(self.depth));
        d.insert("message_ids".to_string(), Value::from(self.message_ids.clone()));
        d.insert("prompt".to_string(), Value::from(self.prompt.as_str()));
        Value::Dict(d)
    }
}

/// Pluggable analysis step.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, request: &AnalysisRequest<'_>) -> anyhow::Result<AnalysisResult>;

    fn description(&self) -> &str {
        "custom analyzer"
    }
}

/// Keyword-based description of a message selection.
#[derive(Debug)]
pub struct DescriptiveAnalyzer {
    topic_limit: usize,
}

impl DescriptiveAnalyzer {
    pub fn new() -> Self {
        Self { topic_limit: 5 }
    }
}

impl Default for DescriptiveAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer for DescriptiveAnalyzer {
    fn analyze(&self, request: &AnalysisRequest<'_>) -> anyhow::Result<AnalysisResult> {
        let key_topics = rank_words(
            request.extractor,
            request.messages.iter().map(|m| m.content.as_str()),
            self.topic_limit,
        );
        let count = request.messages.len();
        let summary = if key_topics.is_empty() {
            format!("Discussed {count} messages")
        } else {
            format!("Discussed {count} messages about: {}", key_topics.join(", "))
        };

        Ok(AnalysisResult {
            subsection_size: count,
            summary,
            key_topics,
            depth: request.depth,
            message_ids: request.messages.iter().map(|m| m.id).collect(),
            prompt: request.prompt.to_string(),
        })
    }

    fn description(&self) -> &str {
        "descriptive keyword summary"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::context::{ContextStore, Metadata, Role};

    #[test]
    fn test_descriptive_summary() {
        let mut store = ContextStore::new(ContextConfig::default());
        store.append(Role::User, "Explain quantum entanglement", Metadata::new());
        store.append(Role::Assistant, "Quantum entanglement links particles", Metadata::new());

        let request = AnalysisRequest {
            messages: store.messages().iter().collect(),
            prompt: DEFAULT_PROMPT,
            depth: 1,
            extractor: store.extractor(),
        };
        let result = DescriptiveAnalyzer::new().analyze(&request).unwrap();
        assert_eq!(result.subsection_size, 2);
        assert_eq!(result.key_topics[..2], ["quantum", "entanglement"]);
        assert!(result
            .summary
            .starts_with("Discussed 2 messages about: quantum, entanglement"));
        assert_eq!(result.message_ids, vec![0, 1]);
    }

    #[test]
    fn test_empty_selection() {
        let store = ContextStore::new(ContextConfig::default());
        let request = AnalysisRequest {
            messages: Vec::new(),
            prompt: DEFAULT_PROMPT,
            depth: 1,
            extractor: store.extractor(),
        };
        let result = DescriptiveAnalyzer::new().analyze(&request).unwrap();
        assert_eq!(result.summary, "Discussed 0 messages");
        assert!(result.key_topics.is_empty());
    }
}
