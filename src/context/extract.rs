//! Derivation heuristics for facts, entities and topics.
//!
//! Everything here is a pure function of message content: the store runs
//! the extractor at append time, and replaying the same messages through
//! the same extractor yields the same derived state.

use std::collections::HashMap;

use regex::Regex;

/// Words that open sentences often enough to look like entities.
const COMMON_CAPITALIZED: &[&str] = &[
    "The", "This", "That", "These", "Those", "When", "Where", "What", "Why", "How", "Which", "Who",
];

const TOPIC_STOPWORDS: &[&str] = &[
    "this", "that", "with", "from", "have", "will", "what", "when", "where", "which", "about",
    "their", "there",
];

/// Pluggable derivation of facts, entities and topics from message text.
///
/// Implementations must be deterministic: the same content always yields
/// the same output, in the same order.
pub trait Extractor: Send + Sync {
    /// Sentences that read as factual statements.
    fn facts(&self, content: &str) -> Vec<String>;

    /// Entity surface forms, one entry per occurrence.
    fn entities(&self, content: &str) -> Vec<String>;

    /// Topic words, one entry per occurrence.
    fn topics(&self, content: &str) -> Vec<String>;

    /// Short highlight lines, used when summarizing assistant turns.
    fn key_points(&self, _content: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Default keyword/regex heuristic.
pub struct HeuristicExtractor {
    sentence_split: Regex,
    fact_indicator: Regex,
    entity: Regex,
    word: Regex,
    bullet: Regex,
}

impl HeuristicExtractor {
    pub fn new() -> Self {
        // Constant patterns; compilation cannot fail.
        Self {
            sentence_split: Regex::new(r"[.!?]+").expect("sentence pattern"),
            fact_indicator: Regex::new(r"(?i)\b(?:is|are|was|were|has|have|shows|indicates)\b")
                .expect("fact indicator pattern"),
            entity: Regex::new(r"\b[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*\b").expect("entity pattern"),
            word: Regex::new(r"\b\w{4,}\b").expect("word pattern"),
            bullet: Regex::new(r"(?m)^[*\-\d.]\s*([^\n]{20,100})").expect("bullet pattern"),
        }
    }
}

impl Default for HeuristicExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for HeuristicExtractor {
    fn facts(&self, content: &str) -> Vec<String> {
        self.sentence_split
            .split(content)
            .map(str::trim)
            .filter(|s| {
                let len = s.chars().count();
                len > 20 && len < 200
            })
            .filter(|s| self.fact_indicator.is_match(s))
            .map(String::from)
            .collect()
    }

    fn entities(&self, content: &str) -> Vec<String> {
        self.entity
            .find_iter(content)
            .map(|m| m.as_str())
            .filter(|w| !COMMON_CAPITALIZED.contains(w) && w.chars().count() > 2)
            .map(String::from)
            .collect()
    }

    fn topics(&self, content: &str) -> Vec<String> {
        let lowered = content.to_lowercase();
        self.word
            .find_iter(&lowered)
            .map(|m| m.as_str())
            .filter(|w| !TOPIC_STOPWORDS.contains(w))
            .map(String::from)
            .collect()
    }

    /// Bullet-style lines (`- ...`, `* ...`, `1. ...`) of 20–100 chars,
    /// at most two per message.
    fn key_points(&self, content: &str) -> Vec<String> {
        self.bullet
            .captures_iter(content)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .take(2)
            .collect()
    }
}

/// Ranks words by frequency across `texts`, most frequent first.
/// Ties keep first-seen order.
pub fn rank_words<'a, I>(extractor: &dyn Extractor, texts: I, limit: usize) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, u32> = HashMap::new();

    for text in texts {
        for word in extractor.topics(text) {
            let count = counts.entry(word.clone()).or_insert(0);
            if *count == 0 {
                order.push(word);
            }
            *count += 1;
        }
    }

    // Stable sort keeps first-seen order among equal counts
    order.sort_by(|a, b| counts[b].cmp(&counts[a]));
    order.truncate(limit);
    order
}
