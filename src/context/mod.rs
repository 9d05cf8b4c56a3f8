//! Append-only conversation store.
//!
//! Messages are only ever appended. Facts, entity tallies, topic tallies
//! and timeline events are derived at append time, so readers always see
//! a message together with everything it contributed.

pub mod extract;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ContextConfig;
use extract::{Extractor, HeuristicExtractor};

/// Free-form metadata attached to a message by the chat layer.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Only conversational turns feed the fact/entity/topic heuristics.
    fn is_conversational(&self) -> bool {
        matches!(self, Role::User | Role::Assistant)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!(
                "unknown role '{other}' (expected user, assistant or system)"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: u64,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Metadata,
    pub token_estimate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Fact {
    pub text: String,
    pub source_role: Role,
    pub timestamp: DateTime<Utc>,
    pub origin_message_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entity {
    pub name: String,
    pub frequency: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEvent {
    pub message_id: u64,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub summary: String,
}

/// Borrowed view over the derived state. Cheap to take: nothing is
/// recomputed, the slices point straight into the store.
#[derive(Debug, Serialize)]
pub struct DerivedSnapshot<'a> {
    pub facts: &'a [Fact],
    pub entities: &'a [Entity],
    pub timeline: &'a [TimelineEvent],
    pub topics: &'a [Entity],
}

/// Insertion-ordered tally keyed by surface form.
#[derive(Default)]
struct Tally {
    entries: Vec<Entity>,
    index: HashMap<String, usize>,
}

impl Tally {
    fn add(&mut self, name: String) {
        match self.index.get(&name) {
            Some(&i) => self.entries[i].frequency += 1,
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push(Entity { name, frequency: 1 });
            }
        }
    }

    /// Most frequent first; ties keep first-seen order.
    fn top(&self, n: usize) -> Vec<&Entity> {
        let mut ranked: Vec<&Entity> = self.entries.iter().collect();
        ranked.sort_by(|a, b| b.frequency.cmp(&a.frequency));
        ranked.truncate(n);
        ranked
    }
}

pub struct ContextStore {
    messages: Vec<Message>,
    facts: Vec<Fact>,
    entities: Tally,
    topics: Tally,
    timeline: Vec<TimelineEvent>,
    extractor: Arc<dyn Extractor>,
    config: ContextConfig,
    start_time: DateTime<Utc>,
}

impl ContextStore {
    pub fn new(config: ContextConfig) -> Self {
        Self::with_extractor(config, Arc::new(HeuristicExtractor::new()))
    }

    pub fn with_extractor(config: ContextConfig, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            messages: Vec::new(),
            facts: Vec::new(),
            entities: Tally::default(),
            topics: Tally::default(),
            timeline: Vec::new(),
            extractor,
            config,
            start_time: Utc::now(),
        }
    }

    /// Appends a message stamped with the current time.
    pub fn append(&mut self, role: Role, content: impl Into<String>, metadata: Metadata) -> u64 {
        self.append_at(role, content, metadata, Utc::now())
    }

    /// Appends a message with an explicit timestamp (replay entry point).
    ///
    /// All derived contributions are computed before anything is pushed,
    /// so the message and its facts/entities/timeline land together.
    pub fn append_at(
        &mut self,
        role: Role,
        content: impl Into<String>,
        metadata: Metadata,
        timestamp: DateTime<Utc>,
    ) -> u64 {
        let content = content.into();
        let id = self.messages.len() as u64;

        let (facts, entities, topics) = if role.is_conversational() {
            (
                self.extractor.facts(&content),
                self.extractor.entities(&content),
                self.extractor.topics(&content),
            )
        } else {
            (Vec::new(), Vec::new(), Vec::new())
        };

        let event = TimelineEvent {
            message_id: id,
            timestamp,
            role,
            summary: truncate_chars(&content, self.config.timeline_summary_chars),
        };
        let token_estimate = (content.chars().count() / 4) as u32;

        self.facts.extend(facts.into_iter().map(|text| Fact {
            text,
            source_role: role,
            timestamp,
            origin_message_id: id,
        }));
        for name in entities {
            self.entities.add(name);
        }
        for word in topics {
            self.topics.add(word);
        }
        self.timeline.push(event);
        self.messages.push(Message {
            id,
            role,
            content,
            timestamp,
            metadata,
            token_estimate,
        });

        debug!("Appended message {id} ({role})");
        id
    }

    pub fn get(&self, id: u64) -> Option<&Message> {
        usize::try_from(id).ok().and_then(|i| self.messages.get(i))
    }

    /// Messages with `start <= id < end`. An empty intersection is an
    /// empty slice, never an error.
    pub fn slice(&self, start: u64, end: u64) -> &[Message] {
        let len = self.messages.len() as u64;
        let start = start.min(len) as usize;
        let end = end.min(len) as usize;
        if start >= end {
            return &[];
        }
        &self.messages[start..end]
    }

    /// Slice with negative indices counting from the end, the way
    /// sequence slicing works in the navigation language.
    pub fn slice_signed(&self, start: i64, end: i64) -> &[Message] {
        let len = self.messages.len() as i64;
        let resolve = |i: i64| if i < 0 { (len + i).max(0) } else { i.min(len) };
        self.slice(resolve(start) as u64, resolve(end) as u64)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn derived_snapshot(&self) -> DerivedSnapshot<'_> {
        DerivedSnapshot {
            facts: &self.facts,
            entities: &self.entities.entries,
            timeline: &self.timeline,
            topics: &self.topics.entries,
        }
    }

    pub fn facts(&self) -> &[Fact] {
        &self.facts
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities.entries
    }

    pub fn timeline(&self) -> &[TimelineEvent] {
        &self.timeline
    }

    pub fn top_entities(&self, n: usize) -> Vec<&Entity> {
        self.entities.top(n)
    }

    pub fn top_topics(&self, n: usize) -> Vec<&Entity> {
        self.topics.top(n)
    }

    pub fn extractor(&self) -> &dyn Extractor {
        self.extractor.as_ref()
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// A turn is one user/assistant exchange.
    pub fn total_turns(&self) -> usize {
        self.messages.len() / 2
    }
}

/// First `max` characters of `text`, with `...` appended when cut.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}
