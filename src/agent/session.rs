//! One conversation: its store, its execution log and its stats.
//!
//! A session runs one execution at a time. Sessions share the engine
//! (and through it the capability registry) but nothing mutable.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::stats::{SessionStats, StatsSnapshot};
use crate::config::ContextConfig;
use crate::context::{ContextStore, Entity, Fact, Message, Metadata, Role, TimelineEvent};
use crate::sandbox::governor::{CancelToken, DepthGauge};
use crate::sandbox::{Engine, ExecutionRecord, ExecutionResult};

/// How much of each view the context dump returns.
const DUMP_MESSAGES: usize = 50;
const DUMP_FACTS: usize = 20;
const DUMP_ENTITIES: usize = 20;
const DUMP_TIMELINE: usize = 30;
const DUMP_EXECUTIONS: usize = 10;

pub struct Session {
    id: String,
    store: ContextStore,
    engine: Arc<Engine>,
    stats: SessionStats,
    /// Oldest first, evicted beyond `execution_log_capacity`
    log: VecDeque<ExecutionRecord>,
    cancel: CancelToken,
    gauge: DepthGauge,
}

/// Read-only dump for tooling and debugging.
#[derive(Debug, Serialize)]
pub struct ContextDump<'a> {
    pub messages: &'a [Message],
    pub facts: &'a [Fact],
    pub entities: Vec<&'a Entity>,
    pub timeline: &'a [TimelineEvent],
    /// Most recent executions, oldest first
    pub executions: Vec<LoggedExecution<'a>>,
    pub metadata: DumpMetadata,
    pub stats: StatsSnapshot,
}

/// An execution as the dump shows it: the wire result plus what was
/// submitted and when.
#[derive(Debug, Serialize)]
pub struct LoggedExecution<'a> {
    #[serde(flatten)]
    pub result: ExecutionResult,
    pub code: &'a str,
    pub description: &'a str,
    pub timestamp: DateTime<Utc>,
}

impl<'a> From<&'a ExecutionRecord> for LoggedExecution<'a> {
    fn from(record: &'a ExecutionRecord) -> Self {
        Self {
            result: record.to_response(),
            code: &record.code,
            description: &record.description,
            timestamp: record.timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DumpMetadata {
    pub start_time: DateTime<Utc>,
    pub total_turns: usize,
}

fn tail<T>(items: &[T], n: usize) -> &[T] {
    &items[items.len().saturating_sub(n)..]
}

impl Session {
    pub fn new(id: impl Into<String>, engine: Arc<Engine>, context: ContextConfig) -> Self {
        Self {
            id: id.into(),
            store: ContextStore::new(context),
            engine,
            stats: SessionStats::new(),
            log: VecDeque::new(),
            cancel: CancelToken::new(),
            gauge: DepthGauge::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>, metadata: Metadata) -> u64 {
        self.store.append(role, content, metadata)
    }

    /// Runs `code` against this session's store and logs the outcome.
    ///
    /// Clears any cancellation left over from an earlier request first.
    pub fn execute(&mut self, code: &str, description: &str) -> ExecutionRecord {
        self.cancel.reset();
        let record = self
            .engine
            .execute(code, description, &self.store, &self.cancel, &self.gauge);
        self.stats.record(&record);

        let capacity = self.engine.limits().execution_log_capacity;
        if capacity > 0 {
            while self.log.len() >= capacity {
                self.log.pop_front();
            }
            self.log.push_back(record.clone());
        }
        debug!(
            "Session {}: {} executions logged",
            self.id,
            self.log.len()
        );
        record
    }

    /// Logged executions, oldest first.
    pub fn executions(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.log.iter()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot(&self.store, self.gauge.get())
    }

    pub fn context_dump(&self) -> ContextDump<'_> {
        let derived = self.store.derived_snapshot();
        ContextDump {
            messages: tail(self.store.messages(), DUMP_MESSAGES),
            facts: tail(derived.facts, DUMP_FACTS),
            entities: self.store.top_entities(DUMP_ENTITIES),
            timeline: tail(derived.timeline, DUMP_TIMELINE),
            executions: self
                .executions()
                .skip(self.log.len().saturating_sub(DUMP_EXECUTIONS))
                .map(LoggedExecution::from)
                .collect(),
            metadata: DumpMetadata {
                start_time: self.store.start_time(),
                total_turns: self.store.total_turns(),
            },
            stats: self.stats(),
        }
    }

    /// Handle the host can trip while an execution is running.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}
