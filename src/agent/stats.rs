//! Per-session execution bookkeeping. Read-only with respect to
//! execution: nothing here feeds back into how code runs.

use std::time::Duration;

use serde::Serialize;

use crate::context::ContextStore;
use crate::sandbox::ExecutionRecord;

#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    executions: u64,
    successful: u64,
    failed: u64,
    recursive_calls: u64,
    /// Total wall time of successful executions
    success_time: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_messages: usize,
    pub total_facts: usize,
    pub total_entities: usize,
    pub executions: u64,
    pub successful: u64,
    pub failed: u64,
    /// Percentage, 0 when nothing has run
    pub success_rate: f64,
    pub recursive_calls: u64,
    /// Mean wall time of successful executions, in seconds
    pub avg_execution_time: f64,
    pub current_recursion_depth: u32,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: &ExecutionRecord) {
        self.executions += 1;
        self.recursive_calls += u64::from(record.analysis_calls);
        if record.is_success() {
            self.successful += 1;
            self.success_time += record.duration;
        } else {
            self.failed += 1;
        }
    }

    pub fn snapshot(&self, store: &ContextStore, current_depth: u32) -> StatsSnapshot {
        let success_rate = if self.executions == 0 {
            0.0
        } else {
            self.successful as f64 / self.executions as f64 * 100.0
        };
        let avg_execution_time = if self.successful == 0 {
            0.0
        } else {
            round4(self.success_time.as_secs_f64() / self.successful as f64)
        };

        StatsSnapshot {
            total_messages: store.len(),
            total_facts: store.facts().len(),
            total_entities: store.entities().len(),
            executions: self.executions,
            successful: self.successful,
            failed: self.failed,
            success_rate,
            recursive_calls: self.recursive_calls,
            avg_execution_time,
            current_recursion_depth: current_depth,
        }
    }
}

fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}
