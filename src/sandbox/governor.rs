//! Resource governor: explicit counters for time, size and recursion.
//!
//! Nothing here relies on host limits. The interpreter calls [`Governor::tick`]
//! once per evaluated node, capabilities call [`Governor::charge`] with a
//! cost proportional to their work, and every `step_check_interval` units
//! the deadline and the cancellation flag are polled.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::warn;

use super::error::{SandboxError, SandboxResult};
use super::value::Value;
use crate::config::EngineConfig;

/// Shared flag a host uses to stop a running execution early.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arms the token before the next execution.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Live analysis depth of a session, readable from outside the
/// executing thread (stats snapshots).
#[derive(Debug, Clone, Default)]
pub struct DepthGauge(Arc<AtomicU32>);

impl DepthGauge {
    pub fn set(&self, depth: u32) {
        self.0.store(depth, Ordering::Relaxed);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

pub struct Governor {
    deadline: Instant,
    timeout: Duration,
    steps: u64,
    next_check: u64,
    check_interval: u64,
    max_depth: u32,
    max_iterations: usize,
    max_collection_len: usize,
    max_string_len: usize,
    deepest: u32,
    analyses: u32,
    cancel: CancelToken,
    gauge: DepthGauge,
}

impl Governor {
    pub fn new(limits: &EngineConfig, cancel: CancelToken, gauge: DepthGauge) -> Self {
        let started = Instant::now();
        let timeout = limits.timeout();
        let check_interval = limits.step_check_interval.max(1);
        Self {
            deadline: started + timeout,
            timeout,
            steps: 0,
            next_check: check_interval,
            check_interval,
            max_depth: limits.max_recursion_depth,
            max_iterations: limits.max_iterations,
            max_collection_len: limits.max_collection_len,
            max_string_len: limits.max_string_len,
            deepest: 0,
            analyses: 0,
            cancel,
            gauge,
        }
    }

    /// One evaluation step.
    pub fn tick(&mut self) -> SandboxResult<()> {
        self.charge(1)
    }

    /// Accounts `units` steps of work, polling the deadline whenever the
    /// running total crosses the next check point.
    pub fn charge(&mut self, units: u64) -> SandboxResult<()> {
        self.steps = self.steps.saturating_add(units);
        if self.steps >= self.next_check {
            self.next_check = self.steps.saturating_add(self.check_interval);
            self.check_deadline()?;
        }
        Ok(())
    }

    /// Cancellation is reported exactly like a timeout.
    pub fn check_deadline(&self) -> SandboxResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SandboxError::ResourceExceeded(
                "execution cancelled by host".to_string(),
            ));
        }
        if Instant::now() >= self.deadline {
            return Err(SandboxError::ResourceExceeded(format!(
                "execution exceeded timeout of {} ms",
                self.timeout.as_millis()
            )));
        }
        Ok(())
    }

    /// Opens a nested analysis level below `depth`. Fails before the
    /// nested call runs if the ceiling would be crossed.
    pub fn enter_analysis(&mut self, depth: u32) -> SandboxResult<u32> {
        let next = depth + 1;
        if next > self.max_depth {
            warn!(
                "Rejected nested analysis at depth {next} (max {})",
                self.max_depth
            );
            return Err(SandboxError::ResourceExceeded(format!(
                "maximum recursion depth {} exceeded",
                self.max_depth
            )));
        }
        self.deepest = self.deepest.max(next);
        self.gauge.set(next);
        Ok(next)
    }

    /// Returns to `depth` after a nested analysis level finishes.
    pub fn leave_analysis(&mut self, depth: u32) {
        self.gauge.set(depth);
    }

    pub fn record_analysis(&mut self) {
        self.analyses += 1;
    }

    pub fn check_iterations(&self, count: usize) -> SandboxResult<()> {
        if count > self.max_iterations {
            return Err(SandboxError::ResourceExceeded(format!(
                "comprehension over {count} items exceeds the iteration limit of {}",
                self.max_iterations
            )));
        }
        Ok(())
    }

    pub fn check_collection(&self, len: usize) -> SandboxResult<()> {
        if len > self.max_collection_len {
            return Err(SandboxError::ResourceExceeded(format!(
                "collection of {len} items exceeds the limit of {}",
                self.max_collection_len
            )));
        }
        Ok(())
    }

    pub fn check_string(&self, len: usize) -> SandboxResult<()> {
        if len > self.max_string_len {
            return Err(SandboxError::ResourceExceeded(format!(
                "string of {len} bytes exceeds the limit of {}",
                self.max_string_len
            )));
        }
        Ok(())
    }

    /// Deepest analysis level reached so far.
    pub fn deepest(&self) -> u32 {
        self.deepest
    }

    pub fn analyses(&self) -> u32 {
        self.analyses
    }
}

/// Cuts a result down to `max_items` items counted at every nesting
/// level, keeping the earliest ones. The flag reports whether anything
/// was dropped.
pub fn bound_result(value: Value, max_items: usize) -> (Value, bool) {
    let mut budget = max_items;
    let mut truncated = false;
    let value = bound(value, &mut budget, &mut truncated);
    (value, truncated)
}

fn bound(value: Value, budget: &mut usize, truncated: &mut bool) -> Value {
    match value {
        Value::List(items) => {
            let mut kept = Vec::with_capacity(items.len().min(*budget));
            for item in items {
                if *budget == 0 {
                    *truncated = true;
                    break;
                }
                *budget -= 1;
                kept.push(bound(item, budget, truncated));
            }
            Value::List(kept)
        }
        Value::Dict(map) => {
            let mut kept = BTreeMap::new();
            for (key, item) in map {
                if *budget == 0 {
                    *truncated = true;
                    break;
                }
                *budget -= 1;
                kept.insert(key, bound(item, budget, truncated));
            }
            Value::Dict(kept)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> EngineConfig {
        EngineConfig {
            max_recursion_depth: 2,
            timeout_ms: 50,
            step_check_interval: 4,
            max_iterations: 10,
            max_collection_len: 20,
            max_string_len: 30,
            ..EngineConfig::default()
        }
    }

    fn governor() -> Governor {
        Governor::new(&limits(), CancelToken::new(), DepthGauge::default())
    }

    // ── deadline ────────────────────────────────────────

    #[test]
    fn test_deadline_detected_at_check_point() {
        let mut g = governor();
        std::thread::sleep(Duration::from_millis(60));
        // Below the check interval nothing is polled yet
        for _ in 0..3 {
            g.tick().unwrap();
        }
        let err = g.tick().unwrap_err();
        assert!(matches!(err, SandboxError::ResourceExceeded(_)));
        assert!(err.to_string().contains("50 ms"));
    }

    #[test]
    fn test_cancel_is_resource_exceeded() {
        let cancel = CancelToken::new();
        let mut g = Governor::new(&limits(), cancel.clone(), DepthGauge::default());
        cancel.cancel();
        let err = g.charge(100).unwrap_err();
        assert_eq!(
            err,
            SandboxError::ResourceExceeded("execution cancelled by host".into())
        );
        cancel.reset();
        assert!(!cancel.is_cancelled());
    }

    // ── recursion depth ─────────────────────────────────

    #[test]
    fn test_enter_analysis_ceiling() {
        let gauge = DepthGauge::default();
        let mut g = Governor::new(&limits(), CancelToken::new(), gauge.clone());
        assert_eq!(g.enter_analysis(0).unwrap(), 1);
        assert_eq!(g.enter_analysis(1).unwrap(), 2);
        assert_eq!(gauge.get(), 2);
        assert!(g.enter_analysis(2).is_err());
        assert_eq!(g.deepest(), 2);
        g.leave_analysis(0);
        assert_eq!(gauge.get(), 0);
    }

    // ── size limits ─────────────────────────────────────

    #[test]
    fn test_size_checks() {
        let g = governor();
        assert!(g.check_iterations(10).is_ok());
        assert!(g.check_iterations(11).is_err());
        assert!(g.check_collection(21).is_err());
        assert!(g.check_string(31).is_err());
    }

    #[test]
    fn test_bound_result_truncates_and_flags() {
        let (value, truncated) = bound_result(Value::from(vec![1i64, 2, 3, 4]), 2);
        assert!(truncated);
        assert_eq!(value, Value::from(vec![1i64, 2]));

        let (value, truncated) = bound_result(Value::Int(7), 2);
        assert!(!truncated);
        assert_eq!(value, Value::Int(7));
    }

    #[test]
    fn test_bound_result_counts_nested_items() {
        let row = Value::from(vec![1i64, 2, 3]);
        let rows = Value::List(vec![row.clone(), row.clone(), row]);
        assert_eq!(rows.nested_len(), 12);

        let (value, truncated) = bound_result(rows.clone(), 12);
        assert!(!truncated);
        assert_eq!(value, rows);

        let (value, truncated) = bound_result(rows, 6);
        assert!(truncated);
        assert_eq!(value.nested_len(), 6);
        assert_eq!(
            value,
            Value::List(vec![
                Value::from(vec![1i64, 2, 3]),
                Value::from(vec![1i64]),
            ])
        );
    }
}
