//! Execution sandbox for submitted navigation code.
//!
//! The security model is layered:
//!
//! 1. Token scan: denied keywords, host-facing names, dunders, f-strings
//! 2. Structural parse into a small expression AST
//! 3. Scope check: only registry names may be called, only earlier
//!    bindings may be read
//! 4. Tree-walking evaluation under the [`governor::Governor`]
//!    (deadline, recursion ceiling, iteration and size caps)
//! 5. Panic containment at the [`Engine::execute`] boundary
//!
//! Every outcome, including rejections, becomes an [`ExecutionRecord`].

pub mod ast;
pub mod error;
pub mod governor;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod suggest;
pub mod validator;
pub mod value;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysis::Analyzer;
use crate::capabilities::CapabilityRegistry;
use crate::config::EngineConfig;
use crate::context::ContextStore;
use error::{ExecutionStatus, SandboxError, SandboxResult};
use governor::{bound_result, CancelToken, DepthGauge, Governor};
use interpreter::Interpreter;
use value::Value;

/// Terminal outcome of one submission, kept in the session log.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub code: String,
    pub description: String,
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration: Duration,
    pub recursion_depth_used: u32,
    /// The result was cut down to `max_result_items`
    pub truncated: bool,
    pub analysis_calls: u32,
    pub timestamp: DateTime<Utc>,
}

/// Wire shape of an execution result.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub recursion_depth_used: u32,
    pub truncated: bool,
}

impl ExecutionRecord {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn to_response(&self) -> ExecutionResult {
        ExecutionResult {
            execution_id: self.id.to_string(),
            status: self.status,
            result: self.result.clone(),
            error: self.error.clone(),
            duration_ms: u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
            recursion_depth_used: self.recursion_depth_used,
            truncated: self.truncated,
        }
    }
}

/// What one governed run produced, before it becomes a record.
struct RunOutcome {
    result: SandboxResult<Value>,
    deepest: u32,
    analyses: u32,
}

impl RunOutcome {
    fn rejected(error: SandboxError) -> Self {
        Self {
            result: Err(error),
            deepest: 0,
            analyses: 0,
        }
    }
}

/// Validates and runs submitted code against a context store.
///
/// Holds only immutable state, so one engine serves every session.
pub struct Engine {
    registry: Arc<CapabilityRegistry>,
    analyzer: Arc<dyn Analyzer>,
    limits: EngineConfig,
}

impl Engine {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        analyzer: Arc<dyn Analyzer>,
        limits: EngineConfig,
    ) -> Self {
        Self {
            registry,
            analyzer,
            limits,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn limits(&self) -> &EngineConfig {
        &self.limits
    }

    /// Screens `code` without running it.
    pub fn validate(&self, code: &str) -> SandboxResult<()> {
        validator::validate(code, &self.registry, &self.limits).map(|_| ())
    }

    /// Runs `code` to completion, rejection, or a resource ceiling.
    ///
    /// Never panics and never returns an error: every outcome is a record.
    /// `cancel` is polled with the deadline; `gauge` mirrors the current
    /// analysis level while the run is in progress.
    pub fn execute(
        &self,
        code: &str,
        description: &str,
        store: &ContextStore,
        cancel: &CancelToken,
        gauge: &DepthGauge,
    ) -> ExecutionRecord {
        let started = Instant::now();
        debug!("Executing: {description}");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run(code, store, cancel.clone(), gauge.clone())
        }))
        .unwrap_or_else(|payload| {
            RunOutcome::rejected(SandboxError::runtime(format!(
                "evaluation panicked: {}",
                panic_message(payload.as_ref())
            )))
        });
        gauge.set(0);

        let duration = started.elapsed();
        let mut record = ExecutionRecord {
            id: Uuid::new_v4(),
            code: code.to_string(),
            description: description.to_string(),
            status: ExecutionStatus::Success,
            result: None,
            error: None,
            duration,
            recursion_depth_used: outcome.deepest,
            truncated: false,
            analysis_calls: outcome.analyses,
            timestamp: Utc::now(),
        };

        match outcome.result {
            Ok(value) => {
                let (value, truncated) = bound_result(value, self.limits.max_result_items);
                if truncated {
                    warn!(
                        "Result truncated to {} items: {description}",
                        self.limits.max_result_items
                    );
                }
                record.result = Some(value);
                record.truncated = truncated;
                info!(
                    "Execution succeeded in {}ms: {description}",
                    duration.as_millis()
                );
            }
            Err(e) => {
                record.status = e.status();
                record.error = Some(e.to_string());
                warn!(
                    "Execution failed ({}) in {}ms: {e}",
                    record.status.as_str(),
                    duration.as_millis()
                );
            }
        }
        record
    }

    fn run(
        &self,
        code: &str,
        store: &ContextStore,
        cancel: CancelToken,
        gauge: DepthGauge,
    ) -> RunOutcome {
        let program = match validator::validate(code, &self.registry, &self.limits) {
            Ok(program) => program,
            Err(e) => return RunOutcome::rejected(e),
        };

        let governor = Governor::new(&self.limits, cancel, gauge);
        let mut interpreter = Interpreter::new(
            &self.registry,
            store,
            self.analyzer.as_ref(),
            &self.limits,
            governor,
        );
        let result = interpreter.run(&program);
        let governor = interpreter.governor();
        RunOutcome {
            result,
            deepest: governor.deepest(),
            analyses: governor.analyses(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::DescriptiveAnalyzer;
    use crate::capabilities::registry::RegistryBuilder;
    use crate::capabilities::{Args, CallContext, Capability, CapabilityGroup, Param};
    use crate::config::ContextConfig;
    use crate::context::{Metadata, Role};

    fn engine_with(limits: EngineConfig) -> Engine {
        Engine::new(
            CapabilityRegistry::standard(),
            Arc::new(DescriptiveAnalyzer::new()),
            limits,
        )
    }

    fn engine() -> Engine {
        engine_with(EngineConfig::default())
    }

    fn quantum_store() -> ContextStore {
        let mut store = ContextStore::new(ContextConfig::default());
        store.append(Role::User, "What is quantum computing?", Metadata::new());
        store.append(Role::Assistant, "Quantum computing uses qubits.", Metadata::new());
        store.append(
            Role::User,
            "How does it differ from classical computing?",
            Metadata::new(),
        );
        store
    }

    fn exec(engine: &Engine, store: &ContextStore, code: &str) -> ExecutionRecord {
        engine.execute(code, "test", store, &CancelToken::new(), &DepthGauge::default())
    }

    fn ids(value: &Value) -> Vec<i64> {
        let Value::List(items) = value else {
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|m| match m {
                Value::Dict(d) => d.get("id").and_then(Value::as_int),
                _ => None,
            })
            .collect()
    }

    // ── scenarios ───────────────────────────────────────

    #[test]
    fn test_find_quantum_returns_first_two_messages() {
        let store = quantum_store();
        let record = exec(&engine(), &store, "result = find_messages(\"quantum\")");
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(ids(record.result.as_ref().unwrap()), vec![0, 1]);
    }

    #[test]
    fn test_import_is_security_violation() {
        let store = quantum_store();
        let record = exec(&engine(), &store, "import os");
        assert_eq!(record.status, ExecutionStatus::SecurityViolation);
        assert!(record.result.is_none());

        let response = serde_json::to_value(record.to_response()).unwrap();
        assert_eq!(response["status"], "security_violation");
        assert!(response["result"].is_null());
    }

    #[test]
    fn test_six_nested_analyses_exceed_depth_five() {
        let store = quantum_store();
        let code = "result = analyze_subsection(analyze_subsection(analyze_subsection(\
                    analyze_subsection(analyze_subsection(analyze_subsection([0]))))))";
        let record = exec(&engine(), &store, code);
        assert_eq!(record.status, ExecutionStatus::ResourceExceeded);
        assert_eq!(record.recursion_depth_used, 5);
        assert!(record.error.unwrap().contains("maximum recursion depth 5"));
    }

    #[test]
    fn test_five_nested_analyses_succeed() {
        let store = quantum_store();
        let code = "result = analyze_subsection(analyze_subsection(analyze_subsection(\
                    analyze_subsection(analyze_subsection([0, 1])))))";
        let record = exec(&engine(), &store, code);
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.recursion_depth_used, 5);
        assert_eq!(record.analysis_calls, 5);
    }

    #[test]
    fn test_count_messages_by_role() {
        let mut store = ContextStore::new(ContextConfig::default());
        for i in 0..5 {
            store.append(Role::User, format!("question {i}"), Metadata::new());
            store.append(Role::Assistant, format!("answer {i}"), Metadata::new());
        }
        let engine = engine();
        let record = exec(&engine, &store, "result = count_messages()");
        assert_eq!(record.result, Some(Value::Int(10)));
        let record = exec(&engine, &store, "result = count_messages(role=\"user\")");
        assert_eq!(record.result, Some(Value::Int(5)));
    }

    #[test]
    fn test_tight_loop_hits_deadline() {
        let store = quantum_store();
        let engine = engine_with(EngineConfig {
            timeout_ms: 300,
            ..EngineConfig::default()
        });
        let code = "result = [1 for a in range(10000) for b in range(10000) for c in range(10000) if False]";
        let record = exec(&engine, &store, code);
        assert_eq!(record.status, ExecutionStatus::ResourceExceeded);
        let ms = record.to_response().duration_ms;
        assert!(ms >= 300, "stopped early: {ms}ms");
        assert!(ms < 1300, "overshot deadline: {ms}ms");
    }

    // ── boundary ────────────────────────────────────────

    #[test]
    fn test_cancelled_run_reports_resource_exceeded() {
        let store = quantum_store();
        let cancel = CancelToken::new();
        cancel.cancel();
        let record = engine().execute(
            "result = [x for x in range(5000)]",
            "cancel",
            &store,
            &cancel,
            &DepthGauge::default(),
        );
        assert_eq!(record.status, ExecutionStatus::ResourceExceeded);
        assert!(record.result.is_none());
        assert!(record.error.unwrap().contains("cancelled"));
    }

    #[test]
    fn test_nested_result_truncated_by_total_items() {
        let store = quantum_store();
        let record = exec(&engine(), &store, "result = [range(10) for i in range(200)]");
        assert_eq!(record.status, ExecutionStatus::Success);
        assert!(record.truncated);
        let result = record.result.unwrap();
        assert_eq!(result.nested_len(), 1000);
    }

    #[test]
    fn test_repeated_large_binding_is_resource_exceeded() {
        let store = quantum_store();
        let record = exec(
            &engine(),
            &store,
            "xs = range(100000)\nresult = [xs for i in range(200)]",
        );
        assert_eq!(record.status, ExecutionStatus::ResourceExceeded);
        assert!(!record.truncated);
    }

    #[test]
    fn test_large_result_truncated_and_flagged() {
        let store = quantum_store();
        let record = exec(&engine(), &store, "result = range(1500)");
        assert_eq!(record.status, ExecutionStatus::Success);
        assert!(record.truncated);
        match record.result {
            Some(Value::List(items)) => assert_eq!(items.len(), 1000),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_status_per_failure_kind() {
        let store = quantum_store();
        let engine = engine();
        for (code, status) in [
            ("result = (1 +", ExecutionStatus::SyntaxError),
            ("result = secret", ExecutionStatus::SecurityViolation),
            ("result = fetch('x')", ExecutionStatus::SecurityViolation),
            ("result = 1 / 0", ExecutionStatus::RuntimeError),
            ("result = get_message(0)['missing']", ExecutionStatus::RuntimeError),
        ] {
            let record = exec(&engine, &store, code);
            assert_eq!(record.status, status, "{code}");
            assert!(record.error.is_some());
            assert_eq!(record.recursion_depth_used, 0);
        }
    }

    #[test]
    fn test_gauge_reset_after_run() {
        let store = quantum_store();
        let gauge = DepthGauge::default();
        engine().execute(
            "result = analyze_subsection(analyze_subsection([0]))",
            "nested",
            &store,
            &CancelToken::new(),
            &gauge,
        );
        assert_eq!(gauge.get(), 0);
    }

    #[test]
    fn test_store_unchanged_by_execution() {
        let store = quantum_store();
        let before = serde_json::to_string(&store.derived_snapshot()).unwrap();
        exec(&engine(), &store, "result = [get_message(i) for i in range(3)]");
        assert_eq!(store.len(), 3);
        assert_eq!(serde_json::to_string(&store.derived_snapshot()).unwrap(), before);
    }

    struct Exploding;

    impl Capability for Exploding {
        fn name(&self) -> &str {
            "explode"
        }

        fn description(&self) -> &str {
            "Panics"
        }

        fn group(&self) -> CapabilityGroup {
            CapabilityGroup::Utility
        }

        fn params(&self) -> &[Param] {
            &[]
        }

        fn call(&self, _args: &Args, _cx: &mut CallContext<'_>) -> SandboxResult<Value> {
            panic!("capability bug");
        }
    }

    #[test]
    fn test_panic_contained_as_runtime_error() {
        let registry = RegistryBuilder::with_builtins()
            .register(Box::new(Exploding))
            .build();
        let engine = Engine::new(
            registry,
            Arc::new(DescriptiveAnalyzer::new()),
            EngineConfig::default(),
        );
        let store = quantum_store();
        let record = exec(&engine, &store, "result = explode()");
        assert_eq!(record.status, ExecutionStatus::RuntimeError);
        assert!(record.error.unwrap().contains("capability bug"));
    }
}
