//! Runs analyses on behalf of the `analyze_subsection` and
//! `parallel_analyze` capabilities.
//!
//! The recursion level is not tracked here: the interpreter opens the
//! level (and checks the ceiling) before the capability's arguments are
//! evaluated, then passes it in as `cx.depth`.

use std::collections::BTreeMap;

use super::{AnalysisRequest, AnalysisResult};
use crate::capabilities::CallContext;
use crate::context::{ContextStore, Message};
use crate::sandbox::error::{SandboxError, SandboxResult};
use crate::sandbox::value::Value;

/// Analyzes one message selection at the caller's level.
pub fn analyze_subsection(
    cx: &mut CallContext<'_>,
    selection: &Value,
    prompt: &str,
) -> SandboxResult<AnalysisResult> {
    let messages = resolve_selection(cx.store, selection)?;
    run(cx, messages, prompt)
}

/// Analyzes each `[start, end]` range independently. Output order
/// matches input order.
pub fn parallel_analyze(cx: &mut CallContext<'_>, ranges: &[Value]) -> SandboxResult<Value> {
    let max = cx.limits.max_parallel_ranges;
    if ranges.len() > max {
        return Err(SandboxError::ResourceExceeded(format!(
            "parallel_analyze() accepts at most {max} ranges ({} given)",
            ranges.len()
        )));
    }

    let bounds = ranges
        .iter()
        .map(parse_range)
        .collect::<SandboxResult<Vec<(i64, i64)>>>()?;

    let mut results = Vec::with_capacity(bounds.len());
    for (start, end) in bounds {
        let store = cx.store;
        let messages: Vec<&Message> = store.slice_signed(start, end).iter().collect();
        let analysis = run(cx, messages, "Parallel analysis")?;

        let mut entry = BTreeMap::new();
        entry.insert("range".to_string(), Value::from(vec![start, end]));
        entry.insert("analysis".to_string(), analysis.to_value());
        results.push(Value::Dict(entry));
    }
    Ok(Value::List(results))
}

fn run(
    cx: &mut CallContext<'_>,
    messages: Vec<&Message>,
    prompt: &str,
) -> SandboxResult<AnalysisResult> {
    cx.governor.charge(messages.len() as u64)?;
    let request = AnalysisRequest {
        messages,
        prompt,
        depth: cx.depth,
        extractor: cx.store.extractor(),
    };
    let result = cx
        .analyzer
        .analyze(&request)
        .map_err(|e| SandboxError::runtime(format!("analysis failed: {e:#}")))?;
    cx.governor.record_analysis();
    Ok(result)
}

/// Accepts a list of message dicts, a list of message ids, or an
/// earlier analysis result (its `message_ids`).
fn resolve_selection<'s>(store: &'s ContextStore, selection: &Value) -> SandboxResult<Vec<&'s Message>> {
    match selection {
        Value::List(items) => items.iter().map(|item| resolve_item(store, item)).collect(),
        Value::Dict(d) => match d.get("message_ids") {
            Some(ids) => resolve_selection(store, ids),
            None => resolve_item(store, selection).map(|m| vec![m]),
        },
        other => Err(SandboxError::runtime(format!(
            "analyze_subsection() expects a list of messages, not {}",
            other.type_name()
        ))),
    }
}

fn resolve_item<'s>(store: &'s ContextStore, item: &Value) -> SandboxResult<&'s Message> {
    let id = match item {
        Value::Dict(d) => d.get("id").and_then(Value::as_int),
        other => other.as_int(),
    }
    .ok_or_else(|| {
        SandboxError::runtime(format!(
            "analyze_subsection() cannot use a {} as a message",
            item.type_name()
        ))
    })?;

    u64::try_from(id)
        .ok()
        .and_then(|id| store.get(id))
        .ok_or_else(|| SandboxError::runtime(format!("message {id} not found")))
}

fn parse_range(range: &Value) -> SandboxResult<(i64, i64)> {
    match range {
        Value::List(pair) if pair.len() == 2 => match (pair[0].as_int(), pair[1].as_int()) {
            (Some(start), Some(end)) => Ok((start, end)),
            _ => Err(SandboxError::runtime(
                "parallel_analyze() range bounds must be integers",
            )),
        },
        _ => Err(SandboxError::runtime(format!(
            "parallel_analyze() expects [start, end] pairs, got {}",
            range.display()
        ))),
    }
}
