//! Aggregation: summaries and the derived views of the store.

use super::{fact_value, timeline_value, Builtin};
use crate::capabilities::{Args, CallContext, CapabilityGroup, Param};
use crate::context::extract::rank_words;
use crate::context::{truncate_chars, Role};
use crate::sandbox::error::SandboxResult;
use crate::sandbox::value::Value;

const RANGE_PARAMS: &[Param] = &[Param::required("start_id"), Param::required("end_id")];
const NO_PARAMS: &[Param] = &[];

pub fn builtins() -> Vec<Builtin> {
    vec![
        Builtin {
            name: "summarize_range",
            group: CapabilityGroup::Aggregation,
            description: "Keyword summary of messages start_id..end_id",
            params: RANGE_PARAMS,
            handler: summarize_range,
        },
        Builtin {
            name: "aggregate_facts",
            group: CapabilityGroup::Aggregation,
            description: "All facts extracted so far",
            params: NO_PARAMS,
            handler: aggregate_facts,
        },
        Builtin {
            name: "extract_entities",
            group: CapabilityGroup::Aggregation,
            description: "Entity name to mention count",
            params: NO_PARAMS,
            handler: extract_entities,
        },
        Builtin {
            name: "get_timeline",
            group: CapabilityGroup::Aggregation,
            description: "One event per message, in order",
            params: NO_PARAMS,
            handler: get_timeline,
        },
    ]
}

fn summarize_range(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let start = args.int(0)?;
    let end = args.int(1)?;
    let store = cx.store;
    let messages = store.slice_signed(start, end);
    cx.governor.charge(messages.len() as u64)?;

    if messages.is_empty() {
        return Ok(Value::str("No messages in range"));
    }

    let extractor = store.extractor();
    let mut parts = Vec::new();

    let asked = rank_words(
        extractor,
        messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str()),
        5,
    );
    if !asked.is_empty() {
        parts.push(format!("User asked about: {}", asked.join(", ")));
    }

    let points: Vec<String> = messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| extractor.key_points(&m.content))
        .take(5)
        .collect();
    if !points.is_empty() {
        parts.push(format!("Discussed: {}", points.join("; ")));
    }

    let summary = if parts.is_empty() {
        format!("{} messages without extractable topics", messages.len())
    } else {
        parts.join(" | ")
    };
    Ok(Value::from(truncate_chars(
        &summary,
        store.config().summary_max_chars,
    )))
}

fn aggregate_facts(_args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let facts = cx.store.facts();
    cx.governor.check_collection(facts.len())?;
    cx.governor.charge(facts.len() as u64)?;
    Ok(Value::List(facts.iter().map(fact_value).collect()))
}

fn extract_entities(_args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let entities = cx.store.entities();
    cx.governor.check_collection(entities.len())?;
    cx.governor.charge(entities.len() as u64)?;
    Ok(Value::Dict(
        entities
            .iter()
            .map(|e| (e.name.clone(), Value::from(e.frequency)))
            .collect(),
    ))
}

fn get_timeline(_args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let timeline = cx.store.timeline();
    cx.governor.check_collection(timeline.len())?;
    cx.governor.charge(timeline.len() as u64)?;
    Ok(Value::List(timeline.iter().map(timeline_value).collect()))
}
