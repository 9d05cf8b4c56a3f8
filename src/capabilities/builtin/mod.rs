//! Builtin capabilities, grouped the way they are documented to the
//! code author: navigation, aggregation, analysis, utility, core.

pub mod aggregation;
pub mod analysis;
pub mod core;
pub mod navigation;
pub mod utility;

use std::collections::BTreeMap;

use crate::capabilities::{Args, CallContext, Capability, CapabilityGroup, Param};
use crate::context::{Fact, Message, TimelineEvent};
use crate::sandbox::error::SandboxResult;
use crate::sandbox::value::Value;

pub type Handler = fn(&Args, &mut CallContext<'_>) -> SandboxResult<Value>;

/// A capability backed by a plain function.
pub struct Builtin {
    pub name: &'static str,
    pub group: CapabilityGroup,
    pub description: &'static str,
    pub params: &'static [Param],
    pub handler: Handler,
}

impl Capability for Builtin {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn group(&self) -> CapabilityGroup {
        self.group
    }

    fn params(&self) -> &[Param] {
        self.params
    }

    fn opens_analysis_frame(&self) -> bool {
        self.group == CapabilityGroup::Analysis
    }

    fn call(&self, args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
        (self.handler)(args, cx)
    }
}

/// Every builtin, in listing order.
pub fn all() -> Vec<Builtin> {
    let mut builtins = navigation::builtins();
    builtins.extend(aggregation::builtins());
    builtins.extend(analysis::builtins());
    builtins.extend(utility::builtins());
    builtins.extend(core::builtins());
    builtins
}

// ── Value views of store records ─────────────────────────

pub(crate) fn message_value(m: &Message) -> Value {
    let mut d = BTreeMap::new();
    d.insert("id".to_string(), Value::from(m.id));
    d.insert("role".to_string(), Value::from(m.role.as_str()));
    d.insert("content".to_string(), Value::from(m.content.as_str()));
    d.insert("timestamp".to_string(), Value::from(m.timestamp.to_rfc3339()));
    d.insert(
        "metadata".to_string(),
        Value::Dict(
            m.metadata
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v)))
                .collect(),
        ),
    );
    d.insert("token_estimate".to_string(), Value::from(m.token_estimate));
    Value::Dict(d)
}

pub(crate) fn fact_value(f: &Fact) -> Value {
    let mut d = BTreeMap::new();
    d.insert("text".to_string(), Value::from(f.text.as_str()));
    d.insert("source_role".to_string(), Value::from(f.source_role.as_str()));
    d.insert("timestamp".to_string(), Value::from(f.timestamp.to_rfc3339()));
    d.insert("origin_message_id".to_string(), Value::from(f.origin_message_id));
    Value::Dict(d)
}

pub(crate) fn timeline_value(e: &TimelineEvent) -> Value {
    let mut d = BTreeMap::new();
    d.insert("message_id".to_string(), Value::from(e.message_id));
    d.insert("timestamp".to_string(), Value::from(e.timestamp.to_rfc3339()));
    d.insert("role".to_string(), Value::from(e.role.as_str()));
    d.insert("summary".to_string(), Value::from(e.summary.as_str()));
    Value::Dict(d)
}

/// Converts a message selection into a list value, charging the
/// governor for it and enforcing the collection ceiling.
pub(crate) fn message_list<'m, I>(cx: &mut CallContext<'_>, messages: I) -> SandboxResult<Value>
where
    I: IntoIterator<Item = &'m Message>,
{
    let items: Vec<Value> = messages.into_iter().map(message_value).collect();
    cx.governor.check_collection(items.len())?;
    cx.governor.charge(items.len() as u64)?;
    Ok(Value::List(items))
}
