//! Utility: counts, topics, single messages and slices.

use super::{message_list, message_value, Builtin};
use crate::capabilities::{Args, CallContext, CapabilityGroup, Param};
use crate::context::Role;
use crate::sandbox::error::{SandboxError, SandboxResult};
use crate::sandbox::value::Value;

const COUNT_PARAMS: &[Param] = &[Param::optional("role")];
const TOPICS_PARAMS: &[Param] = &[Param::optional("top_n")];
const MESSAGE_PARAMS: &[Param] = &[Param::required("idx")];
const SLICE_PARAMS: &[Param] = &[Param::required("start"), Param::optional("end")];

pub fn builtins() -> Vec<Builtin> {
    vec![
        Builtin {
            name: "count_messages",
            group: CapabilityGroup::Utility,
            description: "Number of messages, optionally for one role",
            params: COUNT_PARAMS,
            handler: count_messages,
        },
        Builtin {
            name: "get_topics",
            group: CapabilityGroup::Utility,
            description: "Most frequent topic words as [word, count] pairs",
            params: TOPICS_PARAMS,
            handler: get_topics,
        },
        Builtin {
            name: "get_message",
            group: CapabilityGroup::Utility,
            description: "Message at index, or None when out of range",
            params: MESSAGE_PARAMS,
            handler: get_message,
        },
        Builtin {
            name: "slice_messages",
            group: CapabilityGroup::Utility,
            description: "Messages start..end, negative indices count from the end",
            params: SLICE_PARAMS,
            handler: slice_messages,
        },
    ]
}

fn count_messages(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let store = cx.store;
    match args.opt_str(0)? {
        None => Ok(Value::from(store.len())),
        Some(raw) => {
            let role: Role = raw
                .parse()
                .map_err(|e: String| SandboxError::runtime(format!("count_messages(): {e}")))?;
            cx.governor.charge(store.len() as u64)?;
            Ok(Value::from(
                store.messages().iter().filter(|m| m.role == role).count(),
            ))
        }
    }
}

fn get_topics(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let top_n = args.int_or(0, 10)?.max(0) as usize;
    let topics = cx.store.top_topics(top_n);
    cx.governor.charge(topics.len() as u64)?;
    Ok(Value::List(
        topics
            .into_iter()
            .map(|t| Value::List(vec![Value::from(t.name.as_str()), Value::from(t.frequency)]))
            .collect(),
    ))
}

fn get_message(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let idx = args.int(0)?;
    Ok(u64::try_from(idx)
        .ok()
        .and_then(|id| cx.store.get(id))
        .map_or(Value::None, message_value))
}

fn slice_messages(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let store = cx.store;
    let start = args.int(0)?;
    let end = args.int_or(1, store.len() as i64)?;
    message_list(cx, store.slice_signed(start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::builtin::testing::{find, ids, Fixture};

    fn call(f: &Fixture, name: &str, positional: Vec<Value>, keywords: Vec<(&str, Value)>) -> SandboxResult<Value> {
        let all = builtins();
        f.call(find(&all, name), positional, keywords)
    }

    #[test]
    fn test_count_messages() {
        let f = Fixture::conversation();
        assert_eq!(call(&f, "count_messages", vec![], vec![]).unwrap(), Value::Int(6));
        assert_eq!(
            call(&f, "count_messages", vec![], vec![("role", Value::str("user"))]).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            call(&f, "count_messages", vec![Value::str("system")], vec![]).unwrap(),
            Value::Int(0)
        );
    }

    #[test]
    fn test_count_messages_unknown_role() {
        let f = Fixture::conversation();
        let err = call(&f, "count_messages", vec![Value::str("bot")], vec![]).unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(_)));
    }

    #[test]
    fn test_get_topics_pairs() {
        let f = Fixture::conversation();
        let out = call(&f, "get_topics", vec![Value::Int(2)], vec![]).unwrap();
        assert_eq!(
            out,
            Value::List(vec![
                Value::List(vec![Value::str("quantum"), Value::Int(2)]),
                Value::List(vec![Value::str("computing"), Value::Int(2)]),
            ])
        );
    }

    #[test]
    fn test_get_message_in_and_out_of_range() {
        let f = Fixture::conversation();
        let out = call(&f, "get_message", vec![Value::Int(2)], vec![]).unwrap();
        let Value::Dict(d) = out else {
            panic!("expected dict");
        };
        assert_eq!(d["content"], Value::str("Tell me about Python programming"));
        assert_eq!(call(&f, "get_message", vec![Value::Int(6)], vec![]).unwrap(), Value::None);
        assert_eq!(call(&f, "get_message", vec![Value::Int(-1)], vec![]).unwrap(), Value::None);
    }

    #[test]
    fn test_slice_messages_negative() {
        let f = Fixture::conversation();
        let out = call(&f, "slice_messages", vec![Value::Int(-2)], vec![]).unwrap();
        assert_eq!(ids(&out), vec![4, 5]);
        let out = call(&f, "slice_messages", vec![Value::Int(1), Value::Int(3)], vec![]).unwrap();
        assert_eq!(ids(&out), vec![1, 2]);
        let out = call(&f, "slice_messages", vec![Value::Int(5), Value::Int(1)], vec![]).unwrap();
        assert_eq!(ids(&out), Vec::<i64>::new());
    }
}
