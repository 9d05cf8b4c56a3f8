//! Core helpers: conversions and collection utilities.
//!
//! These only ever see values already inside the sandbox, so each one is
//! a plain function of its arguments.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::Builtin;
use crate::capabilities::{Args, CallContext, CapabilityGroup, Param};
use crate::sandbox::error::{SandboxError, SandboxResult};
use crate::sandbox::value::Value;

const VALUE: &[Param] = &[Param::required("value")];
const OPTIONAL_VALUE: &[Param] = &[Param::optional("value")];
const SORTED_PARAMS: &[Param] = &[
    Param::required("iterable"),
    Param::optional("reverse"),
    Param::optional("key"),
];
const MIN_MAX_PARAMS: &[Param] = &[Param::required("iterable"), Param::optional("other")];
const SUM_PARAMS: &[Param] = &[Param::required("iterable"), Param::optional("start")];
const RANGE_PARAMS: &[Param] = &[
    Param::required("start"),
    Param::optional("stop"),
    Param::optional("step"),
];

macro_rules! core_builtin {
    ($name:literal, $params:expr, $handler:expr, $description:literal) => {
        Builtin {
            name: $name,
            group: CapabilityGroup::Core,
            description: $description,
            params: $params,
            handler: $handler,
        }
    };
}

pub fn builtins() -> Vec<Builtin> {
    vec![
        core_builtin!("len", VALUE, len, "Length of a string, list or dict"),
        core_builtin!("str", VALUE, to_str, "String rendering of a value"),
        core_builtin!("int", VALUE, to_int, "Integer conversion"),
        core_builtin!("float", VALUE, to_float, "Float conversion"),
        core_builtin!("bool", VALUE, to_bool, "Truthiness of a value"),
        core_builtin!("list", OPTIONAL_VALUE, to_list, "List of the items of an iterable"),
        core_builtin!("dict", OPTIONAL_VALUE, to_dict, "Dict from a dict or [key, value] pairs"),
        core_builtin!("sorted", SORTED_PARAMS, sorted, "Sorted copy; key names a dict field"),
        core_builtin!("min", MIN_MAX_PARAMS, min, "Smallest item, or smaller of two values"),
        core_builtin!("max", MIN_MAX_PARAMS, max, "Largest item, or larger of two values"),
        core_builtin!("sum", SUM_PARAMS, sum, "Sum of numbers"),
        core_builtin!("abs", VALUE, abs, "Absolute value"),
        core_builtin!("range", RANGE_PARAMS, range, "List of integers start..stop by step"),
        core_builtin!("keys", VALUE, keys, "Keys of a dict"),
        core_builtin!("values", VALUE, values, "Values of a dict"),
        core_builtin!("items", VALUE, items, "[key, value] pairs of a dict"),
        core_builtin!("lower", VALUE, lower, "Lowercased string"),
        core_builtin!("upper", VALUE, upper, "Uppercased string"),
    ]
}

fn len(args: &Args, _cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    match args.value(0)? {
        Value::Str(s) => Ok(Value::from(s.chars().count())),
        Value::List(items) => Ok(Value::from(items.len())),
        Value::Dict(map) => Ok(Value::from(map.len())),
        other => Err(SandboxError::runtime(format!(
            "object of type '{}' has no len()",
            other.type_name()
        ))),
    }
}

// `str(None)` is "None", so read the raw slot rather than `value()`.
fn to_str(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let rendered = args.get(0).map_or_else(|| "None".to_string(), Value::display);
    cx.governor.check_string(rendered.len())?;
    Ok(Value::Str(rendered))
}

fn to_int(args: &Args, _cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    match args.value(0)? {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::Float(f) => {
            let t = f.trunc();
            if t.is_finite() && t >= i64::MIN as f64 && t < i64::MAX as f64 {
                Ok(Value::Int(t as i64))
            } else {
                Err(SandboxError::runtime(format!("cannot convert {f} to int")))
            }
        }
        Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
            SandboxError::runtime(format!("invalid literal for int(): '{s}'"))
        }),
        other => Err(args.type_error(0, "a number or string", other)),
    }
}

fn to_float(args: &Args, _cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let v = args.value(0)?;
    if let Some(f) = v.as_float() {
        return Ok(Value::Float(f));
    }
    match v {
        Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
            SandboxError::runtime(format!("could not convert string to float: '{s}'"))
        }),
        other => Err(args.type_error(0, "a number or string", other)),
    }
}

fn to_bool(args: &Args, _cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    Ok(Value::Bool(args.get(0).is_some_and(Value::truthy)))
}

fn to_list(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let items = match args.get(0) {
        None => Vec::new(),
        Some(v) => v.iter_items()?,
    };
    cx.governor.charge(items.len() as u64)?;
    Ok(Value::List(items))
}

fn to_dict(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    match args.get(0) {
        None => Ok(Value::Dict(BTreeMap::new())),
        Some(Value::Dict(map)) => Ok(Value::Dict(map.clone())),
        Some(Value::List(pairs)) => {
            cx.governor.charge(pairs.len() as u64)?;
            let mut map = BTreeMap::new();
            for pair in pairs {
                match pair {
                    Value::List(kv) if kv.len() == 2 => {
                        let key = kv[0].as_str().ok_or_else(|| {
                            SandboxError::runtime(format!(
                                "dict keys must be str, not {}",
                                kv[0].type_name()
                            ))
                        })?;
                        map.insert(key.to_string(), kv[1].clone());
                    }
                    other => {
                        return Err(SandboxError::runtime(format!(
                            "dict() expects [key, value] pairs, got {}",
                            other.display()
                        )))
                    }
                }
            }
            Ok(Value::Dict(map))
        }
        Some(other) => Err(args.type_error(0, "a dict or list of pairs", other)),
    }
}

fn sorted(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let items = args.value(0)?.iter_items()?;
    let reverse = args.bool_or(1, false)?;
    let key = args.opt_str(2)?;
    cx.governor.charge(items.len() as u64)?;

    let mut keyed = items
        .into_iter()
        .map(|item| {
            let k = match key {
                None => item.clone(),
                Some(field) => sort_key(&item, field)?,
            };
            Ok((k, item))
        })
        .collect::<SandboxResult<Vec<(Value, Value)>>>()?;

    let mut failure = None;
    keyed.sort_by(|(a, _), (b, _)| {
        let ordered = if reverse { b.compare(a) } else { a.compare(b) };
        ordered.unwrap_or_else(|e| {
            failure.get_or_insert(e);
            Ordering::Equal
        })
    });
    if let Some(e) = failure {
        return Err(e);
    }
    Ok(Value::List(keyed.into_iter().map(|(_, item)| item).collect()))
}

fn sort_key(item: &Value, field: &str) -> SandboxResult<Value> {
    match item {
        Value::Dict(map) => map
            .get(field)
            .cloned()
            .ok_or_else(|| SandboxError::runtime(format!("sort key '{field}' missing from item"))),
        other => Err(SandboxError::runtime(format!(
            "sort key '{field}' requires dict items, not {}",
            other.type_name()
        ))),
    }
}

fn extreme(args: &Args, cx: &mut CallContext<'_>, want: Ordering) -> SandboxResult<Value> {
    let candidates = match args.get(1) {
        Some(other) => vec![args.value(0)?.clone(), other.clone()],
        None => args.value(0)?.iter_items()?,
    };
    cx.governor.charge(candidates.len() as u64)?;

    let mut iter = candidates.into_iter();
    let mut best = iter.next().ok_or_else(|| {
        SandboxError::runtime(format!("{}() arg is an empty sequence", args.function()))
    })?;
    for candidate in iter {
        if candidate.compare(&best)? == want {
            best = candidate;
        }
    }
    Ok(best)
}

fn min(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    extreme(args, cx, Ordering::Less)
}

fn max(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    extreme(args, cx, Ordering::Greater)
}

fn sum(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let items = args.value(0)?.iter_items()?;
    let start = args.get(1).cloned().unwrap_or(Value::Int(0));
    cx.governor.charge(items.len() as u64)?;

    items.iter().try_fold(start, |acc, item| match (&acc, item) {
        (Value::Float(_), _) | (_, Value::Float(_)) => match (acc.as_float(), item.as_float()) {
            (Some(a), Some(b)) => Ok(Value::Float(a + b)),
            _ => Err(unsummable(item)),
        },
        _ => match (acc.as_int(), item.as_int()) {
            (Some(a), Some(b)) => a
                .checked_add(b)
                .map(Value::Int)
                .ok_or_else(|| SandboxError::runtime("integer overflow in sum()")),
            _ => Err(unsummable(item)),
        },
    })
}

fn unsummable(item: &Value) -> SandboxError {
    SandboxError::runtime(format!(
        "unsupported operand type for sum(): '{}'",
        item.type_name()
    ))
}

fn abs(args: &Args, _cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    match args.value(0)? {
        Value::Float(f) => Ok(Value::Float(f.abs())),
        v @ (Value::Int(_) | Value::Bool(_)) => v
            .as_int()
            .and_then(i64::checked_abs)
            .map(Value::Int)
            .ok_or_else(|| SandboxError::runtime("integer overflow in abs()")),
        other => Err(args.type_error(0, "a number", other)),
    }
}

fn range(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let (start, stop) = match args.get(1) {
        None => (0, args.int(0)?),
        Some(_) => (args.int(0)?, args.int(1)?),
    };
    let step = args.int_or(2, 1)?;
    if step == 0 {
        return Err(SandboxError::runtime("range() arg 3 must not be zero"));
    }

    let span = if step > 0 {
        i128::from(stop) - i128::from(start)
    } else {
        i128::from(start) - i128::from(stop)
    };
    let step_abs = i128::from(step).abs();
    let count = if span <= 0 { 0 } else { (span + step_abs - 1) / step_abs };
    let count = usize::try_from(count).unwrap_or(usize::MAX);
    cx.governor.check_collection(count)?;
    cx.governor.charge(count as u64)?;

    let values = (0..count)
        .map(|i| Value::Int((i128::from(start) + i as i128 * i128::from(step)) as i64))
        .collect();
    Ok(Value::List(values))
}

fn dict_arg<'a>(args: &'a Args) -> SandboxResult<&'a BTreeMap<String, Value>> {
    match args.value(0)? {
        Value::Dict(map) => Ok(map),
        other => Err(args.type_error(0, "dict", other)),
    }
}

fn keys(args: &Args, _cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    Ok(Value::List(dict_arg(args)?.keys().cloned().map(Value::Str).collect()))
}

fn values(args: &Args, _cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    Ok(Value::List(dict_arg(args)?.values().cloned().collect()))
}

fn items(args: &Args, _cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    Ok(Value::List(
        dict_arg(args)?
            .iter()
            .map(|(k, v)| Value::List(vec![Value::Str(k.clone()), v.clone()]))
            .collect(),
    ))
}

fn lower(args: &Args, _cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    Ok(Value::Str(args.str(0)?.to_lowercase()))
}

fn upper(args: &Args, _cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    Ok(Value::Str(args.str(0)?.to_uppercase()))
}
