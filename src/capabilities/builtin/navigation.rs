//! Navigation: select messages from the store.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex::RegexBuilder;

use super::{message_list, Builtin};
use crate::capabilities::{Args, CallContext, CapabilityGroup, Param};
use crate::context::{Message, Role};
use crate::sandbox::error::{SandboxError, SandboxResult};
use crate::sandbox::value::Value;

/// Compiled program size ceiling for user patterns.
const REGEX_SIZE_LIMIT: usize = 1 << 20;
const REGEX_NEST_LIMIT: u32 = 32;

const FIND_PARAMS: &[Param] = &[Param::required("keyword"), Param::optional("case_sensitive")];
const DATE_PARAMS: &[Param] = &[Param::optional("start"), Param::optional("end")];
const ROLE_PARAMS: &[Param] = &[Param::required("role")];
const GREP_PARAMS: &[Param] = &[Param::required("pattern")];
const SEARCH_PARAMS: &[Param] = &[Param::required("query"), Param::optional("top_k")];

pub fn builtins() -> Vec<Builtin> {
    vec![
        Builtin {
            name: "find_messages",
            group: CapabilityGroup::Navigation,
            description: "Messages containing a keyword (literal match)",
            params: FIND_PARAMS,
            handler: find_messages,
        },
        Builtin {
            name: "filter_by_date",
            group: CapabilityGroup::Navigation,
            description: "Messages between two dates, inclusive (RFC 3339 or YYYY-MM-DD)",
            params: DATE_PARAMS,
            handler: filter_by_date,
        },
        Builtin {
            name: "filter_by_role",
            group: CapabilityGroup::Navigation,
            description: "Messages from one role: user, assistant or system",
            params: ROLE_PARAMS,
            handler: filter_by_role,
        },
        Builtin {
            name: "grep",
            group: CapabilityGroup::Navigation,
            description: "Messages matching a regular expression",
            params: GREP_PARAMS,
            handler: grep,
        },
        Builtin {
            name: "search_semantic",
            group: CapabilityGroup::Navigation,
            description: "Messages ranked by query term overlap (not embedding search)",
            params: SEARCH_PARAMS,
            handler: search_semantic,
        },
    ]
}

fn find_messages(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let keyword = args.str(0)?;
    let case_sensitive = args.bool_or(1, false)?;
    cx.governor.charge(cx.store.len() as u64)?;

    let store = cx.store;
    if case_sensitive {
        return message_list(cx, store.messages().iter().filter(|m| m.content.contains(keyword)));
    }
    let matcher = RegexBuilder::new(&regex::escape(keyword))
        .case_insensitive(true)
        .build()
        .map_err(|e| SandboxError::runtime(format!("find_messages(): {e}")))?;
    message_list(cx, store.messages().iter().filter(|m| matcher.is_match(&m.content)))
}

fn filter_by_date(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let start = args.opt_str(0)?.map(|s| parse_bound(s, false)).transpose()?;
    let end = args.opt_str(1)?.map(|s| parse_bound(s, true)).transpose()?;
    cx.governor.charge(cx.store.len() as u64)?;

    let store = cx.store;
    message_list(
        cx,
        store.messages().iter().filter(|m| {
            start.map_or(true, |s| m.timestamp >= s) && end.map_or(true, |e| m.timestamp <= e)
        }),
    )
}

/// A bare date covers the whole day: midnight for a lower bound, the
/// last instant of the day for an upper bound.
fn parse_bound(raw: &str, end_of_day: bool) -> SandboxResult<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let time = if end_of_day {
            date.and_hms_nano_opt(23, 59, 59, 999_999_999)
        } else {
            date.and_hms_opt(0, 0, 0)
        };
        if let Some(naive) = time {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(SandboxError::runtime(format!(
        "filter_by_date() could not parse date '{raw}'"
    )))
}

fn filter_by_role(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let role: Role = args
        .str(0)?
        .parse()
        .map_err(|e: String| SandboxError::runtime(format!("filter_by_role(): {e}")))?;
    cx.governor.charge(cx.store.len() as u64)?;

    let store = cx.store;
    message_list(cx, store.messages().iter().filter(|m| m.role == role))
}

fn grep(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let pattern = args.str(0)?;
    let max = cx.limits.max_pattern_len;
    if pattern.len() > max {
        return Err(SandboxError::ResourceExceeded(format!(
            "grep() pattern longer than {max} characters"
        )));
    }

    // The regex crate guarantees linear-time matching; the builder caps
    // bound compile time and memory.
    let matcher = match RegexBuilder::new(pattern)
        .size_limit(REGEX_SIZE_LIMIT)
        .dfa_size_limit(REGEX_SIZE_LIMIT)
        .nest_limit(REGEX_NEST_LIMIT)
        .build()
    {
        Ok(re) => re,
        Err(regex::Error::CompiledTooBig(limit)) => {
            return Err(SandboxError::ResourceExceeded(format!(
                "grep() pattern compiles beyond {limit} bytes"
            )))
        }
        Err(e) => return Err(SandboxError::runtime(format!("grep() invalid pattern: {e}"))),
    };

    let store = cx.store;
    let bytes: usize = store.messages().iter().map(|m| m.content.len()).sum();
    cx.governor.charge(bytes as u64 / 64 + store.len() as u64)?;
    message_list(cx, store.messages().iter().filter(|m| matcher.is_match(&m.content)))
}

fn search_semantic(args: &Args, cx: &mut CallContext<'_>) -> SandboxResult<Value> {
    let query = args.str(0)?;
    let top_k = args.int_or(1, 10)?.max(0) as usize;
    let limit = top_k.min(cx.limits.max_search_results);

    let mut terms: Vec<String> = Vec::new();
    for term in query.to_lowercase().split_whitespace() {
        if !terms.iter().any(|t| t == term) {
            terms.push(term.to_string());
        }
    }

    let store = cx.store;
    cx.governor
        .charge((store.len() * terms.len().max(1)) as u64)?;

    let mut scored: Vec<((usize, usize), &Message)> = store
        .messages()
        .iter()
        .filter_map(|m| {
            let score = overlap_score(&terms, &m.content.to_lowercase());
            (score.0 > 0).then_some((score, m))
        })
        .collect();
    // Stable: equal scores keep insertion order
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.truncate(limit);

    message_list(cx, scored.into_iter().map(|(_, m)| m))
}

/// (distinct terms present, total occurrences of those terms)
fn overlap_score(terms: &[String], content: &str) -> (usize, usize) {
    terms.iter().fold((0, 0), |(distinct, total), term| {
        match content.matches(term.as_str()).count() {
            0 => (distinct, total),
            n => (distinct + 1, total + n),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::builtin::testing::{find, ids, Fixture};
    use crate::context::Metadata;

    fn call(f: &Fixture, name: &str, positional: Vec<Value>, keywords: Vec<(&str, Value)>) -> SandboxResult<Value> {
        let all = builtins();
        f.call(find(&all, name), positional, keywords)
    }

    // ── find_messages ───────────────────────────────────

    #[test]
    fn test_find_case_insensitive_by_default() {
        let f = Fixture::conversation();
        let out = call(&f, "find_messages", vec![Value::str("QUANTUM")], vec![]).unwrap();
        assert_eq!(ids(&out), vec![0, 1]);
    }

    #[test]
    fn test_find_case_sensitive() {
        let f = Fixture::conversation();
        let out = call(
            &f,
            "find_messages",
            vec![Value::str("quantum")],
            vec![("case_sensitive", Value::Bool(true))],
        )
        .unwrap();
        assert_eq!(ids(&out), vec![0]);
    }

    #[test]
    fn test_find_keyword_is_literal() {
        let mut f = Fixture::new();
        f.store.append(Role::User, "what is a.b?", Metadata::new());
        f.store.append(Role::User, "axb", Metadata::new());
        let out = call(&f, "find_messages", vec![Value::str("a.b")], vec![]).unwrap();
        assert_eq!(ids(&out), vec![0]);
    }

    #[test]
    fn test_find_on_empty_store() {
        let f = Fixture::new();
        let out = call(&f, "find_messages", vec![Value::str("x")], vec![]).unwrap();
        assert_eq!(out, Value::List(vec![]));
    }

    // ── filter_by_date / filter_by_role ─────────────────

    #[test]
    fn test_filter_by_date_inclusive_days() {
        let mut f = Fixture::new();
        for (day, text) in [(1, "a"), (2, "b"), (3, "c")] {
            let ts = Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap();
            f.store.append_at(Role::User, text, Metadata::new(), ts);
        }
        let out = call(
            &f,
            "filter_by_date",
            vec![Value::str("2024-05-02"), Value::str("2024-05-03")],
            vec![],
        )
        .unwrap();
        assert_eq!(ids(&out), vec![1, 2]);

        let out = call(
            &f,
            "filter_by_date",
            vec![],
            vec![("end", Value::str("2024-05-01T12:00:00Z"))],
        )
        .unwrap();
        assert_eq!(ids(&out), vec![0]);
    }

    #[test]
    fn test_filter_by_date_bad_input() {
        let f = Fixture::new();
        let err = call(&f, "filter_by_date", vec![Value::str("yesterday")], vec![]).unwrap_err();
        assert!(err.to_string().contains("could not parse date 'yesterday'"));
    }

    #[test]
    fn test_filter_by_role() {
        let f = Fixture::conversation();
        let out = call(&f, "filter_by_role", vec![Value::str("assistant")], vec![]).unwrap();
        assert_eq!(ids(&out), vec![1, 3, 5]);
        assert!(call(&f, "filter_by_role", vec![Value::str("root")], vec![]).is_err());
    }

    // ── grep ────────────────────────────────────────────

    #[test]
    fn test_grep_matches_regex() {
        let f = Fixture::conversation();
        let out = call(&f, "grep", vec![Value::str(r"(?i)^(what|how)\b")], vec![]).unwrap();
        assert_eq!(ids(&out), vec![0, 4]);
    }

    #[test]
    fn test_grep_invalid_pattern_is_runtime_error() {
        let f = Fixture::conversation();
        let err = call(&f, "grep", vec![Value::str("(unclosed")], vec![]).unwrap_err();
        assert!(matches!(err, SandboxError::Runtime(_)));
    }

    #[test]
    fn test_grep_rejects_oversized_patterns() {
        let f = Fixture::conversation();
        let long = "a".repeat(600);
        let err = call(&f, "grep", vec![Value::str(long)], vec![]).unwrap_err();
        assert!(matches!(err, SandboxError::ResourceExceeded(_)));

        // Short to type, huge once compiled
        let err = call(&f, "grep", vec![Value::str(r"\w{1000}\w{1000}\w{1000}")], vec![]).unwrap_err();
        assert!(matches!(err, SandboxError::ResourceExceeded(_)));
    }

    // ── search_semantic ─────────────────────────────────

    #[test]
    fn test_search_ranks_by_overlap_then_insertion() {
        let f = Fixture::conversation();
        let out = call(
            &f,
            "search_semantic",
            vec![Value::str("machine learning python")],
            vec![],
        )
        .unwrap();
        // 4 and 5 match two terms; 2 and 3 match one
        assert_eq!(ids(&out), vec![4, 5, 2, 3]);
    }

    #[test]
    fn test_search_top_k() {
        let f = Fixture::conversation();
        let out = call(
            &f,
            "search_semantic",
            vec![Value::str("quantum python"), Value::Int(1)],
            vec![],
        )
        .unwrap();
        assert_eq!(ids(&out), vec![0]);
    }

    #[test]
    fn test_search_no_overlap_is_empty() {
        let f = Fixture::conversation();
        let out = call(&f, "search_semantic", vec![Value::str("zebra")], vec![]).unwrap();
        assert_eq!(out, Value::List(vec![]));
    }
}
