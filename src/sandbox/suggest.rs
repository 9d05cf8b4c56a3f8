//! Starter programs for natural-language navigation requests.
//!
//! The output is only a suggestion: it goes through validation like any
//! other submitted code.

/// Builds a program answering `query` with one capability call.
pub fn suggest_code(query: &str) -> String {
    let lowered = query.to_lowercase();
    let has = |word: &str| lowered.split_whitespace().any(|w| w.contains(word));

    if has("find") || has("search") {
        return match last_keyword(query) {
            Some(keyword) => format!("result = find_messages('{keyword}')"),
            None => "result = slice_messages(-10)".to_string(),
        };
    }
    if has("summar") {
        return "result = summarize_range(0, count_messages())".to_string();
    }
    if has("fact") {
        return "result = aggregate_facts()".to_string();
    }
    if has("entit") {
        return "result = extract_entities()".to_string();
    }
    if has("count") || lowered.contains("how many") {
        return "result = count_messages()".to_string();
    }
    "result = slice_messages(-10)".to_string()
}

/// Last word of the query, restricted to characters that are safe
/// inside a single-quoted literal.
fn last_keyword(query: &str) -> Option<String> {
    query
        .split_whitespace()
        .rev()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
                .collect::<String>()
        })
        .find(|w| !w.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilityRegistry;
    use crate::config::EngineConfig;
    use crate::sandbox::validator::validate;

    #[test]
    fn test_find_uses_last_word() {
        assert_eq!(
            suggest_code("Find messages about quantum"),
            "result = find_messages('quantum')"
        );
    }

    #[test]
    fn test_keyword_is_sanitized() {
        assert_eq!(
            suggest_code("search for it's')"),
            "result = find_messages('its')"
        );
    }

    #[test]
    fn test_other_intents() {
        assert_eq!(
            suggest_code("Summarize the conversation"),
            "result = summarize_range(0, count_messages())"
        );
        assert_eq!(suggest_code("list the facts"), "result = aggregate_facts()");
        assert_eq!(suggest_code("which entities?"), "result = extract_entities()");
        assert_eq!(suggest_code("count them"), "result = count_messages()");
        assert_eq!(suggest_code("what happened"), "result = slice_messages(-10)");
    }

    #[test]
    fn test_suggestions_validate() {
        let registry = CapabilityRegistry::standard();
        let limits = EngineConfig::default();
        for query in [
            "find quantum",
            "search 'drop table'",
            "summarize",
            "facts",
            "entities",
            "count",
            "anything else",
        ] {
            let code = suggest_code(query);
            assert!(validate(&code, &registry, &limits).is_ok(), "{code}");
        }
    }
}
