//! Wildcard topic pattern matching.
//!
//! Topics are dot-delimited strings (`orders.created`). A pattern may use
//! `*` to match exactly one segment or `**` to match any number of
//! segments. Matching is pure: same inputs, same answer, no state.

use regex::Regex;

/// Check if a pattern contains wildcards.
pub fn is_wildcard(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Check if a topic matches a wildcard pattern.
///
/// Non-wildcard patterns match by string equality. Wildcard patterns are
/// translated segment by segment: `*` becomes `[^.]+`, `**` becomes `.*`,
/// and any other segment is matched literally.
pub fn matches(topic: &str, pattern: &str) -> bool {
    if !is_wildcard(pattern) {
        return topic == pattern;
    }

    let translated = pattern
        .split('.')
        .map(|segment| match segment {
            "*" => "[^.]+".to_string(),
            "**" => ".*".to_string(),
            literal => regex::escape(literal),
        })
        .collect::<Vec<_>>()
        .join("\\.");

    Regex::new(&format!("^{translated}$"))
        .map(|re| re.is_match(topic))
        .unwrap_or(false)
}

/// Filter a pattern list down to those that match the given topic.
pub fn matching_patterns<'a>(topic: &str, patterns: &'a [String]) -> Vec<&'a str> {
    patterns
        .iter()
        .filter(|pattern| matches(topic, pattern))
        .map(|pattern| pattern.as_str())
        .collect()
}
