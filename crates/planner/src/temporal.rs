//! Temporal phrase detection.
//!
//! Queries like "sales in the past 5 days" need a current-date anchor
//! before any data phase runs. The same pattern table drives plan-time
//! injection (rewrite pass 1), the fast-path rejection test, and the
//! date-range orchestrator trigger.

use std::sync::LazyLock;

use regex::Regex;

static TEMPORAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(past\s+\d+\s+(?:hours?|days?|weeks?|months?))",
        r"(last\s+\d+\s+(?:hours?|days?|weeks?|months?))",
        r"\b(yesterday|today)\b",
        r"(in\s+the\s+(?:last|past)\s+\d+\s+(?:hours?|days?|weeks?|months?))",
        r"(for\s+the\s+(?:past|last)\s+\d+\s+(?:hours?|days?|weeks?|months?))",
        r"(\d+\s+(?:hours?|days?|weeks?|months?)\s+ago)",
        r"(this\s+(?:week|month|year))",
        r"(current\s+(?:week|month|year))",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("temporal pattern"))
    .collect()
});

// Broader detection-only patterns: phrases that signal temporality but
// carry no extractable range on their own.
static DETECT_ONLY: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"\b(recent|latest)\b", r"in\s+the\s+(last|past)", r"for\s+the\s+(past|last)"]
        .iter()
        .map(|p| Regex::new(p).expect("temporal pattern"))
        .collect()
});

/// Does the query reference a time window at all?
pub fn is_temporal_query(query: &str) -> bool {
    let lower = query.to_lowercase();
    TEMPORAL_PATTERNS.iter().any(|p| p.is_match(&lower))
        || DETECT_ONLY.iter().any(|p| p.is_match(&lower))
}

/// Extract the matched temporal phrase, when one exists.
pub fn extract_phrase(query: &str) -> Option<String> {
    let lower = query.to_lowercase();
    for pattern in TEMPORAL_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(&lower) {
            if let Some(m) = captures.get(1) {
                return Some(m.as_str().to_string());
            }
        }
    }
    None
}

/// Is this *value* (an argument string) a temporal phrase rather than a
/// concrete date? Used by the fast-path rejection test and the date-range
/// orchestrator trigger.
pub fn is_temporal_phrase(value: &str) -> bool {
    let lower = value.to_lowercase();
    TEMPORAL_PATTERNS.iter().any(|p| p.is_match(&lower))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_windowed_queries() {
        assert!(is_temporal_query("sales in the past 5 days"));
        assert!(is_temporal_query("show me yesterday's failures"));
        assert!(is_temporal_query("revenue this month"));
        assert!(is_temporal_query("latest orders"));
        assert!(!is_temporal_query("list tables in database SALES"));
    }

    #[test]
    fn extracts_the_phrase() {
        assert_eq!(
            extract_phrase("sales in the past 5 days").as_deref(),
            Some("past 5 days")
        );
        assert_eq!(extract_phrase("what happened yesterday").as_deref(), Some("yesterday"));
        assert_eq!(extract_phrase("3 weeks ago totals").as_deref(), Some("3 weeks ago"));
        assert_eq!(extract_phrase("list tables"), None);
    }

    #[test]
    fn concrete_dates_are_not_phrases() {
        assert!(is_temporal_phrase("past 5 days"));
        assert!(!is_temporal_phrase("2025-11-03"));
        assert!(!is_temporal_phrase(""));
    }
}
