use loopctl_types::Backlog;
use regex::Regex;
use std::sync::OnceLock;

/// Outcome of analyzing one iteration's AI output stream, in strict
/// priority order: `Complete` > `StoryComplete` > `ApiLimit` > `Continue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Complete,
    StoryComplete,
    ApiLimit,
    Continue,
}

fn api_limit_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)usage limit",
            r"(?i)rate limit",
            r"(?i)too many requests",
            r"(?i)5-hour limit",
            r"(?i)exceeded.*limit",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static api-limit pattern"))
        .collect()
    })
}

fn matches_api_limit(stream: &str) -> bool {
    api_limit_patterns().iter().any(|re| re.is_match(stream))
}

/// True if any of `patterns` (regexes, invalid ones are skipped) matches
/// `stream`. Used for `completion.custom_patterns`: user-configured extra
/// ways to say "I'm done" alongside the literal promise token.
fn matches_custom_patterns(stream: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        Regex::new(pattern)
            .map(|re| re.is_match(stream))
            .unwrap_or(false)
    })
}

/// Classify a completed iteration's output. `promise` and `story_token`
/// are the (possibly configured-override) completion tokens;
/// `custom_patterns` are additional user-configured regexes that count as
/// a completion claim alongside the literal promise token
/// (`completion.custom_patterns`).
///
/// If the promise is claimed (by the literal token or a custom pattern)
/// but the backlog is not actually fully complete, the claim is demoted:
/// it is logged as a false completion claim and the iteration is treated
/// as `Continue` directly, without falling through to story-complete or
/// api-limit checks on the same text (a promise that turns out false is
/// itself the notable signal).
pub fn classify(
    stream: &str,
    backlog: &Backlog,
    promise: &str,
    story_token: &str,
    custom_patterns: &[String],
) -> Signal {
    if stream.contains(promise) || matches_custom_patterns(stream, custom_patterns) {
        if backlog.all_complete() {
            return Signal::Complete;
        }
        return Signal::Continue;
    }
    if backlog.all_complete() {
        return Signal::Complete;
    }
    if stream.contains(story_token) {
        return Signal::StoryComplete;
    }
    if matches_api_limit(stream) {
        return Signal::ApiLimit;
    }
    Signal::Continue
}

/// True if `line` is structurally tool-call output (a JSON `tool_use` /
/// `tool_result` event, or a file-content line with a leading
/// line-number marker) and should be skipped before error scanning.
pub fn is_tool_output_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if let Some(kind) = value.get("type").and_then(|t| t.as_str()) {
                if kind == "tool_use" || kind == "tool_result" {
                    return true;
                }
            }
        }
    }
    line_number_marker().is_match(line)
}

fn line_number_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*\d+\s*[:|]\s").expect("static line-number marker pattern"))
}

fn error_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)traceback \(most recent call last\)",
            r"(?i)\bpanicked at\b",
            r"(?i)\berror(?:\[[A-Z0-9]+\])?:",
            r"(?i)\bexception\b.*:",
            r"(?i)\bfailed\b[:.]",
            r"(?i)assertionerror",
            r"(?i)non-zero exit",
            r"(?i)compilation failed",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static error pattern"))
        .collect()
    })
}

/// Scan `stream` for the first line matching a curated error pattern,
/// after removing lines that are structurally tool-call output so that
/// the AI merely reading a file containing the word "error" does not
/// produce a false positive.
pub fn extract_error(stream: &str) -> Option<String> {
    stream
        .lines()
        .filter(|line| !is_tool_output_line(line))
        .find(|line| error_patterns().iter().any(|re| re.is_match(line)))
        .map(|line| line.trim().to_string())
}

/// Normalize an error string for stable hashing: strip ISO and bracketed
/// timestamps, collapse `file.py:42:` style line numbers down to
/// `file.py:`, collapse whitespace, and trim.
pub fn normalize_error(input: &str) -> String {
    static ISO_TIMESTAMP: OnceLock<Regex> = OnceLock::new();
    static BRACKETED_TIMESTAMP: OnceLock<Regex> = OnceLock::new();
    static LINE_NUMBER: OnceLock<Regex> = OnceLock::new();
    static WHITESPACE: OnceLock<Regex> = OnceLock::new();

    let iso = ISO_TIMESTAMP.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?Z?").expect("static")
    });
    let bracketed = BRACKETED_TIMESTAMP
        .get_or_init(|| Regex::new(r"\[\d{4}-\d{2}-\d{2}[^\]]*\]").expect("static"));
    let line_number = LINE_NUMBER.get_or_init(|| Regex::new(r":\d+:?").expect("static"));
    let whitespace = WHITESPACE.get_or_init(|| Regex::new(r"\s+").expect("static"));

    let step1 = iso.replace_all(input, "");
    let step2 = bracketed.replace_all(&step1, "");
    let step3 = line_number.replace_all(&step2, ":");
    let step4 = whitespace.replace_all(&step3, " ");
    step4.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use loopctl_types::{Story, StoryId};

    fn backlog(passes: &[bool]) -> Backlog {
        Backlog {
            description: "demo".into(),
            created_at: Utc::now(),
            user_stories: passes
                .iter()
                .enumerate()
                .map(|(i, &p)| Story {
                    id: StoryId::new(i as u32 + 1),
                    title: "t".into(),
                    description: String::new(),
                    acceptance_criteria: vec![],
                    priority: 0,
                    passes: p,
                    notes: String::new(),
                    model: None,
                    mcp_servers: None,
                    extra: Default::default(),
                })
                .collect(),
            success_criteria_command: None,
        }
    }

    #[test]
    fn promise_with_all_complete_yields_complete() {
        let backlog = backlog(&[true, true]);
        let signal = classify(
            "work done <promise>COMPLETE</promise>",
            &backlog,
            "<promise>COMPLETE</promise>",
            "<promise>STORY_COMPLETE</promise>",
            &[],
        );
        assert_eq!(signal, Signal::Complete);
    }

    #[test]
    fn implicit_complete_without_promise() {
        let backlog = backlog(&[true, true]);
        let signal = classify(
            "all done here",
            &backlog,
            "<promise>COMPLETE</promise>",
            "<promise>STORY_COMPLETE</promise>",
            &[],
        );
        assert_eq!(signal, Signal::Complete);
    }

    #[test]
    fn false_promise_with_api_limit_text_is_demoted_to_continue() {
        let backlog = backlog(&[true, false]);
        let stream = "<promise>COMPLETE</promise> but actually usage limit reached";
        let signal = classify(
            stream,
            &backlog,
            "<promise>COMPLETE</promise>",
            "<promise>STORY_COMPLETE</promise>",
            &[],
        );
        assert_eq!(signal, Signal::Continue);
    }

    #[test]
    fn story_complete_token_detected() {
        let backlog = backlog(&[false, false]);
        let signal = classify(
            "done with this one <promise>STORY_COMPLETE</promise>",
            &backlog,
            "<promise>COMPLETE</promise>",
            "<promise>STORY_COMPLETE</promise>",
            &[],
        );
        assert_eq!(signal, Signal::StoryComplete);
    }

    #[test]
    fn api_limit_pattern_detected() {
        let backlog = backlog(&[false]);
        let signal = classify(
            "Error: you have exceeded your usage limit",
            &backlog,
            "<promise>COMPLETE</promise>",
            "<promise>STORY_COMPLETE</promise>",
            &[],
        );
        assert_eq!(signal, Signal::ApiLimit);
    }

    #[test]
    fn continue_when_nothing_matches() {
        let backlog = backlog(&[false]);
        let signal = classify(
            "still working",
            &backlog,
            "<promise>COMPLETE</promise>",
            "<promise>STORY_COMPLETE</promise>",
            &[],
        );
        assert_eq!(signal, Signal::Continue);
    }

    #[test]
    fn custom_completion_pattern_is_honored_like_the_promise_token() {
        let backlog = backlog(&[true, true]);
        let signal = classify(
            "all done, ship it",
            &backlog,
            "<promise>COMPLETE</promise>",
            "<promise>STORY_COMPLETE</promise>",
            &["(?i)ship it".to_string()],
        );
        assert_eq!(signal, Signal::Complete);
    }

    #[test]
    fn custom_completion_pattern_is_demoted_when_backlog_is_not_actually_done() {
        let backlog = backlog(&[true, false]);
        let signal = classify(
            "all done, ship it",
            &backlog,
            "<promise>COMPLETE</promise>",
            "<promise>STORY_COMPLETE</promise>",
            &["(?i)ship it".to_string()],
        );
        assert_eq!(signal, Signal::Continue);
    }

    #[test]
    fn invalid_custom_pattern_is_skipped_without_panicking() {
        let backlog = backlog(&[false]);
        let signal = classify(
            "still working",
            &backlog,
            "<promise>COMPLETE</promise>",
            "<promise>STORY_COMPLETE</promise>",
            &["(unterminated".to_string()],
        );
        assert_eq!(signal, Signal::Continue);
    }

    #[test]
    fn tool_output_lines_are_filtered_before_error_scan() {
        let stream = r#"{"type":"tool_result","content":"Error: something in the file"}
normal text with no issues"#;
        assert_eq!(extract_error(stream), None);
    }

    #[test]
    fn extract_error_finds_first_real_error_line() {
        let stream = "running tests\nTraceback (most recent call last):\nmore text";
        let found = extract_error(stream).unwrap();
        assert!(found.to_lowercase().contains("traceback"));
    }

    #[test]
    fn normalize_collapses_timestamps_and_line_numbers() {
        let a = normalize_error("2024-01-15T14:30:00Z Error: x at file.py:42");
        let b = normalize_error("[2024-01-15 14:30:00] Error: x at file.py:99");
        assert_eq!(a, b);
    }
}
