//! Candidate enumeration for JSON salvage.
//!
//! Assistant text may carry its JSON payload bare, inside a fenced code
//! block, or buried in prose. Candidates are produced in priority order:
//! the whole trimmed text, each fenced block body, then every balanced
//! `{...}`/`[...]` substring. The balanced scan respects JSON string
//! escapes so braces inside string literals never open or close a span.

use once_cell::sync::Lazy;
use regex::Regex;

/// Bounds the balanced scan on adversarial input.
const MAX_BALANCED_CANDIDATES: usize = 128;

static FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[a-zA-Z0-9_+\-]*[ \t]*\r?\n?(.*?)```").unwrap());

/// Enumerate candidate JSON substrings, deduplicated, in priority order.
pub fn enumerate_candidates(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();

    fn push(candidate: &str, out: &mut Vec<String>) {
        let trimmed = candidate.trim();
        if trimmed.is_empty() || out.iter().any(|existing| existing == trimmed) {
            return;
        }
        out.push(trimmed.to_string());
    }

    push(text, &mut out);

    for captures in FENCE_RE.captures_iter(text) {
        if let Some(body) = captures.get(1) {
            push(body.as_str(), &mut out);
        }
    }

    let mut scanned = 0usize;
    for (start, ch) in text.char_indices() {
        if scanned >= MAX_BALANCED_CANDIDATES {
            break;
        }
        if ch != '{' && ch != '[' {
            continue;
        }
        if let Some(len) = balanced_span(&text[start..]) {
            scanned += 1;
            push(&text[start..start + len], &mut out);
        }
    }

    out
}

/// Length in bytes of the balanced span starting at the first character of
/// `text`, which must be `{` or `[`. Returns None when the span never
/// closes. Tracks in-string and escape state so quoted braces are inert.
fn balanced_span(text: &str) -> Option<usize> {
    let mut stack: Vec<char> = Vec::with_capacity(8);
    let mut in_string = false;
    let mut escape = false;

    for (i, ch) in text.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            '{' | '[' => stack.push(ch),
            '}' | ']' => {
                let open = stack.pop()?;
                let matches = (open == '{' && ch == '}') || (open == '[' && ch == ']');
                if !matches {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}
