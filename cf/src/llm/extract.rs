//! JSON extraction from model responses
//!
//! Models wrap JSON in prose and markdown fences; this locates the first
//! balanced top-level object and parses it.

use serde_json::Value;

/// Extract the first JSON object from a model response.
///
/// Strips optional markdown fences, then scans for the outermost balanced
/// `{...}` while honoring string literals and escapes.
pub fn extract_first_json(text: &str) -> Option<Value> {
    let stripped = strip_fences(text);

    let start = stripped.find('{')?;
    let bytes = stripped.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &stripped[start..start + offset + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) up to the first newline
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest)
}
