//! Reply templates and signature handling.

use regex::Regex;

use crate::pipeline::types::Priority;

/// Templated reply used when no generated text is available.
pub fn fallback_reply(priority: Priority) -> &'static str {
    match priority {
        Priority::High => {
            "Thanks for your message. I'm on it and will get back to you shortly with a full response."
        }
        Priority::Medium => "Thanks for reaching out. I'll review this and follow up soon.",
        Priority::Low => "Thanks for the note. I'll take a look when I can.",
    }
}

/// Closing lines a generated reply may already end with.
fn closing_line() -> Option<Regex> {
    Regex::new(
        r"(?i)^(best|best regards|kind regards|warm regards|regards|thanks|thank you|many thanks|cheers|sincerely|all the best)[,.!]?$",
    )
    .ok()
}

/// Append `signature` to `body`.
///
/// A body that already ends with the signature is returned unchanged. A
/// generic trailing sign-off (e.g. `Best,` plus a name line) is replaced.
pub fn append_signature(body: &str, signature: Option<&str>) -> String {
    let body = body.trim_end();
    let Some(signature) = signature.map(str::trim).filter(|s| !s.is_empty()) else {
        return body.to_string();
    };
    if body.ends_with(signature) {
        return body.to_string();
    }

    let mut lines: Vec<&str> = body.lines().collect();
    if let Some(closing) = closing_line() {
        let n = lines.len();
        let is_closing = |line: &str| closing.is_match(line.trim());
        if n >= 2 && is_closing(lines[n - 2]) && looks_like_name(lines[n - 1]) {
            lines.truncate(n - 2);
        } else if n >= 1 && is_closing(lines[n - 1]) {
            lines.truncate(n - 1);
        }
    }

    let stripped = lines.join("\n");
    let stripped = stripped.trim_end();
    if stripped.is_empty() {
        signature.to_string()
    } else {
        format!("{stripped}\n\n{signature}")
    }
}

/// A short line with no sentence punctuation, e.g. `Sam` or `[Your Name]`.
fn looks_like_name(line: &str) -> bool {
    let line = line.trim();
    !line.is_empty()
        && line.split_whitespace().count() <= 4
        && !line.ends_with(['.', '?', '!', ':'])
}
