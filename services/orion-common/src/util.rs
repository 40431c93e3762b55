//! Utility functions for the Orion services.

use regex::Regex;
use std::sync::LazyLock;

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Uses character boundaries, so multi-byte UTF-8 input is safe.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

static REDACTIONS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)(auth|access_token)=[^&\s]+", "$1=***REDACTED***"),
        (r"(?i)(token|secret|bearer)\s*[=:]\s*\S{10,}", "$1=***REDACTED***"),
        (r"bot\d+:[A-Za-z0-9_-]{20,}", "bot***REDACTED***"),
        (r"-----BEGIN [A-Z ]*PRIVATE KEY-----[^-]*", "***REDACTED_PRIVATE_KEY***"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| (Regex::new(pattern).unwrap(), replacement))
    .collect()
});

/// Mask database secrets, OAuth tokens, bot tokens and private keys before
/// a string reaches the logs.
pub fn sanitize_for_log(s: &str) -> String {
    REDACTIONS
        .iter()
        .fold(s.to_string(), |acc, (re, replacement)| {
            re.replace_all(&acc, *replacement).into_owned()
        })
}

/// Seconds from `"90"`, `"30s"`, `"5m"`, `"1h"` or `"2d"`.
pub fn parse_duration_secs(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let Some(last) = s.chars().last() else {
        return Err("Empty duration string".into());
    };

    if last.is_ascii_digit() {
        return s.parse().map_err(|_| format!("Invalid number: {s}"));
    }

    let multiplier = match last {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        other => return Err(format!("Unknown unit: {other}")),
    };
    let number = &s[..s.len() - last.len_utf8()];
    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number: {number}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("Duration too large: {s}"))
}

/// Interpret common truthy/falsy strings from environment variables.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
