//! Defense-in-depth input cleaning and response header values.
//!
//! Not a full HTML sanitizer. With `allow_html = false` every markup-significant
//! character is escaped. With `allow_html = true` script-bearing constructs are
//! stripped and the remaining markup is kept.

use regex::Regex;
use std::sync::OnceLock;

pub const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; script-src 'self'; \
style-src 'self' 'unsafe-inline'; img-src 'self' data: https:; connect-src 'self'; \
font-src 'self'; object-src 'none'; base-uri 'self'; form-action 'self'; frame-ancestors 'none'";

// Nested payloads like `<scr<script>ipt>` reassemble after one pass.
const MAX_STRIP_PASSES: usize = 8;

const SCRIPT_TAGS: &str = "script|style|iframe|object|embed|svg|math";
const HANDLER_VALUE: &str = r#"\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#;

static STRIP_RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();

/// Pattern sources paired with their replacement. Handlers glued to a quote keep
/// the quote so the preceding attribute stays closed.
fn strip_rule_sources() -> [(String, &'static str); 6] {
    [
        (
            format!(r"(?is)<\s*({SCRIPT_TAGS})\b[^>]*>.*?<\s*/\s*({SCRIPT_TAGS})\s*>"),
            "",
        ),
        (
            format!(r"(?is)<\s*/?\s*({SCRIPT_TAGS}|base|meta|link)\b[^>]*>"),
            "",
        ),
        (format!(r"(?is)[\s/]+on[a-z]+{HANDLER_VALUE}"), ""),
        (format!(r#"(?is)(["'])on[a-z]+{HANDLER_VALUE}"#), "${1}"),
        (r"(?i)(javascript|vbscript)\s*:".to_string(), ""),
        (r"(?i)data\s*:\s*text/html".to_string(), ""),
    ]
}

fn strip_rules() -> &'static [(Regex, &'static str)] {
    STRIP_RULES.get_or_init(|| {
        strip_rule_sources()
            .into_iter()
            .filter_map(|(pattern, replacement)| {
                Regex::new(&pattern).ok().map(|re| (re, replacement))
            })
            .collect()
    })
}

/// Cleans untrusted text before it is stored or echoed back.
#[must_use]
pub fn sanitize_input(input: &str, allow_html: bool) -> String {
    if !allow_html {
        return escape_html(input);
    }

    let mut current = input.to_string();
    for _ in 0..MAX_STRIP_PASSES {
        let next = strip_rules()
            .iter()
            .fold(current.clone(), |text, (re, replacement)| {
                re.replace_all(&text, *replacement).into_owned()
            });
        if next == current {
            return current;
        }
        current = next;
    }
    // Still changing after the pass limit: give up on keeping markup.
    escape_html(&current)
}

#[must_use]
pub fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            '/' => escaped.push_str("&#x2F;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[must_use]
pub fn content_security_policy() -> &'static str {
    CONTENT_SECURITY_POLICY
}

/// Header name/value pairs for the calling web layer to attach to responses.
#[must_use]
pub fn security_headers() -> [(&'static str, &'static str); 4] {
    [
        ("Content-Security-Policy", CONTENT_SECURITY_POLICY),
        ("X-Content-Type-Options", "nosniff"),
        ("X-Frame-Options", "DENY"),
        ("Referrer-Policy", "strict-origin-when-cross-origin"),
    ]
}
