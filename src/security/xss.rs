//! XSS (Cross-Site Scripting) protection module
//!
//! Detection helpers used when validating display names, and the
//! HTML escaping applied to user text before it is relayed.

use regex::Regex;
use std::sync::LazyLock;

/// HTML entities for encoding special characters
const HTML_ENTITIES: &[(char, &str)] = &[
    ('&', "&amp;"),
    ('<', "&lt;"),
    ('>', "&gt;"),
    ('"', "&#34;"),
    ('\'', "&#39;"),
];

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<[^>]*>").expect("valid HTML tag pattern"));

/// Script URIs and inline event handlers such as `onclick=`
static SCRIPT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(javascript:|vbscript:|data:|on\w+\s*=)").expect("valid script pattern")
});

/// Encode HTML entities to prevent XSS attacks
pub fn encode_html(input: &str) -> String {
    let mut result = String::with_capacity(input.len());

    for ch in input.chars() {
        match HTML_ENTITIES.iter().find(|(special, _)| *special == ch) {
            Some((_, entity)) => result.push_str(entity),
            None => result.push(ch),
        }
    }

    result
}

/// Trim surrounding whitespace and encode what remains
pub fn clean_user_text(input: &str) -> String {
    encode_html(input.trim())
}

/// Check if the text contains anything shaped like an HTML tag
pub fn contains_html_tag(content: &str) -> bool {
    HTML_TAG.is_match(content)
}

/// Check if the text contains a script URI or an inline event handler
pub fn contains_script_pattern(content: &str) -> bool {
    if let Some(found) = SCRIPT_PATTERN.find(content) {
        log::warn!("Potential script pattern detected: {}", found.as_str());
        return true;
    }
    false
}
