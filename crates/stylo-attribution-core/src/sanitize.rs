//! Markup stripping, allow-list HTML sanitizing and contact-field shape checks.
//!
//! Every function here is pure and total: malformed input degrades to less
//! output, never to an error.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;
use url::Url;

use crate::FormData;

pub const DEFAULT_ALLOWED_TAGS: [&str; 7] = ["b", "i", "em", "strong", "u", "br", "p"];

/// Tags that are removed whatever the caller allows.
pub const DEFAULT_FORBIDDEN_TAGS: [&str; 8] = [
    "script", "object", "embed", "form", "input", "textarea", "select", "button",
];

/// Attributes that are removed whatever the caller allows.
pub const DEFAULT_FORBIDDEN_ATTRIBUTES: [&str; 7] = [
    "onclick",
    "onload",
    "onerror",
    "onmouseover",
    "onfocus",
    "onblur",
    "onchange",
];

/// Elements whose text content goes away together with the element.
const DROP_CONTENT_TAGS: [&str; 16] = [
    "script", "style", "iframe", "noscript", "template", "title", "textarea", "xmp", "noembed",
    "noframes", "plaintext", "object", "embed", "svg", "math", "select",
];

const UNSAFE_VALUE_SCHEMES: [&str; 3] = ["javascript:", "vbscript:", "data:"];

const MAX_SANITIZE_PASSES: usize = 8;

/// Allow-list configuration for [`sanitize_html`].
///
/// The deny-lists start from [`DEFAULT_FORBIDDEN_TAGS`] and
/// [`DEFAULT_FORBIDDEN_ATTRIBUTES`] and can only grow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizeOptions {
    allowed_tags: BTreeSet<String>,
    allowed_attributes: BTreeSet<String>,
    forbidden_tags: BTreeSet<String>,
    forbidden_attributes: BTreeSet<String>,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        Self {
            allowed_tags: lowercase_set(DEFAULT_ALLOWED_TAGS),
            allowed_attributes: BTreeSet::new(),
            forbidden_tags: lowercase_set(DEFAULT_FORBIDDEN_TAGS),
            forbidden_attributes: lowercase_set(DEFAULT_FORBIDDEN_ATTRIBUTES),
        }
    }
}

impl SanitizeOptions {
    /// Replaces the allowed tag list.
    #[must_use]
    pub fn allow_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.allowed_tags = lowercase_set(tags);
        self
    }

    /// Replaces the allowed attribute list.
    #[must_use]
    pub fn allow_attributes<I, T>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.allowed_attributes = lowercase_set(attributes);
        self
    }

    /// Adds tags to the deny-list.
    #[must_use]
    pub fn forbid_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.forbidden_tags.extend(lowercase_set(tags));
        self
    }

    /// Adds attributes to the deny-list.
    #[must_use]
    pub fn forbid_attributes<I, T>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.forbidden_attributes.extend(lowercase_set(attributes));
        self
    }

    #[must_use]
    pub fn is_tag_allowed(&self, tag: &str) -> bool {
        let tag = tag.to_ascii_lowercase();
        self.allowed_tags.contains(&tag)
            && !self.forbidden_tags.contains(&tag)
            && !DEFAULT_FORBIDDEN_TAGS.contains(&tag.as_str())
    }

    #[must_use]
    pub fn is_attribute_allowed(&self, attribute: &str) -> bool {
        let attribute = attribute.to_ascii_lowercase();
        self.allowed_attributes.contains(&attribute)
            && !self.forbidden_attributes.contains(&attribute)
            && !DEFAULT_FORBIDDEN_ATTRIBUTES.contains(&attribute.as_str())
            && !attribute.starts_with("on")
    }
}

/// Strips all markup and keeps the text content.
///
/// Markup is removed in one left-to-right scan. When a removal joins a
/// leftover `<` or `</` with the text after it, that spot is matched again,
/// so tags reassembled from nested fragments go too and the result is a
/// fixpoint: applying it twice gives the same string as applying it once.
#[must_use]
pub fn sanitize_text(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    let mut spliced = false;

    loop {
        // Only the last two output characters can become markup again.
        if spliced {
            spliced = false;
            if output.ends_with("</") {
                if let Some(found) = closing_tag_tail_pattern().find(rest) {
                    output.truncate(output.len() - 2);
                    rest = &rest[found.end()..];
                    spliced = true;
                    continue;
                }
            } else if output.ends_with('<') {
                if let Some(found) = markup_tail_pattern().find(rest) {
                    output.pop();
                    rest = &rest[found.end()..];
                    spliced = true;
                    continue;
                }
            }
        }

        let Some(start) = rest.find('<') else {
            output.push_str(rest);
            return output;
        };
        output.push_str(&rest[..start]);
        rest = &rest[start..];

        match markup_pattern().find(rest) {
            Some(found) => {
                rest = &rest[found.end()..];
                spliced = true;
            }
            None => {
                output.push('<');
                rest = &rest[1..];
            }
        }
    }
}

/// Allow-list markup sanitizer.
///
/// Allowed tags are re-emitted in lowercase with only allowed, safe attributes.
/// Everything else is removed; text content is kept except inside
/// script-like elements.
#[must_use]
pub fn sanitize_html(input: &str, options: &SanitizeOptions) -> String {
    let mut current = input.to_string();
    for _ in 0..MAX_SANITIZE_PASSES {
        let next = sanitize_html_once(&current, options);
        if next == current {
            return next;
        }
        current = next;
    }

    tracing::warn!(
        passes = MAX_SANITIZE_PASSES,
        "markup did not stabilise, falling back to plain text"
    );
    sanitize_text(input)
}

/// Applies [`sanitize_text`] and trims every string field; arrays are handled
/// element-wise and any other value passes through.
#[must_use]
pub fn sanitize_form_data(data: &FormData) -> FormData {
    data.iter()
        .map(|(key, value)| (key.clone(), sanitize_form_value(value)))
        .collect()
}

#[must_use]
pub fn is_valid_email(input: &str) -> bool {
    email_pattern().is_match(&sanitize_text(input))
}

#[must_use]
pub fn is_valid_phone(input: &str) -> bool {
    phone_pattern().is_match(&sanitize_text(input))
}

/// Returns the canonical form of an absolute `http`/`https` URL, otherwise an
/// empty string.
#[must_use]
pub fn sanitize_url(input: &str) -> String {
    match Url::parse(input) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url.to_string(),
        _ => String::new(),
    }
}

fn sanitize_form_value(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(sanitize_text(text).trim().to_string()),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| match item {
                    Value::String(text) => Value::String(sanitize_text(text).trim().to_string()),
                    other => other.clone(),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn sanitize_html_once(input: &str, options: &SanitizeOptions) -> String {
    let mut current = comment_pattern().replace_all(input, "").into_owned();
    for (tag, pattern) in drop_content_patterns() {
        if !options.is_tag_allowed(tag) {
            current = pattern.replace_all(&current, "").into_owned();
        }
    }
    current = declaration_pattern().replace_all(&current, "").into_owned();
    tag_pattern()
        .replace_all(&current, |caps: &Captures<'_>| rebuild_tag(caps, options))
        .into_owned()
}

fn rebuild_tag(caps: &Captures<'_>, options: &SanitizeOptions) -> String {
    let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
    let name = caps
        .get(2)
        .map_or_else(String::new, |m| m.as_str().to_ascii_lowercase());

    if !options.is_tag_allowed(&name) {
        return String::new();
    }
    if closing {
        return format!("</{name}>");
    }

    let mut rebuilt = format!("<{name}");
    let raw_attributes = caps.get(3).map_or("", |m| m.as_str());
    for attribute in attribute_pattern().captures_iter(raw_attributes) {
        let attribute_name = attribute
            .get(1)
            .map_or_else(String::new, |m| m.as_str().to_ascii_lowercase());
        if !options.is_attribute_allowed(&attribute_name) {
            continue;
        }

        let value = attribute
            .get(2)
            .or_else(|| attribute.get(3))
            .or_else(|| attribute.get(4))
            .map_or("", |m| m.as_str());
        if is_unsafe_attribute_value(value) {
            continue;
        }

        rebuilt.push(' ');
        rebuilt.push_str(&attribute_name);
        rebuilt.push_str("=\"");
        rebuilt.push_str(&escape_attribute_value(value));
        rebuilt.push('"');
    }
    rebuilt.push('>');
    rebuilt
}

fn is_unsafe_attribute_value(value: &str) -> bool {
    let normalized: String = value
        .chars()
        .filter(|ch| !ch.is_whitespace() && !ch.is_control())
        .collect::<String>()
        .to_ascii_lowercase();

    // Character references could spell a scheme once the browser decodes them.
    normalized.contains("&#")
        || normalized.contains("&colon")
        || UNSAFE_VALUE_SCHEMES
            .iter()
            .any(|scheme| normalized.starts_with(scheme))
}

fn escape_attribute_value(value: &str) -> String {
    value
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn lowercase_set<I, T>(items: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    items
        .into_iter()
        .map(|item| item.as_ref().trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

pub(crate) fn compile_pattern(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(value) => value,
        Err(err) => panic!("built-in pattern {pattern} failed to compile: {err}"),
    }
}

fn comment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| compile_pattern(r"(?s)<!--.*?(?:-->|\z)"))
}

fn declaration_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| compile_pattern(r"<[!?][^>]*(?:>|\z)"))
}

// An unterminated quote or a missing `>` runs the tag to the end of input,
// which is how a browser treats it too.
fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        compile_pattern(
            r#"<(/?)([A-Za-z][A-Za-z0-9:-]*)((?:[^>"']|"[^"]*(?:"|\z)|'[^']*(?:'|\z))*)(?:>|\z)"#,
        )
    })
}

fn attribute_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        compile_pattern(
            r#"([^\s"'<>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#,
        )
    })
}

fn drop_content_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        DROP_CONTENT_TAGS
            .iter()
            .map(|tag| {
                (
                    *tag,
                    compile_pattern(&format!(
                        r"(?is)<{tag}\b[^>]*>.*?(?:</{tag}\s*>|\z)"
                    )),
                )
            })
            .collect()
    })
}

// Alternatives of everything `sanitize_text` removes, written without the
// leading `<`. Earlier alternatives win, so comments and script-like
// elements are taken whole before the generic tag rule applies.
fn markup_alternatives() -> String {
    let mut alternatives = vec![r"(?s:!--.*?(?:-->|\z))".to_string()];
    alternatives.extend(
        DROP_CONTENT_TAGS
            .iter()
            .map(|tag| format!(r"(?is:{tag}\b[^>]*>.*?(?:</{tag}\s*>|\z))")),
    );
    alternatives.push(r"[!?][^>]*(?:>|\z)".to_string());
    alternatives.push(format!("/?{TAG_BODY}"));
    alternatives.join("|")
}

const TAG_BODY: &str =
    r#"[A-Za-z][A-Za-z0-9:-]*(?:[^>"']|"[^"]*(?:"|\z)|'[^']*(?:'|\z))*(?:>|\z)"#;

fn markup_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| compile_pattern(&format!(r"\A<(?:{})", markup_alternatives())))
}

/// Markup that starts with a `<` already written to the output.
fn markup_tail_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| compile_pattern(&format!(r"\A(?:{})", markup_alternatives())))
}

/// Closing tag whose `</` is already written to the output.
fn closing_tag_tail_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| compile_pattern(&format!(r"\A(?:{TAG_BODY})")))
}

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| compile_pattern(r"^[^\s@]+@[^\s@]+\.[^\s@]+$"))
}

fn phone_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| compile_pattern(r"^[0-9\s()+-]{10,}$"))
}
