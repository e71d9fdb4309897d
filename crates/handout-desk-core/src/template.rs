//! `{{ key }}` placeholder substitution for email templates.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("valid placeholder regex"))
}

/// Escape text for inclusion in HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every `{{ key }}` with the matching entry of `context`.
/// Unknown keys render empty. With `escape`, values are HTML-escaped.
pub fn render(template: &str, context: &Value, escape: bool) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| {
            let text = context.get(&caps[1]).map(value_text).unwrap_or_default();
            if escape {
                escape_html(&text)
            } else {
                text
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_substitutes() {
        let ctx = json!({"username": "mei", "percentage": "91%"});
        assert_eq!(
            render("Hi {{username}}, you are at {{ percentage }}.", &ctx, false),
            "Hi mei, you are at 91%."
        );
    }

    #[test]
    fn test_missing_key_renders_empty() {
        assert_eq!(render("[{{ nope }}]", &json!({}), false), "[]");
    }

    #[test]
    fn test_numbers_and_escaping() {
        let ctx = json!({"n": 30, "name": "<b>&</b>"});
        assert_eq!(render("{{n}} min", &ctx, true), "30 min");
        assert_eq!(
            render("<p>{{ name }}</p>", &ctx, true),
            "<p>&lt;b&gt;&amp;&lt;/b&gt;</p>"
        );
    }
}
