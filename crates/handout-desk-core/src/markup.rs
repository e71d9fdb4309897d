//! Section content conversion: math rewriting, Markdown to HTML, and
//! Markdown to plain text blocks for the PDF layout.

use std::sync::OnceLock;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use pulldown_cmark::{html, Event, Options, Parser, Tag, TagEnd};
use regex::{Captures, Regex};

use crate::template::escape_html;

const MATH_IMAGE_BASE: &str = "https://latex.codecogs.com/svg.latex?";

fn block_math() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\$\$(.*?)\$\$").expect("valid block math regex"))
}

fn inline_math() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$(.*?)\$").expect("valid inline math regex"))
}

/// Where rewritten math ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathTarget {
    /// External SVG image references, for HTML output.
    Html,
    /// Bracketed source, for text-only layouts.
    Text,
}

/// Unreserved characters and `/` stay as they are.
const URL_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/');

/// Percent-encode everything except unreserved characters and `/`.
pub fn percent_encode(input: &str) -> String {
    utf8_percent_encode(input, URL_PATH).to_string()
}

/// Rewrite `$$…$$` (block, may span lines) and then `$…$` (inline).
pub fn rewrite_math(text: &str, target: MathTarget) -> String {
    if text.is_empty() {
        return String::new();
    }

    let blocks = block_math().replace_all(text, |caps: &Captures| {
        let code = caps[1].trim();
        match target {
            MathTarget::Html => format!(
                r#"<div class="math-block"><img src="{}{}" alt="{}" /></div>"#,
                MATH_IMAGE_BASE,
                percent_encode(code),
                escape_html(code)
            ),
            MathTarget::Text => format!("\n\n[math: {}]\n\n", code),
        }
    });

    inline_math()
        .replace_all(&blocks, |caps: &Captures| {
            let code = caps[1].trim();
            match target {
                MathTarget::Html => format!(
                    r#"<img class="math-inline" src="{}{}" alt="{}" />"#,
                    MATH_IMAGE_BASE,
                    percent_encode(code),
                    escape_html(code)
                ),
                MathTarget::Text => format!("[math: {}]", code),
            }
        })
        .into_owned()
}

fn markdown_options() -> Options {
    Options::ENABLE_TABLES
        | Options::ENABLE_FOOTNOTES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS
        | Options::ENABLE_HEADING_ATTRIBUTES
}

/// Section content to HTML, with math already rewritten to images.
pub fn section_html(content: &str) -> String {
    let source = rewrite_math(content, MathTarget::Html);
    let mut out = String::new();
    html::push_html(&mut out, Parser::new_ext(&source, markdown_options()));
    out
}

/// Point media links at local files: `src="{media_url}x"` becomes
/// `src="file://{media_root}/x"`.
pub fn rewrite_media_urls(html: &str, media_url: &str, media_root: &str) -> String {
    if media_url.is_empty() {
        return html.to_string();
    }
    let from = format!("src=\"{}", media_url);
    let to = format!("src=\"file://{}/", media_root.trim_end_matches('/'));
    html.replace(&from, &to)
}

/// A paragraph-sized piece of plain text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBlock {
    pub text: String,
    /// Code blocks keep their line breaks and are not re-wrapped.
    pub preformatted: bool,
}

struct BlockBuilder {
    blocks: Vec<TextBlock>,
    current: String,
}

impl BlockBuilder {
    fn flush(&mut self) {
        let text = self.current.trim().to_string();
        if !text.is_empty() {
            self.blocks.push(TextBlock {
                text,
                preformatted: false,
            });
        }
        self.current.clear();
    }
}

/// Section content to plain text blocks for the PDF layout.
pub fn section_text(content: &str) -> Vec<TextBlock> {
    let source = rewrite_math(content, MathTarget::Text);
    let mut b = BlockBuilder {
        blocks: Vec::new(),
        current: String::new(),
    };
    let mut in_code = false;
    let mut list_depth = 0usize;

    for event in Parser::new_ext(&source, markdown_options()) {
        match event {
            Event::Start(Tag::List(_)) => {
                b.flush();
                list_depth += 1;
            }
            Event::End(TagEnd::List(_)) => {
                b.flush();
                list_depth = list_depth.saturating_sub(1);
            }
            Event::Start(Tag::Item) => {
                b.flush();
                b.current.push_str(&"  ".repeat(list_depth.saturating_sub(1)));
                b.current.push_str("- ");
            }
            Event::Start(Tag::CodeBlock(_)) => {
                b.flush();
                in_code = true;
            }
            Event::End(TagEnd::CodeBlock) => {
                let text = b.current.trim_end().to_string();
                if !text.is_empty() {
                    b.blocks.push(TextBlock {
                        text,
                        preformatted: true,
                    });
                }
                b.current.clear();
                in_code = false;
            }
            Event::End(
                TagEnd::Paragraph
                | TagEnd::Heading(_)
                | TagEnd::Item
                | TagEnd::TableRow
                | TagEnd::TableHead,
            ) => b.flush(),
            Event::End(TagEnd::TableCell) => b.current.push_str(" | "),
            Event::Text(t) | Event::Code(t) => b.current.push_str(&t),
            Event::SoftBreak => b.current.push(if in_code { '\n' } else { ' ' }),
            Event::HardBreak => b.current.push('\n'),
            Event::Rule => {
                b.flush();
                b.blocks.push(TextBlock {
                    text: "----".to_string(),
                    preformatted: true,
                });
            }
            Event::TaskListMarker(done) => b.current.push_str(if done { "[x] " } else { "[ ] " }),
            _ => {}
        }
    }
    b.flush();
    b.blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_encode_matches_quote() {
        assert_eq!(percent_encode("x^2 + y"), "x%5E2%20%2B%20y");
        assert_eq!(percent_encode("a/b_c.d-e~"), "a/b_c.d-e~");
        assert_eq!(percent_encode("\\frac{1}{2}"), "%5Cfrac%7B1%7D%7B2%7D");
        assert_eq!(percent_encode("講義 1.pdf"), "%E8%AC%9B%E7%BE%A9%201.pdf");
    }

    #[test]
    fn test_block_math_before_inline() {
        let out = rewrite_math("see $$ a+b $$ and $c$", MathTarget::Html);
        assert!(out.contains(r#"<div class="math-block"><img src="https://latex.codecogs.com/svg.latex?a%2Bb""#));
        assert!(out.contains(r#"<img class="math-inline" src="https://latex.codecogs.com/svg.latex?c""#));
        assert!(!out.contains('$'));
    }

    #[test]
    fn test_block_math_spans_lines() {
        let out = rewrite_math("$$\nx = 1\n$$", MathTarget::Text);
        assert_eq!(out.trim(), "[math: x = 1]");
    }

    #[test]
    fn test_inline_math_does_not_span_lines() {
        let out = rewrite_math("costs $5\nand $6", MathTarget::Text);
        assert_eq!(out, "costs $5\nand $6");
    }

    #[test]
    fn test_empty_content() {
        assert_eq!(rewrite_math("", MathTarget::Html), "");
        assert!(section_text("").is_empty());
    }

    #[test]
    fn test_section_html() {
        let html = section_html("Hello **world**\n\n| a | b |\n|---|---|\n| 1 | 2 |");
        assert!(html.contains("<strong>world</strong>"));
        assert!(html.contains("<table>"));
    }

    #[test]
    fn test_section_text_blocks() {
        let blocks = section_text("Intro line\nwraps.\n\n- one\n- two\n\n```\nfn x() {}\n```\n\nArea is $r^2$.");
        let texts: Vec<&str> = blocks.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["Intro line wraps.", "- one", "- two", "fn x() {}", "Area is [math: r^2]."]
        );
        assert!(blocks[3].preformatted);
    }

    #[test]
    fn test_media_rewrite() {
        let html = r#"<img src="/media/a.png" /><img src="https://x/y.png" />"#;
        let out = rewrite_media_urls(html, "/media/", "/srv/media/");
        assert_eq!(
            out,
            r#"<img src="file:///srv/media/a.png" /><img src="https://x/y.png" />"#
        );
    }
}
