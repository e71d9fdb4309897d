//! Standalone HTML rendering of a handout.

use std::path::Path;

use tracing::warn;

use handout_desk_core::markup;
use handout_desk_core::models::Section;
use handout_desk_core::style::{Heading, IndentMode, Language, RenderStyle};
use handout_desk_core::template::escape_html;

pub struct HtmlDocument<'a> {
    pub title: &'a str,
    pub subtitle: &'a str,
    pub date: String,
    pub style: &'a RenderStyle,
    /// Sections in reading order.
    pub sections: &'a [Section],
    /// Extra CSS appended after the generated rules.
    pub stylesheet: &'a str,
}

/// Read the configured stylesheet. A missing or unreadable file is logged
/// and treated as empty.
pub fn load_stylesheet(path: Option<&Path>) -> String {
    let Some(path) = path else {
        return String::new();
    };
    match std::fs::read_to_string(path) {
        Ok(css) => css,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "stylesheet not readable, using none");
            String::new()
        }
    }
}

fn lang_attr(language: Language) -> &'static str {
    match language {
        Language::En => "en",
        Language::ZhTw => "zh-Hant-TW",
        Language::ZhCn => "zh-Hans-CN",
        Language::Th => "th",
    }
}

fn css(style: &RenderStyle) -> String {
    let typography = style.resolve_typography();
    let mut out = String::new();
    out.push_str(&format!(
        "body {{ font-family: {}; line-height: 1.6; color: #1a1a1a; }}\n",
        style.font_style.css_family()
    ));
    for heading in Heading::ALL {
        let h = typography.get(heading);
        out.push_str(&format!(
            "{} {{ color: {}; font-family: {}; }}\n",
            heading.tag(),
            h.color,
            h.font.css_family()
        ));
    }
    match style.indent_mode {
        IndentMode::FirstLine => out.push_str(".section-body p { text-indent: 2em; }\n"),
        IndentMode::Block => {
            out.push_str(".level-subsection .section-body { margin-left: 1.5em; }\n");
            out.push_str(".level-subsubsection .section-body { margin-left: 3em; }\n");
        }
        IndentMode::None => {}
    }
    let strings = style.language.strings();
    out.push_str(&format!(
        "@page {{ size: A4; margin: 2cm; @{} {{ content: \"{}\" counter(page) \"{}\"; }} }}\n",
        style.page_number_pos.css_area(),
        strings.page_prefix,
        strings.page_suffix
    ));
    out.push_str("@page :first { @bottom-right { content: none; } @bottom-center { content: none; } @bottom-left { content: none; } @top-right { content: none; } }\n");
    out.push_str(".title-page { page-break-after: always; text-align: center; padding-top: 30%; }\n");
    out.push_str(".toc { page-break-after: always; }\n");
    out.push_str(".level-section { page-break-before: auto; }\n");
    out
}

/// Render the complete HTML document: title page, table of contents and
/// the sections in reading order.
pub fn render_html(doc: &HtmlDocument) -> String {
    let style = doc.style;
    let strings = style.language.strings();
    let mut html = String::new();

    html.push_str(&format!(
        "<!DOCTYPE html>\n<html lang=\"{}\">\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n<style>\n{}{}\n</style>\n</head>\n<body>\n",
        lang_attr(style.language),
        escape_html(doc.title),
        css(style),
        doc.stylesheet
    ));

    html.push_str("<section class=\"title-page\">\n");
    html.push_str(&format!("<h1>{}</h1>\n", escape_html(doc.title)));
    if !doc.subtitle.is_empty() {
        html.push_str(&format!(
            "<p class=\"subtitle\">{}</p>\n",
            escape_html(doc.subtitle)
        ));
    }
    for (class, value) in [
        ("author", style.author.as_str()),
        ("institution", style.institution.as_str()),
        ("date", doc.date.as_str()),
    ] {
        if !value.is_empty() {
            html.push_str(&format!(
                "<p class=\"{}\">{}</p>\n",
                class,
                escape_html(value)
            ));
        }
    }
    html.push_str("</section>\n");

    html.push_str(&format!(
        "<nav class=\"toc\">\n<h2>{}</h2>\n<ul>\n",
        escape_html(strings.toc_title)
    ));
    for section in doc.sections {
        html.push_str(&format!(
            "<li class=\"toc-{}\"><a href=\"#section-{}\">{}</a></li>\n",
            section.level.as_str(),
            section.id,
            escape_html(&section.title)
        ));
    }
    html.push_str("</ul>\n</nav>\n");

    for section in doc.sections {
        let tag = Heading::for_level(section.level).tag();
        html.push_str(&format!(
            "<section id=\"section-{}\" class=\"level-{}\">\n<{}>{}</{}>\n<div class=\"section-body\">\n{}</div>\n</section>\n",
            section.id,
            section.level.as_str(),
            tag,
            escape_html(&section.title),
            tag,
            markup::section_html(&section.content)
        ));
    }

    html.push_str("</body>\n</html>\n");
    html
}
