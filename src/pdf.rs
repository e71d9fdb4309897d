//! Paginated PDF output built directly with `lopdf`.
//!
//! The layout uses the 14 standard Type1 fonts with WinAnsi encoding, so no
//! font files are embedded. Characters outside Latin-1 are replaced with
//! `?`. Glyph widths are approximated per character class, which is close
//! enough for line wrapping.
//!
//! Page order: title page, table of contents, then the sections in reading
//! order, each heading colored per the resolved typography.

use anyhow::Result;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream, StringFormat};

use handout_desk_core::markup::{self, TextBlock};
use handout_desk_core::models::{Section, SectionLevel};
use handout_desk_core::style::{
    FontStyle, Heading, IndentMode, PageNumberPos, RenderStyle, ResolvedTypography,
};

const PAGE_WIDTH: f32 = 595.0;
const PAGE_HEIGHT: f32 = 842.0;
const MARGIN: f32 = 56.0;
const BODY_SIZE: f32 = 10.5;
const CODE_SIZE: f32 = 9.0;
const LINE_FACTOR: f32 = 1.4;
const FOOTER_OFFSET: f32 = 30.0;
const FIRST_LINE_INDENT: f32 = 18.0;
const BLOCK_INDENT: f32 = 14.0;

/// What a handout contributes to its PDF.
pub struct PdfDocument<'a> {
    pub title: &'a str,
    pub subtitle: &'a str,
    pub date: String,
    pub style: &'a RenderStyle,
    /// Sections in reading order.
    pub sections: &'a [Section],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Font {
    Sans,
    SansBold,
    Serif,
    SerifBold,
    Mono,
}

impl Font {
    const ALL: [Font; 5] = [
        Font::Sans,
        Font::SansBold,
        Font::Serif,
        Font::SerifBold,
        Font::Mono,
    ];

    fn resource_name(&self) -> &'static str {
        match self {
            Font::Sans => "F1",
            Font::SansBold => "F2",
            Font::Serif => "F3",
            Font::SerifBold => "F4",
            Font::Mono => "F5",
        }
    }

    fn base_font(&self) -> &'static str {
        match self {
            Font::Mono => "Courier",
            Font::Sans => FontStyle::Sans.pdf_base_font(),
            Font::SansBold => FontStyle::Sans.pdf_bold_font(),
            Font::Serif => FontStyle::Serif.pdf_base_font(),
            Font::SerifBold => FontStyle::Serif.pdf_bold_font(),
        }
    }

    fn regular(style: FontStyle) -> Self {
        match style {
            FontStyle::Sans => Font::Sans,
            FontStyle::Serif => Font::Serif,
        }
    }

    fn bold(style: FontStyle) -> Self {
        match style {
            FontStyle::Sans => Font::SansBold,
            FontStyle::Serif => Font::SerifBold,
        }
    }

    /// Approximate advance width of `c` in em units.
    fn char_width(&self, c: char) -> f32 {
        if *self == Font::Mono {
            return 0.6;
        }
        let base = match c {
            'i' | 'j' | 'l' | '.' | ',' | ';' | ':' | '\'' | '|' | '!' | 'I' => 0.28,
            'f' | 't' | 'r' | ' ' | '(' | ')' | '[' | ']' | '-' => 0.33,
            'm' | 'w' | 'M' | 'W' | '@' => 0.83,
            c if c.is_ascii_uppercase() => 0.68,
            c if c.is_ascii_digit() => 0.556,
            _ => 0.52,
        };
        match self {
            Font::SansBold | Font::SerifBold => base * 1.06,
            Font::Serif => base * 0.94,
            _ => base,
        }
    }

    fn text_width(&self, text: &str, size: f32) -> f32 {
        text.chars().map(|c| self.char_width(c)).sum::<f32>() * size
    }
}

/// Encode to WinAnsi bytes; anything outside Latin-1 becomes `?`.
fn encode_text(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c as u32 {
            0x20..=0x7e | 0xa0..=0xff => c as u32 as u8,
            0x2018 | 0x2019 => 0x27,
            0x201c | 0x201d => 0x22,
            0x2013 | 0x2014 => 0x2d,
            _ => b'?',
        })
        .collect()
}

/// True when `text` survives [`encode_text`] without substitutions.
fn encodable(text: &str) -> bool {
    text.chars()
        .all(|c| matches!(c as u32, 0x20..=0x7e | 0xa0..=0xff))
}

/// Greedy word wrap by approximate width. Words longer than a line are
/// split by character.
fn wrap(text: &str, font: Font, size: f32, width: f32) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        let candidate = if current.is_empty() {
            word.to_string()
        } else {
            format!("{} {}", current, word)
        };
        if font.text_width(&candidate, size) <= width {
            current = candidate;
            continue;
        }
        if !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        for c in word.chars() {
            current.push(c);
            if font.text_width(&current, size) > width {
                current.pop();
                lines.push(std::mem::take(&mut current));
                current.push(c);
            }
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Hierarchical heading numbers (`1`, `1.2`, `1.2.1`) in reading order.
fn heading_numbers(sections: &[Section]) -> Vec<String> {
    let mut counters = [0usize; 3];
    sections
        .iter()
        .map(|s| {
            let depth = s.level.depth();
            counters[depth] += 1;
            for deeper in counters.iter_mut().skip(depth + 1) {
                *deeper = 0;
            }
            counters[..=depth]
                .iter()
                .map(|n| n.to_string())
                .collect::<Vec<_>>()
                .join(".")
        })
        .collect()
}

fn heading_size(heading: Heading) -> f32 {
    match heading {
        Heading::H1 => 24.0,
        Heading::H2 => 16.0,
        Heading::H3 => 13.0,
        Heading::H4 => 11.5,
    }
}

fn text_ops(
    font: Font,
    size: f32,
    color: (f32, f32, f32),
    x: f32,
    y: f32,
    text: &str,
) -> Vec<Operation> {
    vec![
        Operation::new("BT", vec![]),
        Operation::new("rg", vec![color.0.into(), color.1.into(), color.2.into()]),
        Operation::new("Tf", vec![font.resource_name().into(), size.into()]),
        Operation::new("Td", vec![x.into(), y.into()]),
        Operation::new(
            "Tj",
            vec![Object::String(encode_text(text), StringFormat::Hexadecimal)],
        ),
        Operation::new("ET", vec![]),
    ]
}

struct Layout {
    pages: Vec<Vec<Operation>>,
    y: f32,
}

impl Layout {
    fn new() -> Self {
        Self {
            pages: Vec::new(),
            y: 0.0,
        }
    }

    fn new_page(&mut self) {
        self.pages.push(Vec::new());
        self.y = PAGE_HEIGHT - MARGIN;
    }

    /// Start a new page unless `height` still fits above the bottom margin.
    fn ensure(&mut self, height: f32) {
        if self.pages.is_empty() || self.y - height < MARGIN {
            self.new_page();
        }
    }

    fn page_index(&self) -> usize {
        self.pages.len().saturating_sub(1)
    }

    fn put(&mut self, font: Font, size: f32, color: (f32, f32, f32), x: f32, y: f32, text: &str) {
        if self.pages.is_empty() {
            self.new_page();
        }
        if let Some(ops) = self.pages.last_mut() {
            ops.extend(text_ops(font, size, color, x, y, text));
        }
    }

    /// Write one line at the cursor and move down.
    fn line(&mut self, font: Font, size: f32, color: (f32, f32, f32), x: f32, text: &str) {
        let height = size * LINE_FACTOR;
        self.ensure(height);
        self.y -= size;
        let y = self.y;
        self.put(font, size, color, x, y, text);
        self.y -= height - size;
    }

    fn gap(&mut self, height: f32) {
        self.y -= height;
    }

    fn paragraph(&mut self, text: &str, font: Font, size: f32, indent: f32, first_line: f32) {
        let width = PAGE_WIDTH - 2.0 * MARGIN - indent;
        let first = wrap(text, font, size, width - first_line);
        let Some(head) = first.first() else {
            return;
        };
        self.line(font, size, (0.1, 0.1, 0.1), MARGIN + indent + first_line, head);
        let rest = first[1..].join(" ");
        for line in wrap(&rest, font, size, width) {
            self.line(font, size, (0.1, 0.1, 0.1), MARGIN + indent, &line);
        }
    }

    fn preformatted(&mut self, text: &str, indent: f32) {
        let width = PAGE_WIDTH - 2.0 * MARGIN - indent;
        let per_line = (width / (Font::Mono.char_width('m') * CODE_SIZE)).max(1.0) as usize;
        for raw in text.lines() {
            let chars: Vec<char> = raw.chars().collect();
            if chars.is_empty() {
                self.gap(CODE_SIZE * LINE_FACTOR);
                continue;
            }
            for chunk in chars.chunks(per_line) {
                let line: String = chunk.iter().collect();
                self.line(Font::Mono, CODE_SIZE, (0.2, 0.2, 0.2), MARGIN + indent, &line);
            }
        }
    }
}

fn title_page(layout: &mut Layout, doc: &PdfDocument, typography: &ResolvedTypography) {
    layout.new_page();
    let h1 = typography.get(Heading::H1);
    let title_font = Font::bold(h1.font);
    let size = heading_size(Heading::H1);
    let width = PAGE_WIDTH - 2.0 * MARGIN;

    layout.y = PAGE_HEIGHT * 0.62;
    for line in wrap(doc.title, title_font, size, width) {
        layout.line(title_font, size, h1.rgb(), MARGIN, &line);
    }
    let body = Font::regular(doc.style.font_style);
    if !doc.subtitle.is_empty() {
        layout.gap(6.0);
        for line in wrap(doc.subtitle, body, 14.0, width) {
            layout.line(body, 14.0, (0.3, 0.3, 0.3), MARGIN, &line);
        }
    }
    layout.gap(28.0);
    for meta in [&doc.style.author, &doc.style.institution, &doc.date] {
        if !meta.is_empty() {
            layout.line(body, 11.0, (0.3, 0.3, 0.3), MARGIN, meta);
        }
    }
}

/// Lay out the table of contents on fresh pages. `pages` holds the
/// 1-based page of each section once known.
fn toc_pages(
    doc: &PdfDocument,
    numbers: &[String],
    pages: Option<&[usize]>,
    typography: &ResolvedTypography,
) -> Layout {
    let mut layout = Layout::new();
    layout.new_page();
    let h2 = typography.get(Heading::H2);
    let toc_title = doc.style.language.strings().toc_title;
    let toc_title = if encodable(toc_title) {
        toc_title
    } else {
        "Contents"
    };
    layout.line(
        Font::bold(h2.font),
        heading_size(Heading::H2),
        h2.rgb(),
        MARGIN,
        toc_title,
    );
    layout.gap(8.0);

    let body = Font::regular(doc.style.font_style);
    for (i, section) in doc.sections.iter().enumerate() {
        let indent = section.level.depth() as f32 * BLOCK_INDENT;
        let label = format!("{}  {}", numbers[i], section.title);
        layout.line(body, BODY_SIZE, (0.1, 0.1, 0.1), MARGIN + indent, &label);
        if let Some(page) = pages.and_then(|p| p.get(i)) {
            let text = page.to_string();
            let x = PAGE_WIDTH - MARGIN - body.text_width(&text, BODY_SIZE);
            let y = layout.y + (BODY_SIZE * LINE_FACTOR - BODY_SIZE);
            layout.put(body, BODY_SIZE, (0.1, 0.1, 0.1), x, y, &text);
        }
    }
    layout
}

fn body_pages(
    doc: &PdfDocument,
    numbers: &[String],
    typography: &ResolvedTypography,
    first_page: usize,
) -> (Layout, Vec<usize>) {
    let mut layout = Layout::new();
    let mut starts = Vec::with_capacity(doc.sections.len());
    let body = Font::regular(doc.style.font_style);

    for (i, section) in doc.sections.iter().enumerate() {
        let heading = Heading::for_level(section.level);
        let hs = typography.get(heading);
        let size = heading_size(heading);

        if section.level == SectionLevel::Top && !layout.pages.is_empty() {
            layout.gap(size * 0.8);
        }
        // keep a heading with at least two body lines
        layout.ensure(size * LINE_FACTOR + 2.0 * BODY_SIZE * LINE_FACTOR);
        starts.push(first_page + layout.page_index());

        let title = format!("{}  {}", numbers[i], section.title);
        let width = PAGE_WIDTH - 2.0 * MARGIN;
        for line in wrap(&title, Font::bold(hs.font), size, width) {
            layout.line(Font::bold(hs.font), size, hs.rgb(), MARGIN, &line);
        }
        layout.gap(4.0);

        let indent = match doc.style.indent_mode {
            IndentMode::Block => section.level.depth() as f32 * BLOCK_INDENT,
            _ => 0.0,
        };
        let first_line = match doc.style.indent_mode {
            IndentMode::FirstLine => FIRST_LINE_INDENT,
            _ => 0.0,
        };
        for TextBlock { text, preformatted } in markup::section_text(&section.content) {
            if preformatted {
                layout.preformatted(&text, indent);
            } else {
                layout.paragraph(&text, body, BODY_SIZE, indent, first_line);
            }
            layout.gap(BODY_SIZE * 0.5);
        }
    }
    (layout, starts)
}

fn footer(pos: PageNumberPos, label: &str, font: Font) -> (f32, f32) {
    let width = font.text_width(label, 9.0);
    match pos {
        PageNumberPos::BottomRight => (PAGE_WIDTH - MARGIN - width, FOOTER_OFFSET),
        PageNumberPos::BottomCenter => ((PAGE_WIDTH - width) / 2.0, FOOTER_OFFSET),
        PageNumberPos::BottomLeft => (MARGIN, FOOTER_OFFSET),
        PageNumberPos::TopRight => (PAGE_WIDTH - MARGIN - width, PAGE_HEIGHT - FOOTER_OFFSET),
    }
}

/// Render a handout to PDF bytes.
pub fn render(doc: &PdfDocument) -> Result<Vec<u8>> {
    let typography = doc.style.resolve_typography();
    let numbers = heading_numbers(doc.sections);

    let mut title = Layout::new();
    title_page(&mut title, doc, &typography);

    // The TOC page count does not depend on the page numbers it shows.
    let toc_count = toc_pages(doc, &numbers, None, &typography).pages.len();
    let first_body_page = 1 + toc_count + 1;
    let (body, starts) = body_pages(doc, &numbers, &typography, first_body_page);
    let toc = toc_pages(doc, &numbers, Some(&starts), &typography);

    let mut pages: Vec<Vec<Operation>> = Vec::new();
    pages.extend(title.pages);
    pages.extend(toc.pages);
    pages.extend(body.pages);

    // page numbers on every page after the title page
    let footer_font = Font::regular(doc.style.font_style);
    for (i, ops) in pages.iter_mut().enumerate().skip(1) {
        let number = i + 1;
        let label = doc.style.language.page_label(number);
        let label = if encodable(&label) {
            label
        } else {
            number.to_string()
        };
        let (x, y) = footer(doc.style.page_number_pos, &label, footer_font);
        ops.extend(text_ops(footer_font, 9.0, (0.45, 0.45, 0.45), x, y, &label));
    }

    assemble(doc, pages)
}

fn assemble(doc: &PdfDocument, pages: Vec<Vec<Operation>>) -> Result<Vec<u8>> {
    let mut pdf = Document::with_version("1.5");
    let pages_id = pdf.new_object_id();

    let mut fonts = lopdf::Dictionary::new();
    for font in Font::ALL {
        let id = pdf.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => font.base_font(),
            "Encoding" => "WinAnsiEncoding",
        });
        fonts.set(font.resource_name(), id);
    }
    let resources_id = pdf.add_object(dictionary! { "Font" => fonts });

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for operations in pages {
        let content = Content { operations };
        let content_id = pdf.add_object(Stream::new(dictionary! {}, content.encode()?));
        let page_id: ObjectId = pdf.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    pdf.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
        }),
    );

    let catalog_id = pdf.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    let info_id = pdf.add_object(dictionary! {
        "Title" => Object::String(encode_text(doc.title), StringFormat::Literal),
        "Author" => Object::String(encode_text(&doc.style.author), StringFormat::Literal),
        "Producer" => Object::String(b"Handout Desk".to_vec(), StringFormat::Literal),
    });
    pdf.trailer.set("Root", catalog_id);
    pdf.trailer.set("Info", info_id);
    pdf.compress();

    let mut out = Vec::new();
    pdf.save_to(&mut out)?;
    Ok(out)
}
