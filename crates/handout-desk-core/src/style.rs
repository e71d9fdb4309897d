//! Render style configuration for handout exports.
//!
//! Handouts store their style as free-form JSON. [`RenderStyle::from_value`]
//! reads the recognised keys one by one; a missing, unknown or malformed
//! value takes that key's default instead of failing the export.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::SectionLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    ModernBlue,
    #[default]
    NordicDark,
    Academic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FontStyle {
    #[default]
    Sans,
    Serif,
}

impl FontStyle {
    pub fn css_family(&self) -> &'static str {
        match self {
            FontStyle::Sans => "'Montserrat', 'NotoSansTC', 'NotoSansThai', sans-serif",
            FontStyle::Serif => "'NotoSerifTC', 'Sarabun', 'NotoSansThai', serif",
        }
    }

    /// Standard PDF base font used by the text layout.
    pub fn pdf_base_font(&self) -> &'static str {
        match self {
            FontStyle::Sans => "Helvetica",
            FontStyle::Serif => "Times-Roman",
        }
    }

    pub fn pdf_bold_font(&self) -> &'static str {
        match self {
            FontStyle::Sans => "Helvetica-Bold",
            FontStyle::Serif => "Times-Bold",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IndentMode {
    #[default]
    None,
    /// Indent the first line of each paragraph.
    FirstLine,
    /// Indent body text by section depth.
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Language {
    #[default]
    #[serde(rename = "en")]
    En,
    #[serde(rename = "zh_TW")]
    ZhTw,
    #[serde(rename = "zh_CN")]
    ZhCn,
    #[serde(rename = "th")]
    Th,
}

/// Localized fixed strings of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LanguageStrings {
    pub toc_title: &'static str,
    /// Prefix and suffix around the page number in footers.
    pub page_prefix: &'static str,
    pub page_suffix: &'static str,
    pub fig_label: &'static str,
}

impl Language {
    pub fn strings(&self) -> LanguageStrings {
        match self {
            Language::En => LanguageStrings {
                toc_title: "Table of Contents",
                page_prefix: "Page ",
                page_suffix: "",
                fig_label: "Figure",
            },
            Language::ZhTw => LanguageStrings {
                toc_title: "目錄",
                page_prefix: "第 ",
                page_suffix: " 頁",
                fig_label: "圖",
            },
            Language::ZhCn => LanguageStrings {
                toc_title: "目录",
                page_prefix: "第 ",
                page_suffix: " 页",
                fig_label: "图",
            },
            Language::Th => LanguageStrings {
                toc_title: "สารบัญ",
                page_prefix: "หน้า ",
                page_suffix: "",
                fig_label: "รูปที่",
            },
        }
    }

    pub fn page_label(&self, page: usize) -> String {
        let s = self.strings();
        format!("{}{}{}", s.page_prefix, page, s.page_suffix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PageNumberPos {
    #[default]
    BottomRight,
    BottomCenter,
    BottomLeft,
    TopRight,
}

impl PageNumberPos {
    pub fn css_area(&self) -> &'static str {
        match self {
            PageNumberPos::BottomRight => "bottom-right",
            PageNumberPos::BottomCenter => "bottom-center",
            PageNumberPos::BottomLeft => "bottom-left",
            PageNumberPos::TopRight => "top-right",
        }
    }
}

/// Heading slots that typography applies to. `H1` is the handout title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Heading {
    H1,
    H2,
    H3,
    H4,
}

impl Heading {
    pub const ALL: [Heading; 4] = [Heading::H1, Heading::H2, Heading::H3, Heading::H4];

    pub fn for_level(level: SectionLevel) -> Self {
        match level {
            SectionLevel::Top => Heading::H2,
            SectionLevel::Mid => Heading::H3,
            SectionLevel::Leaf => Heading::H4,
        }
    }

    fn index(&self) -> usize {
        match self {
            Heading::H1 => 0,
            Heading::H2 => 1,
            Heading::H3 => 2,
            Heading::H4 => 3,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Heading::H1 => "h1",
            Heading::H2 => "h2",
            Heading::H3 => "h3",
            Heading::H4 => "h4",
        }
    }
}

impl Theme {
    /// Default heading colors, h1 through h4.
    pub fn heading_colors(&self) -> [&'static str; 4] {
        match self {
            Theme::ModernBlue => ["#1e3a8a", "#3b82f6", "#2563eb", "#1e40af"],
            Theme::NordicDark => ["#2e3440", "#3b4252", "#434c5e", "#4c566a"],
            Theme::Academic => ["#1a1a1a", "#1a1a1a", "#4a4a4a", "#4a4a4a"],
        }
    }
}

/// Per-heading override inside `typography`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypographyOverride {
    pub color: Option<String>,
    pub font: Option<FontStyle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderStyle {
    pub theme: Theme,
    pub font_style: FontStyle,
    pub use_custom_typography: bool,
    pub typography: BTreeMap<Heading, TypographyOverride>,
    pub indent_mode: IndentMode,
    pub language: Language,
    pub page_number_pos: PageNumberPos,
    pub author: String,
    pub institution: String,
    /// `None` means the export date.
    pub date: Option<String>,
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            theme: Theme::default(),
            font_style: FontStyle::default(),
            use_custom_typography: false,
            typography: BTreeMap::new(),
            indent_mode: IndentMode::default(),
            language: Language::default(),
            page_number_pos: PageNumberPos::default(),
            author: String::new(),
            institution: String::new(),
            date: None,
        }
    }
}

fn key<T: DeserializeOwned>(obj: &serde_json::Map<String, Value>, name: &str) -> Option<T> {
    obj.get(name)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

fn is_hex_color(s: &str) -> bool {
    let digits = s.strip_prefix('#').unwrap_or("");
    matches!(digits.len(), 3 | 6) && digits.chars().all(|c| c.is_ascii_hexdigit())
}

impl RenderStyle {
    /// Read a stored style. A JSON string holding an object is accepted too.
    pub fn from_value(value: &Value) -> Self {
        let parsed;
        let value = match value {
            Value::String(s) => {
                parsed = serde_json::from_str::<Value>(s).unwrap_or(Value::Null);
                &parsed
            }
            other => other,
        };
        let Some(obj) = value.as_object() else {
            return Self::default();
        };

        let mut typography = BTreeMap::new();
        if let Some(raw) = obj.get("typography").and_then(Value::as_object) {
            for heading in Heading::ALL {
                let Some(entry) = raw.get(heading.tag()).and_then(Value::as_object) else {
                    continue;
                };
                let color = entry
                    .get("color")
                    .and_then(Value::as_str)
                    .filter(|c| is_hex_color(c))
                    .map(str::to_string);
                let font = key::<FontStyle>(entry, "font");
                typography.insert(heading, TypographyOverride { color, font });
            }
        }

        Self {
            theme: key(obj, "theme").unwrap_or_default(),
            font_style: key(obj, "font_style").unwrap_or_default(),
            use_custom_typography: key(obj, "use_custom_typography").unwrap_or(false),
            typography,
            indent_mode: key(obj, "indent_mode").unwrap_or_default(),
            language: key(obj, "language").unwrap_or_default(),
            page_number_pos: key(obj, "page_number_pos").unwrap_or_default(),
            author: key(obj, "author").unwrap_or_default(),
            institution: key(obj, "institution").unwrap_or_default(),
            date: key::<String>(obj, "date").filter(|d| !d.is_empty()),
        }
    }

    /// Effective color and font for every heading slot.
    pub fn resolve_typography(&self) -> ResolvedTypography {
        let colors = self.theme.heading_colors();
        let levels = Heading::ALL.map(|heading| {
            let default = HeadingStyle {
                color: colors[heading.index()].to_string(),
                font: self.font_style,
            };
            if !self.use_custom_typography {
                return default;
            }
            match self.typography.get(&heading) {
                Some(o) => HeadingStyle {
                    color: o.color.clone().unwrap_or(default.color),
                    font: o.font.unwrap_or(self.font_style),
                },
                None => default,
            }
        });
        ResolvedTypography { levels }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadingStyle {
    pub color: String,
    pub font: FontStyle,
}

impl HeadingStyle {
    /// Color as RGB components in `0.0..=1.0`.
    pub fn rgb(&self) -> (f32, f32, f32) {
        parse_hex_color(&self.color).unwrap_or((0.0, 0.0, 0.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTypography {
    levels: [HeadingStyle; 4],
}

impl ResolvedTypography {
    pub fn get(&self, heading: Heading) -> &HeadingStyle {
        &self.levels[heading.index()]
    }
}

/// `#rgb` or `#rrggbb` to RGB components in `0.0..=1.0`.
pub fn parse_hex_color(s: &str) -> Option<(f32, f32, f32)> {
    if !is_hex_color(s) {
        return None;
    }
    let digits = &s[1..];
    let expand = |i: usize, width: usize| -> Option<f32> {
        let part = &digits[i * width..(i + 1) * width];
        let v = u8::from_str_radix(part, 16).ok()?;
        let v = if width == 1 { v * 17 } else { v };
        Some(v as f32 / 255.0)
    };
    let width = digits.len() / 3;
    Some((expand(0, width)?, expand(1, width)?, expand(2, width)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_for_empty_config() {
        let style = RenderStyle::from_value(&json!({}));
        assert_eq!(style, RenderStyle::default());
        assert_eq!(style.theme, Theme::NordicDark);
        assert_eq!(style.page_number_pos, PageNumberPos::BottomRight);
        assert_eq!(RenderStyle::from_value(&json!([1, 2])), RenderStyle::default());
    }

    #[test]
    fn test_unknown_values_fall_back() {
        let style = RenderStyle::from_value(&json!({
            "theme": "solarized",
            "font_style": "serif",
            "indent_mode": 3,
            "language": "zh_TW",
        }));
        assert_eq!(style.theme, Theme::NordicDark);
        assert_eq!(style.font_style, FontStyle::Serif);
        assert_eq!(style.indent_mode, IndentMode::None);
        assert_eq!(style.language, Language::ZhTw);
    }

    #[test]
    fn test_string_config_is_parsed() {
        let style = RenderStyle::from_value(&json!("{\"theme\": \"academic\"}"));
        assert_eq!(style.theme, Theme::Academic);
        assert_eq!(RenderStyle::from_value(&json!("not json")), RenderStyle::default());
    }

    #[test]
    fn test_typography_ignored_unless_enabled() {
        let cfg = json!({
            "theme": "modern_blue",
            "typography": {"h2": {"color": "#ff0000", "font": "serif"}},
        });
        let off = RenderStyle::from_value(&cfg).resolve_typography();
        assert_eq!(off.get(Heading::H2).color, "#3b82f6");
        assert_eq!(off.get(Heading::H2).font, FontStyle::Sans);

        let mut on_cfg = cfg.clone();
        on_cfg["use_custom_typography"] = json!(true);
        let on = RenderStyle::from_value(&on_cfg).resolve_typography();
        assert_eq!(on.get(Heading::H2).color, "#ff0000");
        assert_eq!(on.get(Heading::H2).font, FontStyle::Serif);
        // untouched slot keeps theme default
        assert_eq!(on.get(Heading::H3).color, "#2563eb");
    }

    #[test]
    fn test_bad_override_color_uses_theme() {
        let style = RenderStyle::from_value(&json!({
            "use_custom_typography": true,
            "typography": {"h1": {"color": "red"}},
        }));
        let t = style.resolve_typography();
        assert_eq!(t.get(Heading::H1).color, "#2e3440");
    }

    #[test]
    fn test_parse_hex_color() {
        assert_eq!(parse_hex_color("#ffffff"), Some((1.0, 1.0, 1.0)));
        assert_eq!(parse_hex_color("#f00"), Some((1.0, 0.0, 0.0)));
        assert_eq!(parse_hex_color("ff0000"), None);
    }

    #[test]
    fn test_page_label() {
        assert_eq!(Language::En.page_label(3), "Page 3");
        assert_eq!(Language::ZhTw.page_label(3), "第 3 頁");
    }
}
