//! Handout export: PDF and HTML for one handout, ZIP of PDFs for a project.
//!
//! A PDF export records the artifact size and export time on the handout
//! and refreshes the owner's usage. The size update is never quota-gated.

use std::collections::HashSet;
use std::io::{Cursor, Write};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use handout_desk_core::error::validation;
use handout_desk_core::markup;
use handout_desk_core::models::{Handout, Section};
use handout_desk_core::service::ContentService;
use handout_desk_core::style::RenderStyle;

use crate::config::ExportConfig;
use crate::letters::Letters;
use crate::pdf::{self, PdfDocument};
use crate::projects::Projects;
use crate::render::{self, HtmlDocument};
use crate::sqlite_store::SqliteStore;

/// An export artifact with its download name.
pub struct Artifact {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Keep alphanumerics, space, `-` and `_`, then trim.
pub fn safe_filename(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn export_date(style: &RenderStyle) -> String {
    style
        .date
        .clone()
        .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string())
}

/// Render a handout to PDF bytes. `sections` must be in reading order.
pub fn handout_pdf(handout: &Handout, sections: &[Section]) -> Result<Vec<u8>> {
    let style = RenderStyle::from_value(&handout.style);
    pdf::render(&PdfDocument {
        title: &handout.title,
        subtitle: &handout.subtitle,
        date: export_date(&style),
        style: &style,
        sections,
    })
    .with_context(|| format!("Failed to render handout {}", handout.id))
}

/// Render a handout to a standalone HTML document with media links
/// rewritten to local files.
pub fn handout_html(
    handout: &Handout,
    sections: &[Section],
    export: &ExportConfig,
    stylesheet: &str,
) -> String {
    let style = RenderStyle::from_value(&handout.style);
    let html = render::render_html(&HtmlDocument {
        title: &handout.title,
        subtitle: &handout.subtitle,
        date: export_date(&style),
        style: &style,
        sections,
        stylesheet,
    });
    markup::rewrite_media_urls(
        &html,
        &export.media_url,
        &export.media_root.to_string_lossy(),
    )
}

#[derive(Clone)]
pub struct Exporter {
    content: ContentService<SqliteStore, Letters>,
    projects: Projects,
    config: ExportConfig,
}

impl Exporter {
    pub fn new(
        content: ContentService<SqliteStore, Letters>,
        projects: Projects,
        config: ExportConfig,
    ) -> Self {
        Self {
            content,
            projects,
            config,
        }
    }

    /// Render `handout` and record the export. No permission check; callers
    /// resolve ownership first.
    pub async fn pdf_for(&self, handout: &Handout) -> Result<Artifact> {
        let sections = self.content.outline(&handout.owner_id, &handout.id).await?;
        let bytes = handout_pdf(handout, &sections)?;
        self.content
            .record_export(handout, bytes.len() as u64)
            .await?;
        info!(handout = %handout.id, bytes = bytes.len(), "pdf exported");
        Ok(Artifact {
            filename: format!("{}.pdf", self.name_of(handout)),
            bytes,
        })
    }

    pub async fn export_pdf(&self, account_id: &str, handout_id: &str) -> Result<Artifact> {
        let handout = self.content.owned_handout(account_id, handout_id).await?;
        self.pdf_for(&handout).await
    }

    pub async fn export_html(&self, account_id: &str, handout_id: &str) -> Result<String> {
        let handout = self.content.owned_handout(account_id, handout_id).await?;
        let sections = self.content.outline(account_id, handout_id).await?;
        let stylesheet = render::load_stylesheet(self.config.stylesheet.as_deref());
        Ok(handout_html(&handout, &sections, &self.config, &stylesheet))
    }

    fn name_of(&self, handout: &Handout) -> String {
        let name = safe_filename(&handout.title);
        if name.is_empty() {
            handout.id.clone()
        } else {
            name
        }
    }

    /// Every handout of a project as `{title}.pdf` inside one ZIP. A handout
    /// that fails to render is logged and left out.
    pub async fn export_project_zip(&self, account_id: &str, project_id: &str) -> Result<Artifact> {
        let project = self.projects.get_owned(account_id, project_id).await?;
        let handouts = self
            .projects
            .list_handouts(account_id, Some(&project.id), None)
            .await?;
        if handouts.is_empty() {
            return Err(validation("This project has no handouts to export."));
        }

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut used: HashSet<String> = HashSet::new();
        let mut written = 0usize;

        for handout in &handouts {
            let artifact = match self.pdf_for(handout).await {
                Ok(a) => a,
                Err(e) => {
                    warn!(handout = %handout.id, error = %e, "skipping handout in project export");
                    continue;
                }
            };
            let mut name = artifact.filename.clone();
            let mut n = 2;
            while !used.insert(name.clone()) {
                name = format!("{} ({}).pdf", self.name_of(handout), n);
                n += 1;
            }
            writer.start_file(name, options)?;
            writer.write_all(&artifact.bytes)?;
            written += 1;
        }
        let bytes = writer.finish()?.into_inner();

        let base = match safe_filename(&project.name) {
            s if s.is_empty() => project.id.clone(),
            s => s,
        };
        let filename = format!("{}_{}.zip", base, Utc::now().format("%Y%m%d%H%M"));
        info!(project = %project.id, handouts = written, "project exported");
        Ok(Artifact { filename, bytes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handout(style: serde_json::Value) -> Handout {
        Handout {
            id: "h1".into(),
            project_id: "p1".into(),
            owner_id: "a1".into(),
            folder_id: None,
            title: "Week 1: Basics!".into(),
            subtitle: String::new(),
            description: String::new(),
            style,
            is_published: false,
            file_size: None,
            last_exported_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_safe_filename() {
        assert_eq!(safe_filename("Week 1: Basics!"), "Week 1 Basics");
        assert_eq!(safe_filename("  a/b\\c  "), "abc");
        assert_eq!(safe_filename("講義 一"), "講義 一");
        assert_eq!(safe_filename("???"), "");
    }

    #[test]
    fn test_html_rewrites_media_and_uses_style_date() {
        let h = handout(json!({"date": "2026-02-02"}));
        let sections = vec![Section {
            id: "s1".into(),
            handout_id: "h1".into(),
            parent_id: None,
            level: handout_desk_core::models::SectionLevel::Top,
            title: "Pictures".into(),
            content: "![x](/media/img/a.png)".into(),
            order: 1,
            created_at: 0,
            updated_at: 0,
        }];
        let config = ExportConfig {
            stylesheet: None,
            media_url: "/media/".into(),
            media_root: "/srv/media".into(),
            ..ExportConfig::default()
        };
        let html = handout_html(&h, &sections, &config, "");
        assert!(html.contains("src=\"file:///srv/media/img/a.png\""));
        assert!(html.contains("2026-02-02"));
    }

    #[test]
    fn test_pdf_ignores_malformed_style() {
        let h = handout(json!({"theme": 42, "language": "klingon"}));
        let bytes = handout_pdf(&h, &[]).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }
}
