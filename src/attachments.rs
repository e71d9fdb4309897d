//! Uploaded files (images, documents) owned by an account.
//!
//! Files live under `{media_root}/attachments/user_{owner}/` and are served
//! from `media_url`. An upload must fit entirely within the owner's
//! remaining quota; attachments are not added to the usage counter.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use handout_desk_core::error::{not_found, permission_denied, validation};
use handout_desk_core::markup::percent_encode;
use handout_desk_core::quota;
use handout_desk_core::service::ContentService;

use crate::config::ExportConfig;
use crate::letters::Letters;
use crate::sqlite_store::SqliteStore;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
const FILE_NAME_MAX: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub id: String,
    pub owner_id: String,
    pub file_name: String,
    /// Relative to the media root.
    pub path: String,
    pub file_url: String,
    pub caption: String,
    pub alt_text: String,
    pub file_size: u64,
    pub mime_type: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewAttachment {
    pub file_name: String,
    pub caption: String,
    pub alt_text: String,
    pub mime_type: Option<String>,
}

/// Last path component of a client-supplied name, without control
/// characters. `None` when nothing usable remains.
pub fn clean_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or_default();
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        return None;
    }
    Some(cleaned.chars().take(FILE_NAME_MAX).collect())
}

#[derive(Clone)]
pub struct Attachments {
    pool: SqlitePool,
    content: ContentService<SqliteStore, Letters>,
    config: ExportConfig,
}

impl Attachments {
    pub fn new(
        pool: SqlitePool,
        content: ContentService<SqliteStore, Letters>,
        config: ExportConfig,
    ) -> Self {
        Self {
            pool,
            content,
            config,
        }
    }

    fn from_row(&self, row: &SqliteRow) -> Attachment {
        let path: String = row.get("path");
        Attachment {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            file_name: row.get("file_name"),
            file_url: format!("{}{}", self.config.media_url, percent_encode(&path)),
            path,
            caption: row.get("caption"),
            alt_text: row.get("alt_text"),
            file_size: row.get::<i64, _>("file_size").max(0) as u64,
            mime_type: row.get("mime_type"),
            created_at: row.get("created_at"),
        }
    }

    fn disk_path(&self, relative: &str) -> PathBuf {
        self.config.media_root.join(relative)
    }

    /// Store `bytes` for `owner_id` once the quota allows the whole file.
    pub async fn upload(&self, owner_id: &str, new: NewAttachment, bytes: &[u8]) -> Result<Attachment> {
        let file_name = clean_file_name(&new.file_name)
            .ok_or_else(|| validation("A file name is required."))?;
        if bytes.is_empty() {
            return Err(validation("The uploaded file is empty."));
        }
        let size = bytes.len() as u64;
        let report = self.content.usage_report(owner_id).await?;
        quota::check_upload(report.usage, report.limit, size)?;

        let id = Uuid::new_v4().to_string();
        let relative = format!("attachments/user_{}/{}-{}", owner_id, id, file_name);
        let target = self.disk_path(&relative);
        if let Some(dir) = target.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;

        let mime_type = new
            .mime_type
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());
        let now = Utc::now().timestamp();
        let inserted = sqlx::query(
            "INSERT INTO attachments (id, owner_id, file_name, path, caption, alt_text, file_size, mime_type, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(owner_id)
        .bind(&file_name)
        .bind(&relative)
        .bind(&new.caption)
        .bind(&new.alt_text)
        .bind(size as i64)
        .bind(&mime_type)
        .bind(now)
        .execute(&self.pool)
        .await;
        if let Err(e) = inserted {
            if let Err(io) = tokio::fs::remove_file(&target).await {
                warn!(path = %target.display(), error = %io, "orphaned attachment file");
            }
            return Err(e.into());
        }

        info!(attachment = %id, owner = %owner_id, size, "attachment uploaded");
        Ok(Attachment {
            id,
            owner_id: owner_id.to_string(),
            file_name,
            file_url: format!("{}{}", self.config.media_url, percent_encode(&relative)),
            path: relative,
            caption: new.caption,
            alt_text: new.alt_text,
            file_size: size,
            mime_type,
            created_at: now,
        })
    }

    /// The owner's attachments, newest first.
    pub async fn list(&self, owner_id: &str) -> Result<Vec<Attachment>> {
        let rows = sqlx::query(
            "SELECT id, owner_id, file_name, path, caption, alt_text, file_size, mime_type, created_at \
             FROM attachments WHERE owner_id = ? ORDER BY created_at DESC, id",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| self.from_row(row)).collect())
    }

    pub async fn get_owned(&self, owner_id: &str, id: &str) -> Result<Attachment> {
        let row = sqlx::query(
            "SELECT id, owner_id, file_name, path, caption, alt_text, file_size, mime_type, created_at \
             FROM attachments WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| not_found("Attachment", id))?;
        let attachment = self.from_row(&row);
        if attachment.owner_id != owner_id {
            return Err(permission_denied(
                "You do not have permission to access this attachment.",
            ));
        }
        Ok(attachment)
    }

    /// Remove the record, then the file. A file already gone is logged.
    pub async fn delete(&self, owner_id: &str, id: &str) -> Result<()> {
        let attachment = self.get_owned(owner_id, id).await?;
        sqlx::query("DELETE FROM attachments WHERE id = ?")
            .bind(&attachment.id)
            .execute(&self.pool)
            .await?;
        let target = self.disk_path(&attachment.path);
        if let Err(e) = tokio::fs::remove_file(&target).await {
            warn!(path = %target.display(), error = %e, "attachment file not removed");
        }
        info!(attachment = %id, owner = %owner_id, "attachment deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_file_name() {
        assert_eq!(clean_file_name("photo.png").as_deref(), Some("photo.png"));
        assert_eq!(clean_file_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(clean_file_name("C:\\docs\\notes.txt").as_deref(), Some("notes.txt"));
        assert_eq!(clean_file_name(" a\u{0}b.txt ").as_deref(), Some("ab.txt"));
        assert_eq!(clean_file_name("dir/"), None);
        assert_eq!(clean_file_name(".."), None);
        assert_eq!(clean_file_name(""), None);
        assert_eq!(clean_file_name(&"x".repeat(300)).map(|n| n.len()), Some(255));
    }
}
