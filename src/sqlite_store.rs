//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the schema created by
//! [`crate::migrate`]. Row mappers are shared with the account and project
//! modules, which issue their own queries against the same tables.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use handout_desk_core::hierarchy;
use handout_desk_core::models::{
    Account, Folder, Handout, Project, ReorderEntry, Role, Section, SectionLevel, UsageBreakdown,
};
use handout_desk_core::notify::WarningLevel;
use handout_desk_core::quota::Tier;
use handout_desk_core::store::Store;

/// SQLite implementation of the [`Store`] trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) const ACCOUNT_COLUMNS: &str = "id, username, email, first_name, last_name, role, tier, \
     language, is_active, is_verified, current_storage_usage, last_storage_warning_level, \
     created_at, updated_at";

pub(crate) const HANDOUT_SELECT: &str = "SELECT h.id, h.project_id, p.owner_id, h.folder_id, \
     h.title, h.subtitle, h.description, h.style_json, h.is_published, h.file_size, \
     h.last_exported_at, h.created_at, h.updated_at \
     FROM handouts h JOIN projects p ON p.id = h.project_id";

const SECTION_COLUMNS: &str =
    "id, handout_id, parent_id, level, title, content, sort_order, created_at, updated_at";

pub(crate) fn account_from_row(row: &SqliteRow) -> Account {
    let role: String = row.get("role");
    let tier: String = row.get("tier");
    let usage: i64 = row.get("current_storage_usage");
    let level: i64 = row.get("last_storage_warning_level");
    Account {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        role: Role::parse(&role),
        tier: Tier::parse(&tier),
        language: row.get("language"),
        is_active: row.get("is_active"),
        is_verified: row.get("is_verified"),
        current_storage_usage: usage.max(0) as u64,
        last_storage_warning_level: WarningLevel::from_percent(level),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub(crate) fn project_from_row(row: &SqliteRow) -> Project {
    Project {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        description: row.get("description"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub(crate) fn folder_from_row(row: &SqliteRow) -> Folder {
    Folder {
        id: row.get("id"),
        project_id: row.get("project_id"),
        parent_id: row.get("parent_id"),
        name: row.get("name"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub(crate) fn handout_from_row(row: &SqliteRow) -> Handout {
    let style_json: String = row.get("style_json");
    let file_size: Option<i64> = row.get("file_size");
    Handout {
        id: row.get("id"),
        project_id: row.get("project_id"),
        owner_id: row.get("owner_id"),
        folder_id: row.get("folder_id"),
        title: row.get("title"),
        subtitle: row.get("subtitle"),
        description: row.get("description"),
        style: serde_json::from_str(&style_json).unwrap_or_else(|_| serde_json::json!({})),
        is_published: row.get("is_published"),
        file_size: file_size.map(|s| s.max(0) as u64),
        last_exported_at: row.get("last_exported_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn section_from_row(row: &SqliteRow) -> Section {
    let level: String = row.get("level");
    Section {
        id: row.get("id"),
        handout_id: row.get("handout_id"),
        parent_id: row.get("parent_id"),
        level: SectionLevel::parse(&level).unwrap_or(SectionLevel::Leaf),
        title: row.get("title"),
        content: row.get("content"),
        order: row.get("sort_order"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM accounts WHERE id = ?",
            ACCOUNT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(account_from_row))
    }

    async fn usage_breakdown(&self, account_id: &str) -> Result<UsageBreakdown> {
        let document_bytes: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(h.file_size), 0)
            FROM handouts h JOIN projects p ON p.id = h.project_id
            WHERE p.owner_id = ?
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;

        let section_chars: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(LENGTH(s.content)), 0)
            FROM sections s
            JOIN handouts h ON h.id = s.handout_id
            JOIN projects p ON p.id = h.project_id
            WHERE p.owner_id = ?
            "#,
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(UsageBreakdown {
            document_bytes: document_bytes.max(0) as u64,
            section_chars: section_chars.max(0) as u64,
        })
    }

    async fn set_storage_usage(&self, account_id: &str, usage: u64) -> Result<()> {
        sqlx::query("UPDATE accounts SET current_storage_usage = ? WHERE id = ?")
            .bind(usage as i64)
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_warning_level(&self, account_id: &str, level: WarningLevel) -> Result<()> {
        sqlx::query("UPDATE accounts SET last_storage_warning_level = ? WHERE id = ?")
            .bind(level.percent())
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let row = sqlx::query(
            "SELECT id, owner_id, name, description, created_at, updated_at FROM projects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(project_from_row))
    }

    async fn get_folder(&self, id: &str) -> Result<Option<Folder>> {
        let row = sqlx::query(
            "SELECT id, project_id, parent_id, name, created_at, updated_at FROM folders WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(folder_from_row))
    }

    async fn insert_handout(&self, handout: &Handout) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO handouts (id, project_id, folder_id, title, subtitle, description,
                                  style_json, is_published, file_size, last_exported_at,
                                  created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&handout.id)
        .bind(&handout.project_id)
        .bind(&handout.folder_id)
        .bind(&handout.title)
        .bind(&handout.subtitle)
        .bind(&handout.description)
        .bind(handout.style.to_string())
        .bind(handout.is_published)
        .bind(handout.file_size.map(|s| s as i64))
        .bind(handout.last_exported_at)
        .bind(handout.created_at)
        .bind(handout.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_handout(&self, id: &str) -> Result<Option<Handout>> {
        let row = sqlx::query(&format!("{} WHERE h.id = ?", HANDOUT_SELECT))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(handout_from_row))
    }

    async fn update_handout(&self, handout: &Handout) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE handouts SET folder_id = ?, title = ?, subtitle = ?, description = ?,
                                style_json = ?, is_published = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&handout.folder_id)
        .bind(&handout.title)
        .bind(&handout.subtitle)
        .bind(&handout.description)
        .bind(handout.style.to_string())
        .bind(handout.is_published)
        .bind(handout.updated_at)
        .bind(&handout.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_handout(&self, id: &str) -> Result<()> {
        // sections cascade
        sqlx::query("DELETE FROM handouts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_export(&self, handout_id: &str, size: u64, at: i64) -> Result<()> {
        sqlx::query("UPDATE handouts SET file_size = ?, last_exported_at = ? WHERE id = ?")
            .bind(size as i64)
            .bind(at)
            .bind(handout_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_section(&self, id: &str) -> Result<Option<Section>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sections WHERE id = ?",
            SECTION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(section_from_row))
    }

    async fn list_sections(&self, handout_id: &str) -> Result<Vec<Section>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sections WHERE handout_id = ?",
            SECTION_COLUMNS
        ))
        .bind(handout_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(section_from_row).collect())
    }

    async fn insert_section(&self, mut section: Section, order: Option<i64>) -> Result<Section> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        section.order = match order {
            Some(o) => {
                let taken: Option<i64> = sqlx::query_scalar(
                    "SELECT 1 FROM sections WHERE handout_id = ? AND parent_id IS ? AND sort_order = ?",
                )
                .bind(&section.handout_id)
                .bind(&section.parent_id)
                .bind(o)
                .fetch_optional(&mut *tx)
                .await?;
                if taken.is_some() {
                    return Err(hierarchy::order_taken(o));
                }
                o
            }
            None => {
                let max: Option<i64> = sqlx::query_scalar(
                    "SELECT MAX(sort_order) FROM sections WHERE handout_id = ? AND parent_id IS ?",
                )
                .bind(&section.handout_id)
                .bind(&section.parent_id)
                .fetch_one(&mut *tx)
                .await?;
                hierarchy::next_order(max)
            }
        };

        sqlx::query(
            r#"
            INSERT INTO sections (id, handout_id, parent_id, level, title, content,
                                  sort_order, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&section.id)
        .bind(&section.handout_id)
        .bind(&section.parent_id)
        .bind(section.level.as_str())
        .bind(&section.title)
        .bind(&section.content)
        .bind(section.order)
        .bind(section.created_at)
        .bind(section.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(section)
    }

    async fn update_section(&self, section: &Section) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE sections SET parent_id = ?, level = ?, title = ?, content = ?,
                                sort_order = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&section.parent_id)
        .bind(section.level.as_str())
        .bind(&section.title)
        .bind(&section.content)
        .bind(section.order)
        .bind(section.updated_at)
        .bind(&section.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_section(&self, id: &str) -> Result<()> {
        sqlx::query(
            r#"
            WITH RECURSIVE subtree(id) AS (
                SELECT ?
                UNION ALL
                SELECT s.id FROM sections s JOIN subtree t ON s.parent_id = t.id
            )
            DELETE FROM sections WHERE id IN (SELECT id FROM subtree)
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reorder_sections(
        &self,
        handout_id: &str,
        entries: &[ReorderEntry],
    ) -> Result<Vec<Section>> {
        // IMMEDIATE takes the write lock up front, so concurrent batches queue
        // on the busy timeout and each plans against committed state.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM sections WHERE handout_id = ?",
            SECTION_COLUMNS
        ))
        .bind(handout_id)
        .fetch_all(&mut *tx)
        .await?;
        let current: Vec<Section> = rows.iter().map(section_from_row).collect();
        let local: HashSet<&str> = current.iter().map(|s| s.id.as_str()).collect();

        let mut foreign = std::collections::HashMap::new();
        for parent_id in entries.iter().filter_map(|e| e.parent_id.as_deref()) {
            if local.contains(parent_id) || foreign.contains_key(parent_id) {
                continue;
            }
            let owner: Option<String> =
                sqlx::query_scalar("SELECT handout_id FROM sections WHERE id = ?")
                    .bind(parent_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if let Some(owner) = owner {
                foreign.insert(parent_id.to_string(), owner);
            }
        }

        // dropping `tx` on error rolls back
        let changed = hierarchy::plan_reorder(
            handout_id,
            &current,
            entries,
            &foreign,
            Utc::now().timestamp(),
        )?;

        // Park moved rows on negative orders first so swaps never trip the
        // sibling-order unique index halfway through.
        for (i, s) in changed.iter().enumerate() {
            sqlx::query("UPDATE sections SET sort_order = ? WHERE id = ?")
                .bind(-(i as i64) - 1)
                .bind(&s.id)
                .execute(&mut *tx)
                .await?;
        }
        for s in &changed {
            sqlx::query(
                "UPDATE sections SET parent_id = ?, level = ?, sort_order = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&s.parent_id)
            .bind(s.level.as_str())
            .bind(s.order)
            .bind(s.updated_at)
            .bind(&s.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(changed)
    }
}
