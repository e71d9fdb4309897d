//! Projects and folders: the ownership containers for handouts.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::info;
use uuid::Uuid;

use handout_desk_core::error::{not_found, permission_denied, validation};
use handout_desk_core::models::{Folder, Handout, Project};

use crate::sqlite_store::{folder_from_row, handout_from_row, project_from_row, HANDOUT_SELECT};

pub const DEFAULT_TAG_COLOR: &str = "#88C0D0";
const TAG_NAME_MAX: usize = 50;

#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Tags to attach; every id must name one of the owner's tags.
    #[serde(default)]
    pub tag_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Replaces the project's tag set when present.
    pub tag_ids: Option<Vec<String>>,
}

/// An owner-scoped label for grouping projects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tag {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub color: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTag {
    pub name: String,
    #[serde(default = "default_tag_color")]
    pub color: String,
}

fn default_tag_color() -> String {
    DEFAULT_TAG_COLOR.to_string()
}

/// `#RRGGBB`, hex digits in either case.
pub fn is_hex_color(color: &str) -> bool {
    color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Clone, Serialize)]
pub struct TaggedProject {
    #[serde(flatten)]
    pub project: Project,
    pub tags: Vec<Tag>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFolder {
    pub project_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FolderNode {
    #[serde(flatten)]
    pub folder: Folder,
    pub children: Vec<FolderNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectDetail {
    #[serde(flatten)]
    pub project: Project,
    pub tags: Vec<Tag>,
    pub folders: Vec<FolderNode>,
    pub handout_count: i64,
}

/// Nest folders under their parents, siblings sorted by name.
pub fn folder_tree(folders: Vec<Folder>) -> Vec<FolderNode> {
    let mut by_parent: HashMap<Option<String>, Vec<Folder>> = HashMap::new();
    for f in folders {
        by_parent.entry(f.parent_id.clone()).or_default().push(f);
    }
    for siblings in by_parent.values_mut() {
        siblings.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    }

    fn attach(
        parent: Option<String>,
        by_parent: &mut HashMap<Option<String>, Vec<Folder>>,
    ) -> Vec<FolderNode> {
        let folders = by_parent.remove(&parent).unwrap_or_default();
        folders
            .into_iter()
            .map(|folder| {
                let children = attach(Some(folder.id.clone()), by_parent);
                FolderNode { folder, children }
            })
            .collect()
    }

    attach(None, &mut by_parent)
}

fn tag_from_row(row: &SqliteRow) -> Tag {
    Tag {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        color: row.get("color"),
        created_at: row.get("created_at"),
    }
}

async fn link_tags(
    tx: &mut Transaction<'_, Sqlite>,
    project_id: &str,
    tag_ids: &[String],
) -> Result<()> {
    for tag_id in tag_ids {
        sqlx::query("INSERT INTO project_tag_links (project_id, tag_id) VALUES (?, ?)")
            .bind(project_id)
            .bind(tag_id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct Projects {
    pool: SqlitePool,
}

impl Projects {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, owner_id: &str, new: NewProject) -> Result<Project> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(validation("Project name is required."));
        }
        let tag_ids = self.owned_tag_ids(owner_id, &new.tag_ids).await?;
        let now = Utc::now().timestamp();
        let project = Project {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            description: new.description,
            created_at: now,
            updated_at: now,
        };
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO projects (id, owner_id, name, description, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&project.id)
        .bind(&project.owner_id)
        .bind(&project.name)
        .bind(&project.description)
        .bind(project.created_at)
        .bind(project.updated_at)
        .execute(&mut *tx)
        .await?;
        link_tags(&mut tx, &project.id, &tag_ids).await?;
        tx.commit().await?;
        Ok(project)
    }

    /// The owner's projects, newest first, each with its tags.
    pub async fn list(&self, owner_id: &str) -> Result<Vec<TaggedProject>> {
        let rows = sqlx::query(
            "SELECT id, owner_id, name, description, created_at, updated_at FROM projects \
             WHERE owner_id = ? ORDER BY created_at DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let tag_rows = sqlx::query(
            "SELECT l.project_id, t.id, t.owner_id, t.name, t.color, t.created_at \
             FROM project_tag_links l JOIN project_tags t ON t.id = l.tag_id \
             WHERE t.owner_id = ? ORDER BY t.name",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        let mut tags_by_project: HashMap<String, Vec<Tag>> = HashMap::new();
        for row in &tag_rows {
            tags_by_project
                .entry(row.get("project_id"))
                .or_default()
                .push(tag_from_row(row));
        }

        Ok(rows
            .iter()
            .map(project_from_row)
            .map(|project| {
                let tags = tags_by_project.remove(&project.id).unwrap_or_default();
                TaggedProject { project, tags }
            })
            .collect())
    }

    pub async fn update(&self, owner_id: &str, id: &str, patch: ProjectPatch) -> Result<TaggedProject> {
        let mut project = self.get_owned(owner_id, id).await?;
        if let Some(name) = patch.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(validation("Project name is required."));
            }
            project.name = name.to_string();
        }
        if let Some(description) = patch.description {
            project.description = description;
        }
        let tag_ids = match &patch.tag_ids {
            Some(ids) => Some(self.owned_tag_ids(owner_id, ids).await?),
            None => None,
        };
        project.updated_at = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE projects SET name = ?, description = ?, updated_at = ? WHERE id = ?")
            .bind(&project.name)
            .bind(&project.description)
            .bind(project.updated_at)
            .bind(&project.id)
            .execute(&mut *tx)
            .await?;
        if let Some(tag_ids) = tag_ids {
            sqlx::query("DELETE FROM project_tag_links WHERE project_id = ?")
                .bind(&project.id)
                .execute(&mut *tx)
                .await?;
            link_tags(&mut tx, &project.id, &tag_ids).await?;
        }
        tx.commit().await?;

        let tags = self.tags_of(&project.id).await?;
        Ok(TaggedProject { project, tags })
    }

    pub async fn tags_of(&self, project_id: &str) -> Result<Vec<Tag>> {
        let rows = sqlx::query(
            "SELECT t.id, t.owner_id, t.name, t.color, t.created_at \
             FROM project_tag_links l JOIN project_tags t ON t.id = l.tag_id \
             WHERE l.project_id = ? ORDER BY t.name",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(tag_from_row).collect())
    }

    /// Deduplicated `ids`, failing unless every one is a tag of `owner_id`.
    async fn owned_tag_ids(&self, owner_id: &str, ids: &[String]) -> Result<Vec<String>> {
        let mut unique: Vec<String> = ids.to_vec();
        unique.sort();
        unique.dedup();
        for id in &unique {
            let owner: Option<String> =
                sqlx::query_scalar("SELECT owner_id FROM project_tags WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
            if owner.as_deref() != Some(owner_id) {
                return Err(validation("One or more tags do not belong to you."));
            }
        }
        Ok(unique)
    }

    pub async fn create_tag(&self, owner_id: &str, new: NewTag) -> Result<Tag> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(validation("Tag name is required."));
        }
        if name.chars().count() > TAG_NAME_MAX {
            return Err(validation(format!(
                "Tag name must be at most {} characters.",
                TAG_NAME_MAX
            )));
        }
        if !is_hex_color(&new.color) {
            return Err(validation("Tag color must look like #RRGGBB."));
        }
        let tag = Tag {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            color: new.color,
            created_at: Utc::now().timestamp(),
        };
        let inserted = sqlx::query(
            "INSERT INTO project_tags (id, owner_id, name, color, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&tag.id)
        .bind(&tag.owner_id)
        .bind(&tag.name)
        .bind(&tag.color)
        .bind(tag.created_at)
        .execute(&self.pool)
        .await;
        match inserted {
            Ok(_) => Ok(tag),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(validation(format!(
                "You already have a tag named '{}'.",
                tag.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_tags(&self, owner_id: &str) -> Result<Vec<Tag>> {
        let rows = sqlx::query(
            "SELECT id, owner_id, name, color, created_at FROM project_tags \
             WHERE owner_id = ? ORDER BY name",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(tag_from_row).collect())
    }

    /// Delete a tag; projects keep existing without it.
    pub async fn delete_tag(&self, owner_id: &str, id: &str) -> Result<()> {
        let owner: Option<String> =
            sqlx::query_scalar("SELECT owner_id FROM project_tags WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match owner {
            None => Err(not_found("Tag", id)),
            Some(owner) if owner != owner_id => {
                Err(permission_denied("You do not have permission to delete this tag."))
            }
            Some(_) => {
                sqlx::query("DELETE FROM project_tags WHERE id = ?")
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                Ok(())
            }
        }
    }

    pub async fn get_owned(&self, owner_id: &str, id: &str) -> Result<Project> {
        let row = sqlx::query(
            "SELECT id, owner_id, name, description, created_at, updated_at FROM projects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        let project = row
            .as_ref()
            .map(project_from_row)
            .ok_or_else(|| not_found("Project", id))?;
        if project.owner_id != owner_id {
            return Err(permission_denied(
                "You do not have permission to access this project.",
            ));
        }
        Ok(project)
    }

    async fn folders_of(&self, project_id: &str) -> Result<Vec<Folder>> {
        let rows = sqlx::query(
            "SELECT id, project_id, parent_id, name, created_at, updated_at FROM folders WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(folder_from_row).collect())
    }

    pub async fn detail(&self, owner_id: &str, id: &str) -> Result<ProjectDetail> {
        let project = self.get_owned(owner_id, id).await?;
        let folders = folder_tree(self.folders_of(&project.id).await?);
        let handout_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM handouts WHERE project_id = ?")
                .bind(&project.id)
                .fetch_one(&self.pool)
                .await?;
        let tags = self.tags_of(&project.id).await?;
        Ok(ProjectDetail {
            project,
            tags,
            folders,
            handout_count,
        })
    }

    /// Delete a project with its folders and handouts; sections and tag
    /// links go by cascade. The caller refreshes the owner's usage
    /// afterwards.
    pub async fn delete(&self, owner_id: &str, id: &str) -> Result<()> {
        let project = self.get_owned(owner_id, id).await?;
        let mut tx = self.pool.begin().await?;
        for table in ["handouts", "folders"] {
            sqlx::query(&format!("DELETE FROM {} WHERE project_id = ?", table))
                .bind(&project.id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM projects WHERE id = ?")
            .bind(&project.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(project = %project.id, "project deleted");
        Ok(())
    }

    pub async fn create_folder(&self, owner_id: &str, new: NewFolder) -> Result<Folder> {
        let project = self.get_owned(owner_id, &new.project_id).await?;
        let name = new.name.trim();
        if name.is_empty() {
            return Err(validation("Folder name is required."));
        }
        if let Some(parent_id) = &new.parent_id {
            let parent = self
                .get_folder(parent_id)
                .await?
                .ok_or_else(|| not_found("Folder", parent_id))?;
            if parent.project_id != project.id {
                return Err(validation(
                    "Parent folder must belong to the same project.",
                ));
            }
        }

        let now = Utc::now().timestamp();
        let folder = Folder {
            id: Uuid::new_v4().to_string(),
            project_id: project.id,
            parent_id: new.parent_id,
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO folders (id, project_id, parent_id, name, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&folder.id)
        .bind(&folder.project_id)
        .bind(&folder.parent_id)
        .bind(&folder.name)
        .bind(folder.created_at)
        .bind(folder.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(folder)
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

    /// Delete a folder and its subfolders. Handouts inside are kept and
    /// moved to the project root.
    pub async fn delete_folder(&self, owner_id: &str, id: &str) -> Result<()> {
        let folder = self
            .get_folder(id)
            .await?
            .ok_or_else(|| not_found("Folder", id))?;
        self.get_owned(owner_id, &folder.project_id).await?;

        let subtree = r#"
            WITH RECURSIVE subtree(id) AS (
                SELECT ?
                UNION ALL
                SELECT f.id FROM folders f JOIN subtree t ON f.parent_id = t.id
            )
        "#;
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "{} UPDATE handouts SET folder_id = NULL WHERE folder_id IN (SELECT id FROM subtree)",
            subtree
        ))
        .bind(&folder.id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "{} DELETE FROM folders WHERE id IN (SELECT id FROM subtree)",
            subtree
        ))
        .bind(&folder.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Handouts owned by `owner_id`, optionally narrowed to a project and
    /// folder. Newest first.
    pub async fn list_handouts(
        &self,
        owner_id: &str,
        project_id: Option<&str>,
        folder_id: Option<&str>,
    ) -> Result<Vec<Handout>> {
        let mut sql = format!("{} WHERE p.owner_id = ?", HANDOUT_SELECT);
        if project_id.is_some() {
            sql.push_str(" AND h.project_id = ?");
        }
        if folder_id.is_some() {
            sql.push_str(" AND h.folder_id = ?");
        }
        sql.push_str(" ORDER BY h.created_at DESC");

        let mut query = sqlx::query(&sql).bind(owner_id);
        if let Some(p) = project_id {
            query = query.bind(p);
        }
        if let Some(f) = folder_id {
            query = query.bind(f);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(handout_from_row).collect())
    }
}
