//! Core data models used throughout Handout Desk.
//!
//! Timestamps are Unix seconds, as stored in SQLite. Byte and character
//! counts are `u64` here and converted at the storage boundary.

use serde::{Deserialize, Deserializer, Serialize};

use crate::notify::WarningLevel;
use crate::quota::Tier;

/// What an account is allowed to administer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Superuser,
    Admin,
    #[default]
    Editor,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Superuser => "superuser",
            Role::Admin => "admin",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
        }
    }

    /// Unknown strings read back as `Editor`.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "superuser" => Role::Superuser,
            "admin" => Role::Admin,
            "viewer" => Role::Viewer,
            _ => Role::Editor,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Superuser | Role::Admin)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: String,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub tier: Tier,
    pub language: String,
    pub is_active: bool,
    pub is_verified: bool,
    pub current_storage_usage: u64,
    pub last_storage_warning_level: WarningLevel,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub description: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Folder {
    pub id: String,
    pub project_id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A document composed of nested sections.
#[derive(Debug, Clone, Serialize)]
pub struct Handout {
    pub id: String,
    pub project_id: String,
    /// Owner of the parent project, resolved by the store.
    pub owner_id: String,
    pub folder_id: Option<String>,
    pub title: String,
    pub subtitle: String,
    pub description: String,
    /// Raw render style configuration, see [`crate::style::RenderStyle`].
    pub style: serde_json::Value,
    pub is_published: bool,
    /// Size in bytes of the last exported PDF.
    pub file_size: Option<u64>,
    pub last_exported_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Depth of a section in its handout. Three levels exist; anything deeper
/// clamps to [`SectionLevel::Leaf`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SectionLevel {
    #[serde(rename = "section")]
    Top,
    #[serde(rename = "subsection")]
    Mid,
    #[serde(rename = "subsubsection")]
    Leaf,
}

impl SectionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionLevel::Top => "section",
            SectionLevel::Mid => "subsection",
            SectionLevel::Leaf => "subsubsection",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "section" => Some(SectionLevel::Top),
            "subsection" => Some(SectionLevel::Mid),
            "subsubsection" => Some(SectionLevel::Leaf),
            _ => None,
        }
    }

    /// The level of a child of a section at this level.
    pub fn child(&self) -> Self {
        match self {
            SectionLevel::Top => SectionLevel::Mid,
            SectionLevel::Mid | SectionLevel::Leaf => SectionLevel::Leaf,
        }
    }

    /// Zero-based depth: 0 for top, 2 for leaf.
    pub fn depth(&self) -> usize {
        match self {
            SectionLevel::Top => 0,
            SectionLevel::Mid => 1,
            SectionLevel::Leaf => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Section {
    pub id: String,
    pub handout_id: String,
    pub parent_id: Option<String>,
    pub level: SectionLevel,
    pub title: String,
    pub content: String,
    pub order: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Section {
    /// Contribution of this section to its owner's storage usage, counted in
    /// characters to match SQLite's `LENGTH()` on text.
    pub fn content_len(&self) -> u64 {
        self.content.chars().count() as u64
    }
}

/// Input for [`crate::service::ContentService::create_handout`].
#[derive(Debug, Clone, Deserialize)]
pub struct NewHandout {
    pub project_id: String,
    #[serde(default)]
    pub folder_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub subtitle: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub style: Option<serde_json::Value>,
    #[serde(default)]
    pub is_published: bool,
}

/// Input for [`crate::service::ContentService::create_section`].
#[derive(Debug, Clone, Deserialize)]
pub struct NewSection {
    pub handout_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub content: String,
    /// Explicit sequence number. `None` or `0` appends after the last sibling.
    #[serde(default)]
    pub order: Option<i64>,
}

/// Distinguishes an explicit `null` from an absent field.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Partial update of a handout. `folder_id: Some(None)` clears the folder.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandoutPatch {
    #[serde(default, deserialize_with = "present")]
    pub folder_id: Option<Option<String>>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub subtitle: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub style: Option<serde_json::Value>,
    #[serde(default)]
    pub is_published: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SectionPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// One entry of a reorder batch.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReorderEntry {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub order: i64,
}

/// Source-of-truth aggregates behind an account's usage figure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageBreakdown {
    /// Sum of exported handout sizes.
    pub document_bytes: u64,
    /// Sum of section content lengths.
    pub section_chars: u64,
}

impl UsageBreakdown {
    pub fn total(&self) -> u64 {
        self.document_bytes + self.section_chars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_level_clamps_at_leaf() {
        assert_eq!(SectionLevel::Top.child(), SectionLevel::Mid);
        assert_eq!(SectionLevel::Mid.child(), SectionLevel::Leaf);
        assert_eq!(SectionLevel::Leaf.child(), SectionLevel::Leaf);
    }

    #[test]
    fn test_level_string_roundtrip() {
        for level in [SectionLevel::Top, SectionLevel::Mid, SectionLevel::Leaf] {
            assert_eq!(SectionLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(SectionLevel::parse("chapter"), None);
    }

    #[test]
    fn test_content_len_counts_chars() {
        let section = Section {
            id: "s".into(),
            handout_id: "h".into(),
            parent_id: None,
            level: SectionLevel::Top,
            title: "t".into(),
            content: "目錄 ok".into(),
            order: 1,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(section.content_len(), 5);
    }

    #[test]
    fn test_handout_patch_null_clears_folder() {
        let patch: HandoutPatch = serde_json::from_str(r#"{"folder_id": null}"#).unwrap();
        assert_eq!(patch.folder_id, Some(None));
        let patch: HandoutPatch = serde_json::from_str(r#"{"title": "x"}"#).unwrap();
        assert_eq!(patch.folder_id, None);
    }

    #[test]
    fn test_role_parse_defaults_to_editor() {
        assert_eq!(Role::parse("ADMIN"), Role::Admin);
        assert_eq!(Role::parse("janitor"), Role::Editor);
        assert!(Role::Superuser.is_admin());
        assert!(!Role::Viewer.is_admin());
    }
}
