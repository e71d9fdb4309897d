//! Storage abstraction for Handout Desk.
//!
//! The [`Store`] trait covers every read and write the content service
//! needs, so the quota, hierarchy and notification rules run unchanged
//! against SQLite in production and [`memory::InMemoryStore`] in tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Account, Folder, Handout, Project, ReorderEntry, Section, UsageBreakdown};
use crate::notify::WarningLevel;

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`usage_breakdown`](Store::usage_breakdown) | Aggregate exported sizes and section lengths for an account |
/// | [`set_storage_usage`](Store::set_storage_usage) | Persist the cached usage counter |
/// | [`set_warning_level`](Store::set_warning_level) | Persist the last storage warning sent |
/// | [`insert_section`](Store::insert_section) | Place a new section among its siblings atomically |
/// | [`reorder_sections`](Store::reorder_sections) | Apply a reorder batch atomically |
/// | [`record_export`](Store::record_export) | Store an export's byte size and time |
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_account(&self, id: &str) -> Result<Option<Account>>;

    /// Aggregates over every handout whose project the account owns.
    async fn usage_breakdown(&self, account_id: &str) -> Result<UsageBreakdown>;

    async fn set_storage_usage(&self, account_id: &str, usage: u64) -> Result<()>;

    async fn set_warning_level(&self, account_id: &str, level: WarningLevel) -> Result<()>;

    async fn get_project(&self, id: &str) -> Result<Option<Project>>;

    async fn get_folder(&self, id: &str) -> Result<Option<Folder>>;

    async fn insert_handout(&self, handout: &Handout) -> Result<()>;

    async fn get_handout(&self, id: &str) -> Result<Option<Handout>>;

    /// Update the editable fields (folder, title, subtitle, description,
    /// style, published flag).
    async fn update_handout(&self, handout: &Handout) -> Result<()>;

    /// Delete a handout and all of its sections.
    async fn delete_handout(&self, id: &str) -> Result<()>;

    async fn record_export(&self, handout_id: &str, size: u64, at: i64) -> Result<()>;

    async fn get_section(&self, id: &str) -> Result<Option<Section>>;

    /// Every section of a handout, in no particular order.
    async fn list_sections(&self, handout_id: &str) -> Result<Vec<Section>>;

    /// Insert a new section. `order: None` appends after the current last
    /// sibling; `Some(n)` claims `n` and fails with
    /// [`hierarchy::order_taken`](crate::hierarchy::order_taken) when a
    /// sibling already holds it. Reading the siblings and writing the row is
    /// one atomic step. Returns the section as stored.
    async fn insert_section(&self, section: Section, order: Option<i64>) -> Result<Section>;

    /// Update title, content, parent, level, order and `updated_at`.
    async fn update_section(&self, section: &Section) -> Result<()>;

    /// Delete a section and its whole subtree.
    async fn delete_section(&self, id: &str) -> Result<()>;

    /// Validate and apply a reorder batch as one atomic unit, using
    /// [`crate::hierarchy::plan_reorder`] on a consistent snapshot.
    ///
    /// Returns the sections that changed. On error nothing is written.
    async fn reorder_sections(
        &self,
        handout_id: &str,
        entries: &[ReorderEntry],
    ) -> Result<Vec<Section>>;
}
