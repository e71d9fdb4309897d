//! Content operations with quota gates, hierarchy rules and storage
//! warnings applied.
//!
//! [`ContentService`] is generic over a [`Store`] and a [`Mailer`], so the
//! same rules run against SQLite in the server and against
//! [`InMemoryStore`](crate::store::memory::InMemoryStore) in tests.
//!
//! Every write that changes an account's footprint ends with
//! [`ContentService::refresh_usage`], which recomputes usage from the store
//! and evaluates the warning thresholds.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{not_found, permission_denied, validation};
use crate::hierarchy::{self, SectionNode};
use crate::models::{
    Account, Handout, HandoutPatch, NewHandout, NewSection, ReorderEntry, Section, SectionPatch,
};
use crate::notify::{self, Mailer, WarningDecision, WarningLevel};
use crate::quota::{self, UsageReport};
use crate::store::Store;

pub struct ContentService<S, M> {
    store: Arc<S>,
    mailer: Arc<M>,
}

impl<S, M> Clone for ContentService<S, M> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            mailer: self.mailer.clone(),
        }
    }
}

impl<S: Store, M: Mailer> ContentService<S, M> {
    pub fn new(store: Arc<S>, mailer: Arc<M>) -> Self {
        Self { store, mailer }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn account(&self, id: &str) -> Result<Account> {
        self.store
            .get_account(id)
            .await?
            .ok_or_else(|| not_found("Account", id))
    }

    /// Fetch a handout and check it belongs to `account_id`.
    pub async fn owned_handout(&self, account_id: &str, handout_id: &str) -> Result<Handout> {
        let handout = self
            .store
            .get_handout(handout_id)
            .await?
            .ok_or_else(|| not_found("Handout", handout_id))?;
        if handout.owner_id != account_id {
            return Err(permission_denied(
                "You do not have permission to access this handout.",
            ));
        }
        Ok(handout)
    }

    async fn owned_section(&self, account_id: &str, section_id: &str) -> Result<Section> {
        let section = self
            .store
            .get_section(section_id)
            .await?
            .ok_or_else(|| not_found("Section", section_id))?;
        self.owned_handout(account_id, &section.handout_id).await?;
        Ok(section)
    }

    pub async fn usage_report(&self, account_id: &str) -> Result<UsageReport> {
        let account = self.account(account_id).await?;
        Ok(UsageReport::new(
            account.current_storage_usage,
            account.tier.storage_limit(),
        ))
    }

    /// Recompute usage from the store, persist it and apply the warning
    /// thresholds. Returns the new usage.
    ///
    /// Mail failures are logged and never fail the caller. The warning level
    /// is stored only when a letter was actually queued.
    pub async fn refresh_usage(&self, account_id: &str) -> Result<u64> {
        let usage = self.store.usage_breakdown(account_id).await?.total();
        self.store.set_storage_usage(account_id, usage).await?;

        let account = self.account(account_id).await?;
        let limit = account.tier.storage_limit();

        match notify::evaluate(account.last_storage_warning_level, usage, limit) {
            WarningDecision::Send(level) => {
                match self.mailer.storage_warning(&account, usage, limit, level).await {
                    Ok(true) => {
                        info!(account = %account.id, level = level.percent(), "storage warning queued");
                        if let Err(e) = self.store.set_warning_level(account_id, level).await {
                            warn!(account = %account.id, error = %e, "failed to store warning level");
                        }
                    }
                    Ok(false) => {
                        debug!(account = %account.id, level = level.percent(), "no storage warning template");
                    }
                    Err(e) => {
                        warn!(account = %account.id, error = %e, "storage warning failed");
                    }
                }
            }
            WarningDecision::Reset => {
                self.store
                    .set_warning_level(account_id, WarningLevel::None)
                    .await?;
            }
            WarningDecision::Hold => {}
        }
        Ok(usage)
    }

    pub async fn create_handout(&self, account_id: &str, new: NewHandout) -> Result<Handout> {
        let title = new.title.trim();
        if title.is_empty() {
            return Err(validation("Title is required"));
        }

        let project = self
            .store
            .get_project(&new.project_id)
            .await?
            .ok_or_else(|| not_found("Project", &new.project_id))?;
        if project.owner_id != account_id {
            return Err(permission_denied(
                "You do not have permission to add a handout to this project.",
            ));
        }

        if let Some(folder_id) = &new.folder_id {
            let folder = self
                .store
                .get_folder(folder_id)
                .await?
                .ok_or_else(|| not_found("Folder", folder_id))?;
            if folder.project_id != project.id {
                return Err(validation(
                    "The selected folder does not belong to the selected project.",
                ));
            }
        }

        let account = self.account(account_id).await?;
        quota::check_create(account.current_storage_usage, account.tier.storage_limit())?;

        let now = Utc::now().timestamp();
        let handout = Handout {
            id: Uuid::new_v4().to_string(),
            project_id: project.id,
            owner_id: account.id,
            folder_id: new.folder_id,
            title: title.to_string(),
            subtitle: new.subtitle,
            description: new.description,
            style: new.style.unwrap_or_else(|| json!({})),
            is_published: new.is_published,
            file_size: None,
            last_exported_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_handout(&handout).await?;
        Ok(handout)
    }

    pub async fn update_handout(
        &self,
        account_id: &str,
        handout_id: &str,
        patch: HandoutPatch,
    ) -> Result<Handout> {
        let mut handout = self.owned_handout(account_id, handout_id).await?;

        if let Some(folder_id) = patch.folder_id {
            if let Some(id) = &folder_id {
                let folder = self
                    .store
                    .get_folder(id)
                    .await?
                    .ok_or_else(|| not_found("Folder", id))?;
                if folder.project_id != handout.project_id {
                    return Err(validation(
                        "The selected folder does not belong to the selected project.",
                    ));
                }
            }
            handout.folder_id = folder_id;
        }
        if let Some(title) = patch.title {
            let title = title.trim();
            if title.is_empty() {
                return Err(validation("Title is required"));
            }
            handout.title = title.to_string();
        }
        if let Some(subtitle) = patch.subtitle {
            handout.subtitle = subtitle;
        }
        if let Some(description) = patch.description {
            handout.description = description;
        }
        if let Some(style) = patch.style {
            handout.style = style;
        }
        if let Some(published) = patch.is_published {
            handout.is_published = published;
        }
        handout.updated_at = Utc::now().timestamp();

        self.store.update_handout(&handout).await?;
        Ok(handout)
    }

    pub async fn delete_handout(&self, account_id: &str, handout_id: &str) -> Result<()> {
        let handout = self.owned_handout(account_id, handout_id).await?;
        self.store.delete_handout(&handout.id).await?;
        self.refresh_usage(account_id).await?;
        Ok(())
    }

    pub async fn get_section(&self, account_id: &str, section_id: &str) -> Result<Section> {
        self.owned_section(account_id, section_id).await
    }

    /// Create a section. Its level follows from the parent and it is
    /// appended after the last sibling unless an explicit order is given.
    pub async fn create_section(&self, account_id: &str, new: NewSection) -> Result<Section> {
        let handout = self.owned_handout(account_id, &new.handout_id).await?;

        let account = self.account(account_id).await?;
        quota::check_create(account.current_storage_usage, account.tier.storage_limit())?;

        let title = new.title.trim();
        if title.is_empty() {
            return Err(validation("Title is required"));
        }

        let parent = match &new.parent_id {
            Some(parent_id) => {
                let parent = self
                    .store
                    .get_section(parent_id)
                    .await?
                    .ok_or_else(|| not_found("Section", parent_id))?;
                if parent.handout_id != handout.id {
                    return Err(validation(
                        "Parent section must belong to the same handout.",
                    ));
                }
                Some(parent)
            }
            None => None,
        };

        let order = match new.order {
            Some(o) if o < 0 => return Err(validation("Order must not be negative")),
            Some(o) if o > 0 => Some(o),
            _ => None,
        };

        let now = Utc::now().timestamp();
        let section = Section {
            id: Uuid::new_v4().to_string(),
            handout_id: handout.id,
            parent_id: new.parent_id,
            level: hierarchy::level_under(parent.as_ref()),
            title: title.to_string(),
            content: new.content,
            order: 0,
            created_at: now,
            updated_at: now,
        };
        let section = self.store.insert_section(section, order).await?;
        self.refresh_usage(account_id).await?;
        Ok(section)
    }

    pub async fn update_section(
        &self,
        account_id: &str,
        section_id: &str,
        patch: SectionPatch,
    ) -> Result<Section> {
        let mut section = self.owned_section(account_id, section_id).await?;

        if let Some(content) = patch.content {
            let account = self.account(account_id).await?;
            let new_len = content.chars().count() as u64;
            quota::check_update(
                account.current_storage_usage,
                account.tier.storage_limit(),
                section.content_len(),
                new_len,
            )?;
            section.content = content;
        }
        if let Some(title) = patch.title {
            let title = title.trim();
            if title.is_empty() {
                return Err(validation("Title is required"));
            }
            section.title = title.to_string();
        }
        section.updated_at = Utc::now().timestamp();

        self.store.update_section(&section).await?;
        self.refresh_usage(account_id).await?;
        Ok(section)
    }

    /// Delete a section and everything below it.
    pub async fn delete_section(&self, account_id: &str, section_id: &str) -> Result<()> {
        let section = self.owned_section(account_id, section_id).await?;
        self.store.delete_section(&section.id).await?;
        self.refresh_usage(account_id).await?;
        Ok(())
    }

    /// Apply a reorder batch atomically and return the new reading order.
    pub async fn reorder_sections(
        &self,
        account_id: &str,
        handout_id: &str,
        entries: &[ReorderEntry],
    ) -> Result<Vec<Section>> {
        let handout = self.owned_handout(account_id, handout_id).await?;
        let changed = self.store.reorder_sections(&handout.id, entries).await?;
        debug!(handout = %handout.id, changed = changed.len(), "sections reordered");
        self.outline(account_id, handout_id).await
    }

    /// Sections in reading order.
    pub async fn outline(&self, account_id: &str, handout_id: &str) -> Result<Vec<Section>> {
        let handout = self.owned_handout(account_id, handout_id).await?;
        let sections = self.store.list_sections(&handout.id).await?;
        Ok(hierarchy::flatten(&sections))
    }

    pub async fn tree(&self, account_id: &str, handout_id: &str) -> Result<Vec<SectionNode>> {
        let handout = self.owned_handout(account_id, handout_id).await?;
        let sections = self.store.list_sections(&handout.id).await?;
        Ok(hierarchy::build_tree(&sections))
    }

    /// Store the size of a freshly rendered export and refresh the owner's
    /// usage. Export is not quota-gated.
    pub async fn record_export(&self, handout: &Handout, size: u64) -> Result<()> {
        self.store
            .record_export(&handout.id, size, Utc::now().timestamp())
            .await?;
        self.refresh_usage(&handout.owner_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeskError;
    use crate::models::{Folder, Project, Role};
    use crate::quota::Tier;
    use crate::store::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(String, i64)>>,
        has_template: bool,
        fail: bool,
    }

    impl RecordingMailer {
        fn working() -> Self {
            Self {
                has_template: true,
                ..Default::default()
            }
        }

        fn sent(&self) -> Vec<(String, i64)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn storage_warning(
            &self,
            account: &Account,
            _usage: u64,
            _limit: u64,
            level: WarningLevel,
        ) -> Result<bool> {
            if self.fail {
                anyhow::bail!("smtp unreachable");
            }
            if !self.has_template {
                return Ok(false);
            }
            self.sent
                .lock()
                .unwrap()
                .push((account.id.clone(), level.percent()));
            Ok(true)
        }
    }

    fn account(id: &str, tier: Tier) -> Account {
        Account {
            id: id.into(),
            username: id.into(),
            email: format!("{}@example.com", id),
            first_name: String::new(),
            last_name: String::new(),
            role: Role::Editor,
            tier,
            language: "en".into(),
            is_active: true,
            is_verified: true,
            current_storage_usage: 0,
            last_storage_warning_level: WarningLevel::None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn project(id: &str, owner: &str) -> Project {
        Project {
            id: id.into(),
            owner_id: owner.into(),
            name: id.into(),
            description: String::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn new_handout(project_id: &str) -> NewHandout {
        NewHandout {
            project_id: project_id.into(),
            folder_id: None,
            title: "Week 1".into(),
            subtitle: String::new(),
            description: String::new(),
            style: None,
            is_published: false,
        }
    }

    fn new_section(handout_id: &str, parent: Option<&str>, content: &str) -> NewSection {
        NewSection {
            handout_id: handout_id.into(),
            parent_id: parent.map(String::from),
            title: "Part".into(),
            content: content.into(),
            order: None,
        }
    }

    /// Free tier (104,857 bytes) account "alice" owning project "p1".
    fn setup(mailer: RecordingMailer) -> ContentService<InMemoryStore, RecordingMailer> {
        let store = InMemoryStore::new();
        store.insert_account(account("alice", Tier::Free)).unwrap();
        store.insert_account(account("bob", Tier::Free)).unwrap();
        store.insert_project(project("p1", "alice")).unwrap();
        store.insert_project(project("p2", "bob")).unwrap();
        ContentService::new(Arc::new(store), Arc::new(mailer))
    }

    fn kind(err: &anyhow::Error) -> &'static str {
        DeskError::find(err).map(|e| e.code()).unwrap_or("internal")
    }

    #[tokio::test]
    async fn test_usage_tracks_section_content() {
        let svc = setup(RecordingMailer::working());
        let h = svc.create_handout("alice", new_handout("p1")).await.unwrap();
        let s = svc
            .create_section("alice", new_section(&h.id, None, "hello"))
            .await
            .unwrap();
        assert_eq!(svc.usage_report("alice").await.unwrap().usage, 5);

        svc.update_section(
            "alice",
            &s.id,
            SectionPatch {
                content: Some("hello world".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(svc.usage_report("alice").await.unwrap().usage, 11);

        svc.delete_section("alice", &s.id).await.unwrap();
        assert_eq!(svc.usage_report("alice").await.unwrap().usage, 0);
    }

    #[tokio::test]
    async fn test_sibling_orders_append_and_reject_clashes() {
        let svc = setup(RecordingMailer::working());
        let h = svc.create_handout("alice", new_handout("p1")).await.unwrap();
        let first = svc
            .create_section("alice", new_section(&h.id, None, "a"))
            .await
            .unwrap();
        let pinned = svc
            .create_section(
                "alice",
                NewSection {
                    order: Some(7),
                    ..new_section(&h.id, None, "b")
                },
            )
            .await
            .unwrap();
        let next = svc
            .create_section("alice", new_section(&h.id, None, "c"))
            .await
            .unwrap();
        assert_eq!((first.order, pinned.order, next.order), (1, 7, 8));

        let err = svc
            .create_section(
                "alice",
                NewSection {
                    order: Some(7),
                    ..new_section(&h.id, None, "d")
                },
            )
            .await
            .unwrap_err();
        assert_eq!(kind(&err), "validation_error");
        assert_eq!(svc.usage_report("alice").await.unwrap().usage, 3);
    }

    #[tokio::test]
    async fn test_usage_includes_exports() {
        let svc = setup(RecordingMailer::working());
        let h = svc.create_handout("alice", new_handout("p1")).await.unwrap();
        svc.create_section("alice", new_section(&h.id, None, "abc"))
            .await
            .unwrap();
        let h = svc.owned_handout("alice", &h.id).await.unwrap();
        svc.record_export(&h, 1000).await.unwrap();
        assert_eq!(svc.usage_report("alice").await.unwrap().usage, 1003);

        svc.delete_handout("alice", &h.id).await.unwrap();
        assert_eq!(svc.usage_report("alice").await.unwrap().usage, 0);
    }

    #[tokio::test]
    async fn test_create_allows_one_overage_then_blocks() {
        let svc = setup(RecordingMailer::working());
        let limit = Tier::Free.storage_limit() as usize;
        let h = svc.create_handout("alice", new_handout("p1")).await.unwrap();

        // just under the limit, then a section that pushes past it
        svc.create_section("alice", new_section(&h.id, None, &"a".repeat(limit - 50)))
            .await
            .unwrap();
        svc.create_section("alice", new_section(&h.id, None, &"b".repeat(100)))
            .await
            .unwrap();
        let report = svc.usage_report("alice").await.unwrap();
        assert_eq!(report.usage as usize, limit + 50);
        assert_eq!(report.remaining, 0);

        let err = svc
            .create_section("alice", new_section(&h.id, None, "c"))
            .await
            .unwrap_err();
        assert_eq!(kind(&err), "quota_exceeded");

        let err = svc.create_handout("alice", new_handout("p1")).await.unwrap_err();
        assert_eq!(kind(&err), "quota_exceeded");
    }

    #[tokio::test]
    async fn test_update_checks_growth_only() {
        let svc = setup(RecordingMailer::working());
        let limit = Tier::Free.storage_limit() as usize;
        let h = svc.create_handout("alice", new_handout("p1")).await.unwrap();
        let s = svc
            .create_section("alice", new_section(&h.id, None, &"a".repeat(limit - 10)))
            .await
            .unwrap();

        let grow = SectionPatch {
            content: Some("a".repeat(limit + 1)),
            ..Default::default()
        };
        let err = svc.update_section("alice", &s.id, grow).await.unwrap_err();
        assert_eq!(kind(&err), "quota_exceeded");

        let shrink = SectionPatch {
            content: Some("short".into()),
            ..Default::default()
        };
        svc.update_section("alice", &s.id, shrink).await.unwrap();
        assert_eq!(svc.usage_report("alice").await.unwrap().usage, 5);
    }

    #[tokio::test]
    async fn test_levels_and_append_order() {
        let svc = setup(RecordingMailer::working());
        let h = svc.create_handout("alice", new_handout("p1")).await.unwrap();
        let a = svc.create_section("alice", new_section(&h.id, None, "")).await.unwrap();
        let b = svc.create_section("alice", new_section(&h.id, None, "")).await.unwrap();
        let a1 = svc
            .create_section("alice", new_section(&h.id, Some(&a.id), ""))
            .await
            .unwrap();
        let a1x = svc
            .create_section("alice", new_section(&h.id, Some(&a1.id), ""))
            .await
            .unwrap();
        let deeper = svc
            .create_section("alice", new_section(&h.id, Some(&a1x.id), ""))
            .await
            .unwrap();

        assert_eq!((a.order, b.order), (1, 2));
        assert_eq!(a1.level, crate::models::SectionLevel::Mid);
        assert_eq!(a1x.level, crate::models::SectionLevel::Leaf);
        assert_eq!(deeper.level, crate::models::SectionLevel::Leaf);

        let ids: Vec<String> = svc
            .outline("alice", &h.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![a.id.clone(), a1.id, a1x.id, deeper.id, b.id]);

        let tree = svc.tree("alice", &h.id).await.unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].section.id, a.id);
    }

    #[tokio::test]
    async fn test_explicit_order_must_be_unique() {
        let svc = setup(RecordingMailer::working());
        let h = svc.create_handout("alice", new_handout("p1")).await.unwrap();
        let mut first = new_section(&h.id, None, "");
        first.order = Some(5);
        svc.create_section("alice", first.clone()).await.unwrap();
        let err = svc.create_section("alice", first).await.unwrap_err();
        assert_eq!(kind(&err), "validation_error");

        let next = svc.create_section("alice", new_section(&h.id, None, "")).await.unwrap();
        assert_eq!(next.order, 6);
    }

    #[tokio::test]
    async fn test_parent_from_other_handout_rejected() {
        let svc = setup(RecordingMailer::working());
        let h1 = svc.create_handout("alice", new_handout("p1")).await.unwrap();
        let h2 = svc.create_handout("alice", new_handout("p1")).await.unwrap();
        let s = svc.create_section("alice", new_section(&h1.id, None, "")).await.unwrap();
        let err = svc
            .create_section("alice", new_section(&h2.id, Some(&s.id), ""))
            .await
            .unwrap_err();
        assert_eq!(kind(&err), "validation_error");
    }

    #[tokio::test]
    async fn test_cross_account_access_denied() {
        let svc = setup(RecordingMailer::working());
        let err = svc.create_handout("alice", new_handout("p2")).await.unwrap_err();
        assert_eq!(kind(&err), "permission_denied");

        let h = svc.create_handout("bob", new_handout("p2")).await.unwrap();
        let err = svc.outline("alice", &h.id).await.unwrap_err();
        assert_eq!(kind(&err), "permission_denied");
        let err = svc
            .create_section("alice", new_section(&h.id, None, ""))
            .await
            .unwrap_err();
        assert_eq!(kind(&err), "permission_denied");
    }

    #[tokio::test]
    async fn test_folder_must_match_project() {
        let svc = setup(RecordingMailer::working());
        svc.store()
            .insert_folder(Folder {
                id: "f2".into(),
                project_id: "p2".into(),
                parent_id: None,
                name: "other".into(),
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        let mut new = new_handout("p1");
        new.folder_id = Some("f2".into());
        let err = svc.create_handout("alice", new).await.unwrap_err();
        assert_eq!(kind(&err), "validation_error");
    }

    #[tokio::test]
    async fn test_delete_section_removes_subtree() {
        let svc = setup(RecordingMailer::working());
        let h = svc.create_handout("alice", new_handout("p1")).await.unwrap();
        let a = svc.create_section("alice", new_section(&h.id, None, "xx")).await.unwrap();
        let a1 = svc
            .create_section("alice", new_section(&h.id, Some(&a.id), "yy"))
            .await
            .unwrap();
        svc.create_section("alice", new_section(&h.id, Some(&a1.id), "zz"))
            .await
            .unwrap();
        svc.delete_section("alice", &a.id).await.unwrap();
        assert!(svc.outline("alice", &h.id).await.unwrap().is_empty());
        assert_eq!(svc.usage_report("alice").await.unwrap().usage, 0);
    }

    #[tokio::test]
    async fn test_reorder_is_atomic() {
        let svc = setup(RecordingMailer::working());
        let h = svc.create_handout("alice", new_handout("p1")).await.unwrap();
        let a = svc.create_section("alice", new_section(&h.id, None, "")).await.unwrap();
        let b = svc.create_section("alice", new_section(&h.id, None, "")).await.unwrap();

        let batch = vec![
            ReorderEntry {
                id: b.id.clone(),
                parent_id: None,
                order: 1,
            },
            ReorderEntry {
                id: a.id.clone(),
                parent_id: None,
                order: 2,
            },
            ReorderEntry {
                id: a.id.clone(),
                parent_id: Some("missing".into()),
                order: 3,
            },
        ];
        assert!(svc.reorder_sections("alice", &h.id, &batch).await.is_err());
        let ids: Vec<String> = svc
            .outline("alice", &h.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![a.id.clone(), b.id.clone()]);

        let outline = svc
            .reorder_sections("alice", &h.id, &batch[..2])
            .await
            .unwrap();
        assert_eq!(outline[0].id, b.id);
        assert_eq!(outline[1].id, a.id);
    }

    #[tokio::test]
    async fn test_warning_sent_once_at_highest_level() {
        let svc = setup(RecordingMailer::working());
        let limit = Tier::Free.storage_limit() as usize;
        let h = svc.create_handout("alice", new_handout("p1")).await.unwrap();

        // 60%, then a jump to 92%
        let s = svc
            .create_section("alice", new_section(&h.id, None, &"a".repeat(limit * 60 / 100)))
            .await
            .unwrap();
        svc.create_section("alice", new_section(&h.id, None, &"b".repeat(limit * 32 / 100)))
            .await
            .unwrap();
        assert_eq!(svc.mailer.sent(), vec![("alice".to_string(), 90)]);

        // further growth at the same level stays quiet
        svc.update_section(
            "alice",
            &s.id,
            SectionPatch {
                content: Some("a".repeat(limit * 62 / 100)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(svc.mailer.sent().len(), 1);

        // dropping below 70% clears the level
        svc.delete_section("alice", &s.id).await.unwrap();
        let account = svc.account("alice").await.unwrap();
        assert_eq!(account.last_storage_warning_level, WarningLevel::None);
    }

    #[tokio::test]
    async fn test_missing_template_leaves_level_unset() {
        let svc = setup(RecordingMailer::default());
        let limit = Tier::Free.storage_limit() as usize;
        let h = svc.create_handout("alice", new_handout("p1")).await.unwrap();
        svc.create_section("alice", new_section(&h.id, None, &"a".repeat(limit * 80 / 100)))
            .await
            .unwrap();
        let account = svc.account("alice").await.unwrap();
        assert_eq!(account.last_storage_warning_level, WarningLevel::None);
    }

    #[tokio::test]
    async fn test_mailer_failure_does_not_fail_write() {
        let svc = setup(RecordingMailer {
            fail: true,
            ..Default::default()
        });
        let limit = Tier::Free.storage_limit() as usize;
        let h = svc.create_handout("alice", new_handout("p1")).await.unwrap();
        svc.create_section("alice", new_section(&h.id, None, &"a".repeat(limit * 95 / 100)))
            .await
            .unwrap();
        let account = svc.account("alice").await.unwrap();
        assert_eq!(account.last_storage_warning_level, WarningLevel::None);
    }

    #[tokio::test]
    async fn test_update_handout_patch() {
        let svc = setup(RecordingMailer::working());
        let h = svc.create_handout("alice", new_handout("p1")).await.unwrap();
        let updated = svc
            .update_handout(
                "alice",
                &h.id,
                HandoutPatch {
                    title: Some("Week 2".into()),
                    is_published: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "Week 2");
        assert!(updated.is_published);

        let err = svc
            .update_handout(
                "alice",
                &h.id,
                HandoutPatch {
                    title: Some("  ".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(kind(&err), "validation_error");
    }
}
