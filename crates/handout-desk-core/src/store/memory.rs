//! In-memory [`Store`] implementation for tests.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. A reorder holds the section
//! write lock for the whole plan-and-apply step, which gives it the same
//! all-or-nothing behaviour as a database transaction.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::hierarchy;
use crate::models::{Account, Folder, Handout, Project, ReorderEntry, Section, UsageBreakdown};
use crate::notify::WarningLevel;

use super::Store;

#[derive(Default)]
pub struct InMemoryStore {
    accounts: RwLock<HashMap<String, Account>>,
    projects: RwLock<HashMap<String, Project>>,
    folders: RwLock<HashMap<String, Folder>>,
    handouts: RwLock<HashMap<String, Handout>>,
    sections: RwLock<HashMap<String, Section>>,
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_account(&self, account: Account) -> Result<()> {
        self.accounts
            .write()
            .map_err(poisoned)?
            .insert(account.id.clone(), account);
        Ok(())
    }

    pub fn insert_project(&self, project: Project) -> Result<()> {
        self.projects
            .write()
            .map_err(poisoned)?
            .insert(project.id.clone(), project);
        Ok(())
    }

    pub fn insert_folder(&self, folder: Folder) -> Result<()> {
        self.folders
            .write()
            .map_err(poisoned)?
            .insert(folder.id.clone(), folder);
        Ok(())
    }

    fn owner_of_project(&self, project_id: &str) -> Result<Option<String>> {
        Ok(self
            .projects
            .read()
            .map_err(poisoned)?
            .get(project_id)
            .map(|p| p.owner_id.clone()))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_account(&self, id: &str) -> Result<Option<Account>> {
        Ok(self.accounts.read().map_err(poisoned)?.get(id).cloned())
    }

    async fn usage_breakdown(&self, account_id: &str) -> Result<UsageBreakdown> {
        let owned_projects: HashSet<String> = self
            .projects
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|p| p.owner_id == account_id)
            .map(|p| p.id.clone())
            .collect();

        let handouts = self.handouts.read().map_err(poisoned)?;
        let owned: Vec<&Handout> = handouts
            .values()
            .filter(|h| owned_projects.contains(&h.project_id))
            .collect();
        let owned_ids: HashSet<&str> = owned.iter().map(|h| h.id.as_str()).collect();

        let document_bytes = owned.iter().filter_map(|h| h.file_size).sum();
        let section_chars = self
            .sections
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|s| owned_ids.contains(s.handout_id.as_str()))
            .map(Section::content_len)
            .sum();

        Ok(UsageBreakdown {
            document_bytes,
            section_chars,
        })
    }

    async fn set_storage_usage(&self, account_id: &str, usage: u64) -> Result<()> {
        if let Some(a) = self.accounts.write().map_err(poisoned)?.get_mut(account_id) {
            a.current_storage_usage = usage;
        }
        Ok(())
    }

    async fn set_warning_level(&self, account_id: &str, level: WarningLevel) -> Result<()> {
        if let Some(a) = self.accounts.write().map_err(poisoned)?.get_mut(account_id) {
            a.last_storage_warning_level = level;
        }
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        Ok(self.projects.read().map_err(poisoned)?.get(id).cloned())
    }

    async fn get_folder(&self, id: &str) -> Result<Option<Folder>> {
        Ok(self.folders.read().map_err(poisoned)?.get(id).cloned())
    }

    async fn insert_handout(&self, handout: &Handout) -> Result<()> {
        self.handouts
            .write()
            .map_err(poisoned)?
            .insert(handout.id.clone(), handout.clone());
        Ok(())
    }

    async fn get_handout(&self, id: &str) -> Result<Option<Handout>> {
        let handout = self.handouts.read().map_err(poisoned)?.get(id).cloned();
        match handout {
            Some(mut h) => {
                if let Some(owner) = self.owner_of_project(&h.project_id)? {
                    h.owner_id = owner;
                }
                Ok(Some(h))
            }
            None => Ok(None),
        }
    }

    async fn update_handout(&self, handout: &Handout) -> Result<()> {
        if let Some(h) = self.handouts.write().map_err(poisoned)?.get_mut(&handout.id) {
            h.folder_id = handout.folder_id.clone();
            h.title = handout.title.clone();
            h.subtitle = handout.subtitle.clone();
            h.description = handout.description.clone();
            h.style = handout.style.clone();
            h.is_published = handout.is_published;
            h.updated_at = handout.updated_at;
        }
        Ok(())
    }

    async fn delete_handout(&self, id: &str) -> Result<()> {
        self.handouts.write().map_err(poisoned)?.remove(id);
        self.sections
            .write()
            .map_err(poisoned)?
            .retain(|_, s| s.handout_id != id);
        Ok(())
    }

    async fn record_export(&self, handout_id: &str, size: u64, at: i64) -> Result<()> {
        if let Some(h) = self.handouts.write().map_err(poisoned)?.get_mut(handout_id) {
            h.file_size = Some(size);
            h.last_exported_at = Some(at);
        }
        Ok(())
    }

    async fn get_section(&self, id: &str) -> Result<Option<Section>> {
        Ok(self.sections.read().map_err(poisoned)?.get(id).cloned())
    }

    async fn list_sections(&self, handout_id: &str) -> Result<Vec<Section>> {
        Ok(self
            .sections
            .read()
            .map_err(poisoned)?
            .values()
            .filter(|s| s.handout_id == handout_id)
            .cloned()
            .collect())
    }

    async fn insert_section(&self, mut section: Section, order: Option<i64>) -> Result<Section> {
        let mut sections = self.sections.write().map_err(poisoned)?;
        let mut siblings = sections
            .values()
            .filter(|s| s.handout_id == section.handout_id && s.parent_id == section.parent_id);
        section.order = match order {
            Some(o) => {
                if siblings.any(|s| s.order == o) {
                    return Err(hierarchy::order_taken(o));
                }
                o
            }
            None => hierarchy::next_order(siblings.map(|s| s.order).max()),
        };
        sections.insert(section.id.clone(), section.clone());
        Ok(section)
    }

    async fn update_section(&self, section: &Section) -> Result<()> {
        let mut sections = self.sections.write().map_err(poisoned)?;
        if sections.contains_key(&section.id) {
            sections.insert(section.id.clone(), section.clone());
        }
        Ok(())
    }

    async fn delete_section(&self, id: &str) -> Result<()> {
        let mut sections = self.sections.write().map_err(poisoned)?;
        let mut doomed = vec![id.to_string()];
        let mut i = 0;
        while i < doomed.len() {
            let current = doomed[i].clone();
            doomed.extend(
                sections
                    .values()
                    .filter(|s| s.parent_id.as_deref() == Some(current.as_str()))
                    .map(|s| s.id.clone()),
            );
            i += 1;
        }
        for id in doomed {
            sections.remove(&id);
        }
        Ok(())
    }

    async fn reorder_sections(
        &self,
        handout_id: &str,
        entries: &[ReorderEntry],
    ) -> Result<Vec<Section>> {
        let mut sections = self.sections.write().map_err(poisoned)?;
        let current: Vec<Section> = sections
            .values()
            .filter(|s| s.handout_id == handout_id)
            .cloned()
            .collect();
        let local: HashSet<&str> = current.iter().map(|s| s.id.as_str()).collect();

        let mut foreign = HashMap::new();
        for parent_id in entries.iter().filter_map(|e| e.parent_id.as_deref()) {
            if local.contains(parent_id) {
                continue;
            }
            if let Some(p) = sections.get(parent_id) {
                foreign.insert(parent_id.to_string(), p.handout_id.clone());
            }
        }

        let changed = hierarchy::plan_reorder(
            handout_id,
            &current,
            entries,
            &foreign,
            Utc::now().timestamp(),
        )?;
        for s in &changed {
            sections.insert(s.id.clone(), s.clone());
        }
        Ok(changed)
    }
}
