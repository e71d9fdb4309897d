//! Section tree rules: level derivation, sibling sequencing, traversal and
//! reorder planning.
//!
//! A handout's sections are handled as a flat arena indexed by parent id.
//! Traversals are iterative, so a long chain of clamped leaf sections cannot
//! exhaust the stack.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::validation;
use crate::models::{ReorderEntry, Section, SectionLevel};

/// Level of a new or moved section under `parent`.
pub fn level_under(parent: Option<&Section>) -> SectionLevel {
    parent.map_or(SectionLevel::Top, |p| p.level.child())
}

/// Sequence number that appends after the current last sibling.
pub fn next_order(max_sibling_order: Option<i64>) -> i64 {
    max_sibling_order.unwrap_or(0) + 1
}

/// Rejection for an explicit sequence number a sibling already holds.
pub fn order_taken(order: i64) -> anyhow::Error {
    validation(format!(
        "Order {} is already used by a sibling section.",
        order
    ))
}

fn sort_siblings(siblings: &mut [&Section]) {
    siblings.sort_by(|a, b| {
        a.order
            .cmp(&b.order)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

fn children_index(sections: &[Section]) -> HashMap<Option<&str>, Vec<&Section>> {
    let mut index: HashMap<Option<&str>, Vec<&Section>> = HashMap::new();
    for s in sections {
        index.entry(s.parent_id.as_deref()).or_default().push(s);
    }
    for siblings in index.values_mut() {
        sort_siblings(siblings);
    }
    index
}

/// Depth-first pre-order reading order: roots by sequence, each followed by
/// its children by sequence.
pub fn flatten(sections: &[Section]) -> Vec<Section> {
    let index = children_index(sections);
    let mut out = Vec::with_capacity(sections.len());
    let mut visited: HashSet<&str> = HashSet::new();

    let mut stack: Vec<&Section> = index
        .get(&None)
        .map(|roots| roots.iter().rev().copied().collect())
        .unwrap_or_default();

    while let Some(section) = stack.pop() {
        if !visited.insert(section.id.as_str()) {
            continue;
        }
        out.push(section.clone());
        if let Some(children) = index.get(&Some(section.id.as_str())) {
            stack.extend(children.iter().rev().copied());
        }
    }
    out
}

/// A section with its children, for nested API responses.
#[derive(Debug, Clone, Serialize)]
pub struct SectionNode {
    #[serde(flatten)]
    pub section: Section,
    pub children: Vec<SectionNode>,
}

/// Build the nested tree without recursion: walk the pre-order sequence
/// backwards so every child is finished before its parent.
pub fn build_tree(sections: &[Section]) -> Vec<SectionNode> {
    let ordered = flatten(sections);
    let mut pending: HashMap<Option<String>, Vec<SectionNode>> = HashMap::new();

    for section in ordered.into_iter().rev() {
        let mut children = pending.remove(&Some(section.id.clone())).unwrap_or_default();
        children.reverse();
        let parent = section.parent_id.clone();
        pending
            .entry(parent)
            .or_default()
            .push(SectionNode { section, children });
    }

    let mut roots = pending.remove(&None).unwrap_or_default();
    roots.reverse();
    roots
}

/// Fail if two sections under the same parent share a sequence number.
pub fn check_unique_orders(sections: &[Section]) -> anyhow::Result<()> {
    let mut seen: HashSet<(Option<&str>, i64)> = HashSet::new();
    for s in sections {
        if !seen.insert((s.parent_id.as_deref(), s.order)) {
            return Err(validation(format!(
                "Duplicate order {} among siblings of section {}",
                s.order, s.id
            )));
        }
    }
    Ok(())
}

/// Validate a reorder batch against a handout's sections and compute the
/// rows that change.
///
/// `sections` must be every section of `handout_id`. `foreign_parents` maps
/// parent ids referenced by the batch that are *not* in this handout to the
/// handout they belong to; a parent id missing from both is unknown.
///
/// Entries that reparent a section to itself are skipped. Any other bad
/// entry rejects the whole batch. Levels of every section are re-derived
/// after the moves so moved subtrees keep the level invariant. Changed rows
/// get `updated_at = now`.
pub fn plan_reorder(
    handout_id: &str,
    sections: &[Section],
    entries: &[ReorderEntry],
    foreign_parents: &HashMap<String, String>,
    now: i64,
) -> anyhow::Result<Vec<Section>> {
    if entries.is_empty() {
        return Err(validation("No structure provided"));
    }

    let by_id: HashMap<&str, &Section> = sections.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut seen = HashSet::new();
    for entry in entries {
        if !by_id.contains_key(entry.id.as_str()) || !seen.insert(entry.id.as_str()) {
            return Err(validation("Invalid section IDs provided for this handout"));
        }
    }

    let mut working: Vec<Section> = sections.to_vec();
    let position: HashMap<String, usize> = working
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.clone(), i))
        .collect();

    for entry in entries {
        if let Some(parent_id) = entry.parent_id.as_deref() {
            if !by_id.contains_key(parent_id) {
                return match foreign_parents.get(parent_id) {
                    Some(other) => Err(validation(format!(
                        "Parent {} does not belong to this handout (belongs to {})",
                        parent_id, other
                    ))),
                    None => Err(crate::error::not_found("Section", parent_id)),
                };
            }
            if parent_id == entry.id {
                continue;
            }
        }
        let idx = position[&entry.id];
        working[idx].parent_id = entry.parent_id.clone();
        working[idx].order = entry.order;
    }

    check_acyclic(&working)?;
    check_unique_orders(&working)?;
    relevel(&mut working);

    let changed: Vec<Section> = working
        .into_iter()
        .filter(|s| {
            let before = by_id[s.id.as_str()];
            before.parent_id != s.parent_id || before.order != s.order || before.level != s.level
        })
        .map(|mut s| {
            s.updated_at = now;
            s
        })
        .collect();

    tracing::debug!(handout_id, entries = entries.len(), "reorder planned");
    Ok(changed)
}

fn check_acyclic(sections: &[Section]) -> anyhow::Result<()> {
    let parent_of: HashMap<&str, Option<&str>> = sections
        .iter()
        .map(|s| (s.id.as_str(), s.parent_id.as_deref()))
        .collect();

    for s in sections {
        let mut steps = 0usize;
        let mut cursor = s.parent_id.as_deref();
        while let Some(id) = cursor {
            if id == s.id || steps > sections.len() {
                return Err(validation(format!(
                    "Section {} cannot be moved under its own descendant",
                    s.id
                )));
            }
            steps += 1;
            cursor = parent_of.get(id).copied().flatten();
        }
    }
    Ok(())
}

/// Re-derive every level top-down from the parent links.
pub fn relevel(sections: &mut [Section]) {
    let order: Vec<(String, Option<String>)> = flatten(sections)
        .into_iter()
        .map(|s| (s.id, s.parent_id))
        .collect();
    let mut levels: HashMap<String, SectionLevel> = HashMap::new();
    for (id, parent) in order {
        let level = parent
            .as_ref()
            .and_then(|p| levels.get(p))
            .map_or(SectionLevel::Top, |l| l.child());
        levels.insert(id, level);
    }
    for s in sections.iter_mut() {
        if let Some(level) = levels.get(&s.id) {
            s.level = *level;
        }
    }
}
