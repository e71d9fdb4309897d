//! Storage quota accounting.
//!
//! An account's usage is the sum of its exported handout sizes and the
//! character length of every section it owns. The limit comes from a fixed
//! per-tier table. The gates here are pure; callers feed them the cached
//! usage stored on the account.

use serde::{Deserialize, Serialize};

use crate::error::DeskError;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Account plan determining the byte quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Trial,
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Trial => "trial",
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    /// Parse a stored tier name. Unknown names fall back to `Free`, which
    /// also gives them the free limit.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trial" | "beta" => Tier::Trial,
            "pro" => Tier::Pro,
            "enterprise" => Tier::Enterprise,
            _ => Tier::Free,
        }
    }

    pub fn storage_limit(&self) -> u64 {
        match self {
            Tier::Trial => 500 * MIB,
            // Reduced from 50 MiB to 0.1 MiB.
            Tier::Free => MIB / 10,
            Tier::Pro => 2 * GIB,
            Tier::Enterprise => 50 * GIB,
        }
    }
}

pub fn remaining(usage: u64, limit: u64) -> u64 {
    limit.saturating_sub(usage)
}

/// Usage as a percentage of the limit. A zero limit reads as 0%.
pub fn percentage(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        usage as f64 / limit as f64 * 100.0
    }
}

/// Whole percent used, truncated toward zero, as shown in warning emails.
pub fn whole_percent(usage: u64, limit: u64) -> u64 {
    if limit == 0 {
        0
    } else {
        usage.saturating_mul(100) / limit
    }
}

/// Gate for creating new content (sections, handouts).
///
/// Only the current usage is checked: content that pushes usage past the
/// limit is accepted as long as usage was below the limit beforehand.
pub fn check_create(usage: u64, limit: u64) -> Result<(), DeskError> {
    if usage >= limit {
        return Err(DeskError::QuotaExceeded(
            "Storage limit reached. Cannot add more content.".to_string(),
        ));
    }
    Ok(())
}

/// Gate for replacing a section's content. Shrinking or equal-size edits
/// always pass.
pub fn check_update(usage: u64, limit: u64, old_len: u64, new_len: u64) -> Result<(), DeskError> {
    if new_len > old_len && usage + (new_len - old_len) > limit {
        return Err(DeskError::QuotaExceeded(
            "Content too large. Not enough storage space remaining.".to_string(),
        ));
    }
    Ok(())
}

/// Gate for file uploads: the whole file must fit in what remains.
pub fn check_upload(usage: u64, limit: u64, size: u64) -> Result<(), DeskError> {
    if usage.saturating_add(size) > limit {
        return Err(DeskError::QuotaExceeded(
            "Uploading this file will exceed your storage limit.".to_string(),
        ));
    }
    Ok(())
}

/// Usage snapshot returned by the API and CLI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageReport {
    pub usage: u64,
    pub limit: u64,
    pub remaining: u64,
    pub percentage: f64,
}

impl UsageReport {
    pub fn new(usage: u64, limit: u64) -> Self {
        Self {
            usage,
            limit,
            remaining: remaining(usage, limit),
            percentage: percentage(usage, limit),
        }
    }
}

/// Human-readable size in MiB with two decimals, as used in warning emails.
pub fn format_mb(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / MIB as f64)
}
