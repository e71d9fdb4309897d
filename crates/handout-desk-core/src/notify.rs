//! Storage-warning notifications.
//!
//! Whether to warn is a pure state transition from the account's stored
//! warning level and its current usage. Sending is delegated to a
//! [`Mailer`]; the service stores the new level only when a letter was
//! actually queued.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Serialize, Serializer};

use crate::models::Account;
use crate::quota;

/// Highest warning already sent to an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum WarningLevel {
    #[default]
    None,
    /// 75% of the quota.
    Elevated,
    /// 90% of the quota.
    Critical,
}

impl WarningLevel {
    pub fn percent(&self) -> i64 {
        match self {
            WarningLevel::None => 0,
            WarningLevel::Elevated => 75,
            WarningLevel::Critical => 90,
        }
    }

    /// Read a stored level. Values are compared as thresholds, so anything
    /// between known levels rounds down.
    pub fn from_percent(value: i64) -> Self {
        if value >= 90 {
            WarningLevel::Critical
        } else if value >= 75 {
            WarningLevel::Elevated
        } else {
            WarningLevel::None
        }
    }

    pub fn template_name(&self) -> String {
        format!("storage_warning_{}", self.percent())
    }
}

impl Serialize for WarningLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.percent())
    }
}

const SEND_CRITICAL_AT: f64 = 90.0;
const SEND_ELEVATED_AT: f64 = 75.0;
const RESET_BELOW: f64 = 70.0;

/// Outcome of evaluating an account's usage against the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningDecision {
    /// Send a warning at this level and store it once sent.
    Send(WarningLevel),
    /// Usage fell below the reset threshold; clear the stored level.
    Reset,
    /// Nothing to do.
    Hold,
}

/// Decide what to do for an account whose last warning was `last`.
///
/// Thresholds are checked high to low. Between 70% and 75% nothing changes,
/// which keeps usage hovering around a threshold from flapping.
pub fn evaluate(last: WarningLevel, usage: u64, limit: u64) -> WarningDecision {
    let pct = quota::percentage(usage, limit);
    let target = if pct >= SEND_CRITICAL_AT {
        WarningLevel::Critical
    } else if pct >= SEND_ELEVATED_AT {
        WarningLevel::Elevated
    } else if pct < RESET_BELOW {
        return if last > WarningLevel::None {
            WarningDecision::Reset
        } else {
            WarningDecision::Hold
        };
    } else {
        return WarningDecision::Hold;
    };

    if last < target {
        WarningDecision::Send(target)
    } else {
        WarningDecision::Hold
    }
}

/// Language codes that may hold a template for a language preference.
pub fn language_aliases(preference: &str) -> &'static [&'static str] {
    match preference {
        "zh_TW" => &["zh-hant", "zh-tw", "zh_TW"],
        "zh_CN" => &["zh-hans", "zh-cn", "zh_CN"],
        "th" => &["th"],
        "en" => &["en", "en-us"],
        _ => &[],
    }
}

/// Ordered, de-duplicated language codes to try for a template: the
/// account's preference, then the default locale, then English.
pub fn template_search_order(preference: &str, default_locale: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for code in language_aliases(preference)
        .iter()
        .chain(language_aliases(default_locale))
        .chain(language_aliases("en"))
    {
        if !out.iter().any(|c| c.as_str() == *code) {
            out.push((*code).to_string());
        }
    }
    out
}

/// Outbound side of storage warnings.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Queue a storage warning for `account`.
    ///
    /// Returns `Ok(false)` when no template exists for any candidate
    /// language; that is not an error.
    async fn storage_warning(
        &self,
        account: &Account,
        usage: u64,
        limit: u64,
        level: WarningLevel,
    ) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u64 = 1000;

    #[test]
    fn test_thresholds_high_to_low() {
        assert_eq!(
            evaluate(WarningLevel::None, 920, LIMIT),
            WarningDecision::Send(WarningLevel::Critical)
        );
        assert_eq!(
            evaluate(WarningLevel::None, 750, LIMIT),
            WarningDecision::Send(WarningLevel::Elevated)
        );
        assert_eq!(evaluate(WarningLevel::None, 740, LIMIT), WarningDecision::Hold);
    }

    #[test]
    fn test_jump_sends_only_highest() {
        // 60% -> 92% in one step: one warning at 90, none at 75
        assert_eq!(
            evaluate(WarningLevel::None, 920, LIMIT),
            WarningDecision::Send(WarningLevel::Critical)
        );
    }

    #[test]
    fn test_never_resends_same_or_lower() {
        assert_eq!(evaluate(WarningLevel::Critical, 950, LIMIT), WarningDecision::Hold);
        assert_eq!(evaluate(WarningLevel::Critical, 800, LIMIT), WarningDecision::Hold);
        assert_eq!(evaluate(WarningLevel::Elevated, 760, LIMIT), WarningDecision::Hold);
        assert_eq!(
            evaluate(WarningLevel::Elevated, 900, LIMIT),
            WarningDecision::Send(WarningLevel::Critical)
        );
    }

    #[test]
    fn test_hysteresis_band() {
        assert_eq!(evaluate(WarningLevel::Critical, 700, LIMIT), WarningDecision::Hold);
        assert_eq!(evaluate(WarningLevel::Critical, 749, LIMIT), WarningDecision::Hold);
        assert_eq!(evaluate(WarningLevel::Critical, 699, LIMIT), WarningDecision::Reset);
        assert_eq!(evaluate(WarningLevel::None, 100, LIMIT), WarningDecision::Hold);
    }

    #[test]
    fn test_zero_limit_is_zero_percent() {
        assert_eq!(evaluate(WarningLevel::Elevated, 5, 0), WarningDecision::Reset);
    }

    #[test]
    fn test_sequence_is_monotonic_until_reset() {
        let mut level = WarningLevel::None;
        let mut sent = Vec::new();
        for usage in [600, 760, 800, 910, 720, 930, 650, 780] {
            match evaluate(level, usage, LIMIT) {
                WarningDecision::Send(l) => {
                    sent.push(l.percent());
                    level = l;
                }
                WarningDecision::Reset => level = WarningLevel::None,
                WarningDecision::Hold => {}
            }
        }
        assert_eq!(sent, vec![75, 90, 75]);
    }

    #[test]
    fn test_level_from_percent() {
        assert_eq!(WarningLevel::from_percent(0), WarningLevel::None);
        assert_eq!(WarningLevel::from_percent(75), WarningLevel::Elevated);
        assert_eq!(WarningLevel::from_percent(90), WarningLevel::Critical);
        assert_eq!(WarningLevel::Critical.template_name(), "storage_warning_90");
    }

    #[test]
    fn test_search_order() {
        assert_eq!(
            template_search_order("th", "zh_TW"),
            vec!["th", "zh-hant", "zh-tw", "zh_TW", "en", "en-us"]
        );
        assert_eq!(
            template_search_order("zh_TW", "zh_TW"),
            vec!["zh-hant", "zh-tw", "zh_TW", "en", "en-us"]
        );
        assert_eq!(template_search_order("fr", "en"), vec!["en", "en-us"]);
    }
}
