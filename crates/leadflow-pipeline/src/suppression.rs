//! Exact-match suppression rules.
//!
//! Every rule compares pre-normalized values for equality. There is no partial
//! or fuzzy matching, and a name or a company on its own never matches.

use leadflow_core::{SuppressionEntry, SuppressionKeys, SuppressionRule};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuppressionMatch {
    pub rule: SuppressionRule,
    pub entry_id: Uuid,
    pub reason: Option<String>,
}

impl SuppressionMatch {
    pub fn describe(&self) -> String {
        match &self.reason {
            Some(reason) => format!("suppressed by {}: {reason}", self.rule.as_str()),
            None => format!("suppressed by {}", self.rule.as_str()),
        }
    }
}

const RULE_ORDER: [SuppressionRule; 4] = [
    SuppressionRule::Email,
    SuppressionRule::CavId,
    SuppressionRule::CavUserId,
    SuppressionRule::NameCompany,
];

fn rule_fires(rule: SuppressionRule, keys: &SuppressionKeys, entry: &SuppressionEntry) -> bool {
    fn same(key: &Option<String>, stored: &Option<String>) -> bool {
        matches!((key, stored), (Some(a), Some(b)) if a == b)
    }
    match rule {
        SuppressionRule::Email => same(&keys.email, &entry.email_normalized),
        SuppressionRule::CavId => same(&keys.cav_id, &entry.cav_id),
        SuppressionRule::CavUserId => same(&keys.cav_user_id, &entry.cav_user_id),
        SuppressionRule::NameCompany => {
            entry.full_name_normalized.is_some()
                && entry.company_normalized.is_some()
                && same(&keys.name_company_hash, &entry.name_company_hash)
        }
    }
}

/// First rule, in priority order, matched by any entry.
pub fn match_suppression(
    keys: &SuppressionKeys,
    entries: &[SuppressionEntry],
) -> Option<SuppressionMatch> {
    if keys.is_empty() {
        return None;
    }
    RULE_ORDER.into_iter().find_map(|rule| {
        entries
            .iter()
            .find(|entry| rule_fires(rule, keys, entry))
            .map(|entry| SuppressionMatch {
                rule,
                entry_id: entry.id,
                reason: entry.reason.clone(),
            })
    })
}

pub fn is_suppressed(keys: &SuppressionKeys, entries: &[SuppressionEntry]) -> bool {
    match_suppression(keys, entries).is_some()
}
