//! Account resolution: domain, then name and location, then scored candidates, then create.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use leadflow_adapters::AccountDraft;
use leadflow_core::{normalize, Account};
use leadflow_storage::{IngestTx, StoreError};
use strsim::{jaro_winkler, normalized_levenshtein};
use tracing::debug;
use uuid::Uuid;

pub const MATCH_THRESHOLD: f64 = 0.75;
pub const CANDIDATE_LIMIT: usize = 300;
pub const SCAN_LIMIT: usize = 1000;

const EXACT_NAME_CONFIDENCE: f64 = 0.95;
const DOMAIN_STEM_FLOOR: f64 = 0.85;
const MIN_FUZZY_KEY_LEN: usize = 4;

/// Normalized resolution inputs for one row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountQuery {
    pub domain: Option<String>,
    pub company_key: Option<String>,
    pub hq_city: Option<String>,
    pub hq_country: Option<String>,
}

impl AccountQuery {
    /// Falls back to the contact's email domain when the row carries no usable company domain.
    pub fn from_draft(draft: &AccountDraft, contact_email: Option<&str>) -> Self {
        let domain = draft
            .domain
            .as_deref()
            .and_then(normalize::normalize_domain)
            .or_else(|| contact_email.and_then(normalize::email_domain));
        Self {
            domain,
            company_key: draft.name.as_deref().and_then(normalize::normalize_company_key),
            hq_city: draft.hq_city.as_deref().and_then(normalize::normalize_name),
            hq_country: draft.hq_country.as_deref().and_then(normalize::normalize_country),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.domain.is_none() && self.company_key.is_none()
    }

    /// Cache key: the root domain when known, otherwise name plus location.
    pub fn cache_key(&self) -> Option<String> {
        if let Some(domain) = &self.domain {
            return Some(format!("d:{domain}"));
        }
        let key = self.company_key.as_deref()?;
        Some(format!(
            "n:{key}|{}|{}",
            self.hq_city.as_deref().unwrap_or_default(),
            self.hq_country.as_deref().unwrap_or_default()
        ))
    }

    fn same_location(&self, account: &Account) -> bool {
        let city = account.hq_city.as_deref().and_then(normalize::normalize_name);
        let country = account.hq_country.as_deref().and_then(normalize::normalize_country);
        city == self.hq_city && country == self.hq_country
    }

    fn location_conflicts(&self, account: &Account) -> bool {
        let differs = |ours: &Option<String>, theirs: Option<String>| {
            matches!((ours, theirs), (Some(a), Some(b)) if *a != b)
        };
        differs(&self.hq_city, account.hq_city.as_deref().and_then(normalize::normalize_name))
            || differs(
                &self.hq_country,
                account.hq_country.as_deref().and_then(normalize::normalize_country),
            )
    }
}

/// Per-job memo of resolution key to account id.
///
/// Entries from the open batch stay pending until the batch commits, and are
/// dropped if it rolls back, so a rolled-back insert is never handed out again.
#[derive(Debug, Default)]
pub struct ResolutionCache {
    committed: HashMap<String, Uuid>,
    pending: HashMap<String, Uuid>,
}

impl ResolutionCache {
    pub fn get(&self, key: &str) -> Option<Uuid> {
        self.pending
            .get(key)
            .or_else(|| self.committed.get(key))
            .copied()
    }

    pub fn remember(&mut self, key: String, id: Uuid) {
        self.pending.insert(key, id);
    }

    pub fn forget(&mut self, key: &str) {
        self.pending.remove(key);
        self.committed.remove(key);
    }

    pub fn commit(&mut self) {
        self.committed.extend(self.pending.drain());
    }

    pub fn discard(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.committed.len() + self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    Fuzzy,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchScore {
    pub match_type: MatchType,
    pub confidence: f64,
}

impl MatchScore {
    const NONE: MatchScore = MatchScore {
        match_type: MatchType::None,
        confidence: 0.0,
    };

    pub fn accepted(&self) -> bool {
        self.match_type != MatchType::None && self.confidence >= MATCH_THRESHOLD
    }
}

fn similarity(a: &str, b: &str) -> f64 {
    (jaro_winkler(a, b) + normalized_levenshtein(a, b)) / 2.0
}

/// Combined domain and name similarity of one candidate.
pub fn score_candidate(query: &AccountQuery, candidate: &Account) -> MatchScore {
    let candidate_domain = candidate.domain_normalized.as_deref();
    if let (Some(ours), Some(theirs)) = (query.domain.as_deref(), candidate_domain) {
        if ours == theirs {
            return MatchScore {
                match_type: MatchType::Exact,
                confidence: 1.0,
            };
        }
    }
    if query.domain.is_none() && query.location_conflicts(candidate) {
        return MatchScore::NONE;
    }

    let domain_score = match (query.domain.as_deref(), candidate_domain) {
        (Some(ours), Some(theirs)) => {
            let score = jaro_winkler(normalize::domain_stem(ours), normalize::domain_stem(theirs));
            if score < DOMAIN_STEM_FLOOR {
                return MatchScore::NONE;
            }
            Some(score)
        }
        _ => None,
    };

    let candidate_key = candidate.name_normalized.as_str();
    let name_score = match query.company_key.as_deref() {
        Some(key) if key == candidate_key => {
            return MatchScore {
                match_type: MatchType::Exact,
                confidence: EXACT_NAME_CONFIDENCE,
            };
        }
        Some(key) if key.chars().count() >= MIN_FUZZY_KEY_LEN => similarity(key, candidate_key),
        Some(_) => return MatchScore::NONE,
        None => {
            // Domain only: the stem stands in for the company name.
            let Some(domain) = query.domain.as_deref() else {
                return MatchScore::NONE;
            };
            let stem = normalize::domain_stem(domain);
            if stem.chars().count() < MIN_FUZZY_KEY_LEN {
                return MatchScore::NONE;
            }
            similarity(stem, &candidate_key.replace(' ', ""))
        }
    };

    let confidence = match domain_score {
        Some(domain_score) => name_score * 0.7 + domain_score * 0.3,
        None => name_score,
    };
    MatchScore {
        match_type: if confidence >= MATCH_THRESHOLD {
            MatchType::Fuzzy
        } else {
            MatchType::None
        },
        confidence,
    }
}

/// Highest accepted score; ties keep the earlier candidate.
pub fn best_candidate<'a>(
    query: &AccountQuery,
    candidates: &'a [Account],
) -> Option<(&'a Account, MatchScore)> {
    let mut best: Option<(&Account, MatchScore)> = None;
    for candidate in candidates {
        let score = score_candidate(query, candidate);
        if !score.accepted() {
            continue;
        }
        match best {
            Some((_, current)) if current.confidence >= score.confidence => {}
            _ => best = Some((candidate, score)),
        }
    }
    best
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolvedVia {
    Cache,
    Domain,
    NameLocation,
    Candidate(MatchScore),
    Created,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub account: Account,
    pub via: ResolvedVia,
}

impl Resolution {
    pub fn created(&self) -> bool {
        self.via == ResolvedVia::Created
    }
}

/// Finds or creates the account for one row inside the batch transaction.
///
/// `Ok(None)` means the row has neither a company name nor a usable domain.
pub async fn resolve_account<T: IngestTx>(
    tx: &mut T,
    cache: &mut ResolutionCache,
    draft: &AccountDraft,
    query: &AccountQuery,
    source_system: &str,
    now: DateTime<Utc>,
) -> Result<Option<Resolution>, StoreError> {
    let Some(cache_key) = query.cache_key() else {
        return Ok(None);
    };

    if let Some(id) = cache.get(&cache_key) {
        match tx.account_by_id(id).await? {
            Some(account) if !account.deleted => {
                return Ok(Some(Resolution {
                    account,
                    via: ResolvedVia::Cache,
                }))
            }
            _ => cache.forget(&cache_key),
        }
    }

    let found = lookup(tx, query).await?;
    let resolution = match found {
        Some(resolution) => resolution,
        None => {
            let account = new_account(draft, query, source_system, now);
            tx.insert_account(&account).await?;
            debug!(account_id = %account.id, name = %account.name, "created account");
            Resolution {
                account,
                via: ResolvedVia::Created,
            }
        }
    };
    cache.remember(cache_key, resolution.account.id);
    Ok(Some(resolution))
}

async fn lookup<T: IngestTx>(tx: &mut T, query: &AccountQuery) -> Result<Option<Resolution>, StoreError> {
    if let Some(domain) = query.domain.as_deref() {
        if let Some(account) = tx.account_by_domain(domain).await? {
            return Ok(Some(Resolution {
                account,
                via: ResolvedVia::Domain,
            }));
        }
    } else if let Some(key) = query.company_key.as_deref() {
        let same_key = tx.accounts_by_name_key(key).await?;
        if let Some(account) = same_key.into_iter().find(|a| query.same_location(a)) {
            return Ok(Some(Resolution {
                account,
                via: ResolvedVia::NameLocation,
            }));
        }
    }

    let name_prefix = query
        .company_key
        .as_deref()
        .and_then(normalize::first_significant_word);
    let domain_fragment = query
        .domain
        .as_deref()
        .map(normalize::domain_stem)
        .filter(|stem| stem.len() >= 3);
    let mut candidates = tx
        .account_candidates(name_prefix, domain_fragment, CANDIDATE_LIMIT)
        .await?;
    if candidates.is_empty() {
        candidates = tx.account_scan(SCAN_LIMIT).await?;
    }

    Ok(best_candidate(query, &candidates).map(|(account, score)| Resolution {
        account: account.clone(),
        via: ResolvedVia::Candidate(score),
    }))
}

fn new_account(draft: &AccountDraft, query: &AccountQuery, source_system: &str, now: DateTime<Utc>) -> Account {
    let name = draft
        .name
        .clone()
        .or_else(|| query.domain.clone())
        .unwrap_or_default();
    let mut account = Account::new(name, now);
    account.domain = query.domain.clone();
    account.domain_normalized = query.domain.clone();
    account.phone = draft.phone.clone();
    account.phone_e164 = draft.phone.as_deref().and_then(normalize::normalize_phone_e164);
    account.industry = draft.industry.clone();
    account.hq_street = draft.hq_street.clone();
    account.hq_city = draft.hq_city.clone();
    account.hq_state = draft.hq_state.clone();
    account.hq_postal_code = draft.hq_postal_code.clone();
    account.hq_country = draft.hq_country.clone();
    account.tags = normalize::normalize_tags(draft.tags.iter().map(String::as_str));
    account.tech_stack = normalize::normalize_tags(draft.tech_stack.iter().map(String::as_str));
    account.source_system = Some(source_system.to_string());
    account
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_storage::{IngestStore, MemoryStore};

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-04-01T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    fn account(name: &str, domain: Option<&str>) -> Account {
        let mut account = Account::new(name, now());
        account.domain = domain.map(str::to_string);
        account.domain_normalized = domain.map(str::to_string);
        account
    }

    fn query(name: Option<&str>, domain: Option<&str>) -> AccountQuery {
        let draft = AccountDraft {
            name: name.map(str::to_string),
            domain: domain.map(str::to_string),
            ..AccountDraft::default()
        };
        AccountQuery::from_draft(&draft, None)
    }

    #[test]
    fn query_falls_back_to_business_email_domain_only() {
        let draft = AccountDraft::default();
        assert_eq!(
            AccountQuery::from_draft(&draft, Some("ada@mail.Acme.co.uk")).domain.as_deref(),
            Some("acme.co.uk")
        );
        assert_eq!(AccountQuery::from_draft(&draft, Some("ada@gmail.com")).domain, None);
    }

    #[test]
    fn equal_domain_is_exact() {
        let score = score_candidate(&query(Some("Whatever"), Some("acme.com")), &account("Acme", Some("acme.com")));
        assert_eq!(score.match_type, MatchType::Exact);
        assert_eq!(score.confidence, 1.0);
    }

    #[test]
    fn legal_suffix_variants_match_exactly_on_key() {
        let score = score_candidate(&query(Some("Acme, Inc."), None), &account("ACME LLC", None));
        assert_eq!(score.match_type, MatchType::Exact);
        assert!(score.accepted());
    }

    #[test]
    fn unrelated_domains_rule_out_same_name() {
        let score = score_candidate(
            &query(Some("Acme"), Some("acme-rockets.com")),
            &account("Acme", Some("zenith.io")),
        );
        assert_eq!(score.match_type, MatchType::None);
    }

    #[test]
    fn fuzzy_name_needs_threshold() {
        let close = score_candidate(&query(Some("Globex Industries"), None), &account("Globex Industry", None));
        assert!(close.accepted(), "{close:?}");
        let far = score_candidate(&query(Some("Initech"), None), &account("Umbrella", None));
        assert!(!far.accepted());
        let short = score_candidate(&query(Some("IBX"), None), &account("IBM", None));
        assert_eq!(short.match_type, MatchType::None);
    }

    #[test]
    fn ties_keep_insertion_order() {
        let first = account("Acme", None);
        let second = account("Acme", None);
        let candidates = vec![first.clone(), second];
        let (winner, _) = best_candidate(&query(Some("Acme"), None), &candidates).expect("match");
        assert_eq!(winner.id, first.id);
    }

    #[test]
    fn cache_discards_rolled_back_entries() {
        let mut cache = ResolutionCache::default();
        let kept = Uuid::new_v4();
        cache.remember("d:acme.com".into(), kept);
        cache.commit();
        cache.remember("d:globex.com".into(), Uuid::new_v4());
        cache.discard();
        assert_eq!(cache.get("d:acme.com"), Some(kept));
        assert_eq!(cache.get("d:globex.com"), None);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn same_domain_resolves_to_one_account_before_commit() {
        let store = MemoryStore::new();
        let mut cache = ResolutionCache::default();
        let draft = AccountDraft {
            name: Some("Acme Corp".into()),
            domain: Some("https://www.acme.com/about".into()),
            ..AccountDraft::default()
        };
        let q = AccountQuery::from_draft(&draft, None);

        let mut tx = store.begin().await.expect("begin");
        let first = resolve_account(&mut tx, &mut cache, &draft, &q, "csv_import", now())
            .await
            .expect("resolve")
            .expect("resolution");
        assert!(first.created());

        let second = resolve_account(&mut tx, &mut cache, &draft, &q, "csv_import", now())
            .await
            .expect("resolve")
            .expect("resolution");
        assert_eq!(second.via, ResolvedVia::Cache);
        assert_eq!(first.account.id, second.account.id);

        drop(tx);
        cache.discard();
        assert!(cache.is_empty());
        assert!(store.snapshot().await.accounts.is_empty());
    }

    #[tokio::test]
    async fn name_without_domain_respects_location() {
        let store = MemoryStore::new();
        let mut boston = account("Northwind Traders", None);
        boston.hq_city = Some("Boston".into());
        boston.hq_country = Some("USA".into());
        store.seed_account(boston.clone()).await;

        let mut cache = ResolutionCache::default();
        let mut tx = store.begin().await.expect("begin");

        let same_place = AccountDraft {
            name: Some("Northwind Traders Inc".into()),
            hq_city: Some("boston".into()),
            hq_country: Some("United States".into()),
            ..AccountDraft::default()
        };
        let q = AccountQuery::from_draft(&same_place, None);
        let found = resolve_account(&mut tx, &mut cache, &same_place, &q, "csv_import", now())
            .await
            .expect("resolve")
            .expect("resolution");
        assert_eq!(found.account.id, boston.id);
        assert_eq!(found.via, ResolvedVia::NameLocation);

        let elsewhere = AccountDraft {
            name: Some("Northwind Traders".into()),
            hq_city: Some("Seattle".into()),
            hq_country: Some("USA".into()),
            ..AccountDraft::default()
        };
        let q = AccountQuery::from_draft(&elsewhere, None);
        let created = resolve_account(&mut tx, &mut cache, &elsewhere, &q, "csv_import", now())
            .await
            .expect("resolve")
            .expect("resolution");
        assert!(created.created());
        assert_ne!(created.account.id, boston.id);
    }

    #[tokio::test]
    async fn nothing_to_resolve_with() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.expect("begin");
        let draft = AccountDraft::default();
        let q = AccountQuery::from_draft(&draft, Some("someone@gmail.com"));
        let outcome = resolve_account(&mut tx, &mut ResolutionCache::default(), &draft, &q, "csv_import", now())
            .await
            .expect("resolve");
        assert!(outcome.is_none());
    }
}
