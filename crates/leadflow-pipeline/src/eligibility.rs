//! Eligibility rules and the submission-exclusion sweep.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use leadflow_core::{
    normalize, CampaignRules, EligibilityStatus, EmailValidationStatus, EntityType, Provenance,
    SurvivorshipPolicy,
};
use leadflow_storage::{IngestStore, IngestTx};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::upsert::Survivorship;

pub const SWEEP_ACTOR: &str = "exclusion-sweep";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityDecision {
    pub status: EligibilityStatus,
    pub reason: Option<String>,
}

impl EligibilityDecision {
    fn new(status: EligibilityStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: Some(reason.into()),
        }
    }

    fn eligible() -> Self {
        Self {
            status: EligibilityStatus::Eligible,
            reason: None,
        }
    }
}

/// Title, then geography, then email presence. Pure.
pub fn evaluate_eligibility(
    title: Option<&str>,
    country: Option<&str>,
    rules: &CampaignRules,
    email: Option<&str>,
) -> EligibilityDecision {
    let title = title.map(str::trim).filter(|t| !t.is_empty());
    let Some(title) = title else {
        return EligibilityDecision::new(EligibilityStatus::IneligibleTitle, "missing title");
    };
    let title_lower = title.to_lowercase();
    let contains = |keyword: &String| {
        let keyword = keyword.trim().to_lowercase();
        !keyword.is_empty() && title_lower.contains(&keyword)
    };
    if let Some(keyword) = rules.excluded_title_keywords.iter().find(|k| contains(*k)) {
        return EligibilityDecision::new(
            EligibilityStatus::IneligibleTitle,
            format!("title matches excluded keyword '{}'", keyword.trim()),
        );
    }
    if !rules.allowed_title_keywords.is_empty() && !rules.allowed_title_keywords.iter().any(contains) {
        return EligibilityDecision::new(EligibilityStatus::IneligibleTitle, "title not in allowed list");
    }

    if !rules.allowed_countries.is_empty() {
        let country = country.and_then(normalize::normalize_country);
        let allowed = country.as_deref().is_some_and(|c| {
            rules
                .allowed_countries
                .iter()
                .filter_map(|a| normalize::normalize_country(a))
                .any(|a| a == c)
        });
        if !allowed {
            let reason = match country {
                Some(c) => format!("country '{c}' not allowed"),
                None => "missing country".to_string(),
            };
            return EligibilityDecision::new(EligibilityStatus::IneligibleGeography, reason);
        }
    }

    if email.map(str::trim).filter(|e| !e.is_empty()).is_none() {
        return EligibilityDecision::new(EligibilityStatus::PendingEmailValidation, "missing email");
    }
    EligibilityDecision::eligible()
}

/// Folds the evaluator result together with state owned by other processes.
///
/// Suppression wins over everything. Evaluator rejections come next. A
/// recent-submission exclusion set by the sweep, and a stored email-validation
/// outcome, survive re-imports.
pub fn reconcile(
    evaluated: EligibilityDecision,
    suppression: Option<&str>,
    current: EligibilityStatus,
    email_validation: Option<EmailValidationStatus>,
) -> EligibilityDecision {
    if let Some(reason) = suppression {
        return EligibilityDecision::new(EligibilityStatus::Excluded, reason);
    }
    if evaluated.status != EligibilityStatus::Eligible {
        return evaluated;
    }
    if current == EligibilityStatus::IneligibleRecentlySubmitted {
        return EligibilityDecision::new(current, "recently submitted");
    }
    match email_validation {
        Some(EmailValidationStatus::Ok) | None => evaluated,
        Some(validation) => EligibilityDecision::new(
            validation.eligibility(),
            format!("email validation: {}", validation.as_str()),
        ),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub dataset_id: Uuid,
    pub examined: usize,
    pub marked_recent: usize,
    pub released: usize,
    pub unchanged: usize,
}

/// Re-derives the recent-submission exclusion for one dataset from its submission history.
///
/// Uses each contact's latest submission only. Idempotent; leaves `Excluded`
/// contacts and other datasets alone. Contacts the campaign rules reject keep
/// that status, matching the precedence [`reconcile`] applies on re-import.
pub async fn run_exclusion_sweep<S: IngestStore>(
    store: &S,
    dataset_id: Uuid,
    window: Duration,
    source_system: &str,
    now: DateTime<Utc>,
) -> Result<SweepSummary> {
    let provenance = Provenance {
        source_system: source_system.to_string(),
        source_record_id: None,
        source_updated_at: None,
        actor: SWEEP_ACTOR.to_string(),
    };
    let dataset = store
        .load_dataset(dataset_id)
        .await
        .context("loading dataset")?
        .ok_or_else(|| anyhow!("dataset {dataset_id} not found"))?;
    let cutoff = now - window;
    let mut summary = SweepSummary {
        dataset_id,
        ..SweepSummary::default()
    };

    let mut tx = store.begin().await.context("opening sweep transaction")?;
    let history = tx
        .latest_submissions(dataset_id)
        .await
        .context("loading submission history")?;
    let mut changes = Vec::new();

    for (contact_id, last_submitted) in history {
        let Some(mut contact) = tx.contact_by_id(contact_id).await? else {
            continue;
        };
        if contact.dataset_id != dataset_id
            || contact.deleted
            || contact.eligibility_status == EligibilityStatus::Excluded
        {
            continue;
        }
        summary.examined += 1;

        let evaluated = evaluate_eligibility(
            contact.title.as_deref(),
            contact.country.as_deref(),
            &dataset.rules,
            contact.email.as_deref(),
        );
        if evaluated.status != EligibilityStatus::Eligible {
            summary.unchanged += 1;
            continue;
        }

        let target = if last_submitted >= cutoff {
            Some((
                EligibilityStatus::IneligibleRecentlySubmitted,
                format!("last submitted {}", last_submitted.format("%Y-%m-%d")),
            ))
        } else if contact.eligibility_status == EligibilityStatus::IneligibleRecentlySubmitted {
            Some((
                EligibilityStatus::PendingEmailValidation,
                "submission window elapsed".to_string(),
            ))
        } else {
            None
        };
        let Some((status, reason)) = target else {
            summary.unchanged += 1;
            continue;
        };
        if contact.eligibility_status == status {
            summary.unchanged += 1;
            continue;
        }

        let mut audit = Survivorship::new(EntityType::Contact, contact.id, &provenance, now);
        audit.replace(
            "eligibility_status",
            &mut contact.eligibility_status,
            status,
            SurvivorshipPolicy::PreferNewIfNotNull,
        );
        contact.eligibility_reason = Some(reason);
        if status == EligibilityStatus::PendingEmailValidation {
            contact.email_validation = None;
            summary.released += 1;
        } else {
            summary.marked_recent += 1;
        }
        contact.updated_at = now;
        tx.update_contact(&contact).await?;
        changes.extend(audit.into_changes());
    }

    tx.append_field_changes(&changes).await?;
    tx.commit().await.context("committing exclusion sweep")?;
    info!(
        %dataset_id,
        examined = summary.examined,
        marked_recent = summary.marked_recent,
        released = summary.released,
        "exclusion sweep finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> CampaignRules {
        CampaignRules {
            allowed_title_keywords: vec!["Director".into(), "VP".into(), "Head of".into()],
            excluded_title_keywords: vec!["intern".into(), "assistant".into()],
            allowed_countries: vec!["USA".into(), "United Kingdom".into()],
        }
    }

    #[test]
    fn title_is_checked_before_geography_and_email() {
        let decision = evaluate_eligibility(Some("Marketing Intern"), Some("France"), &rules(), None);
        assert_eq!(decision.status, EligibilityStatus::IneligibleTitle);

        let decision = evaluate_eligibility(None, Some("US"), &rules(), Some("a@b.com"));
        assert_eq!(decision.status, EligibilityStatus::IneligibleTitle);

        let decision = evaluate_eligibility(Some("Software Engineer"), Some("US"), &rules(), Some("a@b.com"));
        assert_eq!(decision.reason.as_deref(), Some("title not in allowed list"));
    }

    #[test]
    fn excluded_keyword_beats_allowed_keyword() {
        let decision = evaluate_eligibility(Some("Assistant to the VP"), Some("US"), &rules(), Some("a@b.com"));
        assert_eq!(decision.status, EligibilityStatus::IneligibleTitle);
    }

    #[test]
    fn geography_uses_country_aliases() {
        let ok = evaluate_eligibility(Some("VP Sales"), Some("united states"), &rules(), Some("a@b.com"));
        assert_eq!(ok.status, EligibilityStatus::Eligible);

        let uk = evaluate_eligibility(Some("VP Sales"), Some("UK"), &rules(), Some("a@b.com"));
        assert_eq!(uk.status, EligibilityStatus::Eligible);

        let no = evaluate_eligibility(Some("VP Sales"), Some("Germany"), &rules(), Some("a@b.com"));
        assert_eq!(no.status, EligibilityStatus::IneligibleGeography);

        let missing = evaluate_eligibility(Some("VP Sales"), None, &rules(), Some("a@b.com"));
        assert_eq!(missing.reason.as_deref(), Some("missing country"));
    }

    #[test]
    fn missing_email_is_pending() {
        let decision = evaluate_eligibility(Some("Director of IT"), Some("USA"), &rules(), Some("  "));
        assert_eq!(decision.status, EligibilityStatus::PendingEmailValidation);
    }

    #[test]
    fn empty_rules_accept_any_titled_contact() {
        let decision =
            evaluate_eligibility(Some("Anything"), None, &CampaignRules::default(), Some("a@b.com"));
        assert_eq!(decision, EligibilityDecision::eligible());
    }

    #[test]
    fn reconcile_precedence() {
        let eligible = EligibilityDecision::eligible();
        let suppressed = reconcile(
            eligible.clone(),
            Some("suppressed by email"),
            EligibilityStatus::Eligible,
            None,
        );
        assert_eq!(suppressed.status, EligibilityStatus::Excluded);

        let title = EligibilityDecision::new(EligibilityStatus::IneligibleTitle, "missing title");
        let kept = reconcile(title, None, EligibilityStatus::IneligibleRecentlySubmitted, None);
        assert_eq!(kept.status, EligibilityStatus::IneligibleTitle);

        let recent = reconcile(
            eligible.clone(),
            None,
            EligibilityStatus::IneligibleRecentlySubmitted,
            Some(EmailValidationStatus::Ok),
        );
        assert_eq!(recent.status, EligibilityStatus::IneligibleRecentlySubmitted);

        let risky = reconcile(
            eligible.clone(),
            None,
            EligibilityStatus::Eligible,
            Some(EmailValidationStatus::Risky),
        );
        assert_eq!(risky.status, EligibilityStatus::IneligibleEmailRisky);

        let ok = reconcile(eligible, None, EligibilityStatus::PendingEmailValidation, Some(EmailValidationStatus::Ok));
        assert_eq!(ok.status, EligibilityStatus::Eligible);
    }
}
