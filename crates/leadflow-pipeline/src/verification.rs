//! Calls the external verifier for contacts still waiting on an email outcome.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use leadflow_adapters::ValidationDraft;
use leadflow_core::Provenance;
use leadflow_storage::{EmailVerifier, IngestStore, IngestTx};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::upsert::{apply_validation_result, RowContext, RowFailure, UpsertAction};

pub const VERIFIER_ACTOR: &str = "email-verifier";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationSummary {
    pub checked: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Verifies up to `limit` pending contacts of a dataset and applies the verdicts.
///
/// Verifier calls run outside any transaction; the verdicts are applied in one
/// transaction that re-reads each contact, so rows that moved on meanwhile
/// (suppressed, deleted, already validated) are left alone.
pub async fn verify_pending<S: IngestStore>(
    store: &S,
    verifier: Arc<dyn EmailVerifier>,
    dataset_id: Uuid,
    limit: usize,
    source_system: &str,
    now: DateTime<Utc>,
) -> Result<VerificationSummary> {
    let dataset = store
        .load_dataset(dataset_id)
        .await
        .context("loading dataset")?
        .ok_or_else(|| anyhow!("dataset {dataset_id} not found"))?;

    let pending = {
        let mut tx = store.begin().await.context("opening read transaction")?;
        tx.contacts_pending_validation(dataset_id, limit)
            .await
            .context("listing contacts pending validation")?
    };
    let mut summary = VerificationSummary::default();
    if pending.is_empty() {
        return Ok(summary);
    }

    let mut calls = JoinSet::new();
    for contact in pending {
        let Some(email) = contact.email_normalized else {
            continue;
        };
        let verifier = Arc::clone(&verifier);
        calls.spawn(async move {
            let verdict = verifier.verify_email(&email).await;
            (email, verdict)
        });
    }

    let mut verdicts = Vec::new();
    while let Some(joined) = calls.join_next().await {
        summary.checked += 1;
        match joined {
            Ok((email, Ok(status))) => verdicts.push(ValidationDraft { email, status }),
            Ok((email, Err(err))) => {
                summary.failed += 1;
                warn!(%email, error = %err, "email verification failed");
            }
            Err(err) => {
                summary.failed += 1;
                warn!(error = %err, "verification task aborted");
            }
        }
    }

    let ctx = RowContext {
        dataset: &dataset,
        update_mode: false,
        provenance: Provenance {
            source_system: source_system.to_string(),
            source_record_id: None,
            source_updated_at: None,
            actor: VERIFIER_ACTOR.to_string(),
        },
        now,
    };
    let mut tx = store.begin().await.context("opening verdict transaction")?;
    for verdict in &verdicts {
        match apply_validation_result(&mut tx, &ctx, verdict).await {
            Ok(UpsertAction::Unchanged) => {}
            Ok(_) => summary.updated += 1,
            Err(RowFailure::Row(message)) => {
                warn!(email = %verdict.email, %message, "verdict not applied");
            }
            Err(RowFailure::Batch(err)) => return Err(err).context("applying verdicts"),
        }
    }
    tx.commit().await.context("committing verdicts")?;

    info!(
        %dataset_id,
        checked = summary.checked,
        updated = summary.updated,
        failed = summary.failed,
        "email verification pass finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use leadflow_core::{CampaignRules, Contact, Dataset, EligibilityStatus, EmailValidationStatus};
    use leadflow_storage::{MemoryStore, VerifyError};

    struct FakeVerifier;

    #[async_trait]
    impl EmailVerifier for FakeVerifier {
        async fn verify_email(&self, email: &str) -> Result<EmailValidationStatus, VerifyError> {
            match email.split('@').next() {
                Some("good") => Ok(EmailValidationStatus::Ok),
                Some("bad") => Ok(EmailValidationStatus::Invalid),
                _ => Err(VerifyError::Payload("unexpected body".into())),
            }
        }
    }

    fn pending_contact(dataset_id: Uuid, email: &str) -> Contact {
        let mut contact = Contact::new(dataset_id, Utc::now());
        contact.email = Some(email.to_string());
        contact.email_normalized = Some(email.to_string());
        contact.eligibility_status = EligibilityStatus::PendingEmailValidation;
        contact
    }

    #[tokio::test]
    async fn verdicts_move_pending_contacts() {
        let store = MemoryStore::new();
        let dataset = Dataset {
            id: Uuid::new_v4(),
            name: "verify".into(),
            rules: CampaignRules::default(),
        };
        store.seed_dataset(dataset.clone()).await;
        for email in ["good@acme.com", "bad@acme.com", "flaky@acme.com"] {
            store.seed_contact(pending_contact(dataset.id, email)).await;
        }
        let mut suppressed = pending_contact(dataset.id, "good@hold.com");
        suppressed.suppressed = true;
        store.seed_contact(suppressed).await;

        let summary = verify_pending(&store, Arc::new(FakeVerifier), dataset.id, 50, "test", Utc::now())
            .await
            .expect("verify");
        assert_eq!(
            summary,
            VerificationSummary {
                checked: 3,
                updated: 2,
                failed: 1
            }
        );

        let state = store.snapshot().await;
        let status = |email: &str| {
            state
                .contact_by_email(dataset.id, email)
                .map(|c| c.eligibility_status)
        };
        assert_eq!(status("good@acme.com"), Some(EligibilityStatus::Eligible));
        assert_eq!(status("bad@acme.com"), Some(EligibilityStatus::IneligibleEmailInvalid));
        assert_eq!(status("flaky@acme.com"), Some(EligibilityStatus::PendingEmailValidation));
        assert!(state
            .field_changes
            .iter()
            .all(|change| change.actor == VERIFIER_ACTOR));
    }

    #[tokio::test]
    async fn unknown_dataset_is_an_error() {
        let store = MemoryStore::new();
        let err = verify_pending(&store, Arc::new(FakeVerifier), Uuid::new_v4(), 10, "test", Utc::now())
            .await
            .expect_err("missing dataset");
        assert!(err.to_string().contains("not found"));
    }
}
