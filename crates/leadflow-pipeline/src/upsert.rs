//! Natural-key upserts with field-level survivorship and change logging.

use chrono::{DateTime, Utc};
use leadflow_adapters::{AccountDraft, ContactDraft, SubmissionDraft, ValidationDraft};
use leadflow_core::{
    derive_full_name, normalize, Account, Contact, CustomFields, Dataset, EligibilityStatus,
    EntityType, FieldChange, LeadSubmission, Provenance, SuppressionKeys, SuppressionRule,
    SurvivorshipPolicy,
};
use leadflow_storage::{IngestTx, StoreError};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::eligibility::{evaluate_eligibility, reconcile};
use crate::resolver::{resolve_account, AccountQuery, ResolutionCache};
use crate::suppression::match_suppression;

/// Why a row did not succeed.
#[derive(Debug)]
pub enum RowFailure {
    /// Bad data; counted against the row, the batch goes on.
    Row(String),
    /// Storage failure; the whole batch rolls back.
    Batch(StoreError),
}

impl From<StoreError> for RowFailure {
    fn from(err: StoreError) -> Self {
        RowFailure::Batch(err)
    }
}

impl RowFailure {
    pub fn row(message: impl Into<String>) -> Self {
        RowFailure::Row(message.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertAction {
    Created,
    Updated,
    Unchanged,
}

/// Everything a row handler needs besides the transaction.
#[derive(Debug, Clone)]
pub struct RowContext<'a> {
    pub dataset: &'a Dataset,
    pub update_mode: bool,
    pub provenance: Provenance,
    pub now: DateTime<Utc>,
}

impl RowContext<'_> {
    fn row_provenance(&self, record_id: Option<&str>, updated_at: Option<DateTime<Utc>>) -> Provenance {
        Provenance {
            source_record_id: record_id.map(str::to_string),
            source_updated_at: updated_at,
            ..self.provenance.clone()
        }
    }
}

/// Collects one [`FieldChange`] per field whose stored value actually changes.
pub struct Survivorship<'a> {
    entity_type: EntityType,
    entity_id: Uuid,
    provenance: &'a Provenance,
    now: DateTime<Utc>,
    changes: Vec<FieldChange>,
}

fn json_of<T: Serialize + ?Sized>(value: &T) -> Option<Value> {
    serde_json::to_value(value).ok().filter(|v| !v.is_null())
}

impl<'a> Survivorship<'a> {
    pub fn new(
        entity_type: EntityType,
        entity_id: Uuid,
        provenance: &'a Provenance,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_type,
            entity_id,
            provenance,
            now,
            changes: Vec::new(),
        }
    }

    fn log(&mut self, key: &str, old: Option<Value>, new: Option<Value>, policy: SurvivorshipPolicy) {
        self.changes.push(FieldChange {
            id: Uuid::new_v4(),
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            field_key: key.to_string(),
            old_value: old,
            new_value: new,
            source_system: self.provenance.source_system.clone(),
            actor: self.provenance.actor.clone(),
            policy,
            created_at: self.now,
        });
    }

    /// `prefer_new_if_not_null` for text fields.
    pub fn scalar(&mut self, key: &str, current: &mut Option<String>, incoming: Option<&str>) -> bool {
        let Some(incoming) = incoming.map(str::trim).filter(|v| !v.is_empty()) else {
            return false;
        };
        if current.as_deref() == Some(incoming) {
            return false;
        }
        let old = current.replace(incoming.to_string());
        self.log(
            key,
            old.map(Value::String),
            Some(Value::String(incoming.to_string())),
            SurvivorshipPolicy::PreferNewIfNotNull,
        );
        true
    }

    /// `prefer_new_normalized`: compares E.164 forms; unparseable input never overwrites.
    pub fn phone(
        &mut self,
        key: &str,
        raw: &mut Option<String>,
        e164: &mut Option<String>,
        incoming: Option<&str>,
    ) -> bool {
        let Some(incoming) = incoming.map(str::trim).filter(|v| !v.is_empty()) else {
            return false;
        };
        let Some(normalized) = normalize::normalize_phone_e164(incoming) else {
            return false;
        };
        if e164.as_deref() == Some(normalized.as_str()) {
            return false;
        }
        let old = e164.replace(normalized.clone());
        *raw = Some(incoming.to_string());
        self.log(
            key,
            old.map(Value::String),
            Some(Value::String(normalized)),
            SurvivorshipPolicy::PreferNewNormalized,
        );
        true
    }

    /// `union`: set semantics, written back only when something new arrives.
    pub fn union(&mut self, key: &str, current: &mut Vec<String>, incoming: &[String]) -> bool {
        let mut merged = current.clone();
        for value in normalize::normalize_tags(incoming.iter().map(String::as_str)) {
            if !merged.iter().any(|m| m.to_lowercase() == value) {
                merged.push(value);
            }
        }
        if merged.len() == current.len() {
            return false;
        }
        let old = std::mem::replace(current, merged);
        let new = json_of(&*current);
        self.log(key, json_of(&old), new, SurvivorshipPolicy::Union);
        true
    }

    /// `merge`: shallow, incoming keys win.
    pub fn merge(&mut self, key: &str, current: &mut CustomFields, incoming: &CustomFields) -> bool {
        let merged = current.merged(incoming);
        if merged == *current {
            return false;
        }
        let old = std::mem::replace(current, merged);
        let new = json_of(&*current);
        self.log(key, json_of(&old), new, SurvivorshipPolicy::Merge);
        true
    }

    /// Unconditional replacement for derived state (status flags, links).
    pub fn replace<T: PartialEq + Serialize>(
        &mut self,
        key: &str,
        current: &mut T,
        incoming: T,
        policy: SurvivorshipPolicy,
    ) -> bool {
        if *current == incoming {
            return false;
        }
        let old = std::mem::replace(current, incoming);
        let new = json_of(&*current);
        self.log(key, json_of(&old), new, policy);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<FieldChange> {
        self.changes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContactOutcome {
    pub contact_id: Uuid,
    pub account_id: Uuid,
    pub action: UpsertAction,
    pub account_action: UpsertAction,
    pub eligibility: EligibilityStatus,
    pub suppressed_by: Option<SuppressionRule>,
}

fn merge_account(audit: &mut Survivorship<'_>, account: &mut Account, draft: &AccountDraft, query: &AccountQuery) {
    // The natural key is only ever filled in, never replaced.
    if account.domain_normalized.is_none() {
        if let Some(domain) = &query.domain {
            audit.replace(
                "domain",
                &mut account.domain_normalized,
                Some(domain.clone()),
                SurvivorshipPolicy::PreferNewIfNotNull,
            );
            account.domain = Some(domain.clone());
        }
    }
    audit.phone("phone", &mut account.phone, &mut account.phone_e164, draft.phone.as_deref());
    audit.scalar("industry", &mut account.industry, draft.industry.as_deref());
    audit.scalar("hq_street", &mut account.hq_street, draft.hq_street.as_deref());
    audit.scalar("hq_city", &mut account.hq_city, draft.hq_city.as_deref());
    audit.scalar("hq_state", &mut account.hq_state, draft.hq_state.as_deref());
    audit.scalar("hq_postal_code", &mut account.hq_postal_code, draft.hq_postal_code.as_deref());
    audit.scalar("hq_country", &mut account.hq_country, draft.hq_country.as_deref());
    audit.union("tags", &mut account.tags, &draft.tags);
    audit.union("tech_stack", &mut account.tech_stack, &draft.tech_stack);
}

fn incoming_full_name(draft: &ContactDraft) -> Option<String> {
    draft
        .full_name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .or_else(|| derive_full_name(draft.first_name.as_deref(), draft.last_name.as_deref()))
}

fn merge_contact(audit: &mut Survivorship<'_>, contact: &mut Contact, draft: &ContactDraft) {
    let email_before = contact.email_normalized.clone();
    audit.scalar("email", &mut contact.email, draft.email.as_deref());
    contact.email_normalized = contact.email.as_deref().and_then(normalize::normalize_email);
    if contact.email_normalized != email_before {
        contact.email_validation = None;
    }
    audit.scalar("first_name", &mut contact.first_name, draft.first_name.as_deref());
    audit.scalar("last_name", &mut contact.last_name, draft.last_name.as_deref());
    audit.scalar("full_name", &mut contact.full_name, incoming_full_name(draft).as_deref());
    contact.full_name_normalized = contact.full_name.as_deref().and_then(normalize::normalize_name);
    audit.phone("phone", &mut contact.phone, &mut contact.phone_e164, draft.phone.as_deref());
    audit.scalar("title", &mut contact.title, draft.title.as_deref());
    audit.scalar("city", &mut contact.city, draft.city.as_deref());
    audit.scalar("state", &mut contact.state, draft.state.as_deref());
    audit.scalar("postal_code", &mut contact.postal_code, draft.postal_code.as_deref());
    audit.scalar("country", &mut contact.country, draft.country.as_deref());
    audit.scalar("linkedin_url", &mut contact.linkedin_url, draft.linkedin_url.as_deref());
    audit.scalar("cav_id", &mut contact.cav_id, draft.cav_id.as_deref());
    audit.scalar("cav_user_id", &mut contact.cav_user_id, draft.cav_user_id.as_deref());
    audit.scalar("source_record_id", &mut contact.source_record_id, draft.source_record_id.as_deref());
    if draft.source_updated_at.is_some() {
        audit.replace(
            "source_updated_at",
            &mut contact.source_updated_at,
            draft.source_updated_at,
            SurvivorshipPolicy::PreferNewIfNotNull,
        );
    }
    audit.union("topics", &mut contact.topics, &draft.topics);
    audit.merge("custom_fields", &mut contact.custom_fields, &draft.custom_fields);
}

fn new_contact(ctx: &RowContext<'_>, draft: &ContactDraft, account_id: Uuid) -> Contact {
    let mut contact = Contact::new(ctx.dataset.id, ctx.now);
    contact.account_id = Some(account_id);
    contact.first_name = draft.first_name.clone();
    contact.last_name = draft.last_name.clone();
    contact.full_name = incoming_full_name(draft);
    contact.full_name_normalized = contact.full_name.as_deref().and_then(normalize::normalize_name);
    contact.email = draft.email.as_deref().map(str::trim).map(str::to_string);
    contact.email_normalized = draft.email.as_deref().and_then(normalize::normalize_email);
    contact.phone = draft.phone.clone();
    contact.phone_e164 = draft.phone.as_deref().and_then(normalize::normalize_phone_e164);
    contact.title = draft.title.clone();
    contact.city = draft.city.clone();
    contact.state = draft.state.clone();
    contact.postal_code = draft.postal_code.clone();
    contact.country = draft.country.clone();
    contact.linkedin_url = draft.linkedin_url.clone();
    contact.cav_id = draft.cav_id.clone();
    contact.cav_user_id = draft.cav_user_id.clone();
    contact.topics = normalize::normalize_tags(draft.topics.iter().map(String::as_str));
    contact.custom_fields = draft.custom_fields.clone();
    contact.source_system = Some(ctx.provenance.source_system.clone());
    contact.source_record_id = draft.source_record_id.clone();
    contact.source_updated_at = draft.source_updated_at;
    contact
}

/// Resolves the account, upserts the contact, and refreshes suppression and eligibility.
pub async fn import_contact<T: IngestTx>(
    tx: &mut T,
    cache: &mut ResolutionCache,
    ctx: &RowContext<'_>,
    draft: &ContactDraft,
) -> Result<ContactOutcome, RowFailure> {
    let provenance = ctx.row_provenance(draft.source_record_id.as_deref(), draft.source_updated_at);
    let query = AccountQuery::from_draft(&draft.account, draft.email.as_deref());
    let resolution = resolve_account(
        tx,
        cache,
        &draft.account,
        &query,
        &provenance.source_system,
        ctx.now,
    )
    .await?
    .ok_or_else(|| RowFailure::row("cannot resolve account: no company name or domain"))?;

    let mut account = resolution.account.clone();
    let account_action = if resolution.created() {
        UpsertAction::Created
    } else if ctx.update_mode {
        let mut audit = Survivorship::new(EntityType::Account, account.id, &provenance, ctx.now);
        merge_account(&mut audit, &mut account, &draft.account, &query);
        if audit.is_empty() {
            UpsertAction::Unchanged
        } else {
            account.updated_at = ctx.now;
            tx.update_account(&account).await?;
            tx.append_field_changes(&audit.into_changes()).await?;
            UpsertAction::Updated
        }
    } else {
        UpsertAction::Unchanged
    };

    let email_normalized = draft.email.as_deref().and_then(normalize::normalize_email);
    let existing = match &email_normalized {
        Some(email) => tx.contact_by_email(ctx.dataset.id, email).await?,
        None => {
            let name = incoming_full_name(draft)
                .as_deref()
                .and_then(normalize::normalize_name)
                .ok_or_else(|| RowFailure::row("missing required field: email or name"))?;
            tx.contact_by_name(ctx.dataset.id, &name, Some(account.id)).await?
        }
    };

    let created = existing.is_none();
    let mut contact = match existing {
        Some(contact) => contact,
        None => new_contact(ctx, draft, account.id),
    };
    let mut audit = Survivorship::new(EntityType::Contact, contact.id, &provenance, ctx.now);
    if !created {
        if ctx.update_mode {
            merge_contact(&mut audit, &mut contact, draft);
        }
        if contact.account_id.is_none() || ctx.update_mode {
            audit.replace(
                "account_id",
                &mut contact.account_id,
                Some(account.id),
                SurvivorshipPolicy::PreferNewIfNotNull,
            );
        }
    }

    let company = draft.account.name.as_deref().unwrap_or(account.name.as_str());
    let keys = SuppressionKeys::for_contact(&contact, Some(company));
    let suppression = if keys.is_empty() {
        None
    } else {
        let entries = tx.suppression_candidates(ctx.dataset.id, &keys).await?;
        match_suppression(&keys, &entries)
    };
    if let Some(hit) = &suppression {
        audit.replace("suppressed", &mut contact.suppressed, true, SurvivorshipPolicy::PreferNewIfNotNull);
        audit.replace(
            "suppression_reason",
            &mut contact.suppression_reason,
            Some(hit.describe()),
            SurvivorshipPolicy::PreferNewIfNotNull,
        );
    }
    let suppression_reason = contact
        .suppressed
        .then(|| contact.suppression_reason.clone().unwrap_or_else(|| "suppressed".to_string()));

    let evaluated = evaluate_eligibility(
        contact.title.as_deref(),
        contact.country.as_deref(),
        &ctx.dataset.rules,
        contact.email.as_deref(),
    );
    let decision = reconcile(
        evaluated,
        suppression_reason.as_deref(),
        contact.eligibility_status,
        contact.email_validation,
    );
    audit.replace(
        "eligibility_status",
        &mut contact.eligibility_status,
        decision.status,
        SurvivorshipPolicy::PreferNewIfNotNull,
    );
    contact.eligibility_reason = decision.reason;

    let action = if created {
        tx.insert_contact(&contact).await?;
        UpsertAction::Created
    } else if audit.is_empty() {
        UpsertAction::Unchanged
    } else {
        contact.source_system = Some(provenance.source_system.clone());
        contact.updated_at = ctx.now;
        tx.update_contact(&contact).await?;
        tx.append_field_changes(&audit.into_changes()).await?;
        UpsertAction::Updated
    };

    Ok(ContactOutcome {
        contact_id: contact.id,
        account_id: account.id,
        action,
        account_action,
        eligibility: contact.eligibility_status,
        suppressed_by: suppression.map(|hit| hit.rule),
    })
}

async fn contact_for_email<T: IngestTx>(
    tx: &mut T,
    dataset_id: Uuid,
    email: &str,
) -> Result<Contact, RowFailure> {
    let normalized = normalize::normalize_email(email)
        .ok_or_else(|| RowFailure::row("missing required field: email"))?;
    tx.contact_by_email(dataset_id, &normalized)
        .await?
        .ok_or_else(|| RowFailure::row(format!("no contact with email '{normalized}' in dataset")))
}

/// Stores a verifier outcome and moves eligibility when the current state allows it.
pub async fn apply_validation_result<T: IngestTx>(
    tx: &mut T,
    ctx: &RowContext<'_>,
    draft: &ValidationDraft,
) -> Result<UpsertAction, RowFailure> {
    let mut contact = contact_for_email(tx, ctx.dataset.id, &draft.email).await?;
    let mut audit = Survivorship::new(EntityType::Contact, contact.id, &ctx.provenance, ctx.now);
    audit.replace(
        "email_validation",
        &mut contact.email_validation,
        Some(draft.status),
        SurvivorshipPolicy::PreferNewIfNotNull,
    );
    if !contact.suppressed && contact.eligibility_status.accepts_email_outcome() {
        let moved = audit.replace(
            "eligibility_status",
            &mut contact.eligibility_status,
            draft.status.eligibility(),
            SurvivorshipPolicy::PreferNewIfNotNull,
        );
        if moved {
            contact.eligibility_reason = Some(format!("email validation: {}", draft.status.as_str()));
        }
    }
    if audit.is_empty() {
        return Ok(UpsertAction::Unchanged);
    }
    contact.updated_at = ctx.now;
    tx.update_contact(&contact).await?;
    tx.append_field_changes(&audit.into_changes()).await?;
    Ok(UpsertAction::Updated)
}

/// Inserts a delivery record; replays of the same record are no-ops.
pub async fn record_submission<T: IngestTx>(
    tx: &mut T,
    ctx: &RowContext<'_>,
    draft: &SubmissionDraft,
) -> Result<UpsertAction, RowFailure> {
    let contact = contact_for_email(tx, ctx.dataset.id, &draft.email).await?;
    let submission = LeadSubmission {
        id: Uuid::new_v4(),
        dataset_id: ctx.dataset.id,
        contact_id: contact.id,
        submitted_at: draft.submitted_at,
        submission_ref: draft.submission_ref.clone(),
        created_at: ctx.now,
    };
    if tx.insert_submission(&submission).await? {
        Ok(UpsertAction::Created)
    } else {
        Ok(UpsertAction::Unchanged)
    }
}
