//! Core domain model for the lead ingestion pipeline.

pub mod normalize;

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadflow-core";

/// Upper bound on the per-row error tail kept on a job record.
pub const MAX_JOB_ERRORS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownVariant::new("job status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ContactImport,
    ValidationResultImport,
    SubmissionImport,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ContactImport => "contact_import",
            JobType::ValidationResultImport => "validation_result_import",
            JobType::SubmissionImport => "submission_import",
        }
    }
}

impl FromStr for JobType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact_import" => Ok(JobType::ContactImport),
            "validation_result_import" => Ok(JobType::ValidationResultImport),
            "submission_import" => Ok(JobType::SubmissionImport),
            other => Err(UnknownVariant::new("job type", other)),
        }
    }
}

/// Caller-supplied override of the header auto-mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub csv_column: String,
    pub target_field: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub row: u64,
    pub message: String,
}

impl RowError {
    pub fn new(row: u64, message: impl Into<String>) -> Self {
        Self {
            row,
            message: message.into(),
        }
    }
}

/// One CSV upload and its processing state. Owned by the job runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub job_type: JobType,
    pub csv_text: String,
    pub field_mappings: Vec<FieldMapping>,
    pub update_mode: bool,
    pub status: JobStatus,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub errors: Vec<RowError>,
    pub resume_count: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionJob {
    pub fn new(
        dataset_id: Uuid,
        job_type: JobType,
        csv_text: String,
        field_mappings: Vec<FieldMapping>,
        update_mode: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            dataset_id,
            job_type,
            csv_text,
            field_mappings,
            update_mode,
            status: JobStatus::Pending,
            total_rows: 0,
            processed_rows: 0,
            success_count: 0,
            error_count: 0,
            errors: Vec::new(),
            resume_count: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Appends to the error tail, dropping the oldest entries past [`MAX_JOB_ERRORS`].
    pub fn record_error(&mut self, error: RowError) {
        push_bounded(&mut self.errors, error);
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.id,
            status: self.status,
            total_rows: self.total_rows,
            processed_rows: self.processed_rows,
            success_count: self.success_count,
            error_count: self.error_count,
            errors: self.errors.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

pub fn push_bounded(errors: &mut Vec<RowError>, error: RowError) {
    errors.push(error);
    if errors.len() > MAX_JOB_ERRORS {
        let overflow = errors.len() - MAX_JOB_ERRORS;
        errors.drain(..overflow);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub errors: Vec<RowError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJobRequest {
    pub dataset_id: Uuid,
    pub csv_text: String,
    #[serde(default)]
    pub field_mappings: Option<Vec<FieldMapping>>,
    #[serde(default)]
    pub update_mode: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCreated {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Title and geography rules for one campaign dataset.
///
/// Keyword lists match case-insensitively as substrings of the contact title.
/// Empty lists impose no restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignRules {
    pub allowed_title_keywords: Vec<String>,
    pub excluded_title_keywords: Vec<String>,
    pub allowed_countries: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: Uuid,
    pub name: String,
    pub rules: CampaignRules,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Account,
    Contact,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Account => "account",
            EntityType::Contact => "contact",
        }
    }
}

impl FromStr for EntityType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account" => Ok(EntityType::Account),
            "contact" => Ok(EntityType::Contact),
            other => Err(UnknownVariant::new("entity type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurvivorshipPolicy {
    PreferNewIfNotNull,
    Union,
    Merge,
    PreferNewNormalized,
}

impl SurvivorshipPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurvivorshipPolicy::PreferNewIfNotNull => "prefer_new_if_not_null",
            SurvivorshipPolicy::Union => "union",
            SurvivorshipPolicy::Merge => "merge",
            SurvivorshipPolicy::PreferNewNormalized => "prefer_new_normalized",
        }
    }
}

impl FromStr for SurvivorshipPolicy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefer_new_if_not_null" => Ok(SurvivorshipPolicy::PreferNewIfNotNull),
            "union" => Ok(SurvivorshipPolicy::Union),
            "merge" => Ok(SurvivorshipPolicy::Merge),
            "prefer_new_normalized" => Ok(SurvivorshipPolicy::PreferNewNormalized),
            other => Err(UnknownVariant::new("survivorship policy", other)),
        }
    }
}

/// Where an incoming record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_system: String,
    pub source_record_id: Option<String>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub actor: String,
}

/// Append-only audit row; one per distinct field change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub field_key: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub source_system: String,
    pub actor: String,
    pub policy: SurvivorshipPolicy,
    pub created_at: DateTime<Utc>,
}

/// Free-form custom columns. Merges shallowly with incoming keys winning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomFields(BTreeMap<String, String>);

impl CustomFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn merged(&self, incoming: &CustomFields) -> CustomFields {
        let mut out = self.0.clone();
        for (k, v) in &incoming.0 {
            out.insert(k.clone(), v.clone());
        }
        CustomFields(out)
    }
}

impl FromIterator<(String, String)> for CustomFields {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        CustomFields(iter.into_iter().collect())
    }
}

/// Canonical company record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub name_normalized: String,
    pub domain: Option<String>,
    pub domain_normalized: Option<String>,
    pub phone: Option<String>,
    pub phone_e164: Option<String>,
    pub industry: Option<String>,
    pub hq_street: Option<String>,
    pub hq_city: Option<String>,
    pub hq_state: Option<String>,
    pub hq_postal_code: Option<String>,
    pub hq_country: Option<String>,
    pub tags: Vec<String>,
    pub tech_stack: Vec<String>,
    pub custom_fields: CustomFields,
    pub source_system: Option<String>,
    pub source_record_id: Option<String>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        let name = name.into();
        let name_normalized = normalize::normalize_company_key(&name).unwrap_or_default();
        Self {
            id: Uuid::new_v4(),
            name,
            name_normalized,
            domain: None,
            domain_normalized: None,
            phone: None,
            phone_e164: None,
            industry: None,
            hq_street: None,
            hq_city: None,
            hq_state: None,
            hq_postal_code: None,
            hq_country: None,
            tags: Vec::new(),
            tech_stack: Vec::new(),
            custom_fields: CustomFields::new(),
            source_system: None,
            source_record_id: None,
            source_updated_at: None,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Canonical person record, weakly linked to an [`Account`] by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub account_id: Option<Uuid>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: Option<String>,
    pub full_name_normalized: Option<String>,
    pub email: Option<String>,
    pub email_normalized: Option<String>,
    pub phone: Option<String>,
    pub phone_e164: Option<String>,
    pub title: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub linkedin_url: Option<String>,
    pub cav_id: Option<String>,
    pub cav_user_id: Option<String>,
    pub topics: Vec<String>,
    pub custom_fields: CustomFields,
    pub suppressed: bool,
    pub suppression_reason: Option<String>,
    pub eligibility_status: EligibilityStatus,
    pub eligibility_reason: Option<String>,
    pub email_validation: Option<EmailValidationStatus>,
    pub source_system: Option<String>,
    pub source_record_id: Option<String>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    pub fn new(dataset_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            dataset_id,
            account_id: None,
            first_name: None,
            last_name: None,
            full_name: None,
            full_name_normalized: None,
            email: None,
            email_normalized: None,
            phone: None,
            phone_e164: None,
            title: None,
            city: None,
            state: None,
            postal_code: None,
            country: None,
            linkedin_url: None,
            cav_id: None,
            cav_user_id: None,
            topics: Vec::new(),
            custom_fields: CustomFields::new(),
            suppressed: false,
            suppression_reason: None,
            eligibility_status: EligibilityStatus::PendingEmailValidation,
            eligibility_reason: None,
            email_validation: None,
            source_system: None,
            source_record_id: None,
            source_updated_at: None,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Joins first and last name when no full name was supplied.
pub fn derive_full_name(first: Option<&str>, last: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [first, last]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EligibilityStatus {
    #[serde(rename = "Eligible")]
    Eligible,
    #[serde(rename = "Ineligible_Geography")]
    IneligibleGeography,
    #[serde(rename = "Ineligible_Title")]
    IneligibleTitle,
    #[serde(rename = "Ineligible_Email_Invalid")]
    IneligibleEmailInvalid,
    #[serde(rename = "Ineligible_Email_Disposable")]
    IneligibleEmailDisposable,
    #[serde(rename = "Ineligible_Email_Risky")]
    IneligibleEmailRisky,
    #[serde(rename = "Ineligible_Email_Accept_All")]
    IneligibleEmailAcceptAll,
    #[serde(rename = "Pending_Email_Validation")]
    PendingEmailValidation,
    #[serde(rename = "Ineligible_Recently_Submitted")]
    IneligibleRecentlySubmitted,
    #[serde(rename = "Excluded")]
    Excluded,
}

impl EligibilityStatus {
    pub const ALL: [EligibilityStatus; 10] = [
        EligibilityStatus::Eligible,
        EligibilityStatus::IneligibleGeography,
        EligibilityStatus::IneligibleTitle,
        EligibilityStatus::IneligibleEmailInvalid,
        EligibilityStatus::IneligibleEmailDisposable,
        EligibilityStatus::IneligibleEmailRisky,
        EligibilityStatus::IneligibleEmailAcceptAll,
        EligibilityStatus::PendingEmailValidation,
        EligibilityStatus::IneligibleRecentlySubmitted,
        EligibilityStatus::Excluded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EligibilityStatus::Eligible => "Eligible",
            EligibilityStatus::IneligibleGeography => "Ineligible_Geography",
            EligibilityStatus::IneligibleTitle => "Ineligible_Title",
            EligibilityStatus::IneligibleEmailInvalid => "Ineligible_Email_Invalid",
            EligibilityStatus::IneligibleEmailDisposable => "Ineligible_Email_Disposable",
            EligibilityStatus::IneligibleEmailRisky => "Ineligible_Email_Risky",
            EligibilityStatus::IneligibleEmailAcceptAll => "Ineligible_Email_Accept_All",
            EligibilityStatus::PendingEmailValidation => "Pending_Email_Validation",
            EligibilityStatus::IneligibleRecentlySubmitted => "Ineligible_Recently_Submitted",
            EligibilityStatus::Excluded => "Excluded",
        }
    }

    /// States that an email-verification outcome is allowed to replace.
    pub fn accepts_email_outcome(&self) -> bool {
        matches!(
            self,
            EligibilityStatus::Eligible
                | EligibilityStatus::PendingEmailValidation
                | EligibilityStatus::IneligibleEmailInvalid
                | EligibilityStatus::IneligibleEmailDisposable
                | EligibilityStatus::IneligibleEmailRisky
                | EligibilityStatus::IneligibleEmailAcceptAll
        )
    }
}

impl FromStr for EligibilityStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EligibilityStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("eligibility status", s))
    }
}

/// Result vocabulary of the external email-verification service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailValidationStatus {
    Ok,
    Invalid,
    Unknown,
    AcceptAll,
    Risky,
    Disposable,
}

impl EmailValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailValidationStatus::Ok => "ok",
            EmailValidationStatus::Invalid => "invalid",
            EmailValidationStatus::Unknown => "unknown",
            EmailValidationStatus::AcceptAll => "accept_all",
            EmailValidationStatus::Risky => "risky",
            EmailValidationStatus::Disposable => "disposable",
        }
    }

    pub fn eligibility(&self) -> EligibilityStatus {
        match self {
            EmailValidationStatus::Ok => EligibilityStatus::Eligible,
            EmailValidationStatus::Invalid => EligibilityStatus::IneligibleEmailInvalid,
            EmailValidationStatus::Disposable => EligibilityStatus::IneligibleEmailDisposable,
            EmailValidationStatus::Risky => EligibilityStatus::IneligibleEmailRisky,
            EmailValidationStatus::AcceptAll => EligibilityStatus::IneligibleEmailAcceptAll,
            EmailValidationStatus::Unknown => EligibilityStatus::PendingEmailValidation,
        }
    }
}

impl FromStr for EmailValidationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match key.as_str() {
            "ok" | "valid" | "deliverable" => Ok(EmailValidationStatus::Ok),
            "invalid" | "undeliverable" => Ok(EmailValidationStatus::Invalid),
            "unknown" => Ok(EmailValidationStatus::Unknown),
            "accept_all" | "catch_all" | "catchall" => Ok(EmailValidationStatus::AcceptAll),
            "risky" => Ok(EmailValidationStatus::Risky),
            "disposable" => Ok(EmailValidationStatus::Disposable),
            _ => Err(UnknownVariant::new("email validation status", s)),
        }
    }
}

/// Which exact-match rule fired for a suppressed contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionRule {
    Email,
    CavId,
    CavUserId,
    NameCompany,
}

impl SuppressionRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressionRule::Email => "email",
            SuppressionRule::CavId => "cav_id",
            SuppressionRule::CavUserId => "cav_user_id",
            SuppressionRule::NameCompany => "name_company",
        }
    }
}

/// A suppressed identity, global when `dataset_id` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub id: Uuid,
    pub dataset_id: Option<Uuid>,
    pub email_normalized: Option<String>,
    pub cav_id: Option<String>,
    pub cav_user_id: Option<String>,
    pub full_name_normalized: Option<String>,
    pub company_normalized: Option<String>,
    pub name_company_hash: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SuppressionEntry {
    /// Normalizes every identity field; the name/company hash exists only when both parts do.
    pub fn new(
        dataset_id: Option<Uuid>,
        email: Option<&str>,
        cav_id: Option<&str>,
        cav_user_id: Option<&str>,
        full_name: Option<&str>,
        company: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let full_name_normalized = full_name.and_then(normalize::normalize_name);
        let company_normalized = company.and_then(normalize::normalize_name);
        let name_company_hash = match (&full_name_normalized, &company_normalized) {
            (Some(n), Some(c)) => normalize::compute_name_company_hash(n, c),
            _ => None,
        };
        Self {
            id: Uuid::new_v4(),
            dataset_id,
            email_normalized: email.and_then(normalize::normalize_email),
            cav_id: cav_id.and_then(normalize::normalize_external_id),
            cav_user_id: cav_user_id.and_then(normalize::normalize_external_id),
            full_name_normalized,
            company_normalized,
            name_company_hash,
            reason: None,
            created_at: now,
        }
    }
}

/// Exact-match keys a contact is probed with against the suppression list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuppressionKeys {
    pub email: Option<String>,
    pub cav_id: Option<String>,
    pub cav_user_id: Option<String>,
    pub name_company_hash: Option<String>,
}

impl SuppressionKeys {
    pub fn for_contact(contact: &Contact, company_name: Option<&str>) -> Self {
        let name_company_hash = match (contact.full_name.as_deref(), company_name) {
            (Some(name), Some(company)) => normalize::compute_name_company_hash(name, company),
            _ => None,
        };
        Self {
            email: contact.email.as_deref().and_then(normalize::normalize_email),
            cav_id: contact.cav_id.as_deref().and_then(normalize::normalize_external_id),
            cav_user_id: contact
                .cav_user_id
                .as_deref()
                .and_then(normalize::normalize_external_id),
            name_company_hash,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.cav_id.is_none()
            && self.cav_user_id.is_none()
            && self.name_company_hash.is_none()
    }
}

/// A delivered lead; drives the recent-submission exclusion window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadSubmission {
    pub id: Uuid,
    pub dataset_id: Uuid,
    pub contact_id: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub submission_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z")
            .expect("ts")
            .with_timezone(&Utc)
    }

    #[test]
    fn job_error_tail_is_bounded_to_most_recent() {
        let mut job = IngestionJob::new(
            Uuid::new_v4(),
            JobType::ContactImport,
            "email\n".into(),
            vec![],
            false,
            now(),
        );
        for row in 1..=(MAX_JOB_ERRORS as u64 + 25) {
            job.record_error(RowError::new(row, "bad row"));
        }
        assert_eq!(job.errors.len(), MAX_JOB_ERRORS);
        assert_eq!(job.errors.first().map(|e| e.row), Some(26));
        assert_eq!(job.errors.last().map(|e| e.row), Some(125));
    }

    #[test]
    fn status_view_serializes_with_camel_case_keys() {
        let job = IngestionJob::new(
            Uuid::new_v4(),
            JobType::ContactImport,
            String::new(),
            vec![],
            true,
            now(),
        );
        let value = serde_json::to_value(job.status_view()).expect("json");
        assert_eq!(value["status"], "pending");
        assert!(value.get("processedRows").is_some());
        assert!(value.get("finishedAt").is_some());
    }

    #[test]
    fn custom_fields_merge_prefers_incoming_keys() {
        let mut existing = CustomFields::new();
        existing.insert("region", "emea");
        existing.insert("tier", "gold");
        let mut incoming = CustomFields::new();
        incoming.insert("tier", "platinum");
        incoming.insert("owner", "jd");

        let merged = existing.merged(&incoming);
        assert_eq!(merged.get("region"), Some("emea"));
        assert_eq!(merged.get("tier"), Some("platinum"));
        assert_eq!(merged.get("owner"), Some("jd"));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn eligibility_strings_round_trip_through_from_str() {
        for status in EligibilityStatus::ALL {
            assert_eq!(status.as_str().parse::<EligibilityStatus>(), Ok(status));
        }
        let json = serde_json::to_string(&EligibilityStatus::IneligibleRecentlySubmitted).expect("json");
        assert_eq!(json, "\"Ineligible_Recently_Submitted\"");
    }

    #[test]
    fn validation_status_aliases_and_mapping() {
        assert_eq!("Accept-All".parse::<EmailValidationStatus>(), Ok(EmailValidationStatus::AcceptAll));
        assert_eq!("valid".parse::<EmailValidationStatus>(), Ok(EmailValidationStatus::Ok));
        assert!("maybe".parse::<EmailValidationStatus>().is_err());
        assert_eq!(
            EmailValidationStatus::Unknown.eligibility(),
            EligibilityStatus::PendingEmailValidation
        );
        assert_eq!(
            EmailValidationStatus::Disposable.eligibility(),
            EligibilityStatus::IneligibleEmailDisposable
        );
    }

    #[test]
    fn suppression_entry_hash_requires_both_name_and_company() {
        let only_name = SuppressionEntry::new(None, None, None, None, Some("John Smith"), None, now());
        assert!(only_name.name_company_hash.is_none());
        let only_company = SuppressionEntry::new(None, None, None, None, None, Some("Acme"), now());
        assert!(only_company.name_company_hash.is_none());
        let both = SuppressionEntry::new(
            None,
            Some(" JS@Acme.com "),
            None,
            None,
            Some("John  Smith"),
            Some("ACME"),
            now(),
        );
        assert_eq!(both.email_normalized.as_deref(), Some("js@acme.com"));
        assert_eq!(
            both.name_company_hash,
            normalize::compute_name_company_hash("john smith", "acme")
        );
    }

    #[test]
    fn suppression_keys_need_name_and_company_for_hash() {
        let mut contact = Contact::new(Uuid::new_v4(), now());
        contact.email = Some("Ada@Acme.com".into());
        contact.full_name = Some("Ada Lovelace".into());
        let without_company = SuppressionKeys::for_contact(&contact, None);
        assert_eq!(without_company.email.as_deref(), Some("ada@acme.com"));
        assert!(without_company.name_company_hash.is_none());

        let with_company = SuppressionKeys::for_contact(&contact, Some("Acme"));
        assert_eq!(
            with_company.name_company_hash,
            normalize::compute_name_company_hash("ada lovelace", "acme")
        );
        assert!(SuppressionKeys::default().is_empty());
    }

    #[test]
    fn full_name_is_derived_from_parts() {
        assert_eq!(derive_full_name(Some(" Ada "), Some("Lovelace")).as_deref(), Some("Ada Lovelace"));
        assert_eq!(derive_full_name(None, Some("Lovelace")).as_deref(), Some("Lovelace"));
        assert_eq!(derive_full_name(Some(""), None), None);
    }
}
