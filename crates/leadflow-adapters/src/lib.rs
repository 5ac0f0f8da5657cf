//! CSV contract + per-job-type row adapters.

pub mod mapping;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use csv::{ReaderBuilder, Trim};
use leadflow_core::{CustomFields, EmailValidationStatus, FieldMapping, JobType};
use thiserror::Error;
use tracing::debug;

pub use mapping::{validate_alias_table, CanonicalField, ColumnMap, ColumnTarget, MappedRow};

pub const CRATE_NAME: &str = "leadflow-adapters";

const CANDIDATE_DELIMITERS: [u8; 4] = [b',', b'\t', b'|', b';'];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("csv has no header row")]
    MissingHeader,
    #[error("csv parse error: {0}")]
    Csv(#[from] csv::Error),
    #[error("unknown mapping target '{0}'")]
    UnknownTarget(String),
    #[error("{job_type} requires a column for {needed}")]
    MissingColumn {
        job_type: &'static str,
        needed: &'static str,
    },
    #[error("malformed header alias '{0}'")]
    DuplicateAlias(String),
    #[error("{0}")]
    Row(String),
}

impl AdapterError {
    fn row(message: impl Into<String>) -> Self {
        AdapterError::Row(message.into())
    }
}

/// Picks the candidate delimiter occurring most often in the header line, ignoring quoted text.
///
/// Ties go to the earlier candidate, so a single-column file reads as comma-separated.
pub fn detect_delimiter(text: &str) -> u8 {
    let header = text.lines().next().unwrap_or_default();
    let mut counts = [0usize; CANDIDATE_DELIMITERS.len()];
    let mut in_quotes = false;
    for byte in header.bytes() {
        if byte == b'"' {
            in_quotes = !in_quotes;
            continue;
        }
        if in_quotes {
            continue;
        }
        if let Some(idx) = CANDIDATE_DELIMITERS.iter().position(|d| *d == byte) {
            counts[idx] += 1;
        }
    }
    let mut best = 0;
    for idx in 1..counts.len() {
        if counts[idx] > counts[best] {
            best = idx;
        }
    }
    CANDIDATE_DELIMITERS[best]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Parses the whole payload up front. Any malformed record, including one whose
/// field count differs from the header, fails the entire table.
pub fn parse_csv(text: &str) -> Result<CsvTable, AdapterError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    if text.trim().is_empty() {
        return Err(AdapterError::MissingHeader);
    }
    let mut reader = ReaderBuilder::new()
        .delimiter(detect_delimiter(text))
        .has_headers(true)
        .flexible(false)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if headers.iter().all(|h| h.is_empty()) {
        return Err(AdapterError::MissingHeader);
    }
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(CsvTable { headers, rows })
}

/// A parsed payload with its column map, ready for row-by-row adaptation.
#[derive(Debug, Clone)]
pub struct PreparedCsv {
    pub table: CsvTable,
    pub columns: ColumnMap,
}

impl PreparedCsv {
    pub fn total_rows(&self) -> usize {
        self.table.rows.len()
    }

    /// Data rows from `skip` onwards, numbered from 1 in file order.
    pub fn rows_from(&self, skip: usize) -> impl Iterator<Item = MappedRow> + '_ {
        self.table
            .rows
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(idx, record)| self.columns.apply(idx as u64 + 1, record))
    }
}

/// Parses, maps, and checks that the columns a job type needs are present.
pub fn prepare(
    job_type: JobType,
    csv_text: &str,
    overrides: &[FieldMapping],
) -> Result<PreparedCsv, AdapterError> {
    let table = parse_csv(csv_text)?;
    let columns = ColumnMap::build(&table.headers, overrides)?;
    debug!(
        job_type = job_type.as_str(),
        rows = table.rows.len(),
        columns = ?columns.targets(),
        "csv prepared"
    );
    adapter_for_job_type(job_type).check_columns(&columns)?;
    Ok(PreparedCsv { table, columns })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountDraft {
    pub name: Option<String>,
    pub domain: Option<String>,
    pub phone: Option<String>,
    pub industry: Option<String>,
    pub hq_street: Option<String>,
    pub hq_city: Option<String>,
    pub hq_state: Option<String>,
    pub hq_postal_code: Option<String>,
    pub hq_country: Option<String>,
    pub tags: Vec<String>,
    pub tech_stack: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContactDraft {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
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
    pub source_record_id: Option<String>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub account: AccountDraft,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationDraft {
    pub email: String,
    pub status: EmailValidationStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionDraft {
    pub email: String,
    pub submitted_at: DateTime<Utc>,
    pub submission_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RowDraft {
    Contact(Box<ContactDraft>),
    ValidationResult(ValidationDraft),
    Submission(SubmissionDraft),
}

/// Turns a mapped row into a typed draft. Errors are row-level and never abort the job.
pub trait RowAdapter: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Rejects the whole file when a column the job type cannot work without is absent.
    fn check_columns(&self, columns: &ColumnMap) -> Result<(), AdapterError>;

    fn adapt(&self, row: &MappedRow) -> Result<RowDraft, AdapterError>;
}

#[derive(Debug, Clone, Copy)]
struct ContactRowAdapter;

#[derive(Debug, Clone, Copy)]
struct ValidationRowAdapter;

#[derive(Debug, Clone, Copy)]
struct SubmissionRowAdapter;

pub fn adapter_for_job_type(job_type: JobType) -> Box<dyn RowAdapter> {
    match job_type {
        JobType::ContactImport => Box::new(ContactRowAdapter),
        JobType::ValidationResultImport => Box::new(ValidationRowAdapter),
        JobType::SubmissionImport => Box::new(SubmissionRowAdapter),
    }
}

impl RowAdapter for ContactRowAdapter {
    fn job_type(&self) -> JobType {
        JobType::ContactImport
    }

    fn check_columns(&self, columns: &ColumnMap) -> Result<(), AdapterError> {
        let identifying = [
            CanonicalField::Email,
            CanonicalField::FullName,
            CanonicalField::FirstName,
            CanonicalField::LastName,
        ];
        if identifying.iter().any(|f| columns.has(*f)) {
            Ok(())
        } else {
            Err(AdapterError::MissingColumn {
                job_type: JobType::ContactImport.as_str(),
                needed: "email or a name",
            })
        }
    }

    fn adapt(&self, row: &MappedRow) -> Result<RowDraft, AdapterError> {
        use CanonicalField as F;
        if row.is_blank() {
            return Err(AdapterError::row("empty row"));
        }
        let email = row.owned(F::Email);
        if let Some(email) = email.as_deref() {
            check_email_shape(email)?;
        }
        let has_name = [F::FullName, F::FirstName, F::LastName]
            .iter()
            .any(|f| row.get(*f).is_some());
        if email.is_none() && !has_name {
            return Err(AdapterError::row("missing required field: email or name"));
        }
        let source_updated_at = match row.get(F::SourceUpdatedAt) {
            Some(raw) => Some(
                parse_timestamp(raw)
                    .ok_or_else(|| AdapterError::row(format!("unparseable source_updated_at '{raw}'")))?,
            ),
            None => None,
        };

        Ok(RowDraft::Contact(Box::new(ContactDraft {
            first_name: row.owned(F::FirstName),
            last_name: row.owned(F::LastName),
            full_name: row.owned(F::FullName),
            email,
            phone: row.owned(F::Phone),
            title: row.owned(F::Title),
            city: row.owned(F::City),
            state: row.owned(F::State),
            postal_code: row.owned(F::PostalCode),
            country: row.owned(F::Country),
            linkedin_url: row.owned(F::LinkedinUrl),
            cav_id: row.owned(F::CavId),
            cav_user_id: row.owned(F::CavUserId),
            topics: row.get(F::Topics).map(split_list).unwrap_or_default(),
            custom_fields: row.custom.clone(),
            source_record_id: row.owned(F::SourceRecordId),
            source_updated_at,
            account: AccountDraft {
                name: row.owned(F::CompanyName),
                domain: row.owned(F::CompanyDomain),
                phone: row.owned(F::CompanyPhone),
                industry: row.owned(F::Industry),
                hq_street: row.owned(F::HqStreet),
                hq_city: row.owned(F::HqCity),
                hq_state: row.owned(F::HqState),
                hq_postal_code: row.owned(F::HqPostalCode),
                hq_country: row.owned(F::HqCountry),
                tags: row.get(F::Tags).map(split_list).unwrap_or_default(),
                tech_stack: row.get(F::TechStack).map(split_list).unwrap_or_default(),
            },
        })))
    }
}

impl RowAdapter for ValidationRowAdapter {
    fn job_type(&self) -> JobType {
        JobType::ValidationResultImport
    }

    fn check_columns(&self, columns: &ColumnMap) -> Result<(), AdapterError> {
        require_columns(
            self.job_type(),
            columns,
            &[
                (CanonicalField::Email, "email"),
                (CanonicalField::ValidationStatus, "validation status"),
            ],
        )
    }

    fn adapt(&self, row: &MappedRow) -> Result<RowDraft, AdapterError> {
        let email = required(row, CanonicalField::Email)?;
        check_email_shape(&email)?;
        let raw_status = required(row, CanonicalField::ValidationStatus)?;
        let status = raw_status
            .parse::<EmailValidationStatus>()
            .map_err(|e| AdapterError::row(e.to_string()))?;
        Ok(RowDraft::ValidationResult(ValidationDraft { email, status }))
    }
}

impl RowAdapter for SubmissionRowAdapter {
    fn job_type(&self) -> JobType {
        JobType::SubmissionImport
    }

    fn check_columns(&self, columns: &ColumnMap) -> Result<(), AdapterError> {
        require_columns(
            self.job_type(),
            columns,
            &[
                (CanonicalField::Email, "email"),
                (CanonicalField::SubmittedAt, "submitted_at"),
            ],
        )
    }

    fn adapt(&self, row: &MappedRow) -> Result<RowDraft, AdapterError> {
        let email = required(row, CanonicalField::Email)?;
        check_email_shape(&email)?;
        let raw = required(row, CanonicalField::SubmittedAt)?;
        let submitted_at = parse_timestamp(&raw)
            .ok_or_else(|| AdapterError::row(format!("unparseable submitted_at '{raw}'")))?;
        Ok(RowDraft::Submission(SubmissionDraft {
            email,
            submitted_at,
            submission_ref: row.owned(CanonicalField::SubmissionRef),
        }))
    }
}

fn require_columns(
    job_type: JobType,
    columns: &ColumnMap,
    needed: &[(CanonicalField, &'static str)],
) -> Result<(), AdapterError> {
    for (field, label) in needed {
        if !columns.has(*field) {
            return Err(AdapterError::MissingColumn {
                job_type: job_type.as_str(),
                needed: label,
            });
        }
    }
    Ok(())
}

fn required(row: &MappedRow, field: CanonicalField) -> Result<String, AdapterError> {
    row.owned(field)
        .ok_or_else(|| AdapterError::row(format!("missing required field: {}", field.as_str())))
}

fn check_email_shape(email: &str) -> Result<(), AdapterError> {
    let valid = match email.trim().split_once('@') {
        Some((local, host)) => !local.is_empty() && host.contains('.') && !host.contains('@'),
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(AdapterError::row(format!("invalid email '{email}'")))
    }
}

/// Splits a multi-valued cell on `;`, `,` or `|`.
pub fn split_list(cell: &str) -> Vec<String> {
    cell.split([';', ',', '|'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DD` or `MM/DD/YYYY`, read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}
