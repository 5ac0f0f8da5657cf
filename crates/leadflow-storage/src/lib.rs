//! Persistence seam for the ingestion pipeline + the email-verification HTTP client.

pub mod memory;
pub mod pg;
pub mod verifier;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadflow_core::{
    Account, Contact, Dataset, FieldChange, IngestionJob, JobStatus, LeadSubmission, RowError,
    SuppressionEntry, SuppressionKeys,
};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use pg::{PgStore, PgTx};
pub use verifier::{
    classify_reqwest_error, classify_status, BackoffPolicy, EmailVerifier, HttpEmailVerifier,
    RetryDisposition, VerifierClientConfig, VerifyError,
};

pub const CRATE_NAME: &str = "leadflow-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("could not decode {column}: {message}")]
    Decode {
        column: &'static str,
        message: String,
    },
    #[error("unique constraint violated: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn decode(column: &'static str, message: impl ToString) -> Self {
        StoreError::Decode {
            column,
            message: message.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// How a runner takes ownership of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// `pending -> processing`, done once by the submitter.
    Initial,
    /// Re-claims a `processing` job whose last progress is older than `stale_before`.
    Resume { stale_before: DateTime<Utc> },
}

/// Progress written to the job row at the end of each batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub processed_rows: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub errors: Vec<RowError>,
}

impl Checkpoint {
    pub fn of(job: &IngestionJob) -> Self {
        Self {
            processed_rows: job.processed_rows,
            success_count: job.success_count,
            error_count: job.error_count,
            errors: job.errors.clone(),
        }
    }
}

/// Terminal transition payload. The error tail replaces the stored one.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFinish {
    pub status: JobStatus,
    pub errors: Vec<RowError>,
    pub error_count: i64,
}

/// Job-level operations; each call is its own short transaction.
#[async_trait]
pub trait IngestStore: Send + Sync + 'static {
    type Tx: IngestTx;

    async fn insert_job(&self, job: &IngestionJob) -> StoreResult<()>;

    async fn load_job(&self, id: Uuid) -> StoreResult<Option<IngestionJob>>;

    /// Returns the claimed job, or `None` when another runner owns it or it is not claimable.
    async fn claim_job(
        &self,
        id: Uuid,
        mode: ClaimMode,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<IngestionJob>>;

    async fn set_total_rows(&self, id: Uuid, total_rows: i64, now: DateTime<Utc>) -> StoreResult<()>;

    /// Sets a terminal status; only a `processing` job can finish, so this happens at most once.
    async fn finish_job(&self, id: Uuid, finish: &JobFinish, now: DateTime<Utc>) -> StoreResult<bool>;

    async fn stale_jobs(&self, stale_before: DateTime<Utc>) -> StoreResult<Vec<Uuid>>;

    async fn load_dataset(&self, id: Uuid) -> StoreResult<Option<Dataset>>;

    async fn dataset_ids(&self) -> StoreResult<Vec<Uuid>>;

    async fn begin(&self) -> StoreResult<Self::Tx>;
}

/// One batch. Dropping it without [`IngestTx::commit`] rolls everything back.
#[async_trait]
pub trait IngestTx: Send {
    async fn account_by_id(&mut self, id: Uuid) -> StoreResult<Option<Account>>;

    async fn account_by_domain(&mut self, domain_normalized: &str) -> StoreResult<Option<Account>>;

    /// Live accounts with this company key, in insertion order.
    async fn accounts_by_name_key(&mut self, name_normalized: &str) -> StoreResult<Vec<Account>>;

    /// Cheap pre-filter: name key starting with (or containing a word starting with)
    /// `name_prefix`, or domain containing `domain_fragment`. Insertion order.
    async fn account_candidates(
        &mut self,
        name_prefix: Option<&str>,
        domain_fragment: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Account>>;

    async fn account_scan(&mut self, limit: usize) -> StoreResult<Vec<Account>>;

    async fn insert_account(&mut self, account: &Account) -> StoreResult<()>;

    async fn update_account(&mut self, account: &Account) -> StoreResult<()>;

    async fn contact_by_id(&mut self, id: Uuid) -> StoreResult<Option<Contact>>;

    async fn contact_by_email(
        &mut self,
        dataset_id: Uuid,
        email_normalized: &str,
    ) -> StoreResult<Option<Contact>>;

    async fn contact_by_name(
        &mut self,
        dataset_id: Uuid,
        full_name_normalized: &str,
        account_id: Option<Uuid>,
    ) -> StoreResult<Option<Contact>>;

    async fn insert_contact(&mut self, contact: &Contact) -> StoreResult<()>;

    async fn update_contact(&mut self, contact: &Contact) -> StoreResult<()>;

    async fn append_field_changes(&mut self, changes: &[FieldChange]) -> StoreResult<()>;

    /// Entries global or scoped to `dataset_id` sharing at least one key with `keys`.
    async fn suppression_candidates(
        &mut self,
        dataset_id: Uuid,
        keys: &SuppressionKeys,
    ) -> StoreResult<Vec<SuppressionEntry>>;

    /// `false` when the (dataset, contact, submitted_at) record already exists.
    async fn insert_submission(&mut self, submission: &LeadSubmission) -> StoreResult<bool>;

    /// Most recent submission timestamp per contact of the dataset.
    async fn latest_submissions(&mut self, dataset_id: Uuid) -> StoreResult<Vec<(Uuid, DateTime<Utc>)>>;

    async fn contacts_pending_validation(
        &mut self,
        dataset_id: Uuid,
        limit: usize,
    ) -> StoreResult<Vec<Contact>>;

    /// Optimistic progress write: applies only while the job is still at `expected_processed`.
    async fn checkpoint_job(
        &mut self,
        job_id: Uuid,
        expected_processed: i64,
        checkpoint: &Checkpoint,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn commit(self) -> StoreResult<()>;
}
