//! In-process store with the same transactional contract as Postgres.
//!
//! A transaction reads a snapshot taken at `begin` plus its own writes, and
//! replays its write log onto the shared state at commit, re-checking the
//! unique keys Postgres would enforce. Backs the pipeline tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadflow_core::{
    normalize, Account, Contact, Dataset, EligibilityStatus, FieldChange, IngestionJob, JobStatus,
    LeadSubmission, SuppressionEntry, SuppressionKeys,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{Checkpoint, ClaimMode, IngestStore, IngestTx, JobFinish, StoreError, StoreResult};

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub datasets: BTreeMap<Uuid, Dataset>,
    pub jobs: HashMap<Uuid, IngestionJob>,
    pub accounts: Vec<Account>,
    pub contacts: Vec<Contact>,
    pub field_changes: Vec<FieldChange>,
    pub suppressions: Vec<SuppressionEntry>,
    pub submissions: Vec<LeadSubmission>,
}

impl MemoryState {
    pub fn job(&self, id: Uuid) -> Option<&IngestionJob> {
        self.jobs.get(&id)
    }

    pub fn live_accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.iter().filter(|a| !a.deleted)
    }

    pub fn contact_by_email(&self, dataset_id: Uuid, email: &str) -> Option<&Contact> {
        let email = normalize::normalize_email(email)?;
        self.contacts.iter().find(|c| {
            c.dataset_id == dataset_id && !c.deleted && c.email_normalized.as_deref() == Some(email.as_str())
        })
    }

    fn apply(&mut self, write: Write) -> StoreResult<()> {
        match write {
            Write::InsertAccount(account) => {
                if let Some(domain) = account.domain_normalized.as_deref() {
                    let taken = self.live_accounts().any(|a| {
                        a.id != account.id && a.domain_normalized.as_deref() == Some(domain)
                    });
                    if taken {
                        return Err(StoreError::Conflict(format!(
                            "accounts_domain_live_uidx ({domain})"
                        )));
                    }
                }
                self.accounts.push(account);
            }
            Write::UpdateAccount(account) => {
                if let Some(slot) = self.accounts.iter_mut().find(|a| a.id == account.id) {
                    *slot = account;
                }
            }
            Write::InsertContact(contact) => {
                if let Some(email) = contact.email_normalized.as_deref() {
                    let taken = self.contacts.iter().any(|c| {
                        c.id != contact.id
                            && !c.deleted
                            && c.dataset_id == contact.dataset_id
                            && c.email_normalized.as_deref() == Some(email)
                    });
                    if taken {
                        return Err(StoreError::Conflict(format!(
                            "contacts_dataset_email_live_uidx ({email})"
                        )));
                    }
                }
                self.contacts.push(contact);
            }
            Write::UpdateContact(contact) => {
                if let Some(slot) = self.contacts.iter_mut().find(|c| c.id == contact.id) {
                    *slot = contact;
                }
            }
            Write::FieldChanges(changes) => self.field_changes.extend(changes),
            Write::Submission(submission) => {
                if !self.has_submission(&submission) {
                    self.submissions.push(submission);
                }
            }
            Write::Checkpoint {
                job_id,
                expected,
                checkpoint,
                now,
            } => {
                let job = self
                    .jobs
                    .get_mut(&job_id)
                    .filter(|j| j.status == JobStatus::Processing && j.processed_rows == expected)
                    .ok_or_else(|| StoreError::Conflict(format!("checkpoint for job {job_id} superseded")))?;
                job.processed_rows = checkpoint.processed_rows;
                job.success_count = checkpoint.success_count;
                job.error_count = checkpoint.error_count;
                job.errors = checkpoint.errors;
                job.updated_at = now;
            }
        }
        Ok(())
    }

    fn has_submission(&self, submission: &LeadSubmission) -> bool {
        self.submissions.iter().any(|s| {
            s.dataset_id == submission.dataset_id
                && s.contact_id == submission.contact_id
                && s.submitted_at == submission.submitted_at
        })
    }
}

#[derive(Debug, Clone)]
enum Write {
    InsertAccount(Account),
    UpdateAccount(Account),
    InsertContact(Contact),
    UpdateContact(Contact),
    FieldChanges(Vec<FieldChange>),
    Submission(LeadSubmission),
    Checkpoint {
        job_id: Uuid,
        expected: i64,
        checkpoint: Checkpoint,
        now: DateTime<Utc>,
    },
}

#[derive(Debug, Default)]
struct Shared {
    state: MemoryState,
    commits: usize,
    fail_commit_at: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_dataset(&self, dataset: Dataset) {
        self.shared.lock().await.state.datasets.insert(dataset.id, dataset);
    }

    pub async fn seed_suppression(&self, entry: SuppressionEntry) {
        self.shared.lock().await.state.suppressions.push(entry);
    }

    pub async fn seed_account(&self, account: Account) {
        self.shared.lock().await.state.accounts.push(account);
    }

    pub async fn seed_contact(&self, contact: Contact) {
        self.shared.lock().await.state.contacts.push(contact);
    }

    pub async fn seed_submission(&self, submission: LeadSubmission) {
        self.shared.lock().await.state.submissions.push(submission);
    }

    /// Makes the `n`-th commit from now fail as if the process died mid-batch.
    pub async fn fail_commit_at(&self, n: usize) {
        let mut shared = self.shared.lock().await;
        shared.fail_commit_at = Some(shared.commits + n.max(1));
    }

    pub async fn snapshot(&self) -> MemoryState {
        self.shared.lock().await.state.clone()
    }
}

#[async_trait]
impl IngestStore for MemoryStore {
    type Tx = MemoryTx;

    async fn insert_job(&self, job: &IngestionJob) -> StoreResult<()> {
        self.shared.lock().await.state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_job(&self, id: Uuid) -> StoreResult<Option<IngestionJob>> {
        Ok(self.shared.lock().await.state.jobs.get(&id).cloned())
    }

    async fn claim_job(
        &self,
        id: Uuid,
        mode: ClaimMode,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<IngestionJob>> {
        let mut shared = self.shared.lock().await;
        let Some(job) = shared.state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        match mode {
            ClaimMode::Initial if job.status == JobStatus::Pending => {
                job.status = JobStatus::Processing;
                job.started_at.get_or_insert(now);
            }
            ClaimMode::Resume { stale_before }
                if job.status == JobStatus::Processing && job.updated_at < stale_before =>
            {
                job.resume_count += 1;
            }
            _ => return Ok(None),
        }
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn set_total_rows(&self, id: Uuid, total_rows: i64, now: DateTime<Utc>) -> StoreResult<()> {
        if let Some(job) = self.shared.lock().await.state.jobs.get_mut(&id) {
            job.total_rows = total_rows;
            job.updated_at = now;
        }
        Ok(())
    }

    async fn finish_job(&self, id: Uuid, finish: &JobFinish, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut shared = self.shared.lock().await;
        match shared.state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Processing => {
                job.status = finish.status;
                job.errors = finish.errors.clone();
                job.error_count = finish.error_count;
                job.finished_at = Some(now);
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stale_jobs(&self, stale_before: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let shared = self.shared.lock().await;
        let mut stale: Vec<&IngestionJob> = shared
            .state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Processing && j.updated_at < stale_before)
            .collect();
        stale.sort_by_key(|j| j.updated_at);
        Ok(stale.into_iter().map(|j| j.id).collect())
    }

    async fn load_dataset(&self, id: Uuid) -> StoreResult<Option<Dataset>> {
        Ok(self.shared.lock().await.state.datasets.get(&id).cloned())
    }

    async fn dataset_ids(&self) -> StoreResult<Vec<Uuid>> {
        Ok(self.shared.lock().await.state.datasets.keys().copied().collect())
    }

    async fn begin(&self) -> StoreResult<MemoryTx> {
        let view = self.shared.lock().await.state.clone();
        Ok(MemoryTx {
            shared: Arc::clone(&self.shared),
            view,
            writes: Vec::new(),
        })
    }
}

pub struct MemoryTx {
    shared: Arc<Mutex<Shared>>,
    view: MemoryState,
    writes: Vec<Write>,
}

impl MemoryTx {
    fn record(&mut self, write: Write) -> StoreResult<()> {
        self.view.apply(write.clone())?;
        self.writes.push(write);
        Ok(())
    }
}

#[async_trait]
impl IngestTx for MemoryTx {
    async fn account_by_id(&mut self, id: Uuid) -> StoreResult<Option<Account>> {
        Ok(self.view.accounts.iter().find(|a| a.id == id).cloned())
    }

    async fn account_by_domain(&mut self, domain_normalized: &str) -> StoreResult<Option<Account>> {
        Ok(self
            .view
            .live_accounts()
            .find(|a| a.domain_normalized.as_deref() == Some(domain_normalized))
            .cloned())
    }

    async fn accounts_by_name_key(&mut self, name_normalized: &str) -> StoreResult<Vec<Account>> {
        Ok(self
            .view
            .live_accounts()
            .filter(|a| a.name_normalized == name_normalized)
            .cloned()
            .collect())
    }

    async fn account_candidates(
        &mut self,
        name_prefix: Option<&str>,
        domain_fragment: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Account>> {
        let word_prefix = name_prefix.map(|p| format!(" {p}"));
        Ok(self
            .view
            .live_accounts()
            .filter(|a| {
                let by_name = match (name_prefix, word_prefix.as_deref()) {
                    (Some(prefix), Some(word)) => {
                        a.name_normalized.starts_with(prefix) || a.name_normalized.contains(word)
                    }
                    _ => false,
                };
                let by_domain = match (domain_fragment, a.domain_normalized.as_deref()) {
                    (Some(fragment), Some(domain)) => domain.contains(fragment),
                    _ => false,
                };
                by_name || by_domain
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn account_scan(&mut self, limit: usize) -> StoreResult<Vec<Account>> {
        Ok(self.view.live_accounts().take(limit).cloned().collect())
    }

    async fn insert_account(&mut self, account: &Account) -> StoreResult<()> {
        self.record(Write::InsertAccount(account.clone()))
    }

    async fn update_account(&mut self, account: &Account) -> StoreResult<()> {
        self.record(Write::UpdateAccount(account.clone()))
    }

    async fn contact_by_id(&mut self, id: Uuid) -> StoreResult<Option<Contact>> {
        Ok(self.view.contacts.iter().find(|c| c.id == id).cloned())
    }

    async fn contact_by_email(
        &mut self,
        dataset_id: Uuid,
        email_normalized: &str,
    ) -> StoreResult<Option<Contact>> {
        Ok(self.view.contact_by_email(dataset_id, email_normalized).cloned())
    }

    async fn contact_by_name(
        &mut self,
        dataset_id: Uuid,
        full_name_normalized: &str,
        account_id: Option<Uuid>,
    ) -> StoreResult<Option<Contact>> {
        Ok(self
            .view
            .contacts
            .iter()
            .find(|c| {
                c.dataset_id == dataset_id
                    && !c.deleted
                    && c.email_normalized.is_none()
                    && c.account_id == account_id
                    && c.full_name_normalized.as_deref() == Some(full_name_normalized)
            })
            .cloned())
    }

    async fn insert_contact(&mut self, contact: &Contact) -> StoreResult<()> {
        self.record(Write::InsertContact(contact.clone()))
    }

    async fn update_contact(&mut self, contact: &Contact) -> StoreResult<()> {
        self.record(Write::UpdateContact(contact.clone()))
    }

    async fn append_field_changes(&mut self, changes: &[FieldChange]) -> StoreResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        self.record(Write::FieldChanges(changes.to_vec()))
    }

    async fn suppression_candidates(
        &mut self,
        dataset_id: Uuid,
        keys: &SuppressionKeys,
    ) -> StoreResult<Vec<SuppressionEntry>> {
        fn same(entry: &Option<String>, key: &Option<String>) -> bool {
            matches!((entry, key), (Some(a), Some(b)) if a == b)
        }
        Ok(self
            .view
            .suppressions
            .iter()
            .filter(|e| e.dataset_id.is_none() || e.dataset_id == Some(dataset_id))
            .filter(|e| {
                same(&e.email_normalized, &keys.email)
                    || same(&e.cav_id, &keys.cav_id)
                    || same(&e.cav_user_id, &keys.cav_user_id)
                    || same(&e.name_company_hash, &keys.name_company_hash)
            })
            .cloned()
            .collect())
    }

    async fn insert_submission(&mut self, submission: &LeadSubmission) -> StoreResult<bool> {
        if self.view.has_submission(submission) {
            return Ok(false);
        }
        self.record(Write::Submission(submission.clone()))?;
        Ok(true)
    }

    async fn latest_submissions(&mut self, dataset_id: Uuid) -> StoreResult<Vec<(Uuid, DateTime<Utc>)>> {
        let mut latest: BTreeMap<Uuid, DateTime<Utc>> = BTreeMap::new();
        for submission in self.view.submissions.iter().filter(|s| s.dataset_id == dataset_id) {
            latest
                .entry(submission.contact_id)
                .and_modify(|ts| *ts = (*ts).max(submission.submitted_at))
                .or_insert(submission.submitted_at);
        }
        Ok(latest.into_iter().collect())
    }

    async fn contacts_pending_validation(
        &mut self,
        dataset_id: Uuid,
        limit: usize,
    ) -> StoreResult<Vec<Contact>> {
        Ok(self
            .view
            .contacts
            .iter()
            .filter(|c| {
                c.dataset_id == dataset_id
                    && !c.deleted
                    && !c.suppressed
                    && c.email_normalized.is_some()
                    && c.eligibility_status == EligibilityStatus::PendingEmailValidation
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn checkpoint_job(
        &mut self,
        job_id: Uuid,
        expected_processed: i64,
        checkpoint: &Checkpoint,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let current = {
            let shared = self.shared.lock().await;
            shared.state.jobs.get(&job_id).cloned()
        };
        let Some(current) = current else {
            return Ok(false);
        };
        if current.status != JobStatus::Processing || current.processed_rows != expected_processed {
            return Ok(false);
        }
        self.view.jobs.insert(job_id, current);
        self.record(Write::Checkpoint {
            job_id,
            expected: expected_processed,
            checkpoint: checkpoint.clone(),
            now,
        })?;
        Ok(true)
    }

    async fn commit(self) -> StoreResult<()> {
        let mut shared = self.shared.lock().await;
        shared.commits += 1;
        if shared.fail_commit_at == Some(shared.commits) {
            shared.fail_commit_at = None;
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }
        let mut next = shared.state.clone();
        for write in self.writes {
            next.apply(write)?;
        }
        shared.state = next;
        Ok(())
    }
}
