//! Postgres implementation of the ingestion store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadflow_core::{
    Account, CampaignRules, Contact, CustomFields, Dataset, EligibilityStatus,
    EmailValidationStatus, FieldChange, FieldMapping, IngestionJob, JobStatus, JobType,
    LeadSubmission, RowError, SuppressionEntry, SuppressionKeys,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::{Checkpoint, ClaimMode, IngestStore, IngestTx, JobFinish, StoreError, StoreResult};

const JOB_COLUMNS: &str = "id, dataset_id, job_type, csv_text, field_mappings, update_mode, status, \
     total_rows, processed_rows, success_count, error_count, errors, resume_count, \
     created_at, started_at, finished_at, updated_at";

const ACCOUNT_COLUMNS: &str = "id, name, name_normalized, domain, domain_normalized, phone, phone_e164, \
     industry, hq_street, hq_city, hq_state, hq_postal_code, hq_country, tags, tech_stack, \
     custom_fields, source_system, source_record_id, source_updated_at, deleted, created_at, updated_at";

const CONTACT_COLUMNS: &str = "id, dataset_id, account_id, first_name, last_name, full_name, \
     full_name_normalized, email, email_normalized, phone, phone_e164, title, city, state, \
     postal_code, country, linkedin_url, cav_id, cav_user_id, topics, custom_fields, suppressed, \
     suppression_reason, eligibility_status, eligibility_reason, email_validation, source_system, \
     source_record_id, source_updated_at, deleted, created_at, updated_at";

const SUPPRESSION_COLUMNS: &str = "id, dataset_id, email_normalized, cav_id, cav_user_id, \
     full_name_normalized, company_normalized, name_company_hash, reason, created_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn map_write_error(err: sqlx::Error) -> StoreError {
    match err.as_database_error() {
        Some(db) if db.is_unique_violation() => StoreError::Conflict(db.message().to_string()),
        _ => StoreError::Database(err),
    }
}

fn job_from_row(row: &PgRow) -> StoreResult<IngestionJob> {
    let job_type: String = row.try_get("job_type")?;
    let status: String = row.try_get("status")?;
    let Json(field_mappings): Json<Vec<FieldMapping>> = row.try_get("field_mappings")?;
    let Json(errors): Json<Vec<RowError>> = row.try_get("errors")?;
    Ok(IngestionJob {
        id: row.try_get("id")?,
        dataset_id: row.try_get("dataset_id")?,
        job_type: job_type
            .parse::<JobType>()
            .map_err(|e| StoreError::decode("job_type", e))?,
        csv_text: row.try_get("csv_text")?,
        field_mappings,
        update_mode: row.try_get("update_mode")?,
        status: status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::decode("status", e))?,
        total_rows: row.try_get("total_rows")?,
        processed_rows: row.try_get("processed_rows")?,
        success_count: row.try_get("success_count")?,
        error_count: row.try_get("error_count")?,
        errors,
        resume_count: row.try_get("resume_count")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn account_from_row(row: &PgRow) -> StoreResult<Account> {
    let Json(custom_fields): Json<CustomFields> = row.try_get("custom_fields")?;
    Ok(Account {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        name_normalized: row.try_get("name_normalized")?,
        domain: row.try_get("domain")?,
        domain_normalized: row.try_get("domain_normalized")?,
        phone: row.try_get("phone")?,
        phone_e164: row.try_get("phone_e164")?,
        industry: row.try_get("industry")?,
        hq_street: row.try_get("hq_street")?,
        hq_city: row.try_get("hq_city")?,
        hq_state: row.try_get("hq_state")?,
        hq_postal_code: row.try_get("hq_postal_code")?,
        hq_country: row.try_get("hq_country")?,
        tags: row.try_get("tags")?,
        tech_stack: row.try_get("tech_stack")?,
        custom_fields,
        source_system: row.try_get("source_system")?,
        source_record_id: row.try_get("source_record_id")?,
        source_updated_at: row.try_get("source_updated_at")?,
        deleted: row.try_get("deleted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn contact_from_row(row: &PgRow) -> StoreResult<Contact> {
    let Json(custom_fields): Json<CustomFields> = row.try_get("custom_fields")?;
    let eligibility: String = row.try_get("eligibility_status")?;
    let email_validation: Option<String> = row.try_get("email_validation")?;
    Ok(Contact {
        id: row.try_get("id")?,
        dataset_id: row.try_get("dataset_id")?,
        account_id: row.try_get("account_id")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        full_name: row.try_get("full_name")?,
        full_name_normalized: row.try_get("full_name_normalized")?,
        email: row.try_get("email")?,
        email_normalized: row.try_get("email_normalized")?,
        phone: row.try_get("phone")?,
        phone_e164: row.try_get("phone_e164")?,
        title: row.try_get("title")?,
        city: row.try_get("city")?,
        state: row.try_get("state")?,
        postal_code: row.try_get("postal_code")?,
        country: row.try_get("country")?,
        linkedin_url: row.try_get("linkedin_url")?,
        cav_id: row.try_get("cav_id")?,
        cav_user_id: row.try_get("cav_user_id")?,
        topics: row.try_get("topics")?,
        custom_fields,
        suppressed: row.try_get("suppressed")?,
        suppression_reason: row.try_get("suppression_reason")?,
        eligibility_status: eligibility
            .parse::<EligibilityStatus>()
            .map_err(|e| StoreError::decode("eligibility_status", e))?,
        eligibility_reason: row.try_get("eligibility_reason")?,
        email_validation: email_validation
            .map(|v| v.parse::<EmailValidationStatus>())
            .transpose()
            .map_err(|e| StoreError::decode("email_validation", e))?,
        source_system: row.try_get("source_system")?,
        source_record_id: row.try_get("source_record_id")?,
        source_updated_at: row.try_get("source_updated_at")?,
        deleted: row.try_get("deleted")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn suppression_from_row(row: &PgRow) -> StoreResult<SuppressionEntry> {
    Ok(SuppressionEntry {
        id: row.try_get("id")?,
        dataset_id: row.try_get("dataset_id")?,
        email_normalized: row.try_get("email_normalized")?,
        cav_id: row.try_get("cav_id")?,
        cav_user_id: row.try_get("cav_user_id")?,
        full_name_normalized: row.try_get("full_name_normalized")?,
        company_normalized: row.try_get("company_normalized")?,
        name_company_hash: row.try_get("name_company_hash")?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn collect<T>(rows: &[PgRow], decode: fn(&PgRow) -> StoreResult<T>) -> StoreResult<Vec<T>> {
    rows.iter().map(decode).collect()
}

#[async_trait]
impl IngestStore for PgStore {
    type Tx = PgTx;

    async fn insert_job(&self, job: &IngestionJob) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_jobs (
                id, dataset_id, job_type, csv_text, field_mappings, update_mode, status,
                total_rows, processed_rows, success_count, error_count, errors, resume_count,
                created_at, started_at, finished_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.id)
        .bind(job.dataset_id)
        .bind(job.job_type.as_str())
        .bind(&job.csv_text)
        .bind(Json(&job.field_mappings))
        .bind(job.update_mode)
        .bind(job.status.as_str())
        .bind(job.total_rows)
        .bind(job.processed_rows)
        .bind(job.success_count)
        .bind(job.error_count)
        .bind(Json(&job.errors))
        .bind(job.resume_count)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn load_job(&self, id: Uuid) -> StoreResult<Option<IngestionJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM ingestion_jobs WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_job(
        &self,
        id: Uuid,
        mode: ClaimMode,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<IngestionJob>> {
        let row = match mode {
            ClaimMode::Initial => {
                let sql = format!(
                    "UPDATE ingestion_jobs
                        SET status = 'processing',
                            started_at = COALESCE(started_at, $2),
                            updated_at = $2
                      WHERE id = $1 AND status = 'pending'
                  RETURNING {JOB_COLUMNS}"
                );
                sqlx::query(&sql)
                    .bind(id)
                    .bind(now)
                    .fetch_optional(&self.pool)
                    .await?
            }
            ClaimMode::Resume { stale_before } => {
                let sql = format!(
                    "UPDATE ingestion_jobs
                        SET resume_count = resume_count + 1,
                            updated_at = $2
                      WHERE id = $1 AND status = 'processing' AND updated_at < $3
                  RETURNING {JOB_COLUMNS}"
                );
                sqlx::query(&sql)
                    .bind(id)
                    .bind(now)
                    .bind(stale_before)
                    .fetch_optional(&self.pool)
                    .await?
            }
        };
        row.as_ref().map(job_from_row).transpose()
    }

    async fn set_total_rows(&self, id: Uuid, total_rows: i64, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE ingestion_jobs SET total_rows = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(total_rows)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_job(&self, id: Uuid, finish: &JobFinish, now: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
               SET status = $2,
                   errors = $3,
                   error_count = $4,
                   finished_at = $5,
                   updated_at = $5
             WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .bind(finish.status.as_str())
        .bind(Json(&finish.errors))
        .bind(finish.error_count)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn stale_jobs(&self, stale_before: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT id
              FROM ingestion_jobs
             WHERE status = $1 AND updated_at < $2
             ORDER BY updated_at
            "#,
        )
        .bind(JobStatus::Processing.as_str())
        .bind(stale_before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(StoreError::from))
            .collect()
    }

    async fn load_dataset(&self, id: Uuid) -> StoreResult<Option<Dataset>> {
        let row = sqlx::query("SELECT id, name, eligibility_rules FROM datasets WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let Json(rules): Json<CampaignRules> = row.try_get("eligibility_rules")?;
        Ok(Some(Dataset {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            rules,
        }))
    }

    async fn dataset_ids(&self) -> StoreResult<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM datasets ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(StoreError::from))
            .collect()
    }

    async fn begin(&self) -> StoreResult<PgTx> {
        Ok(PgTx {
            tx: self.pool.begin().await?,
        })
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    async fn fetch_accounts(&mut self, sql: &str, key: &str) -> StoreResult<Vec<Account>> {
        let rows = sqlx::query(sql).bind(key).fetch_all(&mut *self.tx).await?;
        collect(&rows, account_from_row)
    }
}

#[async_trait]
impl IngestTx for PgTx {
    async fn account_by_id(&mut self, id: Uuid) -> StoreResult<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn account_by_domain(&mut self, domain_normalized: &str) -> StoreResult<Option<Account>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE domain_normalized = $1 AND NOT deleted"
        );
        Ok(self
            .fetch_accounts(&sql, domain_normalized)
            .await?
            .into_iter()
            .next())
    }

    async fn accounts_by_name_key(&mut self, name_normalized: &str) -> StoreResult<Vec<Account>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE name_normalized = $1 AND NOT deleted ORDER BY seq"
        );
        self.fetch_accounts(&sql, name_normalized).await
    }

    async fn account_candidates(
        &mut self,
        name_prefix: Option<&str>,
        domain_fragment: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<Account>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS}
               FROM accounts
              WHERE NOT deleted
                AND (
                    ($1::text IS NOT NULL
                        AND (name_normalized LIKE $1 || '%' OR name_normalized LIKE '% ' || $1 || '%'))
                    OR ($2::text IS NOT NULL AND domain_normalized LIKE '%' || $2 || '%')
                )
              ORDER BY seq
              LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(name_prefix)
            .bind(domain_fragment)
            .bind(limit as i64)
            .fetch_all(&mut *self.tx)
            .await?;
        collect(&rows, account_from_row)
    }

    async fn account_scan(&mut self, limit: usize) -> StoreResult<Vec<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE NOT deleted ORDER BY seq LIMIT $1");
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&mut *self.tx)
            .await?;
        collect(&rows, account_from_row)
    }

    async fn insert_account(&mut self, account: &Account) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO accounts ({ACCOUNT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)"
        );
        bind_account(sqlx::query(&sql), account)
            .execute(&mut *self.tx)
            .await
            .map_err(map_write_error)?;
        debug!(account_id = %account.id, name = %account.name, "account inserted");
        Ok(())
    }

    async fn update_account(&mut self, account: &Account) -> StoreResult<()> {
        let sql = "UPDATE accounts
                      SET name = $2, name_normalized = $3, domain = $4, domain_normalized = $5,
                          phone = $6, phone_e164 = $7, industry = $8, hq_street = $9, hq_city = $10,
                          hq_state = $11, hq_postal_code = $12, hq_country = $13, tags = $14,
                          tech_stack = $15, custom_fields = $16, source_system = $17,
                          source_record_id = $18, source_updated_at = $19, deleted = $20,
                          created_at = $21, updated_at = $22
                    WHERE id = $1";
        bind_account(sqlx::query(sql), account)
            .execute(&mut *self.tx)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    async fn contact_by_id(&mut self, id: Uuid) -> StoreResult<Option<Contact>> {
        let sql = format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *self.tx).await?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn contact_by_email(
        &mut self,
        dataset_id: Uuid,
        email_normalized: &str,
    ) -> StoreResult<Option<Contact>> {
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
              WHERE dataset_id = $1 AND email_normalized = $2 AND NOT deleted"
        );
        let row = sqlx::query(&sql)
            .bind(dataset_id)
            .bind(email_normalized)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn contact_by_name(
        &mut self,
        dataset_id: Uuid,
        full_name_normalized: &str,
        account_id: Option<Uuid>,
    ) -> StoreResult<Option<Contact>> {
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
              WHERE dataset_id = $1
                AND full_name_normalized = $2
                AND account_id IS NOT DISTINCT FROM $3
                AND email_normalized IS NULL
                AND NOT deleted
              ORDER BY created_at, id
              LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(dataset_id)
            .bind(full_name_normalized)
            .bind(account_id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(contact_from_row).transpose()
    }

    async fn insert_contact(&mut self, contact: &Contact) -> StoreResult<()> {
        let sql = format!(
            "INSERT INTO contacts ({CONTACT_COLUMNS})
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                     $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32)"
        );
        bind_contact(sqlx::query(&sql), contact)
            .execute(&mut *self.tx)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    async fn update_contact(&mut self, contact: &Contact) -> StoreResult<()> {
        let sql = "UPDATE contacts
                      SET dataset_id = $2, account_id = $3, first_name = $4, last_name = $5,
                          full_name = $6, full_name_normalized = $7, email = $8,
                          email_normalized = $9, phone = $10, phone_e164 = $11, title = $12,
                          city = $13, state = $14, postal_code = $15, country = $16,
                          linkedin_url = $17, cav_id = $18, cav_user_id = $19, topics = $20,
                          custom_fields = $21, suppressed = $22, suppression_reason = $23,
                          eligibility_status = $24, eligibility_reason = $25,
                          email_validation = $26, source_system = $27, source_record_id = $28,
                          source_updated_at = $29, deleted = $30, created_at = $31,
                          updated_at = $32
                    WHERE id = $1";
        bind_contact(sqlx::query(sql), contact)
            .execute(&mut *self.tx)
            .await
            .map_err(map_write_error)?;
        Ok(())
    }

    async fn append_field_changes(&mut self, changes: &[FieldChange]) -> StoreResult<()> {
        for change in changes {
            sqlx::query(
                r#"
                INSERT INTO field_change_log (
                    id, entity_type, entity_id, field_key, old_value, new_value,
                    source_system, actor, policy, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(change.id)
            .bind(change.entity_type.as_str())
            .bind(change.entity_id)
            .bind(&change.field_key)
            .bind(change.old_value.as_ref().map(Json))
            .bind(change.new_value.as_ref().map(Json))
            .bind(&change.source_system)
            .bind(&change.actor)
            .bind(change.policy.as_str())
            .bind(change.created_at)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn suppression_candidates(
        &mut self,
        dataset_id: Uuid,
        keys: &SuppressionKeys,
    ) -> StoreResult<Vec<SuppressionEntry>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {SUPPRESSION_COLUMNS}
               FROM suppression_entries
              WHERE (dataset_id IS NULL OR dataset_id = $1)
                AND (email_normalized = $2
                     OR cav_id = $3
                     OR cav_user_id = $4
                     OR name_company_hash = $5)
              ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(dataset_id)
            .bind(keys.email.as_deref())
            .bind(keys.cav_id.as_deref())
            .bind(keys.cav_user_id.as_deref())
            .bind(keys.name_company_hash.as_deref())
            .fetch_all(&mut *self.tx)
            .await?;
        collect(&rows, suppression_from_row)
    }

    async fn insert_submission(&mut self, submission: &LeadSubmission) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO lead_submissions (id, dataset_id, contact_id, submitted_at, submission_ref, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (dataset_id, contact_id, submitted_at) DO NOTHING
            "#,
        )
        .bind(submission.id)
        .bind(submission.dataset_id)
        .bind(submission.contact_id)
        .bind(submission.submitted_at)
        .bind(&submission.submission_ref)
        .bind(submission.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn latest_submissions(&mut self, dataset_id: Uuid) -> StoreResult<Vec<(Uuid, DateTime<Utc>)>> {
        let rows = sqlx::query(
            r#"
            SELECT contact_id, MAX(submitted_at) AS latest
              FROM lead_submissions
             WHERE dataset_id = $1
             GROUP BY contact_id
             ORDER BY contact_id
            "#,
        )
        .bind(dataset_id)
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter()
            .map(|row| -> StoreResult<(Uuid, DateTime<Utc>)> {
                Ok((row.try_get("contact_id")?, row.try_get("latest")?))
            })
            .collect()
    }

    async fn contacts_pending_validation(
        &mut self,
        dataset_id: Uuid,
        limit: usize,
    ) -> StoreResult<Vec<Contact>> {
        let sql = format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts
              WHERE dataset_id = $1
                AND eligibility_status = 'Pending_Email_Validation'
                AND email_normalized IS NOT NULL
                AND NOT suppressed
                AND NOT deleted
              ORDER BY created_at, id
              LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(dataset_id)
            .bind(limit as i64)
            .fetch_all(&mut *self.tx)
            .await?;
        collect(&rows, contact_from_row)
    }

    async fn checkpoint_job(
        &mut self,
        job_id: Uuid,
        expected_processed: i64,
        checkpoint: &Checkpoint,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_jobs
               SET processed_rows = $3,
                   success_count = $4,
                   error_count = $5,
                   errors = $6,
                   updated_at = $7
             WHERE id = $1 AND processed_rows = $2 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(expected_processed)
        .bind(checkpoint.processed_rows)
        .bind(checkpoint.success_count)
        .bind(checkpoint.error_count)
        .bind(Json(&checkpoint.errors))
        .bind(now)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn bind_account<'q>(query: PgQuery<'q>, a: &'q Account) -> PgQuery<'q> {
    query
        .bind(a.id)
        .bind(&a.name)
        .bind(&a.name_normalized)
        .bind(&a.domain)
        .bind(&a.domain_normalized)
        .bind(&a.phone)
        .bind(&a.phone_e164)
        .bind(&a.industry)
        .bind(&a.hq_street)
        .bind(&a.hq_city)
        .bind(&a.hq_state)
        .bind(&a.hq_postal_code)
        .bind(&a.hq_country)
        .bind(&a.tags)
        .bind(&a.tech_stack)
        .bind(Json(&a.custom_fields))
        .bind(&a.source_system)
        .bind(&a.source_record_id)
        .bind(a.source_updated_at)
        .bind(a.deleted)
        .bind(a.created_at)
        .bind(a.updated_at)
}

fn bind_contact<'q>(query: PgQuery<'q>, c: &'q Contact) -> PgQuery<'q> {
    query
        .bind(c.id)
        .bind(c.dataset_id)
        .bind(c.account_id)
        .bind(&c.first_name)
        .bind(&c.last_name)
        .bind(&c.full_name)
        .bind(&c.full_name_normalized)
        .bind(&c.email)
        .bind(&c.email_normalized)
        .bind(&c.phone)
        .bind(&c.phone_e164)
        .bind(&c.title)
        .bind(&c.city)
        .bind(&c.state)
        .bind(&c.postal_code)
        .bind(&c.country)
        .bind(&c.linkedin_url)
        .bind(&c.cav_id)
        .bind(&c.cav_user_id)
        .bind(&c.topics)
        .bind(Json(&c.custom_fields))
        .bind(c.suppressed)
        .bind(&c.suppression_reason)
        .bind(c.eligibility_status.as_str())
        .bind(&c.eligibility_reason)
        .bind(c.email_validation.map(|v| v.as_str()))
        .bind(&c.source_system)
        .bind(&c.source_record_id)
        .bind(c.source_updated_at)
        .bind(c.deleted)
        .bind(c.created_at)
        .bind(c.updated_at)
}
