//! Job lifecycle: claim, parse, batch, checkpoint, finish. Plus dispatch and the resume sweep.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use leadflow_adapters::{adapter_for_job_type, prepare, MappedRow, RowAdapter, RowDraft};
use leadflow_core::{
    push_bounded, IngestionJob, JobCreated, JobStatus, JobType, NewJobRequest, Provenance, RowError,
};
use leadflow_storage::{Checkpoint, ClaimMode, IngestStore, IngestTx, JobFinish};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::resolver::ResolutionCache;
use crate::upsert::{apply_validation_result, import_contact, record_submission, RowContext, RowFailure};

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub batch_size: usize,
    pub max_resumes: i32,
    pub stale_after: Duration,
    pub source_system: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for RunSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_resumes: config.max_resumes,
            stale_after: config.stale_after(),
            source_system: config.source_system.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    /// Another runner advanced or finished the job first.
    Superseded,
    /// A batch rolled back; the job stays `processing` until the resume sweep picks it up.
    Interrupted,
    NotClaimed,
}

/// Stores a new `pending` job built from an API-shaped request.
pub async fn create_job<S: IngestStore>(
    store: &S,
    job_type: JobType,
    request: NewJobRequest,
    now: DateTime<Utc>,
) -> Result<IngestionJob> {
    let job = IngestionJob::new(
        request.dataset_id,
        job_type,
        request.csv_text,
        request.field_mappings.unwrap_or_default(),
        request.update_mode.unwrap_or(false),
        now,
    );
    store.insert_job(&job).await.context("inserting ingestion job")?;
    info!(job_id = %job.id, dataset_id = %job.dataset_id, job_type = job.job_type.as_str(), "job created");
    Ok(job)
}

pub struct JobRunner<S> {
    store: Arc<S>,
    settings: RunSettings,
}

impl<S: IngestStore> JobRunner<S> {
    pub fn new(store: Arc<S>, settings: RunSettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Runs one job to a terminal state, or until it is interrupted or superseded.
    ///
    /// Errors are only returned for conditions that leave no job to fail,
    /// such as an unknown job id.
    pub async fn run(&self, job_id: Uuid, mode: ClaimMode) -> Result<RunOutcome> {
        let claimed = self
            .store
            .claim_job(job_id, mode, Utc::now())
            .await
            .with_context(|| format!("claiming job {job_id}"))?;
        let Some(job) = claimed else {
            if self.store.load_job(job_id).await?.is_none() {
                bail!("ingestion job {job_id} not found");
            }
            debug!(%job_id, "job not claimable");
            return Ok(RunOutcome::NotClaimed);
        };
        Span::current().record("job_type", job.job_type.as_str());

        if job.resume_count > self.settings.max_resumes {
            let reason = anyhow!("gave up after {} resumes", self.settings.max_resumes);
            return Ok(self.fail(&job, reason).await);
        }
        info!(
            resume_count = job.resume_count,
            processed_rows = job.processed_rows,
            "job claimed"
        );

        match self.process(&job).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => Ok(self.fail(&job, err).await),
        }
    }

    async fn process(&self, job: &IngestionJob) -> Result<RunOutcome> {
        let dataset = self
            .store
            .load_dataset(job.dataset_id)
            .await
            .context("loading dataset")?
            .ok_or_else(|| anyhow!("dataset {} not found", job.dataset_id))?;
        let prepared = prepare(job.job_type, &job.csv_text, &job.field_mappings)
            .context("csv payload rejected")?;
        self.store
            .set_total_rows(job.id, prepared.total_rows() as i64, Utc::now())
            .await
            .context("recording total rows")?;

        let adapter = adapter_for_job_type(job.job_type);
        let provenance = Provenance {
            source_system: self.settings.source_system.clone(),
            source_record_id: None,
            source_updated_at: None,
            actor: format!("ingestion-job:{}", job.id),
        };
        let batch_size = self.settings.batch_size.max(1);
        let mut rows = prepared.rows_from(job.processed_rows.max(0) as usize);
        let mut cache = ResolutionCache::default();
        let mut progress = Checkpoint::of(job);

        for batch_no in 0usize.. {
            let batch: Vec<MappedRow> = rows.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }
            let ctx = RowContext {
                dataset: &dataset,
                update_mode: job.update_mode,
                provenance: provenance.clone(),
                now: Utc::now(),
            };
            match self
                .run_batch(job.id, adapter.as_ref(), &ctx, &batch, &progress, &mut cache)
                .await
            {
                Ok(Some(next)) => {
                    cache.commit();
                    progress = next;
                    debug!(batch = batch_no, processed_rows = progress.processed_rows, "batch committed");
                }
                Ok(None) => {
                    cache.discard();
                    warn!(batch = batch_no, "checkpoint lost to another runner; stopping");
                    return Ok(RunOutcome::Superseded);
                }
                Err(err) => {
                    cache.discard();
                    warn!(batch = batch_no, error = %format!("{err:#}"), "batch rolled back");
                    return Ok(RunOutcome::Interrupted);
                }
            }
        }

        let finish = JobFinish {
            status: JobStatus::Completed,
            errors: progress.errors.clone(),
            error_count: progress.error_count,
        };
        match self.store.finish_job(job.id, &finish, Utc::now()).await {
            Ok(true) => {
                info!(
                    processed_rows = progress.processed_rows,
                    success_count = progress.success_count,
                    error_count = progress.error_count,
                    "job completed"
                );
                Ok(RunOutcome::Completed)
            }
            Ok(false) => Ok(RunOutcome::Superseded),
            Err(err) => {
                warn!(error = %err, "could not mark job completed");
                Ok(RunOutcome::Interrupted)
            }
        }
    }

    /// One transaction. `Ok(None)` when the optimistic checkpoint lost.
    async fn run_batch(
        &self,
        job_id: Uuid,
        adapter: &dyn RowAdapter,
        ctx: &RowContext<'_>,
        batch: &[MappedRow],
        progress: &Checkpoint,
        cache: &mut ResolutionCache,
    ) -> Result<Option<Checkpoint>> {
        let mut tx = self.store.begin().await.context("opening batch transaction")?;
        let mut next = progress.clone();

        for row in batch {
            match process_row(&mut tx, adapter, ctx, cache, row).await {
                Ok(()) => next.success_count += 1,
                Err(RowFailure::Row(message)) => {
                    debug!(row = row.row, %message, "row rejected");
                    next.error_count += 1;
                    push_bounded(&mut next.errors, RowError::new(row.row, message));
                }
                Err(RowFailure::Batch(err)) => {
                    return Err(anyhow::Error::new(err).context(format!("row {}", row.row)));
                }
            }
            next.processed_rows += 1;
        }

        let advanced = tx
            .checkpoint_job(job_id, progress.processed_rows, &next, Utc::now())
            .await
            .context("writing checkpoint")?;
        if !advanced {
            return Ok(None);
        }
        tx.commit().await.context("committing batch")?;
        Ok(Some(next))
    }

    /// Best effort: a failure to record the failure is logged, not raised.
    async fn fail(&self, job: &IngestionJob, reason: anyhow::Error) -> RunOutcome {
        let message = format!("{reason:#}");
        error!(job_id = %job.id, error = %message, "ingestion job failed");

        let latest = match self.store.load_job(job.id).await {
            Ok(Some(latest)) => latest,
            _ => job.clone(),
        };
        let mut errors = latest.errors;
        push_bounded(&mut errors, RowError::new(0, message));
        let finish = JobFinish {
            status: JobStatus::Failed,
            errors,
            error_count: latest.error_count,
        };
        match self.store.finish_job(job.id, &finish, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => warn!(job_id = %job.id, "job no longer processing; failure not recorded"),
            Err(err) => error!(job_id = %job.id, error = %err, "could not record job failure"),
        }
        RunOutcome::Failed
    }
}

async fn process_row<T: IngestTx>(
    tx: &mut T,
    adapter: &dyn RowAdapter,
    ctx: &RowContext<'_>,
    cache: &mut ResolutionCache,
    row: &MappedRow,
) -> Result<(), RowFailure> {
    let draft = adapter.adapt(row).map_err(|e| RowFailure::row(e.to_string()))?;
    match draft {
        RowDraft::Contact(draft) => import_contact(tx, cache, ctx, &draft).await.map(|_| ()),
        RowDraft::ValidationResult(draft) => apply_validation_result(tx, ctx, &draft).await.map(|_| ()),
        RowDraft::Submission(draft) => record_submission(tx, ctx, &draft).await.map(|_| ()),
    }
}

/// A dispatched job; await [`JobHandle::wait`] for its outcome.
#[derive(Debug)]
pub struct JobHandle {
    pub job_id: Uuid,
    task: JoinHandle<Result<RunOutcome>>,
}

impl JobHandle {
    pub async fn wait(self) -> Result<RunOutcome> {
        self.task.await.context("ingestion task panicked")?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Runs jobs as supervised tasks, at most `max_concurrent` at a time.
pub struct JobDispatcher<S> {
    runner: Arc<JobRunner<S>>,
    permits: Arc<Semaphore>,
}

impl<S: IngestStore> JobDispatcher<S> {
    pub fn new(runner: JobRunner<S>, max_concurrent: usize) -> Self {
        Self {
            runner: Arc::new(runner),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn runner(&self) -> &Arc<JobRunner<S>> {
        &self.runner
    }

    pub fn submit(&self, job_id: Uuid, mode: ClaimMode) -> JobHandle {
        let runner = Arc::clone(&self.runner);
        let permits = Arc::clone(&self.permits);
        let span = info_span!("ingestion_job", %job_id, job_type = tracing::field::Empty);
        let task = tokio::spawn(
            async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .context("dispatcher is shut down")?;
                runner.run(job_id, mode).await
            }
            .instrument(span),
        );
        JobHandle { job_id, task }
    }

    pub async fn create_and_submit(
        &self,
        job_type: JobType,
        request: NewJobRequest,
    ) -> Result<(JobCreated, JobHandle)> {
        let job = create_job(self.runner.store().as_ref(), job_type, request, Utc::now()).await?;
        let created = JobCreated {
            job_id: job.id,
            status: job.status,
        };
        Ok((created, self.submit(job.id, ClaimMode::Initial)))
    }

    /// Re-dispatches every `processing` job with no progress inside the staleness window.
    pub async fn resume_stale_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobHandle>> {
        let stale_before = now - self.runner.settings().stale_after;
        let stale = self
            .runner
            .store()
            .stale_jobs(stale_before)
            .await
            .context("listing stale jobs")?;
        if !stale.is_empty() {
            info!(count = stale.len(), %stale_before, "resuming stale jobs");
        }
        Ok(stale
            .into_iter()
            .map(|job_id| self.submit(job_id, ClaimMode::Resume { stale_before }))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::{CampaignRules, Dataset};
    use leadflow_storage::MemoryStore;

    async fn setup(batch_size: usize) -> (Arc<MemoryStore>, JobDispatcher<MemoryStore>, Dataset) {
        let store = Arc::new(MemoryStore::new());
        let dataset = Dataset {
            id: Uuid::new_v4(),
            name: "runner".into(),
            rules: CampaignRules::default(),
        };
        store.seed_dataset(dataset.clone()).await;
        let settings = RunSettings {
            batch_size,
            ..RunSettings::default()
        };
        let dispatcher = JobDispatcher::new(JobRunner::new(Arc::clone(&store), settings), 2);
        (store, dispatcher, dataset)
    }

    fn request(dataset: &Dataset, csv: &str) -> NewJobRequest {
        NewJobRequest {
            dataset_id: dataset.id,
            csv_text: csv.to_string(),
            field_mappings: None,
            update_mode: None,
        }
    }

    #[tokio::test]
    async fn unknown_job_is_an_error() {
        let (_store, dispatcher, _) = setup(10).await;
        let err = dispatcher
            .submit(Uuid::new_v4(), ClaimMode::Initial)
            .wait()
            .await
            .expect_err("missing job");
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn finished_job_is_not_claimed_again() {
        let (store, dispatcher, dataset) = setup(10).await;
        let csv = "email,company,title\na@acme.com,Acme,CTO\n";
        let (created, handle) = dispatcher
            .create_and_submit(JobType::ContactImport, request(&dataset, csv))
            .await
            .expect("create");
        assert_eq!(created.status, JobStatus::Pending);
        assert_eq!(handle.wait().await.expect("run"), RunOutcome::Completed);

        let again = dispatcher.submit(created.job_id, ClaimMode::Initial).wait().await.expect("run");
        assert_eq!(again, RunOutcome::NotClaimed);
        let job = store.load_job(created.job_id).await.expect("load").expect("job");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.success_count, 1);
    }

    #[tokio::test]
    async fn missing_dataset_fails_the_job() {
        let (store, dispatcher, _) = setup(10).await;
        let orphan = Dataset {
            id: Uuid::new_v4(),
            name: "orphan".into(),
            rules: CampaignRules::default(),
        };
        let (created, handle) = dispatcher
            .create_and_submit(JobType::ContactImport, request(&orphan, "email\na@acme.com\n"))
            .await
            .expect("create");
        assert_eq!(handle.wait().await.expect("run"), RunOutcome::Failed);
        let job = store.load_job(created.job_id).await.expect("load").expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].row, 0);
        assert!(job.errors[0].message.contains("not found"));
    }

    #[tokio::test]
    async fn empty_file_completes_immediately() {
        let (store, dispatcher, dataset) = setup(10).await;
        let (created, handle) = dispatcher
            .create_and_submit(JobType::ContactImport, request(&dataset, "email,company\n"))
            .await
            .expect("create");
        assert_eq!(handle.wait().await.expect("run"), RunOutcome::Completed);
        let job = store.load_job(created.job_id).await.expect("load").expect("job");
        assert_eq!(job.total_rows, 0);
        assert!(job.finished_at.is_some());
    }

    #[tokio::test]
    async fn trailing_partial_batch_is_its_own_transaction() {
        let csv: String = std::iter::once("email,company,title\n".to_string())
            .chain((1..=7).map(|i| format!("user{i}@acme.com,Acme,CTO\n")))
            .collect();

        for batch_size in [1, 3, 7, 50] {
            let (store, dispatcher, dataset) = setup(batch_size).await;
            let (created, handle) = dispatcher
                .create_and_submit(JobType::ContactImport, request(&dataset, &csv))
                .await
                .expect("create");
            assert_eq!(handle.wait().await.expect("run"), RunOutcome::Completed);
            let job = store.load_job(created.job_id).await.expect("load").expect("job");
            assert_eq!((job.processed_rows, job.success_count), (7, 7), "batch size {batch_size}");
        }

        let (store, dispatcher, dataset) = setup(3).await;
        store.fail_commit_at(3).await;
        let (created, handle) = dispatcher
            .create_and_submit(JobType::ContactImport, request(&dataset, &csv))
            .await
            .expect("create");
        assert_eq!(handle.wait().await.expect("run"), RunOutcome::Interrupted);
        let job = store.load_job(created.job_id).await.expect("load").expect("job");
        assert_eq!(job.processed_rows, 6);
    }
}
