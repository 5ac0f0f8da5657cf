//! Cron wiring for the background sweeps.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use leadflow_storage::IngestStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::config::PipelineConfig;
use crate::eligibility::{run_exclusion_sweep, SweepSummary};
use crate::runner::JobDispatcher;

/// Runs the exclusion sweep for every dataset. One failing dataset does not stop the rest.
pub async fn sweep_all_datasets<S: IngestStore>(
    store: &S,
    window: Duration,
    source_system: &str,
) -> Result<Vec<SweepSummary>> {
    let dataset_ids = store.dataset_ids().await.context("listing datasets")?;
    let mut summaries = Vec::with_capacity(dataset_ids.len());
    for dataset_id in dataset_ids {
        match run_exclusion_sweep(store, dataset_id, window, source_system, Utc::now()).await {
            Ok(summary) => summaries.push(summary),
            Err(err) => warn!(%dataset_id, error = %format!("{err:#}"), "exclusion sweep failed"),
        }
    }
    Ok(summaries)
}

/// `None` when the scheduler is disabled.
pub async fn build_scheduler<S: IngestStore>(
    config: &PipelineConfig,
    dispatcher: Arc<JobDispatcher<S>>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let resume_dispatcher = Arc::clone(&dispatcher);
    let resume = Job::new_async(config.resume_cron.as_str(), move |_uuid, _l| {
        let dispatcher = Arc::clone(&resume_dispatcher);
        Box::pin(async move {
            match dispatcher.resume_stale_jobs(Utc::now()).await {
                Ok(handles) if !handles.is_empty() => {
                    info!(count = handles.len(), "stale jobs re-dispatched");
                }
                Ok(_) => {}
                Err(err) => error!(error = %format!("{err:#}"), "resume sweep failed"),
            }
        })
    })
    .with_context(|| format!("creating resume job for cron {}", config.resume_cron))?;
    sched.add(resume).await.context("adding resume job")?;

    let window = config.exclusion_window();
    let source_system = config.source_system.clone();
    let exclusion = Job::new_async(config.exclusion_cron.as_str(), move |_uuid, _l| {
        let store = Arc::clone(dispatcher.runner().store());
        let source_system = source_system.clone();
        Box::pin(async move {
            if let Err(err) = sweep_all_datasets(store.as_ref(), window, &source_system).await {
                error!(error = %format!("{err:#}"), "exclusion sweep failed");
            }
        })
    })
    .with_context(|| format!("creating exclusion job for cron {}", config.exclusion_cron))?;
    sched.add(exclusion).await.context("adding exclusion job")?;

    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{JobRunner, RunSettings};
    use leadflow_core::{CampaignRules, Contact, Dataset, EligibilityStatus, LeadSubmission};
    use leadflow_storage::MemoryStore;
    use uuid::Uuid;

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = Arc::new(JobDispatcher::new(
            JobRunner::new(store, RunSettings::default()),
            1,
        ));
        let config = PipelineConfig::default();
        assert!(build_scheduler(&config, dispatcher).await.expect("build").is_none());
    }

    #[tokio::test]
    async fn sweep_covers_every_dataset() {
        let store = MemoryStore::new();
        let mut contacts = Vec::new();
        for name in ["east", "west"] {
            let dataset = Dataset {
                id: Uuid::new_v4(),
                name: name.into(),
                rules: CampaignRules::default(),
            };
            store.seed_dataset(dataset.clone()).await;
            let mut contact = Contact::new(dataset.id, Utc::now());
            contact.title = Some("CTO".into());
            contact.email = Some(format!("cto@{name}.com"));
            contact.eligibility_status = EligibilityStatus::Eligible;
            store.seed_contact(contact.clone()).await;
            store
                .seed_submission(LeadSubmission {
                    id: Uuid::new_v4(),
                    dataset_id: dataset.id,
                    contact_id: contact.id,
                    submitted_at: Utc::now() - Duration::days(30),
                    submission_ref: None,
                    created_at: Utc::now(),
                })
                .await;
            contacts.push(contact.id);
        }

        let summaries = sweep_all_datasets(&store, Duration::days(730), "test")
            .await
            .expect("sweep");
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().all(|s| s.marked_recent == 1));

        let state = store.snapshot().await;
        for id in contacts {
            let contact = state.contacts.iter().find(|c| c.id == id).expect("contact");
            assert_eq!(contact.eligibility_status, EligibilityStatus::IneligibleRecentlySubmitted);
        }
    }
}
