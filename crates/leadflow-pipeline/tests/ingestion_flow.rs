use std::sync::Arc;

use chrono::{Duration, Utc};
use leadflow_core::{
    CampaignRules, Dataset, EligibilityStatus, EmailValidationStatus, JobStatus, JobType,
    NewJobRequest, SuppressionEntry,
};
use leadflow_pipeline::{run_exclusion_sweep, JobDispatcher, JobRunner, RunOutcome, RunSettings};
use leadflow_storage::{IngestStore, MemoryStore};
use uuid::Uuid;

struct Harness {
    store: Arc<MemoryStore>,
    dispatcher: JobDispatcher<MemoryStore>,
    dataset: Dataset,
}

impl Harness {
    async fn new(batch_size: usize) -> Self {
        Self::with_rules(batch_size, CampaignRules::default()).await
    }

    async fn with_rules(batch_size: usize, rules: CampaignRules) -> Self {
        let store = Arc::new(MemoryStore::new());
        let dataset = Dataset {
            id: Uuid::new_v4(),
            name: "q3-outbound".into(),
            rules,
        };
        store.seed_dataset(dataset.clone()).await;
        let settings = RunSettings {
            batch_size,
            ..RunSettings::default()
        };
        let dispatcher = JobDispatcher::new(JobRunner::new(Arc::clone(&store), settings), 4);
        Self {
            store,
            dispatcher,
            dataset,
        }
    }

    async fn import(&self, job_type: JobType, csv: &str, update_mode: bool) -> (Uuid, RunOutcome) {
        let request = NewJobRequest {
            dataset_id: self.dataset.id,
            csv_text: csv.to_string(),
            field_mappings: None,
            update_mode: Some(update_mode),
        };
        let (created, handle) = self
            .dispatcher
            .create_and_submit(job_type, request)
            .await
            .expect("create job");
        (created.job_id, handle.wait().await.expect("run job"))
    }

    async fn job(&self, id: Uuid) -> leadflow_core::IngestionJob {
        self.store.load_job(id).await.expect("load").expect("job exists")
    }
}

const CONTACTS: &str = "\
first_name,last_name,email,company,domain,title,country
Ada,Lovelace,ada@acme.com,Acme Inc,acme.com,VP Engineering,US
Grace,Hopper,grace@acme.com,ACME,,Director of IT,USA
Linus,Torvalds,linus@initech.io,Initech,initech.io,Head of Platform,Finland
Margaret,Hamilton,margaret@globex.com,Globex,globex.com,CTO,US
Ken,Thompson,ken@globex.com,Globex Corporation,,Principal Engineer,US
";

#[tokio::test]
async fn reimporting_the_same_file_changes_nothing() {
    let h = Harness::new(2).await;
    let (first, outcome) = h.import(JobType::ContactImport, CONTACTS, false).await;
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(h.job(first).await.success_count, 5);

    let before = h.store.snapshot().await;
    let (second, outcome) = h.import(JobType::ContactImport, CONTACTS, true).await;
    assert_eq!(outcome, RunOutcome::Completed);
    let after = h.store.snapshot().await;

    assert_eq!(h.job(second).await.success_count, 5);
    assert_eq!(before.contacts.len(), after.contacts.len());
    assert_eq!(before.live_accounts().count(), after.live_accounts().count());
    assert_eq!(before.field_changes.len(), after.field_changes.len());
}

#[tokio::test]
async fn rows_sharing_a_domain_resolve_to_one_account() {
    let h = Harness::new(1).await;
    let (_, outcome) = h.import(JobType::ContactImport, CONTACTS, false).await;
    assert_eq!(outcome, RunOutcome::Completed);

    let state = h.store.snapshot().await;
    assert_eq!(state.live_accounts().count(), 3);
    let ada = state.contact_by_email(h.dataset.id, "ada@acme.com").expect("ada");
    let grace = state.contact_by_email(h.dataset.id, "grace@acme.com").expect("grace");
    assert!(ada.account_id.is_some());
    assert_eq!(ada.account_id, grace.account_id);

    let margaret = state.contact_by_email(h.dataset.id, "margaret@globex.com").expect("margaret");
    let ken = state.contact_by_email(h.dataset.id, "ken@globex.com").expect("ken");
    assert_eq!(margaret.account_id, ken.account_id);
}

#[tokio::test]
async fn interrupted_job_resumes_from_its_checkpoint() {
    let h = Harness::new(2).await;
    h.store.fail_commit_at(2).await;

    let (job_id, outcome) = h.import(JobType::ContactImport, CONTACTS, false).await;
    assert_eq!(outcome, RunOutcome::Interrupted);
    let stalled = h.job(job_id).await;
    assert_eq!(stalled.status, JobStatus::Processing);
    assert_eq!(stalled.processed_rows, 2);
    assert_eq!(h.store.snapshot().await.contacts.len(), 2);

    let nothing_stale = h.dispatcher.resume_stale_jobs(Utc::now()).await.expect("sweep");
    assert!(nothing_stale.is_empty());

    let handles = h
        .dispatcher
        .resume_stale_jobs(Utc::now() + Duration::minutes(10))
        .await
        .expect("sweep");
    assert_eq!(handles.len(), 1);
    for handle in handles {
        assert_eq!(handle.wait().await.expect("resume"), RunOutcome::Completed);
    }

    let job = h.job(job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.resume_count, 1);
    assert_eq!(job.processed_rows, job.total_rows);
    assert_eq!(job.success_count + job.error_count, job.total_rows);
    assert_eq!(h.store.snapshot().await.contacts.len(), 5);
}

#[tokio::test]
async fn row_errors_are_recorded_without_failing_the_job() {
    let h = Harness::new(10).await;
    let csv = "\
email,first_name,company,title
ok@acme.com,Ok,Acme,CTO
,,Acme,CTO
not-an-email,Bad,Acme,CTO
";
    let (job_id, outcome) = h.import(JobType::ContactImport, csv, false).await;
    assert_eq!(outcome, RunOutcome::Completed);

    let job = h.job(job_id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.success_count, 1);
    assert_eq!(job.error_count, 2);
    let rows: Vec<u64> = job.errors.iter().map(|e| e.row).collect();
    assert_eq!(rows, vec![2, 3]);
    assert_eq!(job.errors[0].message, "missing required field: email or name");
}

#[tokio::test]
async fn unparseable_file_fails_the_job() {
    let h = Harness::new(10).await;
    let (job_id, outcome) = h
        .import(JobType::ContactImport, "email,company\na@acme.com,Acme,extra\n", false)
        .await;
    assert_eq!(outcome, RunOutcome::Failed);
    let job = h.job(job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.errors.len(), 1);
    assert_eq!(job.errors[0].row, 0);
    assert!(job.finished_at.is_some());

    let (job_id, outcome) = h
        .import(JobType::SubmissionImport, "email,lead_id\na@acme.com,1\n", false)
        .await;
    assert_eq!(outcome, RunOutcome::Failed);
    assert_eq!(h.job(job_id).await.processed_rows, 0);
}

#[tokio::test]
async fn suppression_needs_an_exact_key() {
    let h = Harness::new(10).await;
    h.store
        .seed_suppression(SuppressionEntry::new(
            None,
            Some("Blocked@Acme.com"),
            None,
            None,
            None,
            None,
            Utc::now(),
        ))
        .await;
    h.store
        .seed_suppression(SuppressionEntry::new(
            Some(h.dataset.id),
            None,
            None,
            None,
            Some("John Smith"),
            Some("Acme"),
            Utc::now(),
        ))
        .await;

    let csv = "\
email,first_name,last_name,company,title
blocked@acme.com,Bea,Blocked,Acme,CTO
john@acme.com,John,Smith,Acme,CTO
jane@acme.com,Jane,Smith,Acme,CTO
john@globex.com,John,Smith,Globex,CTO
";
    let (_, outcome) = h.import(JobType::ContactImport, csv, false).await;
    assert_eq!(outcome, RunOutcome::Completed);

    let state = h.store.snapshot().await;
    let status = |email: &str| {
        let contact = state.contact_by_email(h.dataset.id, email).expect("contact");
        (contact.suppressed, contact.eligibility_status)
    };
    assert_eq!(status("blocked@acme.com"), (true, EligibilityStatus::Excluded));
    assert_eq!(status("john@acme.com"), (true, EligibilityStatus::Excluded));
    assert_eq!(status("jane@acme.com"), (false, EligibilityStatus::Eligible));
    assert_eq!(status("john@globex.com"), (false, EligibilityStatus::Eligible));
}

#[tokio::test]
async fn eligibility_follows_campaign_rules() {
    let rules = CampaignRules {
        allowed_title_keywords: vec!["VP".into(), "Director".into(), "Head of".into()],
        excluded_title_keywords: vec!["Principal".into()],
        allowed_countries: vec!["United States".into()],
    };
    let h = Harness::with_rules(10, rules).await;
    let (_, outcome) = h.import(JobType::ContactImport, CONTACTS, false).await;
    assert_eq!(outcome, RunOutcome::Completed);

    let state = h.store.snapshot().await;
    let status = |email: &str| {
        state
            .contact_by_email(h.dataset.id, email)
            .map(|c| c.eligibility_status)
            .expect("contact")
    };
    assert_eq!(status("ada@acme.com"), EligibilityStatus::Eligible);
    assert_eq!(status("grace@acme.com"), EligibilityStatus::Eligible);
    assert_eq!(status("linus@initech.io"), EligibilityStatus::IneligibleGeography);
    assert_eq!(status("margaret@globex.com"), EligibilityStatus::IneligibleTitle);
    assert_eq!(status("ken@globex.com"), EligibilityStatus::IneligibleTitle);
}

#[tokio::test]
async fn validation_results_update_matching_contacts() {
    let h = Harness::new(10).await;
    h.import(JobType::ContactImport, CONTACTS, false).await;

    let csv = "\
email,status
ada@acme.com,invalid
GRACE@acme.com,valid
nobody@acme.com,invalid
";
    let (job_id, outcome) = h.import(JobType::ValidationResultImport, csv, false).await;
    assert_eq!(outcome, RunOutcome::Completed);
    let job = h.job(job_id).await;
    assert_eq!((job.success_count, job.error_count), (2, 1));

    let state = h.store.snapshot().await;
    let ada = state.contact_by_email(h.dataset.id, "ada@acme.com").expect("ada");
    assert_eq!(ada.email_validation, Some(EmailValidationStatus::Invalid));
    assert_eq!(ada.eligibility_status, EligibilityStatus::IneligibleEmailInvalid);
    let grace = state.contact_by_email(h.dataset.id, "grace@acme.com").expect("grace");
    assert_eq!(grace.eligibility_status, EligibilityStatus::Eligible);
}

#[tokio::test]
async fn exclusion_sweep_uses_the_submission_window() {
    let h = Harness::new(10).await;
    h.import(JobType::ContactImport, CONTACTS, false).await;

    let recent = (Utc::now() - Duration::days(100)).format("%Y-%m-%d");
    let old = (Utc::now() - Duration::days(800)).format("%Y-%m-%d");
    let csv = format!(
        "email,submitted_at,submission_ref\n\
         ada@acme.com,{recent},S-1\n\
         linus@initech.io,{old},S-2\n\
         ada@acme.com,{recent},S-1\n"
    );
    let (job_id, outcome) = h.import(JobType::SubmissionImport, &csv, false).await;
    assert_eq!(outcome, RunOutcome::Completed);
    assert_eq!(h.job(job_id).await.success_count, 3);
    assert_eq!(h.store.snapshot().await.submissions.len(), 2);

    let summary = run_exclusion_sweep(h.store.as_ref(), h.dataset.id, Duration::days(730), "test", Utc::now())
        .await
        .expect("sweep");
    assert_eq!(summary.examined, 2);
    assert_eq!(summary.marked_recent, 1);

    let state = h.store.snapshot().await;
    let status = |email: &str| {
        state
            .contact_by_email(h.dataset.id, email)
            .map(|c| c.eligibility_status)
            .expect("contact")
    };
    assert_eq!(status("ada@acme.com"), EligibilityStatus::IneligibleRecentlySubmitted);
    assert_eq!(status("linus@initech.io"), EligibilityStatus::Eligible);

    let again = run_exclusion_sweep(h.store.as_ref(), h.dataset.id, Duration::days(730), "test", Utc::now())
        .await
        .expect("sweep");
    assert_eq!(again.marked_recent, 0);
    assert_eq!(again.unchanged, 2);

    // A re-import keeps the sweep's verdict.
    h.import(JobType::ContactImport, CONTACTS, true).await;
    let state = h.store.snapshot().await;
    let ada = state.contact_by_email(h.dataset.id, "ada@acme.com").expect("ada");
    assert_eq!(ada.eligibility_status, EligibilityStatus::IneligibleRecentlySubmitted);

    let released = run_exclusion_sweep(h.store.as_ref(), h.dataset.id, Duration::days(30), "test", Utc::now())
        .await
        .expect("sweep");
    assert_eq!(released.released, 1);
}

#[tokio::test]
async fn latest_submission_decides_and_old_exclusions_are_released() {
    let h = Harness::new(10).await;
    h.import(JobType::ContactImport, CONTACTS, false).await;
    h.import(JobType::ValidationResultImport, "email,status\nmargaret@globex.com,invalid\n", false)
        .await;

    let recent = (Utc::now() - Duration::days(100)).format("%Y-%m-%d");
    let old = (Utc::now() - Duration::days(800)).format("%Y-%m-%d");
    let csv = format!(
        "email,submitted_at\n\
         grace@acme.com,{recent}\n\
         grace@acme.com,{old}\n\
         margaret@globex.com,{old}\n"
    );
    let (_, outcome) = h.import(JobType::SubmissionImport, &csv, false).await;
    assert_eq!(outcome, RunOutcome::Completed);

    // A longer window puts the 800-day submission inside it.
    let wide = run_exclusion_sweep(h.store.as_ref(), h.dataset.id, Duration::days(1000), "test", Utc::now())
        .await
        .expect("sweep");
    assert_eq!(wide.marked_recent, 2);

    let summary = run_exclusion_sweep(h.store.as_ref(), h.dataset.id, Duration::days(730), "test", Utc::now())
        .await
        .expect("sweep");
    assert_eq!(summary.released, 1);
    assert_eq!(summary.marked_recent, 0);

    let state = h.store.snapshot().await;
    let grace = state.contact_by_email(h.dataset.id, "grace@acme.com").expect("grace");
    assert_eq!(grace.eligibility_status, EligibilityStatus::IneligibleRecentlySubmitted);
    let margaret = state.contact_by_email(h.dataset.id, "margaret@globex.com").expect("margaret");
    assert_eq!(margaret.eligibility_status, EligibilityStatus::PendingEmailValidation);
    assert_eq!(margaret.email_validation, None);
}

#[tokio::test]
async fn sweep_and_reimport_agree_on_rejected_titles() {
    let rules = CampaignRules {
        allowed_title_keywords: vec!["VP".into()],
        ..CampaignRules::default()
    };
    let h = Harness::with_rules(10, rules).await;
    let contacts = "\
email,first_name,company,title
intern@acme.com,Ira,Acme,Intern
vp@acme.com,Vera,Acme,VP Sales
";
    h.import(JobType::ContactImport, contacts, false).await;
    let recent = (Utc::now() - Duration::days(100)).format("%Y-%m-%d");
    let submissions = format!("email,submitted_at\nintern@acme.com,{recent}\nvp@acme.com,{recent}\n");
    h.import(JobType::SubmissionImport, &submissions, false).await;

    let first = run_exclusion_sweep(h.store.as_ref(), h.dataset.id, Duration::days(730), "test", Utc::now())
        .await
        .expect("sweep");
    assert_eq!(first.marked_recent, 1);
    let settled = h.store.snapshot().await.field_changes.len();

    for _ in 0..2 {
        h.import(JobType::ContactImport, contacts, true).await;
        let sweep = run_exclusion_sweep(h.store.as_ref(), h.dataset.id, Duration::days(730), "test", Utc::now())
            .await
            .expect("sweep");
        assert_eq!(sweep.marked_recent, 0);

        let state = h.store.snapshot().await;
        assert_eq!(state.field_changes.len(), settled);
        let status = |email: &str| {
            state
                .contact_by_email(h.dataset.id, email)
                .map(|c| c.eligibility_status)
                .expect("contact")
        };
        assert_eq!(status("intern@acme.com"), EligibilityStatus::IneligibleTitle);
        assert_eq!(status("vp@acme.com"), EligibilityStatus::IneligibleRecentlySubmitted);
    }
}
