use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use leadflow_core::{CampaignRules, Dataset, FieldMapping, JobStatusView, JobType, NewJobRequest};
use leadflow_pipeline::{
    build_scheduler, run_exclusion_sweep, verify_pending, JobDispatcher, JobRunner, PipelineConfig,
    RunOutcome, RunSettings,
};
use leadflow_storage::{HttpEmailVerifier, IngestStore, MemoryStore, PgStore};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "leadflow-cli")]
#[command(about = "Bulk lead ingestion: CSV imports, resolution, suppression and eligibility")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply embedded database migrations.
    Migrate,
    /// Create an ingestion job from a CSV file and run it to completion.
    Import(ImportArgs),
    /// Print the status document of a job.
    Status { job_id: Uuid },
    /// Re-dispatch stale `processing` jobs once.
    Resume,
    /// Recompute recent-submission exclusions for a dataset.
    SweepExclusions {
        #[arg(long)]
        dataset: Uuid,
        #[arg(long)]
        window_days: Option<i64>,
    },
    /// Send pending contacts to the email verifier.
    VerifyPending {
        #[arg(long)]
        dataset: Uuid,
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },
    /// Run the cron scheduler until interrupted.
    Scheduler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum JobKind {
    Contact,
    Validation,
    Submission,
}

impl From<JobKind> for JobType {
    fn from(kind: JobKind) -> Self {
        match kind {
            JobKind::Contact => JobType::ContactImport,
            JobKind::Validation => JobType::ValidationResultImport,
            JobKind::Submission => JobType::SubmissionImport,
        }
    }
}

#[derive(Debug, clap::Args)]
struct ImportArgs {
    #[arg(long)]
    dataset: Uuid,
    #[arg(long)]
    file: PathBuf,
    #[arg(long, value_enum, default_value_t = JobKind::Contact)]
    job_type: JobKind,
    /// Header override, `column=field`. Repeatable.
    #[arg(long = "map", value_parser = parse_mapping)]
    mappings: Vec<FieldMapping>,
    /// JSON array of `{"csvColumn": .., "targetField": ..}` overrides.
    #[arg(long)]
    mapping_file: Option<PathBuf>,
    #[arg(long)]
    update: bool,
    /// Run against an in-memory store instead of the database.
    #[arg(long)]
    dry_run: bool,
    /// Campaign rules (JSON) for the dry-run dataset.
    #[arg(long, requires = "dry_run")]
    rules_file: Option<PathBuf>,
}

fn parse_mapping(raw: &str) -> Result<FieldMapping, String> {
    let (column, field) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected column=field, got '{raw}'"))?;
    let (column, field) = (column.trim(), field.trim());
    if column.is_empty() || field.is_empty() {
        return Err(format!("expected column=field, got '{raw}'"));
    }
    Ok(FieldMapping {
        csv_column: column.to_string(),
        target_field: field.to_string(),
    })
}

fn load_mapping_file(path: &Path) -> Result<Vec<FieldMapping>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn load_rules(path: Option<&Path>) -> Result<CampaignRules> {
    let Some(path) = path else {
        return Ok(CampaignRules::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn dispatcher<S: IngestStore>(store: Arc<S>, config: &PipelineConfig) -> JobDispatcher<S> {
    JobDispatcher::new(
        JobRunner::new(store, RunSettings::from(config)),
        config.max_concurrent_jobs,
    )
}

async fn connect(config: &PipelineConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url, config.db_max_connections)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

async fn import_with<S: IngestStore>(
    store: Arc<S>,
    config: &PipelineConfig,
    args: &ImportArgs,
) -> Result<JobStatusView> {
    let csv_text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let mut mappings = match &args.mapping_file {
        Some(path) => load_mapping_file(path)?,
        None => Vec::new(),
    };
    mappings.extend(args.mappings.iter().cloned());

    let request = NewJobRequest {
        dataset_id: args.dataset,
        csv_text,
        field_mappings: Some(mappings),
        update_mode: Some(args.update),
    };
    let dispatcher = dispatcher(Arc::clone(&store), config);
    let (created, handle) = dispatcher
        .create_and_submit(args.job_type.into(), request)
        .await?;
    info!(job_id = %created.job_id, "import dispatched");
    let outcome = handle.wait().await?;
    if outcome != RunOutcome::Completed {
        warn!(job_id = %created.job_id, ?outcome, "import did not complete");
    }
    let job = store
        .load_job(created.job_id)
        .await?
        .ok_or_else(|| anyhow!("job {} vanished", created.job_id))?;
    Ok(job.status_view())
}

async fn import(config: &PipelineConfig, args: ImportArgs) -> Result<JobStatusView> {
    if args.dry_run {
        let store = Arc::new(MemoryStore::new());
        store
            .seed_dataset(Dataset {
                id: args.dataset,
                name: "dry-run".to_string(),
                rules: load_rules(args.rules_file.as_deref())?,
            })
            .await;
        return import_with(store, config, &args).await;
    }
    import_with(connect(config).await?, config, &args).await
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    leadflow_adapters::validate_alias_table().context("header alias table")?;
    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Migrate => {
            connect(&config).await?.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Import(args) => {
            let view = import(&config, args).await?;
            print_json(&view)?;
        }
        Commands::Status { job_id } => {
            let store = connect(&config).await?;
            let job = store
                .load_job(job_id)
                .await?
                .ok_or_else(|| anyhow!("job {job_id} not found"))?;
            print_json(&job.status_view())?;
        }
        Commands::Resume => {
            let dispatcher = dispatcher(connect(&config).await?, &config);
            let handles = dispatcher.resume_stale_jobs(Utc::now()).await?;
            println!("resumed {} job(s)", handles.len());
            for handle in handles {
                let job_id = handle.job_id;
                match handle.wait().await {
                    Ok(outcome) => println!("{job_id}: {}", serde_json::to_string(&outcome)?),
                    Err(err) => println!("{job_id}: error: {err:#}"),
                }
            }
        }
        Commands::SweepExclusions {
            dataset,
            window_days,
        } => {
            let store = connect(&config).await?;
            let window = match window_days {
                Some(days) if days > 0 => chrono::Duration::days(days),
                Some(days) => bail!("--window-days must be positive, got {days}"),
                None => config.exclusion_window(),
            };
            let summary =
                run_exclusion_sweep(store.as_ref(), dataset, window, &config.source_system, Utc::now())
                    .await?;
            print_json(&summary)?;
        }
        Commands::VerifyPending { dataset, limit } => {
            let verifier_config = config
                .verifier_config()
                .ok_or_else(|| anyhow!("VERIFIER_URL is not set"))?;
            let verifier = Arc::new(HttpEmailVerifier::new(verifier_config)?);
            let store = connect(&config).await?;
            let summary = verify_pending(
                store.as_ref(),
                verifier,
                dataset,
                limit,
                &config.source_system,
                Utc::now(),
            )
            .await?;
            print_json(&summary)?;
        }
        Commands::Scheduler => {
            let dispatcher = Arc::new(dispatcher(connect(&config).await?, &config));
            let resumed = dispatcher.resume_stale_jobs(Utc::now()).await?;
            info!(count = resumed.len(), "startup resume sweep");
            let Some(mut sched) = build_scheduler(&config, Arc::clone(&dispatcher)).await? else {
                bail!("scheduler disabled; set LEADFLOW_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadflow_core::JobStatus;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write");
        file
    }

    #[test]
    fn mapping_flag_parses_pairs() {
        let mapping = parse_mapping(" Work Email = email ").expect("mapping");
        assert_eq!(mapping.csv_column, "Work Email");
        assert_eq!(mapping.target_field, "email");
        assert!(parse_mapping("email").is_err());
        assert!(parse_mapping("=email").is_err());
    }

    #[test]
    fn import_args_parse() {
        let cli = Cli::try_parse_from([
            "leadflow-cli",
            "import",
            "--dataset",
            "7f1b5c2e-8c0a-4b53-9a53-2f7d3f0c6a11",
            "--file",
            "leads.csv",
            "--job-type",
            "submission",
            "--map",
            "Lead Id=submission_ref",
            "--dry-run",
        ])
        .expect("parse");
        let Commands::Import(args) = cli.command else {
            panic!("expected import");
        };
        assert_eq!(args.job_type, JobKind::Submission);
        assert_eq!(args.mappings.len(), 1);
        assert!(args.dry_run && !args.update);
    }

    #[test]
    fn rules_file_requires_dry_run() {
        let parsed = Cli::try_parse_from([
            "leadflow-cli",
            "import",
            "--dataset",
            "7f1b5c2e-8c0a-4b53-9a53-2f7d3f0c6a11",
            "--file",
            "leads.csv",
            "--rules-file",
            "rules.json",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn mapping_file_uses_camel_case_keys() {
        let file = write_temp(r#"[{"csvColumn": "E-Mail", "targetField": "email"}]"#);
        let mappings = load_mapping_file(file.path()).expect("load");
        assert_eq!(mappings[0].csv_column, "E-Mail");
    }

    #[tokio::test]
    async fn dry_run_import_reports_status() {
        let csv = write_temp("E-Mail,Company,Job Title,Country\nada@acme.com,Acme,VP Sales,US\nbob@acme.com,Acme,Intern,US\n");
        let rules = write_temp(r#"{"excluded_title_keywords": ["intern"]}"#);
        let mapping = write_temp(r#"[{"csvColumn": "E-Mail", "targetField": "email"}]"#);
        let args = ImportArgs {
            dataset: Uuid::new_v4(),
            file: csv.path().to_path_buf(),
            job_type: JobKind::Contact,
            mappings: Vec::new(),
            mapping_file: Some(mapping.path().to_path_buf()),
            update: false,
            dry_run: true,
            rules_file: Some(rules.path().to_path_buf()),
        };
        let view = import(&PipelineConfig::default(), args).await.expect("import");
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.total_rows, 2);
        assert_eq!(view.success_count, 2);
        assert!(view.errors.is_empty());
    }

    #[tokio::test]
    async fn missing_csv_file_is_reported() {
        let args = ImportArgs {
            dataset: Uuid::new_v4(),
            file: PathBuf::from("/nonexistent/leads.csv"),
            job_type: JobKind::Contact,
            mappings: Vec::new(),
            mapping_file: None,
            update: false,
            dry_run: true,
            rules_file: None,
        };
        let err = import(&PipelineConfig::default(), args).await.expect_err("missing file");
        assert!(format!("{err:#}").contains("reading"));
    }
}
