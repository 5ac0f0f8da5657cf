//! Ingestion pipeline: account resolution, contact upsert, suppression, eligibility, job running.

pub mod config;
pub mod eligibility;
pub mod resolver;
pub mod runner;
pub mod scheduler;
pub mod suppression;
pub mod upsert;
pub mod verification;

pub use config::PipelineConfig;
pub use eligibility::{evaluate_eligibility, reconcile, run_exclusion_sweep, EligibilityDecision, SweepSummary};
pub use resolver::{resolve_account, AccountQuery, MatchScore, MatchType, Resolution, ResolutionCache};
pub use runner::{create_job, JobDispatcher, JobHandle, JobRunner, RunOutcome, RunSettings};
pub use scheduler::{build_scheduler, sweep_all_datasets};
pub use suppression::{is_suppressed, match_suppression, SuppressionMatch};
pub use upsert::{import_contact, ContactOutcome, RowContext, RowFailure, UpsertAction};
pub use verification::{verify_pending, VerificationSummary};

pub const CRATE_NAME: &str = "leadflow-pipeline";
