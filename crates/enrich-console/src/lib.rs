//! Enrichment console orchestration: scheduler gateway, job board, monitors, reconciliation and
//! the live console session.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use enrich_core::{lookup, lookup_str, registry, Job, ProgressSnapshot, TaskDefinition, TaskId, VerificationSnapshot, DEFAULT_TASK};
use enrich_progress::{compute_snapshot, ProgressContext};
use enrich_store::{FunctionClient, RealtimeHub, Store, StoreConfig, StoreError};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{info, warn};

pub mod gateway;
pub mod jobs;
pub mod monitor;
pub mod reconcile;
pub mod session;

pub use gateway::{
    scale_up_count, ActionOutcome, AlwaysConfirm, Confirm, ConfirmPrompt, ConsoleAction, FreshVerification,
    GatewayError, MissingEstimate, NeverConfirm, SchedulerGateway, SchedulerResponse, DEFAULT_SCHEDULER_FUNCTION,
    MAX_SCALE_UP,
};
pub use jobs::{active_job, fetch_batches, fetch_recent_jobs, ActiveJobView, JobBoard};
pub use monitor::{detect_stuck, evaluate_health, STUCK_BATCH_THRESHOLD};
pub use reconcile::{prune_facets, reconcile, verify, PruneReport, ReconciliationReport};
pub use session::{reduce, ConsoleSession, ConsoleState, SessionUpdate};

pub const CRATE_NAME: &str = "enrich-console";

#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub store: StoreConfig,
    pub scheduler_function: String,
    pub poll_interval: Duration,
    pub verification_max_age: Duration,
    pub default_task: TaskId,
    pub scale_batch_size: u32,
    pub reconcile_scheduler_enabled: bool,
    pub reconcile_cron: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            scheduler_function: DEFAULT_SCHEDULER_FUNCTION.to_string(),
            poll_interval: Duration::from_secs(10),
            verification_max_age: Duration::from_secs(10 * 60),
            default_task: DEFAULT_TASK,
            scale_batch_size: 10,
            reconcile_scheduler_enabled: false,
            reconcile_cron: "0 0 * * * *".to_string(),
        }
    }
}

impl ConsoleConfig {
    pub fn from_env() -> Self {
        let secs = |key: &str, default: u64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            store: StoreConfig::from_env(),
            scheduler_function: std::env::var("ENRICH_SCHEDULER_FUNCTION")
                .unwrap_or_else(|_| DEFAULT_SCHEDULER_FUNCTION.to_string()),
            poll_interval: Duration::from_secs(secs("ENRICH_POLL_INTERVAL_SECS", 10).max(1)),
            verification_max_age: Duration::from_secs(secs("ENRICH_VERIFY_MAX_AGE_SECS", 600)),
            default_task: std::env::var("ENRICH_DEFAULT_TASK")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TASK),
            scale_batch_size: secs("ENRICH_SCALE_BATCH_SIZE", 10).clamp(1, u32::MAX as u64) as u32,
            reconcile_scheduler_enabled: std::env::var("ENRICH_RECONCILE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            reconcile_cron: std::env::var("ENRICH_RECONCILE_CRON").unwrap_or_else(|_| "0 0 * * * *".to_string()),
        }
    }

    pub fn verification_max_age_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.verification_max_age).unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionParams {
    /// Requested scale-up for `recover_and_scale`.
    pub workers: Option<u32>,
    pub batch_size: Option<u32>,
}

/// Local state an action is judged against.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionContext {
    pub active_job: Option<Job>,
    pub remaining: u64,
    pub processing: usize,
    pub verification: Option<VerificationSnapshot>,
    pub estimate: Option<MissingEstimate>,
    pub now: DateTime<Utc>,
}

impl ActionContext {
    pub fn from_parts(snapshot: &ProgressSnapshot, board: &JobBoard, now: DateTime<Utc>) -> Self {
        Self {
            active_job: board.active_job().cloned(),
            remaining: snapshot.remaining,
            processing: board.processing_count(),
            verification: None,
            estimate: None,
            now,
        }
    }
}

pub struct Console {
    store: Arc<dyn Store>,
    gateway: SchedulerGateway,
    hub: RealtimeHub,
    config: ConsoleConfig,
}

impl Console {
    pub fn new(store: Arc<dyn Store>, functions: Arc<dyn FunctionClient>, hub: RealtimeHub, config: ConsoleConfig) -> Self {
        let gateway = SchedulerGateway::new(functions, config.scheduler_function.clone());
        Self {
            store,
            gateway,
            hub,
            config,
        }
    }

    pub async fn from_config(config: ConsoleConfig) -> Result<Self> {
        let store = config.store.connect_store().await.context("connecting store")?;
        let functions = config.store.function_client().context("building function client")?;
        Ok(Self::new(store, functions, RealtimeHub::default(), config))
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(ConsoleConfig::from_env()).await
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn gateway(&self) -> &SchedulerGateway {
        &self.gateway
    }

    pub fn hub(&self) -> &RealtimeHub {
        &self.hub
    }

    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    pub async fn snapshot(&self, task: &TaskDefinition, stage: Option<&str>) -> ProgressSnapshot {
        let ctx = ProgressContext {
            stage: stage.map(str::to_string),
        };
        compute_snapshot(self.store(), task, &ctx).await
    }

    pub async fn job_board(&self, task: &TaskDefinition) -> Result<JobBoard, StoreError> {
        JobBoard::load(self.store(), task).await
    }

    /// Fresh context for one-shot callers that hold no session state.
    pub async fn action_context(&self, task: &TaskDefinition, stage: Option<&str>) -> Result<ActionContext, StoreError> {
        let (snapshot, board) = tokio::join!(self.snapshot(task, stage), self.job_board(task));
        Ok(ActionContext::from_parts(&snapshot, &board?, Utc::now()))
    }

    pub async fn execute(
        &self,
        task: &TaskDefinition,
        action: ConsoleAction,
        params: &ActionParams,
        ctx: &ActionContext,
        confirm: &dyn Confirm,
    ) -> Result<ActionOutcome, GatewayError> {
        let store_err = |source: StoreError| GatewayError::Store { action, source };
        let active = ctx.active_job.as_ref();

        match action {
            ConsoleAction::Start => self.gateway.start(task, active).await,
            ConsoleAction::Continue => self.gateway.continue_job(task, active, ctx.remaining).await,
            ConsoleAction::Recover => self.gateway.recover(task).await,
            ConsoleAction::RecoverAndScale => {
                self.gateway
                    .recover_and_scale(
                        task,
                        active,
                        ctx.processing,
                        params.workers.unwrap_or(MAX_SCALE_UP),
                        params.batch_size.unwrap_or(self.config.scale_batch_size),
                    )
                    .await
            }
            ConsoleAction::DedupeBatches => self.gateway.dedupe_batches(task).await,
            ConsoleAction::AbortDuplicates => self.gateway.abort_duplicates(task).await,
            ConsoleAction::ClearAll => self.gateway.clear_all(task, confirm).await,
            ConsoleAction::ComputeMissing => {
                let estimate = self.gateway.compute_missing(task).await?;
                Ok(ActionOutcome {
                    action: Some(action),
                    message: format!("{} missing items", estimate.missing_count),
                    estimate: Some(estimate),
                    ..Default::default()
                })
            }
            ConsoleAction::StartMissing => {
                let fresh = FreshVerification::check(
                    ctx.verification.as_ref(),
                    task.task_id,
                    ctx.now,
                    self.config.verification_max_age_chrono(),
                )?;
                let estimate = ctx.estimate.as_ref().ok_or_else(|| GatewayError::Precondition {
                    action,
                    reason: "compute missing items first".to_string(),
                })?;
                self.gateway.start_missing(task, estimate, &fresh, confirm).await
            }
            ConsoleAction::Verify => {
                let snapshot = verify(self.store(), task, ctx.now).await.map_err(store_err)?;
                Ok(ActionOutcome {
                    action: Some(action),
                    message: format!(
                        "{} of {} unique sources enriched ({} target rows)",
                        snapshot.enriched_unique, snapshot.total_unique, snapshot.baseline_count
                    ),
                    verification: Some(snapshot),
                    ..Default::default()
                })
            }
            ConsoleAction::Reconcile => {
                let report = reconcile(self.store(), task).await.map_err(store_err)?;
                Ok(ActionOutcome {
                    action: Some(action),
                    message: format!("{} missing items", report.record.missing_items),
                    reconciliation: Some(report),
                    ..Default::default()
                })
            }
            ConsoleAction::Prune => {
                let report = prune_facets(self.store(), task, confirm).await?;
                Ok(ActionOutcome {
                    action: Some(action),
                    message: format!(
                        "Archived {} facets across {} sources",
                        report.facets_archived, report.sources_affected
                    ),
                    refresh_required: true,
                    prune: Some(report),
                    ..Default::default()
                })
            }
        }
    }

    /// Periodic reconciliation across every registered task, when enabled.
    pub async fn maybe_build_reconcile_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.reconcile_scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let console = Arc::clone(self);
        let cron = &self.config.reconcile_cron;
        let job = CronJob::new_async(cron, move |_uuid, _l| {
            let console = Arc::clone(&console);
            Box::pin(async move {
                for task in registry() {
                    match reconcile(console.store(), task).await {
                        Ok(report) => info!(
                            task = %task.task_id,
                            missing = report.record.missing_items,
                            "scheduled reconciliation finished"
                        ),
                        Err(err) => warn!(task = %task.task_id, error = %err, "scheduled reconciliation failed"),
                    }
                }
            })
        })
        .with_context(|| format!("creating reconciliation job for cron {cron}"))?;
        sched.add(job).await.context("adding reconciliation job")?;
        Ok(Some(sched))
    }

    pub fn default_task(&self) -> &'static TaskDefinition {
        lookup(self.config.default_task)
    }

    /// Resolves untrusted task input, falling back to the configured default task.
    pub fn resolve_task(&self, raw: Option<&str>) -> &'static TaskDefinition {
        match raw.map(|r| (r, lookup_str(r))) {
            Some((_, Some(task))) => task,
            Some((raw, None)) => {
                let fallback = self.default_task();
                warn!(requested = raw, fallback = %fallback.task_id, "unknown task; using default");
                fallback
            }
            None => self.default_task(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enrich_store::{MemoryStore, ScriptedFunctions};
    use serde_json::json;

    fn console(store: MemoryStore, functions: Arc<ScriptedFunctions>) -> Console {
        Console::new(Arc::new(store), functions, RealtimeHub::default(), ConsoleConfig::default())
    }

    #[tokio::test]
    async fn start_missing_requires_verification_then_estimate() {
        let functions = Arc::new(ScriptedFunctions::new());
        let console = console(MemoryStore::new(), functions.clone());
        let task = lookup(TaskId::Pricing);
        let now = Utc::now();
        let mut ctx = ActionContext {
            active_job: None,
            remaining: 10,
            processing: 0,
            verification: None,
            estimate: None,
            now,
        };

        let err = console
            .execute(task, ConsoleAction::StartMissing, &ActionParams::default(), &ctx, &AlwaysConfirm)
            .await
            .expect_err("stale");
        assert!(matches!(err, GatewayError::StaleVerification(_)));

        let verified = console
            .execute(task, ConsoleAction::Verify, &ActionParams::default(), &ctx, &AlwaysConfirm)
            .await
            .expect("verify");
        assert!(!verified.refresh_required);
        ctx.verification = verified.verification;

        let err = console
            .execute(task, ConsoleAction::StartMissing, &ActionParams::default(), &ctx, &AlwaysConfirm)
            .await
            .expect_err("no estimate");
        assert!(matches!(err, GatewayError::Precondition { .. }));

        ctx.estimate = Some(MissingEstimate {
            missing_count: 4,
            ..Default::default()
        });
        let outcome = console
            .execute(task, ConsoleAction::StartMissing, &ActionParams::default(), &ctx, &AlwaysConfirm)
            .await
            .expect("started");
        assert!(outcome.refresh_required);
        assert_eq!(functions.calls()[0].action(), Some("start_missing"));
    }

    #[tokio::test]
    async fn action_context_reflects_board_and_snapshot() {
        let store = MemoryStore::new()
            .with_rows("pricing_embeddings", (0..10).map(|i| json!({ "id": i })))
            .with_rows("pricing_intelligence", (0..4).map(|i| json!({ "id": i, "pricing_id": i })))
            .with_rows(
                jobs::JOBS_TABLE,
                vec![json!({
                    "id": "j1", "job_type": "pricing_intelligence", "status": "processing",
                    "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z"
                })],
            )
            .with_rows(
                jobs::BATCHES_TABLE,
                vec![json!({"id": "b1", "job_id": "j1", "batch_number": 1, "status": "processing"})],
            );
        let console = console(store, Arc::new(ScriptedFunctions::new()));

        let ctx = console
            .action_context(lookup(TaskId::Pricing), None)
            .await
            .expect("context");
        assert_eq!(ctx.remaining, 6);
        assert_eq!(ctx.processing, 1);
        assert_eq!(ctx.active_job.map(|j| j.id), Some("j1".to_string()));
    }

    #[test]
    fn default_config_matches_console_cadence() {
        let config = ConsoleConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.verification_max_age_chrono(), chrono::Duration::minutes(10));
        assert_eq!(config.scheduler_function, DEFAULT_SCHEDULER_FUNCTION);
        assert_eq!(config.store.base_url, "http://localhost:54321");
        assert!(config.store.api_key.is_none());
        assert!(config.store.database_url.is_none());
    }

    #[test]
    fn unknown_task_input_resolves_to_configured_default() {
        let config = ConsoleConfig {
            default_task: TaskId::Pricing,
            ..ConsoleConfig::default()
        };
        let console = Console::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ScriptedFunctions::new()),
            RealtimeHub::default(),
            config,
        );
        assert_eq!(console.resolve_task(Some("bogus")).task_id, TaskId::Pricing);
        assert_eq!(console.resolve_task(None).task_id, TaskId::Pricing);
        assert_eq!(console.resolve_task(Some("health-safety")).task_id, TaskId::HealthSafety);
    }
}
