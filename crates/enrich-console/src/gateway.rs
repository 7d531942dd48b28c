//! Boundary to the external scheduler function and the per-task worker functions.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use enrich_core::{Job, TaskDefinition, TaskId, VerificationSnapshot};
use enrich_store::{scalar_count, FunctionClient, StoreError};
use futures_util::future::join_all;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::reconcile::{PruneReport, ReconciliationReport};

pub const DEFAULT_SCHEDULER_FUNCTION: &str = "master-enrichment-scheduler";

/// Upper bound on worker invocations issued by one scale-up.
pub const MAX_SCALE_UP: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleAction {
    Start,
    Continue,
    Recover,
    RecoverAndScale,
    DedupeBatches,
    AbortDuplicates,
    ClearAll,
    ComputeMissing,
    StartMissing,
    Verify,
    Reconcile,
    Prune,
}

impl ConsoleAction {
    pub const ALL: [ConsoleAction; 12] = [
        ConsoleAction::Start,
        ConsoleAction::Continue,
        ConsoleAction::Recover,
        ConsoleAction::RecoverAndScale,
        ConsoleAction::DedupeBatches,
        ConsoleAction::AbortDuplicates,
        ConsoleAction::ClearAll,
        ConsoleAction::ComputeMissing,
        ConsoleAction::StartMissing,
        ConsoleAction::Verify,
        ConsoleAction::Reconcile,
        ConsoleAction::Prune,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConsoleAction::Start => "start",
            ConsoleAction::Continue => "continue",
            ConsoleAction::Recover => "recover",
            ConsoleAction::RecoverAndScale => "recover_and_scale",
            ConsoleAction::DedupeBatches => "dedupe_batches",
            ConsoleAction::AbortDuplicates => "abort_duplicates",
            ConsoleAction::ClearAll => "clear_all",
            ConsoleAction::ComputeMissing => "compute_missing",
            ConsoleAction::StartMissing => "start_missing",
            ConsoleAction::Verify => "verify",
            ConsoleAction::Reconcile => "reconcile",
            ConsoleAction::Prune => "prune",
        }
    }

    pub fn requires_confirmation(self) -> bool {
        matches!(
            self,
            ConsoleAction::ClearAll | ConsoleAction::StartMissing | ConsoleAction::Prune
        )
    }

    fn generic_failure(self) -> &'static str {
        match self {
            ConsoleAction::Start => "Failed to start enrichment job",
            ConsoleAction::Continue => "Failed to continue enrichment job",
            ConsoleAction::Recover | ConsoleAction::RecoverAndScale => "Failed to recover stuck batches",
            ConsoleAction::DedupeBatches => "Failed to remove duplicate batches",
            ConsoleAction::AbortDuplicates => "Failed to abort duplicate batches",
            ConsoleAction::ClearAll => "Failed to clear jobs",
            ConsoleAction::ComputeMissing => "Failed to compute missing items",
            ConsoleAction::StartMissing => "Failed to start missing-item job",
            ConsoleAction::Verify => "Verification failed",
            ConsoleAction::Reconcile => "Reconciliation failed",
            ConsoleAction::Prune => "Facet pruning failed",
        }
    }
}

impl fmt::Display for ConsoleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConsoleAction {
    type Err = GatewayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        ConsoleAction::ALL
            .into_iter()
            .find(|a| a.as_str() == normalized)
            .ok_or_else(|| GatewayError::UnknownAction(raw.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{message}")]
    Transport { action: ConsoleAction, message: String },
    #[error("{message}")]
    Rejected { action: ConsoleAction, message: String },
    #[error("scheduler found no source records: {message}")]
    EmptySource { action: ConsoleAction, message: String },
    #[error("{0} was not confirmed")]
    NotConfirmed(ConsoleAction),
    #[error("{action} not allowed: {reason}")]
    Precondition { action: ConsoleAction, reason: String },
    #[error("{0} requires a fresh verification for this task")]
    StaleVerification(ConsoleAction),
    #[error("{action}: {source}")]
    Store {
        action: ConsoleAction,
        #[source]
        source: StoreError,
    },
    #[error("unknown action `{0}`")]
    UnknownAction(String),
}

impl GatewayError {
    pub fn action(&self) -> Option<ConsoleAction> {
        match self {
            GatewayError::Transport { action, .. }
            | GatewayError::Rejected { action, .. }
            | GatewayError::EmptySource { action, .. }
            | GatewayError::Precondition { action, .. }
            | GatewayError::Store { action, .. } => Some(*action),
            GatewayError::NotConfirmed(action) | GatewayError::StaleVerification(action) => Some(*action),
            GatewayError::UnknownAction(_) => None,
        }
    }
}

fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(scalar_count))
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::Bool(b)) => Some(b),
        Some(JsonValue::String(s)) => s.parse().ok(),
        _ => None,
    })
}

/// Scheduler reply. Every field is optional and type-tolerant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerResponse {
    #[serde(default, deserialize_with = "lenient_flag")]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "jobId", alias = "job_id")]
    pub job_id: Option<String>,
    #[serde(default, rename = "batchesCreated", alias = "batches_created", deserialize_with = "lenient_count")]
    pub batches_created: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub workers: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub missing_count: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub total_unique: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub enriched_unique: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub suggested_batch_size: Option<u64>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub suggested_workers: Option<u64>,
    #[serde(default)]
    pub sample: Option<JsonValue>,
}

fn signals_empty_source(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    let zero_sources = lower
        .match_indices("0 source records")
        .any(|(idx, _)| !lower[..idx].chars().next_back().is_some_and(|c| c.is_ascii_digit()));
    zero_sources || lower.contains("no canonical")
}

impl SchedulerResponse {
    pub fn from_value(value: JsonValue) -> Self {
        match value {
            JsonValue::Object(_) => serde_json::from_value(value).unwrap_or_else(|err| {
                warn!(error = %err, "unreadable scheduler response; treating as empty");
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    fn texts(&self) -> impl Iterator<Item = &str> {
        self.message.iter().chain(self.error.iter()).map(String::as_str)
    }

    pub fn empty_source_text(&self) -> Option<&str> {
        self.texts().find(|t| signals_empty_source(t))
    }

    pub fn signals_no_pending(&self) -> bool {
        self.texts().any(|t| t.to_ascii_lowercase().contains("no pending"))
    }

    fn failed(&self) -> bool {
        self.success == Some(false) || (self.success.is_none() && self.error.is_some())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerRequest {
    pub action: String,
    pub scope: String,
    pub job_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub create_if_missing: Option<bool>,
    #[serde(flatten)]
    pub params: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissingEstimate {
    pub missing_count: u64,
    pub total_unique: Option<u64>,
    pub enriched_unique: Option<u64>,
    pub suggested_batch_size: Option<u64>,
    pub suggested_workers: Option<u64>,
    pub sample: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub action: Option<ConsoleAction>,
    pub message: String,
    pub job_id: Option<String>,
    pub batches_created: Option<u64>,
    pub workers: Option<u64>,
    pub workers_added: Option<u32>,
    pub fell_back_to_start: bool,
    pub refresh_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimate: Option<MissingEstimate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconciliation: Option<ReconciliationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prune: Option<PruneReport>,
}

impl ActionOutcome {
    fn from_response(action: ConsoleAction, response: &SchedulerResponse, default_message: &str) -> Self {
        Self {
            action: Some(action),
            message: response
                .message
                .clone()
                .unwrap_or_else(|| default_message.to_string()),
            job_id: response.job_id.clone(),
            batches_created: response.batches_created,
            workers: response.workers,
            workers_added: None,
            fell_back_to_start: false,
            refresh_required: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmPrompt {
    pub action: ConsoleAction,
    pub task: TaskId,
    pub detail: String,
}

/// Explicit user consent for destructive or costly actions.
pub trait Confirm: Send + Sync {
    fn confirm(&self, prompt: &ConfirmPrompt) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysConfirm;

impl Confirm for AlwaysConfirm {
    fn confirm(&self, _prompt: &ConfirmPrompt) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NeverConfirm;

impl Confirm for NeverConfirm {
    fn confirm(&self, _prompt: &ConfirmPrompt) -> bool {
        false
    }
}

pub(crate) fn require_confirmation(
    confirm: &dyn Confirm,
    action: ConsoleAction,
    task: &TaskDefinition,
    detail: String,
) -> Result<(), GatewayError> {
    let prompt = ConfirmPrompt {
        action,
        task: task.task_id,
        detail,
    };
    if confirm.confirm(&prompt) {
        Ok(())
    } else {
        info!(task = %task.task_id, %action, "action declined");
        Err(GatewayError::NotConfirmed(action))
    }
}

/// Proof that a verification for the task was taken recently enough to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshVerification(VerificationSnapshot);

impl FreshVerification {
    pub fn check(
        snapshot: Option<&VerificationSnapshot>,
        task_id: TaskId,
        now: DateTime<Utc>,
        max_age: Duration,
    ) -> Result<Self, GatewayError> {
        match snapshot {
            Some(s) if s.is_fresh_for(task_id, now, max_age) => Ok(Self(s.clone())),
            _ => Err(GatewayError::StaleVerification(ConsoleAction::StartMissing)),
        }
    }

    pub fn snapshot(&self) -> &VerificationSnapshot {
        &self.0
    }
}

/// Workers to add: `min(requested, MAX_SCALE_UP, max_workers - processing)`.
pub fn scale_up_count(max_workers: u32, processing: usize, requested: u32) -> u32 {
    let processing = u32::try_from(processing).unwrap_or(u32::MAX);
    requested.min(MAX_SCALE_UP).min(max_workers.saturating_sub(processing))
}

#[derive(Clone)]
pub struct SchedulerGateway {
    functions: Arc<dyn FunctionClient>,
    scheduler_function: String,
}

impl SchedulerGateway {
    pub fn new(functions: Arc<dyn FunctionClient>, scheduler_function: impl Into<String>) -> Self {
        Self {
            functions,
            scheduler_function: scheduler_function.into(),
        }
    }

    pub fn scheduler_function(&self) -> &str {
        &self.scheduler_function
    }

    /// Sends one request and maps transport failures. Semantic checks are left to the caller.
    async fn call_raw(
        &self,
        task: &TaskDefinition,
        action: ConsoleAction,
        wire_action: &str,
        create_if_missing: Option<bool>,
        params: Map<String, JsonValue>,
    ) -> Result<SchedulerResponse, GatewayError> {
        let request = SchedulerRequest {
            action: wire_action.to_string(),
            scope: task.task_id.as_str().to_string(),
            job_type: task.job_type.to_string(),
            create_if_missing,
            params,
        };
        let body = serde_json::to_value(&request).map_err(|e| GatewayError::Transport {
            action,
            message: e.to_string(),
        })?;

        let span = info_span!("scheduler_call", task = %task.task_id, action = wire_action);
        match self
            .functions
            .invoke(&self.scheduler_function, body)
            .instrument(span)
            .await
        {
            Ok(value) => Ok(SchedulerResponse::from_value(value)),
            Err(err) => {
                let server = err.server_message();
                warn!(task = %task.task_id, action = wire_action, error = %err, "scheduler transport failure");
                match server {
                    Some(text) if signals_empty_source(&text) => Err(GatewayError::EmptySource { action, message: text }),
                    Some(text) => Err(GatewayError::Transport { action, message: text }),
                    None => Err(GatewayError::Transport {
                        action,
                        message: format!("{}: {err}", action.generic_failure()),
                    }),
                }
            }
        }
    }

    fn interpret(
        task: &TaskDefinition,
        action: ConsoleAction,
        response: SchedulerResponse,
    ) -> Result<SchedulerResponse, GatewayError> {
        if let Some(text) = response.empty_source_text() {
            warn!(task = %task.task_id, %action, message = text, "scheduler reported an empty source");
            return Err(GatewayError::EmptySource {
                action,
                message: text.to_string(),
            });
        }
        if response.failed() {
            let message = response
                .error
                .clone()
                .or_else(|| response.message.clone())
                .unwrap_or_else(|| action.generic_failure().to_string());
            warn!(task = %task.task_id, %action, %message, "scheduler rejected action");
            return Err(GatewayError::Rejected { action, message });
        }
        Ok(response)
    }

    async fn call(
        &self,
        task: &TaskDefinition,
        action: ConsoleAction,
        wire_action: &str,
        create_if_missing: Option<bool>,
        params: Map<String, JsonValue>,
    ) -> Result<SchedulerResponse, GatewayError> {
        let response = self
            .call_raw(task, action, wire_action, create_if_missing, params)
            .await?;
        Self::interpret(task, action, response)
    }

    async fn simple(
        &self,
        task: &TaskDefinition,
        action: ConsoleAction,
        default_message: &str,
    ) -> Result<ActionOutcome, GatewayError> {
        let response = self
            .call(task, action, action.as_str(), None, Map::new())
            .await?;
        info!(task = %task.task_id, %action, "scheduler action succeeded");
        Ok(ActionOutcome::from_response(action, &response, default_message))
    }

    async fn issue_start(&self, task: &TaskDefinition) -> Result<ActionOutcome, GatewayError> {
        let response = self
            .call(task, ConsoleAction::Start, "start", Some(true), Map::new())
            .await?;
        info!(task = %task.task_id, job_id = ?response.job_id, "enrichment job started");
        Ok(ActionOutcome::from_response(ConsoleAction::Start, &response, "Enrichment job started"))
    }

    pub async fn start(&self, task: &TaskDefinition, active: Option<&Job>) -> Result<ActionOutcome, GatewayError> {
        if let Some(job) = active {
            return Err(GatewayError::Precondition {
                action: ConsoleAction::Start,
                reason: format!("job {} is still active", job.id),
            });
        }
        self.issue_start(task).await
    }

    /// Resumes the active job. "No pending" falls back to `start` only while work remains.
    pub async fn continue_job(
        &self,
        task: &TaskDefinition,
        active: Option<&Job>,
        remaining: u64,
    ) -> Result<ActionOutcome, GatewayError> {
        let Some(job) = active else {
            return Err(GatewayError::Precondition {
                action: ConsoleAction::Continue,
                reason: "no active job".to_string(),
            });
        };

        let mut params = Map::new();
        params.insert("jobId".to_string(), json!(job.id));
        let response = self
            .call_raw(task, ConsoleAction::Continue, "continue", Some(false), params)
            .await?;

        if response.signals_no_pending() && response.empty_source_text().is_none() {
            if remaining > 0 {
                info!(task = %task.task_id, remaining, "no pending batches while work remains; starting a new job");
                let mut outcome = self.issue_start(task).await?;
                outcome.fell_back_to_start = true;
                return Ok(outcome);
            }
            return Ok(ActionOutcome {
                action: Some(ConsoleAction::Continue),
                message: "No pending batches and no remaining work".to_string(),
                refresh_required: true,
                ..Default::default()
            });
        }

        let response = Self::interpret(task, ConsoleAction::Continue, response)?;
        Ok(ActionOutcome::from_response(
            ConsoleAction::Continue,
            &response,
            "Enrichment job continued",
        ))
    }

    pub async fn recover(&self, task: &TaskDefinition) -> Result<ActionOutcome, GatewayError> {
        self.simple(task, ConsoleAction::Recover, "Stuck batches recovered").await
    }

    /// Recovery first, then up to [`scale_up_count`] parallel worker invocations.
    ///
    /// `processing` must be measured before this call; it is not re-read after recovery.
    pub async fn recover_and_scale(
        &self,
        task: &TaskDefinition,
        active: Option<&Job>,
        processing: usize,
        requested: u32,
        batch_size: u32,
    ) -> Result<ActionOutcome, GatewayError> {
        let Some(job) = active else {
            return Err(GatewayError::Precondition {
                action: ConsoleAction::RecoverAndScale,
                reason: "no active job to scale".to_string(),
            });
        };

        let recovered = self
            .call(task, ConsoleAction::RecoverAndScale, "recover", None, Map::new())
            .await?;
        let workers = scale_up_count(task.worker_count, processing, requested);

        let mut outcome = ActionOutcome::from_response(ConsoleAction::RecoverAndScale, &recovered, "");
        outcome.job_id = Some(job.id.clone());
        outcome.workers_added = Some(workers);
        if workers == 0 {
            outcome.message = format!(
                "Recovered; worker cap reached ({processing}/{} processing)",
                task.worker_count
            );
            return Ok(outcome);
        }

        let invocations = (0..workers).map(|_| {
            self.functions.invoke(
                task.worker_function,
                json!({ "action": "process_batch", "jobId": job.id, "batchSize": batch_size }),
            )
        });
        let results = join_all(invocations)
            .instrument(info_span!("scale_up", task = %task.task_id, workers, function = task.worker_function))
            .await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!(task = %task.task_id, failed, workers, "some worker invocations failed");
        }
        info!(task = %task.task_id, workers, processing, "scaled up workers");

        outcome.message = if failed > 0 {
            format!("Recovered and added {workers} workers ({failed} invocations failed)")
        } else {
            format!("Recovered and added {workers} workers")
        };
        Ok(outcome)
    }

    pub async fn dedupe_batches(&self, task: &TaskDefinition) -> Result<ActionOutcome, GatewayError> {
        self.simple(task, ConsoleAction::DedupeBatches, "Duplicate batches removed")
            .await
    }

    pub async fn abort_duplicates(&self, task: &TaskDefinition) -> Result<ActionOutcome, GatewayError> {
        self.simple(task, ConsoleAction::AbortDuplicates, "Duplicate batches aborted")
            .await
    }

    pub async fn clear_all(&self, task: &TaskDefinition, confirm: &dyn Confirm) -> Result<ActionOutcome, GatewayError> {
        require_confirmation(
            confirm,
            ConsoleAction::ClearAll,
            task,
            format!("Delete all {} jobs and batches?", task.label),
        )?;
        self.simple(task, ConsoleAction::ClearAll, "All jobs cleared").await
    }

    pub async fn compute_missing(&self, task: &TaskDefinition) -> Result<MissingEstimate, GatewayError> {
        let response = self
            .call(task, ConsoleAction::ComputeMissing, task.missing.compute, None, Map::new())
            .await?;
        let estimate = MissingEstimate {
            missing_count: response.missing_count.unwrap_or(0),
            total_unique: response.total_unique,
            enriched_unique: response.enriched_unique,
            suggested_batch_size: response.suggested_batch_size,
            suggested_workers: response.suggested_workers,
            sample: response.sample,
        };
        info!(task = %task.task_id, missing = estimate.missing_count, "missing items computed");
        Ok(estimate)
    }

    /// Creates a job sized to the missing set. Needs a fresh verification and explicit consent.
    pub async fn start_missing(
        &self,
        task: &TaskDefinition,
        estimate: &MissingEstimate,
        verification: &FreshVerification,
        confirm: &dyn Confirm,
    ) -> Result<ActionOutcome, GatewayError> {
        if verification.snapshot().task_id != task.task_id {
            return Err(GatewayError::StaleVerification(ConsoleAction::StartMissing));
        }
        if estimate.missing_count == 0 {
            return Err(GatewayError::Precondition {
                action: ConsoleAction::StartMissing,
                reason: "no missing items".to_string(),
            });
        }
        require_confirmation(
            confirm,
            ConsoleAction::StartMissing,
            task,
            format!(
                "Start a job for {} missing {} items?",
                estimate.missing_count, task.label
            ),
        )?;

        let mut params = Map::new();
        params.insert("missingCount".to_string(), json!(estimate.missing_count));
        if let Some(batch_size) = estimate.suggested_batch_size {
            params.insert("batchSize".to_string(), json!(batch_size));
        }
        if let Some(workers) = estimate.suggested_workers {
            params.insert("workers".to_string(), json!(workers));
        }
        let response = self
            .call(task, ConsoleAction::StartMissing, task.missing.start, Some(true), params)
            .await?;
        let mut outcome = ActionOutcome::from_response(ConsoleAction::StartMissing, &response, "");
        outcome.message = format!(
            "Started job {} with {} batches and {} workers",
            response.job_id.as_deref().unwrap_or("?"),
            response.batches_created.unwrap_or(0),
            response.workers.or(estimate.suggested_workers).unwrap_or(0),
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enrich_core::{lookup, WorkStatus};
    use enrich_store::ScriptedFunctions;

    fn gateway() -> (Arc<ScriptedFunctions>, SchedulerGateway) {
        let functions = Arc::new(ScriptedFunctions::new());
        let gateway = SchedulerGateway::new(functions.clone(), DEFAULT_SCHEDULER_FUNCTION);
        (functions, gateway)
    }

    fn job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            job_type: "practical_work_intelligence".into(),
            status: WorkStatus::Processing,
            total_batches: 10,
            completed_batches: 2,
            failed_batches: 0,
            progress_percentage: 20.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            metadata: None,
        }
    }

    #[test]
    fn scale_up_is_bounded_by_headroom_and_cap() {
        assert_eq!(scale_up_count(200, 180, 50), 20);
        assert_eq!(scale_up_count(200, 0, 500), 50);
        assert_eq!(scale_up_count(10, 12, 5), 0);
        assert_eq!(scale_up_count(10, 2, 3), 3);
    }

    #[test]
    fn empty_source_detection_ignores_larger_counts() {
        assert!(signals_empty_source("Found 0 source records"));
        assert!(signals_empty_source("No canonical practical work"));
        assert!(!signals_empty_source("Queued 10 source records"));
        assert!(!signals_empty_source("Queued 250 source records"));
    }

    #[test]
    fn responses_parse_leniently() {
        let resp = SchedulerResponse::from_value(json!({
            "success": "true",
            "jobId": "j1",
            "batchesCreated": "12",
            "missing_count": 41.0,
            "unexpected": [1, 2]
        }));
        assert_eq!(resp.success, Some(true));
        assert_eq!(resp.batches_created, Some(12));
        assert_eq!(resp.missing_count, Some(41));
        assert_eq!(SchedulerResponse::from_value(json!("ok")), SchedulerResponse::default());
    }

    #[test]
    fn request_envelope_is_camel_case_with_flattened_params() {
        let mut params = Map::new();
        params.insert("jobId".into(), json!("j1"));
        let body = serde_json::to_value(SchedulerRequest {
            action: "continue".into(),
            scope: "pricing".into(),
            job_type: "pricing_intelligence".into(),
            create_if_missing: Some(false),
            params,
        })
        .expect("serialize");
        assert_eq!(
            body,
            json!({"action": "continue", "scope": "pricing", "jobType": "pricing_intelligence", "createIfMissing": false, "jobId": "j1"})
        );
    }

    #[tokio::test]
    async fn empty_source_message_is_an_error_even_on_success() {
        let (functions, gateway) = gateway();
        functions.respond(
            DEFAULT_SCHEDULER_FUNCTION,
            Some("start"),
            json!({"success": true, "message": "Found 0 source records for practical_work"}),
        );
        let err = gateway
            .start(lookup(TaskId::PracticalWork), None)
            .await
            .expect_err("empty source");
        assert!(matches!(err, GatewayError::EmptySource { .. }));
    }

    #[tokio::test]
    async fn transport_errors_surface_server_text() {
        let (functions, gateway) = gateway();
        functions.fail(DEFAULT_SCHEDULER_FUNCTION, Some("recover"), "worker pool exhausted");
        let err = gateway.recover(lookup(TaskId::Pricing)).await.expect_err("fails");
        assert_eq!(err.to_string(), "worker pool exhausted");

        functions.fail(DEFAULT_SCHEDULER_FUNCTION, Some("start"), "No canonical records found");
        let err = gateway
            .start(lookup(TaskId::PracticalWork), None)
            .await
            .expect_err("empty source");
        assert!(matches!(err, GatewayError::EmptySource { .. }));
    }

    #[tokio::test]
    async fn rejected_without_error_text_uses_generic_message() {
        let (functions, gateway) = gateway();
        functions.respond(DEFAULT_SCHEDULER_FUNCTION, Some("dedupe_batches"), json!({"success": false}));
        let err = gateway
            .dedupe_batches(lookup(TaskId::Pricing))
            .await
            .expect_err("rejected");
        assert_eq!(err.to_string(), "Failed to remove duplicate batches");
    }

    #[tokio::test]
    async fn start_refuses_when_a_job_is_active() {
        let (functions, gateway) = gateway();
        let active = job("j1");
        let err = gateway
            .start(lookup(TaskId::Pricing), Some(&active))
            .await
            .expect_err("precondition");
        assert!(matches!(err, GatewayError::Precondition { .. }));
        assert!(functions.calls().is_empty());
    }

    #[tokio::test]
    async fn continue_falls_back_to_start_only_with_remaining_work() {
        let (functions, gateway) = gateway();
        let task = lookup(TaskId::PracticalWork);
        let active = job("j1");

        functions.respond(
            DEFAULT_SCHEDULER_FUNCTION,
            Some("continue"),
            json!({"success": false, "error": "No pending jobs found"}),
        );
        let outcome = gateway
            .continue_job(task, Some(&active), 0)
            .await
            .expect("no-op");
        assert!(!outcome.fell_back_to_start);
        assert_eq!(functions.calls().len(), 1);

        functions.respond(
            DEFAULT_SCHEDULER_FUNCTION,
            Some("continue"),
            json!({"success": true, "message": "No pending batches"}),
        );
        functions.respond(DEFAULT_SCHEDULER_FUNCTION, Some("start"), json!({"success": true, "jobId": "j2"}));
        let outcome = gateway
            .continue_job(task, Some(&active), 160)
            .await
            .expect("fallback");
        assert!(outcome.fell_back_to_start);
        assert_eq!(outcome.job_id.as_deref(), Some("j2"));
        let actions: Vec<_> = functions
            .calls()
            .iter()
            .map(|c| c.action().unwrap_or_default().to_string())
            .collect();
        assert_eq!(actions, ["continue", "continue", "start"]);
    }

    #[tokio::test]
    async fn recover_and_scale_recovers_before_issuing_workers() {
        let (functions, gateway) = gateway();
        let task = lookup(TaskId::PracticalWork);
        let active = job("j1");

        let outcome = gateway
            .recover_and_scale(task, Some(&active), 180, 50, 10)
            .await
            .expect("scaled");
        assert_eq!(outcome.workers_added, Some(20));

        let calls = functions.calls();
        assert_eq!(calls.len(), 21);
        assert_eq!(calls[0].function, DEFAULT_SCHEDULER_FUNCTION);
        assert_eq!(calls[0].action(), Some("recover"));
        for call in &calls[1..] {
            assert_eq!(call.function, "enrich-practical-work");
            assert_eq!(call.body, json!({"action": "process_batch", "jobId": "j1", "batchSize": 10}));
        }
    }

    #[tokio::test]
    async fn recover_and_scale_at_cap_is_a_noop_success() {
        let (functions, gateway) = gateway();
        let active = job("j1");
        let outcome = gateway
            .recover_and_scale(lookup(TaskId::Pricing), Some(&active), 5, 50, 10)
            .await
            .expect("noop");
        assert_eq!(outcome.workers_added, Some(0));
        assert_eq!(functions.calls().len(), 1);
    }

    #[tokio::test]
    async fn recover_failure_prevents_scale_up() {
        let (functions, gateway) = gateway();
        functions.respond(DEFAULT_SCHEDULER_FUNCTION, Some("recover"), json!({"success": false, "error": "locked"}));
        let active = job("j1");
        assert!(gateway
            .recover_and_scale(lookup(TaskId::PracticalWork), Some(&active), 0, 50, 10)
            .await
            .is_err());
        assert!(functions.calls_to("enrich-practical-work").is_empty());
    }

    #[tokio::test]
    async fn clear_all_without_confirmation_never_calls_scheduler() {
        let (functions, gateway) = gateway();
        let err = gateway
            .clear_all(lookup(TaskId::Bs7671), &NeverConfirm)
            .await
            .expect_err("declined");
        assert!(matches!(err, GatewayError::NotConfirmed(ConsoleAction::ClearAll)));
        assert!(functions.calls().is_empty());

        gateway
            .clear_all(lookup(TaskId::Bs7671), &AlwaysConfirm)
            .await
            .expect("confirmed");
        assert_eq!(functions.calls().len(), 1);
    }

    #[tokio::test]
    async fn start_missing_uses_task_specific_action() {
        let (functions, gateway) = gateway();
        let task = lookup(TaskId::PracticalWork);
        functions.respond(
            DEFAULT_SCHEDULER_FUNCTION,
            Some("compute_missing_practical_work"),
            json!({"success": true, "missing_count": 12, "suggested_batch_size": 4, "suggested_workers": 3}),
        );
        functions.respond(
            DEFAULT_SCHEDULER_FUNCTION,
            Some("start_missing_practical_work"),
            json!({"success": true, "jobId": "j9", "batchesCreated": 3, "workers": 3}),
        );

        let estimate = gateway.compute_missing(task).await.expect("estimate");
        assert_eq!(estimate.missing_count, 12);

        let now = Utc::now();
        let snapshot = VerificationSnapshot {
            task_id: TaskId::PracticalWork,
            baseline_count: 10,
            baseline_unique_count: 10,
            timestamp: now,
            total_unique: 20,
            enriched_unique: 8,
        };
        let fresh = FreshVerification::check(Some(&snapshot), task.task_id, now, Duration::minutes(10)).expect("fresh");
        let outcome = gateway
            .start_missing(task, &estimate, &fresh, &AlwaysConfirm)
            .await
            .expect("started");
        assert_eq!(outcome.job_id.as_deref(), Some("j9"));
        assert_eq!(outcome.message, "Started job j9 with 3 batches and 3 workers");

        let last = functions.calls().pop().expect("call");
        assert_eq!(last.body["batchSize"], 4);
        assert_eq!(last.body["scope"], "practical_work");
    }

    #[test]
    fn stale_or_foreign_verification_is_rejected() {
        let now = Utc::now();
        let snapshot = VerificationSnapshot {
            task_id: TaskId::Bs7671,
            baseline_count: 1,
            baseline_unique_count: 1,
            timestamp: now - Duration::minutes(11),
            total_unique: 1,
            enriched_unique: 1,
        };
        assert!(FreshVerification::check(Some(&snapshot), TaskId::Bs7671, now, Duration::minutes(10)).is_err());
        assert!(FreshVerification::check(Some(&snapshot), TaskId::Pricing, now, Duration::minutes(20)).is_err());
        assert!(FreshVerification::check(None, TaskId::Bs7671, now, Duration::minutes(10)).is_err());
        assert!(FreshVerification::check(Some(&snapshot), TaskId::Bs7671, now, Duration::minutes(20)).is_ok());
    }
}
