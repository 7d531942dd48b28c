//! Core domain model for the enrichment console: the task registry, jobs, batches and the
//! derived snapshots the console computes from them.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "enrich-core";

/// Task selected when the caller supplies nothing usable (e.g. a bad `?task=` parameter).
pub const DEFAULT_TASK: TaskId = TaskId::Bs7671;

/// Foreign-key columns that may point from an enriched row back to its source row.
pub const REFERENCE_KEY_COLUMNS: [&str; 4] = ["regulation_id", "source_id", "knowledge_id", "pricing_id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskId {
    Bs7671,
    HealthSafety,
    Pricing,
    PracticalWork,
    DesignKnowledge,
}

impl TaskId {
    pub const ALL: [TaskId; 5] = [
        TaskId::Bs7671,
        TaskId::HealthSafety,
        TaskId::Pricing,
        TaskId::PracticalWork,
        TaskId::DesignKnowledge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskId::Bs7671 => "bs7671",
            TaskId::HealthSafety => "health_safety",
            TaskId::Pricing => "pricing",
            TaskId::PracticalWork => "practical_work",
            TaskId::DesignKnowledge => "design_knowledge",
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskId {
    type Err = RegistryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        TaskId::ALL
            .into_iter()
            .find(|id| id.as_str() == normalized)
            .ok_or_else(|| RegistryError::UnknownTask(raw.to_string()))
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown task `{0}`")]
    UnknownTask(String),
    #[error("task `{0}` is registered more than once")]
    DuplicateTask(TaskId),
    #[error("task `{task}` has multiplier {multiplier}, expected >= 1")]
    InvalidMultiplier { task: TaskId, multiplier: f64 },
    #[error("simple task `{0}` must use a multiplier of exactly 1")]
    SimpleMultiplier(TaskId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentModel {
    /// One target record per source record.
    Simple,
    /// `target_multiplier` target records per source record.
    Faceted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Neq,
    Is,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Int(i64),
    Text(Cow<'static, str>),
    Null,
}

impl ScalarValue {
    pub fn text(value: impl Into<String>) -> Self {
        ScalarValue::Text(Cow::Owned(value.into()))
    }

    /// Rendering used in PostgREST query strings (`eq.true`, `is.null`, ...).
    pub fn to_query_literal(&self) -> String {
        match self {
            ScalarValue::Bool(b) => b.to_string(),
            ScalarValue::Int(i) => i.to_string(),
            ScalarValue::Text(s) => s.to_string(),
            ScalarValue::Null => "null".to_string(),
        }
    }

    /// Loose equality against a JSON cell, used by in-memory filtering.
    pub fn matches_json(&self, cell: Option<&JsonValue>) -> bool {
        match (self, cell) {
            (ScalarValue::Null, None) | (ScalarValue::Null, Some(JsonValue::Null)) => true,
            (ScalarValue::Bool(b), Some(JsonValue::Bool(v))) => b == v,
            (ScalarValue::Int(i), Some(JsonValue::Number(n))) => n.as_i64() == Some(*i),
            (ScalarValue::Text(s), Some(JsonValue::String(v))) => s.as_ref() == v.as_str(),
            (ScalarValue::Text(s), Some(other)) => json_identity(other).as_deref() == Some(s.as_ref()),
            _ => false,
        }
    }
}

/// Predicate restricting which source rows count toward a task's denominator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFilter {
    pub column: &'static str,
    pub operator: FilterOperator,
    pub value: ScalarValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "facet_type", rename_all = "snake_case")]
pub enum StageInput {
    /// Stage input is the (filtered) source table itself.
    SourceRows,
    /// Stage input is the set of facets a previous stage produced.
    FacetsOfType(&'static str),
}

/// One phase of a multi-phase facet pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FacetStage {
    pub key: &'static str,
    pub facet_type: &'static str,
    /// Tag written by the previous tagging scheme. Only consulted when `facet_type` counts zero.
    pub legacy_facet_type: Option<&'static str>,
    pub input: StageInput,
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ProgressRule {
    /// Completeness is measured over distinct source keys rather than rows.
    DistinctKey {
        source_key: &'static str,
        target_key: &'static str,
        source_sample: usize,
        target_sample: usize,
    },
    StagedFacets {
        facet_column: &'static str,
        stages: &'static [FacetStage],
    },
    /// A source is fully enriched when its facet count lies in `min_facets..=max_facets`.
    BandedFacets {
        rpc: &'static str,
        min_facets: u32,
        max_facets: u32,
    },
    OneToOne,
    /// Plain faceted accounting: facets against `source_total × multiplier`.
    FixedRatio,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerifyIdentity {
    RegulationNumber {
        source_column: &'static str,
        target_column: &'static str,
    },
    SourceId {
        target_column: &'static str,
    },
    RowCount,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthThresholds {
    pub min_sources: u64,
    pub min_facets: u64,
    pub target_avg_facets: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RealtimeChannel {
    pub channel: &'static str,
    pub table: &'static str,
    pub facet_column: &'static str,
    pub facet_type: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MissingActions {
    pub compute: &'static str,
    pub start: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskDefinition {
    pub task_id: TaskId,
    pub label: &'static str,
    pub job_type: &'static str,
    pub source_table: &'static str,
    pub target_table: &'static str,
    pub enrichment_model: EnrichmentModel,
    pub target_multiplier: f64,
    pub source_filter: Option<SourceFilter>,
    pub worker_count: u32,
    pub worker_function: &'static str,
    pub progress: ProgressRule,
    /// Candidate foreign-key columns on the target table, in resolution order.
    pub identity_columns: &'static [&'static str],
    pub verify: VerifyIdentity,
    pub compliance_view: Option<&'static str>,
    pub health: Option<HealthThresholds>,
    pub realtime: Option<RealtimeChannel>,
    pub missing: MissingActions,
    pub prune_rpc: Option<&'static str>,
}

impl TaskDefinition {
    pub fn is_faceted(&self) -> bool {
        self.enrichment_model == EnrichmentModel::Faceted
    }

    /// Resolves a pipeline stage by key, falling back to the first stage.
    pub fn stage(&self, key: Option<&str>) -> Option<&'static FacetStage> {
        let ProgressRule::StagedFacets { stages, .. } = &self.progress else {
            return None;
        };
        key.and_then(|k| stages.iter().find(|s| s.key == k))
            .or_else(|| stages.first())
    }
}

const GENERIC_MISSING: MissingActions = MissingActions {
    compute: "compute_missing",
    start: "start_missing",
};

static PRACTICAL_WORK_STAGES: [FacetStage; 2] = [
    FacetStage {
        key: "primary",
        facet_type: "primary",
        legacy_facet_type: Some("scenario"),
        input: StageInput::SourceRows,
        multiplier: 8.0,
    },
    FacetStage {
        key: "deep",
        facet_type: "deep",
        legacy_facet_type: None,
        input: StageInput::FacetsOfType("primary"),
        multiplier: 1.0,
    },
];

static REGISTRY: [TaskDefinition; 5] = [
    TaskDefinition {
        task_id: TaskId::Bs7671,
        label: "BS 7671 Regulations",
        job_type: "bs7671_intelligence",
        source_table: "bs7671_embeddings",
        target_table: "regulations_intelligence",
        enrichment_model: EnrichmentModel::Faceted,
        target_multiplier: 30.0,
        source_filter: None,
        worker_count: 10,
        worker_function: "enrich-regulations",
        progress: ProgressRule::DistinctKey {
            source_key: "regulation_number",
            target_key: "regulation_number",
            source_sample: 3000,
            target_sample: 2000,
        },
        identity_columns: &["regulation_id", "source_id", "knowledge_id", "pricing_id"],
        verify: VerifyIdentity::RegulationNumber {
            source_column: "regulation_number",
            target_column: "regulation_number",
        },
        compliance_view: None,
        health: None,
        realtime: None,
        missing: GENERIC_MISSING,
        prune_rpc: None,
    },
    TaskDefinition {
        task_id: TaskId::HealthSafety,
        label: "Health & Safety",
        job_type: "health_safety_intelligence",
        source_table: "health_safety_knowledge",
        target_table: "health_safety_intelligence",
        enrichment_model: EnrichmentModel::Simple,
        target_multiplier: 1.0,
        source_filter: None,
        worker_count: 5,
        worker_function: "enrich-health-safety",
        progress: ProgressRule::OneToOne,
        identity_columns: &["regulation_id", "source_id", "knowledge_id", "pricing_id"],
        verify: VerifyIdentity::RowCount,
        compliance_view: None,
        health: None,
        realtime: None,
        missing: GENERIC_MISSING,
        prune_rpc: None,
    },
    TaskDefinition {
        task_id: TaskId::Pricing,
        label: "Pricing",
        job_type: "pricing_intelligence",
        source_table: "pricing_embeddings",
        target_table: "pricing_intelligence",
        enrichment_model: EnrichmentModel::Simple,
        target_multiplier: 1.0,
        source_filter: None,
        worker_count: 5,
        worker_function: "enrich-pricing",
        progress: ProgressRule::OneToOne,
        identity_columns: &["regulation_id", "source_id", "knowledge_id", "pricing_id"],
        verify: VerifyIdentity::RowCount,
        compliance_view: None,
        health: None,
        realtime: None,
        missing: GENERIC_MISSING,
        prune_rpc: None,
    },
    TaskDefinition {
        task_id: TaskId::PracticalWork,
        label: "Practical Work Procedures",
        job_type: "practical_work_intelligence",
        source_table: "practical_work",
        target_table: "practical_work_intelligence",
        enrichment_model: EnrichmentModel::Faceted,
        target_multiplier: 8.0,
        source_filter: Some(SourceFilter {
            column: "is_canonical",
            operator: FilterOperator::Eq,
            value: ScalarValue::Bool(true),
        }),
        worker_count: 200,
        worker_function: "enrich-practical-work",
        progress: ProgressRule::StagedFacets {
            facet_column: "facet_type",
            stages: &PRACTICAL_WORK_STAGES,
        },
        identity_columns: &[
            "practical_work_id",
            "regulation_id",
            "source_id",
            "knowledge_id",
            "pricing_id",
        ],
        verify: VerifyIdentity::SourceId {
            target_column: "practical_work_id",
        },
        compliance_view: Some("practical_work_facet_compliance"),
        health: None,
        realtime: Some(RealtimeChannel {
            channel: "practical-work-facets",
            table: "practical_work_intelligence",
            facet_column: "facet_type",
            facet_type: "primary",
        }),
        missing: MissingActions {
            compute: "compute_missing_practical_work",
            start: "start_missing_practical_work",
        },
        prune_rpc: Some("prune_practical_work_to_8_archive"),
    },
    TaskDefinition {
        task_id: TaskId::DesignKnowledge,
        label: "Design Knowledge",
        job_type: "design_knowledge_intelligence",
        source_table: "design_knowledge",
        target_table: "design_knowledge_intelligence",
        enrichment_model: EnrichmentModel::Faceted,
        target_multiplier: 8.0,
        source_filter: Some(SourceFilter {
            column: "is_active",
            operator: FilterOperator::Eq,
            value: ScalarValue::Bool(true),
        }),
        worker_count: 50,
        worker_function: "enrich-design-knowledge",
        progress: ProgressRule::BandedFacets {
            rpc: "count_fully_enriched_design_sources",
            min_facets: 6,
            max_facets: 8,
        },
        identity_columns: &[
            "design_knowledge_id",
            "regulation_id",
            "source_id",
            "knowledge_id",
            "pricing_id",
        ],
        verify: VerifyIdentity::SourceId {
            target_column: "design_knowledge_id",
        },
        compliance_view: Some("design_knowledge_facet_compliance"),
        health: Some(HealthThresholds {
            min_sources: 850,
            min_facets: 6000,
            target_avg_facets: 7.0,
        }),
        realtime: None,
        missing: GENERIC_MISSING,
        prune_rpc: None,
    },
];

pub fn registry() -> &'static [TaskDefinition] {
    &REGISTRY
}

pub fn lookup(task_id: TaskId) -> &'static TaskDefinition {
    REGISTRY
        .iter()
        .find(|def| def.task_id == task_id)
        .unwrap_or(&REGISTRY[0])
}

pub fn lookup_str(raw: &str) -> Option<&'static TaskDefinition> {
    raw.parse::<TaskId>().ok().map(lookup)
}

/// Resolves untrusted task input, falling back to [`DEFAULT_TASK`] instead of failing.
pub fn resolve_or_default(raw: Option<&str>) -> &'static TaskDefinition {
    raw.and_then(lookup_str).unwrap_or_else(|| lookup(DEFAULT_TASK))
}

pub fn validate_registry(defs: &[TaskDefinition]) -> Result<(), RegistryError> {
    let mut seen = HashSet::new();
    for def in defs {
        if !seen.insert(def.task_id) {
            return Err(RegistryError::DuplicateTask(def.task_id));
        }
        if !(def.target_multiplier >= 1.0) {
            return Err(RegistryError::InvalidMultiplier {
                task: def.task_id,
                multiplier: def.target_multiplier,
            });
        }
        if def.enrichment_model == EnrichmentModel::Simple && def.target_multiplier != 1.0 {
            return Err(RegistryError::SimpleMultiplier(def.task_id));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    #[serde(other)]
    Other,
}

impl WorkStatus {
    pub fn is_active(self) -> bool {
        matches!(self, WorkStatus::Pending | WorkStatus::Processing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub status: WorkStatus,
    #[serde(default)]
    pub total_batches: i64,
    #[serde(default)]
    pub completed_batches: i64,
    #[serde(default)]
    pub failed_batches: i64,
    #[serde(default)]
    pub progress_percentage: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub job_id: String,
    pub batch_number: i64,
    pub status: WorkStatus,
    #[serde(default)]
    pub items_processed: i64,
    #[serde(default)]
    pub total_items: i64,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Option<JsonValue>,
}

/// Worker-written progress payload carried in `batch_progress.data`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgressData {
    #[serde(default)]
    pub current_regulation: Option<String>,
    #[serde(default)]
    pub skipped_count: Option<u64>,
    #[serde(default)]
    pub new_count: Option<u64>,
}

impl Batch {
    pub fn progress_data(&self) -> BatchProgressData {
        self.data
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Time spent in its current run, if it has started.
    pub fn running_for(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.started_at.map(|started| now - started)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComplianceMetrics {
    pub avg_facets_recent: Option<f64>,
    pub avg_facets_all_time: Option<f64>,
    pub compliance_percentage: Option<f64>,
    pub sources_enriched: Option<u64>,
    pub total_sources: Option<u64>,
    pub total_facets: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub task_id: TaskId,
    #[serde(default)]
    pub stage: Option<String>,
    pub source_total: u64,
    pub source_enriched: u64,
    pub facets_created: u64,
    pub target_facets: u64,
    pub remaining: u64,
    pub progress: u8,
    #[serde(default)]
    pub compliance: Option<ComplianceMetrics>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub computed_at: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn empty(task_id: TaskId) -> Self {
        Self {
            task_id,
            stage: None,
            source_total: 0,
            source_enriched: 0,
            facets_created: 0,
            target_facets: 0,
            remaining: 0,
            progress: 0,
            compliance: None,
            warnings: Vec::new(),
            computed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub message: String,
}

impl Alert {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MissingId {
    pub id: String,
}

/// Append-only audit row written to `enrichment_reconciliation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub job_type: String,
    pub source_table: String,
    pub target_table: String,
    pub total_source_items: u64,
    pub total_enriched_items: u64,
    pub missing_items: u64,
    pub missing_ids: Vec<MissingId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSnapshot {
    pub task_id: TaskId,
    pub baseline_count: u64,
    pub baseline_unique_count: u64,
    pub timestamp: DateTime<Utc>,
    pub total_unique: u64,
    pub enriched_unique: u64,
}

impl VerificationSnapshot {
    pub fn is_fresh_for(&self, task_id: TaskId, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.task_id == task_id && now - self.timestamp <= max_age && self.timestamp <= now
    }
}

/// Canonical string form of an identifier cell. Empty strings count as absent.
pub fn json_identity(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
