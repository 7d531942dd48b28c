//! Read access to `batch_jobs` and `batch_progress`, plus the active-job policy.

use enrich_core::{Batch, Job, ScalarValue, TaskDefinition, WorkStatus};
use enrich_store::{Predicate, Row, Store, StoreError, TableQuery};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::warn;

pub const JOBS_TABLE: &str = "batch_jobs";
pub const BATCHES_TABLE: &str = "batch_progress";
pub const RECENT_JOB_LIMIT: usize = 5;

fn decode_rows<T: DeserializeOwned>(table: &str, rows: Vec<Row>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(JsonValue::Object(row)) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!(table, error = %err, "skipping undecodable row");
                None
            }
        })
        .collect()
}

/// Most recent jobs for the task, newest first.
pub async fn fetch_recent_jobs(store: &dyn Store, task: &TaskDefinition) -> Result<Vec<Job>, StoreError> {
    let rows = store
        .rows(
            &TableQuery::new(JOBS_TABLE)
                .filter(Predicate::eq("job_type", ScalarValue::text(task.job_type)))
                .order("created_at", false)
                .limit(RECENT_JOB_LIMIT),
        )
        .await?;
    Ok(decode_rows(JOBS_TABLE, rows))
}

pub async fn fetch_batches(store: &dyn Store, job_ids: &[String]) -> Result<Vec<Batch>, StoreError> {
    if job_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = store
        .rows(
            &TableQuery::new(BATCHES_TABLE)
                .filter(Predicate::In("job_id".to_string(), job_ids.to_vec()))
                .order("batch_number", true),
        )
        .await?;
    Ok(decode_rows(BATCHES_TABLE, rows))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActiveJobView {
    /// Most recently created pending/processing job.
    pub active: Option<Job>,
    /// Number of pending/processing jobs seen. Anything above one is an anomaly.
    pub concurrent_active: usize,
}

impl ActiveJobView {
    pub fn has_anomaly(&self) -> bool {
        self.concurrent_active > 1
    }
}

pub fn active_job(task: &TaskDefinition, jobs: &[Job]) -> ActiveJobView {
    let active: Vec<&Job> = jobs.iter().filter(|j| j.status.is_active()).collect();
    let newest = active.iter().max_by_key(|j| j.created_at).map(|j| (*j).clone());
    if active.len() > 1 {
        warn!(
            task = %task.task_id,
            active = active.len(),
            chosen = newest.as_ref().map(|j| j.id.as_str()).unwrap_or_default(),
            "multiple active jobs for one task; using the most recent"
        );
    }
    ActiveJobView {
        active: newest,
        concurrent_active: active.len(),
    }
}

/// Recent jobs, their batches and the resolved active job for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobBoard {
    pub jobs: Vec<Job>,
    pub batches: Vec<Batch>,
    pub active: ActiveJobView,
}

impl JobBoard {
    pub async fn load(store: &dyn Store, task: &TaskDefinition) -> Result<Self, StoreError> {
        let jobs = fetch_recent_jobs(store, task).await?;
        let ids: Vec<String> = jobs.iter().map(|j| j.id.clone()).collect();
        let batches = fetch_batches(store, &ids).await?;
        let active = active_job(task, &jobs);
        Ok(Self { jobs, batches, active })
    }

    pub fn active_job(&self) -> Option<&Job> {
        self.active.active.as_ref()
    }

    /// Batches currently processing, across every fetched job.
    pub fn processing_count(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| b.status == WorkStatus::Processing)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enrich_core::{lookup, TaskId};
    use enrich_store::MemoryStore;
    use serde_json::json;

    fn job_row(id: &str, job_type: &str, status: &str, created: &str) -> JsonValue {
        json!({
            "id": id,
            "job_type": job_type,
            "status": status,
            "total_batches": 4,
            "completed_batches": 1,
            "failed_batches": 0,
            "progress_percentage": 25,
            "created_at": created,
            "updated_at": created,
            "metadata": null
        })
    }

    #[tokio::test]
    async fn recent_jobs_are_filtered_ordered_and_limited() {
        let mut rows: Vec<JsonValue> = (0..7)
            .map(|i| {
                job_row(
                    &format!("j{i}"),
                    "pricing_intelligence",
                    "completed",
                    &format!("2026-01-0{}T00:00:00Z", i + 1),
                )
            })
            .collect();
        rows.push(job_row("other", "bs7671_intelligence", "processing", "2026-02-01T00:00:00Z"));
        let store = MemoryStore::new().with_rows(JOBS_TABLE, rows);

        let jobs = fetch_recent_jobs(&store, lookup(TaskId::Pricing)).await.expect("jobs");
        let ids: Vec<_> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, ["j6", "j5", "j4", "j3", "j2"]);
    }

    #[tokio::test]
    async fn board_loads_batches_for_recent_jobs_in_batch_order() {
        let store = MemoryStore::new()
            .with_rows(
                JOBS_TABLE,
                vec![job_row("j1", "pricing_intelligence", "processing", "2026-01-01T00:00:00Z")],
            )
            .with_rows(
                BATCHES_TABLE,
                vec![
                    json!({"id": "b2", "job_id": "j1", "batch_number": 2, "status": "processing", "started_at": "2026-01-01T00:01:00Z"}),
                    json!({"id": "b1", "job_id": "j1", "batch_number": 1, "status": "completed"}),
                    json!({"id": "bx", "job_id": "j0", "batch_number": 0, "status": "processing"}),
                ],
            );

        let board = JobBoard::load(&store, lookup(TaskId::Pricing)).await.expect("board");
        let ids: Vec<_> = board.batches.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, ["b1", "b2"]);
        assert_eq!(board.processing_count(), 1);
        assert_eq!(board.active_job().map(|j| j.id.as_str()), Some("j1"));
    }

    #[test]
    fn most_recent_active_job_wins_and_anomaly_is_flagged() {
        let task = lookup(TaskId::Pricing);
        let jobs: Vec<Job> = [
            ("j3", "completed", "2026-01-03T00:00:00Z"),
            ("j2", "pending", "2026-01-02T00:00:00Z"),
            ("j1", "processing", "2026-01-01T00:00:00Z"),
        ]
        .into_iter()
        .map(|(id, status, created)| {
            serde_json::from_value(job_row(id, "pricing_intelligence", status, created)).expect("job")
        })
        .collect();

        let view = active_job(task, &jobs);
        assert_eq!(view.active.as_ref().map(|j| j.id.as_str()), Some("j2"));
        assert_eq!(view.concurrent_active, 2);
        assert!(view.has_anomaly());

        let view = active_job(task, &jobs[..1]);
        assert!(view.active.is_none());
        assert!(!view.has_anomaly());
    }
}
