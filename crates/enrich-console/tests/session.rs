use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use enrich_console::{
    jobs, ActionParams, AlwaysConfirm, Console, ConsoleAction, ConsoleConfig, ConsoleSession, GatewayError,
    NeverConfirm,
};
use enrich_core::TaskId;
use enrich_store::{FunctionClient, MemoryStore, RealtimeEvent, RealtimeHub, ScriptedFunctions, StoreError};
use serde_json::{json, Value as JsonValue};
use tokio::sync::Notify;

const SCHEDULER: &str = "master-enrichment-scheduler";

fn job(id: &str, job_type: &str, status: &str) -> JsonValue {
    json!({
        "id": id,
        "job_type": job_type,
        "status": status,
        "created_at": "2026-03-01T00:00:00Z",
        "updated_at": "2026-03-01T00:00:00Z"
    })
}

fn pricing_store() -> Arc<MemoryStore> {
    Arc::new(
        MemoryStore::new()
            .with_rows("pricing_embeddings", (0..10).map(|i| json!({ "id": i })))
            .with_rows("pricing_intelligence", (0..4).map(|i| json!({ "id": i, "pricing_id": i }))),
    )
}

fn console_with(store: Arc<MemoryStore>, functions: Arc<dyn FunctionClient>) -> Arc<Console> {
    Arc::new(Console::new(store, functions, RealtimeHub::default(), ConsoleConfig::default()))
}

async fn refreshed(session: &ConsoleSession) {
    assert!(session.refresh().await, "refresh should apply to the current selection");
}

/// Blocks every invocation until released.
#[derive(Default)]
struct GatedFunctions {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl FunctionClient for GatedFunctions {
    async fn invoke(&self, _function: &str, _body: JsonValue) -> Result<JsonValue, StoreError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(json!({ "success": true, "jobId": "late-job", "message": "started" }))
    }
}

#[tokio::test]
async fn late_action_result_is_discarded_after_task_switch() {
    let functions = Arc::new(GatedFunctions::default());
    let console = console_with(pricing_store(), functions.clone());
    let session = ConsoleSession::start(console, TaskId::Pricing, None);

    let pending = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .run_action(ConsoleAction::Start, &ActionParams::default(), &AlwaysConfirm)
                .await
        })
    };
    functions.entered.notified().await;
    assert!(session.state().in_flight.contains(&ConsoleAction::Start));

    session.select_task(TaskId::Bs7671, None);
    functions.release.notify_one();
    let outcome = pending.await.expect("join").expect("action succeeded remotely");
    assert_eq!(outcome.job_id.as_deref(), Some("late-job"));

    let state = session.state();
    assert_eq!(state.task, TaskId::Bs7671);
    assert_eq!(state.epoch, 1);
    assert!(state.last_outcome.is_none());
    assert!(state.in_flight.is_empty());
    session.shutdown();
}

#[tokio::test]
async fn clear_all_without_confirmation_sends_nothing() {
    let functions = Arc::new(ScriptedFunctions::new());
    let console = console_with(pricing_store(), functions.clone());
    let session = ConsoleSession::start(console, TaskId::Pricing, None);

    let err = session
        .run_action(ConsoleAction::ClearAll, &ActionParams::default(), &NeverConfirm)
        .await
        .expect_err("declined");
    assert!(matches!(err, GatewayError::NotConfirmed(ConsoleAction::ClearAll)));
    assert!(functions.calls().is_empty());

    let state = session.state();
    assert!(state.in_flight.is_empty());
    assert!(state.last_error.is_some());
    session.shutdown();
}

#[tokio::test]
async fn continue_without_pending_batches_starts_a_new_job() {
    let store = pricing_store();
    store.push_rows(jobs::JOBS_TABLE, [job("j1", "pricing_intelligence", "processing")]);
    let functions = Arc::new(ScriptedFunctions::new());
    functions.respond(SCHEDULER, Some("continue"), json!({ "success": false, "message": "No pending batches" }));
    functions.respond(SCHEDULER, Some("start"), json!({ "success": true, "jobId": "j2", "batchesCreated": 3 }));
    let console = console_with(store, functions.clone());
    let session = ConsoleSession::start(console, TaskId::Pricing, None);
    refreshed(&session).await;
    assert_eq!(session.state().snapshot.remaining, 6);

    let outcome = session
        .run_action(ConsoleAction::Continue, &ActionParams::default(), &AlwaysConfirm)
        .await
        .expect("fallback");
    assert!(outcome.fell_back_to_start);
    assert_eq!(outcome.job_id.as_deref(), Some("j2"));

    let actions: Vec<_> = functions
        .calls()
        .iter()
        .filter_map(|c| c.action().map(str::to_string))
        .collect();
    assert_eq!(actions, ["continue", "start"]);
    assert_eq!(session.state().last_outcome, Some(outcome));
    session.shutdown();
}

#[tokio::test]
async fn scale_up_never_exceeds_worker_capacity() {
    let store = pricing_store();
    store.push_rows(jobs::JOBS_TABLE, [job("j1", "pricing_intelligence", "processing")]);
    store.push_rows(
        jobs::BATCHES_TABLE,
        (1..=3).map(|n| json!({ "id": format!("b{n}"), "job_id": "j1", "batch_number": n, "status": "processing" })),
    );
    let functions = Arc::new(ScriptedFunctions::new());
    let console = console_with(store, functions.clone());
    let session = ConsoleSession::start(console, TaskId::Pricing, None);
    refreshed(&session).await;

    let params = ActionParams {
        workers: Some(50),
        batch_size: None,
    };
    let outcome = session
        .run_action(ConsoleAction::RecoverAndScale, &params, &AlwaysConfirm)
        .await
        .expect("scaled");
    assert_eq!(outcome.workers_added, Some(2));

    let worker_calls = functions.calls_to("enrich-pricing");
    assert_eq!(worker_calls.len(), 2);
    assert_eq!(worker_calls[0].body["jobId"], "j1");
    assert_eq!(worker_calls[0].body["batchSize"], 10);
    session.shutdown();
}

#[tokio::test]
async fn duplicate_action_is_rejected_while_in_flight() {
    let functions = Arc::new(GatedFunctions::default());
    let console = console_with(pricing_store(), functions.clone());
    let session = ConsoleSession::start(console, TaskId::Pricing, None);

    let first = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .run_action(ConsoleAction::Recover, &ActionParams::default(), &AlwaysConfirm)
                .await
        })
    };
    functions.entered.notified().await;

    let err = session
        .run_action(ConsoleAction::Recover, &ActionParams::default(), &AlwaysConfirm)
        .await
        .expect_err("duplicate");
    assert!(matches!(err, GatewayError::Precondition { .. }));

    functions.release.notify_one();
    first.await.expect("join").expect("first recover");
    assert!(session.state().in_flight.is_empty());
    session.shutdown();
}

#[tokio::test]
async fn realtime_insert_triggers_refresh_before_next_poll() {
    let store = Arc::new(MemoryStore::new());
    let console = console_with(store.clone(), Arc::new(ScriptedFunctions::new()));
    let session = ConsoleSession::start(console.clone(), TaskId::PracticalWork, None);
    let mut rx = session.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.last_refresh.is_some()))
        .await
        .expect("initial poll")
        .expect("session alive");

    store.push_rows(jobs::JOBS_TABLE, [job("pw1", "practical_work_intelligence", "processing")]);
    let event: RealtimeEvent = serde_json::from_value(json!({
        "type": "INSERT",
        "table": "practical_work_intelligence",
        "record": { "id": 1, "facet_type": "primary" }
    }))
    .expect("event");
    assert_eq!(console.hub().publish(event), 1);

    tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.board.jobs.len() == 1))
        .await
        .expect("realtime refresh")
        .expect("session alive");
    session.shutdown();
}
