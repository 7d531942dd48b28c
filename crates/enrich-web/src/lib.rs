//! Axum + Askama front end for the enrichment console.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use enrich_console::{
    ActionParams, Confirm, ConfirmPrompt, Console, ConsoleAction, ConsoleSession, ConsoleState, GatewayError,
};
use enrich_core::{registry, Alert, ProgressRule, Severity, TaskDefinition, TaskId};
use enrich_store::RealtimeEvent;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "enrich-web";

#[derive(Clone)]
pub struct AppState {
    pub session: ConsoleSession,
}

impl AppState {
    pub fn new(session: ConsoleSession) -> Self {
        Self { session }
    }

    fn console(&self) -> &Console {
        self.session.console()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub label: &'static str,
    pub job_type: &'static str,
    pub faceted: bool,
    pub stages: Vec<&'static str>,
}

impl From<&TaskDefinition> for TaskSummary {
    fn from(task: &TaskDefinition) -> Self {
        let stages = match &task.progress {
            ProgressRule::StagedFacets { stages, .. } => stages.iter().map(|s| s.key).collect(),
            _ => Vec::new(),
        };
        Self {
            task_id: task.task_id,
            label: task.label,
            job_type: task.job_type,
            faceted: task.is_faceted(),
            stages,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct StageQuery {
    stage: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ActionQuery {
    #[serde(default)]
    confirm: bool,
    workers: Option<u32>,
    batch_size: Option<u32>,
}

/// Consent carried by the request itself; the browser asks before posting.
struct QueryConfirm(bool);

impl Confirm for QueryConfirm {
    fn confirm(&self, prompt: &ConfirmPrompt) -> bool {
        if !self.0 {
            info!(task = %prompt.task, action = %prompt.action, "action posted without confirmation");
        }
        self.0
    }
}

#[derive(Debug, Clone, Serialize)]
struct SessionView {
    #[serde(flatten)]
    state: ConsoleState,
    alerts: Vec<Alert>,
    stuck_batches: Vec<String>,
    can_complete_missing: bool,
}

impl SessionView {
    fn build(state: ConsoleState, console: &Console) -> Self {
        let now = Utc::now();
        let max_age = console.config().verification_max_age_chrono();
        Self {
            alerts: state.health_alerts(),
            stuck_batches: state.stuck_batches(now).into_iter().map(|b| b.id.clone()).collect(),
            can_complete_missing: state.can_complete_missing(now, max_age),
            state,
        }
    }
}

struct TaskOption {
    id: &'static str,
    label: &'static str,
    selected: bool,
}

struct AlertRow {
    css: &'static str,
    message: String,
}

struct ActionButton {
    name: &'static str,
    confirm: bool,
    disabled: bool,
}

#[derive(Template)]
#[template(path = "console.html")]
struct ConsoleTemplate {
    tasks: Vec<TaskOption>,
    task_label: String,
    stage: String,
    progress: u8,
    source_total: u64,
    source_enriched: u64,
    facets_created: u64,
    target_facets: u64,
    remaining: u64,
    warnings: Vec<String>,
    alerts: Vec<AlertRow>,
    active_job: String,
    processing: usize,
    stuck: Vec<String>,
    actions: Vec<ActionButton>,
    last_refresh: String,
    last_error: String,
    last_message: String,
}

impl ConsoleTemplate {
    fn from_view(view: &SessionView) -> Self {
        let state = &view.state;
        let snapshot = &state.snapshot;
        let tasks = registry()
            .iter()
            .map(|t| TaskOption {
                id: t.task_id.as_str(),
                label: t.label,
                selected: t.task_id == state.task,
            })
            .collect();
        let alerts = view
            .alerts
            .iter()
            .map(|a| AlertRow {
                css: match a.severity {
                    Severity::Error => "alert-error",
                    Severity::Warning => "alert-warning",
                    Severity::Info => "alert-info",
                },
                message: a.message.clone(),
            })
            .collect();
        let actions = ConsoleAction::ALL
            .iter()
            .map(|&action| ActionButton {
                name: action.as_str(),
                confirm: action.requires_confirmation(),
                disabled: state.in_flight.contains(&action)
                    || (action == ConsoleAction::StartMissing && !view.can_complete_missing),
            })
            .collect();

        Self {
            tasks,
            task_label: enrich_core::lookup(state.task).label.to_string(),
            stage: state.stage.clone().unwrap_or_default(),
            progress: snapshot.progress,
            source_total: snapshot.source_total,
            source_enriched: snapshot.source_enriched,
            facets_created: snapshot.facets_created,
            target_facets: snapshot.target_facets,
            remaining: snapshot.remaining,
            warnings: snapshot.warnings.clone(),
            alerts,
            active_job: state
                .board
                .active_job()
                .map(|j| format!("{} ({:?})", j.id, j.status))
                .unwrap_or_else(|| "none".to_string()),
            processing: state.board.processing_count(),
            stuck: view.stuck_batches.clone(),
            actions,
            last_refresh: state
                .last_refresh
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
            last_error: state.last_error.clone().unwrap_or_default(),
            last_message: state
                .last_outcome
                .as_ref()
                .map(|o| o.message.clone())
                .unwrap_or_default(),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/tasks", get(tasks_handler))
        .route("/api/tasks/{task}/snapshot", get(snapshot_handler))
        .route("/api/session", get(session_handler))
        .route("/api/session/task/{task}", post(select_task_handler))
        .route("/api/session/refresh", post(refresh_handler))
        .route("/api/session/actions/{action}", post(action_handler))
        .route("/api/realtime", post(realtime_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(session: ConsoleSession, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "console web listening");
    axum::serve(listener, app(AppState::new(session))).await?;
    Ok(())
}

pub async fn serve_from_env(session: ConsoleSession) -> anyhow::Result<()> {
    let port: u16 = std::env::var("ENRICH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    serve(session, port).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    let view = SessionView::build(state.session.state(), state.console());
    render_html(ConsoleTemplate::from_view(&view))
}

async fn tasks_handler() -> Response {
    let tasks: Vec<TaskSummary> = registry().iter().map(TaskSummary::from).collect();
    Json(tasks).into_response()
}

async fn snapshot_handler(
    State(state): State<Arc<AppState>>,
    Path(task): Path<String>,
    Query(query): Query<StageQuery>,
) -> Response {
    let task = state.console().resolve_task(Some(&task));
    let snapshot = state.console().snapshot(task, query.stage.as_deref()).await;
    Json(snapshot).into_response()
}

async fn session_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(SessionView::build(state.session.state(), state.console())).into_response()
}

async fn select_task_handler(
    State(state): State<Arc<AppState>>,
    Path(task): Path<String>,
    Query(query): Query<StageQuery>,
) -> Response {
    let task = state.console().resolve_task(Some(&task));
    state.session.select_task(task.task_id, query.stage);
    Json(SessionView::build(state.session.state(), state.console())).into_response()
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let applied = state.session.refresh().await;
    Json(json!({ "applied": applied })).into_response()
}

async fn action_handler(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
    Query(query): Query<ActionQuery>,
) -> Response {
    let action: ConsoleAction = match action.parse() {
        Ok(action) => action,
        Err(err) => return gateway_error(err),
    };
    let params = ActionParams {
        workers: query.workers,
        batch_size: query.batch_size,
    };
    match state
        .session
        .run_action(action, &params, &QueryConfirm(query.confirm))
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => gateway_error(err),
    }
}

async fn realtime_handler(State(state): State<Arc<AppState>>, Json(event): Json<RealtimeEvent>) -> Response {
    let delivered = state.console().hub().publish(event);
    Json(json!({ "delivered": delivered })).into_response()
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::UnknownAction(_) => StatusCode::NOT_FOUND,
        GatewayError::NotConfirmed(_) | GatewayError::Precondition { .. } | GatewayError::StaleVerification(_) => {
            StatusCode::CONFLICT
        }
        GatewayError::EmptySource { .. } | GatewayError::Rejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        GatewayError::Transport { .. } | GatewayError::Store { .. } => StatusCode::BAD_GATEWAY,
    }
}

fn gateway_error(err: GatewayError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, "console action failed upstream");
    }
    (
        status,
        Json(json!({
            "error": err.to_string(),
            "action": err.action().map(ConsoleAction::as_str),
        })),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
