//! Store, function and realtime boundaries for the enrichment console.
//!
//! The console only talks to the hosted backend through the [`Store`] and [`FunctionClient`]
//! traits. Two store backends are provided: [`RestStore`] speaks the PostgREST dialect over
//! HTTP and [`PgStore`] talks to the same database directly through `sqlx`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use enrich_core::{json_identity, FilterOperator, RealtimeChannel, ScalarValue, SourceFilter};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub mod memory;

pub use memory::{FunctionCall, MemoryStore, ScriptedFunctions};

pub const CRATE_NAME: &str = "enrich-store";

/// PostgREST caps unpaged reads at 1000 rows by default.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

pub type Row = Map<String, JsonValue>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("unsupported argument for {0}")]
    Unsupported(String),
}

impl StoreError {
    /// Server-provided `error`/`message` text when the body is a JSON error envelope.
    pub fn server_message(&self) -> Option<String> {
        let StoreError::HttpStatus { body, .. } = self else {
            return None;
        };
        let value: JsonValue = serde_json::from_str(body).ok()?;
        ["error", "message"]
            .iter()
            .find_map(|k| value.get(*k).and_then(JsonValue::as_str))
            .map(ToString::to_string)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(String, ScalarValue),
    Neq(String, ScalarValue),
    Is(String, ScalarValue),
    In(String, Vec<String>),
    NotNull(String),
}

impl Predicate {
    pub fn eq(column: &str, value: ScalarValue) -> Self {
        Predicate::Eq(column.to_string(), value)
    }

    pub fn from_source_filter(filter: &SourceFilter) -> Self {
        let column = filter.column.to_string();
        match filter.operator {
            FilterOperator::Eq => Predicate::Eq(column, filter.value.clone()),
            FilterOperator::Neq => Predicate::Neq(column, filter.value.clone()),
            FilterOperator::Is => Predicate::Is(column, filter.value.clone()),
        }
    }

    pub fn column(&self) -> &str {
        match self {
            Predicate::Eq(c, _) | Predicate::Neq(c, _) | Predicate::Is(c, _) | Predicate::In(c, _) => c,
            Predicate::NotNull(c) => c,
        }
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::Eq(c, v) | Predicate::Is(c, v) => v.matches_json(row.get(c)),
            Predicate::Neq(c, v) => !v.matches_json(row.get(c)),
            Predicate::In(c, values) => row
                .get(c)
                .and_then(json_identity)
                .map(|id| values.iter().any(|v| *v == id))
                .unwrap_or(false),
            Predicate::NotNull(c) => !matches!(row.get(c), None | Some(JsonValue::Null)),
        }
    }

    fn to_query_pair(&self) -> (String, String) {
        match self {
            Predicate::Eq(c, ScalarValue::Null) | Predicate::Is(c, ScalarValue::Null) => {
                (c.clone(), "is.null".to_string())
            }
            Predicate::Eq(c, v) => (c.clone(), format!("eq.{}", v.to_query_literal())),
            Predicate::Neq(c, ScalarValue::Null) => (c.clone(), "not.is.null".to_string()),
            Predicate::Neq(c, v) => (c.clone(), format!("neq.{}", v.to_query_literal())),
            Predicate::Is(c, v) => (c.clone(), format!("is.{}", v.to_query_literal())),
            Predicate::In(c, values) => {
                let quoted = values
                    .iter()
                    .map(|v| format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
                    .collect::<Vec<_>>()
                    .join(",");
                (c.clone(), format!("in.({quoted})"))
            }
            Predicate::NotNull(c) => (c.clone(), "not.is.null".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableQuery {
    pub table: String,
    pub columns: Vec<String>,
    pub predicates: Vec<Predicate>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TableQuery {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: Vec::new(),
            predicates: Vec::new(),
            order_by: None,
            limit: None,
            offset: None,
        }
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn source_filter(self, filter: Option<&SourceFilter>) -> Self {
        match filter {
            Some(f) => self.filter(Predicate::from_source_filter(f)),
            None => self,
        }
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order_by = Some(OrderBy {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    fn select_clause(&self) -> String {
        if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(",")
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Exact row count. `Ok(None)` means the backend answered without a usable count.
    async fn count(&self, table: &str, predicates: &[Predicate]) -> Result<Option<u64>, StoreError>;

    async fn rows(&self, query: &TableQuery) -> Result<Vec<Row>, StoreError>;

    async fn rpc(&self, name: &str, args: JsonValue) -> Result<JsonValue, StoreError>;

    async fn insert(&self, table: &str, row: JsonValue) -> Result<(), StoreError>;
}

#[async_trait]
pub trait FunctionClient: Send + Sync {
    async fn invoke(&self, function: &str, body: JsonValue) -> Result<JsonValue, StoreError>;
}

/// Reads every page of `query`, `page_size` rows at a time.
pub async fn fetch_paged(
    store: &dyn Store,
    query: &TableQuery,
    page_size: usize,
) -> Result<Vec<Row>, StoreError> {
    let page_size = page_size.max(1);
    let mut out = Vec::new();
    let mut offset = 0usize;
    loop {
        let page = store
            .rows(&query.clone().limit(page_size).offset(offset))
            .await?;
        let len = page.len();
        out.extend(page);
        if len < page_size {
            return Ok(out);
        }
        offset += len;
    }
}

/// First object row of an RPC or view result, whether it came back as an object or an array.
pub fn first_row(value: JsonValue) -> Option<Row> {
    match value {
        JsonValue::Object(map) => Some(map),
        JsonValue::Array(items) => items.into_iter().find_map(|item| match item {
            JsonValue::Object(map) => Some(map),
            _ => None,
        }),
        _ => None,
    }
}

/// Scalar count from an RPC result (`42`, `[42]`, `"42"` or `[{"count": 42}]`).
pub fn scalar_count(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Array(items) => items.first().and_then(scalar_count),
        JsonValue::Object(map) if map.len() == 1 => map.values().next().and_then(scalar_count),
        _ => None,
    }
}

pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}

/// Decides whether a failed request may be sent again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Counts, row reads and RPCs: resent on 5xx, 429 and transport errors.
    Read,
    /// Inserts and function invocations: resent only when the store never saw the request.
    Write,
}

impl RequestKind {
    pub fn retries_status(self, status: StatusCode) -> bool {
        match self {
            RequestKind::Read => status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS,
            RequestKind::Write => status == StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn retries_error(self, err: &reqwest::Error) -> bool {
        match self {
            RequestKind::Read => err.is_timeout() || err.is_connect() || err.is_request(),
            RequestKind::Write => err.is_connect(),
        }
    }
}

/// Exponential delay between resends, doubling from `initial` up to `cap`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub retries: usize,
    pub initial: Duration,
    pub cap: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            retries: 3,
            initial: Duration::from_millis(250),
            cap: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    pub fn delay(&self, retry: usize) -> Duration {
        let shift = u32::try_from(retry).unwrap_or(u32::MAX).min(31);
        self.initial.saturating_mul(1 << shift).min(self.cap)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub request_timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: Backoff,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agent: Some(format!("enrich-console/{}", env!("CARGO_PKG_VERSION"))),
            backoff: Backoff::default(),
        }
    }
}

/// Shared HTTP plumbing for the REST store and the function client.
#[derive(Debug, Clone)]
struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    backoff: Backoff,
}

impl HttpTransport {
    fn new(base_url: &str, api_key: Option<String>, config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.request_timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            backoff: config.backoff,
        })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("apikey", key).bearer_auth(key),
            None => builder,
        }
    }

    async fn send<F>(&self, kind: RequestKind, build: F) -> Result<reqwest::Response, StoreError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut retry = 0;
        loop {
            let can_retry = retry < self.backoff.retries;
            match self.authorize(build()).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if can_retry && kind.retries_status(resp.status()) => {
                    debug!(status = resp.status().as_u16(), retry, ?kind, "resending after status");
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let url = resp.url().to_string();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(StoreError::HttpStatus { status, url, body });
                }
                Err(err) if can_retry && kind.retries_error(&err) => {
                    debug!(error = %err, retry, ?kind, "resending after transport error");
                }
                Err(err) => return Err(StoreError::Request(err)),
            }
            tokio::time::sleep(self.backoff.delay(retry)).await;
            retry += 1;
        }
    }
}

/// PostgREST-backed store (`{base}/rest/v1/...`).
#[derive(Debug, Clone)]
pub struct RestStore {
    http: HttpTransport,
}

impl RestStore {
    pub fn new(base_url: &str, api_key: Option<String>, config: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpTransport::new(base_url, api_key, config)?,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.http.base_url, table)
    }

    fn query_pairs(query: &TableQuery) -> Vec<(String, String)> {
        let mut pairs = vec![("select".to_string(), query.select_clause())];
        pairs.extend(query.predicates.iter().map(Predicate::to_query_pair));
        if let Some(order) = &query.order_by {
            let dir = if order.ascending { "asc" } else { "desc" };
            pairs.push(("order".to_string(), format!("{}.{dir}", order.column)));
        }
        if let Some(limit) = query.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = query.offset {
            pairs.push(("offset".to_string(), offset.to_string()));
        }
        pairs
    }
}

/// Total from a `Content-Range` header such as `0-24/3573` or `*/0`.
pub fn parse_content_range_total(header: &str) -> Option<u64> {
    header.rsplit('/').next()?.trim().parse().ok()
}

#[async_trait]
impl Store for RestStore {
    async fn count(&self, table: &str, predicates: &[Predicate]) -> Result<Option<u64>, StoreError> {
        validate_identifier(table)?;
        let url = self.table_url(table);
        let mut pairs = vec![("select".to_string(), "*".to_string())];
        pairs.extend(predicates.iter().map(Predicate::to_query_pair));

        let resp = self
            .http
            .send(RequestKind::Read, || {
                self.http
                    .client
                    .head(&url)
                    .query(&pairs)
                    .header("Prefer", "count=exact")
            })
            .instrument(info_span!("store_count", table))
            .await?;

        Ok(resp
            .headers()
            .get("content-range")
            .and_then(|h| h.to_str().ok())
            .and_then(parse_content_range_total))
    }

    async fn rows(&self, query: &TableQuery) -> Result<Vec<Row>, StoreError> {
        validate_identifier(&query.table)?;
        let url = self.table_url(&query.table);
        let pairs = Self::query_pairs(query);
        let resp = self
            .http
            .send(RequestKind::Read, || self.http.client.get(&url).query(&pairs))
            .instrument(info_span!("store_rows", table = %query.table))
            .await?;
        resp.json::<Vec<Row>>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn rpc(&self, name: &str, args: JsonValue) -> Result<JsonValue, StoreError> {
        validate_identifier(name)?;
        let url = format!("{}/rest/v1/rpc/{}", self.http.base_url, name);
        let resp = self
            .http
            .send(RequestKind::Read, || self.http.client.post(&url).json(&args))
            .instrument(info_span!("store_rpc", rpc = name))
            .await?;
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_str(&text).map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn insert(&self, table: &str, row: JsonValue) -> Result<(), StoreError> {
        validate_identifier(table)?;
        let url = self.table_url(table);
        self.http
            .send(RequestKind::Write, || {
                self.http
                    .client
                    .post(&url)
                    .header("Prefer", "return=minimal")
                    .json(&row)
            })
            .instrument(info_span!("store_insert", table))
            .await?;
        Ok(())
    }
}

/// Direct Postgres store for deployments that can reach the database itself.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }
}

fn quote_ident(name: &str) -> Result<String, StoreError> {
    validate_identifier(name)?;
    Ok(format!("\"{name}\""))
}

fn push_comparison(
    qb: &mut QueryBuilder<'_, Postgres>,
    column: &str,
    value: &ScalarValue,
    negate: bool,
) -> Result<(), StoreError> {
    let col = quote_ident(column)?;
    let op = if negate { "<>" } else { "=" };
    match value {
        ScalarValue::Bool(b) => {
            qb.push(format!("{col} {op} ")).push_bind(*b);
        }
        ScalarValue::Int(i) => {
            qb.push(format!("{col} {op} ")).push_bind(*i);
        }
        ScalarValue::Text(s) => {
            qb.push(format!("{col}::text {op} ")).push_bind(s.to_string());
        }
        ScalarValue::Null => {
            let null_test = if negate { "IS NOT NULL" } else { "IS NULL" };
            qb.push(format!("{col} {null_test}"));
        }
    }
    Ok(())
}

fn push_predicates(qb: &mut QueryBuilder<'_, Postgres>, predicates: &[Predicate]) -> Result<(), StoreError> {
    qb.push(" WHERE TRUE");
    for predicate in predicates {
        qb.push(" AND ");
        match predicate {
            Predicate::Eq(c, v) => push_comparison(qb, c, v, false)?,
            Predicate::Neq(c, v) => push_comparison(qb, c, v, true)?,
            Predicate::Is(c, ScalarValue::Bool(b)) => {
                let truth = if *b { "IS TRUE" } else { "IS FALSE" };
                qb.push(format!("{} {truth}", quote_ident(c)?));
            }
            Predicate::Is(c, v) => push_comparison(qb, c, v, false)?,
            Predicate::In(c, values) => {
                qb.push(format!("{}::text = ANY(", quote_ident(c)?))
                    .push_bind(values.clone())
                    .push(")");
            }
            Predicate::NotNull(c) => {
                qb.push(format!("{} IS NOT NULL", quote_ident(c)?));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn count(&self, table: &str, predicates: &[Predicate]) -> Result<Option<u64>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*) FROM {}", quote_ident(table)?));
        push_predicates(&mut qb, predicates)?;
        let total = qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .instrument(info_span!("pg_count", table))
            .await?;
        Ok(Some(total.max(0) as u64))
    }

    async fn rows(&self, query: &TableQuery) -> Result<Vec<Row>, StoreError> {
        let columns = if query.columns.is_empty() {
            "*".to_string()
        } else {
            query
                .columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Result<Vec<_>, _>>()?
                .join(", ")
        };
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT to_jsonb(t) AS row FROM (SELECT {columns} FROM {}",
            quote_ident(&query.table)?
        ));
        push_predicates(&mut qb, &query.predicates)?;
        if let Some(order) = &query.order_by {
            let dir = if order.ascending { "ASC" } else { "DESC" };
            qb.push(format!(" ORDER BY {} {dir}", quote_ident(&order.column)?));
        }
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            qb.push(" OFFSET ").push_bind(offset as i64);
        }
        qb.push(") t");

        let values = qb
            .build_query_scalar::<JsonValue>()
            .fetch_all(&self.pool)
            .instrument(info_span!("pg_rows", table = %query.table))
            .await?;
        Ok(values
            .into_iter()
            .filter_map(|v| match v {
                JsonValue::Object(map) => Some(map),
                _ => None,
            })
            .collect())
    }

    async fn rpc(&self, name: &str, args: JsonValue) -> Result<JsonValue, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT to_jsonb(r) FROM {}(", quote_ident(name)?));
        if let JsonValue::Object(map) = &args {
            for (idx, (key, value)) in map.iter().enumerate() {
                if idx > 0 {
                    qb.push(", ");
                }
                qb.push(format!("{} => ", quote_ident(key)?));
                match value {
                    JsonValue::Number(n) => {
                        qb.push(n.to_string());
                    }
                    JsonValue::Bool(b) => {
                        qb.push(if *b { "TRUE" } else { "FALSE" });
                    }
                    JsonValue::String(s) => {
                        qb.push_bind(s.clone());
                    }
                    JsonValue::Null => {
                        qb.push("NULL");
                    }
                    _ => return Err(StoreError::Unsupported(format!("{name}.{key}"))),
                }
            }
        }
        qb.push(") AS r");

        let mut values = qb
            .build_query_scalar::<JsonValue>()
            .fetch_all(&self.pool)
            .instrument(info_span!("pg_rpc", rpc = name))
            .await?;
        if values.len() == 1 && !values[0].is_object() {
            return Ok(values.remove(0));
        }
        Ok(JsonValue::Array(values))
    }

    async fn insert(&self, table: &str, row: JsonValue) -> Result<(), StoreError> {
        let JsonValue::Object(map) = &row else {
            return Err(StoreError::Unsupported(format!("{table} insert of non-object")));
        };
        let table_ident = quote_ident(table)?;
        let columns = map
            .keys()
            .map(|k| quote_ident(k))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {table_ident} ({columns}) SELECT {columns} FROM jsonb_populate_record(NULL::{table_ident}, "
        ));
        qb.push_bind(row.clone()).push(")");
        qb.build()
            .execute(&self.pool)
            .instrument(info_span!("pg_insert", table))
            .await?;
        Ok(())
    }
}

/// Edge-function client (`{base}/functions/v1/{name}`).
#[derive(Debug, Clone)]
pub struct HttpFunctionClient {
    http: HttpTransport,
}

impl HttpFunctionClient {
    pub fn new(base_url: &str, api_key: Option<String>, config: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpTransport::new(base_url, api_key, config)?,
        })
    }
}

#[async_trait]
impl FunctionClient for HttpFunctionClient {
    async fn invoke(&self, function: &str, body: JsonValue) -> Result<JsonValue, StoreError> {
        let url = format!("{}/functions/v1/{}", self.http.base_url, function);
        let call_id = Uuid::new_v4();
        let resp = self
            .http
            .send(RequestKind::Write, || self.http.client.post(&url).json(&body))
            .instrument(info_span!("function_invoke", %call_id, function))
            .await?;
        let text = resp.text().await?;
        if text.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_str(&text).map_err(|e| StoreError::Decode(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Rest,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub base_url: String,
    pub api_key: Option<String>,
    pub database_url: Option<String>,
    pub http: HttpClientConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Rest,
            base_url: "http://localhost:54321".to_string(),
            api_key: None,
            database_url: None,
            http: HttpClientConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let backend = match std::env::var("ENRICH_STORE_BACKEND").as_deref() {
            Ok("postgres") | Ok("pg") => StoreBackend::Postgres,
            _ => StoreBackend::Rest,
        };
        let timeout_secs = std::env::var("ENRICH_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        Self {
            backend,
            base_url: std::env::var("SUPABASE_URL").unwrap_or_else(|_| "http://localhost:54321".to_string()),
            api_key: std::env::var("SUPABASE_SERVICE_ROLE_KEY")
                .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
                .ok(),
            database_url: std::env::var("DATABASE_URL").ok(),
            http: HttpClientConfig {
                request_timeout: Duration::from_secs(timeout_secs),
                ..Default::default()
            },
        }
    }

    pub async fn connect_store(&self) -> anyhow::Result<Arc<dyn Store>> {
        match self.backend {
            StoreBackend::Rest => Ok(Arc::new(RestStore::new(
                &self.base_url,
                self.api_key.clone(),
                &self.http,
            )?)),
            StoreBackend::Postgres => {
                let url = self
                    .database_url
                    .as_deref()
                    .context("ENRICH_STORE_BACKEND=postgres requires DATABASE_URL")?;
                Ok(Arc::new(PgStore::connect(url).await?))
            }
        }
    }

    pub fn function_client(&self) -> anyhow::Result<Arc<dyn FunctionClient>> {
        Ok(Arc::new(HttpFunctionClient::new(
            &self.base_url,
            self.api_key.clone(),
            &self.http,
        )?))
    }
}

/// Row-change notification, shaped like a database webhook payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type", default = "default_event_type")]
    pub event_type: String,
    pub table: String,
    #[serde(default)]
    pub record: Row,
}

fn default_event_type() -> String {
    "INSERT".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeFilter {
    pub table: String,
    pub column: Option<String>,
    pub value: Option<String>,
}

impl RealtimeFilter {
    pub fn for_channel(channel: &RealtimeChannel) -> Self {
        Self {
            table: channel.table.to_string(),
            column: Some(channel.facet_column.to_string()),
            value: Some(channel.facet_type.to_string()),
        }
    }

    pub fn matches(&self, event: &RealtimeEvent) -> bool {
        if !event.event_type.eq_ignore_ascii_case("insert") || event.table != self.table {
            return false;
        }
        match (&self.column, &self.value) {
            (Some(column), Some(value)) => {
                event.record.get(column).and_then(JsonValue::as_str) == Some(value.as_str())
            }
            _ => true,
        }
    }
}

/// In-process fan-out of row-change events to console subscriptions.
#[derive(Debug, Clone)]
pub struct RealtimeHub {
    sender: broadcast::Sender<RealtimeEvent>,
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl RealtimeHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of live subscriptions that received the event.
    pub fn publish(&self, event: RealtimeEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self, filter: RealtimeFilter) -> RealtimeSubscription {
        RealtimeSubscription {
            rx: self.sender.subscribe(),
            filter,
        }
    }
}

pub struct RealtimeSubscription {
    rx: broadcast::Receiver<RealtimeEvent>,
    filter: RealtimeFilter,
}

impl RealtimeSubscription {
    /// Next matching event, or `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<RealtimeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, table = %self.filter.table, "realtime subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
