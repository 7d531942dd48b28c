//! In-process [`Store`] and [`FunctionClient`] used by tests and offline dry runs.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::{FunctionClient, Predicate, Row, Store, StoreError, TableQuery};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn failure(target: &str) -> StoreError {
    StoreError::HttpStatus {
        status: 500,
        url: format!("memory://{target}"),
        body: json!({ "error": format!("{target} unavailable") }).to_string(),
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    rpcs: Mutex<HashMap<String, JsonValue>>,
    failing: Mutex<HashSet<String>>,
    inserted: Mutex<Vec<(String, Row)>>,
    rpc_calls: Mutex<Vec<(String, JsonValue)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, table: &str, rows: impl IntoIterator<Item = JsonValue>) -> Self {
        self.push_rows(table, rows);
        self
    }

    pub fn with_rpc(self, name: &str, result: JsonValue) -> Self {
        self.set_rpc(name, result);
        self
    }

    pub fn push_rows(&self, table: &str, rows: impl IntoIterator<Item = JsonValue>) {
        let mut tables = lock(&self.tables);
        let entry = tables.entry(table.to_string()).or_default();
        entry.extend(rows.into_iter().filter_map(|r| match r {
            JsonValue::Object(map) => Some(map),
            _ => None,
        }));
    }

    pub fn set_rpc(&self, name: &str, result: JsonValue) {
        lock(&self.rpcs).insert(name.to_string(), result);
    }

    /// Makes every read of `target` (table or RPC) fail with a server error.
    pub fn fail(&self, target: &str) {
        lock(&self.failing).insert(target.to_string());
    }

    pub fn inserted(&self, table: &str) -> Vec<Row> {
        lock(&self.inserted)
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn rpc_calls(&self) -> Vec<(String, JsonValue)> {
        lock(&self.rpc_calls).clone()
    }

    fn check(&self, target: &str) -> Result<(), StoreError> {
        if lock(&self.failing).contains(target) {
            Err(failure(target))
        } else {
            Ok(())
        }
    }

    fn filtered(&self, table: &str, predicates: &[Predicate]) -> Vec<Row> {
        lock(&self.tables)
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| predicates.iter().all(|p| p.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn compare_cells(a: Option<&JsonValue>, b: Option<&JsonValue>) -> Ordering {
    match (a, b) {
        (Some(JsonValue::Number(x)), Some(JsonValue::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(JsonValue::String(x)), Some(JsonValue::String(y))) => x.cmp(y),
        (None | Some(JsonValue::Null), None | Some(JsonValue::Null)) => Ordering::Equal,
        (None | Some(JsonValue::Null), _) => Ordering::Greater,
        (_, None | Some(JsonValue::Null)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn count(&self, table: &str, predicates: &[Predicate]) -> Result<Option<u64>, StoreError> {
        self.check(table)?;
        Ok(Some(self.filtered(table, predicates).len() as u64))
    }

    async fn rows(&self, query: &TableQuery) -> Result<Vec<Row>, StoreError> {
        self.check(&query.table)?;
        let mut rows = self.filtered(&query.table, &query.predicates);
        if let Some(order) = &query.order_by {
            rows.sort_by(|a, b| {
                let ord = compare_cells(a.get(&order.column), b.get(&order.column));
                if order.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            });
        }
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| {
                if query.columns.is_empty() {
                    row
                } else {
                    row.into_iter()
                        .filter(|(k, _)| query.columns.iter().any(|c| c == k))
                        .collect()
                }
            })
            .collect())
    }

    async fn rpc(&self, name: &str, args: JsonValue) -> Result<JsonValue, StoreError> {
        lock(&self.rpc_calls).push((name.to_string(), args));
        self.check(name)?;
        lock(&self.rpcs).get(name).cloned().ok_or_else(|| StoreError::HttpStatus {
            status: 404,
            url: format!("memory://rpc/{name}"),
            body: json!({ "message": format!("function {name} not found") }).to_string(),
        })
    }

    async fn insert(&self, table: &str, row: JsonValue) -> Result<(), StoreError> {
        self.check(table)?;
        let JsonValue::Object(map) = row else {
            return Err(StoreError::Unsupported(format!("{table} insert of non-object")));
        };
        lock(&self.inserted).push((table.to_string(), map.clone()));
        lock(&self.tables).entry(table.to_string()).or_default().push(map);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub function: String,
    pub body: JsonValue,
}

impl FunctionCall {
    pub fn action(&self) -> Option<&str> {
        self.body.get("action").and_then(JsonValue::as_str)
    }
}

/// Function client that records every call and answers from per-action queues.
///
/// Lookup order: queued response for `function#action`, queued response for `function`,
/// then `{"success": true}`.
#[derive(Debug, Default)]
pub struct ScriptedFunctions {
    queued: Mutex<HashMap<String, VecDeque<Result<JsonValue, String>>>>,
    calls: Mutex<Vec<FunctionCall>>,
}

impl ScriptedFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(function: &str, action: Option<&str>) -> String {
        match action {
            Some(action) => format!("{function}#{action}"),
            None => function.to_string(),
        }
    }

    pub fn respond(&self, function: &str, action: Option<&str>, response: JsonValue) {
        lock(&self.queued)
            .entry(Self::key(function, action))
            .or_default()
            .push_back(Ok(response));
    }

    /// Queues a transport-level failure carrying `message` as the server error text.
    pub fn fail(&self, function: &str, action: Option<&str>, message: &str) {
        lock(&self.queued)
            .entry(Self::key(function, action))
            .or_default()
            .push_back(Err(message.to_string()));
    }

    pub fn calls(&self) -> Vec<FunctionCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_to(&self, function: &str) -> Vec<FunctionCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.function == function)
            .cloned()
            .collect()
    }

    fn next_response(&self, function: &str, action: Option<&str>) -> Option<Result<JsonValue, String>> {
        let mut queued = lock(&self.queued);
        if action.is_some() {
            if let Some(resp) = queued
                .get_mut(&Self::key(function, action))
                .and_then(VecDeque::pop_front)
            {
                return Some(resp);
            }
        }
        queued.get_mut(function).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl FunctionClient for ScriptedFunctions {
    async fn invoke(&self, function: &str, body: JsonValue) -> Result<JsonValue, StoreError> {
        let action = body.get("action").and_then(JsonValue::as_str).map(str::to_string);
        lock(&self.calls).push(FunctionCall {
            function: function.to_string(),
            body,
        });
        match self.next_response(function, action.as_deref()) {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(message)) => Err(StoreError::HttpStatus {
                status: 500,
                url: format!("memory://functions/{function}"),
                body: json!({ "error": message }).to_string(),
            }),
            None => Ok(json!({ "success": true })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use enrich_core::ScalarValue;

    #[tokio::test]
    async fn memory_store_filters_orders_and_pages() {
        let store = MemoryStore::new().with_rows(
            "batch_progress",
            vec![
                json!({"id": "b3", "job_id": "j1", "batch_number": 3}),
                json!({"id": "b1", "job_id": "j1", "batch_number": 1}),
                json!({"id": "b2", "job_id": "j2", "batch_number": 2}),
                json!({"id": "b9", "job_id": "j9", "batch_number": 9}),
            ],
        );

        let rows = store
            .rows(
                &TableQuery::new("batch_progress")
                    .filter(Predicate::In("job_id".into(), vec!["j1".into(), "j2".into()]))
                    .order("batch_number", true),
            )
            .await
            .expect("rows");
        let ids: Vec<_> = rows.iter().map(|r| r["id"].as_str().unwrap_or_default()).collect();
        assert_eq!(ids, ["b1", "b2", "b3"]);

        let paged = crate::fetch_paged(&store, &TableQuery::new("batch_progress"), 3)
            .await
            .expect("paged");
        assert_eq!(paged.len(), 4);

        assert_eq!(
            store
                .count("batch_progress", &[Predicate::eq("job_id", ScalarValue::text("j1"))])
                .await
                .expect("count"),
            Some(2)
        );
    }

    #[tokio::test]
    async fn failing_targets_surface_errors() {
        let store = MemoryStore::new();
        store.fail("pricing_embeddings");
        assert!(store.count("pricing_embeddings", &[]).await.is_err());
        assert!(store.rpc("missing_rpc", json!({})).await.is_err());
    }

    #[tokio::test]
    async fn scripted_functions_prefer_action_specific_queue() {
        let functions = ScriptedFunctions::new();
        functions.respond("sched", Some("start"), json!({"success": true, "jobId": "j1"}));
        functions.fail("sched", None, "boom");

        let started = functions
            .invoke("sched", json!({"action": "start"}))
            .await
            .expect("start response");
        assert_eq!(started["jobId"], "j1");

        let err = functions
            .invoke("sched", json!({"action": "recover"}))
            .await
            .expect_err("queued failure");
        assert_eq!(err.server_message().as_deref(), Some("boom"));

        let fallback = functions
            .invoke("sched", json!({"action": "recover"}))
            .await
            .expect("default");
        assert_eq!(fallback["success"], true);
        assert_eq!(functions.calls().len(), 3);
    }
}
