/*!
Mock aggregation server for agent tests

In-process axum server speaking the metrics and command relay HTTP API.
Records every request and can be switched into failure modes:
- offline (503 everywhere) or failing the next N metric posts
- rejecting the API key (401)
- bulk endpoint missing (404)
- forgetting registered clients (404 on client-scoped routes)

Commands stay queued until a result for them is posted, so a lost result
report leads to re-delivery exactly like a real at-least-once queue.
*/

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// How an empty command queue answers a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyPoll {
    #[default]
    NoContent,
    EmptyBody,
    Null,
    CommandNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricsRoute {
    Single,
    Bulk,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub path: String,
    pub api_key: Option<String>,
    pub client_id: Option<String>,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct CommandReport {
    pub client_id: String,
    pub command_id: String,
    pub body: Value,
}

#[derive(Debug)]
struct MockState {
    api_key: Option<String>,
    requests: Vec<RecordedRequest>,
    deliveries: Vec<(MetricsRoute, Value)>,
    registrations: Vec<Value>,
    registered: HashSet<String>,
    heartbeats: Vec<Value>,
    results: Vec<CommandReport>,
    queues: HashMap<String, VecDeque<Value>>,
    offline: bool,
    fail_metrics: usize,
    metric_statuses: HashMap<String, StatusCode>,
    fail_results: usize,
    unauthorized: bool,
    bulk_supported: bool,
    wrap_commands: bool,
    empty_poll: EmptyPoll,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            api_key: None,
            requests: Vec::new(),
            deliveries: Vec::new(),
            registrations: Vec::new(),
            registered: HashSet::new(),
            heartbeats: Vec::new(),
            results: Vec::new(),
            queues: HashMap::new(),
            offline: false,
            fail_metrics: 0,
            metric_statuses: HashMap::new(),
            fail_results: 0,
            unauthorized: false,
            bulk_supported: true,
            wrap_commands: false,
            empty_poll: EmptyPoll::default(),
        }
    }
}

type Shared = Arc<Mutex<MockState>>;

/// Running mock server; stops when dropped
pub struct MockAggregator {
    addr: SocketAddr,
    state: Shared,
    server: JoinHandle<()>,
}

impl MockAggregator {
    /// Bind an ephemeral localhost port and start serving
    pub async fn start() -> Result<Self> {
        Self::start_with_key(None).await
    }

    /// Same, but require `x-api-key: <key>` on every route except `/health`
    pub async fn start_with_key(api_key: Option<&str>) -> Result<Self> {
        let state: Shared = Arc::new(Mutex::new(MockState {
            api_key: api_key.map(str::to_string),
            ..MockState::default()
        }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = build_router(Arc::clone(&state));
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                log::error!("[MOCK] server stopped: {}", e);
            }
        });

        log::info!("[MOCK] aggregator listening on {}", addr);
        Ok(Self { addr, state, server })
    }

    /// Base URL to configure the agent with
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    // -- failure switches --

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// The next `n` posts to `/metrics` or `/metrics/bulk` answer 503
    pub fn fail_next_metrics(&self, n: usize) {
        self.state.lock().fail_metrics = n;
    }

    /// Any metrics post carrying an entry called `name` answers `status` until cleared
    pub fn answer_metric_with(&self, name: &str, status: u16) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        self.state.lock().metric_statuses.insert(name.to_string(), status);
    }

    pub fn clear_metric_answers(&self) {
        self.state.lock().metric_statuses.clear();
    }

    /// The next `n` result reports answer 500
    pub fn fail_next_results(&self, n: usize) {
        self.state.lock().fail_results = n;
    }

    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.state.lock().unauthorized = unauthorized;
    }

    pub fn set_bulk_supported(&self, supported: bool) {
        self.state.lock().bulk_supported = supported;
    }

    pub fn set_empty_poll(&self, style: EmptyPoll) {
        self.state.lock().empty_poll = style;
    }

    /// Serve commands as `{"command": {...}}` instead of the bare object
    pub fn set_wrap_commands(&self, wrap: bool) {
        self.state.lock().wrap_commands = wrap;
    }

    /// Drop a registration: client-scoped routes answer 404 until it registers again
    pub fn forget_client(&self, client_id: &str) {
        self.state.lock().registered.remove(client_id);
    }

    /// Queue a command for `client_id`
    pub fn push_command(&self, client_id: &str, id: &str, command_type: &str, args: Value) {
        let command = json!({
            "id": id,
            "type": command_type,
            "args": args,
            "issued_at": chrono::Utc::now(),
        });
        self.state
            .lock()
            .queues
            .entry(client_id.to_string())
            .or_default()
            .push_back(command);
    }

    // -- inspection --

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().requests.clone()
    }

    pub fn deliveries(&self) -> Vec<(MetricsRoute, Value)> {
        self.state.lock().deliveries.clone()
    }

    /// Names of all accepted metric entries, in arrival order across both routes
    pub fn delivered_metric_names(&self) -> Vec<String> {
        self.state
            .lock()
            .deliveries
            .iter()
            .flat_map(|(_, body)| {
                body["metrics"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|m| m["name"].as_str().map(str::to_string))
            })
            .collect()
    }

    pub fn bulk_request_count(&self) -> usize {
        self.state
            .lock()
            .deliveries
            .iter()
            .filter(|(route, _)| *route == MetricsRoute::Bulk)
            .count()
    }

    pub fn registrations(&self) -> Vec<Value> {
        self.state.lock().registrations.clone()
    }

    pub fn is_registered(&self, client_id: &str) -> bool {
        self.state.lock().registered.contains(client_id)
    }

    pub fn heartbeats(&self) -> Vec<Value> {
        self.state.lock().heartbeats.clone()
    }

    pub fn results(&self) -> Vec<CommandReport> {
        self.state.lock().results.clone()
    }

    pub fn pending_commands(&self, client_id: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(client_id)
            .map_or(0, VecDeque::len)
    }

    /// Count of requests hitting `path` exactly
    pub fn hits(&self, path: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.path == path)
            .count()
    }
}

impl Drop for MockAggregator {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn build_router(state: Shared) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", post(post_metrics))
        .route("/metrics/bulk", post(post_metrics_bulk))
        .route("/clients/register", post(register))
        .route("/clients/{id}/commands/next", get(next_command))
        .route("/clients/{id}/commands/{cmd_id}/result", post(post_result))
        .route("/clients/{id}/heartbeat", post(heartbeat))
        .with_state(state)
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Record the request, then apply auth and offline switches
fn admit(
    state: &mut MockState,
    method: &'static str,
    path: String,
    headers: &HeaderMap,
    body: &Bytes,
) -> Option<StatusCode> {
    let api_key = header(headers, "x-api-key");
    state.requests.push(RecordedRequest {
        method,
        path,
        api_key: api_key.clone(),
        client_id: header(headers, "x-client-id"),
        body: serde_json::from_slice(body).unwrap_or(Value::Null),
    });

    if state.offline {
        return Some(StatusCode::SERVICE_UNAVAILABLE);
    }
    let key_ok = match &state.api_key {
        Some(expected) => api_key.as_deref() == Some(expected.as_str()),
        None => true,
    };
    if state.unauthorized || !key_ok {
        return Some(StatusCode::UNAUTHORIZED);
    }
    None
}

fn ok() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn health(State(state): State<Shared>) -> Response {
    if state.lock().offline {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    } else {
        "ok".into_response()
    }
}

fn accept_metrics(state: &Shared, route: MetricsRoute, headers: &HeaderMap, body: Bytes) -> Response {
    let path = match route {
        MetricsRoute::Single => "/metrics",
        MetricsRoute::Bulk => "/metrics/bulk",
    };
    let mut state = state.lock();
    if let Some(status) = admit(&mut state, "POST", path.to_string(), headers, &body) {
        return status.into_response();
    }
    if route == MetricsRoute::Bulk && !state.bulk_supported {
        return StatusCode::NOT_FOUND.into_response();
    }
    if state.fail_metrics > 0 {
        state.fail_metrics -= 1;
        return (StatusCode::SERVICE_UNAVAILABLE, "temporarily unavailable").into_response();
    }

    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return StatusCode::UNPROCESSABLE_ENTITY.into_response();
    };
    let forced = payload["metrics"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|entry| entry["name"].as_str())
        .find_map(|name| state.metric_statuses.get(name).copied());
    if let Some(status) = forced {
        return (status, "metric refused").into_response();
    }
    let count = payload["metrics"].as_array().map_or(0, Vec::len);
    log::info!("[MOCK] accepted {} metrics on {}", count, path);
    state.deliveries.push((route, payload));
    ok()
}

async fn post_metrics(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Response {
    accept_metrics(&state, MetricsRoute::Single, &headers, body)
}

async fn post_metrics_bulk(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Response {
    accept_metrics(&state, MetricsRoute::Bulk, &headers, body)
}

async fn register(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> Response {
    let mut state = state.lock();
    if let Some(status) = admit(&mut state, "POST", "/clients/register".into(), &headers, &body) {
        return status.into_response();
    }
    let Ok(payload) = serde_json::from_slice::<Value>(&body) else {
        return StatusCode::UNPROCESSABLE_ENTITY.into_response();
    };
    let Some(client_id) = payload["client_id"].as_str().map(str::to_string) else {
        return StatusCode::UNPROCESSABLE_ENTITY.into_response();
    };

    log::info!("[MOCK] registered client {}", client_id);
    state.registered.insert(client_id);
    state.registrations.push(payload);
    ok()
}

async fn next_command(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock();
    let path = format!("/clients/{}/commands/next", id);
    if let Some(status) = admit(&mut state, "GET", path, &headers, &Bytes::new()) {
        return status.into_response();
    }
    if !state.registered.contains(&id) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let front = state.queues.get(&id).and_then(|q| q.front().cloned());
    match front {
        Some(command) if state.wrap_commands => Json(json!({ "command": command })).into_response(),
        Some(command) => Json(command).into_response(),
        None => match state.empty_poll {
            EmptyPoll::NoContent => StatusCode::NO_CONTENT.into_response(),
            EmptyPoll::EmptyBody => StatusCode::OK.into_response(),
            EmptyPoll::Null => Json(Value::Null).into_response(),
            EmptyPoll::CommandNull => Json(json!({ "command": null })).into_response(),
        },
    }
}

async fn post_result(
    State(state): State<Shared>,
    Path((id, cmd_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.lock();
    let path = format!("/clients/{}/commands/{}/result", id, cmd_id);
    if let Some(status) = admit(&mut state, "POST", path, &headers, &body) {
        return status.into_response();
    }
    if state.fail_results > 0 {
        state.fail_results -= 1;
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    if let Some(queue) = state.queues.get_mut(&id) {
        if queue.front().and_then(|c| c["id"].as_str()) == Some(cmd_id.as_str()) {
            queue.pop_front();
        }
    }
    state.results.push(CommandReport {
        client_id: id,
        command_id: cmd_id,
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    });
    ok()
}

async fn heartbeat(
    State(state): State<Shared>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.lock();
    let path = format!("/clients/{}/heartbeat", id);
    if let Some(status) = admit(&mut state, "POST", path, &headers, &body) {
        return status.into_response();
    }
    if !state.registered.contains(&id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    state
        .heartbeats
        .push(serde_json::from_slice(&body).unwrap_or(Value::Null));
    ok()
}
