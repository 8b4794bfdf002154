//! HTTP API
//!
//! Axum router over the [`Engine`], with CORS, request tracing and graceful
//! shutdown.
//!
//! Routes:
//! - GET  /health
//! - POST /route-query, /execute-task
//! - GET  /agents, POST /agents, GET /agents/{id}, GET /agents/{id}/learning
//! - GET  /projects/{id}/tools, POST /projects/{id}/tools,
//!   DELETE /projects/{id}/tools/{tool}, POST /projects/{id}/tools/{tool}/usage
//! - GET  /projects/{id}/agents
//! - GET  /projects/{id}/scope, POST /projects/{id}/scope, POST /projects/{id}/scope/check
//! - GET  /tools, POST /tools, POST /tools/recommend
//! - GET  /metrics/routing?hours=N, /metrics/agents, /metrics/cache, /metrics/budget

use axum::{
    extract::{Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::budget::BudgetStatus;
use crate::cache::CacheStats;
use crate::engine::{Engine, ExecuteRequest, ExecuteResult, ScopeUpdate};
use crate::error::RouterError;
use crate::router::Classification;
use crate::scope::ScopeAssessment;
use crate::tools::ToolRecommendations;
use crate::types::{
    AgentDetail, AgentMetrics, AgentProfile, AgentSummary, LearningSummary, NewAgent, NewTool,
    ProjectAgent, ProjectTool, RouteMetrics, ScopeVersion, ToolProfile,
};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub start_time: Instant,
    pub version: &'static str,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// `RouterError` as an HTTP response
pub struct ApiError(RouterError);

impl From<RouterError> for ApiError {
    fn from(e: RouterError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            RouterError::NotFound(_) => StatusCode::NOT_FOUND,
            RouterError::BudgetExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            RouterError::BackendUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RouterError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("{} failed: {}", self.0.kind(), self.0);
        }
        let details = match &self.0 {
            RouterError::BudgetExceeded {
                remaining_tokens,
                resets_at,
            } => Some(serde_json::json!({
                "remaining_tokens": remaining_tokens,
                "resets_at": resets_at.to_rfc3339(),
            })),
            _ => None,
        };
        let body = ErrorResponse {
            error: self.0.kind(),
            message: self.0.to_string(),
            details,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ===== Request bodies =====

#[derive(Debug, Deserialize)]
pub struct TaskBody {
    pub task: String,
}

#[derive(Debug, Deserialize)]
pub struct ScopeBody {
    pub description: String,
    #[serde(default)]
    pub requirements: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddToolBody {
    pub tool: String,
    #[serde(default = "manual_reason")]
    pub reason: String,
}

fn manual_reason() -> String {
    "Added manually".to_string()
}

#[derive(Debug, Deserialize)]
pub struct UsageBody {
    pub success: bool,
}

#[derive(Debug, Deserialize)]
pub struct HoursQuery {
    #[serde(default = "default_hours")]
    pub hours: u32,
}

fn default_hours() -> u32 {
    24
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub agents: usize,
    pub embeddings: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct RemovedResponse {
    pub removed: bool,
}

// ===== Handlers =====

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: state.version,
        uptime_secs: state.start_time.elapsed().as_secs(),
        agents: state.engine.list_agents().len(),
        embeddings: state.engine.embedding_provider().to_string(),
        timestamp: state.engine.now().to_rfc3339(),
    })
}

async fn route_query(State(state): State<AppState>, Json(body): Json<TaskBody>) -> ApiResult<Classification> {
    Ok(Json(state.engine.route_query(&body.task)?))
}

async fn execute_task(
    State(state): State<AppState>,
    Json(body): Json<ExecuteRequest>,
) -> ApiResult<ExecuteResult> {
    Ok(Json(state.engine.execute_task(&body).await?))
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentSummary>> {
    Json(state.engine.list_agents())
}

async fn register_agent(
    State(state): State<AppState>,
    Json(body): Json<NewAgent>,
) -> Result<(StatusCode, Json<AgentProfile>), ApiError> {
    let profile = state.engine.register_agent(&body).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

async fn get_agent(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<AgentDetail> {
    Ok(Json(state.engine.get_agent(id)?))
}

async fn agent_learning(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<LearningSummary> {
    Ok(Json(state.engine.learning_summary(id)?))
}

async fn project_tools(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<ProjectTool>> {
    Ok(Json(state.engine.get_project_tools(&id)?))
}

async fn add_project_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AddToolBody>,
) -> ApiResult<Vec<ProjectTool>> {
    state.engine.add_project_tool(&id, &body.tool, &body.reason)?;
    Ok(Json(state.engine.get_project_tools(&id)?))
}

async fn remove_project_tool(
    State(state): State<AppState>,
    Path((id, tool)): Path<(String, String)>,
) -> ApiResult<RemovedResponse> {
    let removed = state.engine.remove_project_tool(&id, &tool)?;
    Ok(Json(RemovedResponse { removed }))
}

async fn record_tool_usage(
    State(state): State<AppState>,
    Path((id, tool)): Path<(String, String)>,
    Json(body): Json<UsageBody>,
) -> Result<StatusCode, ApiError> {
    state.engine.record_tool_usage(&id, &tool, body.success)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn project_agents(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<ProjectAgent>> {
    Ok(Json(state.engine.get_project_agents(&id)?))
}

async fn scope_history(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Vec<ScopeVersion>> {
    Ok(Json(state.engine.scope_history(&id)?))
}

async fn update_scope(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ScopeBody>,
) -> ApiResult<ScopeUpdate> {
    Ok(Json(
        state
            .engine
            .update_project_scope(&id, &body.description, &body.requirements)
            .await?,
    ))
}

async fn check_scope(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ScopeBody>,
) -> ApiResult<ScopeAssessment> {
    Ok(Json(
        state
            .engine
            .check_scope_change(&id, &body.description, &body.requirements)
            .await?,
    ))
}

async fn list_tools(State(state): State<AppState>) -> ApiResult<Vec<ToolProfile>> {
    Ok(Json(state.engine.list_tools()?))
}

async fn register_tool(
    State(state): State<AppState>,
    Json(body): Json<NewTool>,
) -> Result<(StatusCode, Json<ToolProfile>), ApiError> {
    let tool = state.engine.register_tool(&body).await?;
    Ok((StatusCode::CREATED, Json(tool)))
}

async fn recommend_tools(
    State(state): State<AppState>,
    Json(body): Json<ScopeBody>,
) -> ApiResult<ToolRecommendations> {
    Ok(Json(
        state
            .engine
            .recommend_tools(&body.description, &body.requirements)
            .await?,
    ))
}

async fn routing_metrics(State(state): State<AppState>, Query(query): Query<HoursQuery>) -> ApiResult<Vec<RouteMetrics>> {
    Ok(Json(state.engine.routing_metrics(query.hours)?))
}

async fn agent_metrics(State(state): State<AppState>) -> ApiResult<Vec<AgentMetrics>> {
    Ok(Json(state.engine.agent_metrics()?))
}

async fn cache_metrics(State(state): State<AppState>) -> Json<Vec<CacheStats>> {
    state.engine.sync_caches().await;
    Json(state.engine.cache_stats())
}

async fn budget_metrics(State(state): State<AppState>) -> Json<BudgetStatus> {
    Json(state.engine.budget_status())
}

/// Router with every endpoint and middleware
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route("/route-query", post(route_query))
        .route("/execute-task", post(execute_task))
        .route("/agents", get(list_agents).post(register_agent))
        .route("/agents/{id}", get(get_agent))
        .route("/agents/{id}/learning", get(agent_learning))
        .route("/projects/{id}/tools", get(project_tools).post(add_project_tool))
        .route("/projects/{id}/tools/{tool}", delete(remove_project_tool))
        .route("/projects/{id}/tools/{tool}/usage", post(record_tool_usage))
        .route("/projects/{id}/agents", get(project_agents))
        .route("/projects/{id}/scope", get(scope_history).post(update_scope))
        .route("/projects/{id}/scope/check", post(check_scope))
        .route("/tools", get(list_tools).post(register_tool))
        .route("/tools/recommend", post(recommend_tools))
        .route("/metrics/routing", get(routing_metrics))
        .route("/metrics/agents", get(agent_metrics))
        .route("/metrics/cache", get(cache_metrics))
        .route("/metrics/budget", get(budget_metrics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(engine))
}

/// Serve until Ctrl+C or SIGTERM
pub async fn serve(engine: Arc<Engine>, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Agent router listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(engine))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Agent router shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{BackendRegistry, BackendRequest, BackendResponse, ExecutionBackend};
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::embeddings::HashEmbedder;
    use crate::router::Route;
    use crate::store::Store;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    struct Echo;

    #[async_trait]
    impl ExecutionBackend for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, request: &BackendRequest<'_>) -> crate::error::Result<BackendResponse> {
            Ok(BackendResponse {
                content: format!("echo: {}", request.task),
                model: "echo".into(),
                input_tokens: 5,
                output_tokens: 5,
            })
        }
    }

    fn app() -> Router {
        app_at(Arc::new(ManualClock::default()))
    }

    fn app_at(clock: Arc<ManualClock>) -> Router {
        let engine = Engine::assemble(
            &Config::default(),
            Arc::new(Store::open_in_memory().unwrap()),
            Arc::new(HashEmbedder::new(128)),
            BackendRegistry::new().with(Route::LocalModel, Arc::new(Echo)),
            clock,
        )
        .unwrap();
        router(Arc::new(engine))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_health_and_route_query() {
        let app = app();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(
            &app,
            "POST",
            "/route-query",
            Some(serde_json::json!({"task": "Write a SQL query to join orders and customers"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["route"], "structured_data");
    }

    #[tokio::test]
    async fn test_health_timestamp_follows_engine_clock() {
        let start = chrono::DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let clock = Arc::new(ManualClock::new(start));
        let app = app_at(clock.clone());
        clock.advance_secs(90);

        let (_, body) = send(&app, "GET", "/health", None).await;
        let expected = (start + chrono::Duration::seconds(90)).to_rfc3339();
        assert_eq!(body["timestamp"], expected.as_str());
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let app = app();
        let (status, body) = send(&app, "GET", "/agents/42", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (status, _) = send(
            &app,
            "POST",
            "/projects/shop/scope/check",
            Some(serde_json::json!({"description": "", "requirements": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // no backend for cloud reasoning
        let (status, body) = send(
            &app,
            "POST",
            "/execute-task",
            Some(serde_json::json!({"task": "Refactor this to remove duplication", "project_id": "shop"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "backend_unavailable");
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let app = app();
        let (status, body) = send(
            &app,
            "POST",
            "/agents",
            Some(serde_json::json!({
                "name": "Summarizer",
                "agent_type": "documentation",
                "purpose": "Summarize code and explain functions",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["id"].as_i64().unwrap();

        let (status, body) = send(
            &app,
            "POST",
            "/execute-task",
            Some(serde_json::json!({"task": "Summarize this function", "project_id": "shop"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["agent"]["id"], id);
        assert_eq!(body["result"], "echo: Summarize this function");

        let (status, body) = send(&app, "GET", &format!("/agents/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["profile"]["total_tasks"], 1);

        let (_, body) = send(&app, "GET", "/metrics/routing?hours=1", None).await;
        assert_eq!(body[0]["route"], "local_model");
        assert_eq!(body[0]["count"], 1);
    }
}
