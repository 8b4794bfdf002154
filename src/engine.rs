//! Routing Engine
//!
//! Wires the classifier, cache tier, agent selector, execution backends,
//! recorder, scope detector and tool recommender behind one handle.
//!
//! ```text
//! execute_task ──► budget ──► classify ──► response cache ──► select agent
//!                                                │                 │
//!                                              (hit)          dispatch backend
//!                                                │                 │
//!                                                ▼                 ▼
//!                                            result ◄── record + log + cache
//! ```
//!
//! No lock is held while a backend or embedding request is in flight; the
//! recorder runs synchronously once the backend returns.

use chrono::Duration as ChronoDuration;
use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::{AgentRegistry, AgentSelector};
use crate::backends::{
    BackendRegistry, BackendRequest, ClaudeBackend, HttpQueryBackend, OllamaBackend,
};
use crate::budget::{estimate_cost, BudgetStatus, TokenBudget, TokenCounter};
use crate::cache::{hash_text, CacheStats, CacheTier, CachedResponse, ResponseCache};
use crate::checkpoints::{learning_summary, CheckpointPolicy};
use crate::clock::{system_clock, SharedClock};
use crate::config::{Config, EmbeddingChoice};
use crate::embeddings::{
    EmbeddingConfig, EmbeddingProvider, EmbeddingService, HashEmbedder, OllamaEmbedder,
};
use crate::error::{Result, RouterError};
use crate::recorder::{ExecutionRecorder, RecordedExecution};
use crate::router::{Classification, Route, TaskRouter};
use crate::scope::{validate_project_id, validate_scope, ScopeAssessment, ScopeDetector};
use crate::seed;
use crate::store::{RouteLogEntry, Store};
use crate::tools::{ToolRecommendations, ToolRecommender};
use crate::types::{
    AgentDetail, AgentMetrics, AgentProfile, AgentSummary, ExecutionOutcome, LearningSummary,
    NewAgent, NewTool, ProjectAgent, ProjectTool, RequirementCategory, RouteMetrics,
    ScopeVersion, ToolProfile,
};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful software engineering assistant.";
const RECENT_EXECUTIONS: usize = 20;
const MAX_TASK_CHARS: usize = 100_000;

/// Task execution input
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    pub task: String,
    pub project_id: String,
    /// Only agents of this type are eligible
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub use_tools: bool,
}

impl ExecuteRequest {
    pub fn new(task: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            project_id: project_id.into(),
            agent_type: None,
            use_tools: false,
        }
    }

    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = Some(agent_type.into());
        self
    }

    pub fn with_tools(mut self) -> Self {
        self.use_tools = true;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteMetrics {
    pub tokens_used: u64,
    pub time_ms: u64,
    pub cost_usd: f64,
}

/// Task execution output
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResult {
    pub request_id: String,
    pub route: Route,
    pub agent: Option<AgentSummary>,
    pub result: String,
    pub metrics: ExecuteMetrics,
    pub cached: bool,
    /// Set when this execution completed a learning checkpoint
    pub checkpoint_version: Option<u32>,
}

/// Scope update output
#[derive(Debug, Clone, Serialize)]
pub struct ScopeUpdate {
    pub project_id: String,
    pub version: ScopeVersion,
    pub assessment: ScopeAssessment,
    pub agents: Vec<ProjectAgent>,
    pub tools: ToolRecommendations,
}

/// Routing engine
pub struct Engine {
    store: Arc<Store>,
    clock: SharedClock,
    router: TaskRouter,
    cache: CacheTier,
    embeddings: EmbeddingService,
    registry: Arc<AgentRegistry>,
    selector: AgentSelector,
    recorder: ExecutionRecorder,
    scope: ScopeDetector,
    tools: ToolRecommender,
    backends: BackendRegistry,
    budget: TokenBudget,
    counter: TokenCounter,
}

impl Engine {
    /// Open the store, pick the embedding provider and backends, seed defaults
    pub async fn build(config: &Config) -> anyhow::Result<Self> {
        let store = Arc::new(Store::open(&config.db_path)?);
        let provider = choose_provider(config).await?;

        let mut backends = BackendRegistry::new();
        backends.register(
            Route::LocalModel,
            Arc::new(OllamaBackend::new(
                &config.ollama_url,
                &config.ollama_model,
                config.backend_timeout,
            )?),
        );
        let claude = ClaudeBackend::new(
            config.anthropic_api_key.clone(),
            &config.claude_model,
            config.backend_timeout,
        )?;
        if !claude.is_available() {
            warn!("ANTHROPIC_API_KEY not set, cloud reasoning tasks will fail");
        }
        backends.register(Route::CloudReasoning, Arc::new(claude));
        backends.register(
            Route::StructuredData,
            Arc::new(HttpQueryBackend::new(
                config.query_endpoint.clone(),
                config.backend_timeout,
            )?),
        );

        let engine = Self::assemble(config, store, provider, backends, system_clock())?;
        engine.reembed_stale().await?;
        if config.seed_defaults {
            engine.seed_defaults().await?;
        }
        Ok(engine)
    }

    /// Assemble from explicit parts
    pub fn assemble(
        config: &Config,
        store: Arc<Store>,
        provider: Arc<dyn EmbeddingProvider>,
        backends: BackendRegistry,
        clock: SharedClock,
    ) -> Result<Self> {
        let cache = CacheTier::new(&config.cache, clock.clone());
        let embeddings = EmbeddingService::new(
            provider,
            cache.embeddings.clone(),
            config.embedding_retry_backoff,
        );
        let registry = Arc::new(AgentRegistry::load(store.clone())?);

        let selector = AgentSelector::new(
            registry.clone(),
            embeddings.clone(),
            cache.selections.clone(),
            config.metric,
            config.weights,
        );
        let recorder = ExecutionRecorder::new(
            store.clone(),
            registry.clone(),
            CheckpointPolicy::new(config.checkpoint_interval),
            clock.clone(),
        );
        let scope = ScopeDetector::new(
            store.clone(),
            embeddings.clone(),
            config.scope,
            clock.clone(),
        );
        let tools = ToolRecommender::new(
            store.clone(),
            embeddings.clone(),
            config.tools.clone(),
            config.metric,
            clock.clone(),
        );
        let budget = TokenBudget::new(config.budget.clone(), clock.clone());

        info!(
            "Engine ready: {} agents, embeddings via {} ({} dims), backends {:?}",
            registry.len(),
            embeddings.provider_name(),
            embeddings.dimension(),
            backends.routes()
        );

        Ok(Self {
            store,
            clock,
            router: TaskRouter::new(),
            cache,
            embeddings,
            registry,
            selector,
            recorder,
            scope,
            tools,
            backends,
            budget,
            counter: TokenCounter::default(),
        })
    }

    /// Register the default catalog when nothing is registered yet
    pub async fn seed_defaults(&self) -> Result<()> {
        if self.registry.is_empty() {
            let agents = seed::default_agents();
            let embeddings = try_join_all(
                agents
                    .iter()
                    .map(|a| async move { self.embeddings.embed_uncached(&a.capability_text()).await }),
            )
            .await?;
            let now = self.clock.now();
            for (agent, embedding) in agents.iter().zip(embeddings) {
                self.registry.upsert(agent, &embedding, now)?;
            }
            info!("Seeded {} default agents", agents.len());
        }

        if self.tools.tools()?.is_empty() {
            let tools = seed::default_tools();
            for tool in &tools {
                self.tools.register(tool).await?;
            }
            info!("Seeded {} default tools", tools.len());
        }
        Ok(())
    }

    /// Re-embed stored agents and tools whose vectors came from another provider
    pub async fn reembed_stale(&self) -> Result<()> {
        let dimension = self.embeddings.dimension();
        let now = self.clock.now();

        for profile in self.registry.profiles() {
            if profile.embedding.len() == dimension {
                continue;
            }
            let agent = registration_of(&profile);
            let embedding = self.embeddings.embed_uncached(&agent.capability_text()).await?;
            self.registry.upsert(&agent, &embedding, now)?;
            debug!("Re-embedded agent {}", profile.name);
        }

        for tool in self.tools.tools()? {
            if tool.embedding.len() == dimension {
                continue;
            }
            self.tools.register(&NewTool {
                name: tool.name.clone(),
                tool_type: tool.tool_type.clone(),
                description: tool.description.clone(),
                reliability: tool.reliability,
                install_command: tool.install_command.clone(),
            })
            .await?;
            debug!("Re-embedded tool {}", tool.name);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Routing and execution
    // ------------------------------------------------------------------

    /// Classify a task without executing it
    pub fn route_query(&self, task: &str) -> Result<Classification> {
        validate_task(task)?;
        Ok(self.router.explain(task))
    }

    /// Best agent for a task without executing it
    pub async fn select_agent(&self, task: &str, agent_type: Option<&str>) -> Result<AgentSummary> {
        validate_task(task)?;
        Ok(self.selector.select(task, agent_type).await?.agent)
    }

    /// Classify, select, dispatch and learn from one task
    pub async fn execute_task(&self, request: &ExecuteRequest) -> Result<ExecuteResult> {
        let started = Instant::now();
        let task = request.task.as_str();
        let project_id = request.project_id.as_str();
        let agent_type = request.agent_type.as_deref().filter(|t| !t.trim().is_empty());

        validate_task(task)?;
        validate_project_id(project_id)?;
        self.budget.check(self.counter.count(task))?;

        let request_id = Uuid::new_v4().to_string();
        let route = self.router.classify(task);
        let cache_key = ResponseCache::compute_key(
            task,
            &[
                route.as_str(),
                agent_type.unwrap_or(""),
                if request.use_tools { "tools" } else { "" },
            ],
        );

        if let Some(hit) = self.cache.responses.get(&cache_key).await {
            let elapsed = started.elapsed().as_millis() as u64;
            self.log_route(task, route, hit.response.agent_id, elapsed, true);
            debug!(request_id = %request_id, "Served from response cache ({} hits)", hit.hit_count);
            return Ok(ExecuteResult {
                request_id,
                route,
                agent: hit
                    .response
                    .agent_id
                    .and_then(|id| self.registry.get(id))
                    .map(|p| p.summary()),
                result: hit.response.content,
                metrics: ExecuteMetrics {
                    tokens_used: 0,
                    time_ms: elapsed,
                    cost_usd: 0.0,
                },
                cached: true,
                checkpoint_version: None,
            });
        }

        let agent = match self.selector.select(task, agent_type).await {
            Ok(selection) => Some(selection.profile),
            Err(RouterError::NotFound(_)) if agent_type.is_none() => {
                warn!("No agents registered, dispatching without an agent");
                None
            }
            Err(e) => return Err(e),
        };

        let backend = self.backends.get(route)?;
        let null_config = serde_json::Value::Null;
        let backend_request = BackendRequest {
            task,
            system_prompt: agent
                .as_ref()
                .map(|a| a.system_prompt.as_str())
                .filter(|p| !p.is_empty())
                .unwrap_or(DEFAULT_SYSTEM_PROMPT),
            model_config: agent.as_ref().map(|a| &a.model_config).unwrap_or(&null_config),
            use_tools: request.use_tools,
        };

        info!(
            request_id = %request_id,
            route = %route,
            agent = agent.as_ref().map(|a| a.name.as_str()).unwrap_or("none"),
            "Dispatching task to {}",
            backend.name()
        );
        let dispatched = backend.execute(&backend_request).await;
        let elapsed = started.elapsed().as_millis() as u64;
        let agent_id = agent.as_ref().map(|a| a.id);

        let response = match dispatched {
            Ok(response) => response,
            Err(e) => {
                warn!(request_id = %request_id, "Backend {} failed: {}", backend.name(), e);
                if let Some(agent_id) = agent_id {
                    if let Err(record_err) = self.recorder.record(
                        agent_id,
                        project_id,
                        task,
                        Some(route),
                        ExecutionOutcome::failure(elapsed),
                        0,
                    ) {
                        warn!("Failed to record failed execution: {}", record_err);
                    }
                }
                self.log_route(task, route, agent_id, elapsed, false);
                return Err(e);
            }
        };

        let tokens_used = response.total_tokens();
        let recorded = match agent_id {
            Some(agent_id) => Some(self.recorder.record(
                agent_id,
                project_id,
                task,
                Some(route),
                ExecutionOutcome::success(elapsed, tokens_used),
                response.input_tokens,
            )?),
            None => None,
        };
        self.budget.record(tokens_used);
        self.log_route(task, route, agent_id, elapsed, false);

        let summary = recorded
            .as_ref()
            .map(|r| r.profile.summary())
            .or_else(|| agent.as_ref().map(AgentProfile::summary));
        self.cache
            .responses
            .set(
                &cache_key,
                CachedResponse {
                    content: response.content.clone(),
                    route,
                    agent_id,
                    agent_name: summary.as_ref().map(|s| s.name.clone()),
                    tokens_used,
                },
            )
            .await;

        Ok(ExecuteResult {
            request_id,
            route,
            agent: summary,
            result: response.content,
            metrics: ExecuteMetrics {
                tokens_used,
                time_ms: elapsed,
                cost_usd: estimate_cost(
                    route,
                    response.input_tokens,
                    response.output_tokens,
                ),
            },
            cached: false,
            checkpoint_version: recorded
                .and_then(|r| r.checkpoint)
                .map(|c| c.version),
        })
    }

    /// Record an outcome observed outside `execute_task`
    pub fn record_execution(
        &self,
        agent_id: i64,
        project_id: &str,
        task: &str,
        outcome: ExecutionOutcome,
    ) -> Result<RecordedExecution> {
        validate_project_id(project_id)?;
        validate_task(task)?;
        self.recorder.record(agent_id, project_id, task, None, outcome, 0)
    }

    fn log_route(&self, task: &str, route: Route, agent_id: Option<i64>, processing_ms: u64, cached: bool) {
        let entry = RouteLogEntry {
            task_hash: hash_text(task),
            route,
            agent_id,
            processing_ms,
            cached,
            at: self.clock.now(),
        };
        if let Err(e) = self.store.log_route(&entry) {
            warn!("Failed to write routing log: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    pub async fn register_agent(&self, agent: &NewAgent) -> Result<AgentProfile> {
        agent.validate()?;
        let embedding = self.embeddings.embed_uncached(&agent.capability_text()).await?;
        let profile = self.registry.upsert(agent, &embedding, self.clock.now())?;
        self.cache.selections.clear();
        info!("Registered agent {} ({})", profile.name, profile.agent_type);
        Ok(profile)
    }

    pub fn list_agents(&self) -> Vec<AgentSummary> {
        self.registry.summaries()
    }

    pub fn get_agent(&self, agent_id: i64) -> Result<AgentDetail> {
        let profile = self
            .registry
            .get(agent_id)
            .ok_or_else(|| RouterError::NotFound(format!("agent {}", agent_id)))?;
        Ok(AgentDetail {
            checkpoints: self.store.checkpoints(agent_id)?,
            recent_executions: self.store.recent_executions(agent_id, RECENT_EXECUTIONS)?,
            profile,
        })
    }

    pub fn agent_metrics(&self) -> Result<Vec<AgentMetrics>> {
        let costs = self.store.agent_costs()?;
        let mut metrics: Vec<AgentMetrics> = self
            .registry
            .profiles()
            .into_iter()
            .map(|p| AgentMetrics {
                total_cost_usd: costs.get(&p.id).copied().unwrap_or(0.0),
                id: p.id,
                name: p.name,
                success_rate: p.success_rate,
                total_tasks: p.total_tasks,
                avg_execution_ms: p.avg_execution_ms,
            })
            .collect();
        metrics.sort_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then(b.total_tasks.cmp(&a.total_tasks))
        });
        Ok(metrics)
    }

    pub fn learning_summary(&self, agent_id: i64) -> Result<LearningSummary> {
        let profile = self
            .registry
            .get(agent_id)
            .ok_or_else(|| RouterError::NotFound(format!("agent {}", agent_id)))?;
        let checkpoints = self.store.checkpoints(agent_id)?;
        Ok(learning_summary(&profile, &checkpoints))
    }

    // ------------------------------------------------------------------
    // Projects, scope and tools
    // ------------------------------------------------------------------

    pub fn get_project_tools(&self, project_id: &str) -> Result<Vec<ProjectTool>> {
        self.tools.project_tools(project_id)
    }

    pub fn get_project_agents(&self, project_id: &str) -> Result<Vec<ProjectAgent>> {
        validate_project_id(project_id)?;
        self.store.project_agents(project_id)
    }

    /// Grade a scope change without storing it
    pub async fn check_scope_change(
        &self,
        project_id: &str,
        description: &str,
        requirements: &[String],
    ) -> Result<ScopeAssessment> {
        self.scope.evaluate(project_id, description, requirements).await
    }

    /// Append a scope version, then refresh the project's tools and agents
    ///
    /// Tools are attached only when the change requires a review.
    pub async fn update_project_scope(
        &self,
        project_id: &str,
        description: &str,
        requirements: &[String],
    ) -> Result<ScopeUpdate> {
        validate_scope(project_id, description, requirements)?;

        // No version is written until every embedding has succeeded
        let tools = self.tools.recommend(description, requirements).await?;
        let agent_ids = self.choose_agents(description, requirements).await?;

        let (assessment, mut version) = self.scope.update(project_id, description, requirements).await?;
        if assessment.requires_tool_review {
            self.tools.attach(project_id, &tools)?;
            if self.scope.complete_review(project_id, version.version)? {
                version.tool_review_completed = true;
            }
        }

        let now = self.clock.now();
        for agent_id in agent_ids {
            self.store.assign_agent(project_id, agent_id, now)?;
        }

        Ok(ScopeUpdate {
            project_id: project_id.to_string(),
            agents: self.store.project_agents(project_id)?,
            version,
            assessment,
            tools,
        })
    }

    pub fn scope_history(&self, project_id: &str) -> Result<Vec<ScopeVersion>> {
        self.scope.history(project_id)
    }

    /// Best agent per requirement category plus the best overall match
    async fn choose_agents(&self, description: &str, requirements: &[String]) -> Result<Vec<i64>> {
        let mut chosen = Vec::new();
        for category in RequirementCategory::detect(requirements) {
            let Some(agent_type) = category.agent_type() else {
                continue;
            };
            let best = self
                .registry
                .find_by_type(agent_type)
                .into_iter()
                .max_by(|a, b| {
                    a.success_rate
                        .total_cmp(&b.success_rate)
                        .then(a.total_tasks.cmp(&b.total_tasks))
                });
            if let Some(agent) = best {
                chosen.push(agent.id);
            }
        }

        match self.selector.select(description, None).await {
            Ok(selection) => chosen.push(selection.agent.id),
            Err(RouterError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        Ok(chosen)
    }

    pub async fn register_tool(&self, tool: &NewTool) -> Result<ToolProfile> {
        self.tools.register(tool).await
    }

    pub fn list_tools(&self) -> Result<Vec<ToolProfile>> {
        self.tools.tools()
    }

    pub async fn recommend_tools(&self, description: &str, requirements: &[String]) -> Result<ToolRecommendations> {
        self.tools.recommend(description, requirements).await
    }

    pub fn add_project_tool(&self, project_id: &str, tool_name: &str, reason: &str) -> Result<()> {
        self.tools.add_project_tool(project_id, tool_name, reason)
    }

    pub fn remove_project_tool(&self, project_id: &str, tool_name: &str) -> Result<bool> {
        self.tools.remove_project_tool(project_id, tool_name)
    }

    pub fn record_tool_usage(&self, project_id: &str, tool_name: &str, success: bool) -> Result<()> {
        self.tools.record_usage(project_id, tool_name, success)
    }

    // ------------------------------------------------------------------
    // Metrics
    // ------------------------------------------------------------------

    /// Per-route counts over the last `hours`
    pub fn routing_metrics(&self, hours: u32) -> Result<Vec<RouteMetrics>> {
        if hours == 0 || hours > 24 * 366 {
            return Err(RouterError::validation("hours must be between 1 and 8784"));
        }
        let since = self.clock.now() - ChronoDuration::hours(i64::from(hours));
        self.store.routing_metrics(since)
    }

    pub fn cache_stats(&self) -> Vec<CacheStats> {
        self.cache.stats()
    }

    pub fn budget_status(&self) -> BudgetStatus {
        self.budget.status()
    }

    /// Classifications per route since start
    pub fn route_counts(&self) -> Vec<(Route, u64)> {
        self.router.counts()
    }

    /// Current time on the engine's clock
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub fn embedding_provider(&self) -> &str {
        self.embeddings.provider_name()
    }

    pub fn backend_routes(&self) -> Vec<(Route, String)> {
        self.backends.routes()
    }

    /// Flush deferred cache maintenance (entry counts in `cache_stats`)
    pub async fn sync_caches(&self) {
        self.cache.run_pending_tasks().await;
    }
}

fn validate_task(task: &str) -> Result<()> {
    if task.trim().is_empty() {
        return Err(RouterError::validation("task must not be empty"));
    }
    if task.chars().count() > MAX_TASK_CHARS {
        return Err(RouterError::validation(format!(
            "task exceeds {} characters",
            MAX_TASK_CHARS
        )));
    }
    Ok(())
}

/// Registration input that reproduces a stored agent
fn registration_of(profile: &AgentProfile) -> NewAgent {
    NewAgent {
        name: profile.name.clone(),
        agent_type: profile.agent_type.clone(),
        purpose: profile.purpose.clone(),
        system_prompt: profile.system_prompt.clone(),
        tools_enabled: profile.tools_enabled.clone(),
        model_config: profile.model_config.clone(),
        routing_priority: profile.routing_priority,
        initial_success_rate: None,
    }
}

async fn choose_provider(config: &Config) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    let hash = || -> Arc<dyn EmbeddingProvider> { Arc::new(HashEmbedder::new(config.hash_dimension)) };
    let ollama = || OllamaEmbedder::new(EmbeddingConfig::new(&config.ollama_url, &config.embedding_model));

    let provider: Arc<dyn EmbeddingProvider> = match config.embeddings {
        EmbeddingChoice::Hash => hash(),
        EmbeddingChoice::Ollama => Arc::new(ollama()?),
        EmbeddingChoice::Auto => {
            let embedder = ollama()?;
            if embedder.check_availability().await {
                Arc::new(embedder)
            } else {
                warn!(
                    "Ollama not reachable at {}, using local hashing embeddings",
                    config.ollama_url
                );
                hash()
            }
        }
    };
    info!("Embedding provider: {}", provider.name());
    Ok(provider)
}
