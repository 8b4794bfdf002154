//! Agent Registry and Selector
//!
//! The registry keeps every agent profile in memory behind its own lock and
//! writes through to the store. The selector ranks candidates by blended
//! capability similarity and track record:
//!
//! 1. selection cache hit on (task hash, type filter) returns immediately
//! 2. the task is embedded (embedding cache, then provider)
//! 3. candidates are filtered by type, then scored
//! 4. the best candidate is cached and returned
//!
//! A type filter is never relaxed: no candidate of that type is `NotFound`.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::SelectionCache;
use crate::embeddings::EmbeddingService;
use crate::error::{Result, RouterError};
use crate::scoring::{compare_ranked, DistanceMetric, Ranked, ScoringWeights};
use crate::store::Store;
use crate::types::{AgentProfile, AgentSummary, LearningCheckpoint, NewAgent};

/// Mutable per-agent state, guarded by the agent's own lock
#[derive(Debug, Clone)]
pub struct AgentState {
    pub profile: AgentProfile,
    pub last_checkpoint: Option<LearningCheckpoint>,
}

pub type AgentHandle = Arc<Mutex<AgentState>>;

/// In-memory agent profiles with write-through persistence
pub struct AgentRegistry {
    store: Arc<Store>,
    agents: RwLock<HashMap<i64, AgentHandle>>,
}

impl AgentRegistry {
    /// Load every stored agent with its latest checkpoint
    pub fn load(store: Arc<Store>) -> Result<Self> {
        let mut agents = HashMap::new();
        for profile in store.load_agents()? {
            let last_checkpoint = store.latest_checkpoint(profile.id)?;
            agents.insert(
                profile.id,
                Arc::new(Mutex::new(AgentState {
                    profile,
                    last_checkpoint,
                })),
            );
        }
        info!("Loaded {} agents", agents.len());

        Ok(Self {
            store,
            agents: RwLock::new(agents),
        })
    }

    /// Insert or update an agent; an update keeps statistics and checkpoints
    ///
    /// Statistics in memory are owned by the recorder and may be newer than
    /// the stored row, so an update only replaces the agent's metadata.
    pub fn upsert(&self, agent: &NewAgent, embedding: &[f32], at: DateTime<Utc>) -> Result<AgentProfile> {
        agent.validate()?;
        let stored = self.store.upsert_agent(agent, embedding, at)?;

        let handle = self
            .agents
            .write()
            .entry(stored.id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(AgentState {
                    profile: stored.clone(),
                    last_checkpoint: None,
                }))
            })
            .clone();

        let mut state = handle.lock();
        let profile = &mut state.profile;
        profile.name = stored.name;
        profile.agent_type = stored.agent_type;
        profile.purpose = stored.purpose;
        profile.system_prompt = stored.system_prompt;
        profile.tools_enabled = stored.tools_enabled;
        profile.model_config = stored.model_config;
        profile.embedding = stored.embedding;
        profile.routing_priority = stored.routing_priority;
        Ok(profile.clone())
    }

    pub fn handle(&self, id: i64) -> Option<AgentHandle> {
        self.agents.read().get(&id).cloned()
    }

    pub fn get(&self, id: i64) -> Option<AgentProfile> {
        self.handle(id).map(|h| h.lock().profile.clone())
    }

    /// Copies of every profile, ordered by id
    pub fn profiles(&self) -> Vec<AgentProfile> {
        let handles: Vec<AgentHandle> = self.agents.read().values().cloned().collect();
        let mut profiles: Vec<AgentProfile> =
            handles.iter().map(|h| h.lock().profile.clone()).collect();
        profiles.sort_by_key(|p| p.id);
        profiles
    }

    pub fn summaries(&self) -> Vec<AgentSummary> {
        self.profiles().iter().map(AgentProfile::summary).collect()
    }

    pub fn find_by_type(&self, agent_type: &str) -> Vec<AgentProfile> {
        self.profiles()
            .into_iter()
            .filter(|p| p.agent_type == agent_type)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a selection was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    Cache,
    Similarity,
    /// Embedding failed; ranked on track record alone
    PerformanceOnly,
}

/// Selector result
#[derive(Debug, Clone, Serialize)]
pub struct Selection {
    pub agent: AgentSummary,
    #[serde(skip)]
    pub profile: AgentProfile,
    pub score: Option<f64>,
    pub distance: Option<f64>,
    pub source: SelectionSource,
}

/// Blended similarity + performance ranking over the registry
pub struct AgentSelector {
    registry: Arc<AgentRegistry>,
    embeddings: EmbeddingService,
    selections: SelectionCache,
    metric: DistanceMetric,
    weights: ScoringWeights,
}

impl AgentSelector {
    pub fn new(
        registry: Arc<AgentRegistry>,
        embeddings: EmbeddingService,
        selections: SelectionCache,
        metric: DistanceMetric,
        weights: ScoringWeights,
    ) -> Self {
        Self {
            registry,
            embeddings,
            selections,
            metric,
            weights,
        }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Best agent for a task, honoring the type filter
    pub async fn select(&self, task: &str, type_filter: Option<&str>) -> Result<Selection> {
        if let Some(agent_id) = self.selections.get(task, type_filter).await {
            if let Some(profile) = self.registry.get(agent_id) {
                debug!("Selection cache hit: agent {}", profile.name);
                return Ok(Selection {
                    agent: profile.summary(),
                    profile,
                    score: None,
                    distance: None,
                    source: SelectionSource::Cache,
                });
            }
        }

        let candidates = self.candidates(type_filter)?;

        let task_embedding = match self.embeddings.embed(task).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!("Task embedding failed, ranking on performance only: {}", e);
                let best = self
                    .rank_by_performance(candidates)
                    .ok_or_else(|| not_found(type_filter))?;
                return Ok(Selection {
                    agent: best.item.summary(),
                    profile: best.item,
                    score: Some(best.score),
                    distance: None,
                    source: SelectionSource::PerformanceOnly,
                });
            }
        };

        let best = self
            .rank(&task_embedding, candidates)
            .into_iter()
            .next()
            .ok_or_else(|| not_found(type_filter))?;

        self.selections.insert(task, type_filter, best.item.id).await;
        info!(
            "Selected agent {} (score {:.3}, distance {:.3})",
            best.item.name, best.score, best.distance
        );

        Ok(Selection {
            agent: best.item.summary(),
            profile: best.item,
            score: Some(best.score),
            distance: Some(best.distance),
            source: SelectionSource::Similarity,
        })
    }

    /// Full ranking for a task, best first (uncached)
    pub async fn rank_for_task(
        &self,
        task: &str,
        type_filter: Option<&str>,
    ) -> Result<Vec<Ranked<AgentSummary>>> {
        let candidates = self.candidates(type_filter)?;
        let task_embedding = self.embeddings.embed(task).await?;
        Ok(self
            .rank(&task_embedding, candidates)
            .into_iter()
            .map(|r| Ranked {
                item: r.item.summary(),
                score: r.score,
                distance: r.distance,
                success_rate: r.success_rate,
                total_tasks: r.total_tasks,
            })
            .collect())
    }

    fn candidates(&self, type_filter: Option<&str>) -> Result<Vec<AgentProfile>> {
        let candidates: Vec<AgentProfile> = match type_filter {
            Some(agent_type) => self.registry.find_by_type(agent_type),
            None => self.registry.profiles(),
        };
        if candidates.is_empty() {
            return Err(not_found(type_filter));
        }
        Ok(candidates)
    }

    fn rank(&self, task_embedding: &[f32], candidates: Vec<AgentProfile>) -> Vec<Ranked<AgentProfile>> {
        let mut ranked: Vec<Ranked<AgentProfile>> = candidates
            .into_iter()
            .map(|profile| {
                let distance = self.metric.normalized_distance(task_embedding, &profile.embedding);
                let score = self
                    .weights
                    .blend(distance, profile.success_rate, profile.routing_priority);
                Ranked {
                    score,
                    distance,
                    success_rate: profile.success_rate,
                    total_tasks: profile.total_tasks,
                    item: profile,
                }
            })
            .collect();
        ranked.sort_by(compare_ranked);
        ranked
    }

    fn rank_by_performance(&self, candidates: Vec<AgentProfile>) -> Option<Ranked<AgentProfile>> {
        let mut ranked: Vec<Ranked<AgentProfile>> = candidates
            .into_iter()
            .map(|profile| Ranked {
                score: self
                    .weights
                    .blend(1.0, profile.success_rate, profile.routing_priority),
                distance: 1.0,
                success_rate: profile.success_rate,
                total_tasks: profile.total_tasks,
                item: profile,
            })
            .collect();
        ranked.sort_by(compare_ranked);
        ranked.into_iter().next()
    }
}

fn not_found(type_filter: Option<&str>) -> RouterError {
    match type_filter {
        Some(agent_type) => RouterError::NotFound(format!("no agent of type '{}'", agent_type)),
        None => RouterError::NotFound("no agents registered".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EmbeddingCache;
    use crate::clock::ManualClock;
    use crate::embeddings::{EmbeddingProvider, HashEmbedder};
    use async_trait::async_trait;
    use std::time::Duration;

    struct DownEmbedder;

    #[async_trait]
    impl EmbeddingProvider for DownEmbedder {
        fn name(&self) -> &str {
            "down"
        }

        fn dimension(&self) -> usize {
            64
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(RouterError::backend("down", "connection refused"))
        }
    }

    fn agent(name: &str, agent_type: &str, purpose: &str, success: f64) -> NewAgent {
        NewAgent {
            name: name.into(),
            agent_type: agent_type.into(),
            purpose: purpose.into(),
            system_prompt: String::new(),
            tools_enabled: vec![],
            model_config: serde_json::Value::Null,
            routing_priority: 0.5,
            initial_success_rate: Some(success),
        }
    }

    fn setup(provider: Arc<dyn EmbeddingProvider>) -> (Arc<AgentRegistry>, AgentSelector) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(AgentRegistry::load(store).unwrap());
        let hasher = HashEmbedder::new(256);
        let now = Utc::now();

        for (name, agent_type, purpose, success) in [
            ("Reviewer", "code_review", "review code for bugs and style problems", 0.9),
            ("Tester", "testing", "write unit tests and integration tests", 0.8),
            ("DBA", "database", "write sql queries and database migrations", 0.7),
        ] {
            let new_agent = agent(name, agent_type, purpose, success);
            registry
                .upsert(&new_agent, &hasher.embed_text(&new_agent.capability_text()), now)
                .unwrap();
        }

        let selector = AgentSelector::new(
            registry.clone(),
            EmbeddingService::new(provider, EmbeddingCache::new(100), Duration::from_millis(1)),
            SelectionCache::new(100, Duration::from_secs(60), Arc::new(ManualClock::default())),
            DistanceMetric::Cosine,
            ScoringWeights::default(),
        );
        (registry, selector)
    }

    #[tokio::test]
    async fn test_select_by_similarity() {
        let (_, selector) = setup(Arc::new(HashEmbedder::new(256)));
        let selection = selector
            .select("write unit tests for the parser", None)
            .await
            .unwrap();
        assert_eq!(selection.agent.name, "Tester");
        assert_eq!(selection.source, SelectionSource::Similarity);
    }

    #[tokio::test]
    async fn test_filter_is_honored() {
        let (_, selector) = setup(Arc::new(HashEmbedder::new(256)));
        let selection = selector
            .select("write unit tests for the parser", Some("database"))
            .await
            .unwrap();
        assert_eq!(selection.agent.agent_type, "database");

        let err = selector
            .select("write unit tests", Some("architecture"))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_second_select_is_cached() {
        let (_, selector) = setup(Arc::new(HashEmbedder::new(256)));
        let first = selector.select("review code for bugs", None).await.unwrap();
        let second = selector.select("review code for bugs", None).await.unwrap();
        assert_eq!(first.agent.id, second.agent.id);
        assert_eq!(second.source, SelectionSource::Cache);
    }

    #[tokio::test]
    async fn test_embedding_failure_falls_back_to_performance() {
        let (_, selector) = setup(Arc::new(DownEmbedder));
        let selection = selector.select("anything", None).await.unwrap();
        assert_eq!(selection.agent.name, "Reviewer");
        assert_eq!(selection.source, SelectionSource::PerformanceOnly);

        // fallback honors the filter and is not cached
        let selection = selector.select("anything", Some("testing")).await.unwrap();
        assert_eq!(selection.agent.name, "Tester");
        let again = selector.select("anything", Some("testing")).await.unwrap();
        assert_eq!(again.source, SelectionSource::PerformanceOnly);
    }

    #[tokio::test]
    async fn test_rank_for_task_orders_all_candidates() {
        let (registry, selector) = setup(Arc::new(HashEmbedder::new(256)));
        let ranked = selector
            .rank_for_task("write sql queries for reporting", None)
            .await
            .unwrap();
        assert_eq!(ranked.len(), registry.len());
        assert_eq!(ranked[0].item.name, "DBA");
        assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_upsert_keeps_single_entry() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = AgentRegistry::load(store.clone()).unwrap();
        let now = Utc::now();
        let a = registry
            .upsert(&agent("A", "testing", "tests", 0.5), &[1.0, 0.0], now)
            .unwrap();
        let b = registry
            .upsert(&agent("A", "testing", "more tests", 0.5), &[0.0, 1.0], now)
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(a.id).unwrap().purpose, "more tests");

        // a fresh registry sees the persisted profile
        let reloaded = AgentRegistry::load(store).unwrap();
        assert_eq!(reloaded.get(a.id).unwrap().embedding, vec![0.0, 1.0]);
    }

    #[test]
    fn test_upsert_keeps_newer_statistics_in_memory() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = AgentRegistry::load(store).unwrap();
        let now = Utc::now();
        let a = registry
            .upsert(&agent("A", "testing", "tests", 0.5), &[1.0, 0.0], now)
            .unwrap();

        // an execution recorded after the stored row was read
        {
            let handle = registry.handle(a.id).unwrap();
            let mut state = handle.lock();
            state.profile.total_tasks = 7;
            state.profile.success_rate = 0.9;
            state.profile.last_used = Some(now);
        }

        let updated = registry
            .upsert(&agent("A", "testing", "more tests", 0.1), &[0.0, 1.0], now)
            .unwrap();
        assert_eq!(updated.purpose, "more tests");
        assert_eq!(updated.total_tasks, 7);
        assert!((updated.success_rate - 0.9).abs() < 1e-9);

        let current = registry.get(a.id).unwrap();
        assert_eq!(current.total_tasks, 7);
        assert_eq!(current.last_used, Some(now));
        assert_eq!(current.embedding, vec![0.0, 1.0]);
    }
}
