//! Tool Recommender and Project Tool Stack
//!
//! Ranks registered tools (MCP servers) against a project scope with the same
//! blended similarity pattern the agent selector uses: capability similarity,
//! observed success, and reliability. Only tools above the reliability floor
//! are considered. Results are split into essential and recommended tiers.
//!
//! Requirement categories pull in matching tool types as essential
//! (a database requirement brings the database tool), and a small baseline
//! (filesystem, version control, memory) is always essential.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::embeddings::EmbeddingService;
use crate::error::{Result, RouterError};
use crate::scope::validate_project_id;
use crate::scoring::{compare_ranked, DistanceMetric, Ranked, ScoringWeights};
use crate::store::Store;
use crate::types::{NewTool, ProjectTool, RequirementCategory, ToolProfile};

/// Thresholds and weights for tool ranking
#[derive(Debug, Clone)]
pub struct ToolPolicy {
    /// Tools at or below this reliability are never recommended
    pub reliability_floor: f64,
    pub essential_threshold: f64,
    pub recommended_threshold: f64,
    pub max_recommended: usize,
    /// `priority` weighs reliability
    pub weights: ScoringWeights,
    /// Always essential when registered and reliable
    pub baseline: Vec<String>,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            reliability_floor: 0.8,
            essential_threshold: 0.8,
            recommended_threshold: 0.7,
            max_recommended: 5,
            weights: ScoringWeights {
                similarity: 0.6,
                success: 0.2,
                priority: 0.2,
            },
            baseline: vec![
                "filesystem".to_string(),
                "github".to_string(),
                "memory".to_string(),
            ],
        }
    }
}

/// Tool type implied by a requirement category
fn category_tool_type(category: RequirementCategory) -> Option<&'static str> {
    match category {
        RequirementCategory::Database => Some("database"),
        RequirementCategory::Containerization => Some("container"),
        RequirementCategory::Frontend | RequirementCategory::Testing => Some("browser"),
        RequirementCategory::Collaboration => Some("communication"),
        RequirementCategory::Research => Some("search"),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRecommendation {
    pub name: String,
    pub tool_type: String,
    pub description: String,
    pub score: f64,
    pub reason: String,
    pub install_command: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolRecommendations {
    pub essential: Vec<ToolRecommendation>,
    pub recommended: Vec<ToolRecommendation>,
}

impl ToolRecommendations {
    pub fn len(&self) -> usize {
        self.essential.len() + self.recommended.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> Vec<&str> {
        self.essential
            .iter()
            .chain(self.recommended.iter())
            .map(|t| t.name.as_str())
            .collect()
    }
}

/// Rank tools against a scope embedding and partition them
///
/// Unused tools are scored on reliability in place of their success rate.
pub fn rank_tools(
    tools: Vec<ToolProfile>,
    scope_embedding: &[f32],
    categories: &BTreeSet<RequirementCategory>,
    policy: &ToolPolicy,
    metric: DistanceMetric,
) -> ToolRecommendations {
    let required_types: BTreeSet<&str> = categories
        .iter()
        .filter_map(|c| category_tool_type(*c))
        .collect();

    let mut ranked: Vec<Ranked<ToolProfile>> = tools
        .into_iter()
        .filter(|t| t.reliability > policy.reliability_floor)
        .map(|tool| {
            let distance = metric.normalized_distance(scope_embedding, &tool.embedding);
            let success = if tool.total_uses > 0 {
                tool.success_rate
            } else {
                tool.reliability
            };
            Ranked {
                score: policy.weights.blend(distance, success, tool.reliability),
                distance,
                success_rate: success,
                total_tasks: tool.total_uses,
                item: tool,
            }
        })
        .collect();
    ranked.sort_by(compare_ranked);

    let mut result = ToolRecommendations::default();
    for r in ranked {
        let tool = r.item;
        let reason = if policy.baseline.iter().any(|b| b == &tool.name) {
            Some("Baseline tool for every project".to_string())
        } else if required_types.contains(tool.tool_type.as_str()) {
            Some(format!("Required by {} requirements", tool.tool_type))
        } else if r.score >= policy.essential_threshold {
            Some(format!("Strong match for project scope ({:.2})", r.score))
        } else {
            None
        };

        let recommendation = |reason: String| ToolRecommendation {
            name: tool.name.clone(),
            tool_type: tool.tool_type.clone(),
            description: tool.description.clone(),
            score: r.score,
            reason,
            install_command: tool.install_command.clone(),
        };

        match reason {
            Some(reason) => result.essential.push(recommendation(reason)),
            None if r.score >= policy.recommended_threshold
                && result.recommended.len() < policy.max_recommended =>
            {
                result
                    .recommended
                    .push(recommendation(format!("Related to project scope ({:.2})", r.score)))
            }
            None => {}
        }
    }
    result
}

/// Tool catalog, recommender and per-project tool stack
pub struct ToolRecommender {
    store: Arc<Store>,
    embeddings: EmbeddingService,
    policy: ToolPolicy,
    metric: DistanceMetric,
    clock: SharedClock,
}

impl ToolRecommender {
    pub fn new(
        store: Arc<Store>,
        embeddings: EmbeddingService,
        policy: ToolPolicy,
        metric: DistanceMetric,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            embeddings,
            policy,
            metric,
            clock,
        }
    }

    /// Register or update a tool, embedding its description
    pub async fn register(&self, tool: &NewTool) -> Result<ToolProfile> {
        tool.validate()?;
        let embedding = self
            .embeddings
            .embed_uncached(&format!("{} {}", tool.name, tool.description))
            .await?;
        let profile = self.store.upsert_tool(tool, &embedding, self.clock.now())?;
        debug!("Registered tool {}", profile.name);
        Ok(profile)
    }

    pub fn tools(&self) -> Result<Vec<ToolProfile>> {
        self.store.load_tools()
    }

    /// Ranked, partitioned tools for a scope
    pub async fn recommend(&self, description: &str, requirements: &[String]) -> Result<ToolRecommendations> {
        if description.trim().is_empty() && requirements.is_empty() {
            return Err(RouterError::validation(
                "a scope description or requirements are needed",
            ));
        }
        let query = format!("{} {}", description, requirements.join(" "));
        let embedding = self.embeddings.embed(query.trim()).await?;
        let categories = RequirementCategory::detect(requirements);

        let recommendations = rank_tools(
            self.store.load_tools()?,
            &embedding,
            &categories,
            &self.policy,
            self.metric,
        );
        info!(
            "Recommended {} essential, {} optional tools",
            recommendations.essential.len(),
            recommendations.recommended.len()
        );
        Ok(recommendations)
    }

    /// Attach every recommended tool to the project
    pub fn attach(&self, project_id: &str, recommendations: &ToolRecommendations) -> Result<()> {
        validate_project_id(project_id)?;
        let now = self.clock.now();
        for rec in recommendations.essential.iter().chain(recommendations.recommended.iter()) {
            if let Some(tool) = self.store.tool_by_name(&rec.name)? {
                self.store.add_project_tool(project_id, tool.id, &rec.reason, now)?;
            }
        }
        Ok(())
    }

    fn tool(&self, name: &str) -> Result<ToolProfile> {
        self.store
            .tool_by_name(name)?
            .ok_or_else(|| RouterError::NotFound(format!("tool '{}'", name)))
    }

    pub fn add_project_tool(&self, project_id: &str, tool_name: &str, reason: &str) -> Result<()> {
        validate_project_id(project_id)?;
        let tool = self.tool(tool_name)?;
        self.store.add_project_tool(project_id, tool.id, reason, self.clock.now())
    }

    /// Deactivate a tool for a project; false if it was not active
    pub fn remove_project_tool(&self, project_id: &str, tool_name: &str) -> Result<bool> {
        validate_project_id(project_id)?;
        let tool = self.tool(tool_name)?;
        self.store.deactivate_project_tool(project_id, tool.id)
    }

    pub fn record_usage(&self, project_id: &str, tool_name: &str, success: bool) -> Result<()> {
        validate_project_id(project_id)?;
        let tool = self.tool(tool_name)?;
        if self.store.record_tool_usage(project_id, tool.id, success)? {
            Ok(())
        } else {
            Err(RouterError::NotFound(format!(
                "tool '{}' is not attached to project '{}'",
                tool_name, project_id
            )))
        }
    }

    pub fn project_tools(&self, project_id: &str) -> Result<Vec<ProjectTool>> {
        validate_project_id(project_id)?;
        self.store.project_tools(project_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EmbeddingCache;
    use crate::clock::ManualClock;
    use crate::embeddings::HashEmbedder;
    use chrono::{DateTime, Utc};
    use std::time::Duration;

    fn tool(name: &str, tool_type: &str, embedding: Vec<f32>, reliability: f64) -> ToolProfile {
        ToolProfile {
            id: 0,
            name: name.into(),
            tool_type: tool_type.into(),
            description: format!("{} tool", name),
            embedding,
            reliability,
            total_uses: 0,
            success_rate: 0.0,
            install_command: None,
        }
    }

    #[test]
    fn test_reliability_floor_excludes() {
        let tools = vec![
            tool("flaky", "misc", vec![1.0, 0.0], 0.8),
            tool("solid", "misc", vec![1.0, 0.0], 0.95),
        ];
        let recs = rank_tools(
            tools,
            &[1.0, 0.0],
            &BTreeSet::new(),
            &ToolPolicy::default(),
            DistanceMetric::Cosine,
        );
        assert_eq!(recs.names(), vec!["solid"]);
    }

    #[test]
    fn test_partition_by_score() {
        let tools = vec![
            tool("close", "misc", vec![1.0, 0.0], 0.9),
            tool("sideways", "misc", vec![0.6, 0.8], 0.9),
            tool("opposite", "misc", vec![-1.0, 0.0], 0.9),
        ];
        let recs = rank_tools(
            tools,
            &[1.0, 0.0],
            &BTreeSet::new(),
            &ToolPolicy::default(),
            DistanceMetric::Cosine,
        );
        // close: 0.6 + 0.36 = 0.96; sideways: 0.48 + 0.36 = 0.84; opposite: 0.36
        assert_eq!(recs.essential.len(), 2);
        assert_eq!(recs.essential[0].name, "close");
        assert!(recs.essential[0].score > recs.essential[1].score);
        assert!(recs.recommended.is_empty());
        assert!(!recs.names().contains(&"opposite"));
    }

    #[test]
    fn test_requirements_and_baseline_make_tools_essential() {
        let tools = vec![
            tool("postgresql", "database", vec![0.0, 1.0], 0.9),
            tool("github", "git", vec![0.0, 1.0], 0.95),
            tool("docker", "container", vec![0.0, 1.0], 0.9),
        ];
        let mut categories = BTreeSet::new();
        categories.insert(RequirementCategory::Database);

        let recs = rank_tools(
            tools,
            &[1.0, 0.0],
            &categories,
            &ToolPolicy::default(),
            DistanceMetric::Cosine,
        );
        let essential: Vec<_> = recs.essential.iter().map(|t| t.name.as_str()).collect();
        assert!(essential.contains(&"postgresql"));
        assert!(essential.contains(&"github"));
        assert!(!essential.contains(&"docker"));
    }

    #[test]
    fn test_recommended_is_capped() {
        let mut policy = ToolPolicy::default();
        policy.max_recommended = 2;
        policy.essential_threshold = 2.0;
        policy.baseline.clear();

        let tools = (0..5)
            .map(|i| tool(&format!("t{}", i), "misc", vec![1.0, 0.0], 0.9))
            .collect();
        let recs = rank_tools(tools, &[1.0, 0.0], &BTreeSet::new(), &policy, DistanceMetric::Cosine);
        assert!(recs.essential.is_empty());
        assert_eq!(recs.recommended.len(), 2);
    }

    fn recommender() -> ToolRecommender {
        recommender_at(Arc::new(ManualClock::default()))
    }

    fn recommender_at(clock: SharedClock) -> ToolRecommender {
        ToolRecommender::new(
            Arc::new(Store::open_in_memory().unwrap()),
            EmbeddingService::new(
                Arc::new(HashEmbedder::new(256)),
                EmbeddingCache::new(100),
                Duration::from_millis(1),
            ),
            ToolPolicy::default(),
            DistanceMetric::Cosine,
            clock,
        )
    }

    fn new_tool(name: &str, tool_type: &str, description: &str) -> NewTool {
        NewTool {
            name: name.into(),
            tool_type: tool_type.into(),
            description: description.into(),
            reliability: 0.9,
            install_command: Some(format!("npx -y @mcp/{}", name)),
        }
    }

    #[tokio::test]
    async fn test_recommend_and_attach() {
        let recommender = recommender();
        recommender
            .register(&new_tool("postgresql", "database", "Query PostgreSQL databases"))
            .await
            .unwrap();
        recommender
            .register(&new_tool("slack", "communication", "Send team messages"))
            .await
            .unwrap();

        let recs = recommender
            .recommend("Order service", &["Store orders in Postgres".to_string()])
            .await
            .unwrap();
        assert!(recs.essential.iter().any(|t| t.name == "postgresql"));

        recommender.attach("shop", &recs).unwrap();
        let attached = recommender.project_tools("shop").unwrap();
        assert!(attached.iter().any(|t| t.name == "postgresql"));
    }

    #[tokio::test]
    async fn test_project_tool_stack() {
        let recommender = recommender();
        recommender
            .register(&new_tool("memory", "knowledge_base", "Persistent memory"))
            .await
            .unwrap();

        assert!(matches!(
            recommender.record_usage("shop", "memory", true),
            Err(RouterError::NotFound(_))
        ));
        assert!(matches!(
            recommender.add_project_tool("shop", "nope", "x"),
            Err(RouterError::NotFound(_))
        ));

        recommender.add_project_tool("shop", "memory", "Manual").unwrap();
        recommender.record_usage("shop", "memory", true).unwrap();
        assert_eq!(recommender.project_tools("shop").unwrap()[0].usage_count, 1);
        assert_eq!(recommender.tools().unwrap()[0].total_uses, 1);

        assert!(recommender.remove_project_tool("shop", "memory").unwrap());
        assert!(recommender.project_tools("shop").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_project_tools_use_injected_clock() {
        let start = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = Arc::new(ManualClock::new(start));
        let recommender = recommender_at(clock.clone());
        recommender
            .register(&new_tool("postgresql", "database", "Query PostgreSQL databases"))
            .await
            .unwrap();

        recommender.add_project_tool("shop", "postgresql", "Manual").unwrap();
        clock.advance_secs(3600);
        let recs = recommender
            .recommend("Order service", &["PostgreSQL database".to_string()])
            .await
            .unwrap();
        recommender.attach("shop", &recs).unwrap();
        recommender.add_project_tool("depot", "postgresql", "Manual").unwrap();

        let shop = recommender.project_tools("shop").unwrap();
        assert_eq!(shop[0].added_at, start);
        let depot = recommender.project_tools("depot").unwrap();
        assert_eq!(depot[0].added_at, start + chrono::Duration::seconds(3600));
    }

    #[tokio::test]
    async fn test_empty_scope_rejected() {
        let recommender = recommender();
        assert!(matches!(
            recommender.recommend("  ", &[]).await,
            Err(RouterError::Validation(_))
        ));
    }
}
