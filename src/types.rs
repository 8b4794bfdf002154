//! Domain types shared by the store, selector, recorder and scope detector

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{Result, RouterError};
use crate::patterns::{LearnedPatterns, PatternKind};
use crate::router::{contains_keyword, Route};

/// Specialized agent with capability embedding and rolling statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: i64,
    pub name: String,
    pub agent_type: String,
    pub purpose: String,
    pub system_prompt: String,
    pub tools_enabled: Vec<String>,
    /// Opaque backend configuration, passed through untouched
    pub model_config: serde_json::Value,
    #[serde(skip_serializing)]
    pub embedding: Vec<f32>,
    /// Routing priority in [0, 1]
    pub routing_priority: f64,
    pub total_tasks: u64,
    /// Success rate in [0, 1]
    pub success_rate: f64,
    pub avg_execution_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
    pub learned_patterns: LearnedPatterns,
    pub created_at: DateTime<Utc>,
}

impl AgentProfile {
    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id,
            name: self.name.clone(),
            agent_type: self.agent_type.clone(),
            success_rate: self.success_rate,
            total_tasks: self.total_tasks,
            avg_execution_ms: self.avg_execution_ms,
        }
    }

    /// Current performance, without timestamps
    pub fn snapshot(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            success_rate: self.success_rate,
            avg_execution_ms: self.avg_execution_ms,
            total_tasks: self.total_tasks,
        }
    }
}

/// Listing view of an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: i64,
    pub name: String,
    pub agent_type: String,
    pub success_rate: f64,
    pub total_tasks: u64,
    pub avg_execution_ms: f64,
}

/// Registration input for an agent
#[derive(Debug, Clone, Deserialize)]
pub struct NewAgent {
    pub name: String,
    pub agent_type: String,
    pub purpose: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub tools_enabled: Vec<String>,
    #[serde(default)]
    pub model_config: serde_json::Value,
    #[serde(default = "default_priority")]
    pub routing_priority: f64,
    /// Prior success rate for seeded agents
    #[serde(default)]
    pub initial_success_rate: Option<f64>,
}

fn default_priority() -> f64 {
    0.5
}

impl NewAgent {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RouterError::validation("agent name must not be empty"));
        }
        if self.agent_type.trim().is_empty() {
            return Err(RouterError::validation("agent type must not be empty"));
        }
        if self.purpose.trim().is_empty() {
            return Err(RouterError::validation("agent purpose must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.routing_priority) {
            return Err(RouterError::validation("routing priority must be within [0, 1]"));
        }
        if let Some(rate) = self.initial_success_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(RouterError::validation("success rate must be within [0, 1]"));
            }
        }
        Ok(())
    }

    /// Text embedded as the capability vector
    pub fn capability_text(&self) -> String {
        format!("{} {}", self.purpose, self.system_prompt).trim().to_string()
    }
}

/// Outcome of one dispatched task
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    pub execution_ms: u64,
    pub tokens_used: u64,
    /// Optional user feedback, 1..=5
    pub feedback_score: Option<u8>,
}

impl ExecutionOutcome {
    pub fn success(execution_ms: u64, tokens_used: u64) -> Self {
        Self {
            success: true,
            execution_ms,
            tokens_used,
            feedback_score: None,
        }
    }

    pub fn failure(execution_ms: u64) -> Self {
        Self {
            success: false,
            execution_ms,
            tokens_used: 0,
            feedback_score: None,
        }
    }

    pub fn with_feedback(mut self, score: u8) -> Self {
        self.feedback_score = Some(score);
        self
    }

    pub fn validate(&self) -> Result<()> {
        match self.feedback_score {
            Some(score) if !(1..=5).contains(&score) => Err(RouterError::validation(format!(
                "feedback score must be 1-5, got {}",
                score
            ))),
            _ => Ok(()),
        }
    }
}

/// Immutable execution history entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    pub agent_id: i64,
    pub project_id: String,
    pub task: String,
    pub route: Option<Route>,
    pub outcome: ExecutionOutcome,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

/// Performance at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub success_rate: f64,
    pub avg_execution_ms: f64,
    pub total_tasks: u64,
}

/// Immutable learning checkpoint for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningCheckpoint {
    pub id: i64,
    pub agent_id: i64,
    /// 1, 2, 3, ... per agent
    pub version: u32,
    pub performance: PerformanceSnapshot,
    pub patterns: LearnedPatterns,
    pub new_patterns: Vec<PatternKind>,
    /// Current success rate minus the previous checkpoint's (0 baseline for v1)
    pub improvement_delta: f64,
    pub tasks_since_last: u64,
    pub created_at: DateTime<Utc>,
}

/// Full agent view with checkpoint history
#[derive(Debug, Clone, Serialize)]
pub struct AgentDetail {
    pub profile: AgentProfile,
    pub checkpoints: Vec<LearningCheckpoint>,
    pub recent_executions: Vec<ExecutionRecord>,
}

/// Learning progress summary
#[derive(Debug, Clone, Serialize)]
pub struct LearningSummary {
    pub agent_name: String,
    pub total_tasks: u64,
    pub success_rate: f64,
    pub avg_execution_ms: f64,
    pub checkpoints: u64,
    pub best_improvement: f64,
}

/// Aggregate performance for the agent metrics view
#[derive(Debug, Clone, Serialize)]
pub struct AgentMetrics {
    pub id: i64,
    pub name: String,
    pub success_rate: f64,
    pub total_tasks: u64,
    pub avg_execution_ms: f64,
    pub total_cost_usd: f64,
}

/// Auxiliary tool (MCP server) with capability embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProfile {
    pub id: i64,
    pub name: String,
    pub tool_type: String,
    pub description: String,
    #[serde(skip_serializing)]
    pub embedding: Vec<f32>,
    pub reliability: f64,
    pub total_uses: u64,
    pub success_rate: f64,
    pub install_command: Option<String>,
}

/// Registration input for a tool
#[derive(Debug, Clone, Deserialize)]
pub struct NewTool {
    pub name: String,
    pub tool_type: String,
    pub description: String,
    pub reliability: f64,
    #[serde(default)]
    pub install_command: Option<String>,
}

impl NewTool {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(RouterError::validation("tool name must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.reliability) {
            return Err(RouterError::validation("reliability must be within [0, 1]"));
        }
        Ok(())
    }
}

/// A tool attached to a project, with per-project usage
#[derive(Debug, Clone, Serialize)]
pub struct ProjectTool {
    pub name: String,
    pub tool_type: String,
    pub description: Option<String>,
    pub reason: String,
    pub usage_count: u64,
    pub success_count: u64,
    pub is_active: bool,
    pub install_command: Option<String>,
    pub added_at: DateTime<Utc>,
}

/// An agent assigned to a project, with per-project performance
#[derive(Debug, Clone, Serialize)]
pub struct ProjectAgent {
    pub agent_id: i64,
    pub agent_name: String,
    pub agent_type: String,
    pub task_count: u64,
    pub success_rate: f64,
    pub assigned_at: DateTime<Utc>,
}

/// Per-route counts over a time window
#[derive(Debug, Clone, Serialize)]
pub struct RouteMetrics {
    pub route: Route,
    pub count: u64,
    pub avg_processing_ms: f64,
    pub cache_hits: u64,
}

/// Scope change size relative to the prior version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMagnitude {
    None,
    Minor,
    Moderate,
    Major,
}

impl ChangeMagnitude {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeMagnitude::None => "none",
            ChangeMagnitude::Minor => "minor",
            ChangeMagnitude::Moderate => "moderate",
            ChangeMagnitude::Major => "major",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(ChangeMagnitude::None),
            "minor" => Some(ChangeMagnitude::Minor),
            "moderate" => Some(ChangeMagnitude::Moderate),
            "major" => Some(ChangeMagnitude::Major),
            _ => None,
        }
    }
}

/// Requirement categories that imply tooling needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementCategory {
    Database,
    Containerization,
    Testing,
    Frontend,
    Api,
    Security,
    Collaboration,
    Research,
    Documentation,
}

static CATEGORY_KEYWORDS: &[(RequirementCategory, &[&str])] = &[
    (RequirementCategory::Database, &["database", "sql", "postgres", "mysql", "sqlite", "mongo", "redis", "oracle"]),
    (RequirementCategory::Containerization, &["docker", "container", "kubernetes", "k8s", "helm"]),
    (RequirementCategory::Testing, &["test", "e2e", "coverage", "qa"]),
    (RequirementCategory::Frontend, &["frontend", "react", "vue", "web ui", "css", "browser"]),
    (RequirementCategory::Api, &["api", "rest api", "restful", "graphql", "grpc", "endpoint"]),
    (RequirementCategory::Security, &["security", "authenticat", "authoriz", "oauth", "login", "encryption", "compliance"]),
    (RequirementCategory::Collaboration, &["team", "collaboration", "slack", "review process"]),
    (RequirementCategory::Research, &["research", "search", "investigate"]),
    (RequirementCategory::Documentation, &["documentation", "docs", "readme"]),
];

impl RequirementCategory {
    /// Categories implied by a requirement list
    ///
    /// Keywords match at the start of a word, so "latest" is not a test.
    pub fn detect(requirements: &[String]) -> BTreeSet<RequirementCategory> {
        let mut found = BTreeSet::new();
        for requirement in requirements {
            let lower = requirement.to_lowercase();
            for (category, keywords) in CATEGORY_KEYWORDS {
                if keywords.iter().any(|kw| contains_keyword(&lower, kw)) {
                    found.insert(*category);
                }
            }
        }
        found
    }

    /// Agent type best suited to the category, if any
    pub fn agent_type(&self) -> Option<&'static str> {
        match self {
            RequirementCategory::Database => Some("database"),
            RequirementCategory::Testing => Some("testing"),
            RequirementCategory::Security => Some("code_review"),
            RequirementCategory::Api => Some("architecture"),
            _ => None,
        }
    }
}

/// One version of a project's declared scope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeVersion {
    pub id: i64,
    pub project_id: String,
    pub version: u32,
    pub description: String,
    pub requirements: Vec<String>,
    #[serde(skip_serializing)]
    pub embedding: Vec<f32>,
    pub magnitude: ChangeMagnitude,
    pub similarity: Option<f64>,
    pub tool_review_required: bool,
    pub tool_review_completed: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_agent() -> NewAgent {
        NewAgent {
            name: "Reviewer".into(),
            agent_type: "code_review".into(),
            purpose: "Review code".into(),
            system_prompt: "You review code.".into(),
            tools_enabled: vec![],
            model_config: serde_json::Value::Null,
            routing_priority: 0.5,
            initial_success_rate: None,
        }
    }

    #[test]
    fn test_new_agent_validation() {
        assert!(new_agent().validate().is_ok());

        let mut agent = new_agent();
        agent.name = "  ".into();
        assert!(agent.validate().is_err());

        let mut agent = new_agent();
        agent.routing_priority = 1.5;
        assert!(agent.validate().is_err());
    }

    #[test]
    fn test_feedback_validation() {
        assert!(ExecutionOutcome::success(10, 5).with_feedback(5).validate().is_ok());
        assert!(ExecutionOutcome::success(10, 5).with_feedback(0).validate().is_err());
        assert!(ExecutionOutcome::success(10, 5).with_feedback(6).validate().is_err());
        assert!(ExecutionOutcome::failure(10).validate().is_ok());
    }

    #[test]
    fn test_detect_categories() {
        let requirements = vec![
            "Persist orders in PostgreSQL".to_string(),
            "Ship as a Docker image".to_string(),
        ];
        let categories = RequirementCategory::detect(&requirements);
        assert!(categories.contains(&RequirementCategory::Database));
        assert!(categories.contains(&RequirementCategory::Containerization));
        assert!(!categories.contains(&RequirementCategory::Testing));
    }

    #[test]
    fn test_detect_ignores_keywords_inside_words() {
        let requirements = vec![
            "Show the latest posts by each author".to_string(),
            "Sort by interest, equal weights".to_string(),
            "Steam integration".to_string(),
        ];
        assert!(RequirementCategory::detect(&requirements).is_empty());

        let requirements = vec![
            "OAuth login for the team".to_string(),
            "Unit tests via a RESTful endpoint".to_string(),
        ];
        let categories = RequirementCategory::detect(&requirements);
        assert!(categories.contains(&RequirementCategory::Security));
        assert!(categories.contains(&RequirementCategory::Collaboration));
        assert!(categories.contains(&RequirementCategory::Testing));
        assert!(categories.contains(&RequirementCategory::Api));
    }

    #[test]
    fn test_magnitude_order() {
        assert!(ChangeMagnitude::Major > ChangeMagnitude::Moderate);
        assert_eq!(ChangeMagnitude::parse("minor"), Some(ChangeMagnitude::Minor));
        assert_eq!(ChangeMagnitude::parse("huge"), None);
    }
}
