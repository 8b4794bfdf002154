//! Agent Router
//!
//! Routes developer tasks to the right backend and specialized agent, caches
//! what it can, and learns from every outcome.
//!
//! # Features
//!
//! - **Routing**: keyword classification into local model, cloud reasoning or structured data
//! - **Agent Selection**: blended capability similarity + success rate + priority
//! - **Caching**: response, embedding and agent-selection tiers (Moka)
//! - **Learning**: rolling per-agent statistics and versioned learning checkpoints
//! - **Scope Tracking**: versioned project scopes with change magnitude grading
//! - **Tool Recommendations**: reliability-filtered MCP tool stacks per project
//! - **Budgets**: token ceilings per window and per-route cost estimates
//!
//! # Architecture
//!
//! ```text
//! HTTP (axum) ──► Engine ──► TaskRouter (keywords)
//!                   │
//!                   ├── AgentSelector ──► EmbeddingService (Ollama | hashing)
//!                   ├── CacheTier (responses, embeddings, selections)
//!                   ├── BackendRegistry (Ollama, Claude, query service)
//!                   ├── ExecutionRecorder ──► CheckpointPolicy
//!                   ├── ScopeDetector + ToolRecommender
//!                   └── Store (SQLite)
//! ```

pub mod agents;
pub mod api;
pub mod backends;
pub mod budget;
pub mod cache;
pub mod checkpoints;
pub mod clock;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod patterns;
pub mod recorder;
pub mod router;
pub mod scope;
pub mod scoring;
pub mod seed;
pub mod store;
pub mod tools;
pub mod types;

pub use agents::{AgentRegistry, AgentSelector, Selection, SelectionSource};
pub use backends::{
    BackendRegistry, BackendRequest, BackendResponse, ClaudeBackend, ExecutionBackend,
    HttpQueryBackend, OllamaBackend,
};
pub use budget::{BudgetConfig, BudgetStatus, TokenBudget, TokenCounter};
pub use cache::{CacheConfig, CacheStats, CacheTier};
pub use checkpoints::CheckpointPolicy;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{Config, EmbeddingChoice};
pub use embeddings::{EmbeddingProvider, EmbeddingService, HashEmbedder, OllamaEmbedder};
pub use engine::{Engine, ExecuteRequest, ExecuteResult, ScopeUpdate};
pub use error::{Result, RouterError};
pub use patterns::{LearnedPatterns, PatternKind};
pub use router::{Classification, Route, TaskRouter};
pub use scope::{ScopeAssessment, ScopeDetector, ScopeThresholds};
pub use scoring::{DistanceMetric, ScoringWeights};
pub use store::Store;
pub use tools::{ToolPolicy, ToolRecommendations, ToolRecommender};
pub use types::{
    AgentDetail, AgentProfile, AgentSummary, ChangeMagnitude, ExecutionOutcome,
    LearningCheckpoint, NewAgent, NewTool, RequirementCategory,
};
