//! Configuration management
//!
//! Every tunable comes from an `AGENT_ROUTER_*` environment variable (after
//! `.env` is loaded by the binary) and falls back to a default.

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::budget::BudgetConfig;
use crate::cache::CacheConfig;
use crate::checkpoints::DEFAULT_CHECKPOINT_INTERVAL;
use crate::scope::ScopeThresholds;
use crate::scoring::{DistanceMetric, ScoringWeights};
use crate::tools::ToolPolicy;

/// Which embedding provider to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingChoice {
    /// Ollama when reachable at startup, hashing otherwise
    Auto,
    Ollama,
    Hash,
}

impl EmbeddingChoice {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "ollama" => Some(Self::Ollama),
            "hash" | "local" => Some(Self::Hash),
            _ => None,
        }
    }
}

/// Engine and server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,

    /// Ollama server for local execution and embeddings
    pub ollama_url: String,
    pub ollama_model: String,
    pub embedding_model: String,
    pub embeddings: EmbeddingChoice,
    /// Vector length for the hashing embedder
    pub hash_dimension: usize,
    pub embedding_retry_backoff: Duration,

    /// Anthropic API key (cloud reasoning is unavailable without it)
    pub anthropic_api_key: Option<String>,
    pub claude_model: String,
    /// Structured-data query service
    pub query_endpoint: Option<String>,
    pub backend_timeout: Duration,

    pub cache: CacheConfig,
    pub weights: ScoringWeights,
    pub metric: DistanceMetric,
    pub scope: ScopeThresholds,
    pub tools: ToolPolicy,
    pub checkpoint_interval: u64,
    pub budget: BudgetConfig,

    /// Register the default agents and tools when the store is empty
    pub seed_defaults: bool,
    /// JSON log lines instead of human-readable output
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("agent-router")
                .join("router.db"),
            host: "127.0.0.1".to_string(),
            port: 8420,
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3.2:3b".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            embeddings: EmbeddingChoice::Auto,
            hash_dimension: 384,
            embedding_retry_backoff: Duration::from_millis(250),
            anthropic_api_key: None,
            claude_model: "claude-sonnet-4-20250514".to_string(),
            query_endpoint: None,
            backend_timeout: Duration::from_secs(120),
            cache: CacheConfig::default(),
            weights: ScoringWeights::default(),
            metric: DistanceMetric::Cosine,
            scope: ScopeThresholds::default(),
            tools: ToolPolicy::default(),
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            budget: BudgetConfig::default(),
            seed_defaults: true,
            log_json: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<f64>().ok());
        let parse_u64 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(default)
        };

        let embeddings = match lookup("AGENT_ROUTER_EMBEDDINGS") {
            Some(v) => match EmbeddingChoice::parse(&v) {
                Some(choice) => choice,
                None => bail!("AGENT_ROUTER_EMBEDDINGS must be auto, ollama or hash, got '{}'", v),
            },
            None => defaults.embeddings,
        };

        let metric = match lookup("AGENT_ROUTER_DISTANCE_METRIC") {
            Some(v) => v.parse::<DistanceMetric>().map_err(anyhow::Error::msg)?,
            None => defaults.metric,
        };

        let cache = CacheConfig {
            response_capacity: parse_u64("AGENT_ROUTER_RESPONSE_CACHE_SIZE")
                .unwrap_or(defaults.cache.response_capacity),
            response_ttl: parse_u64("AGENT_ROUTER_RESPONSE_CACHE_TTL")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache.response_ttl),
            embedding_capacity: parse_u64("AGENT_ROUTER_EMBEDDING_CACHE_SIZE")
                .unwrap_or(defaults.cache.embedding_capacity),
            selection_capacity: parse_u64("AGENT_ROUTER_SELECTION_CACHE_SIZE")
                .unwrap_or(defaults.cache.selection_capacity),
            selection_ttl: parse_u64("AGENT_ROUTER_SELECTION_CACHE_TTL")
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache.selection_ttl),
        };

        let weights = ScoringWeights {
            similarity: parse("AGENT_ROUTER_WEIGHT_SIMILARITY").unwrap_or(defaults.weights.similarity),
            success: parse("AGENT_ROUTER_WEIGHT_SUCCESS").unwrap_or(defaults.weights.success),
            priority: parse("AGENT_ROUTER_WEIGHT_PRIORITY").unwrap_or(defaults.weights.priority),
        };

        let scope = ScopeThresholds {
            unchanged: parse("AGENT_ROUTER_SCOPE_UNCHANGED").unwrap_or(defaults.scope.unchanged),
            minor: parse("AGENT_ROUTER_SCOPE_MINOR").unwrap_or(defaults.scope.minor),
            moderate: parse("AGENT_ROUTER_SCOPE_MODERATE").unwrap_or(defaults.scope.moderate),
        };

        let mut tools = defaults.tools.clone();
        if let Some(v) = parse("AGENT_ROUTER_TOOL_RELIABILITY_FLOOR") {
            tools.reliability_floor = v;
        }
        if let Some(v) = parse("AGENT_ROUTER_TOOL_ESSENTIAL") {
            tools.essential_threshold = v;
        }
        if let Some(v) = parse("AGENT_ROUTER_TOOL_RECOMMENDED") {
            tools.recommended_threshold = v;
        }
        if let Some(v) = parse_u64("AGENT_ROUTER_TOOL_MAX_RECOMMENDED") {
            tools.max_recommended = v as usize;
        }

        let budget = BudgetConfig {
            max_tokens: parse_u64("AGENT_ROUTER_TOKEN_BUDGET").filter(|v| *v > 0),
            window: parse_u64("AGENT_ROUTER_BUDGET_WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.budget.window),
        };

        let config = Self {
            db_path: lookup("AGENT_ROUTER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            host: lookup("AGENT_ROUTER_HOST").unwrap_or(defaults.host),
            port: lookup("AGENT_ROUTER_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.port),
            ollama_url: lookup("AGENT_ROUTER_OLLAMA_URL")
                .or_else(|| lookup("OLLAMA_URL"))
                .unwrap_or(defaults.ollama_url),
            ollama_model: lookup("AGENT_ROUTER_OLLAMA_MODEL").unwrap_or(defaults.ollama_model),
            embedding_model: lookup("AGENT_ROUTER_EMBEDDING_MODEL").unwrap_or(defaults.embedding_model),
            embeddings,
            hash_dimension: parse_u64("AGENT_ROUTER_HASH_DIMENSION")
                .map(|v| v as usize)
                .unwrap_or(defaults.hash_dimension),
            embedding_retry_backoff: parse_u64("AGENT_ROUTER_EMBEDDING_RETRY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.embedding_retry_backoff),
            anthropic_api_key: lookup("ANTHROPIC_API_KEY").filter(|k| !k.trim().is_empty()),
            claude_model: lookup("AGENT_ROUTER_CLAUDE_MODEL").unwrap_or(defaults.claude_model),
            query_endpoint: lookup("AGENT_ROUTER_QUERY_URL").filter(|u| !u.trim().is_empty()),
            backend_timeout: parse_u64("AGENT_ROUTER_BACKEND_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.backend_timeout),
            cache,
            weights,
            metric,
            scope,
            tools,
            checkpoint_interval: parse_u64("AGENT_ROUTER_CHECKPOINT_INTERVAL")
                .unwrap_or(defaults.checkpoint_interval),
            budget,
            seed_defaults: flag("AGENT_ROUTER_SEED_DEFAULTS", defaults.seed_defaults),
            log_json: flag("AGENT_ROUTER_LOG_JSON", defaults.log_json),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject weight and threshold combinations that cannot rank sensibly
    pub fn validate(&self) -> Result<()> {
        let w = &self.weights;
        if w.similarity < 0.0 || w.success < 0.0 || w.priority < 0.0 {
            bail!("scoring weights must be non-negative");
        }
        if w.similarity + w.success + w.priority <= 0.0 {
            bail!("at least one scoring weight must be positive");
        }

        let s = &self.scope;
        if !(0.0..=1.0).contains(&s.moderate) || !(s.moderate <= s.minor && s.minor <= s.unchanged && s.unchanged <= 1.0) {
            bail!(
                "scope thresholds must satisfy 0 <= moderate <= minor <= unchanged <= 1, got {}/{}/{}",
                s.moderate,
                s.minor,
                s.unchanged
            );
        }

        if self.tools.recommended_threshold > self.tools.essential_threshold {
            bail!("tool recommended threshold must not exceed the essential threshold");
        }
        if self.checkpoint_interval == 0 {
            bail!("AGENT_ROUTER_CHECKPOINT_INTERVAL must be at least 1");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Platform-specific dirs fallback
mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            std::env::var("XDG_DATA_HOME")
                .map(PathBuf::from)
                .ok()
                .or_else(|| {
                    std::env::var("HOME")
                        .map(|h| PathBuf::from(h).join(".local/share"))
                        .ok()
                })
        }

        #[cfg(target_os = "macos")]
        {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join("Library/Application Support"))
                .ok()
        }

        #[cfg(target_os = "windows")]
        {
            std::env::var("LOCALAPPDATA").map(PathBuf::from).ok()
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.port, 8420);
        assert_eq!(config.checkpoint_interval, 10);
        assert_eq!(config.weights, ScoringWeights::default());
        assert_eq!(config.embeddings, EmbeddingChoice::Auto);
        assert!(config.budget.max_tokens.is_none());
        assert!(config.seed_defaults);
        assert!(config.db_path.ends_with("agent-router/router.db"));
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("AGENT_ROUTER_PORT", "9000"),
            ("AGENT_ROUTER_DISTANCE_METRIC", "euclidean"),
            ("AGENT_ROUTER_EMBEDDINGS", "hash"),
            ("AGENT_ROUTER_TOKEN_BUDGET", "50000"),
            ("AGENT_ROUTER_RESPONSE_CACHE_TTL", "60"),
            ("AGENT_ROUTER_SEED_DEFAULTS", "false"),
            ("OLLAMA_URL", "http://gpu-box:11434"),
            ("ANTHROPIC_API_KEY", ""),
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.metric, DistanceMetric::Euclidean);
        assert_eq!(config.embeddings, EmbeddingChoice::Hash);
        assert_eq!(config.budget.max_tokens, Some(50000));
        assert_eq!(config.cache.response_ttl, Duration::from_secs(60));
        assert!(!config.seed_defaults);
        assert_eq!(config.ollama_url, "http://gpu-box:11434");
        assert!(config.anthropic_api_key.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(from_pairs(&[("AGENT_ROUTER_EMBEDDINGS", "openai")]).is_err());
        assert!(from_pairs(&[("AGENT_ROUTER_DISTANCE_METRIC", "manhattan")]).is_err());
        assert!(from_pairs(&[("AGENT_ROUTER_WEIGHT_SUCCESS", "-1")]).is_err());
        assert!(from_pairs(&[("AGENT_ROUTER_SCOPE_MINOR", "0.99")]).is_err());
        assert!(from_pairs(&[("AGENT_ROUTER_CHECKPOINT_INTERVAL", "0")]).is_err());
    }
}
