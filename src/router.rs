//! Task Router
//!
//! Classifies a task description into one of the backend routes using
//! keyword signals. Keyword sets are checked in a fixed priority order:
//! structured-data first, then complex reasoning, then simple tasks.
//! Anything unmatched goes to cloud reasoning.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Backend routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Low-cost local model (Ollama)
    LocalModel,
    /// High-capability cloud reasoning (Claude)
    CloudReasoning,
    /// Structured-data query backend
    StructuredData,
}

impl Route {
    pub const ALL: [Route; 3] = [Route::LocalModel, Route::CloudReasoning, Route::StructuredData];

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::LocalModel => "local_model",
            Route::CloudReasoning => "cloud_reasoning",
            Route::StructuredData => "structured_data",
        }
    }

    fn index(&self) -> usize {
        match self {
            Route::LocalModel => 0,
            Route::CloudReasoning => 1,
            Route::StructuredData => 2,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Route {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local_model" | "local" | "ollama" => Ok(Route::LocalModel),
            "cloud_reasoning" | "cloud" | "claude" => Ok(Route::CloudReasoning),
            "structured_data" | "structured" | "data" | "oracle" => Ok(Route::StructuredData),
            other => Err(format!("unknown route: {}", other)),
        }
    }
}

// Keyword sets, checked in this order
static STRUCTURED_DATA_KEYWORDS: &[&str] = &[
    "sql", "database", "schema", "migration", "query data",
    "analyze database", "aggregate", "join", "postgres", "oracle",
];

static COMPLEX_KEYWORDS: &[&str] = &[
    "refactor", "architect", "debug", "design",
    "develop", "implement", "optimize", "review code",
    "analyze deeply", "reason about", "strategic", "complex",
];

static SIMPLE_KEYWORDS: &[&str] = &[
    "summarize", "summary", "tldr", "brief",
    "classify", "categorize", "what is", "define",
    "translate", "extract", "convert", "format", "list",
];

/// Classification result with the keyword that decided it
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub route: Route,
    pub matched_keyword: Option<&'static str>,
    pub reasoning: String,
}

/// Keyword-based task classifier
pub struct TaskRouter {
    counts: [AtomicU64; 3],
}

impl TaskRouter {
    pub fn new() -> Self {
        Self {
            counts: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    /// Route a task description
    pub fn classify(&self, task: &str) -> Route {
        self.explain(task).route
    }

    /// Route a task description and report why
    pub fn explain(&self, task: &str) -> Classification {
        let task_lower = task.to_lowercase();

        let ordered: [(&[&'static str], Route, &str); 3] = [
            (STRUCTURED_DATA_KEYWORDS, Route::StructuredData, "Structured-data keyword"),
            (COMPLEX_KEYWORDS, Route::CloudReasoning, "Complex reasoning keyword"),
            (SIMPLE_KEYWORDS, Route::LocalModel, "Simple task keyword"),
        ];

        let classification = ordered
            .iter()
            .find_map(|(keywords, route, label)| {
                keywords
                    .iter()
                    .find(|kw| contains_keyword(&task_lower, kw))
                    .map(|kw| Classification {
                        route: *route,
                        matched_keyword: Some(*kw),
                        reasoning: format!("{} '{}'", label, kw),
                    })
            })
            .unwrap_or_else(|| Classification {
                route: Route::CloudReasoning,
                matched_keyword: None,
                reasoning: "No keyword matched, default route".to_string(),
            });

        self.counts[classification.route.index()].fetch_add(1, Ordering::Relaxed);
        debug!(route = %classification.route, "{}", classification.reasoning);

        classification
    }

    /// Number of classifications per route since start
    pub fn counts(&self) -> Vec<(Route, u64)> {
        Route::ALL
            .iter()
            .map(|r| (*r, self.counts[r.index()].load(Ordering::Relaxed)))
            .collect()
    }
}

/// Keyword must start at a word boundary ("format" does not match "information")
pub(crate) fn contains_keyword(text: &str, keyword: &str) -> bool {
    text.match_indices(keyword).any(|(idx, _)| {
        text[..idx]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric())
    })
}

impl Default for TaskRouter {
    fn default() -> Self {
        Self::new()
    }
}
