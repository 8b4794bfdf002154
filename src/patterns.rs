//! Learned Patterns
//!
//! Recurring task patterns an agent has handled, keyed by a closed set of
//! pattern kinds. Each recorded execution bumps the frequency and success
//! rate of every pattern detected in its task text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::router::contains_keyword;

/// Recognized recurring task patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    CodeReview,
    Refactoring,
    TestGeneration,
    Debugging,
    Architecture,
    DatabaseQuery,
    Documentation,
    Performance,
    Security,
    Summarization,
    General,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::CodeReview => "code_review",
            PatternKind::Refactoring => "refactoring",
            PatternKind::TestGeneration => "test_generation",
            PatternKind::Debugging => "debugging",
            PatternKind::Architecture => "architecture",
            PatternKind::DatabaseQuery => "database_query",
            PatternKind::Documentation => "documentation",
            PatternKind::Performance => "performance",
            PatternKind::Security => "security",
            PatternKind::Summarization => "summarization",
            PatternKind::General => "general",
        }
    }
}

static PATTERN_KEYWORDS: &[(PatternKind, &[&str])] = &[
    (PatternKind::CodeReview, &["review", "audit", "pull request", "code quality"]),
    (PatternKind::Refactoring, &["refactor", "clean up", "duplication", "restructure", "rename"]),
    (PatternKind::TestGeneration, &["test", "coverage", "assert", "mock"]),
    (PatternKind::Debugging, &["bug", "debug", "fix", "error", "crash", "stack trace"]),
    (PatternKind::Architecture, &["architect", "design", "scalab", "microservice", "system"]),
    (PatternKind::DatabaseQuery, &["sql", "database", "query", "schema", "migration", "join"]),
    (PatternKind::Documentation, &["document", "docstring", "readme", "comment"]),
    (PatternKind::Performance, &["performance", "optimi", "latency", "slow", "memory usage"]),
    (PatternKind::Security, &["security", "vulnerab", "injection", "xss", "authenticat", "authoriz"]),
    (PatternKind::Summarization, &["summar", "tldr", "explain", "describe"]),
];

/// Pattern kinds present in a task; `General` when nothing specific matches
///
/// Keywords are word prefixes: "vulnerab" matches "vulnerability" but "fix" does not match "prefix".
pub fn detect_patterns(task: &str) -> BTreeSet<PatternKind> {
    let task_lower = task.to_lowercase();
    let mut kinds: BTreeSet<PatternKind> = PATTERN_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|kw| contains_keyword(&task_lower, kw)))
        .map(|(kind, _)| *kind)
        .collect();

    if kinds.is_empty() {
        kinds.insert(PatternKind::General);
    }
    kinds
}

/// Per-pattern statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    pub frequency: u64,
    pub success_rate: f64,
    pub first_seen: DateTime<Utc>,
}

/// Typed pattern summary for one agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LearnedPatterns(BTreeMap<PatternKind, PatternStats>);

impl LearnedPatterns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one execution outcome into every detected pattern
    pub fn observe(&mut self, kinds: &BTreeSet<PatternKind>, success: bool, at: DateTime<Utc>) {
        let outcome = if success { 1.0 } else { 0.0 };
        for kind in kinds {
            let stats = self.0.entry(*kind).or_insert(PatternStats {
                frequency: 0,
                success_rate: 0.0,
                first_seen: at,
            });
            let n = stats.frequency as f64;
            stats.success_rate = (stats.success_rate * n + outcome) / (n + 1.0);
            stats.frequency += 1;
        }
    }

    pub fn get(&self, kind: PatternKind) -> Option<&PatternStats> {
        self.0.get(&kind)
    }

    pub fn kinds(&self) -> BTreeSet<PatternKind> {
        self.0.keys().copied().collect()
    }

    /// Patterns present here but absent from `previous`
    pub fn new_since(&self, previous: &LearnedPatterns) -> Vec<PatternKind> {
        self.0
            .keys()
            .filter(|kind| !previous.0.contains_key(kind))
            .copied()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PatternKind, &PatternStats)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_patterns() {
        let kinds = detect_patterns("Fix the bug in the SQL join");
        assert!(kinds.contains(&PatternKind::Debugging));
        assert!(kinds.contains(&PatternKind::DatabaseQuery));
        assert!(!kinds.contains(&PatternKind::General));

        let kinds = detect_patterns("hello there");
        assert_eq!(kinds.into_iter().collect::<Vec<_>>(), vec![PatternKind::General]);
    }

    #[test]
    fn test_detect_patterns_matches_word_starts_only() {
        let kinds = detect_patterns("Show the latest posts by each author with a prefix");
        assert_eq!(kinds.into_iter().collect::<Vec<_>>(), vec![PatternKind::General]);

        let kinds = detect_patterns("Summarize the vulnerability report");
        assert!(kinds.contains(&PatternKind::Summarization));
        assert!(kinds.contains(&PatternKind::Security));
    }

    #[test]
    fn test_observe_updates_frequency_and_rate() {
        let now = Utc::now();
        let mut patterns = LearnedPatterns::new();
        let kinds = detect_patterns("write tests");

        patterns.observe(&kinds, true, now);
        patterns.observe(&kinds, false, now);
        patterns.observe(&kinds, true, now);

        let stats = patterns.get(PatternKind::TestGeneration).unwrap();
        assert_eq!(stats.frequency, 3);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.first_seen, now);
    }

    #[test]
    fn test_new_since() {
        let now = Utc::now();
        let mut before = LearnedPatterns::new();
        before.observe(&detect_patterns("review this"), true, now);

        let mut after = before.clone();
        after.observe(&detect_patterns("debug this crash"), true, now);

        assert_eq!(after.new_since(&before), vec![PatternKind::Debugging]);
        assert!(before.new_since(&after).is_empty());
        assert_eq!(after.new_since(&LearnedPatterns::new()).len(), 2);
    }

    #[test]
    fn test_json_shape() {
        let mut patterns = LearnedPatterns::new();
        patterns.observe(&detect_patterns("refactor"), true, Utc::now());
        let json = serde_json::to_value(&patterns).unwrap();
        assert!(json.get("refactoring").is_some());

        let back: LearnedPatterns = serde_json::from_value(json).unwrap();
        assert_eq!(back, patterns);
    }
}
