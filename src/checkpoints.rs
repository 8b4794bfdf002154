//! Learning Checkpoints
//!
//! Every `interval` executions an agent gets an immutable checkpoint: its
//! performance at that moment, the patterns first seen since the previous
//! checkpoint, and the change in success rate.
//!
//! Due-ness is decided on N-task boundaries (`total / N` grew since the last
//! checkpoint) while the caller holds the agent's lock, so each boundary yields
//! exactly one checkpoint however executions interleave.

use chrono::{DateTime, Utc};

use crate::types::{AgentProfile, LearningCheckpoint, LearningSummary};

/// Default executions between checkpoints
pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 10;

#[derive(Debug, Clone, Copy)]
pub struct CheckpointPolicy {
    pub interval: u64,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_CHECKPOINT_INTERVAL,
        }
    }
}

impl CheckpointPolicy {
    pub fn new(interval: u64) -> Self {
        Self { interval }
    }

    /// Whether `profile` crossed a boundary since `previous`
    pub fn is_due(&self, profile: &AgentProfile, previous: Option<&LearningCheckpoint>) -> bool {
        if self.interval == 0 {
            return false;
        }
        let last_total = previous.map(|c| c.performance.total_tasks).unwrap_or(0);
        profile.total_tasks / self.interval > last_total / self.interval
    }

    /// Build the next checkpoint if one is due; the caller persists it
    pub fn maybe_checkpoint(
        &self,
        profile: &AgentProfile,
        previous: Option<&LearningCheckpoint>,
        now: DateTime<Utc>,
    ) -> Option<LearningCheckpoint> {
        if !self.is_due(profile, previous) {
            return None;
        }

        let (version, previous_rate, previous_total, new_patterns) = match previous {
            Some(prev) => (
                prev.version + 1,
                prev.performance.success_rate,
                prev.performance.total_tasks,
                profile.learned_patterns.new_since(&prev.patterns),
            ),
            None => (
                1,
                0.0,
                0,
                profile.learned_patterns.kinds().into_iter().collect(),
            ),
        };

        Some(LearningCheckpoint {
            id: 0,
            agent_id: profile.id,
            version,
            performance: profile.snapshot(),
            patterns: profile.learned_patterns.clone(),
            new_patterns,
            improvement_delta: profile.success_rate - previous_rate,
            tasks_since_last: profile.total_tasks.saturating_sub(previous_total),
            created_at: now,
        })
    }
}

/// Progress summary across an agent's checkpoint history
pub fn learning_summary(profile: &AgentProfile, checkpoints: &[LearningCheckpoint]) -> LearningSummary {
    let best_improvement = checkpoints
        .iter()
        .map(|c| c.improvement_delta)
        .fold(None, |best: Option<f64>, d| Some(best.map_or(d, |b| b.max(d))))
        .unwrap_or(0.0);

    LearningSummary {
        agent_name: profile.name.clone(),
        total_tasks: profile.total_tasks,
        success_rate: profile.success_rate,
        avg_execution_ms: profile.avg_execution_ms,
        checkpoints: checkpoints.len() as u64,
        best_improvement,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::{detect_patterns, LearnedPatterns, PatternKind};

    fn profile(total_tasks: u64, success_rate: f64) -> AgentProfile {
        AgentProfile {
            id: 1,
            name: "Tester".into(),
            agent_type: "testing".into(),
            purpose: "tests".into(),
            system_prompt: String::new(),
            tools_enabled: vec![],
            model_config: serde_json::Value::Null,
            embedding: vec![],
            routing_priority: 0.5,
            total_tasks,
            success_rate,
            avg_execution_ms: 100.0,
            last_used: None,
            learned_patterns: LearnedPatterns::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_due_on_boundaries_only() {
        let policy = CheckpointPolicy::default();
        assert!(!policy.is_due(&profile(0, 0.0), None));
        assert!(!policy.is_due(&profile(9, 0.5), None));
        assert!(policy.is_due(&profile(10, 0.5), None));

        let first = policy.maybe_checkpoint(&profile(10, 0.5), None, Utc::now()).unwrap();
        assert!(!policy.is_due(&profile(10, 0.5), Some(&first)));
        assert!(!policy.is_due(&profile(19, 0.5), Some(&first)));
        assert!(policy.is_due(&profile(20, 0.5), Some(&first)));
    }

    #[test]
    fn test_versions_and_delta() {
        let policy = CheckpointPolicy::new(10);
        let now = Utc::now();

        let first = policy.maybe_checkpoint(&profile(10, 0.6), None, now).unwrap();
        assert_eq!(first.version, 1);
        assert!((first.improvement_delta - 0.6).abs() < 1e-9);
        assert_eq!(first.tasks_since_last, 10);

        let second = policy
            .maybe_checkpoint(&profile(20, 0.75), Some(&first), now)
            .unwrap();
        assert_eq!(second.version, 2);
        assert!((second.improvement_delta - 0.15).abs() < 1e-9);
        assert_eq!(second.tasks_since_last, 10);
    }

    #[test]
    fn test_new_patterns_diff() {
        let policy = CheckpointPolicy::new(1);
        let now = Utc::now();

        let mut p = profile(1, 1.0);
        p.learned_patterns.observe(&detect_patterns("write tests"), true, now);
        let first = policy.maybe_checkpoint(&p, None, now).unwrap();
        assert_eq!(first.new_patterns, vec![PatternKind::TestGeneration]);

        p.total_tasks = 2;
        p.learned_patterns.observe(&detect_patterns("write tests"), true, now);
        let second = policy.maybe_checkpoint(&p, Some(&first), now).unwrap();
        assert!(second.new_patterns.is_empty());

        p.total_tasks = 3;
        p.learned_patterns.observe(&detect_patterns("fix the crash"), true, now);
        let third = policy.maybe_checkpoint(&p, Some(&second), now).unwrap();
        assert_eq!(third.new_patterns, vec![PatternKind::Debugging]);
    }

    #[test]
    fn test_zero_interval_disables() {
        let policy = CheckpointPolicy::new(0);
        assert!(policy.maybe_checkpoint(&profile(100, 1.0), None, Utc::now()).is_none());
    }

    #[test]
    fn test_learning_summary() {
        let policy = CheckpointPolicy::new(10);
        let now = Utc::now();
        let first = policy.maybe_checkpoint(&profile(10, 0.5), None, now).unwrap();
        let second = policy
            .maybe_checkpoint(&profile(20, 0.4), Some(&first), now)
            .unwrap();

        let summary = learning_summary(&profile(20, 0.4), &[first, second]);
        assert_eq!(summary.checkpoints, 2);
        assert!((summary.best_improvement - 0.5).abs() < 1e-9);

        let empty = learning_summary(&profile(0, 0.0), &[]);
        assert_eq!(empty.best_improvement, 0.0);
    }
}
