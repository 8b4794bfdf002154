//! Execution Recorder
//!
//! Folds each execution outcome into the agent's rolling statistics and
//! learned patterns, appends the history record, and writes a learning
//! checkpoint when a boundary is crossed.
//!
//! The whole update runs under the agent's lock without awaiting, and is
//! committed to the store in one transaction before the in-memory profile is
//! replaced. A failed commit leaves both sides untouched.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::agents::AgentRegistry;
use crate::budget::estimate_cost;
use crate::checkpoints::CheckpointPolicy;
use crate::clock::SharedClock;
use crate::error::{Result, RouterError};
use crate::patterns::detect_patterns;
use crate::router::Route;
use crate::store::{NewExecution, Store};
use crate::types::{AgentProfile, ExecutionOutcome, LearningCheckpoint};

/// Result of recording one execution
#[derive(Debug, Clone)]
pub struct RecordedExecution {
    pub record_id: i64,
    pub profile: AgentProfile,
    pub checkpoint: Option<LearningCheckpoint>,
}

/// Fold one outcome into rolling statistics
///
/// `success' = (success * n + s) / (n + 1)`, same for average time.
pub fn apply_outcome(profile: &mut AgentProfile, task: &str, outcome: &ExecutionOutcome, now: DateTime<Utc>) {
    let n = profile.total_tasks as f64;
    let success = if outcome.success { 1.0 } else { 0.0 };

    profile.success_rate = ((profile.success_rate * n + success) / (n + 1.0)).clamp(0.0, 1.0);
    profile.avg_execution_ms = (profile.avg_execution_ms * n + outcome.execution_ms as f64) / (n + 1.0);
    profile.total_tasks += 1;
    profile.last_used = Some(now);
    profile
        .learned_patterns
        .observe(&detect_patterns(task), outcome.success, now);
}

pub struct ExecutionRecorder {
    store: Arc<Store>,
    registry: Arc<AgentRegistry>,
    policy: CheckpointPolicy,
    clock: SharedClock,
}

impl ExecutionRecorder {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<AgentRegistry>,
        policy: CheckpointPolicy,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            clock,
        }
    }

    /// Record an outcome exactly once
    ///
    /// `input_tokens` splits `outcome.tokens_used` for cost estimation.
    pub fn record(
        &self,
        agent_id: i64,
        project_id: &str,
        task: &str,
        route: Option<Route>,
        outcome: ExecutionOutcome,
        input_tokens: u64,
    ) -> Result<RecordedExecution> {
        outcome.validate()?;
        let handle = self
            .registry
            .handle(agent_id)
            .ok_or_else(|| RouterError::NotFound(format!("agent {}", agent_id)))?;

        let now = self.clock.now();
        let mut state = handle.lock();

        let mut updated = state.profile.clone();
        apply_outcome(&mut updated, task, &outcome, now);
        let checkpoint = self
            .policy
            .maybe_checkpoint(&updated, state.last_checkpoint.as_ref(), now);

        let input_tokens = input_tokens.min(outcome.tokens_used);
        let cost_usd = route
            .map(|r| estimate_cost(r, input_tokens, outcome.tokens_used - input_tokens))
            .unwrap_or(0.0);

        let execution = NewExecution {
            agent_id,
            project_id,
            task,
            route,
            outcome,
            cost_usd,
            at: now,
        };
        let (record_id, checkpoint_id) =
            self.store
                .commit_execution(&execution, &updated, checkpoint.as_ref())?;

        let checkpoint = match (checkpoint, checkpoint_id) {
            (Some(mut cp), Some(id)) => {
                cp.id = id;
                info!(
                    "Checkpoint v{} for {}: success {:.2} ({:+.2}), {} new patterns",
                    cp.version,
                    updated.name,
                    cp.performance.success_rate,
                    cp.improvement_delta,
                    cp.new_patterns.len()
                );
                state.last_checkpoint = Some(cp.clone());
                Some(cp)
            }
            _ => None,
        };
        state.profile = updated.clone();

        debug!(
            "Recorded execution {} for {}: success={} total={}",
            record_id, updated.name, outcome.success, updated.total_tasks
        );

        Ok(RecordedExecution {
            record_id,
            profile: updated,
            checkpoint,
        })
    }
}
