//! Token Budget and Cost Estimation
//!
//! Pre-flight token estimates, a per-window token ceiling, and per-route
//! cost estimation for recorded executions.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::error::{Result, RouterError};
use crate::router::Route;

/// Approximate token counter (~3.8 chars per token)
#[derive(Debug, Clone, Copy)]
pub struct TokenCounter {
    chars_per_token: f32,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self {
            chars_per_token: 3.8,
        }
    }
}

impl TokenCounter {
    /// Approximate tokens in text
    ///
    /// Code and structured text are denser than prose and get a higher factor.
    pub fn count(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }

        let char_count = text.chars().count();
        let base_tokens = (char_count as f32 / self.chars_per_token).ceil();
        (base_tokens * density_factor(text)).ceil() as u64
    }
}

fn density_factor(text: &str) -> f32 {
    let mut factor = 1.0f32;

    let code_indicators = ["{", "}", "(", ")", ";", "=>", "->", "::"];
    let code_density: f32 = code_indicators
        .iter()
        .map(|p| text.matches(p).count() as f32)
        .sum::<f32>()
        / text.len().max(1) as f32;
    if code_density > 0.01 {
        factor *= 1.15;
    }

    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        factor *= 1.2;
    }

    factor
}

/// Pricing per million tokens
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub const FREE: Self = Self {
        input_per_million: 0.0,
        output_per_million: 0.0,
    };

    pub const SONNET: Self = Self {
        input_per_million: 3.0,
        output_per_million: 15.0,
    };

    /// Local and structured-data backends run on owned infrastructure
    pub fn for_route(route: Route) -> Self {
        match route {
            Route::CloudReasoning => Self::SONNET,
            Route::LocalModel | Route::StructuredData => Self::FREE,
        }
    }

    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_million
            + output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

/// Estimated USD cost of one execution
pub fn estimate_cost(route: Route, input_tokens: u64, output_tokens: u64) -> f64 {
    ModelPricing::for_route(route).cost(input_tokens, output_tokens)
}

/// Budget configuration; no ceiling when `max_tokens` is `None`
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub max_tokens: Option<u64>,
    pub window: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_tokens: None,
            window: Duration::from_secs(24 * 3600),
        }
    }
}

/// Current budget window
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub limit: Option<u64>,
    pub used: u64,
    pub remaining: Option<u64>,
    pub resets_at: DateTime<Utc>,
}

struct Window {
    started_at: DateTime<Utc>,
    used: u64,
}

/// Token ceiling per fixed window
pub struct TokenBudget {
    config: BudgetConfig,
    window: chrono::Duration,
    clock: SharedClock,
    state: Mutex<Window>,
}

impl TokenBudget {
    pub fn new(config: BudgetConfig, clock: SharedClock) -> Self {
        let window = chrono::Duration::from_std(config.window)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let started_at = clock.now();
        Self {
            config,
            window,
            clock,
            state: Mutex::new(Window { started_at, used: 0 }),
        }
    }

    fn roll(&self, state: &mut Window, now: DateTime<Utc>) {
        if now >= state.started_at + self.window {
            state.started_at = now;
            state.used = 0;
        }
    }

    /// Fail with `BudgetExceeded` if `estimated_tokens` would pass the ceiling
    pub fn check(&self, estimated_tokens: u64) -> Result<()> {
        let Some(limit) = self.config.max_tokens else {
            return Ok(());
        };

        let now = self.clock.now();
        let mut state = self.state.lock();
        self.roll(&mut state, now);

        if state.used.saturating_add(estimated_tokens) > limit {
            return Err(RouterError::BudgetExceeded {
                remaining_tokens: limit.saturating_sub(state.used),
                resets_at: state.started_at + self.window,
            });
        }
        Ok(())
    }

    /// Charge tokens actually used
    pub fn record(&self, tokens: u64) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        state.used = state.used.saturating_add(tokens);
    }

    pub fn status(&self) -> BudgetStatus {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        BudgetStatus {
            limit: self.config.max_tokens,
            used: state.used,
            remaining: self.config.max_tokens.map(|l| l.saturating_sub(state.used)),
            resets_at: state.started_at + self.window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use std::sync::Arc;

    #[test]
    fn test_token_count() {
        let counter = TokenCounter::default();
        assert_eq!(counter.count(""), 0);

        let prose = counter.count("Summarize this function for me please");
        assert!(prose > 5 && prose < 15);

        let code = "fn main() { println!(\"hi\"); }";
        let plain = "fn main println hi and some more";
        assert!(counter.count(code) as f32 / code.len() as f32 > counter.count(plain) as f32 / plain.len() as f32);
    }

    #[test]
    fn test_cost_by_route() {
        assert_eq!(estimate_cost(Route::LocalModel, 1000, 1000), 0.0);
        let cloud = estimate_cost(Route::CloudReasoning, 1_000_000, 1_000_000);
        assert!((cloud - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_unlimited_budget() {
        let budget = TokenBudget::new(BudgetConfig::default(), Arc::new(ManualClock::default()));
        budget.record(1_000_000);
        assert!(budget.check(1_000_000).is_ok());
        assert_eq!(budget.status().remaining, None);
    }

    #[test]
    fn test_budget_exceeded_and_reset() {
        let clock = ManualClock::default();
        let config = BudgetConfig {
            max_tokens: Some(100),
            window: Duration::from_secs(3600),
        };
        let budget = TokenBudget::new(config, Arc::new(clock.clone()));
        let start = clock.now();

        assert!(budget.check(60).is_ok());
        budget.record(60);

        match budget.check(50) {
            Err(RouterError::BudgetExceeded {
                remaining_tokens,
                resets_at,
            }) => {
                assert_eq!(remaining_tokens, 40);
                assert_eq!(resets_at, start + chrono::Duration::hours(1));
            }
            other => panic!("expected BudgetExceeded, got {:?}", other),
        }
        assert!(budget.check(40).is_ok());

        clock.advance_secs(3600);
        assert!(budget.check(100).is_ok());
        assert_eq!(budget.status().used, 0);
    }
}
