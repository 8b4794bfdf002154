//! Blended Scoring
//!
//! Ranks candidates (agents or tools) by
//! `w_similarity * (1 - normalized_distance) + w_success * success_rate + w_priority * priority`.
//! The distance metric is fixed when an index is built.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;

use crate::embeddings::{cosine_similarity, euclidean_distance};

/// Distance metric, fixed for the life of an index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
}

impl DistanceMetric {
    /// Distance mapped into [0, 1]; 0 = identical direction/position
    ///
    /// Cosine: (1 - cos) / 2. Euclidean: d / (|a| + |b|), which the triangle
    /// inequality bounds by 1. Zero or mismatched vectors are maximally distant.
    pub fn normalized_distance(&self, a: &[f32], b: &[f32]) -> f64 {
        if a.len() != b.len() || a.is_empty() {
            return 1.0;
        }
        match self {
            DistanceMetric::Cosine => {
                let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 1.0;
                }
                ((1.0 - cosine_similarity(a, b) as f64) / 2.0).clamp(0.0, 1.0)
            }
            DistanceMetric::Euclidean => {
                let bound: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt()
                    + b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if bound == 0.0 {
                    return 0.0;
                }
                (euclidean_distance(a, b) / bound).clamp(0.0, 1.0) as f64
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            other => Err(format!("unknown distance metric: {}", other)),
        }
    }
}

/// Blend weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub similarity: f64,
    pub success: f64,
    pub priority: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            similarity: 0.5,
            success: 0.3,
            priority: 0.2,
        }
    }
}

impl ScoringWeights {
    pub fn blend(&self, normalized_distance: f64, success_rate: f64, priority: f64) -> f64 {
        blended_score(normalized_distance, success_rate, priority, self)
    }
}

/// `w1 * (1 - distance) + w2 * success + w3 * priority`, inputs clamped to [0, 1]
pub fn blended_score(
    normalized_distance: f64,
    success_rate: f64,
    priority: f64,
    weights: &ScoringWeights,
) -> f64 {
    let similarity = 1.0 - normalized_distance.clamp(0.0, 1.0);
    weights.similarity * similarity
        + weights.success * success_rate.clamp(0.0, 1.0)
        + weights.priority * priority.clamp(0.0, 1.0)
}

/// A scored candidate
#[derive(Debug, Clone, Serialize)]
pub struct Ranked<T> {
    pub item: T,
    pub score: f64,
    pub distance: f64,
    pub success_rate: f64,
    pub total_tasks: u64,
}

/// Best first: score, then success rate, then proven (more tasks)
pub fn compare_ranked<T>(a: &Ranked<T>, b: &Ranked<T>) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            b.success_rate
                .partial_cmp(&a.success_rate)
                .unwrap_or(Ordering::Equal)
        })
        .then_with(|| b.total_tasks.cmp(&a.total_tasks))
}
