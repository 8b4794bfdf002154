//! Scope Change Detection
//!
//! Compares a project's new scope description against its latest stored
//! version and grades the change:
//!
//! | similarity    | magnitude |
//! |---------------|-----------|
//! | >= 0.95       | none      |
//! | 0.85 .. 0.95  | minor     |
//! | 0.70 .. 0.85  | moderate  |
//! | < 0.70        | major     |
//!
//! A tool review is required for moderate and major changes, and whenever
//! the new requirements introduce a category the previous ones did not.
//! A project's first scope is always a major change.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use crate::clock::SharedClock;
use crate::embeddings::{cosine_similarity, EmbeddingService};
use crate::error::{Result, RouterError};
use crate::store::{NewScopeVersion, Store};
use crate::types::{ChangeMagnitude, RequirementCategory, ScopeVersion};

const MAX_DESCRIPTION_CHARS: usize = 20_000;
const MAX_REQUIREMENTS: usize = 100;
const MAX_REQUIREMENT_CHARS: usize = 500;

static PROJECT_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("valid project id regex"));

/// Project ids: 1-128 chars of letters, digits, `.`, `_`, `-`, starting alphanumeric
pub fn validate_project_id(project_id: &str) -> Result<()> {
    if PROJECT_ID.is_match(project_id) {
        Ok(())
    } else {
        Err(RouterError::validation(format!(
            "invalid project id '{}'",
            project_id
        )))
    }
}

/// Reject malformed scope input before any embedding or persistence
pub fn validate_scope(project_id: &str, description: &str, requirements: &[String]) -> Result<()> {
    validate_project_id(project_id)?;

    if description.trim().is_empty() {
        return Err(RouterError::validation("scope description must not be empty"));
    }
    if description.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(RouterError::validation(format!(
            "scope description exceeds {} characters",
            MAX_DESCRIPTION_CHARS
        )));
    }
    if requirements.len() > MAX_REQUIREMENTS {
        return Err(RouterError::validation(format!(
            "at most {} requirements are allowed",
            MAX_REQUIREMENTS
        )));
    }
    for (i, requirement) in requirements.iter().enumerate() {
        if requirement.trim().is_empty() {
            return Err(RouterError::validation(format!("requirement {} is empty", i)));
        }
        if requirement.chars().count() > MAX_REQUIREMENT_CHARS {
            return Err(RouterError::validation(format!(
                "requirement {} exceeds {} characters",
                i, MAX_REQUIREMENT_CHARS
            )));
        }
    }
    Ok(())
}

/// Similarity thresholds for grading a change
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScopeThresholds {
    pub unchanged: f64,
    pub minor: f64,
    pub moderate: f64,
}

impl Default for ScopeThresholds {
    fn default() -> Self {
        Self {
            unchanged: 0.95,
            minor: 0.85,
            moderate: 0.70,
        }
    }
}

impl ScopeThresholds {
    pub fn magnitude(&self, similarity: f64) -> ChangeMagnitude {
        if similarity >= self.unchanged {
            ChangeMagnitude::None
        } else if similarity >= self.minor {
            ChangeMagnitude::Minor
        } else if similarity >= self.moderate {
            ChangeMagnitude::Moderate
        } else {
            ChangeMagnitude::Major
        }
    }
}

/// Outcome of comparing a new scope with the latest version
#[derive(Debug, Clone, Serialize)]
pub struct ScopeAssessment {
    pub changed: bool,
    pub magnitude: ChangeMagnitude,
    pub requires_tool_review: bool,
    /// `None` when there is no previous version
    pub similarity: Option<f64>,
    pub new_categories: Vec<RequirementCategory>,
    pub previous_version: Option<u32>,
}

/// Grade a change against the previous version
///
/// An identical description is unchanged regardless of its embedding.
pub fn assess(
    previous: Option<&ScopeVersion>,
    description: &str,
    embedding: &[f32],
    requirements: &[String],
    thresholds: &ScopeThresholds,
) -> ScopeAssessment {
    let current = RequirementCategory::detect(requirements);

    let Some(previous) = previous else {
        return ScopeAssessment {
            changed: true,
            magnitude: ChangeMagnitude::Major,
            requires_tool_review: true,
            similarity: None,
            new_categories: current.into_iter().collect(),
            previous_version: None,
        };
    };

    let similarity = if previous.description == description {
        1.0
    } else {
        scope_similarity(embedding, &previous.embedding)
    };
    let magnitude = thresholds.magnitude(similarity);

    let prior: BTreeSet<RequirementCategory> = RequirementCategory::detect(&previous.requirements);
    let new_categories: Vec<RequirementCategory> = current.difference(&prior).copied().collect();

    ScopeAssessment {
        changed: magnitude != ChangeMagnitude::None,
        magnitude,
        requires_tool_review: magnitude >= ChangeMagnitude::Moderate || !new_categories.is_empty(),
        similarity: Some(similarity),
        new_categories,
        previous_version: Some(previous.version),
    }
}

/// Cosine similarity, except that two empty (all-zero) embeddings are identical
fn scope_similarity(a: &[f32], b: &[f32]) -> f64 {
    let is_zero = |v: &[f32]| v.iter().all(|x| *x == 0.0);
    if is_zero(a) && is_zero(b) {
        1.0
    } else {
        cosine_similarity(a, b) as f64
    }
}

/// Scope detector over the store's version history
pub struct ScopeDetector {
    store: Arc<Store>,
    embeddings: EmbeddingService,
    thresholds: ScopeThresholds,
    clock: SharedClock,
}

impl ScopeDetector {
    pub fn new(
        store: Arc<Store>,
        embeddings: EmbeddingService,
        thresholds: ScopeThresholds,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            embeddings,
            thresholds,
            clock,
        }
    }

    /// Compare without storing anything
    pub async fn evaluate(
        &self,
        project_id: &str,
        description: &str,
        requirements: &[String],
    ) -> Result<ScopeAssessment> {
        validate_scope(project_id, description, requirements)?;
        let embedding = self.embeddings.embed(description).await?;
        let previous = self.store.latest_scope(project_id)?;
        Ok(assess(
            previous.as_ref(),
            description,
            &embedding,
            requirements,
            &self.thresholds,
        ))
    }

    /// Compare and append the new version
    ///
    /// The comparison runs against whatever version is latest at write time.
    pub async fn update(
        &self,
        project_id: &str,
        description: &str,
        requirements: &[String],
    ) -> Result<(ScopeAssessment, ScopeVersion)> {
        validate_scope(project_id, description, requirements)?;
        let embedding = self.embeddings.embed(description).await?;
        let now = self.clock.now();

        let mut assessment = None;
        let (_, version) = self.store.append_scope_version(project_id, |previous| {
            let graded = assess(previous, description, &embedding, requirements, &self.thresholds);
            let next = NewScopeVersion {
                description: description.to_string(),
                requirements: requirements.to_vec(),
                embedding: embedding.to_vec(),
                magnitude: graded.magnitude,
                similarity: graded.similarity,
                tool_review_required: graded.requires_tool_review,
                created_at: now,
            };
            assessment = Some(graded);
            next
        })?;

        let assessment = assessment
            .ok_or_else(|| RouterError::validation("scope assessment was not produced"))?;
        info!(
            "Scope v{} for {}: {} (review required: {})",
            version.version,
            project_id,
            assessment.magnitude.as_str(),
            assessment.requires_tool_review
        );
        Ok((assessment, version))
    }

    pub fn complete_review(&self, project_id: &str, version: u32) -> Result<bool> {
        self.store.complete_tool_review(project_id, version)
    }

    pub fn history(&self, project_id: &str) -> Result<Vec<ScopeVersion>> {
        validate_project_id(project_id)?;
        self.store.scope_history(project_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EmbeddingCache;
    use crate::clock::ManualClock;
    use crate::embeddings::HashEmbedder;
    use chrono::Utc;
    use std::time::Duration;

    fn detector() -> ScopeDetector {
        ScopeDetector::new(
            Arc::new(Store::open_in_memory().unwrap()),
            EmbeddingService::new(
                Arc::new(HashEmbedder::new(256)),
                EmbeddingCache::new(100),
                Duration::from_millis(1),
            ),
            ScopeThresholds::default(),
            Arc::new(ManualClock::default()),
        )
    }

    fn reqs(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn version(embedding: Vec<f32>, requirements: &[&str]) -> ScopeVersion {
        ScopeVersion {
            id: 1,
            project_id: "p".into(),
            version: 3,
            description: "d".into(),
            requirements: reqs(requirements),
            embedding,
            magnitude: ChangeMagnitude::Major,
            similarity: None,
            tool_review_required: true,
            tool_review_completed: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_thresholds() {
        let t = ScopeThresholds::default();
        assert_eq!(t.magnitude(1.0), ChangeMagnitude::None);
        assert_eq!(t.magnitude(0.95), ChangeMagnitude::None);
        assert_eq!(t.magnitude(0.9), ChangeMagnitude::Minor);
        assert_eq!(t.magnitude(0.85), ChangeMagnitude::Minor);
        assert_eq!(t.magnitude(0.75), ChangeMagnitude::Moderate);
        assert_eq!(t.magnitude(0.5), ChangeMagnitude::Major);
    }

    #[test]
    fn test_first_scope_is_major() {
        let a = assess(None, "d", &[1.0, 0.0], &reqs(&["REST api"]), &ScopeThresholds::default());
        assert!(a.changed);
        assert_eq!(a.magnitude, ChangeMagnitude::Major);
        assert!(a.requires_tool_review);
        assert_eq!(a.similarity, None);
        assert_eq!(a.new_categories, vec![RequirementCategory::Api]);
    }

    #[test]
    fn test_new_category_forces_review_on_minor_change() {
        let previous = version(vec![1.0, 0.0], &["REST api"]);
        // cos = 0.9 -> minor
        let embedding = [0.9f32, (1.0f32 - 0.81).sqrt()];

        let same = assess(Some(&previous), "d2", &embedding, &reqs(&["REST api"]), &ScopeThresholds::default());
        assert_eq!(same.magnitude, ChangeMagnitude::Minor);
        assert!(!same.requires_tool_review);

        let grown = assess(
            Some(&previous),
            "d2",
            &embedding,
            &reqs(&["REST api", "Postgres storage"]),
            &ScopeThresholds::default(),
        );
        assert_eq!(grown.magnitude, ChangeMagnitude::Minor);
        assert!(grown.requires_tool_review);
        assert_eq!(grown.new_categories, vec![RequirementCategory::Database]);
        assert_eq!(grown.previous_version, Some(3));
    }

    #[test]
    fn test_validation() {
        assert!(validate_scope("my-project_1", "desc", &reqs(&["a"])).is_ok());
        assert!(validate_scope("", "desc", &[]).is_err());
        assert!(validate_scope("../etc", "desc", &[]).is_err());
        assert!(validate_scope("p", "   ", &[]).is_err());
        assert!(validate_scope("p", "desc", &reqs(&["ok", " "])).is_err());
        let too_many: Vec<String> = (0..=MAX_REQUIREMENTS).map(|i| format!("r{}", i)).collect();
        assert!(validate_scope("p", "desc", &too_many).is_err());
    }

    #[tokio::test]
    async fn test_identical_scope_is_unchanged() {
        let detector = detector();
        let description = "Inventory service exposing a REST api backed by postgres";
        let requirements = reqs(&["REST api", "postgres"]);

        let (first, v1) = detector.update("shop", description, &requirements).await.unwrap();
        assert_eq!(first.magnitude, ChangeMagnitude::Major);
        assert_eq!(v1.version, 1);

        let check = detector.evaluate("shop", description, &requirements).await.unwrap();
        assert!(!check.changed);
        assert_eq!(check.magnitude, ChangeMagnitude::None);
        assert!(!check.requires_tool_review);

        let (second, v2) = detector.update("shop", description, &requirements).await.unwrap();
        assert_eq!(second.magnitude, ChangeMagnitude::None);
        assert_eq!(v2.version, 2);
        assert!(!v2.tool_review_required);
    }

    #[tokio::test]
    async fn test_identical_stopword_scope_is_unchanged() {
        let detector = detector();
        // Every token is a stopword or a single char, so the embedding is all zeros
        let description = "the a of";
        let requirements = reqs(&["REST api"]);

        detector.update("blank", description, &requirements).await.unwrap();
        let check = detector.evaluate("blank", description, &requirements).await.unwrap();
        assert!(!check.changed);
        assert_eq!(check.magnitude, ChangeMagnitude::None);
        assert_eq!(check.similarity, Some(1.0));
        assert!(!check.requires_tool_review);
    }

    #[test]
    fn test_zero_embeddings_with_different_text_are_unchanged() {
        let previous = version(vec![0.0, 0.0], &["REST api"]);
        let a = assess(Some(&previous), "an x", &[0.0, 0.0], &reqs(&["REST api"]), &ScopeThresholds::default());
        assert_eq!(a.magnitude, ChangeMagnitude::None);

        let b = assess(Some(&previous), "an x", &[1.0, 0.0], &reqs(&["REST api"]), &ScopeThresholds::default());
        assert_eq!(b.magnitude, ChangeMagnitude::Major);
    }

    #[tokio::test]
    async fn test_unrelated_scope_is_major() {
        let detector = detector();
        detector
            .update("shop", "Inventory service exposing a REST api", &reqs(&["REST api"]))
            .await
            .unwrap();

        let check = detector
            .evaluate(
                "shop",
                "Mobile game with physics engine and particle effects",
                &reqs(&["REST api"]),
            )
            .await
            .unwrap();
        assert!(check.changed);
        assert_eq!(check.magnitude, ChangeMagnitude::Major);
        assert!(check.requires_tool_review);
    }

    #[tokio::test]
    async fn test_validation_happens_before_storage() {
        let detector = detector();
        assert!(detector.update("bad id!", "desc", &[]).await.is_err());
        assert!(detector.history("bad id!").is_err());
        assert!(detector.history("fine").unwrap().is_empty());
    }
}
