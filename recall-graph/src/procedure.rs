//! Procedural knowledge: learned heuristics whose confidence tracks feedback
//!
//! Matching scores trigger keyword/context overlap scaled by confidence.
//! Feedback nudges confidence up asymptotically on success and multiplies it
//! down on contradiction. Heuristics that keep failing are latched for human
//! review; the latch has no release.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decay::days_elapsed;
use crate::error::{GraphError, Result};
use crate::node::content_hash;

pub const MIN_CONFIDENCE: f64 = 0.01;
pub const MAX_CONFIDENCE: f64 = 0.99;
pub const MAX_STABILITY: f64 = 2.0;

const KEYWORD_WEIGHT: f64 = 0.7;
const CONTEXT_WEIGHT: f64 = 0.3;
const REVIEW_CONTRADICTIONS: u32 = 3;
const REVIEW_CONFIDENCE: f64 = 0.3;
const MIN_DERIVED_KEYWORD_LEN: usize = 4;
const DERIVED_STOPWORDS: &[&str] = &[
    "about", "been", "from", "have", "into", "that", "than", "them", "then", "they", "this",
    "were", "what", "when", "which", "with", "your",
];

/// Kind of heuristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcedureType {
    #[default]
    Lesson,
    Workflow,
    Preference,
    Warning,
}

/// One-way review latch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReviewFlag {
    #[default]
    Clear,
    Flagged { since: DateTime<Utc> },
}

impl ReviewFlag {
    pub fn is_flagged(&self) -> bool {
        matches!(self, Self::Flagged { .. })
    }

    /// Set the latch; a flagged latch keeps its original timestamp
    fn latch(&mut self, now: DateTime<Utc>) {
        if let Self::Clear = self {
            *self = Self::Flagged { since: now };
        }
    }
}

/// Feedback after a procedure was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    Positive,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Procedure {
    pub id: String,
    pub statement: String,
    #[serde(rename = "type")]
    pub procedure_type: ProcedureType,
    pub trigger_keywords: BTreeSet<String>,
    pub trigger_contexts: BTreeSet<String>,
    pub confidence: f64,
    pub stability: f64,
    pub applications: u32,
    pub contradictions: u32,
    pub review: ReviewFlag,
    pub created_at: DateTime<Utc>,
    pub last_applied: Option<DateTime<Utc>>,
}

impl Procedure {
    pub fn flagged_for_review(&self) -> bool {
        self.review.is_flagged()
    }

    /// Apply one feedback event
    pub fn apply(&mut self, feedback: Feedback, now: DateTime<Utc>) {
        match feedback {
            Feedback::Positive => {
                self.applications += 1;
                self.confidence += 0.1 * (1.0 - self.confidence);
                self.stability = (self.stability + 0.1).min(MAX_STABILITY);
            }
            Feedback::Negative => {
                self.contradictions += 1;
                self.confidence *= 0.8;
                self.stability = (self.stability - 0.2).max(0.0);
            }
        }
        self.confidence = self.confidence.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE);
        self.last_applied = Some(now);

        if self.contradictions >= REVIEW_CONTRADICTIONS && self.confidence < REVIEW_CONFIDENCE {
            self.review.latch(now);
        }
    }

    /// Relevance of this procedure to a query and set of contexts
    pub fn score(&self, query: &str, contexts: &[String], now: DateTime<Utc>) -> f64 {
        let query_lower = query.to_lowercase();
        let terms: HashSet<&str> = query_lower.split_whitespace().collect();

        let keyword_ratio = overlap_ratio(&self.trigger_keywords, |kw| {
            if kw.contains(char::is_whitespace) {
                query_lower.contains(kw)
            } else {
                terms.contains(kw)
            }
        });
        let contexts: HashSet<String> = contexts.iter().map(|c| c.trim().to_lowercase()).collect();
        let context_ratio = overlap_ratio(&self.trigger_contexts, |ctx| contexts.contains(ctx));

        let mut score =
            (KEYWORD_WEIGHT * keyword_ratio + CONTEXT_WEIGHT * context_ratio) * self.confidence;
        if let Some(last) = self.last_applied {
            let days = days_elapsed(last, now) as f64;
            score *= (1.0 - days / 365.0).max(0.5);
        }
        score
    }
}

/// Fraction of `triggers` for which `hit` holds; 0 for an empty set
fn overlap_ratio(triggers: &BTreeSet<String>, hit: impl Fn(&str) -> bool) -> f64 {
    if triggers.is_empty() {
        return 0.0;
    }
    let matched = triggers.iter().filter(|t| hit(t.as_str())).count();
    matched as f64 / triggers.len() as f64
}

/// Input for creating a procedure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcedureDraft {
    pub statement: String,
    pub procedure_type: ProcedureType,
    pub trigger_keywords: Vec<String>,
    pub trigger_contexts: Vec<String>,
    pub confidence: Option<f64>,
}

impl ProcedureDraft {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            ..Default::default()
        }
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trigger_keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn contexts<I, S>(mut self, contexts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.trigger_contexts = contexts.into_iter().map(Into::into).collect();
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Validate and freeze; the id hashes the normalized statement
    pub fn into_procedure(self, now: DateTime<Utc>) -> Result<Procedure> {
        let statement = self.statement.trim().to_string();
        if statement.is_empty() {
            return Err(GraphError::validation("procedure statement must not be empty"));
        }
        let clean = |items: Vec<String>| -> BTreeSet<String> {
            items
                .into_iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        let mut trigger_keywords = clean(self.trigger_keywords);
        if trigger_keywords.is_empty() {
            trigger_keywords = statement_keywords(&statement);
        }

        Ok(Procedure {
            id: format!("p_{}", content_hash(&statement.to_lowercase())),
            statement,
            procedure_type: self.procedure_type,
            trigger_keywords,
            trigger_contexts: clean(self.trigger_contexts),
            confidence: self
                .confidence
                .filter(|c| c.is_finite())
                .unwrap_or(0.5)
                .clamp(MIN_CONFIDENCE, MAX_CONFIDENCE),
            stability: 1.0,
            applications: 0,
            contradictions: 0,
            review: ReviewFlag::Clear,
            created_at: now,
            last_applied: None,
        })
    }
}

/// Content words of a statement, used when a draft names no triggers
fn statement_keywords(statement: &str) -> BTreeSet<String> {
    statement
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= MIN_DERIVED_KEYWORD_LEN)
        .filter(|w| !DERIVED_STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// Options for [`find_relevant`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchOptions {
    pub min_score: Option<f64>,
    pub limit: Option<usize>,
    /// Leave procedures latched for review out of the results
    pub exclude_flagged: bool,
}

/// A procedure that matched a query
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureMatch {
    pub procedure: Procedure,
    pub score: f64,
    pub flagged: bool,
}

/// Score, filter, sort and truncate procedures against a query.
///
/// `default_min_score` and `default_limit` apply when the options leave them unset.
pub fn find_relevant(
    procedures: impl IntoIterator<Item = Procedure>,
    query: &str,
    contexts: &[String],
    options: &MatchOptions,
    default_min_score: f64,
    default_limit: usize,
    now: DateTime<Utc>,
) -> Vec<ProcedureMatch> {
    let min_score = options.min_score.unwrap_or(default_min_score);
    let limit = options.limit.unwrap_or(default_limit);

    let mut matches: Vec<ProcedureMatch> = procedures
        .into_iter()
        .filter(|p| !(options.exclude_flagged && p.flagged_for_review()))
        .filter_map(|procedure| {
            let score = procedure.score(query, contexts, now);
            let flagged = procedure.flagged_for_review();
            (score >= min_score).then_some(ProcedureMatch {
                procedure,
                score,
                flagged,
            })
        })
        .collect();

    matches.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches.truncate(limit);
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn procedure(confidence: f64) -> Procedure {
        ProcedureDraft::new("Run migrations before deploying")
            .keywords(["deploy", "migration", "release notes"])
            .contexts(["backend"])
            .confidence(confidence)
            .into_procedure(Utc::now())
            .unwrap()
    }

    #[test]
    fn test_three_negatives_flag_for_review() {
        let mut p = procedure(0.5);
        for _ in 0..3 {
            p.apply(Feedback::Negative, Utc::now());
        }
        assert!((p.confidence - 0.256).abs() < 1e-9);
        assert_eq!(p.contradictions, 3);
        assert!(p.flagged_for_review());
    }

    #[test]
    fn test_flag_is_sticky() {
        let mut p = procedure(0.5);
        for _ in 0..3 {
            p.apply(Feedback::Negative, Utc::now());
        }
        let ReviewFlag::Flagged { since } = p.review else {
            panic!("expected flag");
        };
        for _ in 0..50 {
            p.apply(Feedback::Positive, Utc::now());
        }
        assert!(p.confidence > 0.9);
        assert!(p.confidence <= MAX_CONFIDENCE);
        assert_eq!(p.review, ReviewFlag::Flagged { since });
    }

    #[test]
    fn test_confidence_and_stability_bounds() {
        let mut p = procedure(0.99);
        for _ in 0..100 {
            p.apply(Feedback::Positive, Utc::now());
        }
        assert_eq!(p.confidence, MAX_CONFIDENCE);
        assert_eq!(p.stability, MAX_STABILITY);
        assert_eq!(p.applications, 100);

        for _ in 0..100 {
            p.apply(Feedback::Negative, Utc::now());
        }
        assert_eq!(p.confidence, MIN_CONFIDENCE);
        assert_eq!(p.stability, 0.0);
    }

    #[test]
    fn test_not_flagged_while_confident() {
        let mut p = procedure(0.99);
        for _ in 0..3 {
            p.apply(Feedback::Negative, Utc::now());
        }
        // 0.99 * 0.8^3 ≈ 0.507
        assert!(!p.flagged_for_review());
    }

    #[test]
    fn test_score_formula() {
        let p = procedure(0.5);
        let now = Utc::now();
        // 1 of 3 keywords, context hit: (0.7/3 + 0.3) * 0.5
        let score = p.score("how do I deploy", &["Backend".to_string()], now);
        assert!((score - (0.7 / 3.0 + 0.3) * 0.5).abs() < 1e-9);

        // multi-word keyword matches as a phrase
        let score = p.score("write release notes and deploy migration", &[], now);
        assert!((score - 0.7 * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_recency_penalty_floors_at_half() {
        let mut p = procedure(0.8);
        let now = Utc::now();
        let fresh = p.score("deploy migration release notes", &["backend".into()], now);
        p.last_applied = Some(now - Duration::days(3650));
        let stale = p.score("deploy migration release notes", &["backend".into()], now);
        assert!((stale - fresh * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_find_relevant_filters_and_sorts() {
        let now = Utc::now();
        let strong = procedure(0.9);
        let weak = ProcedureDraft::new("Prefer small PRs")
            .keywords(["review", "deploy"])
            .confidence(0.2)
            .into_procedure(now)
            .unwrap();
        let unrelated = ProcedureDraft::new("Water the plants")
            .keywords(["garden"])
            .into_procedure(now)
            .unwrap();

        let found = find_relevant(
            vec![weak, unrelated, strong.clone()],
            "deploy migration",
            &["backend".to_string()],
            &MatchOptions::default(),
            0.3,
            5,
            now,
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].procedure.id, strong.id);
    }

    #[test]
    fn test_draft_validation() {
        let err = ProcedureDraft::new("   ")
            .keywords(["x"])
            .into_procedure(Utc::now());
        assert!(matches!(err, Err(GraphError::Validation(_))));

    }

    #[test]
    fn test_keywords_fall_back_to_statement() {
        let now = Utc::now();
        let p = ProcedureDraft::new("Run the migrations before deploying, with care")
            .into_procedure(now)
            .unwrap();
        let expected: BTreeSet<String> = ["before", "care", "deploying", "migrations"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(p.trigger_keywords, expected);
        assert!(p.score("migrations before deploying", &[], now) > 0.0);
    }

    #[test]
    fn test_flagged_procedures_still_match() {
        let now = Utc::now();
        let mut p = procedure(0.5);
        for _ in 0..3 {
            p.apply(Feedback::Negative, now);
        }
        for _ in 0..40 {
            p.apply(Feedback::Positive, now);
        }
        assert!(p.flagged_for_review());

        let found = find_relevant(
            vec![p.clone()],
            "deploy migration",
            &["backend".to_string()],
            &MatchOptions::default(),
            0.3,
            5,
            now,
        );
        assert_eq!(found.len(), 1);
        assert!(found[0].flagged);

        let options = MatchOptions {
            exclude_flagged: true,
            ..Default::default()
        };
        let found = find_relevant(vec![p], "deploy migration", &["backend".to_string()], &options, 0.3, 5, now);
        assert!(found.is_empty());
    }
}
