//! Tiered label matching against the canonical taxonomy.
//!
//! Tiers are tried in order and the first hit wins:
//!
//! 1. **Exact**: the folded label equals a display name or synonym (1.0).
//! 2. **Normalized synonym**: the label matches after bracketed annotations,
//!    enumerators and unit suffixes are stripped (0.9).
//! 3. **Fuzzy**: best similarity across every label key of every concept.
//!    Scores under the acceptance threshold, or a runner-up within the
//!    ambiguity margin, leave the candidate unmatched with ranked suggestions.
//!
//! Ranking ties are broken by the lexicographically lowest concept id, so a
//! given label and taxonomy version always produce the same result.

use crate::config::EngineConfig;
use crate::schema::{Candidate, ConceptId, MatchMethod, SuggestedConcept};
use crate::taxonomy::Taxonomy;
use crate::text::{normalize_label, strip_noise};
use log::debug;
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub const EXACT_CONFIDENCE: f64 = 1.0;
pub const NORMALIZED_SYNONYM_CONFIDENCE: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult<'a> {
    pub candidate: &'a Candidate,
    /// Absent when the candidate is unmatched.
    pub concept_id: Option<ConceptId>,
    pub match_confidence: f64,
    /// Tier that produced the result; unmatched results report the fuzzy tier.
    pub match_method: MatchMethod,
    /// The label was a loss synonym, so the value must be negated.
    pub negated: bool,
    /// The fuzzy tier found two concepts too close to call.
    pub ambiguous: bool,
    pub suggestions: Vec<SuggestedConcept>,
}

impl MatchResult<'_> {
    pub fn is_matched(&self) -> bool {
        self.concept_id.is_some()
    }

    /// Match confidence weighted by how sure the extractor was of the pair.
    pub fn effective_confidence(&self) -> f64 {
        self.match_confidence * self.candidate.bounded_extraction_confidence()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ConceptScore<'t> {
    concept_id: &'t str,
    score: f64,
    negated: bool,
}

fn rank(a: &ConceptScore<'_>, b: &ConceptScore<'_>) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.concept_id.cmp(b.concept_id))
}

/// Similarity of two folded labels in 0..=1: the better of normalized edit
/// distance and bigram overlap.
pub fn label_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    strsim::normalized_levenshtein(a, b).max(strsim::sorensen_dice(a, b))
}

pub struct LineItemMatcher<'t> {
    taxonomy: &'t Taxonomy,
    acceptance_threshold: f64,
    ambiguity_margin: f64,
    max_suggestions: usize,
}

impl<'t> LineItemMatcher<'t> {
    pub fn new(taxonomy: &'t Taxonomy, config: &EngineConfig) -> Self {
        Self {
            taxonomy,
            acceptance_threshold: config.acceptance_threshold,
            ambiguity_margin: config.ambiguity_margin,
            max_suggestions: config.max_suggestions,
        }
    }

    pub fn match_candidate<'a>(&self, candidate: &'a Candidate) -> MatchResult<'a> {
        let folded = normalize_label(&candidate.raw_label);

        if let Some(found) = self.taxonomy.lookup_label(&folded) {
            debug!("'{}' matched {} exactly", candidate.raw_label, found.concept.id);
            return MatchResult {
                candidate,
                concept_id: Some(found.concept.id.clone()),
                match_confidence: EXACT_CONFIDENCE,
                match_method: MatchMethod::Exact,
                negated: found.negated,
                ambiguous: false,
                suggestions: Vec::new(),
            };
        }

        let stripped = strip_noise(&folded);
        if let Some(found) = self.taxonomy.lookup_label(&stripped) {
            debug!(
                "'{}' matched {} after stripping to '{}'",
                candidate.raw_label, found.concept.id, stripped
            );
            return MatchResult {
                candidate,
                concept_id: Some(found.concept.id.clone()),
                match_confidence: NORMALIZED_SYNONYM_CONFIDENCE,
                match_method: MatchMethod::NormalizedSynonym,
                negated: found.negated,
                ambiguous: false,
                suggestions: Vec::new(),
            };
        }

        self.match_fuzzy(candidate, &stripped)
    }

    fn match_fuzzy<'a>(&self, candidate: &'a Candidate, key: &str) -> MatchResult<'a> {
        let ranked = self.score_concepts(key);
        let suggestions: Vec<SuggestedConcept> = ranked
            .iter()
            .filter(|s| s.score > 0.0)
            .take(self.max_suggestions)
            .map(|s| SuggestedConcept {
                concept_id: s.concept_id.to_string(),
                score: s.score,
            })
            .collect();

        let unmatched = |ambiguous: bool, confidence: f64, suggestions: Vec<SuggestedConcept>| MatchResult {
            candidate,
            concept_id: None,
            match_confidence: confidence,
            match_method: MatchMethod::Fuzzy,
            negated: false,
            ambiguous,
            suggestions,
        };

        let Some(best) = ranked.first() else {
            return unmatched(false, 0.0, suggestions);
        };

        if best.score < self.acceptance_threshold {
            debug!(
                "'{}' unmatched: best fuzzy score {:.3} for {} is below threshold",
                candidate.raw_label, best.score, best.concept_id
            );
            return unmatched(false, best.score, suggestions);
        }

        if let Some(runner_up) = ranked.get(1) {
            if best.score - runner_up.score < self.ambiguity_margin {
                debug!(
                    "'{}' ambiguous between {} ({:.3}) and {} ({:.3})",
                    candidate.raw_label,
                    best.concept_id,
                    best.score,
                    runner_up.concept_id,
                    runner_up.score
                );
                return unmatched(true, best.score, suggestions);
            }
        }

        debug!(
            "'{}' fuzzily matched {} with score {:.3}",
            candidate.raw_label, best.concept_id, best.score
        );
        MatchResult {
            candidate,
            concept_id: Some(best.concept_id.to_string()),
            match_confidence: best.score,
            match_method: MatchMethod::Fuzzy,
            negated: best.negated,
            ambiguous: false,
            suggestions,
        }
    }

    /// Best score per concept, ranked by score then concept id.
    fn score_concepts(&self, key: &str) -> Vec<ConceptScore<'t>> {
        if key.is_empty() {
            return Vec::new();
        }

        let taxonomy: &'t Taxonomy = self.taxonomy;
        let mut best: BTreeMap<&'t str, ConceptScore<'t>> = BTreeMap::new();
        for (label_key, found) in taxonomy.label_keys() {
            let score = label_similarity(key, label_key);
            let entry = best.entry(found.concept.id.as_str()).or_insert(ConceptScore {
                concept_id: found.concept.id.as_str(),
                score,
                negated: found.negated,
            });
            if score > entry.score {
                entry.score = score;
                entry.negated = found.negated;
            }
        }

        let mut ranked: Vec<ConceptScore<'t>> = best.into_values().collect();
        ranked.sort_by(rank);
        ranked
    }
}
