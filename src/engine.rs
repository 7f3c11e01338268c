//! Run orchestration: candidates in, output record and review queue out.
//!
//! Matching and unit normalization are pure functions of one candidate and the
//! read-only taxonomy, so they fan out across candidates with rayon. Conflict
//! resolution, aggregation and identity checks need the complete candidate set
//! and run only after every candidate of the run has been routed.

use crate::aggregator::{Aggregator, OutputRecord};
use crate::config::EngineConfig;
use crate::error::{NormalizerError, Result};
use crate::extraction::{CandidateExtractor, ExtractionOutcome, SheetInput};
use crate::identities::{verify_identities, IdentityDiscrepancy};
use crate::matcher::{LineItemMatcher, MatchResult};
use crate::resolver::{ConflictResolver, MatchedAmounts};
use crate::review::{ReviewItem, ReviewQueue, ReviewQueueSnapshot, ReviewReason};
use crate::schema::{Candidate, SuggestedConcept};
use crate::taxonomy::{Taxonomy, TaxonomyRegistry};
use crate::units::{NormalizedAmount, SignAdjustment, UnitNormalizer};
use log::{debug, info, warn};
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Everything a run produces. Review items are returned alongside the
/// record even when required concepts are missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub output: OutputRecord,
    pub review: ReviewQueueSnapshot,
    pub discrepancies: Vec<IdentityDiscrepancy>,
}

impl RunOutput {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub source: String,
    pub status: BatchStatus,
    pub extracted_items: usize,
    pub output: Option<RunOutput>,
    pub error: Option<String>,
}

/// Per-workbook results of a batch, in submission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub taxonomy_version: String,
    pub entries: Vec<BatchEntry>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == BatchStatus::Success)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.entries.len() - self.succeeded()
    }

    pub fn total_extracted_items(&self) -> usize {
        self.entries.iter().map(|e| e.extracted_items).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("# Batch Report ({})\n\n", self.taxonomy_version));
        output.push_str(&format!(
            "- Files: {} succeeded, {} failed\n- Extracted items: {}\n\n",
            self.succeeded(),
            self.failed(),
            self.total_extracted_items()
        ));

        output.push_str("| Source | Status | Items | Missing Required | Review Items | Needing Decision |\n");
        output.push_str("|---|---|---|---|---|---|\n");
        for entry in &self.entries {
            let (missing, review, open) = match &entry.output {
                Some(run) => (
                    run.output.missing_required.len().to_string(),
                    run.review.len().to_string(),
                    run.review.needing_decision().to_string(),
                ),
                None => ("-".to_string(), "-".to_string(), "-".to_string()),
            };
            let status = match entry.status {
                BatchStatus::Success => "success".to_string(),
                BatchStatus::Failed => format!(
                    "failed: {}",
                    entry.error.as_deref().unwrap_or("unknown error")
                ),
            };
            output.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} |\n",
                entry.source, status, entry.extracted_items, missing, review, open
            ));
        }

        output
    }
}

/// Outcome of matching and normalizing one candidate.
enum Routed<'a> {
    Accepted(MatchResult<'a>, NormalizedAmount),
    Review(ReviewItem),
}

pub struct Engine {
    registry: TaxonomyRegistry,
    config: EngineConfig,
    normalizer: UnitNormalizer,
}

impl Engine {
    pub fn new(registry: TaxonomyRegistry, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            registry,
            config,
            normalizer: UnitNormalizer::new(),
        })
    }

    /// An engine over the built-in taxonomy with default thresholds.
    pub fn with_builtin() -> Result<Self> {
        Self::new(TaxonomyRegistry::with_builtin()?, EngineConfig::default())
    }

    pub fn with_normalizer(mut self, normalizer: UnitNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaxonomyRegistry {
        &self.registry
    }

    pub fn normalizer(&self) -> &UnitNormalizer {
        &self.normalizer
    }

    /// Normalizes one source's extraction outcome. A failed extraction is the
    /// only condition that yields no output record.
    pub fn run(
        &self,
        source: &str,
        extraction: ExtractionOutcome,
        taxonomy_version: &str,
    ) -> Result<RunOutput> {
        let taxonomy = self.registry.get(taxonomy_version)?;
        let candidates = extraction.map_err(|e| NormalizerError::ExtractionFailed {
            sheet: source.to_string(),
            reason: e.to_string(),
        })?;
        Ok(self.run_with_taxonomy(&candidates, &taxonomy))
    }

    /// Extracts every sheet, then normalizes the pooled candidates as one run.
    pub fn run_sheets(
        &self,
        extractor: &dyn CandidateExtractor,
        sheets: &[SheetInput],
        taxonomy_version: &str,
    ) -> Result<RunOutput> {
        let taxonomy = self.registry.get(taxonomy_version)?;

        let outcomes: Vec<ExtractionOutcome> =
            sheets.par_iter().map(|sheet| extractor.extract(sheet)).collect();

        let mut candidates = Vec::new();
        for (sheet, outcome) in sheets.iter().zip(outcomes) {
            let extracted = outcome.map_err(|e| NormalizerError::ExtractionFailed {
                sheet: sheet.sheet_id.clone(),
                reason: e.to_string(),
            })?;
            candidates.extend(extracted);
        }

        Ok(self.run_with_taxonomy(&candidates, &taxonomy))
    }

    /// Processes several workbooks independently. A failed workbook is
    /// recorded and never affects the others.
    pub fn run_batch(
        &self,
        sources: Vec<(String, ExtractionOutcome)>,
        taxonomy_version: &str,
    ) -> Result<BatchReport> {
        let taxonomy = self.registry.get(taxonomy_version)?;

        let entries: Vec<BatchEntry> = sources
            .into_par_iter()
            .map(|(source, outcome)| match outcome {
                Ok(candidates) => BatchEntry {
                    extracted_items: candidates.len(),
                    output: Some(self.run_with_taxonomy(&candidates, &taxonomy)),
                    source,
                    status: BatchStatus::Success,
                    error: None,
                },
                Err(e) => {
                    let error = NormalizerError::ExtractionFailed {
                        sheet: source.clone(),
                        reason: e.to_string(),
                    };
                    warn!("{}", error);
                    BatchEntry {
                        source,
                        status: BatchStatus::Failed,
                        extracted_items: 0,
                        output: None,
                        error: Some(error.to_string()),
                    }
                }
            })
            .collect();

        let report = BatchReport {
            taxonomy_version: taxonomy.version().to_string(),
            entries,
        };
        info!(
            "Batch finished: {} succeeded, {} failed, {} items extracted",
            report.succeeded(),
            report.failed(),
            report.total_extracted_items()
        );
        Ok(report)
    }

    /// The deterministic core of a run. Identical candidates and taxonomy
    /// always produce an identical `RunOutput`.
    pub fn run_with_taxonomy(&self, candidates: &[Candidate], taxonomy: &Taxonomy) -> RunOutput {
        let matcher = LineItemMatcher::new(taxonomy, &self.config);

        let routed: Vec<Routed<'_>> = candidates
            .par_iter()
            .map(|candidate| self.route(&matcher, taxonomy, candidate))
            .collect();

        // Barrier: everything below sees the complete candidate set.
        let typical = median_magnitude(routed.iter().filter_map(|r| match r {
            Routed::Accepted(_, amount) => Some(amount.amount),
            Routed::Review(_) => None,
        }));

        let mut queue = ReviewQueue::new();
        let mut grouped: MatchedAmounts<'_> = MatchedAmounts::new();

        for routed in routed {
            match routed {
                Routed::Review(item) => queue.enqueue(item),
                Routed::Accepted(result, amount) => {
                    if let Some(item) = self.sign_anomaly(&result, &amount, typical) {
                        queue.enqueue(item);
                    }
                    if let Some(concept_id) = result.concept_id.clone() {
                        grouped.entry(concept_id).or_default().push((result, amount));
                    }
                }
            }
        }

        let resolved = ConflictResolver::new(&self.config).resolve(&grouped, &mut queue);
        let output = Aggregator::aggregate(resolved, taxonomy);
        let discrepancies = verify_identities(&output, taxonomy, self.config.identity_tolerance);
        let review = queue.snapshot();

        info!(
            "Run on taxonomy {}: {} candidates, {} concepts resolved, {} missing required, {} review items, {} identity discrepancies",
            taxonomy.version(),
            candidates.len(),
            output.values.len(),
            output.missing_required.len(),
            review.len(),
            discrepancies.len()
        );

        RunOutput {
            output,
            review,
            discrepancies,
        }
    }

    fn route<'a>(
        &self,
        matcher: &LineItemMatcher<'_>,
        taxonomy: &Taxonomy,
        candidate: &'a Candidate,
    ) -> Routed<'a> {
        let result = matcher.match_candidate(candidate);

        let Some(concept) = result
            .concept_id
            .as_deref()
            .and_then(|id| taxonomy.concept(id))
        else {
            let detail = if result.ambiguous {
                "no single concept stands out".to_string()
            } else {
                format!("best match score {:.2}", result.match_confidence)
            };
            debug!("{} '{}' unmatched: {}", candidate.source_location, candidate.raw_label, detail);
            return Routed::Review(
                ReviewItem::new(candidate, ReviewReason::Unmatched)
                    .with_suggestions(result.suggestions)
                    .with_detail(detail),
            );
        };

        let matched = vec![SuggestedConcept {
            concept_id: concept.id.clone(),
            score: result.effective_confidence(),
        }];

        if result.effective_confidence() < self.config.acceptance_threshold {
            debug!(
                "{} '{}' -> {} held back: confidence {:.2}",
                candidate.source_location,
                candidate.raw_label,
                concept.id,
                result.effective_confidence()
            );
            return Routed::Review(
                ReviewItem::new(candidate, ReviewReason::LowConfidence)
                    .with_suggestions(matched)
                    .with_detail(format!(
                        "match {:.2} x extraction {:.2} is below {:.2}",
                        result.match_confidence,
                        candidate.bounded_extraction_confidence(),
                        self.config.acceptance_threshold
                    )),
            );
        }

        let amount = match self.normalizer.normalize(
            &candidate.raw_value,
            candidate.raw_unit_token.as_deref(),
            &candidate.raw_label,
            concept.expected_sign,
        ) {
            Ok(amount) if result.negated => amount.negated_for_loss_label(),
            Ok(amount) => amount,
            Err(e) => {
                debug!("{} '{}' -> {}: {}", candidate.source_location, candidate.raw_label, concept.id, e);
                return Routed::Review(
                    ReviewItem::new(candidate, ReviewReason::Unparseable)
                        .with_suggestions(matched)
                        .with_detail(e.to_string()),
                );
            }
        };

        debug!(
            "{} '{}' -> {} = {} ({:?})",
            candidate.source_location, candidate.raw_label, concept.id, amount.amount, result.match_method
        );
        Routed::Accepted(result, amount)
    }

    fn sign_anomaly(
        &self,
        result: &MatchResult<'_>,
        amount: &NormalizedAmount,
        typical: Option<Decimal>,
    ) -> Option<ReviewItem> {
        if amount.sign_adjustment != SignAdjustment::ExpectedSign {
            return None;
        }
        let typical = typical.filter(|t| !t.is_zero())?;
        let limit = typical.checked_mul(self.config.sign_anomaly_ratio)?;
        if amount.amount.abs() <= limit {
            return None;
        }

        let concept_id = result.concept_id.clone()?;
        warn!(
            "{}: sign of {} flipped for {} with magnitude above {} x typical {}",
            result.candidate.source_location,
            amount.amount,
            concept_id,
            self.config.sign_anomaly_ratio,
            typical
        );
        Some(
            ReviewItem::new(result.candidate, ReviewReason::SignAnomaly)
                .with_suggestions(vec![SuggestedConcept {
                    concept_id,
                    score: result.effective_confidence(),
                }])
                .with_detail(format!(
                    "sign flipped to {}; typical magnitude in this run is {}",
                    amount.amount, typical
                )),
        )
    }
}

/// Median absolute amount, or `None` when there are no amounts.
/// Median absolute amount, ignoring zeros: a sheet of mostly blank lines
/// still has a typical scale set by its non-zero entries.
fn median_magnitude(amounts: impl Iterator<Item = Decimal>) -> Option<Decimal> {
    let mut magnitudes: Vec<Decimal> = amounts.filter(|a| !a.is_zero()).map(|a| a.abs()).collect();
    if magnitudes.is_empty() {
        return None;
    }
    magnitudes.sort();

    let mid = magnitudes.len() / 2;
    if magnitudes.len() % 2 == 1 {
        Some(magnitudes[mid])
    } else {
        Some((magnitudes[mid - 1] + magnitudes[mid]) / Decimal::TWO)
    }
}
