use crate::config::EngineConfig;
use crate::matcher::MatchResult;
use crate::review::{ReviewItem, ReviewQueue, ReviewReason};
use crate::schema::{ConceptId, NormalizedValue, SuggestedConcept};
use crate::units::NormalizedAmount;
use log::{debug, warn};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Absorbs binary rounding in confidence differences such as `1.0 - 0.8`.
const CONFIDENCE_EPSILON: f64 = 1e-9;

/// Matched, normalized candidates grouped by concept, in input order.
pub type MatchedAmounts<'a> = BTreeMap<ConceptId, Vec<(MatchResult<'a>, NormalizedAmount)>>;

/// Candidates of one concept whose amounts agree within tolerance.
struct Cluster {
    amount: Decimal,
    members: Vec<usize>,
    confidence: f64,
}

pub struct ConflictResolver {
    duplicate_tolerance: Decimal,
    confidence_margin: f64,
}

impl ConflictResolver {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            duplicate_tolerance: config.duplicate_tolerance,
            confidence_margin: config.confidence_margin,
        }
    }

    /// Decides one value per concept. Candidates that cannot be settled are
    /// enqueued for review and their concept is left out of the result.
    pub fn resolve(
        &self,
        grouped: &MatchedAmounts<'_>,
        queue: &mut ReviewQueue,
    ) -> BTreeMap<ConceptId, NormalizedValue> {
        let mut resolved = BTreeMap::new();

        for (concept_id, entries) in grouped {
            if entries.is_empty() {
                continue;
            }

            let mut clusters = self.cluster(entries);

            if clusters.len() == 1 {
                let value = merge(concept_id, entries, &clusters[0]);
                if clusters[0].members.len() > 1 {
                    debug!(
                        "{}: merged {} duplicate mentions of {}",
                        concept_id,
                        clusters[0].members.len(),
                        value.amount_in_canonical_unit
                    );
                }
                resolved.insert(concept_id.clone(), value);
                continue;
            }

            // Stable: clusters with equal confidence keep first-seen order.
            clusters.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            let lead = clusters[0].confidence - clusters[1].confidence;

            if lead + CONFIDENCE_EPSILON >= self.confidence_margin {
                let winner = merge(concept_id, entries, &clusters[0]);
                for loser in &clusters[1..] {
                    for &i in &loser.members {
                        let (result, amount) = &entries[i];
                        queue.enqueue(
                            ReviewItem::new(result.candidate, ReviewReason::Superseded)
                                .with_suggestions(vec![SuggestedConcept {
                                    concept_id: concept_id.clone(),
                                    score: result.effective_confidence(),
                                }])
                                .with_detail(format!(
                                    "{} kept {} (confidence {:.2}) over this value {} (confidence {:.2})",
                                    concept_id,
                                    winner.amount_in_canonical_unit,
                                    winner.confidence,
                                    amount.amount,
                                    result.effective_confidence()
                                )),
                        );
                    }
                }
                debug!(
                    "{}: kept {} over {} lower-confidence value(s)",
                    concept_id,
                    winner.amount_in_canonical_unit,
                    clusters.len() - 1
                );
                resolved.insert(concept_id.clone(), winner);
                continue;
            }

            let amounts: Vec<String> = clusters.iter().map(|c| c.amount.to_string()).collect();
            warn!(
                "{}: conflicting values {} left unresolved",
                concept_id,
                amounts.join(" vs ")
            );
            for (result, _) in entries {
                queue.enqueue(
                    ReviewItem::new(result.candidate, ReviewReason::Conflicting)
                        .with_suggestions(vec![SuggestedConcept {
                            concept_id: concept_id.clone(),
                            score: result.effective_confidence(),
                        }])
                        .with_detail(format!(
                            "{} has conflicting values: {}",
                            concept_id,
                            amounts.join(" vs ")
                        )),
                );
            }
        }

        resolved
    }

    fn cluster(&self, entries: &[(MatchResult<'_>, NormalizedAmount)]) -> Vec<Cluster> {
        let mut clusters: Vec<Cluster> = Vec::new();

        for (i, (result, amount)) in entries.iter().enumerate() {
            let confidence = result.effective_confidence();
            let existing = clusters
                .iter_mut()
                .find(|c| (c.amount - amount.amount).abs() <= self.duplicate_tolerance);

            match existing {
                Some(cluster) => {
                    cluster.members.push(i);
                    cluster.confidence = cluster.confidence.max(confidence);
                }
                None => clusters.push(Cluster {
                    amount: amount.amount,
                    members: vec![i],
                    confidence,
                }),
            }
        }

        clusters
    }
}

/// One value from a cluster of agreeing mentions: the most confident member
/// supplies the figure, every member contributes provenance.
fn merge(
    concept_id: &str,
    entries: &[(MatchResult<'_>, NormalizedAmount)],
    cluster: &Cluster,
) -> NormalizedValue {
    let mut representative = cluster.members[0];
    for &i in &cluster.members[1..] {
        if entries[i].0.effective_confidence() > entries[representative].0.effective_confidence() {
            representative = i;
        }
    }

    let (result, amount) = &entries[representative];
    NormalizedValue {
        concept_id: concept_id.to_string(),
        amount_in_canonical_unit: amount.amount,
        sign_applied: amount.sign_applied(),
        unit_confirmed: cluster.members.iter().any(|&i| entries[i].1.unit_confirmed()),
        match_method: result.match_method,
        confidence: result.effective_confidence(),
        provenance: cluster
            .members
            .iter()
            .map(|&i| entries[i].0.candidate.source_location.clone())
            .collect(),
    }
}
