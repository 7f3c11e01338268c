use crate::aggregator::OutputRecord;
use crate::schema::ConceptId;
use crate::taxonomy::{CanonicalConcept, ComponentSign, Taxonomy};
use log::{debug, warn};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A total that disagrees with the sum of its components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IdentityDiscrepancy {
    pub concept_id: ConceptId,
    pub reported: Decimal,
    pub computed: Decimal,
    pub difference: Decimal,
}

/// Checks the statement identities declared by the taxonomy (e.g.
/// `gross_profit = revenue - cost_of_sales`) against an output record.
///
/// An identity is only checked when the total and every component are
/// present. Nothing is corrected; discrepancies are reported to the caller.
pub struct IdentityChecker<'t> {
    taxonomy: &'t Taxonomy,
    tolerance: Decimal,
}

impl<'t> IdentityChecker<'t> {
    pub fn new(taxonomy: &'t Taxonomy, tolerance: Decimal) -> Self {
        Self {
            taxonomy,
            tolerance,
        }
    }

    pub fn verify(&self, record: &OutputRecord) -> Vec<IdentityDiscrepancy> {
        let mut discrepancies = Vec::new();

        for concept in self.taxonomy.concepts() {
            if concept.components.is_empty() {
                continue;
            }

            let Some(reported) = record.amount(&concept.id) else {
                continue;
            };
            let Some(computed) = self.compute(concept, record) else {
                debug!("Skipping identity for {}: a component is absent", concept.id);
                continue;
            };

            let difference = reported - computed;
            if difference.abs() > self.tolerance {
                warn!(
                    "Identity check failed for {}: reported {}, components sum to {} (difference {})",
                    concept.id, reported, computed, difference
                );
                discrepancies.push(IdentityDiscrepancy {
                    concept_id: concept.id.clone(),
                    reported,
                    computed,
                    difference,
                });
            }
        }

        discrepancies
    }

    fn compute(&self, concept: &CanonicalConcept, record: &OutputRecord) -> Option<Decimal> {
        concept
            .components
            .iter()
            .try_fold(Decimal::ZERO, |sum, term| {
                let amount = record.amount(&term.concept_id)?;
                match term.sign {
                    ComponentSign::Add => sum.checked_add(amount),
                    ComponentSign::Subtract => sum.checked_sub(amount),
                }
            })
    }
}

pub fn verify_identities(
    record: &OutputRecord,
    taxonomy: &Taxonomy,
    tolerance: Decimal,
) -> Vec<IdentityDiscrepancy> {
    IdentityChecker::new(taxonomy, tolerance).verify(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregator;
    use crate::schema::{MatchMethod, NormalizedValue, SourceLocation};
    use std::collections::BTreeMap;

    fn record(entries: &[(&str, i64)]) -> OutputRecord {
        let taxonomy = Taxonomy::builtin().unwrap();
        let values: BTreeMap<ConceptId, NormalizedValue> = entries
            .iter()
            .map(|(id, amount)| {
                (
                    id.to_string(),
                    NormalizedValue {
                        concept_id: id.to_string(),
                        amount_in_canonical_unit: Decimal::from(*amount),
                        sign_applied: false,
                        unit_confirmed: true,
                        match_method: MatchMethod::Exact,
                        confidence: 1.0,
                        provenance: vec![SourceLocation::new("PL", "C1")],
                    },
                )
            })
            .collect();
        Aggregator::aggregate(values, &taxonomy)
    }

    #[test]
    fn test_consistent_statement_has_no_discrepancies() {
        let taxonomy = Taxonomy::builtin().unwrap();
        let record = record(&[
            ("revenue", 10_000_000),
            ("cost_of_sales", 6_000_000),
            ("gross_profit", 4_000_000),
            ("sga_expenses", 3_000_000),
            ("operating_income", 1_000_000),
        ]);

        assert!(verify_identities(&record, &taxonomy, Decimal::ONE_THOUSAND).is_empty());
    }

    #[test]
    fn test_inconsistent_total_is_reported() {
        let taxonomy = Taxonomy::builtin().unwrap();
        let record = record(&[
            ("revenue", 10_000_000),
            ("cost_of_sales", 6_000_000),
            ("gross_profit", 5_000_000),
        ]);

        let discrepancies = verify_identities(&record, &taxonomy, Decimal::ONE_THOUSAND);
        assert_eq!(
            discrepancies,
            vec![IdentityDiscrepancy {
                concept_id: "gross_profit".to_string(),
                reported: Decimal::from(5_000_000),
                computed: Decimal::from(4_000_000),
                difference: Decimal::from(1_000_000),
            }]
        );
    }

    #[test]
    fn test_difference_within_tolerance_passes() {
        let taxonomy = Taxonomy::builtin().unwrap();
        let record = record(&[
            ("revenue", 10_000_000),
            ("cost_of_sales", 6_000_000),
            ("gross_profit", 4_000_500),
        ]);

        assert!(verify_identities(&record, &taxonomy, Decimal::ONE_THOUSAND).is_empty());
    }

    #[test]
    fn test_incomplete_identity_is_skipped() {
        let taxonomy = Taxonomy::builtin().unwrap();
        let record = record(&[("revenue", 10_000_000), ("gross_profit", 1)]);

        assert!(verify_identities(&record, &taxonomy, Decimal::ZERO).is_empty());
    }
}
