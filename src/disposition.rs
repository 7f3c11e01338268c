use crate::aggregator::{Aggregator, OutputRecord};
use crate::error::{NormalizerError, Result};
use crate::review::ReviewQueueSnapshot;
use crate::schema::{ConceptId, MatchMethod, NormalizedValue};
use crate::taxonomy::Taxonomy;
use crate::text::normalize_label;
use crate::units::UnitNormalizer;
use log::{debug, info};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A reviewer's decision on the output of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReviewDisposition {
    /// Use a review item's value for a concept.
    Assign {
        #[schemars(description = "Zero-based position of the item in the review queue snapshot.")]
        item_index: usize,
        concept_id: ConceptId,
    },

    /// Enter a value directly, in yen.
    SetValue {
        concept_id: ConceptId,
        amount: Decimal,
        #[serde(default)]
        note: Option<String>,
    },

    /// Acknowledge an item without using it.
    Dismiss { item_index: usize, note: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnappliedDisposition {
    pub disposition: ReviewDisposition,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DismissedItem {
    pub item_index: usize,
    pub note: String,
}

/// A value a reviewer typed in, with the reason they gave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnteredValue {
    pub concept_id: ConceptId,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispositionOutcome {
    pub record: OutputRecord,
    pub entered: Vec<EnteredValue>,
    pub dismissed: Vec<DismissedItem>,
    pub unapplied: Vec<UnappliedDisposition>,
}

/// Applies reviewer decisions in order and returns a new record. The input
/// record is left untouched.
pub fn apply_dispositions(
    record: &OutputRecord,
    review: &ReviewQueueSnapshot,
    dispositions: &[ReviewDisposition],
    taxonomy: &Taxonomy,
    normalizer: &UnitNormalizer,
) -> Result<DispositionOutcome> {
    if record.taxonomy_version != taxonomy.version() {
        return Err(NormalizerError::TaxonomyMismatch {
            record: record.taxonomy_version.clone(),
            taxonomy: taxonomy.version().to_string(),
        });
    }

    let mut values = record.values.clone();
    let mut entered = Vec::new();
    let mut dismissed = Vec::new();
    let mut unapplied = Vec::new();

    for disposition in dispositions {
        let applied = match disposition {
            ReviewDisposition::Assign {
                item_index,
                concept_id,
            } => assign(review, *item_index, concept_id, taxonomy, normalizer).map(|value| {
                debug!("Assigned review item {} to {}", item_index, concept_id);
                values.insert(concept_id.clone(), value);
            }),

            ReviewDisposition::SetValue {
                concept_id,
                amount,
                note,
            } => match taxonomy.concept(concept_id) {
                Some(_) => {
                    debug!("Set {} to {} by review", concept_id, amount);
                    values.insert(
                        concept_id.clone(),
                        NormalizedValue {
                            concept_id: concept_id.clone(),
                            amount_in_canonical_unit: *amount,
                            sign_applied: false,
                            unit_confirmed: true,
                            match_method: MatchMethod::Manual,
                            confidence: 1.0,
                            provenance: Vec::new(),
                        },
                    );
                    entered.push(EnteredValue {
                        concept_id: concept_id.clone(),
                        note: note.clone(),
                    });
                    Ok(())
                }
                None => Err(format!("unknown concept '{}'", concept_id)),
            },

            ReviewDisposition::Dismiss { item_index, note } => {
                if *item_index < review.len() {
                    dismissed.push(DismissedItem {
                        item_index: *item_index,
                        note: note.clone(),
                    });
                    Ok(())
                } else {
                    Err(format!("no review item at index {}", item_index))
                }
            }
        };

        if let Err(reason) = applied {
            debug!("Disposition not applied: {}", reason);
            unapplied.push(UnappliedDisposition {
                disposition: disposition.clone(),
                reason,
            });
        }
    }

    let updated = Aggregator::aggregate(values, taxonomy);
    info!(
        "Applied {} of {} dispositions; {} required concepts still missing",
        dispositions.len() - unapplied.len(),
        dispositions.len(),
        updated.missing_required.len()
    );

    Ok(DispositionOutcome {
        record: updated,
        entered,
        dismissed,
        unapplied,
    })
}

fn assign(
    review: &ReviewQueueSnapshot,
    item_index: usize,
    concept_id: &str,
    taxonomy: &Taxonomy,
    normalizer: &UnitNormalizer,
) -> std::result::Result<NormalizedValue, String> {
    let item = review
        .items
        .get(item_index)
        .ok_or_else(|| format!("no review item at index {}", item_index))?;
    let concept = taxonomy
        .concept(concept_id)
        .ok_or_else(|| format!("unknown concept '{}'", concept_id))?;
    let candidate = &item.candidate;

    let mut amount = normalizer
        .normalize(
            &candidate.raw_value,
            candidate.raw_unit_token.as_deref(),
            &candidate.raw_label,
            concept.expected_sign,
        )
        .map_err(|e| e.to_string())?;

    let is_loss_label = taxonomy
        .lookup_label(&normalize_label(&candidate.raw_label))
        .map(|found| found.negated && found.concept.id == concept.id)
        .unwrap_or(false);
    if is_loss_label {
        amount = amount.negated_for_loss_label();
    }

    Ok(NormalizedValue {
        concept_id: concept.id.clone(),
        amount_in_canonical_unit: amount.amount,
        sign_applied: amount.sign_applied(),
        unit_confirmed: amount.unit_confirmed(),
        match_method: MatchMethod::Manual,
        confidence: 1.0,
        provenance: vec![candidate.source_location.clone()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::{ReviewItem, ReviewQueue, ReviewReason};
    use crate::schema::{Candidate, SourceLocation};
    use std::collections::BTreeMap;

    fn review() -> ReviewQueueSnapshot {
        let mut queue = ReviewQueue::new();
        queue.enqueue(ReviewItem::new(
            &Candidate::new("Sales", "1,000", Some("千円"), SourceLocation::new("PL", "C3")),
            ReviewReason::Unmatched,
        ));
        queue.enqueue(ReviewItem::new(
            &Candidate::new("営業損失", 300, Some("千円"), SourceLocation::new("PL", "C9")),
            ReviewReason::LowConfidence,
        ));
        queue.snapshot()
    }

    fn empty_record(taxonomy: &Taxonomy) -> OutputRecord {
        Aggregator::aggregate(BTreeMap::new(), taxonomy)
    }

    #[test]
    fn test_assign_normalizes_the_item_value() {
        let taxonomy = Taxonomy::builtin().unwrap();
        let record = empty_record(&taxonomy);
        let outcome = apply_dispositions(
            &record,
            &review(),
            &[ReviewDisposition::Assign {
                item_index: 0,
                concept_id: "revenue".to_string(),
            }],
            &taxonomy,
            &UnitNormalizer::new(),
        )
        .unwrap();

        let value = outcome.record.value("revenue").unwrap();
        assert_eq!(value.amount_in_canonical_unit, Decimal::from(1_000_000));
        assert_eq!(value.match_method, MatchMethod::Manual);
        assert_eq!(value.provenance, vec![SourceLocation::new("PL", "C3")]);
        assert!(!outcome.record.missing_required.contains(&"revenue".to_string()));
        assert!(record.values.is_empty());
    }

    #[test]
    fn test_assign_keeps_loss_label_polarity() {
        let taxonomy = Taxonomy::builtin().unwrap();
        let outcome = apply_dispositions(
            &empty_record(&taxonomy),
            &review(),
            &[ReviewDisposition::Assign {
                item_index: 1,
                concept_id: "operating_income".to_string(),
            }],
            &taxonomy,
            &UnitNormalizer::new(),
        )
        .unwrap();

        let value = outcome.record.value("operating_income").unwrap();
        assert_eq!(value.amount_in_canonical_unit, Decimal::from(-300_000));
        assert!(value.sign_applied);
    }

    #[test]
    fn test_set_value_and_dismiss() {
        let taxonomy = Taxonomy::builtin().unwrap();
        let outcome = apply_dispositions(
            &empty_record(&taxonomy),
            &review(),
            &[
                ReviewDisposition::SetValue {
                    concept_id: "net_income".to_string(),
                    amount: Decimal::from(42),
                    note: Some("from the notes".to_string()),
                },
                ReviewDisposition::Dismiss {
                    item_index: 0,
                    note: "English duplicate of 売上高".to_string(),
                },
            ],
            &taxonomy,
            &UnitNormalizer::new(),
        )
        .unwrap();

        assert_eq!(outcome.record.amount("net_income"), Some(Decimal::from(42)));
        assert_eq!(
            outcome.entered,
            vec![EnteredValue {
                concept_id: "net_income".to_string(),
                note: Some("from the notes".to_string()),
            }]
        );
        assert_eq!(outcome.dismissed.len(), 1);
        assert_eq!(outcome.dismissed[0].note, "English duplicate of 売上高");
        assert!(outcome.unapplied.is_empty());
    }

    #[test]
    fn test_invalid_dispositions_are_reported() {
        let taxonomy = Taxonomy::builtin().unwrap();
        let outcome = apply_dispositions(
            &empty_record(&taxonomy),
            &review(),
            &[
                ReviewDisposition::Assign {
                    item_index: 9,
                    concept_id: "revenue".to_string(),
                },
                ReviewDisposition::SetValue {
                    concept_id: "goodwill".to_string(),
                    amount: Decimal::ONE,
                    note: None,
                },
                ReviewDisposition::Dismiss {
                    item_index: 2,
                    note: String::new(),
                },
            ],
            &taxonomy,
            &UnitNormalizer::new(),
        )
        .unwrap();

        assert_eq!(outcome.unapplied.len(), 3);
        assert!(outcome.entered.is_empty());
        assert!(outcome.record.values.is_empty());
    }

    #[test]
    fn test_dispositions_parse_from_json() {
        let json = r#"[
            { "action": "assign", "item_index": 0, "concept_id": "revenue" },
            { "action": "set_value", "concept_id": "ebit", "amount": "1500" },
            { "action": "dismiss", "item_index": 1, "note": "checked" }
        ]"#;
        let dispositions: Vec<ReviewDisposition> = serde_json::from_str(json).unwrap();
        assert_eq!(dispositions.len(), 3);
        assert!(matches!(dispositions[1], ReviewDisposition::SetValue { .. }));
    }

    #[test]
    fn test_taxonomy_mismatch_is_an_error() {
        let taxonomy = Taxonomy::builtin().unwrap();
        let mut record = empty_record(&taxonomy);
        record.taxonomy_version = "jp-pl-2024.1".to_string();

        let result = apply_dispositions(&record, &review(), &[], &taxonomy, &UnitNormalizer::new());
        assert!(matches!(result, Err(NormalizerError::TaxonomyMismatch { .. })));
    }
}
