use crate::error::Result;
use crate::schema::{ConceptId, NormalizedValue, SourceLocation};
use crate::taxonomy::Taxonomy;
use crate::units::CANONICAL_UNIT;
use log::warn;
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-company normalized output keyed by concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct OutputRecord {
    pub taxonomy_version: String,
    pub canonical_unit: String,
    pub values: BTreeMap<ConceptId, NormalizedValue>,
    /// Required concepts with no value, in template order.
    pub missing_required: Vec<ConceptId>,
}

impl OutputRecord {
    pub fn value(&self, concept_id: &str) -> Option<&NormalizedValue> {
        self.values.get(concept_id)
    }

    pub fn amount(&self, concept_id: &str) -> Option<Decimal> {
        self.values.get(concept_id).map(|v| v.amount_in_canonical_unit)
    }

    pub fn is_complete(&self) -> bool {
        self.missing_required.is_empty()
    }

    /// Rows in template order, one per concept, absent values left empty.
    pub fn to_template(&self, taxonomy: &Taxonomy) -> TemplateRecord {
        let rows = taxonomy
            .concepts()
            .iter()
            .map(|concept| {
                let value = self.values.get(&concept.id);
                TemplateRow {
                    concept_id: concept.id.clone(),
                    display_name: concept.display_name.clone(),
                    amount: value.map(|v| v.amount_in_canonical_unit),
                    sign_applied: value.map(|v| v.sign_applied).unwrap_or(false),
                    unit_confirmed: value.map(|v| v.unit_confirmed).unwrap_or(false),
                    provenance: value.map(|v| v.provenance.clone()).unwrap_or_default(),
                }
            })
            .collect();

        TemplateRecord {
            taxonomy_version: self.taxonomy_version.clone(),
            canonical_unit: self.canonical_unit.clone(),
            rows,
            missing_required: self.missing_required.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TemplateRow {
    pub concept_id: ConceptId,
    #[schemars(description = "Template label of the line (e.g. '売上高')")]
    pub display_name: String,
    #[schemars(description = "Amount in yen; null when no value was accepted")]
    pub amount: Option<Decimal>,
    pub sign_applied: bool,
    pub unit_confirmed: bool,
    pub provenance: Vec<SourceLocation>,
}

/// The output record laid out as the fixed reporting template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TemplateRecord {
    pub taxonomy_version: String,
    pub canonical_unit: String,
    pub rows: Vec<TemplateRow>,
    pub missing_required: Vec<ConceptId>,
}

impl TemplateRecord {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(["Concept", "ID", "Amount", "Unit Confirmed", "Source"])?;

        for row in &self.rows {
            let sources: Vec<String> = row.provenance.iter().map(|p| p.to_string()).collect();
            writer.write_record([
                row.display_name.clone(),
                row.concept_id.clone(),
                row.amount.map(|a| a.to_string()).unwrap_or_default(),
                if row.amount.is_some() {
                    row.unit_confirmed.to_string()
                } else {
                    String::new()
                },
                sources.join(" "),
            ])?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!(
            "# Profit & Loss ({}, {})\n\n",
            self.canonical_unit, self.taxonomy_version
        ));

        output.push_str("| Line | Amount | Source |\n");
        output.push_str("|---|---:|---|\n");
        for row in &self.rows {
            let amount = match row.amount {
                Some(a) if !row.unit_confirmed => format!("{} (unit?)", a),
                Some(a) => a.to_string(),
                None => "-".to_string(),
            };
            let sources: Vec<String> = row.provenance.iter().map(|p| p.to_string()).collect();
            output.push_str(&format!(
                "| {} | {} | {} |\n",
                row.display_name,
                amount,
                sources.join(", ")
            ));
        }

        if !self.missing_required.is_empty() {
            output.push_str(&format!(
                "\n**Missing required:** {}\n",
                self.missing_required.join(", ")
            ));
        }

        output
    }
}

/// Assembles resolved values into an output record. Never fills gaps.
pub struct Aggregator;

impl Aggregator {
    pub fn aggregate(
        values: BTreeMap<ConceptId, NormalizedValue>,
        taxonomy: &Taxonomy,
    ) -> OutputRecord {
        let mut values = values;
        values.retain(|concept_id, _| {
            let known = taxonomy.concept(concept_id).is_some();
            if !known {
                warn!(
                    "Dropping value for '{}': not a concept of taxonomy {}",
                    concept_id,
                    taxonomy.version()
                );
            }
            known
        });

        let missing_required: Vec<ConceptId> = taxonomy
            .required_concepts()
            .filter(|c| !values.contains_key(&c.id))
            .map(|c| c.id.clone())
            .collect();

        if !missing_required.is_empty() {
            warn!(
                "Output record incomplete, missing required: {}",
                missing_required.join(", ")
            );
        }

        OutputRecord {
            taxonomy_version: taxonomy.version().to_string(),
            canonical_unit: CANONICAL_UNIT.to_string(),
            values,
            missing_required,
        }
    }
}
