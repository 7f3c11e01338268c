use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier of a canonical concept (e.g. `revenue`).
pub type ConceptId = String;

pub const DEFAULT_EXTRACTION_CONFIDENCE: f64 = 1.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedSign {
    #[schemars(description = "Reported as a positive amount (revenue, costs shown as positive figures)")]
    Positive,

    #[schemars(description = "Reported as a negative amount")]
    Negative,

    #[schemars(description = "Either sign is legitimate (profit lines that may be losses)")]
    Either,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
pub struct SourceLocation {
    #[schemars(description = "Worksheet name as it appears in the workbook")]
    pub sheet: String,

    #[schemars(description = "A1-style reference of the cell holding the value (e.g. 'C12')")]
    pub cell: String,
}

impl SourceLocation {
    pub fn new(sheet: impl Into<String>, cell: impl Into<String>) -> Self {
        Self {
            sheet: sheet.into(),
            cell: cell.into(),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}!{}", self.sheet, self.cell)
    }
}

/// A value as the extractor saw it: either already numeric, or cell text that
/// still needs parsing (separators, full-width digits, △ negatives).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RawValue {
    Number(Decimal),
    Text(String),
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Number(d) => write!(f, "{}", d),
            RawValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<Decimal> for RawValue {
    fn from(value: Decimal) -> Self {
        RawValue::Number(value)
    }
}

impl From<i32> for RawValue {
    fn from(value: i32) -> Self {
        RawValue::Number(Decimal::from(value))
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Number(Decimal::from(value))
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::Text(value)
    }
}

fn default_extraction_confidence() -> f64 {
    DEFAULT_EXTRACTION_CONFIDENCE
}

/// A raw (label, value) pair observed in a source spreadsheet.
/// This struct is serialized to JSON Schema and handed to extraction oracles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Candidate {
    #[schemars(description = "The row label exactly as written in the sheet (e.g. '売上高（千円）')")]
    pub raw_label: String,

    #[schemars(
        description = "The numeric value next to the label. Either a number or the cell text verbatim (e.g. '△1,234')."
    )]
    pub raw_value: RawValue,

    #[serde(default)]
    #[schemars(
        description = "Unit written near the value or in the sheet header (e.g. '千円', '百万円'). Omit when none is visible."
    )]
    pub raw_unit_token: Option<String>,

    #[schemars(description = "Where the value was read from")]
    pub source_location: SourceLocation,

    #[serde(default = "default_extraction_confidence")]
    #[schemars(description = "Extractor confidence between 0.0 and 1.0. Defaults to 1.0.")]
    pub extraction_confidence: f64,
}

fn bounded_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

impl Candidate {
    pub fn new(
        raw_label: impl Into<String>,
        raw_value: impl Into<RawValue>,
        raw_unit_token: Option<&str>,
        source_location: SourceLocation,
    ) -> Self {
        Self {
            raw_label: raw_label.into(),
            raw_value: raw_value.into(),
            raw_unit_token: raw_unit_token.map(str::to_string),
            source_location,
            extraction_confidence: DEFAULT_EXTRACTION_CONFIDENCE,
        }
    }

    pub fn with_extraction_confidence(mut self, confidence: f64) -> Self {
        self.extraction_confidence = bounded_confidence(confidence);
        self
    }

    /// Extraction confidence as the engine weighs it. Deserialized candidates
    /// may carry any value; NaN counts as no confidence at all.
    pub fn bounded_extraction_confidence(&self) -> f64 {
        bounded_confidence(self.extraction_confidence)
    }

    /// JSON Schema of the candidate list an extraction oracle must return.
    pub fn extraction_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(Vec<Candidate>)
    }

    pub fn extraction_schema_json() -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&Self::extraction_schema())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMethod {
    Exact,
    NormalizedSynonym,
    Fuzzy,
    /// Entered by a reviewer; never produced by the matcher.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SuggestedConcept {
    pub concept_id: ConceptId,
    pub score: f64,
}

/// Final value for one concept, always in the canonical unit (yen).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NormalizedValue {
    pub concept_id: ConceptId,
    pub amount_in_canonical_unit: Decimal,
    /// True when a sign flip was performed (loss label or expected-sign rule).
    pub sign_applied: bool,
    /// False when no unit could be determined and yen was assumed.
    pub unit_confirmed: bool,
    pub match_method: MatchMethod,
    pub confidence: f64,
    pub provenance: Vec<SourceLocation>,
}
