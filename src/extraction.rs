use crate::error::ExtractionError;
use crate::schema::{Candidate, SourceLocation};
use crate::text::parse_amount;
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// What an extractor hands the engine: candidates, or an explicit failure.
/// An empty list is a valid "nothing found" answer, distinct from failure.
pub type ExtractionOutcome = std::result::Result<Vec<Candidate>, ExtractionError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueCell {
    pub cell: String,
    pub text: String,
}

impl ValueCell {
    pub fn new(cell: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            cell: cell.into(),
            text: text.into(),
        }
    }
}

/// A label cell and the cells to its right, in reading order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellBlock {
    pub label_cell: String,
    pub label: String,
    #[serde(default)]
    pub values: Vec<ValueCell>,
}

impl CellBlock {
    pub fn new(label_cell: impl Into<String>, label: impl Into<String>, values: Vec<ValueCell>) -> Self {
        Self {
            label_cell: label_cell.into(),
            label: label.into(),
            values,
        }
    }
}

/// One worksheet, already read into label/value blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetInput {
    pub sheet_id: String,
    /// Sheet-level unit note such as "(単位：千円)".
    #[serde(default)]
    pub unit_note: Option<String>,
    #[serde(default)]
    pub blocks: Vec<CellBlock>,
}

impl SheetInput {
    pub fn new(sheet_id: impl Into<String>) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            unit_note: None,
            blocks: Vec::new(),
        }
    }

    pub fn with_unit_note(mut self, note: impl Into<String>) -> Self {
        self.unit_note = Some(note.into());
        self
    }

    pub fn with_block(mut self, block: CellBlock) -> Self {
        self.blocks.push(block);
        self
    }
}

/// Turns a sheet into raw candidates. Implementations may be noisy; the
/// engine never retries them.
pub trait CandidateExtractor: Send + Sync {
    fn extract(&self, sheet: &SheetInput) -> ExtractionOutcome;
}

/// Reads the first parseable value to the right of each label.
#[derive(Debug, Clone)]
pub struct AdjacentCellExtractor {
    skip_penalty: f64,
    min_confidence: f64,
}

impl Default for AdjacentCellExtractor {
    fn default() -> Self {
        Self {
            skip_penalty: 0.1,
            min_confidence: 0.5,
        }
    }
}

impl AdjacentCellExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confidence lost for every non-numeric cell skipped before the value.
    pub fn with_skip_penalty(mut self, penalty: f64) -> Self {
        self.skip_penalty = penalty.clamp(0.0, 1.0);
        self
    }

    fn extract_block(&self, sheet: &SheetInput, block: &CellBlock) -> Option<Candidate> {
        if block.label.trim().is_empty() {
            return None;
        }

        let mut skipped = 0usize;
        for value in &block.values {
            if value.text.trim().is_empty() {
                skipped += 1;
                continue;
            }

            let Ok(parsed) = parse_amount(&value.text) else {
                skipped += 1;
                continue;
            };

            // A unit written in the cell itself beats the sheet note.
            let unit_token = match parsed.embedded_unit {
                Some(_) => None,
                None => sheet.unit_note.as_deref(),
            };
            let confidence = (1.0 - self.skip_penalty * skipped as f64).max(self.min_confidence);

            return Some(
                Candidate::new(
                    block.label.clone(),
                    value.text.clone(),
                    unit_token,
                    SourceLocation::new(sheet.sheet_id.clone(), value.cell.clone()),
                )
                .with_extraction_confidence(confidence),
            );
        }

        debug!(
            "No numeric cell next to '{}' at {}!{}",
            block.label, sheet.sheet_id, block.label_cell
        );
        None
    }
}

impl CandidateExtractor for AdjacentCellExtractor {
    fn extract(&self, sheet: &SheetInput) -> ExtractionOutcome {
        if sheet.sheet_id.trim().is_empty() {
            return Err(ExtractionError::Fatal("sheet has no identifier".to_string()));
        }

        let candidates: Vec<Candidate> = sheet
            .blocks
            .iter()
            .filter_map(|block| self.extract_block(sheet, block))
            .collect();

        info!(
            "Extracted {} candidates from {} label blocks on sheet {}",
            candidates.len(),
            sheet.blocks.len(),
            sheet.sheet_id
        );
        Ok(candidates)
    }
}

/// Parses an extraction oracle's JSON answer (an array of candidates).
/// Malformed output is a fatal extraction failure.
pub fn candidates_from_json(json: &str) -> ExtractionOutcome {
    let candidates: Vec<Candidate> = serde_json::from_str(json)
        .map_err(|e| ExtractionError::Fatal(format!("invalid candidate JSON: {}", e)))?;
    Ok(candidates
        .into_iter()
        .map(|c| {
            let confidence = c.extraction_confidence;
            c.with_extraction_confidence(confidence)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RawValue;

    fn sheet() -> SheetInput {
        SheetInput::new("PL")
            .with_unit_note("(単位：千円)")
            .with_block(CellBlock::new("B3", "売上高", vec![ValueCell::new("C3", "12,345")]))
            .with_block(CellBlock::new(
                "B4",
                "売上原価",
                vec![ValueCell::new("C4", ""), ValueCell::new("D4", "注1"), ValueCell::new("E4", "△500")],
            ))
            .with_block(CellBlock::new("B5", "", vec![ValueCell::new("C5", "1")]))
            .with_block(CellBlock::new("B6", "備考", vec![ValueCell::new("C6", "前期比増")]))
            .with_block(CellBlock::new("B7", "経常利益", vec![ValueCell::new("C7", "2,000百万円")]))
    }

    #[test]
    fn test_adjacent_cell_extraction() {
        let candidates = AdjacentCellExtractor::new().extract(&sheet()).unwrap();
        assert_eq!(candidates.len(), 3);

        assert_eq!(candidates[0].raw_label, "売上高");
        assert_eq!(candidates[0].raw_value, RawValue::Text("12,345".to_string()));
        assert_eq!(candidates[0].raw_unit_token.as_deref(), Some("(単位：千円)"));
        assert_eq!(candidates[0].source_location.to_string(), "PL!C3");
        assert_eq!(candidates[0].extraction_confidence, 1.0);
    }

    #[test]
    fn test_skipped_cells_lower_confidence() {
        let candidates = AdjacentCellExtractor::new().extract(&sheet()).unwrap();
        let cost = &candidates[1];
        assert_eq!(cost.source_location.cell, "E4");
        assert!((cost.extraction_confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_skip_penalty_is_configurable_and_floored() {
        let lenient = AdjacentCellExtractor::new().with_skip_penalty(0.0).extract(&sheet()).unwrap();
        assert_eq!(lenient[1].extraction_confidence, 1.0);

        let strict = AdjacentCellExtractor::new().with_skip_penalty(0.3).extract(&sheet()).unwrap();
        assert!((strict[1].extraction_confidence - 0.5).abs() < 1e-9);
        assert_eq!(strict[0].extraction_confidence, 1.0);
    }

    #[test]
    fn test_value_unit_overrides_sheet_note() {
        let candidates = AdjacentCellExtractor::new().extract(&sheet()).unwrap();
        assert_eq!(candidates[2].raw_label, "経常利益");
        assert_eq!(candidates[2].raw_unit_token, None);
    }

    #[test]
    fn test_empty_sheet_yields_empty_list() {
        let candidates = AdjacentCellExtractor::new().extract(&SheetInput::new("PL")).unwrap();
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_unnamed_sheet_is_fatal() {
        let result = AdjacentCellExtractor::new().extract(&SheetInput::new(" "));
        assert!(matches!(result, Err(ExtractionError::Fatal(_))));
    }

    #[test]
    fn test_candidates_from_json() {
        let json = r#"[
            { "raw_label": "営業利益", "raw_value": 5000, "raw_unit_token": "千円",
              "source_location": { "sheet": "PL", "cell": "C9" }, "extraction_confidence": 3.0 }
        ]"#;
        let candidates = candidates_from_json(json).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].extraction_confidence, 1.0);

        assert!(matches!(
            candidates_from_json("{ not json"),
            Err(ExtractionError::Fatal(_))
        ));
    }
}
