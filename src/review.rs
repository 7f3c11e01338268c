use crate::error::Result;
use crate::schema::{Candidate, SourceLocation, SuggestedConcept};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewReason {
    /// No concept scored above the acceptance threshold, or the top two were
    /// too close to call.
    Unmatched,
    /// Matched, but the combined match and extraction confidence is too low.
    LowConfidence,
    /// Several confident candidates disagree on the value of one concept.
    Conflicting,
    /// Matched, but the value is not a number.
    Unparseable,
    /// Lost to a clearly more confident candidate for the same concept.
    Superseded,
    /// Contributed after a sign correction, with an outsized magnitude.
    SignAnomaly,
}

impl ReviewReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewReason::Unmatched => "unmatched",
            ReviewReason::LowConfidence => "low_confidence",
            ReviewReason::Conflicting => "conflicting",
            ReviewReason::Unparseable => "unparseable",
            ReviewReason::Superseded => "superseded",
            ReviewReason::SignAnomaly => "sign_anomaly",
        }
    }

    /// Informational items do not stand for a missing value.
    pub fn is_informational(&self) -> bool {
        matches!(self, ReviewReason::Superseded | ReviewReason::SignAnomaly)
    }
}

impl fmt::Display for ReviewReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
    pub candidate: Candidate,
    pub reason: ReviewReason,
    pub suggested_concepts: Vec<SuggestedConcept>,
    pub detail: Option<String>,
}

impl ReviewItem {
    pub fn new(candidate: &Candidate, reason: ReviewReason) -> Self {
        Self {
            candidate: candidate.clone(),
            reason,
            suggested_concepts: Vec::new(),
            detail: None,
        }
    }

    pub fn with_suggestions(mut self, suggestions: Vec<SuggestedConcept>) -> Self {
        self.suggested_concepts = suggestions;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Insertion-ordered accumulation of items needing a human decision.
#[derive(Debug, Default)]
pub struct ReviewQueue {
    items: Vec<ReviewItem>,
}

impl ReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, item: ReviewItem) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn drain(&mut self) -> Vec<ReviewItem> {
        std::mem::take(&mut self.items)
    }

    pub fn snapshot(&mut self) -> ReviewQueueSnapshot {
        ReviewQueueSnapshot {
            items: self.drain(),
        }
    }
}

/// One row of the reviewer-facing list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub raw_label: String,
    pub raw_value: String,
    pub raw_unit_token: Option<String>,
    pub source_location: SourceLocation,
    pub reason: ReviewReason,
    pub suggested_concepts: Vec<SuggestedConcept>,
    pub detail: Option<String>,
}

impl From<&ReviewItem> for ReviewEntry {
    fn from(item: &ReviewItem) -> Self {
        Self {
            raw_label: item.candidate.raw_label.clone(),
            raw_value: item.candidate.raw_value.to_string(),
            raw_unit_token: item.candidate.raw_unit_token.clone(),
            source_location: item.candidate.source_location.clone(),
            reason: item.reason,
            suggested_concepts: item.suggested_concepts.clone(),
            detail: item.detail.clone(),
        }
    }
}

/// Drained review queue of one run, in the order items were raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewQueueSnapshot {
    pub items: Vec<ReviewItem>,
}

impl ReviewQueueSnapshot {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn count_by_reason(&self, reason: ReviewReason) -> usize {
        self.items.iter().filter(|i| i.reason == reason).count()
    }

    /// Items that stand for a value the record is missing.
    pub fn needing_decision(&self) -> usize {
        self.items
            .iter()
            .filter(|i| !i.reason.is_informational())
            .count()
    }

    pub fn entries(&self) -> Vec<ReviewEntry> {
        self.items.iter().map(ReviewEntry::from).collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.entries())?)
    }

    pub fn to_csv(&self) -> Result<String> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record([
            "Location",
            "Label",
            "Value",
            "Unit",
            "Reason",
            "Suggested Concepts",
            "Detail",
        ])?;

        for entry in self.entries() {
            writer.write_record([
                entry.source_location.to_string(),
                entry.raw_label,
                entry.raw_value,
                entry.raw_unit_token.unwrap_or_default(),
                entry.reason.to_string(),
                format_suggestions(&entry.suggested_concepts),
                entry.detail.unwrap_or_default(),
            ])?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn to_markdown(&self) -> String {
        let mut output = String::new();
        output.push_str("# Review Queue\n\n");

        if self.items.is_empty() {
            output.push_str("No items require review.\n");
            return output;
        }

        output.push_str(&format!(
            "{} items, {} needing a decision\n\n",
            self.items.len(),
            self.needing_decision()
        ));
        output.push_str("| # | Location | Label | Value | Reason | Suggestions |\n");
        output.push_str("|---|---|---|---|---|---|\n");
        for (i, entry) in self.entries().into_iter().enumerate() {
            output.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} |\n",
                i + 1,
                entry.source_location,
                entry.raw_label,
                entry.raw_value,
                entry.reason,
                format_suggestions(&entry.suggested_concepts)
            ));
        }

        output
    }
}

fn format_suggestions(suggestions: &[SuggestedConcept]) -> String {
    suggestions
        .iter()
        .map(|s| format!("{} ({:.2})", s.concept_id, s.score))
        .collect::<Vec<_>>()
        .join("; ")
}
