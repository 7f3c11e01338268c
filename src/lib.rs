//! # Line-Item Normalizer
//!
//! Maps profit-and-loss spreadsheets written by different people, in different
//! layouts, with inconsistent Japanese terminology and numeric units, onto a
//! single canonical schema ready for aggregation into a standard template.
//!
//! ## Core Concepts
//!
//! - **Candidate**: a raw (label, value) pair read from a sheet by an extractor
//! - **Canonical Taxonomy**: versioned, read-only set of line items (売上高, 営業利益, ...)
//!   with synonyms, loss labels, expected signs and statement identities
//! - **Matching**: exact, then normalized-synonym, then fuzzy; deterministic tie-breaks
//! - **Normalization**: every amount converted to yen with an explicit sign
//! - **Conflict Resolution**: duplicates merged, disagreements held for review
//! - **Review Queue**: every candidate the engine could not place with confidence
//!
//! Missing values are never filled: a required concept with no accepted
//! candidate is reported in `missing_required` instead.
//!
//! ## Example
//!
//! ```rust
//! use line_item_normalizer::*;
//! use rust_decimal::Decimal;
//!
//! let candidates = vec![
//!     Candidate::new("売上高", 12_000, Some("千円"), SourceLocation::new("PL", "C3")),
//!     Candidate::new("営業損失", "800", Some("千円"), SourceLocation::new("PL", "C9")),
//! ];
//!
//! let run = normalize_candidates(&candidates).unwrap();
//! assert_eq!(run.output.amount("revenue"), Some(Decimal::from(12_000_000)));
//! assert_eq!(run.output.amount("operating_income"), Some(Decimal::from(-800_000)));
//! ```

pub mod aggregator;
pub mod config;
pub mod disposition;
pub mod engine;
pub mod error;
pub mod extraction;
pub mod identities;
pub mod matcher;
pub mod resolver;
pub mod review;
pub mod schema;
pub mod taxonomy;
pub mod text;
pub mod units;

pub use aggregator::{Aggregator, OutputRecord, TemplateRecord, TemplateRow};
pub use config::EngineConfig;
pub use disposition::{
    apply_dispositions, DismissedItem, DispositionOutcome, EnteredValue, ReviewDisposition,
    UnappliedDisposition,
};
pub use engine::{BatchEntry, BatchReport, BatchStatus, Engine, RunOutput};
pub use error::{ExtractionError, NormalizerError, Result, UnitError};
pub use extraction::{
    candidates_from_json, AdjacentCellExtractor, CandidateExtractor, CellBlock, ExtractionOutcome,
    SheetInput, ValueCell,
};
pub use identities::{verify_identities, IdentityChecker, IdentityDiscrepancy};
pub use matcher::{LineItemMatcher, MatchResult};
pub use resolver::ConflictResolver;
pub use review::{ReviewEntry, ReviewItem, ReviewQueue, ReviewQueueSnapshot, ReviewReason};
pub use schema::*;
pub use taxonomy::{
    CanonicalConcept, Taxonomy, TaxonomyRegistry, TaxonomySource, BUILTIN_TAXONOMY_VERSION,
};
pub use units::{NormalizedAmount, UnitNormalizer, CANONICAL_UNIT};

/// Normalizes candidates against the built-in taxonomy with default settings.
pub fn normalize_candidates(candidates: &[Candidate]) -> Result<RunOutput> {
    let taxonomy = Taxonomy::builtin()?;
    Ok(Engine::with_builtin()?.run_with_taxonomy(candidates, &taxonomy))
}

/// Extracts and normalizes worksheets with the adjacent-cell extractor.
pub fn normalize_sheets(sheets: &[SheetInput]) -> Result<RunOutput> {
    Engine::with_builtin()?.run_sheets(&AdjacentCellExtractor::new(), sheets, BUILTIN_TAXONOMY_VERSION)
}
