use thiserror::Error;

#[derive(Error, Debug)]
pub enum NormalizerError {
    #[error("Fatal taxonomy configuration error: {0}")]
    FatalConfig(String),

    #[error("Unknown taxonomy version: {0}")]
    UnknownTaxonomyVersion(String),

    #[error("Candidate extraction failed for sheet '{sheet}': {reason}")]
    ExtractionFailed { sheet: String, reason: String },

    #[error("Invalid engine configuration: {0}")]
    InvalidConfig(String),

    #[error("Record uses taxonomy '{record}' but '{taxonomy}' was supplied")]
    TaxonomyMismatch { record: String, taxonomy: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("CSV export error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Per-candidate failure of the unit normalizer. Always recovered by routing
/// the candidate to the review queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error("Value '{0}' cannot be parsed as a number")]
    Unparseable(String),
}

/// Failure reported by a candidate extractor implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    /// The caller may retry; the core never does.
    #[error("transient extraction failure: {0}")]
    Transient(String),

    #[error("extraction failure: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, NormalizerError>;
