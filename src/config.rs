use crate::error::{NormalizerError, Result};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunable thresholds for matching and conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    #[schemars(description = "Minimum confidence for a candidate to contribute a value (0.0-1.0)")]
    pub acceptance_threshold: f64,

    #[schemars(
        description = "Fuzzy matches whose top two concepts score within this margin are treated as ambiguous"
    )]
    pub ambiguity_margin: f64,

    #[schemars(
        description = "Confidence lead required for one of several differing values to win a conflict"
    )]
    pub confidence_margin: f64,

    #[schemars(description = "Amounts (in yen) within this distance are treated as the same figure")]
    pub duplicate_tolerance: Decimal,

    #[schemars(
        description = "A sign-corrected value larger than this multiple of the run's median magnitude is flagged for review"
    )]
    pub sign_anomaly_ratio: Decimal,

    #[schemars(description = "Allowed difference (in yen) when checking statement identities")]
    pub identity_tolerance: Decimal,

    #[schemars(description = "Number of ranked concepts attached to each review item")]
    pub max_suggestions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.6,
            ambiguity_margin: 0.05,
            confidence_margin: 0.2,
            duplicate_tolerance: Decimal::ONE,
            sign_anomaly_ratio: Decimal::TEN,
            identity_tolerance: Decimal::ONE_THOUSAND,
            max_suggestions: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let unit_interval = [
            ("acceptance_threshold", self.acceptance_threshold),
            ("ambiguity_margin", self.ambiguity_margin),
            ("confidence_margin", self.confidence_margin),
        ];
        for (name, value) in unit_interval {
            if !(0.0..=1.0).contains(&value) {
                return Err(NormalizerError::InvalidConfig(format!(
                    "{} must be between 0.0 and 1.0, got {}",
                    name, value
                )));
            }
        }

        let non_negative = [
            ("duplicate_tolerance", self.duplicate_tolerance),
            ("sign_anomaly_ratio", self.sign_anomaly_ratio),
            ("identity_tolerance", self.identity_tolerance),
        ];
        for (name, value) in non_negative {
            if value < Decimal::ZERO {
                return Err(NormalizerError::InvalidConfig(format!(
                    "{} must not be negative, got {}",
                    name, value
                )));
            }
        }

        if self.max_suggestions == 0 {
            return Err(NormalizerError::InvalidConfig(
                "max_suggestions must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
