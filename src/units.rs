use crate::error::UnitError;
use crate::schema::{ExpectedSign, RawValue};
use crate::text::{extract_unit_hint, normalize_unit_token, parse_amount};
use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Every amount in an output record is expressed in yen.
pub const CANONICAL_UNIT: &str = "円";

/// Where the multiplier applied to a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSource {
    /// The extractor reported a unit token.
    Token,
    /// The value text carried its own unit ("1,234千円").
    ValueText,
    /// The row label ended in a unit annotation ("売上高（千円）").
    Label,
    /// Nothing recognizable; yen assumed and the value flagged unit-unconfirmed.
    Assumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignAdjustment {
    None,
    /// The label was a loss synonym ("営業損失").
    LossLabel,
    /// The value disagreed with the concept's fixed sign.
    ExpectedSign,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedAmount {
    pub amount: Decimal,
    pub multiplier: Decimal,
    pub unit_source: UnitSource,
    pub sign_adjustment: SignAdjustment,
}

impl NormalizedAmount {
    pub fn unit_confirmed(&self) -> bool {
        self.unit_source != UnitSource::Assumed
    }

    pub fn sign_applied(&self) -> bool {
        self.sign_adjustment != SignAdjustment::None
    }

    /// A loss label reports a loss as a positive figure. A value that is
    /// already negative ("営業損失 △1,200") is a loss either way and is kept.
    pub(crate) fn negated_for_loss_label(self) -> Self {
        if self.amount.is_sign_negative() || self.amount.is_zero() {
            return self;
        }
        Self {
            amount: -self.amount,
            sign_adjustment: SignAdjustment::LossLabel,
            ..self
        }
    }
}

/// Converts raw values and unit tokens into signed yen amounts.
#[derive(Debug, Clone)]
pub struct UnitNormalizer {
    multipliers: BTreeMap<String, Decimal>,
}

impl Default for UnitNormalizer {
    fn default() -> Self {
        let table: [(&str, i64); 11] = [
            ("円", 1),
            ("yen", 1),
            ("jpy", 1),
            ("千", 1_000),
            ("千円", 1_000),
            ("万円", 10_000),
            ("百万", 1_000_000),
            ("百万円", 1_000_000),
            ("千万円", 10_000_000),
            ("億円", 100_000_000),
            ("十億円", 1_000_000_000),
        ];

        Self {
            multipliers: table
                .iter()
                .map(|(token, m)| (token.to_string(), Decimal::from(*m)))
                .collect(),
        }
    }
}

impl UnitNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an additional unit token (e.g. a template-specific "千ドル").
    pub fn with_unit(mut self, token: &str, multiplier: Decimal) -> Self {
        self.multipliers.insert(normalize_unit_token(token), multiplier);
        self
    }

    pub fn multiplier_for(&self, token: &str) -> Option<Decimal> {
        self.multipliers.get(&normalize_unit_token(token)).copied()
    }

    pub fn normalize(
        &self,
        raw_value: &RawValue,
        raw_unit_token: Option<&str>,
        label: &str,
        expected_sign: ExpectedSign,
    ) -> Result<NormalizedAmount, UnitError> {
        let (value, embedded_unit) = match raw_value {
            RawValue::Number(d) => (*d, None),
            RawValue::Text(text) => {
                let parsed = parse_amount(text)?;
                (parsed.value, parsed.embedded_unit)
            }
        };

        let (multiplier, unit_source) = self.resolve_unit(raw_unit_token, embedded_unit.as_deref(), label);

        let mut amount = value
            .checked_mul(multiplier)
            .ok_or_else(|| UnitError::Unparseable(format!("{} (out of range)", raw_value)))?
            .normalize();

        let disagrees = match expected_sign {
            ExpectedSign::Positive => amount.is_sign_negative() && !amount.is_zero(),
            ExpectedSign::Negative => amount.is_sign_positive() && !amount.is_zero(),
            ExpectedSign::Either => false,
        };

        let sign_adjustment = if disagrees {
            amount = -amount;
            SignAdjustment::ExpectedSign
        } else {
            SignAdjustment::None
        };

        Ok(NormalizedAmount {
            amount,
            multiplier,
            unit_source,
            sign_adjustment,
        })
    }

    fn resolve_unit(
        &self,
        raw_unit_token: Option<&str>,
        embedded_unit: Option<&str>,
        label: &str,
    ) -> (Decimal, UnitSource) {
        if let Some(token) = raw_unit_token {
            match self.multiplier_for(token) {
                Some(m) => return (m, UnitSource::Token),
                None => debug!("Unrecognized unit token '{}' for label '{}'", token, label),
            }
        }

        if let Some(m) = embedded_unit.and_then(|u| self.multiplier_for(u)) {
            return (m, UnitSource::ValueText);
        }

        if let Some(m) = extract_unit_hint(label).and_then(|hint| self.multiplier_for(&hint)) {
            return (m, UnitSource::Label);
        }

        (Decimal::ONE, UnitSource::Assumed)
    }
}
