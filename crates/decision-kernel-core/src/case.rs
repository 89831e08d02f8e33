use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::DecisionError;
use crate::CaseId;

/// Categorical or numeric case attribute used for policy selector matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum SignalValue {
    Number(f64),
    Text(String),
}

impl SignalValue {
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(_) => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            Self::Number(_) => None,
        }
    }
}

/// Signals are keyed by name; `BTreeMap` keeps hashing and serialization
/// order stable across runs.
pub type CaseSignals = BTreeMap<String, SignalValue>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseLine {
    pub item_id: String,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
}

/// One procurement case: immutable PO header plus derived signals.
///
/// The header never changes after ERP intake; new information only enters
/// the system through new decision runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Case {
    pub case_id: CaseId,
    pub vendor_id: String,
    pub po_reference: String,
    pub currency: String,
    pub lines: Vec<CaseLine>,
    pub signals: CaseSignals,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Case {
    /// Validate intake invariants before the case is persisted.
    ///
    /// # Errors
    /// Returns [`DecisionError::Validation`] when header fields are empty or
    /// any line carries a non-finite quantity or price.
    pub fn validate(&self) -> Result<(), DecisionError> {
        if self.vendor_id.trim().is_empty() {
            return Err(DecisionError::Validation("vendor_id MUST be provided".to_string()));
        }
        if self.po_reference.trim().is_empty() {
            return Err(DecisionError::Validation("po_reference MUST be provided".to_string()));
        }
        if self.currency.trim().is_empty() {
            return Err(DecisionError::Validation("currency MUST be provided".to_string()));
        }
        for line in &self.lines {
            if line.item_id.trim().is_empty() {
                return Err(DecisionError::Validation("line item_id MUST be provided".to_string()));
            }
            if !line.quantity.is_finite() || !line.unit_price.is_finite() {
                return Err(DecisionError::Validation(format!(
                    "line {} carries a non-finite quantity or unit_price",
                    line.item_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn fixture_case() -> Case {
        Case {
            case_id: CaseId::new(),
            vendor_id: "V-001".to_string(),
            po_reference: "PO-2024-0042".to_string(),
            currency: "THB".to_string(),
            lines: vec![CaseLine {
                item_id: "SKU-9".to_string(),
                description: "industrial bearing".to_string(),
                quantity: 40.0,
                unit_price: 125.5,
            }],
            signals: CaseSignals::new(),
            created_at: OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000),
        }
    }

    #[test]
    fn validate_accepts_complete_header() {
        let case = fixture_case();
        assert_eq!(case.validate(), Ok(()));
    }

    #[test]
    fn validate_rejects_blank_vendor() {
        let mut case = fixture_case();
        case.vendor_id = "  ".to_string();
        let err = match case.validate() {
            Ok(()) => panic!("expected validation error"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("vendor_id MUST be provided"));
    }

    #[test]
    fn validate_rejects_non_finite_line_price() {
        let mut case = fixture_case();
        case.lines[0].unit_price = f64::NAN;
        assert!(case.validate().is_err());
    }
}
