use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DecisionError;
use crate::evidence::{EvidenceRef, PriceItem};
use crate::CaseId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FactMethod {
    Median,
    Fallback,
    SingleSource,
}

impl FactMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Median => "median",
            Self::Fallback => "fallback",
            Self::SingleSource => "single_source",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "median" => Some(Self::Median),
            "fallback" => Some(Self::Fallback),
            "single_source" => Some(Self::SingleSource),
            _ => None,
        }
    }
}

/// One typed fact aggregated from confirmed evidence. Immutable once written
/// to a run; recomputed fresh on every new run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DerivedFact {
    pub case_id: CaseId,
    pub fact_key: String,
    pub value: f64,
    pub unit: Option<String>,
    pub confidence: f32,
    pub method: FactMethod,
    /// Citation is mandatory: the exact rows the value was computed from.
    pub citations: Vec<EvidenceRef>,
}

/// One numeric observation extracted from a confirmed price row.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub fact_key: String,
    pub value: f64,
    pub unit: Option<String>,
    pub citation: EvidenceRef,
}

/// Parameters of the confidence scaling function. The formula itself is
/// fixed (see [`scaled_confidence`]); only the floor and caps are tunable.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivationConfig {
    /// Lower bound for MEDIAN confidence; every median-backed fact clears it.
    pub median_confidence_floor: f32,
    /// Confidence assigned to two-observation FALLBACK facts. Below the floor.
    pub fallback_confidence: f32,
    /// Confidence assigned to SINGLE_SOURCE facts. Below the fallback value.
    pub single_source_confidence: f32,
}

impl Default for DerivationConfig {
    fn default() -> Self {
        Self {
            median_confidence_floor: 0.60,
            fallback_confidence: 0.45,
            single_source_confidence: 0.35,
        }
    }
}

impl DerivationConfig {
    /// # Errors
    /// Returns [`DecisionError::Validation`] unless
    /// `0 < single_source < fallback < floor <= 1`.
    pub fn validate(&self) -> Result<(), DecisionError> {
        let ordered = 0.0 < self.single_source_confidence
            && self.single_source_confidence < self.fallback_confidence
            && self.fallback_confidence < self.median_confidence_floor
            && self.median_confidence_floor <= 1.0;
        if !ordered {
            return Err(DecisionError::Validation(
                "derivation config MUST satisfy 0 < single_source < fallback < median_floor <= 1"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Confidence for a median-backed fact as a function of sample count and
/// relative spread.
///
/// `conf = floor + (1 - floor) * (gain(n) + 1 / (1 + spread)) / 2` where
/// `gain(n) = min(n - 3, 6) / 6`. Monotone non-decreasing in `n`, strictly
/// decreasing in spread, and always within `[floor, 1]`.
#[must_use]
pub fn scaled_confidence(sample_count: usize, relative_spread: f64, floor: f32) -> f32 {
    let extra = sample_count.saturating_sub(3).min(6);
    #[allow(clippy::cast_precision_loss)]
    let gain = extra as f64 / 6.0;
    let tightness = 1.0 / (1.0 + relative_spread.max(0.0));
    let floor_f64 = f64::from(floor);
    let conf = floor_f64 + (1.0 - floor_f64) * (gain + tightness) / 2.0;
    #[allow(clippy::cast_possible_truncation)]
    let conf = conf.clamp(floor_f64, 1.0) as f32;
    conf
}

/// Map confirmed price rows into observations, dropping non-finite values.
#[must_use]
pub fn observations_from_price_items(items: &[PriceItem]) -> Vec<Observation> {
    items
        .iter()
        .filter(|item| item.unit_price.is_finite() && !item.fact_key.trim().is_empty())
        .map(|item| Observation {
            fact_key: item.fact_key.clone(),
            value: item.unit_price,
            unit: Some(item.currency.clone()),
            citation: EvidenceRef::from_price_item(item),
        })
        .collect()
}

/// Aggregate observations into typed facts.
///
/// Per fact key: three or more observations produce a MEDIAN fact; exactly
/// two produce a FALLBACK fact at the midpoint; one produces a SINGLE_SOURCE
/// fact; zero observations produce nothing — absence is the representation
/// of missing evidence, never a default value.
///
/// # Errors
/// Returns [`DecisionError::Validation`] when the config ordering is broken.
pub fn derive_facts(
    case_id: CaseId,
    observations: &[Observation],
    config: &DerivationConfig,
) -> Result<Vec<DerivedFact>, DecisionError> {
    config.validate()?;

    let mut grouped: BTreeMap<&str, Vec<&Observation>> = BTreeMap::new();
    for observation in observations {
        grouped.entry(observation.fact_key.as_str()).or_default().push(observation);
    }

    let mut facts = Vec::with_capacity(grouped.len());
    for (fact_key, mut group) in grouped {
        group.sort_by(|lhs, rhs| {
            lhs.value
                .partial_cmp(&rhs.value)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| lhs.citation.cmp(&rhs.citation))
        });

        let values: Vec<f64> = group.iter().map(|observation| observation.value).collect();
        let (value, method, confidence) = match values.len() {
            0 => continue,
            1 => (values[0], FactMethod::SingleSource, config.single_source_confidence),
            2 => ((values[0] + values[1]) / 2.0, FactMethod::Fallback, config.fallback_confidence),
            n => {
                let median = median_of_sorted(&values);
                let spread = relative_spread(&values, median);
                (
                    median,
                    FactMethod::Median,
                    scaled_confidence(n, spread, config.median_confidence_floor),
                )
            }
        };

        let mut citations: Vec<EvidenceRef> =
            group.iter().map(|observation| observation.citation.clone()).collect();
        citations.sort();
        citations.dedup();

        let unit = group.iter().find_map(|observation| observation.unit.clone());

        facts.push(DerivedFact {
            case_id,
            fact_key: fact_key.to_string(),
            value,
            unit,
            confidence,
            method,
            citations,
        });
    }

    Ok(facts)
}

fn median_of_sorted(values: &[f64]) -> f64 {
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

fn relative_spread(values: &[f64], median: f64) -> f64 {
    let min = values.first().copied().unwrap_or(0.0);
    let max = values.last().copied().unwrap_or(0.0);
    (max - min) / median.abs().max(f64::EPSILON)
}
