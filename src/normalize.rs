use serde::{Deserialize, Serialize};
use tracing::debug;

/// Guess about the scale of a magnitude whose unit the source does not tag.
///
/// Anything above `raw_threshold` is assumed to be in the smallest
/// denomination and is divided by `divisor`. Smaller values are assumed to
/// already be in the display unit. A legitimately huge display-unit value
/// would be mis-scaled; replace the policy once sources send a unit field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalePolicy {
    pub raw_threshold: f64,
    pub divisor: f64,
}

impl ScalePolicy {
    /// Market capitalisation: yuan above 10^9, otherwise already in 亿.
    pub const MARKET_CAP: ScalePolicy = ScalePolicy {
        raw_threshold: 1e9,
        divisor: 1e8,
    };

    /// Returns the value in display units rounded to two decimals, or
    /// `None` when it normalizes to zero or below.
    pub fn normalize(&self, raw: f64) -> Option<f64> {
        let scaled = if raw > self.raw_threshold {
            raw / self.divisor
        } else {
            raw
        };
        let value = round_to_cents(scaled);
        if value > 0.0 { Some(value) } else { None }
    }
}

pub fn normalize_magnitude(raw: f64) -> Option<f64> {
    ScalePolicy::MARKET_CAP.normalize(raw)
}

fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Raw row of the dashboard market-cap distribution.
#[derive(Debug, Clone, Deserialize)]
pub struct MarketCapEntry {
    pub name: String,
    pub symbol: String,
    #[serde(default)]
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketCapSlice {
    pub name: String,
    pub symbol: String,
    pub value: f64,
}

/// Normalizes every entry and drops the ones that end up missing.
pub fn normalize_market_caps(entries: Vec<MarketCapEntry>, policy: ScalePolicy) -> Vec<MarketCapSlice> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let raw = entry.value.unwrap_or(0.0);
            match policy.normalize(raw) {
                Some(value) => Some(MarketCapSlice {
                    name: entry.name,
                    symbol: entry.symbol,
                    value,
                }),
                None => {
                    debug!(symbol = %entry.symbol, raw, "dropping non-positive market cap");
                    None
                }
            }
        })
        .collect()
}

/// Share of each slice in the total, in percent.
pub fn shares(slices: &[MarketCapSlice]) -> Vec<f64> {
    let total: f64 = slices.iter().map(|slice| slice.value).sum();
    if total <= 0.0 {
        return vec![0.0; slices.len()];
    }
    slices
        .iter()
        .map(|slice| slice.value / total * 100.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_yuan_is_rescaled() {
        assert_eq!(normalize_magnitude(5_000_000_000.0), Some(50.0));
    }

    #[test]
    fn display_units_pass_through() {
        assert_eq!(normalize_magnitude(42.5), Some(42.5));
        assert_eq!(normalize_magnitude(1_000_000_000.0), Some(1_000_000_000.0));
    }

    #[test]
    fn non_positive_values_are_dropped() {
        assert_eq!(normalize_magnitude(-3.0), None);
        assert_eq!(normalize_magnitude(0.0), None);
        assert_eq!(normalize_magnitude(0.004), None);
    }

    #[test]
    fn rounds_to_two_decimals() {
        assert_eq!(normalize_magnitude(12.345_6), Some(12.35));
        assert_eq!(normalize_magnitude(123_456_789_012.0), Some(1234.57));
    }

    #[test]
    fn distribution_drops_missing_points() {
        let entries = vec![
            MarketCapEntry {
                name: "贵州茅台".to_string(),
                symbol: "600519".to_string(),
                value: Some(2_100_000_000_000.0),
            },
            MarketCapEntry {
                name: "平安银行".to_string(),
                symbol: "000001".to_string(),
                value: Some(2_150.4),
            },
            MarketCapEntry {
                name: "空值".to_string(),
                symbol: "000002".to_string(),
                value: None,
            },
            MarketCapEntry {
                name: "负值".to_string(),
                symbol: "000003".to_string(),
                value: Some(-3.0),
            },
        ];
        let slices = normalize_market_caps(entries, ScalePolicy::MARKET_CAP);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].value, 21_000.0);
        assert_eq!(slices[1].value, 2_150.4);

        let pct = shares(&slices);
        assert!((pct.iter().sum::<f64>() - 100.0).abs() < 1e-9);
    }
}
