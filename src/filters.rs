use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::command::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKey {
    MarketCap,
    Pe,
    Pb,
    Momentum,
    Volatility,
    Liquidity,
    Rsi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSection {
    Basic,
    Factor,
    Technical,
}

impl FilterSection {
    pub fn title(&self) -> &'static str {
        match self {
            FilterSection::Basic => "基本面指标",
            FilterSection::Factor => "量化因子",
            FilterSection::Technical => "技术面指标",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UnitRow {
    pub key: FilterKey,
    pub section: FilterSection,
    pub display_unit: &'static str,
    /// Display value times `multiplier` gives the base-unit value.
    pub multiplier: f64,
}

/// Single source of truth for display <-> canonical units.
pub const UNIT_TABLE: &[UnitRow] = &[
    UnitRow {
        key: FilterKey::MarketCap,
        section: FilterSection::Basic,
        display_unit: "亿",
        multiplier: 1e8,
    },
    UnitRow {
        key: FilterKey::Pe,
        section: FilterSection::Basic,
        display_unit: "倍",
        multiplier: 1.0,
    },
    UnitRow {
        key: FilterKey::Pb,
        section: FilterSection::Basic,
        display_unit: "倍",
        multiplier: 1.0,
    },
    UnitRow {
        key: FilterKey::Momentum,
        section: FilterSection::Factor,
        display_unit: "%",
        multiplier: 1e-2,
    },
    UnitRow {
        key: FilterKey::Volatility,
        section: FilterSection::Factor,
        display_unit: "%",
        multiplier: 1e-2,
    },
    UnitRow {
        key: FilterKey::Liquidity,
        section: FilterSection::Factor,
        display_unit: "万手",
        multiplier: 1e4,
    },
    UnitRow {
        key: FilterKey::Rsi,
        section: FilterSection::Technical,
        display_unit: "",
        multiplier: 1.0,
    },
];

impl FilterKey {
    pub const ALL: [FilterKey; 7] = [
        FilterKey::MarketCap,
        FilterKey::Pe,
        FilterKey::Pb,
        FilterKey::Momentum,
        FilterKey::Volatility,
        FilterKey::Liquidity,
        FilterKey::Rsi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKey::MarketCap => "market_cap",
            FilterKey::Pe => "pe",
            FilterKey::Pb => "pb",
            FilterKey::Momentum => "momentum",
            FilterKey::Volatility => "volatility",
            FilterKey::Liquidity => "liquidity",
            FilterKey::Rsi => "rsi",
        }
    }

    pub fn unit_row(&self) -> &'static UnitRow {
        UNIT_TABLE
            .iter()
            .find(|row| row.key == *self)
            .unwrap_or(&UNIT_TABLE[0])
    }

    pub fn multiplier(&self) -> f64 {
        self.unit_row().multiplier
    }

    pub fn section(&self) -> FilterSection {
        self.unit_row().section
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for FilterKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        FilterKey::ALL
            .into_iter()
            .find(|key| key.as_str() == normalized)
            .ok_or_else(|| ValidationError::UnknownFilterKey(s.trim().to_string()))
    }
}

pub fn to_canonical_value(key: FilterKey, display: f64) -> f64 {
    display * key.multiplier()
}

pub fn from_canonical_value(key: FilterKey, canonical: f64) -> f64 {
    canonical / key.multiplier()
}

/// Formats a canonical value back into display units for tables and logs.
pub fn format_display(key: FilterKey, canonical: f64) -> String {
    format_display_value(key, from_canonical_value(key, canonical))
}

/// Formats a value that is already in display units.
pub fn format_display_value(key: FilterKey, display: f64) -> String {
    let unit = key.unit_row().display_unit;
    match key {
        FilterKey::Momentum => format!("{display:+.2}{unit}"),
        FilterKey::Volatility => format!("{display:.2}{unit}"),
        _ if unit.is_empty() => format!("{display:.2}"),
        _ => format!("{display:.2} {unit}"),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl Bound {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Bound { min, max }
    }

    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> Bound {
        Bound {
            min: self.min.map(&f),
            max: self.max.map(&f),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalFlags {
    #[serde(default)]
    pub macd_golden_cross: bool,
    #[serde(default)]
    pub kdj_golden_cross: bool,
}

impl SignalFlags {
    pub fn any(&self) -> bool {
        self.macd_golden_cross || self.kdj_golden_cross
    }
}

/// Filter bounds as a person typed them, in display units. This is the
/// form presets are stored in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterBounds {
    #[serde(default)]
    bounds: BTreeMap<FilterKey, Bound>,
    #[serde(default)]
    pub flags: SignalFlags,
}

impl FilterBounds {
    pub fn new() -> Self {
        FilterBounds::default()
    }

    #[cfg(test)]
    pub fn with_bound(mut self, key: FilterKey, min: Option<f64>, max: Option<f64>) -> Self {
        self.set(key, Bound::new(min, max));
        self
    }

    pub fn set(&mut self, key: FilterKey, bound: Bound) {
        if bound.is_unbounded() {
            self.bounds.remove(&key);
        } else {
            self.bounds.insert(key, bound);
        }
    }

    #[cfg(test)]
    pub fn get(&self, key: FilterKey) -> Option<&Bound> {
        self.bounds.get(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FilterKey, &Bound)> {
        self.bounds.iter().map(|(key, bound)| (*key, bound))
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty() && !self.flags.any()
    }

    /// Merges `other` on top of `self`, key by key.
    pub fn merge(&mut self, other: &FilterBounds) {
        for (key, bound) in other.iter() {
            self.set(key, *bound);
        }
        self.flags.macd_golden_cross |= other.flags.macd_golden_cross;
        self.flags.kdj_golden_cross |= other.flags.kdj_golden_cross;
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (key, bound) in self.iter() {
            for (side, value) in [("lower", bound.min), ("upper", bound.max)] {
                if value.is_some_and(|v| !v.is_finite()) {
                    return Err(ValidationError::NonFiniteBound {
                        key: key.to_string(),
                        side,
                    });
                }
            }
            if let (Some(min), Some(max)) = (bound.min, bound.max) {
                if min > max {
                    return Err(ValidationError::InvertedBounds {
                        key: key.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// First section with an active filter, checked basic, factor, technical.
    pub fn primary_section(&self) -> Option<FilterSection> {
        let active = |section: FilterSection| self.iter().any(|(key, _)| key.section() == section);
        if active(FilterSection::Basic) {
            Some(FilterSection::Basic)
        } else if active(FilterSection::Factor) {
            Some(FilterSection::Factor)
        } else if active(FilterSection::Technical) || self.flags.any() {
            Some(FilterSection::Technical)
        } else {
            None
        }
    }
}

/// Filter bounds in the base units of the screening contract. Built on
/// demand, never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalFilterBounds {
    bounds: BTreeMap<FilterKey, Bound>,
    pub flags: SignalFlags,
}

impl CanonicalFilterBounds {
    #[cfg(test)]
    pub fn get(&self, key: FilterKey) -> Option<&Bound> {
        self.bounds.get(&key)
    }

    pub fn to_payload(&self) -> ScreeningPayload {
        let mut basic = Map::new();
        let mut factor = Map::new();
        let mut technical = Map::new();
        for (key, bound) in &self.bounds {
            let target = match key.section() {
                FilterSection::Basic => &mut basic,
                FilterSection::Factor => &mut factor,
                FilterSection::Technical => &mut technical,
            };
            if let Some(min) = bound.min {
                target.insert(format!("{}_min", key.as_str()), Value::from(min));
            }
            if let Some(max) = bound.max {
                target.insert(format!("{}_max", key.as_str()), Value::from(max));
            }
        }
        technical.insert(
            "macd_positive".to_string(),
            Value::Bool(self.flags.macd_golden_cross),
        );
        technical.insert(
            "kdj_positive".to_string(),
            Value::Bool(self.flags.kdj_golden_cross),
        );
        ScreeningPayload {
            basic_filters: basic,
            factor_filters: factor,
            technical_filters: technical,
        }
    }
}

pub fn to_canonical(bounds: &FilterBounds) -> CanonicalFilterBounds {
    CanonicalFilterBounds {
        bounds: bounds
            .iter()
            .map(|(key, bound)| (key, bound.map(|v| to_canonical_value(key, v))))
            .collect(),
        flags: bounds.flags,
    }
}

pub fn from_canonical(canonical: &CanonicalFilterBounds) -> FilterBounds {
    FilterBounds {
        bounds: canonical
            .bounds
            .iter()
            .map(|(key, bound)| (*key, bound.map(|v| from_canonical_value(*key, v))))
            .collect(),
        flags: canonical.flags,
    }
}

/// Body of `POST /screening/run`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScreeningPayload {
    pub basic_filters: Map<String, Value>,
    pub factor_filters: Map<String, Value>,
    pub technical_filters: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportFileType {
    #[default]
    Csv,
    Xlsx,
}

impl ExportFileType {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFileType::Csv => "csv",
            ExportFileType::Xlsx => "xlsx",
        }
    }
}

impl FromStr for ExportFileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFileType::Csv),
            "xlsx" => Ok(ExportFileType::Xlsx),
            other => Err(format!("unsupported export type `{other}` (use csv or xlsx)")),
        }
    }
}

/// Body of `POST /screening/export`: the screening payload plus a file type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportPayload {
    pub file_type: ExportFileType,
    #[serde(flatten)]
    pub filters: ScreeningPayload,
}

impl ExportPayload {
    pub fn new(file_type: ExportFileType, canonical: &CanonicalFilterBounds) -> Self {
        ExportPayload {
            file_type,
            filters: canonical.to_payload(),
        }
    }
}
