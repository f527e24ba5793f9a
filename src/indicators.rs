use serde::Serialize;

use crate::command::{PricePoint, ValidationError};

pub const MA_SHORT_PERIOD: usize = 5;
pub const MA_LONG_PERIOD: usize = 20;

/// A named series aligned index-for-index with the price sequence it was
/// derived from. `None` marks positions without enough lookback.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorSeries {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

#[cfg(test)]
impl IndicatorSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn defined(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(idx, value)| value.map(|v| (idx, v)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VolumeBar {
    pub index: usize,
    pub volume: u64,
    pub direction: VolumeDirection,
}

pub fn validate_window(window: usize) -> Result<usize, ValidationError> {
    if window == 0 {
        Err(ValidationError::InvalidWindow(window))
    } else {
        Ok(window)
    }
}

/// Simple trailing moving average of closes.
pub fn compute_moving_average(window: usize, series: &[PricePoint]) -> IndicatorSeries {
    let name = format!("MA{window}");
    if window == 0 {
        return IndicatorSeries {
            name,
            values: vec![None; series.len()],
        };
    }
    let mut values = Vec::with_capacity(series.len());
    for idx in 0..series.len() {
        if idx + 1 < window {
            values.push(None);
            continue;
        }
        let slice = &series[idx + 1 - window..=idx];
        let sum: f64 = slice.iter().map(|point| point.close).sum();
        values.push(Some(sum / window as f64));
    }
    IndicatorSeries { name, values }
}

/// Tags each session's volume by candle direction: strictly rising closes
/// are `Up`, everything else (flat included) is `Down`.
pub fn compute_volume_bars(series: &[PricePoint]) -> Vec<VolumeBar> {
    series
        .iter()
        .enumerate()
        .map(|(index, point)| VolumeBar {
            index,
            volume: point.volume,
            direction: if point.is_up() {
                VolumeDirection::Up
            } else {
                VolumeDirection::Down
            },
        })
        .collect()
}

/// Last value with enough lookback, if any.
pub fn latest_defined(values: &[Option<f64>]) -> Option<f64> {
    values.iter().rev().find_map(|value| *value)
}
