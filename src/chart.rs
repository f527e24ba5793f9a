use std::ops::Range;

use chrono::NaiveDate;
use serde::Serialize;

use crate::command::{PricePoint, ValidationError};
use crate::indicators::{
    IndicatorSeries, MA_LONG_PERIOD, MA_SHORT_PERIOD, VolumeBar, compute_moving_average,
    compute_volume_bars,
};

const DEFAULT_ZOOM_START: f64 = 50.0;
const DEFAULT_ZOOM_END: f64 = 100.0;
const MIN_ZOOM_SPAN: f64 = 1.0;

/// Which optional series accompany the price series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndicatorSet {
    pub ma_short: Option<usize>,
    pub ma_long: Option<usize>,
    pub volume: bool,
}

impl Default for IndicatorSet {
    fn default() -> Self {
        IndicatorSet {
            ma_short: Some(MA_SHORT_PERIOD),
            ma_long: Some(MA_LONG_PERIOD),
            volume: true,
        }
    }
}

#[cfg(test)]
impl IndicatorSet {
    pub fn none() -> Self {
        IndicatorSet {
            ma_short: None,
            ma_long: None,
            volume: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SeriesRole {
    Price,
    MovingAverage,
    Volume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisGroup {
    Price,
    Volume,
}

/// Candlestick body in open, close, low, high order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CandleValue {
    pub open: f64,
    pub close: f64,
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "points", rename_all = "snake_case")]
pub enum SeriesData {
    Candles(Vec<CandleValue>),
    Line(Vec<Option<f64>>),
    Bars(Vec<VolumeBar>),
}

impl SeriesData {
    pub fn len(&self) -> usize {
        match self {
            SeriesData::Candles(points) => points.len(),
            SeriesData::Line(points) => points.len(),
            SeriesData::Bars(points) => points.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSeries {
    pub name: String,
    pub role: SeriesRole,
    pub axis_group: AxisGroup,
    pub data: SeriesData,
}

/// Brush window in percent of the category axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZoomWindow {
    start: f64,
    end: f64,
}

impl Default for ZoomWindow {
    fn default() -> Self {
        ZoomWindow {
            start: DEFAULT_ZOOM_START,
            end: DEFAULT_ZOOM_END,
        }
    }
}

impl ZoomWindow {
    pub fn new(start: f64, end: f64) -> Result<Self, ValidationError> {
        if !start.is_finite() || !end.is_finite() || start < 0.0 || end > 100.0 || start >= end {
            return Err(ValidationError::InvalidZoom { start, end });
        }
        Ok(ZoomWindow { start, end })
    }

    pub fn full() -> Self {
        ZoomWindow {
            start: 0.0,
            end: 100.0,
        }
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn span(&self) -> f64 {
        self.end - self.start
    }

    /// Index range of a category axis of length `len` covered by the window.
    /// A non-empty axis always yields at least one index.
    pub fn visible_range(&self, len: usize) -> Range<usize> {
        if len == 0 {
            return 0..0;
        }
        let total = len as f64;
        let first = ((self.start / 100.0) * total).floor() as usize;
        let last = ((self.end / 100.0) * total).ceil() as usize;
        let first = first.min(len - 1);
        let last = last.clamp(first + 1, len);
        first..last
    }

    /// Shifts the window by `delta` percentage points, keeping its span.
    pub fn pan(&mut self, delta: f64) {
        let span = self.span();
        let start = (self.start + delta).clamp(0.0, 100.0 - span);
        self.start = start;
        self.end = start + span;
    }

    /// Scales the span around the window's centre. `factor < 1` zooms in.
    pub fn zoom(&mut self, factor: f64) {
        if !factor.is_finite() || factor <= 0.0 {
            return;
        }
        let center = f64::midpoint(self.start, self.end);
        let span = (self.span() * factor).clamp(MIN_ZOOM_SPAN, 100.0);
        let start = (center - span / 2.0).clamp(0.0, 100.0 - span);
        self.start = start;
        self.end = start + span;
    }
}

/// Render-agnostic description of the dual-pane price/volume chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartSpec {
    pub categories: Vec<NaiveDate>,
    pub series: Vec<ChartSeries>,
    pub axis_groups: Vec<AxisGroup>,
    pub zoom_links: Vec<AxisGroup>,
    pub zoom: ZoomWindow,
}

impl ChartSpec {
    pub fn series_in(&self, group: AxisGroup) -> impl Iterator<Item = &ChartSeries> {
        self.series
            .iter()
            .filter(move |series| series.axis_group == group)
    }

    #[cfg(test)]
    pub fn price_series(&self) -> Option<&ChartSeries> {
        self.series
            .iter()
            .find(|series| series.role == SeriesRole::Price)
    }

    pub fn has_volume_pane(&self) -> bool {
        self.axis_groups.contains(&AxisGroup::Volume)
    }

    /// Every series must line up with the shared category axis.
    pub fn is_aligned(&self) -> bool {
        self.series
            .iter()
            .all(|series| series.data.len() == self.categories.len())
    }

    pub fn set_zoom(&mut self, zoom: ZoomWindow) {
        self.zoom = zoom;
    }
}

/// Builds the full chart description from scratch. Callers that toggle
/// indicators rebuild instead of patching an existing spec.
pub fn build_chart_spec(prices: &[PricePoint], enabled: IndicatorSet, zoom: ZoomWindow) -> ChartSpec {
    let categories: Vec<NaiveDate> = prices.iter().map(|point| point.trade_date).collect();
    let candles = prices
        .iter()
        .map(|point| CandleValue {
            open: point.open,
            close: point.close,
            low: point.low,
            high: point.high,
        })
        .collect();
    let mut series = vec![ChartSeries {
        name: "K线".to_string(),
        role: SeriesRole::Price,
        axis_group: AxisGroup::Price,
        data: SeriesData::Candles(candles),
    }];
    for window in [enabled.ma_short, enabled.ma_long].into_iter().flatten() {
        series.push(moving_average_series(compute_moving_average(window, prices)));
    }
    let mut axis_groups = vec![AxisGroup::Price];
    if enabled.volume {
        series.push(ChartSeries {
            name: "成交量".to_string(),
            role: SeriesRole::Volume,
            axis_group: AxisGroup::Volume,
            data: SeriesData::Bars(compute_volume_bars(prices)),
        });
        axis_groups.push(AxisGroup::Volume);
    }
    ChartSpec {
        categories,
        series,
        zoom_links: axis_groups.clone(),
        axis_groups,
        zoom,
    }
}

fn moving_average_series(indicator: IndicatorSeries) -> ChartSeries {
    ChartSeries {
        name: indicator.name,
        role: SeriesRole::MovingAverage,
        axis_group: AxisGroup::Price,
        data: SeriesData::Line(indicator.values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_prices(count: usize) -> Vec<PricePoint> {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        (0..count)
            .map(|i| {
                let open = 10.0 + i as f64;
                let close = if i % 2 == 0 { open + 0.5 } else { open - 0.5 };
                PricePoint::new(
                    start + chrono::Days::new(i as u64),
                    open,
                    open + 1.0,
                    open - 1.0,
                    close,
                    1_000 + i as u64,
                )
            })
            .collect()
    }

    #[test]
    fn short_ma_only_on_ten_points() {
        let prices = sample_prices(10);
        let enabled = IndicatorSet {
            ma_short: Some(5),
            ma_long: None,
            volume: false,
        };
        let spec = build_chart_spec(&prices, enabled, ZoomWindow::default());
        assert_eq!(spec.series.len(), 2);
        assert_eq!(spec.series[0].role, SeriesRole::Price);
        assert_eq!(spec.series[1].role, SeriesRole::MovingAverage);
        let SeriesData::Line(values) = &spec.series[1].data else {
            panic!("moving average should be a line series");
        };
        assert!(values[..4].iter().all(|value| value.is_none()));
        assert!(values[4..].iter().all(|value| value.is_some_and(f64::is_finite)));
        assert!(spec.is_aligned());
        assert!(!spec.has_volume_pane());
    }

    #[test]
    fn volume_lives_on_linked_secondary_axis() {
        let prices = sample_prices(6);
        let spec = build_chart_spec(&prices, IndicatorSet::default(), ZoomWindow::default());
        let volume: Vec<_> = spec.series_in(AxisGroup::Volume).collect();
        assert_eq!(volume.len(), 1);
        assert_eq!(volume[0].role, SeriesRole::Volume);
        assert_eq!(spec.zoom_links, vec![AxisGroup::Price, AxisGroup::Volume]);
        assert!(spec.is_aligned());

        let SeriesData::Bars(bars) = &volume[0].data else {
            panic!("volume should be a bar series");
        };
        assert_eq!(bars[0].direction, crate::indicators::VolumeDirection::Up);
        assert_eq!(bars[1].direction, crate::indicators::VolumeDirection::Down);
    }

    #[test]
    fn candles_use_open_close_low_high() {
        let prices = sample_prices(1);
        let spec = build_chart_spec(&prices, IndicatorSet::none(), ZoomWindow::full());
        let Some(ChartSeries {
            data: SeriesData::Candles(candles),
            ..
        }) = spec.price_series()
        else {
            panic!("price series missing");
        };
        assert_eq!(
            candles[0],
            CandleValue {
                open: 10.0,
                close: 10.5,
                low: 9.0,
                high: 11.0
            }
        );
    }

    #[test]
    fn toggling_indicators_rebuilds_series() {
        let prices = sample_prices(25);
        let full = build_chart_spec(&prices, IndicatorSet::default(), ZoomWindow::default());
        let bare = build_chart_spec(&prices, IndicatorSet::none(), ZoomWindow::default());
        assert_eq!(full.series.len(), 4);
        assert_eq!(bare.series.len(), 1);
        assert_eq!(bare.axis_groups, vec![AxisGroup::Price]);
    }

    #[test]
    fn zoom_window_rejects_bad_ranges() {
        assert!(ZoomWindow::new(60.0, 40.0).is_err());
        assert!(ZoomWindow::new(-1.0, 40.0).is_err());
        assert!(ZoomWindow::new(0.0, f64::NAN).is_err());
        assert!(ZoomWindow::new(0.0, 100.0).is_ok());
    }

    #[test]
    fn zoom_window_visible_range() {
        let zoom = ZoomWindow::default();
        assert_eq!(zoom.visible_range(10), 5..10);
        assert_eq!(ZoomWindow::full().visible_range(7), 0..7);
        assert_eq!(zoom.visible_range(0), 0..0);
        let narrow = ZoomWindow::new(99.5, 100.0).unwrap();
        assert_eq!(narrow.visible_range(3), 2..3);
    }

    #[test]
    fn pan_and_zoom_stay_in_bounds() {
        let mut zoom = ZoomWindow::default();
        zoom.pan(30.0);
        assert_eq!((zoom.start(), zoom.end()), (50.0, 100.0));
        zoom.pan(-70.0);
        assert_eq!((zoom.start(), zoom.end()), (0.0, 50.0));
        zoom.zoom(0.5);
        assert_eq!((zoom.start(), zoom.end()), (12.5, 37.5));
        zoom.zoom(10.0);
        assert_eq!((zoom.start(), zoom.end()), (0.0, 100.0));
    }
}
