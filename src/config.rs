use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

use crate::api::{ApiConfig, DailySyncRequest, PriceRangeRequest, SyncType};
use crate::chart::{IndicatorSet, ZoomWindow};
use crate::command::Frequency;
use crate::filters::{Bound, ExportFileType, FilterBounds, FilterKey};
use crate::indicators::{MA_LONG_PERIOD, MA_SHORT_PERIOD};
use crate::tracker::TrackerConfig;

#[derive(Parser, Clone, Debug)]
#[clap(name = "equity-scope", about = "Equity analytics dashboard client")]
pub struct CliParams {
    /// Base URL of the dashboard API
    #[clap(
        long = "api-base",
        env = "EQUITY_API_BASE",
        default_value = "http://127.0.0.1:8000/api",
        global = true
    )]
    pub api_base: String,

    /// Bearer token sent with every request
    #[clap(long = "token", env = "EQUITY_API_TOKEN", global = true)]
    pub token: Option<String>,

    /// File that receives tracing output
    #[clap(long = "log-file", default_value = "equity-scope.log", global = true)]
    pub log_file: PathBuf,

    #[clap(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Clone, Debug)]
pub enum CliCommand {
    /// Price chart with moving averages and volume
    Chart(ChartArgs),
    /// Run a screening query
    Screen(ScreenArgs),
    /// Export screening results to a file
    Export(ExportArgs),
    /// Start a sync job and track it to completion
    #[clap(subcommand)]
    Sync(SyncCommand),
    /// Recent sync outcomes recorded by this client
    History {
        #[clap(long, default_value_t = 20)]
        limit: usize,
    },
    /// Market capitalisation distribution
    MarketCap {
        /// Print JSON instead of a table
        #[clap(long)]
        json: bool,
    },
}

#[derive(Args, Clone, Debug)]
pub struct ChartArgs {
    #[clap(long)]
    pub symbol: String,

    /// First trading date, YYYY-MM-DD
    #[clap(long)]
    pub start: NaiveDate,

    /// Last trading date, YYYY-MM-DD
    #[clap(long)]
    pub end: NaiveDate,

    /// Bar frequency (D, W, or M)
    #[clap(long = "freq", default_value = "D")]
    pub frequency: Frequency,

    #[clap(long = "ma-short", default_value_t = MA_SHORT_PERIOD)]
    pub ma_short: usize,

    #[clap(long = "ma-long", default_value_t = MA_LONG_PERIOD)]
    pub ma_long: usize,

    #[clap(long = "no-ma-short")]
    pub no_ma_short: bool,

    #[clap(long = "no-ma-long")]
    pub no_ma_long: bool,

    #[clap(long = "no-volume")]
    pub no_volume: bool,

    /// Initial visible window in percent of the series, START:END
    #[clap(long = "zoom", value_name = "START:END", default_value = "50:100")]
    pub zoom: ZoomSpec,

    /// Print the chart description as JSON instead of drawing it
    #[clap(long)]
    pub json: bool,
}

impl ChartArgs {
    pub fn indicator_set(&self) -> IndicatorSet {
        IndicatorSet {
            ma_short: (!self.no_ma_short).then_some(self.ma_short),
            ma_long: (!self.no_ma_long).then_some(self.ma_long),
            volume: !self.no_volume,
        }
    }

    pub fn price_request(&self) -> PriceRangeRequest {
        PriceRangeRequest {
            symbol: self.symbol.trim().to_string(),
            start_date: self.start,
            end_date: self.end,
            frequency: self.frequency,
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct FilterArgs {
    /// Bound in display units, KEY:MIN:MAX; either side may be empty
    #[clap(long = "filter", value_name = "KEY:MIN:MAX")]
    pub filters: Vec<FilterSpec>,

    /// JSON preset of saved filter bounds; --filter entries override it
    #[clap(long = "preset", value_name = "FILE")]
    pub preset: Option<PathBuf>,

    #[clap(long = "macd-golden-cross")]
    pub macd_golden_cross: bool,

    #[clap(long = "kdj-golden-cross")]
    pub kdj_golden_cross: bool,

    /// Write the effective filters back out as a preset
    #[clap(long = "save-preset", value_name = "FILE")]
    pub save_preset: Option<PathBuf>,
}

impl FilterArgs {
    /// Preset bounds, then command line bounds and flags on top.
    pub fn filter_bounds(&self) -> AnyResult<FilterBounds> {
        let mut bounds = match &self.preset {
            Some(path) => load_preset(path)?,
            None => FilterBounds::new(),
        };
        let mut overrides = FilterBounds::new();
        for spec in &self.filters {
            overrides.set(spec.key, Bound::new(spec.min, spec.max));
        }
        bounds.merge(&overrides);
        bounds.flags.macd_golden_cross |= self.macd_golden_cross;
        bounds.flags.kdj_golden_cross |= self.kdj_golden_cross;
        Ok(bounds)
    }

    /// Writes `bounds` to `--save-preset`, if given. Presets keep display
    /// units exactly as entered.
    pub fn persist(&self, bounds: &FilterBounds) -> AnyResult<Option<&Path>> {
        match &self.save_preset {
            Some(path) => {
                save_preset(path, bounds)?;
                Ok(Some(path.as_path()))
            }
            None => Ok(None),
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct ScreenArgs {
    #[clap(flatten)]
    pub filters: FilterArgs,

    #[clap(long)]
    pub json: bool,
}

#[derive(Args, Clone, Debug)]
pub struct ExportArgs {
    #[clap(flatten)]
    pub filters: FilterArgs,

    #[clap(long = "file-type", default_value = "csv")]
    pub file_type: ExportFileType,

    /// Destination file; defaults to screening_result.<ext>
    #[clap(long = "output")]
    pub output: Option<PathBuf>,
}

impl ExportArgs {
    pub fn output_path(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(|| {
            PathBuf::from(format!("screening_result.{}", self.file_type.extension()))
        })
    }
}

#[derive(Subcommand, Clone, Debug)]
pub enum SyncCommand {
    /// Daily bars for a date range
    Daily {
        #[clap(long)]
        start: NaiveDate,

        #[clap(long)]
        end: NaiveDate,

        /// Restrict the job to these symbols; comma separated
        #[clap(long, value_delimiter = ',', num_args = 1..)]
        symbols: Vec<String>,

        #[clap(long = "sync-type", default_value = "incremental")]
        sync_type: SyncType,

        #[clap(flatten)]
        tracking: TrackingArgs,
    },
    /// Stock listing refresh
    Stocks {
        #[clap(flatten)]
        tracking: TrackingArgs,
    },
}

impl SyncCommand {
    pub fn job_name(&self) -> &'static str {
        match self {
            SyncCommand::Daily { .. } => "daily",
            SyncCommand::Stocks { .. } => "stocks",
        }
    }

    pub fn tracking(&self) -> &TrackingArgs {
        match self {
            SyncCommand::Daily { tracking, .. } | SyncCommand::Stocks { tracking } => tracking,
        }
    }

    pub fn daily_request(&self) -> Option<DailySyncRequest> {
        match self {
            SyncCommand::Daily {
                start,
                end,
                symbols,
                sync_type,
                ..
            } => {
                let symbols: Vec<String> = symbols
                    .iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                Some(DailySyncRequest {
                    start_date: *start,
                    end_date: *end,
                    symbols: (!symbols.is_empty()).then_some(symbols),
                    sync_type: *sync_type,
                })
            }
            SyncCommand::Stocks { .. } => None,
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct TrackingArgs {
    /// Delay between progress polls (e.g., 500ms, 1s)
    #[clap(long = "poll-interval", value_name = "DURATION", default_value = "1s")]
    pub poll_interval: DurationSpec,

    /// Wait after completion before reporting it
    #[clap(long = "grace", value_name = "DURATION", default_value = "1s")]
    pub grace: DurationSpec,

    /// Give up when no terminal status arrives in time (e.g., 30m)
    #[clap(long = "timeout", value_name = "DURATION")]
    pub timeout: Option<DurationSpec>,

    /// Log progress lines instead of drawing a gauge
    #[clap(long)]
    pub headless: bool,
}

impl TrackingArgs {
    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            poll_interval: self.poll_interval.as_duration(),
            grace_period: self.grace.as_duration(),
            timeout: self.timeout.map(|spec| spec.as_duration()),
        }
    }
}

impl CliParams {
    pub fn api_config(&self) -> ApiConfig {
        let token = self
            .token
            .as_ref()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        ApiConfig {
            base_url: normalize_endpoint(&self.api_base),
            token,
        }
    }
}

fn save_preset(path: &Path, bounds: &FilterBounds) -> AnyResult<()> {
    let payload = serde_json::to_string_pretty(bounds)?;
    fs::write(path, payload).with_context(|| format!("无法写入 {}", path.display()))
}

fn load_preset(path: &Path) -> AnyResult<FilterBounds> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("读取 {} 失败", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("解析 {} 失败", path.display()))
}

fn normalize_endpoint(value: &str) -> String {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "http://127.0.0.1:8000/api".to_string()
    } else {
        trimmed.to_string()
    }
}

/// One `--filter` entry. `pe::30` sets only an upper bound.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterSpec {
    pub key: FilterKey,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl FromStr for FilterSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let key = parts
            .next()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| "filter spec must start with a key".to_string())?
            .parse::<FilterKey>()
            .map_err(|err| err.to_string())?;
        let min = parts
            .next()
            .ok_or_else(|| "filter spec must include a min slot (may be empty)".to_string())
            .and_then(|value| parse_bound_side(value, "min"))?;
        let max = parts
            .next()
            .ok_or_else(|| "filter spec must include a max slot (may be empty)".to_string())
            .and_then(|value| parse_bound_side(value, "max"))?;
        if parts.next().is_some() {
            return Err("filter spec should only have KEY:MIN:MAX".to_string());
        }
        if min.is_none() && max.is_none() {
            return Err(format!("filter `{key}` needs at least one bound"));
        }
        Ok(FilterSpec { key, min, max })
    }
}

fn parse_bound_side(value: &str, side: &str) -> Result<Option<f64>, String> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    let parsed = value
        .parse::<f64>()
        .map_err(|_| format!("invalid {side} value: {value}"))?;
    if !parsed.is_finite() {
        return Err(format!("{side} value must be finite: {value}"));
    }
    Ok(Some(parsed))
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ZoomSpec(ZoomWindow);

impl ZoomSpec {
    pub fn window(&self) -> ZoomWindow {
        self.0
    }
}

impl FromStr for ZoomSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once(':')
            .ok_or_else(|| "zoom spec must look like START:END (e.g., 50:100)".to_string())?;
        let start: f64 = start
            .trim()
            .parse()
            .map_err(|_| format!("invalid zoom start: {start}"))?;
        let end: f64 = end
            .trim()
            .parse()
            .map_err(|_| format!("invalid zoom end: {end}"))?;
        ZoomWindow::new(start, end)
            .map(ZoomSpec)
            .map_err(|err| err.to_string())
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DurationSpec(Duration);

impl DurationSpec {
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl FromStr for DurationSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let duration = parse_duration_spec(s)?;
        Ok(DurationSpec(duration))
    }
}

fn parse_duration_spec(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("duration spec cannot be empty (examples: 500ms, 1s, 30m)".to_string());
    }
    let split_idx = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| "duration spec must end with a unit like ms, s, m, h, or d".to_string())?;
    if split_idx == 0 {
        return Err("duration spec must start with a number (examples: 1s, 30m)".to_string());
    }
    let (value_part, unit_part) = trimmed.split_at(split_idx);
    let value: f64 = value_part
        .parse()
        .map_err(|_| format!("invalid numeric portion `{value_part}` in duration spec `{trimmed}`"))?;
    let unit = unit_part.trim().to_lowercase();
    let seconds_multiplier = match unit.as_str() {
        "ms" | "msec" | "millis" => 0.001,
        "s" | "sec" | "secs" | "second" | "seconds" => 1.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 60.0 * 60.0,
        "d" | "day" | "days" => 60.0 * 60.0 * 24.0,
        other => {
            return Err(format!(
                "unsupported duration unit `{other}` (use ms, s, m, h, or d)"
            ));
        }
    };
    let seconds = value * seconds_multiplier;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(format!("duration must be positive: `{trimmed}`"));
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| format!("duration `{trimmed}` is too large"))
}
