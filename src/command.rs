use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::tracker::SyncJob;

#[derive(Debug, Clone)]
pub enum Command {
    SyncProgress(SyncJob),
    SyncFinished { message: String, refresh_listing: bool },
    SyncFailed(String),
    SyncTimedOut,
    Error(String),
    Exit,
}

/// One trading session. Sequences are chronological with no gap filling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub trade_date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl PricePoint {
    pub fn new(trade_date: NaiveDate, open: f64, high: f64, low: f64, close: f64, volume: u64) -> Self {
        PricePoint {
            trade_date,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    pub fn is_up(&self) -> bool {
        self.close > self.open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Frequency {
    #[default]
    #[serde(rename = "D")]
    Daily,
    #[serde(rename = "W")]
    Weekly,
    #[serde(rename = "M")]
    Monthly,
}

impl Frequency {
    pub fn label(&self) -> &'static str {
        match self {
            Frequency::Daily => "日线",
            Frequency::Weekly => "周线",
            Frequency::Monthly => "月线",
        }
    }
}

impl std::str::FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "D" => Ok(Frequency::Daily),
            "W" => Ok(Frequency::Weekly),
            "M" => Ok(Frequency::Monthly),
            other => Err(format!("unsupported frequency `{other}` (use D, W, or M)")),
        }
    }
}

/// Input rejected before it reaches the pure analytics functions.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{key} {side} bound must be a finite number")]
    NonFiniteBound { key: String, side: &'static str },

    #[error("{key} lower bound is greater than its upper bound")]
    InvertedBounds { key: String },

    #[error("moving average window must be positive, got {0}")]
    InvalidWindow(usize),

    #[error("unknown filter key `{0}`")]
    UnknownFilterKey(String),

    #[error("zoom window must satisfy 0 <= start < end <= 100, got {start}:{end}")]
    InvalidZoom { start: f64, end: f64 },
}
