// =============================================================================
// Market data — bars, timeframes, cache, symbol universe
// =============================================================================

pub mod cache;
pub mod universe;

pub use cache::BarCache;
pub use universe::{SymbolMeta, Tier, Universe};

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

// ---------------------------------------------------------------------------
// Timeframe
// ---------------------------------------------------------------------------

/// Bar timeframe. The engine trades on 30-minute bars; smaller frames are
/// used for opening-range tracking and the daily frame for session VWAP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "5min")]
    Min5,
    #[serde(rename = "15min")]
    Min15,
    #[serde(rename = "30min")]
    Min30,
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "1d")]
    Day1,
}

impl Timeframe {
    pub fn secs(self) -> i64 {
        match self {
            Self::Min5 => 300,
            Self::Min15 => 900,
            Self::Min30 => 1_800,
            Self::Hour1 => 3_600,
            Self::Day1 => 86_400,
        }
    }

    pub fn millis(self) -> i64 {
        self.secs() * 1_000
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Min5 => write!(f, "5min"),
            Self::Min15 => write!(f, "15min"),
            Self::Min30 => write!(f, "30min"),
            Self::Hour1 => write!(f, "1h"),
            Self::Day1 => write!(f, "1d"),
        }
    }
}

// ---------------------------------------------------------------------------
// Bar
// ---------------------------------------------------------------------------

/// A single OHLCV bar. Immutable once produced by the data feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Bar open time, epoch milliseconds UTC.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Epoch milliseconds at which this bar completed.
    pub fn close_time(&self) -> i64 {
        self.open_time + self.timeframe.millis()
    }

    /// Enforce the OHLC invariant:
    /// high >= max(open, close) >= min(open, close) >= low, volume >= 0.
    pub fn validate(&self) -> Result<(), EngineError> {
        let body_high = self.open.max(self.close);
        let body_low = self.open.min(self.close);

        let reason = if !(self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite())
        {
            Some("non-finite field".to_string())
        } else if self.high < body_high {
            Some(format!("high {} below body high {}", self.high, body_high))
        } else if self.low > body_low {
            Some(format!("low {} above body low {}", self.low, body_low))
        } else if self.volume < 0.0 {
            Some(format!("negative volume {}", self.volume))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(EngineError::InvalidBar {
                symbol: self.symbol.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// Composite key identifying a unique bar series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct BarKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl BarKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for BarKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

/// Extract closing prices from a bar slice (oldest first).
pub fn closes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

/// Extract volumes from a bar slice (oldest first).
pub fn volumes(bars: &[Bar]) -> Vec<f64> {
    bars.iter().map(|b| b.volume).collect()
}
