//! Candle resolutions and the resolution-independent candle record

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    Week,
    Day,
    Hour,
    FifteenMinutes,
}

impl Resolution {
    /// Largest to smallest
    pub const ALL: [Resolution; 4] = [
        Resolution::Week,
        Resolution::Day,
        Resolution::Hour,
        Resolution::FifteenMinutes,
    ];

    pub fn duration_secs(&self) -> i64 {
        match self {
            Resolution::Week => 7 * 86_400,
            Resolution::Day => 86_400,
            Resolution::Hour => 3_600,
            Resolution::FifteenMinutes => 900,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Resolution::Week => "1W",
            Resolution::Day => "1D",
            Resolution::Hour => "1h",
            Resolution::FifteenMinutes => "15m",
        }
    }

    pub fn smallest() -> Resolution {
        Resolution::FifteenMinutes
    }
}

/// OHLCV record for one (symbol, bucket) of a resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn opened_at(symbol: String, time: i64, price: f64, volume: f64) -> Self {
        Self {
            symbol,
            time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    /// Folds one more price into the bucket
    pub fn apply(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }
}

/// Candle symbol of an asset pair
pub fn candle_symbol(asset_id: i64, quote_asset_id: i64) -> String {
    format!("{}:{}", asset_id, quote_asset_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_durations() {
        assert_eq!(Resolution::Week.duration_secs(), 604_800);
        assert_eq!(Resolution::Day.duration_secs(), 86_400);
        assert_eq!(Resolution::Hour.duration_secs(), 3_600);
        assert_eq!(Resolution::FifteenMinutes.duration_secs(), 900);
        assert_eq!(Resolution::smallest().label(), "15m");
    }

    #[test]
    fn test_apply_keeps_ohlc_bounds() {
        let mut candle = Candle::opened_at(candle_symbol(2, 1), 900, 1.0, 10.0);
        for (price, volume) in [(1.5, 1.0), (0.4, 2.0), (0.9, 3.0)] {
            candle.apply(price, volume);
            assert!(candle.low <= candle.open && candle.open <= candle.high);
            assert!(candle.low <= candle.close && candle.close <= candle.high);
        }
        assert_eq!(candle.open, 1.0);
        assert_eq!(candle.high, 1.5);
        assert_eq!(candle.low, 0.4);
        assert_eq!(candle.close, 0.9);
        assert_eq!(candle.volume, 16.0);
        assert_eq!(candle.symbol, "2:1");
    }
}
