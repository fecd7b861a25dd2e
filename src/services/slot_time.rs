//! Slot and wall-clock time conversion plus candle bucket alignment

use chrono::{Datelike, Duration, FixedOffset, Offset, TimeZone, Utc};

use crate::models::candle::Resolution;

/// Seconds between the Shelley slot numbering and unix time on mainnet
pub const MAINNET_SLOT_TIME_OFFSET: i64 = 1_591_566_291;

/// First DEX activity on mainnet, used when nothing has been indexed yet
pub const DEX_LAUNCH_TIME: i64 = 1_641_967_200;

/// Stateless conversion helper, built once at start-up and shared
#[derive(Debug, Clone, Copy)]
pub struct SlotClock {
    offset: i64,
    tz: FixedOffset,
}

impl Default for SlotClock {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl SlotClock {
    pub fn new(offset: i64, tz: FixedOffset) -> Self {
        Self { offset, tz }
    }

    pub fn mainnet() -> Self {
        Self::new(MAINNET_SLOT_TIME_OFFSET, Utc.fix())
    }

    /// Mainnet clock with weekly candles aligned to the given UTC offset.
    /// Out of range offsets fall back to UTC.
    pub fn mainnet_with_tz_offset(offset_secs: i32) -> Self {
        let tz = FixedOffset::east_opt(offset_secs).unwrap_or_else(|| Utc.fix());
        Self::new(MAINNET_SLOT_TIME_OFFSET, tz)
    }

    pub fn slot_to_time(&self, slot: u64) -> i64 {
        slot as i64 + self.offset
    }

    pub fn time_to_slot(&self, time: i64) -> u64 {
        (time - self.offset).max(0) as u64
    }

    pub fn now(&self) -> i64 {
        Utc::now().timestamp()
    }

    /// Start of the bucket containing `time`.
    ///
    /// Weekly buckets start on Monday 00:00 in the clock's zone, all others are
    /// epoch aligned multiples of the resolution.
    pub fn bucket_start(&self, resolution: Resolution, time: i64) -> i64 {
        match resolution {
            Resolution::Week => self.week_start(time),
            other => {
                let duration = other.duration_secs();
                time.div_euclid(duration) * duration
            }
        }
    }

    fn week_start(&self, time: i64) -> i64 {
        let Some(local) = self.tz.timestamp_opt(time, 0).single() else {
            return time;
        };
        let monday = local.date_naive()
            - Duration::days(local.weekday().num_days_from_monday() as i64);
        monday
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| self.tz.from_local_datetime(&midnight).single())
            .map(|dt| dt.timestamp())
            .unwrap_or(time)
    }
}
