pub use super::asset::Entity as Asset;
pub use super::candle_daily::Entity as CandleDaily;
pub use super::candle_fifteen::Entity as CandleFifteen;
pub use super::candle_hourly::Entity as CandleHourly;
pub use super::candle_weekly::Entity as CandleWeekly;
pub use super::price::Entity as Price;
pub use super::tx::Entity as Tx;
