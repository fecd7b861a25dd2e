pub use sea_orm_migration::prelude::*;

mod m20240101_000001_create_asset_and_tx;
mod m20240101_000002_create_price;
mod m20240101_000003_create_candles;
mod m20240101_000004_create_latest_candle_view;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_asset_and_tx::Migration),
            Box::new(m20240101_000002_create_price::Migration),
            Box::new(m20240101_000003_create_candles::Migration),
            Box::new(m20240101_000004_create_latest_candle_view::Migration),
        ]
    }
}
