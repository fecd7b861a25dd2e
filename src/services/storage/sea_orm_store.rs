//! PostgreSQL store backed by SeaORM

use async_trait::async_trait;
use sea_orm::sea_query::{Expr, Func, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, Statement,
};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::{LatestPriceUpdate, NewAsset, Store, validate_view_name};
use crate::entities::{asset, price, price::PriceKey, tx};
use crate::error::StoreError;
use crate::models::candle::{Candle, Resolution};

const CANDLE_SYNC_POINT_SQL: &str = r#"
    SELECT MIN(max_time) AS sync_point_time
    FROM (
        SELECT MAX(time) AS max_time
        FROM candle_fifteen
        GROUP BY symbol
    ) latest
"#;

/// Runs `$body` with `$module` bound to the candle entity module of `$resolution`
macro_rules! with_candle_entity {
    ($resolution:expr, $module:ident => $body:expr) => {
        match $resolution {
            Resolution::Week => {
                use crate::entities::candle_weekly as $module;
                $body
            }
            Resolution::Day => {
                use crate::entities::candle_daily as $module;
                $body
            }
            Resolution::Hour => {
                use crate::entities::candle_hourly as $module;
                $body
            }
            Resolution::FifteenMinutes => {
                use crate::entities::candle_fifteen as $module;
                $body
            }
        }
    };
}

#[derive(Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn price_active_model(p: &price::Model) -> price::ActiveModel {
    price::ActiveModel {
        time: Set(p.time),
        tx_id: Set(p.tx_id),
        tx_swap_idx: Set(p.tx_swap_idx),
        asset_id: Set(p.asset_id),
        quote_asset_id: Set(p.quote_asset_id),
        provider: Set(p.provider),
        price: Set(p.price),
        amount1: Set(p.amount1),
        amount2: Set(p.amount2),
        operation: Set(p.operation),
        outlier: Set(p.outlier),
    }
}

#[async_trait]
impl Store for SeaOrmStore {
    async fn find_assets_by_units(&self, units: &[String]) -> Result<Vec<asset::Model>, StoreError> {
        if units.is_empty() {
            return Ok(vec![]);
        }
        Ok(asset::Entity::find()
            .filter(asset::Column::Unit.is_in(units.iter().cloned()))
            .all(&self.db)
            .await?)
    }

    async fn insert_assets(&self, assets: &[NewAsset]) -> Result<(), StoreError> {
        if assets.is_empty() {
            return Ok(());
        }
        let models = assets.iter().map(|a| asset::ActiveModel {
            unit: Set(a.unit.clone()),
            policy: Set(a.policy.clone()),
            native_name: Set(a.native_name.clone()),
            decimals: Set(a.decimals),
            metadata_fetched: Set(Some(a.metadata_fetched)),
            ..Default::default()
        });
        asset::Entity::insert_many(models)
            .on_conflict(OnConflict::column(asset::Column::Unit).do_nothing().to_owned())
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    async fn assets_pending_metadata(&self, limit: u64) -> Result<Vec<asset::Model>, StoreError> {
        Ok(asset::Entity::find()
            .filter(asset::Column::MetadataFetched.eq(false))
            .order_by_asc(asset::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    async fn update_asset_metadata(&self, asset_id: i64, decimals: Option<i32>) -> Result<(), StoreError> {
        asset::Entity::update_many()
            .col_expr(asset::Column::Decimals, Expr::value(decimals))
            .col_expr(asset::Column::MetadataFetched, Expr::value(true))
            .filter(asset::Column::Id.eq(asset_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn update_latest_prices(&self, updates: &[LatestPriceUpdate]) -> Result<u64, StoreError> {
        let mut changed = 0;
        for update in updates {
            let mut query = asset::Entity::update_many()
                .col_expr(asset::Column::Price, Expr::value(update.price))
                .col_expr(asset::Column::LastPriceUpdate, Expr::value(update.time))
                .col_expr(asset::Column::PricingProvider, Expr::value(update.provider));
            if let Some(ada_price) = update.ada_price {
                query = query.col_expr(asset::Column::AdaPrice, Expr::value(ada_price));
            }
            let result = query
                .filter(asset::Column::Id.eq(update.asset_id))
                .filter(
                    Condition::any()
                        .add(asset::Column::LastPriceUpdate.is_null())
                        .add(asset::Column::LastPriceUpdate.lte(update.time)),
                )
                .exec(&self.db)
                .await?;
            changed += result.rows_affected;
        }
        Ok(changed)
    }

    async fn resolve_tx_ids(&self, hashes: &[String]) -> Result<HashMap<String, i64>, StoreError> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let raw: Vec<Vec<u8>> = hashes
            .iter()
            .map(|h| hex::decode(h).map_err(|_| StoreError::InvalidHash(h.clone())))
            .collect::<Result<_, _>>()?;

        let models = raw.iter().map(|hash| tx::ActiveModel {
            hash: Set(hash.clone()),
            ..Default::default()
        });
        tx::Entity::insert_many(models)
            .on_conflict(OnConflict::column(tx::Column::Hash).do_nothing().to_owned())
            .exec_without_returning(&self.db)
            .await?;

        let rows = tx::Entity::find()
            .filter(tx::Column::Hash.is_in(raw))
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(|t| (hex::encode(t.hash), t.id)).collect())
    }

    async fn existing_price_keys(&self, keys: &[PriceKey]) -> Result<HashSet<PriceKey>, StoreError> {
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let wanted: HashSet<PriceKey> = keys.iter().copied().collect();
        let times: HashSet<i64> = keys.iter().map(|k| k.time).collect();
        let tx_ids: HashSet<i64> = keys.iter().map(|k| k.tx_id).collect();

        let rows: Vec<(i64, i64, i32)> = price::Entity::find()
            .select_only()
            .column(price::Column::Time)
            .column(price::Column::TxId)
            .column(price::Column::TxSwapIdx)
            .filter(price::Column::Time.is_in(times))
            .filter(price::Column::TxId.is_in(tx_ids))
            .into_tuple()
            .all(&self.db)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(time, tx_id, tx_swap_idx)| PriceKey { time, tx_id, tx_swap_idx })
            .filter(|k| wanted.contains(k))
            .collect())
    }

    async fn upsert_prices(&self, prices: &[price::Model]) -> Result<(), StoreError> {
        if prices.is_empty() {
            return Ok(());
        }
        price::Entity::insert_many(prices.iter().map(price_active_model))
            .on_conflict(
                OnConflict::columns([
                    price::Column::Time,
                    price::Column::TxId,
                    price::Column::TxSwapIdx,
                ])
                .update_columns([
                    price::Column::AssetId,
                    price::Column::QuoteAssetId,
                    price::Column::Provider,
                    price::Column::Price,
                    price::Column::Amount1,
                    price::Column::Amount2,
                    price::Column::Operation,
                ])
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        debug!(count = prices.len(), "Upserted prices");
        Ok(())
    }

    async fn candle_sync_point_time(&self) -> Result<Option<i64>, StoreError> {
        let row = self
            .db
            .query_one(Statement::from_string(DbBackend::Postgres, CANDLE_SYNC_POINT_SQL))
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<Option<i64>>("", "sync_point_time")?),
            None => Ok(None),
        }
    }

    async fn outlier_candidate_pairs(&self, from_time: i64) -> Result<Vec<(i64, i64)>, StoreError> {
        Ok(price::Entity::find()
            .select_only()
            .column(price::Column::AssetId)
            .column(price::Column::QuoteAssetId)
            .filter(price::Column::Time.gte(from_time))
            .filter(price::Column::Outlier.is_null())
            .distinct()
            .into_tuple()
            .all(&self.db)
            .await?)
    }

    async fn prices_for_pair(
        &self,
        asset_id: i64,
        quote_asset_id: i64,
        from_time: i64,
    ) -> Result<Vec<price::Model>, StoreError> {
        Ok(price::Entity::find()
            .filter(price::Column::AssetId.eq(asset_id))
            .filter(price::Column::QuoteAssetId.eq(quote_asset_id))
            .filter(price::Column::Time.gte(from_time))
            .filter(price::Column::Outlier.is_null())
            .order_by_asc(price::Column::Time)
            .order_by_asc(price::Column::TxId)
            .order_by_asc(price::Column::TxSwapIdx)
            .all(&self.db)
            .await?)
    }

    async fn average_price(
        &self,
        asset_id: i64,
        quote_asset_id: i64,
        from_time: i64,
    ) -> Result<Option<f64>, StoreError> {
        let avg: Option<Option<f64>> = price::Entity::find()
            .select_only()
            .column_as(Expr::expr(Func::avg(Expr::col(price::Column::Price))), "avg_price")
            .filter(price::Column::AssetId.eq(asset_id))
            .filter(price::Column::QuoteAssetId.eq(quote_asset_id))
            .filter(price::Column::Time.gte(from_time))
            .filter(
                Condition::any()
                    .add(price::Column::Outlier.is_null())
                    .add(price::Column::Outlier.eq(false)),
            )
            .into_tuple()
            .one(&self.db)
            .await?;
        Ok(avg.flatten())
    }

    async fn mark_outliers(&self, keys: &[PriceKey]) -> Result<u64, StoreError> {
        let mut marked = 0;
        for key in keys {
            let result = price::Entity::update_many()
                .col_expr(price::Column::Outlier, Expr::value(true))
                .filter(price::Column::Time.eq(key.time))
                .filter(price::Column::TxId.eq(key.tx_id))
                .filter(price::Column::TxSwapIdx.eq(key.tx_swap_idx))
                .exec(&self.db)
                .await?;
            marked += result.rows_affected;
        }
        Ok(marked)
    }

    async fn get_candle(
        &self,
        resolution: Resolution,
        symbol: &str,
        time: i64,
    ) -> Result<Option<Candle>, StoreError> {
        with_candle_entity!(resolution, candle => {
            let row = candle::Entity::find_by_id((symbol.to_string(), time))
                .one(&self.db)
                .await?;
            Ok(row.map(|c| Candle {
                symbol: c.symbol,
                time: c.time,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                volume: c.volume,
            }))
        })
    }

    async fn upsert_candles(&self, resolution: Resolution, candles: &[Candle]) -> Result<(), StoreError> {
        if candles.is_empty() {
            return Ok(());
        }
        with_candle_entity!(resolution, candle => {
            let models = candles.iter().map(|c| candle::ActiveModel {
                symbol: Set(c.symbol.clone()),
                time: Set(c.time),
                open: Set(c.open),
                high: Set(c.high),
                low: Set(c.low),
                close: Set(c.close),
                volume: Set(c.volume),
            });
            candle::Entity::insert_many(models)
                .on_conflict(
                    OnConflict::columns([candle::Column::Symbol, candle::Column::Time])
                        .update_columns([
                            candle::Column::Open,
                            candle::Column::High,
                            candle::Column::Low,
                            candle::Column::Close,
                            candle::Column::Volume,
                        ])
                        .to_owned(),
                )
                .exec_without_returning(&self.db)
                .await?;
            Ok(())
        })
    }

    async fn refresh_view(&self, name: &str) -> Result<(), StoreError> {
        validate_view_name(name)?;
        self.db
            .execute_unprepared(&format!("REFRESH MATERIALIZED VIEW CONCURRENTLY {}", name))
            .await?;
        Ok(())
    }
}
