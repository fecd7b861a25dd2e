use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Price::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Price::Time).big_integer().not_null())
                    .col(ColumnDef::new(Price::TxId).big_integer().not_null())
                    .col(ColumnDef::new(Price::TxSwapIdx).integer().not_null())
                    .col(ColumnDef::new(Price::AssetId).big_integer().not_null())
                    .col(ColumnDef::new(Price::QuoteAssetId).big_integer().not_null())
                    .col(ColumnDef::new(Price::Provider).integer().not_null())
                    .col(ColumnDef::new(Price::Price).float().not_null())
                    .col(ColumnDef::new(Price::Amount1).decimal_len(38, 0).not_null())
                    .col(ColumnDef::new(Price::Amount2).decimal_len(38, 0).not_null())
                    .col(ColumnDef::new(Price::Operation).integer().not_null())
                    .col(ColumnDef::new(Price::Outlier).boolean().null())
                    .primary_key(
                        Index::create()
                            .col(Price::Time)
                            .col(Price::TxId)
                            .col(Price::TxSwapIdx),
                    )
                    .to_owned(),
            )
            .await?;

        // Pair history scans by the outlier detector
        manager
            .create_index(
                Index::create()
                    .name("idx_price_pair_time")
                    .table(Price::Table)
                    .col(Price::AssetId)
                    .col(Price::QuoteAssetId)
                    .col(Price::Time)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Price::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Price {
    Table,
    Time,
    TxId,
    TxSwapIdx,
    AssetId,
    QuoteAssetId,
    Provider,
    Price,
    Amount1,
    Amount2,
    Operation,
    Outlier,
}
