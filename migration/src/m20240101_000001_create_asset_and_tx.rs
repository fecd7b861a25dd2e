use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Asset::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Asset::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Asset::Unit).string().not_null().unique_key())
                    .col(ColumnDef::new(Asset::Policy).string_len(56).not_null())
                    .col(ColumnDef::new(Asset::NativeName).string().not_null())
                    .col(ColumnDef::new(Asset::Decimals).integer().null())
                    .col(ColumnDef::new(Asset::MetadataFetched).boolean().null())
                    .col(ColumnDef::new(Asset::Price).double().null())
                    .col(ColumnDef::new(Asset::AdaPrice).double().null())
                    .col(ColumnDef::new(Asset::LastPriceUpdate).big_integer().null())
                    .col(ColumnDef::new(Asset::PricingProvider).integer().null())
                    .to_owned(),
            )
            .await?;

        // Partial scans for assets still waiting on metadata
        manager
            .create_index(
                Index::create()
                    .name("idx_asset_metadata_fetched")
                    .table(Asset::Table)
                    .col(Asset::MetadataFetched)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Tx::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Tx::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Tx::Hash).binary().not_null().unique_key())
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Tx::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Asset::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Asset {
    Table,
    Id,
    Unit,
    Policy,
    NativeName,
    Decimals,
    MetadataFetched,
    Price,
    AdaPrice,
    LastPriceUpdate,
    PricingProvider,
}

#[derive(Iden)]
enum Tx {
    Table,
    Id,
    Hash,
}
