use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

/// One table per candle resolution
const CANDLE_TABLES: [&str; 4] = [
    "candle_weekly",
    "candle_daily",
    "candle_hourly",
    "candle_fifteen",
];

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for table in CANDLE_TABLES {
            manager
                .create_table(
                    Table::create()
                        .table(Alias::new(table))
                        .if_not_exists()
                        .col(ColumnDef::new(Candle::Symbol).string().not_null())
                        .col(ColumnDef::new(Candle::Time).big_integer().not_null())
                        .col(ColumnDef::new(Candle::Open).double().not_null())
                        .col(ColumnDef::new(Candle::High).double().not_null())
                        .col(ColumnDef::new(Candle::Low).double().not_null())
                        .col(ColumnDef::new(Candle::Close).double().not_null())
                        .col(ColumnDef::new(Candle::Volume).double().not_null())
                        .primary_key(Index::create().col(Candle::Symbol).col(Candle::Time))
                        .to_owned(),
                )
                .await?;

            // Latest candle per symbol lookups
            manager
                .create_index(
                    Index::create()
                        .name(format!("idx_{}_time", table))
                        .table(Alias::new(table))
                        .col(Candle::Time)
                        .to_owned(),
                )
                .await?;
        }

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for table in CANDLE_TABLES {
            manager
                .drop_table(Table::drop().table(Alias::new(table)).to_owned())
                .await?;
        }
        Ok(())
    }
}

#[derive(Iden)]
enum Candle {
    Symbol,
    Time,
    Open,
    High,
    Low,
    Close,
    Volume,
}
