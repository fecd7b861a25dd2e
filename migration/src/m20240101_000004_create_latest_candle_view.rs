use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Latest 15m candle per symbol
        manager
            .get_connection()
            .execute_unprepared(
                r#"
                CREATE MATERIALIZED VIEW IF NOT EXISTS latest_candle AS
                SELECT DISTINCT ON (symbol)
                    symbol,
                    time,
                    open,
                    high,
                    low,
                    close,
                    volume
                FROM candle_fifteen
                ORDER BY symbol, time DESC;
                "#,
            )
            .await?;

        // Needed for REFRESH ... CONCURRENTLY
        manager
            .get_connection()
            .execute_unprepared(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_latest_candle_symbol ON latest_candle (symbol)",
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared("DROP MATERIALIZED VIEW IF EXISTS latest_candle")
            .await?;

        Ok(())
    }
}
