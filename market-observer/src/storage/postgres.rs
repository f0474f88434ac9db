//! Postgres backend.
//!
//! Tables live in a per-binary schema namespace so several observer
//! deployments can share one database. A `symbols` registry table records
//! which source feeds which symbol.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{error, info};

use observer_common::{AggregationsMap, DatabaseError, IntermediateStats, Sample};

use crate::config::Settings;

use super::Database;

pub struct PostgresDatabase {
    pool: PgPool,
    schema: String,
    windows: Vec<String>,
    retention_days: i64,
    /// `(source name, symbols)` registered into the symbols table on init
    sources: Vec<(String, Vec<String>)>,
}

impl PostgresDatabase {
    pub async fn connect(settings: &Settings) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .connect(&settings.storage.db_connection_string)
            .await?;

        Ok(Self {
            pool,
            schema: schema_name(),
            windows: settings.windows_aggregation.clone(),
            retention_days: settings.data_source.data_retention_days,
            sources: settings
                .data_source
                .sources
                .iter()
                .map(|s| (s.name.clone(), s.symbols.clone()))
                .collect(),
        })
    }

    fn table(&self, name: &str) -> String {
        format!(r#""{}"."{}""#, self.schema, name)
    }

    fn aggregation_table(&self, window: &str) -> String {
        self.table(&format!("aggregations_{}", window))
    }

    fn stats_table(&self, window: &str) -> String {
        self.table(&format!("stats_{}", window))
    }

    /// Upsert the symbol set served by `source` into the registry.
    pub async fn register_symbols(
        &self,
        source: &str,
        symbols: &[String],
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            INSERT INTO {} (symbol, source_name, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (symbol) DO UPDATE SET
                source_name = EXCLUDED.source_name,
                updated_at = EXCLUDED.updated_at
            "#,
            self.table("symbols")
        );

        let now = Utc::now();
        for symbol in symbols {
            sqlx::query(&sql)
                .bind(symbol)
                .bind(source)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Schema namespace derived from the binary name, so deployments do not
/// trample each other's tables.
fn schema_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "market_observer".to_string())
        .replace('-', "_")
}

#[async_trait]
impl Database for PostgresDatabase {
    async fn initialize(&self) -> Result<(), DatabaseError> {
        sqlx::query(&format!(r#"CREATE SCHEMA IF NOT EXISTS "{}""#, self.schema))
            .execute(&self.pool)
            .await?;

        let samples = self.table("samples");
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", samples))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE {} (
                symbol TEXT,
                timestamp BIGINT,
                price DOUBLE PRECISION,
                volume DOUBLE PRECISION,
                price_percent_change DOUBLE PRECISION,
                volume_percent_change DOUBLE PRECISION,
                PRIMARY KEY (symbol, timestamp)
            )
            "#,
            samples
        ))
        .execute(&self.pool)
        .await?;

        for window in &self.windows {
            let agg_table = self.aggregation_table(window);
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", agg_table))
                .execute(&self.pool)
                .await?;
            sqlx::query(&format!(
                r#"
                CREATE TABLE {} (
                    symbol TEXT,
                    start_time BIGINT,
                    end_time BIGINT,
                    open DOUBLE PRECISION,
                    high DOUBLE PRECISION,
                    low DOUBLE PRECISION,
                    close DOUBLE PRECISION,
                    volume DOUBLE PRECISION,
                    price_percent_change DOUBLE PRECISION,
                    volume_percent_change DOUBLE PRECISION,
                    PRIMARY KEY (symbol, start_time)
                )
                "#,
                agg_table
            ))
            .execute(&self.pool)
            .await?;

            let stats_table = self.stats_table(window);
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", stats_table))
                .execute(&self.pool)
                .await?;
            sqlx::query(&format!(
                r#"
                CREATE TABLE {} (
                    symbol TEXT,
                    window_name TEXT,
                    avg_volume_history DOUBLE PRECISION,
                    std_volume_history DOUBLE PRECISION,
                    data_points_history INTEGER,
                    last_history_timestamp BIGINT,
                    updated_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
                    PRIMARY KEY (symbol, window_name)
                )
                "#,
                stats_table
            ))
            .execute(&self.pool)
            .await?;
        }

        let symbols = self.table("symbols");
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", symbols))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE {} (
                symbol TEXT PRIMARY KEY,
                source_name TEXT,
                updated_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            symbols
        ))
        .execute(&self.pool)
        .await?;

        for (source, symbols) in &self.sources {
            self.register_symbols(source, symbols).await?;
        }

        info!(schema = %self.schema, windows = self.windows.len(), "postgres schema ready");
        Ok(())
    }

    async fn save_samples_bulk(&self, samples: &[Sample]) -> Result<(), DatabaseError> {
        if samples.is_empty() {
            return Ok(());
        }

        let sql = format!(
            r#"
            INSERT INTO {}
                (symbol, timestamp, price, volume, price_percent_change, volume_percent_change)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (symbol, timestamp) DO NOTHING
            "#,
            self.table("samples")
        );

        let mut tx = self.pool.begin().await?;
        for s in samples {
            sqlx::query(&sql)
                .bind(&s.symbol)
                .bind(s.timestamp)
                .bind(s.price)
                .bind(s.volume)
                .bind(s.price_percent_change)
                .bind(s.volume_percent_change)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn save_aggregations(
        &self,
        aggregations: &AggregationsMap,
    ) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        for windows in aggregations.values() {
            for (window, candles) in windows {
                if candles.is_empty() {
                    continue;
                }

                let sql = format!(
                    r#"
                    INSERT INTO {}
                        (symbol, start_time, end_time, open, high, low, close, volume,
                         price_percent_change, volume_percent_change)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    ON CONFLICT (symbol, start_time) DO NOTHING
                    "#,
                    self.aggregation_table(window)
                );

                for c in candles {
                    sqlx::query(&sql)
                        .bind(&c.symbol)
                        .bind(c.start_time)
                        .bind(c.end_time)
                        .bind(c.open)
                        .bind(c.high)
                        .bind(c.low)
                        .bind(c.close)
                        .bind(c.volume)
                        .bind(c.price_percent_change)
                        .bind(c.volume_percent_change)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_intermediate_stats(
        &self,
        stats: &[IntermediateStats],
    ) -> Result<(), DatabaseError> {
        if stats.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        for s in stats {
            let sql = format!(
                r#"
                INSERT INTO {}
                    (symbol, window_name, avg_volume_history, std_volume_history,
                     data_points_history, last_history_timestamp, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (symbol, window_name) DO UPDATE SET
                    avg_volume_history = EXCLUDED.avg_volume_history,
                    std_volume_history = EXCLUDED.std_volume_history,
                    data_points_history = EXCLUDED.data_points_history,
                    last_history_timestamp = EXCLUDED.last_history_timestamp,
                    updated_at = EXCLUDED.updated_at
                "#,
                self.stats_table(&s.window_name)
            );

            sqlx::query(&sql)
                .bind(&s.symbol)
                .bind(&s.window_name)
                .bind(s.avg_volume_history)
                .bind(s.std_volume_history)
                .bind(s.data_points_history as i32)
                .bind(s.last_history_timestamp)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn cleanup_old_data(&self) -> Result<(), DatabaseError> {
        let cutoff = Utc::now().timestamp() - self.retention_days * 86_400;
        info!(cutoff, retention_days = self.retention_days, "cleaning up old data");

        let sql = format!("DELETE FROM {} WHERE timestamp < $1", self.table("samples"));
        if let Err(e) = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await {
            error!(error = %e, "samples cleanup failed");
        }

        for window in &self.windows {
            let sql = format!(
                "DELETE FROM {} WHERE end_time < $1",
                self.aggregation_table(window)
            );
            if let Err(e) = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await {
                error!(window = %window, error = %e, "aggregation cleanup failed");
            }
        }

        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
