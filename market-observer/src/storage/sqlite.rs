//! Embedded SQLite backend.
//!
//! WAL journal with NORMAL sync keeps bulk inserts cheap without giving up
//! durability across process crashes.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{error, info};

use observer_common::{AggregationsMap, DatabaseError, IntermediateStats, Sample};

use crate::config::Settings;

use super::Database;

pub struct SqliteDatabase {
    pool: SqlitePool,
    windows: Vec<String>,
    retention_days: i64,
}

impl SqliteDatabase {
    pub async fn connect(settings: &Settings) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::from_str(&settings.storage.db_path)
            .or_else(|_| {
                Ok::<_, sqlx::Error>(SqliteConnectOptions::new().filename(&settings.storage.db_path))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            windows: settings.windows_aggregation.clone(),
            retention_days: settings.data_source.data_retention_days,
        })
    }

    fn aggregation_table(window: &str) -> String {
        format!("aggregations_{}", window)
    }

    fn stats_table(window: &str) -> String {
        format!("stats_{}", window)
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn initialize(&self) -> Result<(), DatabaseError> {
        sqlx::query("DROP TABLE IF EXISTS samples")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE samples (
                symbol TEXT,
                timestamp INTEGER,
                price REAL,
                volume REAL,
                price_percent_change REAL,
                volume_percent_change REAL,
                PRIMARY KEY (symbol, timestamp)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for window in &self.windows {
            let agg_table = Self::aggregation_table(window);
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", agg_table))
                .execute(&self.pool)
                .await?;
            sqlx::query(&format!(
                r#"
                CREATE TABLE {} (
                    symbol TEXT,
                    start_time INTEGER,
                    end_time INTEGER,
                    open REAL,
                    high REAL,
                    low REAL,
                    close REAL,
                    volume REAL,
                    price_percent_change REAL,
                    volume_percent_change REAL,
                    PRIMARY KEY (symbol, start_time)
                )
                "#,
                agg_table
            ))
            .execute(&self.pool)
            .await?;

            let stats_table = Self::stats_table(window);
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", stats_table))
                .execute(&self.pool)
                .await?;
            sqlx::query(&format!(
                r#"
                CREATE TABLE {} (
                    symbol TEXT,
                    window_name TEXT,
                    avg_volume_history REAL,
                    std_volume_history REAL,
                    data_points_history INTEGER,
                    last_history_timestamp INTEGER,
                    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                    PRIMARY KEY (symbol, window_name)
                )
                "#,
                stats_table
            ))
            .execute(&self.pool)
            .await?;
        }

        info!(windows = self.windows.len(), "sqlite schema ready");
        Ok(())
    }

    async fn save_samples_bulk(&self, samples: &[Sample]) -> Result<(), DatabaseError> {
        if samples.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for s in samples {
            sqlx::query(
                r#"
                INSERT INTO samples
                    (symbol, timestamp, price, volume, price_percent_change, volume_percent_change)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (symbol, timestamp) DO NOTHING
                "#,
            )
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
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT (symbol, start_time) DO NOTHING
                    "#,
                    Self::aggregation_table(window)
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
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (symbol, window_name) DO UPDATE SET
                    avg_volume_history = excluded.avg_volume_history,
                    std_volume_history = excluded.std_volume_history,
                    data_points_history = excluded.data_points_history,
                    last_history_timestamp = excluded.last_history_timestamp,
                    updated_at = excluded.updated_at
                "#,
                Self::stats_table(&s.window_name)
            );

            sqlx::query(&sql)
                .bind(&s.symbol)
                .bind(&s.window_name)
                .bind(s.avg_volume_history)
                .bind(s.std_volume_history)
                .bind(s.data_points_history as i64)
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

        if let Err(e) = sqlx::query("DELETE FROM samples WHERE timestamp < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
        {
            error!(error = %e, "samples cleanup failed");
        }

        for window in &self.windows {
            let sql = format!(
                "DELETE FROM {} WHERE end_time < ?",
                Self::aggregation_table(window)
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
