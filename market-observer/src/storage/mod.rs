//! Persistence behind a backend-agnostic trait.
//!
//! `db_type: "postgres"` selects the Postgres backend; anything else falls
//! back to the embedded SQLite store. Saves are idempotent on their primary
//! keys (`(symbol, timestamp)` for samples, `(symbol, start_time)` per
//! aggregation window, `(symbol, window_name)` upsert for stats) and each
//! call runs in a single transaction.

pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use observer_common::{
    AggregationsMap, DatabaseError, IntermediateStats, Sample,
};

use crate::config::Settings;

pub use postgres::PostgresDatabase;
pub use sqlite::SqliteDatabase;

#[async_trait]
pub trait Database: Send + Sync {
    /// Create (or recreate) the schema for the configured windows.
    async fn initialize(&self) -> Result<(), DatabaseError>;

    async fn save_samples_bulk(&self, samples: &[Sample]) -> Result<(), DatabaseError>;

    async fn save_aggregations(&self, aggregations: &AggregationsMap)
        -> Result<(), DatabaseError>;

    async fn save_intermediate_stats(
        &self,
        stats: &[IntermediateStats],
    ) -> Result<(), DatabaseError>;

    /// Delete samples older than the retention window and aggregations whose
    /// `end_time` fell behind the cutoff.
    async fn cleanup_old_data(&self) -> Result<(), DatabaseError>;

    async fn close(&self);
}

/// Open the backend selected by `storage.db_type`.
pub async fn connect(settings: &Settings) -> Result<Arc<dyn Database>, DatabaseError> {
    match settings.storage.db_type.as_str() {
        "postgres" => Ok(Arc::new(PostgresDatabase::connect(settings).await?)),
        _ => Ok(Arc::new(SqliteDatabase::connect(settings).await?)),
    }
}
