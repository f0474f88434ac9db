// observer-common: shared types, error taxonomy and logging bootstrap.
// Used by the market-observer service binary.

pub mod error;
pub mod logging;
pub mod types;

pub use error::{
    ConfigurationError, DataSourceError, DatabaseError, ErrorCategory, ErrorClassification,
    NetworkError, ValidationError,
};
pub use types::{
    AggregationsMap, Candle, IntermediateStats, LatestData, PayloadKind, ProcessingMetrics,
    Sample, SubscribeCommand, UpdateMap,
};
