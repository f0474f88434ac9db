//! Error classification for retry logic.
//!
//! Errors self-describe whether a retry can help, so callers share one
//! retry helper instead of matching on concrete variants everywhere.

use std::time::Duration;

use tracing::warn;

use super::common::*;

/// Classification of error types for handling decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// May resolve on retry (network issues, timeouts)
    Transient,
    /// Won't resolve on retry (invalid input, not found)
    Permanent,
    /// Rate limits, pool exhaustion
    ResourceExhausted,
    /// Missing or invalid settings
    Configuration,
}

/// Trait for errors that can classify themselves for retry logic.
pub trait ErrorClassification {
    fn category(&self) -> ErrorCategory;

    fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::ResourceExhausted
        )
    }

    fn is_permanent(&self) -> bool {
        matches!(self.category(), ErrorCategory::Permanent)
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self.category() {
            ErrorCategory::Transient => Some(Duration::from_millis(100)),
            ErrorCategory::ResourceExhausted => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

impl ErrorClassification for NetworkError {
    fn category(&self) -> ErrorCategory {
        match self {
            NetworkError::Request(_) => ErrorCategory::Transient,
            NetworkError::Blocked(_) => ErrorCategory::ResourceExhausted,
            NetworkError::Status(_) => ErrorCategory::Transient,
            NetworkError::Body(_) => ErrorCategory::Transient,
            NetworkError::InvalidProxy(_) => ErrorCategory::Configuration,
            NetworkError::ClientBuild(_) => ErrorCategory::Configuration,
            NetworkError::ProxyRefresh(_) => ErrorCategory::Transient,
            NetworkError::RetriesExhausted(_) => ErrorCategory::Permanent,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            NetworkError::Blocked(_) => Some(Duration::from_secs(2)),
            NetworkError::Request(_) | NetworkError::Status(_) => {
                Some(Duration::from_millis(500))
            }
            _ => None,
        }
    }
}

impl ErrorClassification for DataSourceError {
    fn category(&self) -> ErrorCategory {
        match self {
            DataSourceError::Fetch { source, .. } => source.category(),
            DataSourceError::Parse { .. } => ErrorCategory::Permanent,
            DataSourceError::AllFetchesFailed(_) => ErrorCategory::Transient,
            DataSourceError::AlreadyRunning(_) => ErrorCategory::Permanent,
            DataSourceError::NotRunning(_) => ErrorCategory::Permanent,
            DataSourceError::NotFound(_) => ErrorCategory::Permanent,
            DataSourceError::AlreadyExists(_) => ErrorCategory::Permanent,
        }
    }
}

impl ErrorClassification for DatabaseError {
    fn category(&self) -> ErrorCategory {
        match self {
            DatabaseError::Query(_) => ErrorCategory::Permanent,
            DatabaseError::Connection(_) => ErrorCategory::Transient,
            DatabaseError::PoolExhausted => ErrorCategory::ResourceExhausted,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            DatabaseError::PoolExhausted => Some(Duration::from_millis(500)),
            DatabaseError::Connection(_) => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

impl ErrorClassification for ConfigurationError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}

impl ErrorClassification for ValidationError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Permanent
    }
}

/// Ceiling for the doubling backoff between attempts.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Retry an async operation while its error stays transient.
///
/// The wait between attempts is the error's suggested delay when it has
/// one, otherwise a doubling backoff starting at `initial_delay`. Permanent
/// errors and the final attempt's error are returned as-is.
pub async fn retry_with_backoff<T, E, F, Fut>(
    mut operation: F,
    max_attempts: u32,
    initial_delay: Duration,
) -> Result<T, E>
where
    E: ErrorClassification + std::fmt::Debug,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() || attempt >= max_attempts {
            return Err(err);
        }

        let wait = err.suggested_retry_delay().unwrap_or(delay);
        warn!(attempt, max_attempts, error = ?err, "transient failure, backing off");
        tokio::time::sleep(wait).await;

        delay = (delay * 2).min(MAX_RETRY_BACKOFF);
    }
}
