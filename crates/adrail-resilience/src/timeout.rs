//! Timeout wrapper for fresh-load attempts
//!
//! Bounds a load attempt so the caller can fall back to cached inventory
//! instead of waiting on a slow mediation network.

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Timeout error
#[derive(Debug, Clone)]
pub struct TimeoutError {
    /// The operation that timed out
    pub operation: String,
    /// The timeout duration
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Operation '{}' timed out after {:?}",
            self.operation, self.duration
        )
    }
}

impl std::error::Error for TimeoutError {}

/// Execute a future with a timeout
///
/// Dropping the inner future on expiry is the cancellation mechanism:
/// a load that loses the race never completes and never reports.
pub async fn with_timeout<T>(
    duration: Duration,
    operation: impl Into<String>,
    future: impl Future<Output = T>,
) -> Result<T, TimeoutError> {
    let op = operation.into();
    timeout(duration, future).await.map_err(|_| TimeoutError {
        operation: op,
        duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), "test", async { 42 }).await;

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expired() {
        let result = with_timeout(Duration::from_millis(250), "fresh_load", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            42
        })
        .await;

        assert!(result.is_err());
        let err = result.unwrap_err();
        assert_eq!(err.operation, "fresh_load");
        assert_eq!(err.duration, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_error_display_names_operation() {
        let err = TimeoutError {
            operation: "fresh_load".to_string(),
            duration: Duration::from_millis(800),
        };
        assert!(err.to_string().contains("fresh_load"));
        assert!(err.to_string().contains("800"));
    }
}
