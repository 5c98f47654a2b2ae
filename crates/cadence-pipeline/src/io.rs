use std::future::Future;
use std::time::Duration;

use cadence_core::error::{CadenceError, Result};

/// Run one filesystem operation under `limit`.
///
/// An elapsed timer becomes `CadenceError::Timeout`; any I/O failure becomes
/// `CadenceError::Persistence` naming the operation. Nothing is retried.
pub async fn bounded<T, F>(operation: &str, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CadenceError::Persistence(format!("{}: {}", operation, e))),
        Err(_) => Err(CadenceError::Timeout {
            operation: operation.to_string(),
            timeout_secs: limit.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_maps_io_error() {
        let err = bounded(
            "read missing",
            Duration::from_secs(1),
            tokio::fs::read("/definitely/not/here.json"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CadenceError::Persistence(ref m) if m.starts_with("read missing")));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let err = bounded("stall", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, CadenceError::Timeout { .. }));
        assert!(err.is_persistence_failure());
    }
}
