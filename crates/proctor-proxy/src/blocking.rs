//! Bridge from async code to blocking work.
//!
//! Lease and notification calls take a `std::sync::Mutex` around the SQLite
//! connection and may wait out a `busy_timeout` while another process
//! writes; directory calls do blocking HTTP. Both run on tokio's blocking
//! pool so runtime worker threads never wait on them.

use crate::error::{ProxyError, Result};

/// Run `f` on the blocking pool and return its result.
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProxyError::Task(e.to_string()))?
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_result_passed_through() {
        assert_eq!(run_blocking(|| Ok(7)).await.unwrap(), 7);
        let err = run_blocking(|| Err::<(), _>(ProxyError::AuthFailed))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProxyError::AuthFailed));
    }

    #[tokio::test]
    async fn test_panic_becomes_task_error() {
        let err = run_blocking::<(), _>(|| panic!("boom")).await.err().unwrap();
        assert!(matches!(err, ProxyError::Task(_)));
    }
}
