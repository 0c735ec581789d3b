/*!
Helpers shared by the agent integration tests
*/

use std::future::Future;
use std::time::{Duration, Instant};

/// Initialise `env_logger` once; repeated calls are harmless
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `check` every 20ms until it holds or `timeout` elapses; returns the last answer
pub async fn wait_for<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if check() {
            return true;
        }
        if start.elapsed() >= timeout {
            log::warn!("Condition still false after {:?}", timeout);
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Run `fut` and fail loudly if it does not finish in time
pub async fn within<T>(timeout: Duration, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(timeout, fut).await {
        Ok(value) => value,
        Err(_) => panic!("operation did not finish within {:?}", timeout),
    }
}

/// Fresh temporary directory for buffer and relay state files
pub fn state_dir() -> tempfile::TempDir {
    match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => panic!("cannot create temp dir: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_wait_for_eventually_true() {
        let calls = AtomicUsize::new(0);
        let done = wait_for(Duration::from_secs(1), || calls.fetch_add(1, Ordering::SeqCst) >= 3).await;
        assert!(done);
    }

    #[tokio::test]
    async fn test_wait_for_times_out() {
        assert!(!wait_for(Duration::from_millis(50), || false).await);
    }
}
