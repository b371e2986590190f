//! Fail-open helpers for side operations around a run
//!
//! Recording control and the log export are conveniences: if Sonic Pi is not
//! recording or the export directory is read-only, the run still counts.
//! These helpers log the error and carry on.
//!
//! Never wrap a fragment dispatch or an outcome resolution in these; every
//! attempt has to reach the code version log.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::Result;

/// Await `work`, turning an error into a warning and `None`
pub async fn fail_open<T>(operation: &str, work: impl Future<Output = Result<T>>) -> Option<T> {
    match work.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(operation, error = %e, "Side operation failed; continuing");
            None
        }
    }
}

/// Up to `attempts` tries, sleeping `step * attempt` between them
pub async fn fail_open_with_retries<F, Fut, T>(
    operation: &str,
    attempts: u32,
    step: Duration,
    mut work: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match work().await {
            Ok(value) => return Some(value),
            Err(e) if attempt < attempts => {
                debug!(operation, attempt, attempts, error = %e, "Side operation failed; retrying");
                tokio::time::sleep(step * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(operation, attempts, error = %e, "Side operation gave up; continuing");
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CadenzaError;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_export_failure_is_swallowed() {
        let written = fail_open("export::write", async {
            Err::<(), _>(CadenzaError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )))
        })
        .await;
        assert!(written.is_none());

        let written = fail_open("export::write", async { Ok::<_, CadenzaError>(3usize) }).await;
        assert_eq!(written, Some(3));
    }

    #[tokio::test]
    async fn test_save_recording_succeeds_on_second_try() {
        let calls = Cell::new(0u32);
        let saved = fail_open_with_retries("recording::save", 3, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            let call = calls.get();
            async move {
                if call == 1 {
                    Err(CadenzaError::Transport("engine busy".to_string()))
                } else {
                    Ok("take-1.wav")
                }
            }
        })
        .await;

        assert_eq!(saved, Some("take-1.wav"));
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn test_retries_give_up_after_attempts() {
        let calls = Cell::new(0u32);
        let stopped = fail_open_with_retries("recording::stop", 3, Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            async { Err::<(), _>(CadenzaError::Transport("unreachable".to_string())) }
        })
        .await;

        assert!(stopped.is_none());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_tries_once() {
        let calls = Cell::new(0u32);
        fail_open_with_retries("recording::start", 0, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            async { Ok::<_, CadenzaError>(()) }
        })
        .await;
        assert_eq!(calls.get(), 1);
    }
}
