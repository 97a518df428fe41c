use std::{error::Error, future::Future, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("concurrency conflict")]
pub struct ConflictError;

const MAX_ATTEMPTS: u64 = 8;

/// Retries the callback while its error chain contains a [`ConflictError`].
/// Order commits are compare-and-swap on a revision column; a commit that
/// loses the race re-reads the aggregate and tries again. Any other error is
/// returned as-is.
pub async fn retry_loop<F: Future<Output = Result<T, E>>, T, E: Error + 'static>(
    mut cb: impl FnMut() -> F,
) -> Result<T, E> {
    for attempt in 1..MAX_ATTEMPTS {
        match cb().await {
            Ok(result) => return Ok(result),
            Err(e) if is_conflict(Some(&e)) => {
                let backoff = Duration::from_millis(50 * attempt);
                log::debug!("commit lost a revision race, retrying in {:?}", backoff);
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
    cb().await
}

fn is_conflict(e: Option<&(dyn Error + 'static)>) -> bool {
    e.map(|e| e.is::<ConflictError>() || is_conflict(e.source()))
        .unwrap_or(false)
}
