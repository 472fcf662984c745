//! Cancellable polling with a deadline

use std::future::Future;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Poll `check` every `interval` until it reports completion
///
/// `check` gets the time elapsed since polling started. `Ok(true)` ends the
/// wait, `Ok(false)` keeps polling and an error is returned as-is. Fails with
/// [`Error::DeadlineExceeded`] once `deadline` has passed and with
/// [`Error::Cancelled`] as soon as `cancel` fires.
pub async fn poll_until<F, Fut>(
    job: &str,
    deadline: Duration,
    interval: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<()>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let start = Instant::now();
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled { job: job.to_string() });
            }
            _ = ticker.tick() => {}
        }

        let elapsed = start.elapsed();
        let done = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled { job: job.to_string() });
            }
            done = check(elapsed) => done?,
        };
        if done {
            return Ok(());
        }

        if start.elapsed() >= deadline {
            return Err(Error::DeadlineExceeded {
                job: job.to_string(),
                deadline,
            });
        }

        tracing::trace!("Terraformer job {} still running ({}s)", job, elapsed.as_secs());
    }
}
