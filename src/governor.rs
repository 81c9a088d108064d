use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("Governor closed: {0}")]
    Closed(String),
}

/// Keeps outgoing requests under the API quota.
///
/// Two limits apply to every [`RateGovernor::acquire`]: at most `concurrency`
/// permits are outstanding, and consecutive permits are handed out at least
/// `min_interval` apart. The interval is measured between request *starts*,
/// so dropping a permit frees a slot but leaves the clock alone.
#[derive(Debug)]
pub struct RateGovernor {
    semaphore: Arc<Semaphore>,
    min_interval: Duration,
    last_start: Mutex<Option<Instant>>,
}

/// Slot held for the lifetime of one request.
#[derive(Debug)]
pub struct ScopedPermit {
    _permit: OwnedSemaphorePermit,
    started_at: Instant,
}

impl ScopedPermit {
    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

impl RateGovernor {
    pub fn new(concurrency: usize, min_interval: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            min_interval,
            last_start: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self) -> Result<ScopedPermit, GovernorError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| GovernorError::Closed(e.to_string()))?;

        // Held across the sleep so that waiters are released one interval apart.
        let mut last_start = self.last_start.lock().await;
        if let Some(previous) = *last_start {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                debug!(
                    wait_ms = (ready_at - Instant::now()).as_millis() as u64,
                    "Waiting for request interval"
                );
                sleep_until(ready_at).await;
            }
        }

        let started_at = Instant::now();
        *last_start = Some(started_at);

        Ok(ScopedPermit {
            _permit: permit,
            started_at,
        })
    }
}
