use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::admission::{AdmitError, Admission};
use crate::observability;
use crate::queue::{BookingQueue, Delivery, Outcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Admission attempts before a transient failure is dead-lettered.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// `base × 2^failures`, capped at `max_backoff`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Drain the queue until `shutdown` fires, one submission at a time.
pub async fn run_worker(
    worker_id: usize,
    queue: Arc<BookingQueue>,
    admission: Arc<Admission>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
) {
    tracing::info!("worker {worker_id} started");
    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            delivery = queue.dequeue() => delivery,
        };
        process_delivery(worker_id, &queue, &admission, &policy, delivery, &shutdown).await;
    }
    tracing::info!("worker {worker_id} stopped");
}

/// Run one delivery through admission and settle, retry or dead-letter it.
pub async fn process_delivery(
    worker_id: usize,
    queue: &BookingQueue,
    admission: &Admission,
    policy: &RetryPolicy,
    mut delivery: Delivery,
    shutdown: &CancellationToken,
) {
    let id = delivery.submission.id;
    let start = Instant::now();
    let result = admission.admit(&delivery.submission).await;
    metrics::histogram!(observability::ADMISSION_DURATION_SECONDS)
        .record(start.elapsed().as_secs_f64());

    let settlement = match result {
        Ok(booking) => {
            tracing::info!(
                "worker {worker_id}: submission {id} committed, {} lines, total {}",
                booking.lines.len(),
                booking.header.total
            );
            Settlement::Outcome(Outcome::Committed {
                booking_id: booking.id(),
            })
        }
        Err(AdmitError::SlotUnavailable {
            room_id,
            conflicting,
        }) => {
            tracing::info!(
                "worker {worker_id}: submission {id} lost room {room_id} to booking {conflicting}"
            );
            Settlement::Outcome(Outcome::SlotUnavailable { room_id })
        }
        Err(e) if e.is_transient() => {
            let failures = delivery.attempts + 1;
            if failures >= policy.max_attempts {
                tracing::error!(
                    "worker {worker_id}: submission {id} dead-lettered after {failures} attempts: {e}"
                );
                delivery.attempts = failures;
                Settlement::DeadLetter(e.to_string())
            } else {
                let wait = policy.backoff(delivery.attempts);
                tracing::warn!(
                    "worker {worker_id}: submission {id} attempt {failures} failed, retrying in {wait:?}: {e}"
                );
                pause(wait, shutdown).await;
                queue.retry(delivery).await;
                return;
            }
        }
        Err(e) => {
            tracing::warn!("worker {worker_id}: submission {id} rejected: {e}");
            Settlement::Outcome(Outcome::Rejected {
                reason: e.to_string(),
            })
        }
    };

    let recorded = match settlement {
        Settlement::Outcome(outcome) => queue.settle(&delivery, outcome).await,
        Settlement::DeadLetter(reason) => queue.dead_letter(&delivery, reason).await,
    };
    // Unrecorded outcomes are redelivered. Admission is idempotent per
    // submission id, so a repeat of a commit settles as the same booking.
    if let Err(e) = recorded {
        let wait = policy.backoff(delivery.attempts);
        tracing::error!(
            "worker {worker_id}: could not record the outcome of {id}, redelivering in {wait:?}: {e}"
        );
        pause(wait, shutdown).await;
        queue.requeue(delivery).await;
    }
}

enum Settlement {
    Outcome(Outcome),
    DeadLetter(String),
}

async fn pause(wait: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(wait) => {}
    }
}
