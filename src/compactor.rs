use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::engine::Engine;
use crate::observability;
use crate::queue::BookingQueue;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the booking WAL and the queue journal once
/// either has grown by `threshold` appends since its last compaction.
pub async fn run_compactor(
    engine: Arc<Engine>,
    queue: Arc<BookingQueue>,
    threshold: u64,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        compact_once(&engine, &queue, threshold).await;
    }
}

/// One check of both logs. Returns how many were compacted.
pub async fn compact_once(engine: &Engine, queue: &BookingQueue, threshold: u64) -> usize {
    let mut compacted = 0;

    match engine.wal_appends_since_compact().await {
        Ok(n) if n >= threshold => match engine.compact_wal().await {
            Ok(()) => {
                info!("compacted booking WAL after {n} appends");
                metrics::counter!(observability::COMPACTIONS_TOTAL, "log" => "bookings")
                    .increment(1);
                compacted += 1;
            }
            Err(e) => tracing::error!("booking WAL compaction failed: {e}"),
        },
        Ok(_) => {}
        Err(e) => tracing::error!("booking WAL size check failed: {e}"),
    }

    match queue.appends_since_compact().await {
        Ok(n) if n >= threshold => match queue.compact().await {
            Ok(()) => {
                info!("compacted queue journal after {n} appends");
                metrics::counter!(observability::COMPACTIONS_TOTAL, "log" => "queue")
                    .increment(1);
                compacted += 1;
            }
            Err(e) => tracing::error!("queue journal compaction failed: {e}"),
        },
        Ok(_) => {}
        Err(e) => tracing::error!("queue journal size check failed: {e}"),
    }

    compacted
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ulid::Ulid;

    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::queue::Submission;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("meetbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn request() -> BookingRequest {
        BookingRequest {
            user_id: "25".into(),
            name: "User".into(),
            phone: String::new(),
            company: String::new(),
            notes: None,
            lines: vec![LineRequest {
                room_id: Ulid::new(),
                snack_id: None,
                start: 1_900_000_000_000,
                end: 1_900_000_000_000 + HOUR_MS,
                participants: 1,
            }],
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let engine = Engine::new(tmp_path("threshold.bookings.wal")).unwrap();
        let queue =
            BookingQueue::open(&tmp_path("threshold.queue.wal"), Arc::new(NotifyHub::new()))
                .unwrap();

        for _ in 0..3 {
            queue
                .submit(Submission::new(Caller::user("25"), request()))
                .await
                .unwrap();
        }

        assert_eq!(compact_once(&engine, &queue, 5).await, 0);
        assert_eq!(queue.appends_since_compact().await.unwrap(), 3);

        assert_eq!(compact_once(&engine, &queue, 3).await, 1);
        assert_eq!(queue.appends_since_compact().await.unwrap(), 0);
        assert_eq!(queue.depth().await, 3);
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let engine = Arc::new(Engine::new(tmp_path("stop.bookings.wal")).unwrap());
        let queue = Arc::new(
            BookingQueue::open(&tmp_path("stop.queue.wal"), Arc::new(NotifyHub::new())).unwrap(),
        );
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_compactor(engine, queue, 10, shutdown.clone()));
        shutdown.cancel();
        handle.await.unwrap();
    }
}
