use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::admission::{check_request, AdmitError, Admission, Quote};
use crate::catalog::{RoomCatalog, SnackCatalog};
use crate::compactor;
use crate::config::Config;
use crate::engine::{now_ms, Engine};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::queue::{BookingQueue, Outcome, QueueError, Submission, SubmissionStatus};
use crate::worker::{self, RetryPolicy};

pub const BOOKINGS_WAL: &str = "bookings.wal";
pub const QUEUE_WAL: &str = "queue.wal";

/// Everything a connection needs: submission onto the queue, reads against
/// the store and direct status changes. Owns the worker and compactor tasks.
pub struct BookingService {
    engine: Arc<Engine>,
    admission: Arc<Admission>,
    queue: Arc<BookingQueue>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl BookingService {
    /// Open both logs under `config.data_dir` and spawn `config.workers`
    /// admission workers plus the compactor.
    pub fn start(
        config: &Config,
        rooms: Arc<dyn RoomCatalog>,
        snacks: Arc<dyn SnackCatalog>,
    ) -> std::io::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let engine = Arc::new(Engine::new(config.data_dir.join(BOOKINGS_WAL))?);
        let queue = Arc::new(BookingQueue::open(
            &config.data_dir.join(QUEUE_WAL),
            Arc::new(NotifyHub::new()),
        )?);
        let admission = Arc::new(Admission::new(engine.clone(), rooms, snacks));
        let shutdown = CancellationToken::new();

        let mut tasks = Vec::with_capacity(config.workers + 1);
        for worker_id in 0..config.workers {
            tasks.push((
                format!("worker {worker_id}"),
                spawn_worker(worker_id, &queue, &admission, config.retry, &shutdown),
            ));
        }
        tasks.push((
            "compactor".to_string(),
            tokio::spawn(compactor::run_compactor(
                engine.clone(),
                queue.clone(),
                config.compact_threshold,
                shutdown.clone(),
            )),
        ));

        tracing::info!(
            "booking service started: {} bookings, {} queued, {} workers",
            engine.booking_count(),
            queue.status_counts().0,
            config.workers
        );

        Ok(Arc::new(Self {
            engine,
            admission,
            queue,
            shutdown,
            tasks: Mutex::new(tasks),
        }))
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<BookingQueue> {
        &self.queue
    }

    /// Validate and enqueue. Returns the submission id, which is also the id
    /// the booking commits under.
    pub async fn submit(
        &self,
        caller: &Caller,
        id: Option<Ulid>,
        request: BookingRequest,
    ) -> Result<Ulid, AdmitError> {
        check_request(caller, &request)?;
        let mut submission = Submission::new(caller.clone(), request);
        if let Some(id) = id {
            submission.id = id;
        }
        let id = submission.id;
        match self.queue.submit(submission).await {
            Ok(seq) => {
                tracing::debug!("submission {id} queued at {seq} by {}", caller.user_id);
                Ok(id)
            }
            Err(QueueError::Duplicate(id)) => Err(AdmitError::Validation(format!(
                "submission {id} already exists"
            ))),
            Err(e) => Err(AdmitError::Store(e.to_string())),
        }
    }

    pub async fn preview(&self, lines: &[LineRequest]) -> Result<Quote, AdmitError> {
        self.admission.preview(lines).await
    }

    pub fn submission_status(&self, id: Ulid) -> Result<SubmissionStatus, AdmitError> {
        self.queue
            .status(&id)
            .ok_or(AdmitError::NotFound("submission", id))
    }

    pub async fn wait_settled(&self, id: Ulid) -> Result<Outcome, AdmitError> {
        self.queue
            .wait_settled(id)
            .await
            .ok_or(AdmitError::NotFound("submission", id))
    }

    /// A booking visible to its owner and to admins.
    pub fn booking(&self, caller: &Caller, id: Ulid) -> Result<Booking, AdmitError> {
        let booking = self
            .engine
            .get_booking(&id)
            .ok_or(AdmitError::NotFound("booking", id))?;
        if !caller.is_admin() && booking.header.user_id != caller.user_id {
            return Err(AdmitError::Unauthorized(format!(
                "booking {id} belongs to another user"
            )));
        }
        Ok(booking)
    }

    /// Users only ever see their own history; admins may filter by user.
    pub fn history(&self, caller: &Caller, mut filter: HistoryFilter) -> Page<Booking> {
        if !caller.is_admin() {
            filter.user_id = Some(caller.user_id.clone());
        }
        self.engine.history(&filter)
    }

    pub async fn schedule(
        &self,
        room_id: Ulid,
        window: Span,
    ) -> Result<Vec<ScheduleEntry>, AdmitError> {
        Ok(self.engine.room_schedule(room_id, &window).await?)
    }

    pub async fn update_status(
        &self,
        caller: &Caller,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, AdmitError> {
        self.admission.update_status(caller, id, status).await
    }

    pub async fn cancel(&self, caller: &Caller, id: Ulid) -> Result<Booking, AdmitError> {
        self.admission
            .update_status(caller, id, BookingStatus::Canceled)
            .await
    }

    /// Stop the workers and the compactor and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                tracing::error!("{name} ended abnormally: {e}");
            }
        }
        tracing::info!("booking service stopped at {}", format_timestamp(now_ms()));
    }
}

fn spawn_worker(
    worker_id: usize,
    queue: &Arc<BookingQueue>,
    admission: &Arc<Admission>,
    policy: RetryPolicy,
    shutdown: &CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(worker::run_worker(
        worker_id,
        queue.clone(),
        admission.clone(),
        policy,
        shutdown.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use rust_decimal::Decimal;

    use super::*;
    use crate::catalog::InMemoryCatalog;

    const H: Ms = HOUR_MS;

    fn test_config(name: &str, workers: usize) -> Config {
        let dir = std::env::temp_dir().join("meetbook_test_service").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        Config {
            data_dir: dir,
            workers,
            retry: RetryPolicy {
                max_attempts: 3,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
            admin_users: HashSet::from(["admin".to_string()]),
            ..Config::default()
        }
    }

    fn catalog() -> (Arc<InMemoryCatalog>, Ulid) {
        let catalog = InMemoryCatalog::new();
        let room = RoomInfo {
            id: Ulid::new(),
            name: "Orchid".into(),
            kind: "small".into(),
            capacity: 10,
            hourly_rate: Decimal::from(100_000),
            image_path: String::new(),
        };
        let id = room.id;
        catalog.insert_room(room);
        (Arc::new(catalog), id)
    }

    fn start(name: &str, workers: usize) -> (Arc<BookingService>, Ulid) {
        let (catalog, room) = catalog();
        let service =
            BookingService::start(&test_config(name, workers), catalog.clone(), catalog).unwrap();
        (service, room)
    }

    fn tomorrow_at(hour: Ms) -> Ms {
        (now_ms() / (24 * H) + 1) * 24 * H + hour * H
    }

    fn request(user: &str, room: Ulid, start: Ms, end: Ms) -> BookingRequest {
        BookingRequest {
            user_id: user.into(),
            name: "User Test".into(),
            phone: "0812".into(),
            company: "Acme".into(),
            notes: None,
            lines: vec![LineRequest {
                room_id: room,
                snack_id: None,
                start,
                end,
                participants: 2,
            }],
        }
    }

    async fn race(name: &str, workers: usize) {
        let (service, room) = start(name, workers);
        let start = tomorrow_at(9);

        let mut ids = Vec::new();
        for i in 0..10 {
            let user = format!("u{i}");
            let id = service
                .submit(&Caller::user(&user), None, request(&user, room, start, start + H))
                .await
                .unwrap();
            ids.push(id);
        }

        let mut committed = 0;
        let mut unavailable = 0;
        for id in ids {
            match service.wait_settled(id).await.unwrap() {
                Outcome::Committed { .. } => committed += 1,
                Outcome::SlotUnavailable { room_id } => {
                    assert_eq!(room_id, room);
                    unavailable += 1;
                }
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!((committed, unavailable), (1, 9));
        assert_eq!(service.engine().booking_count(), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn overlapping_race_single_worker() {
        race("race_one", 1).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_race_many_workers() {
        race("race_many", 4).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn disjoint_submissions_all_commit() {
        let (service, room) = start("disjoint", 4);
        let mut ids = Vec::new();
        for i in 0..8 {
            let start = tomorrow_at(i);
            ids.push(
                service
                    .submit(&Caller::user("25"), None, request("25", room, start, start + H))
                    .await
                    .unwrap(),
            );
        }
        for id in ids {
            assert_eq!(
                service.wait_settled(id).await.unwrap(),
                Outcome::Committed { booking_id: id }
            );
        }
        let page = service.history(
            &Caller::user("25"),
            HistoryFilter {
                page_size: 100,
                ..HistoryFilter::default()
            },
        );
        assert_eq!(page.total, 8);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_submission_is_not_queued() {
        let (service, room) = start("malformed", 1);
        let start = tomorrow_at(9);
        let err = service
            .submit(&Caller::user("25"), None, request("25", room, start + H, start))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmitError::Validation(_)));

        let err = service
            .submit(&Caller::user("26"), None, request("25", room, start, start + H))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmitError::Unauthorized(_)));
        assert_eq!(service.queue().depth().await, 0);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_submission_id_is_rejected() {
        let (service, room) = start("duplicate", 1);
        let start = tomorrow_at(9);
        let id = Ulid::new();
        let caller = Caller::user("25");
        service
            .submit(&caller, Some(id), request("25", room, start, start + H))
            .await
            .unwrap();
        let err = service
            .submit(&caller, Some(id), request("25", room, start, start + H))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmitError::Validation(_)));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn bookings_are_private_to_owner_and_admin() {
        let (service, room) = start("privacy", 1);
        let start = tomorrow_at(9);
        let owner = Caller::user("25");
        let id = service
            .submit(&owner, None, request("25", room, start, start + H))
            .await
            .unwrap();
        service.wait_settled(id).await.unwrap();

        assert!(service.booking(&owner, id).is_ok());
        assert!(service.booking(&Caller::admin("admin"), id).is_ok());
        assert!(matches!(
            service.booking(&Caller::user("26"), id),
            Err(AdmitError::Unauthorized(_))
        ));

        let sneaky = HistoryFilter {
            user_id: Some("25".into()),
            ..HistoryFilter::default()
        };
        assert_eq!(service.history(&Caller::user("26"), sneaky.clone()).total, 0);
        assert_eq!(service.history(&Caller::admin("admin"), sneaky).total, 1);

        let canceled = service.cancel(&owner, id).await.unwrap();
        assert_eq!(canceled.header.status, BookingStatus::Canceled);
        assert!(matches!(
            service.cancel(&owner, id).await,
            Err(AdmitError::AlreadyProcessed(_))
        ));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn unsettled_submissions_survive_restart() {
        let config = test_config("restart", 1);
        let (catalog, room) = catalog();
        let start = tomorrow_at(9);

        std::fs::create_dir_all(&config.data_dir).unwrap();
        {
            let queue = BookingQueue::open(
                &config.data_dir.join(QUEUE_WAL),
                Arc::new(NotifyHub::new()),
            )
            .unwrap();
            let sub = Submission::new(Caller::user("25"), request("25", room, start, start + H));
            queue.submit(sub).await.unwrap();
        }

        let service = BookingService::start(&config, catalog.clone(), catalog).unwrap();
        let (_, mut settled) = service.queue().status_counts();
        for _ in 0..200 {
            if settled == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            settled = service.queue().status_counts().1;
        }
        assert_eq!(settled, 1);
        assert_eq!(service.engine().booking_count(), 1);
        service.shutdown().await;
    }
}
