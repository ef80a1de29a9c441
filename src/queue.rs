use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use ulid::Ulid;

use crate::engine::now_ms;
use crate::model::{BookingRequest, Caller, Ms};
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::{Wal, WalWriter};

/// A booking request as accepted from a client, waiting for admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Also the id of the booking it commits as.
    pub id: Ulid,
    pub caller: Caller,
    pub request: BookingRequest,
    pub submitted_at: Ms,
}

impl Submission {
    pub fn new(caller: Caller, request: BookingRequest) -> Self {
        Self {
            id: Ulid::new(),
            caller,
            request,
            submitted_at: now_ms(),
        }
    }
}

/// Final result of admitting a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Committed { booking_id: Ulid },
    Rejected { reason: String },
    SlotUnavailable { room_id: Ulid },
    DeadLettered { reason: String, attempts: u32 },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Committed { .. } => "committed",
            Outcome::Rejected { .. } => "rejected",
            Outcome::SlotUnavailable { .. } => "slot_unavailable",
            Outcome::DeadLettered { .. } => "dead_lettered",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Committed { booking_id } => write!(f, "committed as booking {booking_id}"),
            Outcome::Rejected { reason } => write!(f, "rejected: {reason}"),
            Outcome::SlotUnavailable { room_id } => {
                write!(f, "room {room_id} is already booked for that time")
            }
            Outcome::DeadLettered { reason, attempts } => {
                write!(f, "gave up after {attempts} attempts: {reason}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionStatus {
    Queued,
    Settled(Outcome),
}

impl SubmissionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SubmissionStatus::Queued => "queued",
            SubmissionStatus::Settled(outcome) => outcome.label(),
        }
    }
}

/// The queue journal's record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueEvent {
    Enqueued {
        seq: u64,
        submission: Submission,
    },
    Settled {
        seq: u64,
        id: Ulid,
        outcome: Outcome,
    },
    DeadLettered {
        seq: u64,
        submission: Submission,
        reason: String,
        attempts: u32,
    },
}

/// One dequeued item. `attempts` counts failed admissions so far.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub seq: u64,
    pub submission: Submission,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub submission: Submission,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Debug)]
pub enum QueueError {
    Duplicate(Ulid),
    Io(String),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Duplicate(id) => write!(f, "submission {id} already exists"),
            QueueError::Io(e) => write!(f, "queue journal error: {e}"),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<io::Error> for QueueError {
    fn from(e: io::Error) -> Self {
        QueueError::Io(e.to_string())
    }
}

struct Entry {
    seq: u64,
    status: SubmissionStatus,
}

/// What the journal currently says about unsettled work.
struct JournalState {
    next_seq: u64,
    /// Enqueued and not yet settled, including items a worker is holding.
    unsettled: BTreeMap<u64, Submission>,
}

/// Durable FIFO of submissions awaiting admission.
pub struct BookingQueue {
    journal: WalWriter<QueueEvent>,
    /// Held shared from a journal append until its state change is applied,
    /// exclusively by compaction.
    commit_gate: RwLock<()>,
    state: Mutex<JournalState>,
    pending: Mutex<VecDeque<Delivery>>,
    available: Notify,
    entries: DashMap<Ulid, Entry>,
    dead: DashMap<Ulid, DeadLetter>,
    hub: Arc<NotifyHub>,
    #[cfg(test)]
    failing_appends: std::sync::atomic::AtomicU32,
}

impl BookingQueue {
    /// Open the journal at `path`, rebuilding the pending FIFO and every
    /// settled outcome. Unsettled items are delivered again.
    pub fn open(path: &Path, hub: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::<QueueEvent>::recover(path)?;

        let mut next_seq = 0u64;
        let mut unsettled = BTreeMap::new();
        let mut entries = HashMap::new();
        let mut dead = HashMap::new();
        for event in &events {
            match event {
                QueueEvent::Enqueued { seq, submission } => {
                    next_seq = next_seq.max(seq + 1);
                    unsettled.insert(*seq, submission.clone());
                    entries.insert(
                        submission.id,
                        Entry {
                            seq: *seq,
                            status: SubmissionStatus::Queued,
                        },
                    );
                }
                QueueEvent::Settled { seq, id, outcome } => {
                    next_seq = next_seq.max(seq + 1);
                    unsettled.remove(seq);
                    entries.insert(
                        *id,
                        Entry {
                            seq: *seq,
                            status: SubmissionStatus::Settled(outcome.clone()),
                        },
                    );
                }
                QueueEvent::DeadLettered {
                    seq,
                    submission,
                    reason,
                    attempts,
                } => {
                    next_seq = next_seq.max(seq + 1);
                    unsettled.remove(seq);
                    entries.insert(
                        submission.id,
                        Entry {
                            seq: *seq,
                            status: SubmissionStatus::Settled(Outcome::DeadLettered {
                                reason: reason.clone(),
                                attempts: *attempts,
                            }),
                        },
                    );
                    dead.insert(
                        submission.id,
                        DeadLetter {
                            submission: submission.clone(),
                            reason: reason.clone(),
                            attempts: *attempts,
                        },
                    );
                }
            }
        }

        let pending: VecDeque<Delivery> = unsettled
            .iter()
            .map(|(seq, submission)| Delivery {
                seq: *seq,
                submission: submission.clone(),
                attempts: 0,
            })
            .collect();
        if !pending.is_empty() {
            tracing::info!("queue journal replayed: {} submissions to redeliver", pending.len());
        }
        metrics::gauge!(observability::QUEUE_DEPTH).set(pending.len() as f64);

        Ok(Self {
            journal: WalWriter::spawn(wal, "queue"),
            commit_gate: RwLock::new(()),
            state: Mutex::new(JournalState {
                next_seq,
                unsettled,
            }),
            pending: Mutex::new(pending),
            available: Notify::new(),
            entries: entries.into_iter().collect(),
            dead: dead.into_iter().collect(),
            hub,
            #[cfg(test)]
            failing_appends: std::sync::atomic::AtomicU32::new(0),
        })
    }

    /// Make the next `n` journal appends fail.
    #[cfg(test)]
    pub(crate) fn fail_next_appends(&self, n: u32) {
        self.failing_appends
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_failure(&self) -> Option<QueueError> {
        use std::sync::atomic::Ordering;
        self.failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| QueueError::Io("journal append failed".into()))
    }

    #[cfg(not(test))]
    fn injected_failure(&self) -> Option<QueueError> {
        None
    }

    /// Append one record and wait until it is durable. Concurrent callers
    /// share an fsync.
    async fn write(&self, event: QueueEvent) -> Result<(), QueueError> {
        if let Some(e) = self.injected_failure() {
            return Err(e);
        }
        self.journal.append(event).await.map_err(QueueError::from)
    }

    /// Durably append a submission to the tail. Returns its sequence number.
    pub async fn submit(&self, submission: Submission) -> Result<u64, QueueError> {
        let _gate = self.commit_gate.read().await;
        let seq = {
            let mut state = self.state.lock().await;
            if self.entries.contains_key(&submission.id) {
                return Err(QueueError::Duplicate(submission.id));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            // Reserves the id while the append is in flight.
            self.entries.insert(
                submission.id,
                Entry {
                    seq,
                    status: SubmissionStatus::Queued,
                },
            );
            seq
        };

        let event = QueueEvent::Enqueued {
            seq,
            submission: submission.clone(),
        };
        if let Err(e) = self.write(event).await {
            self.entries.remove(&submission.id);
            return Err(e);
        }
        self.state
            .lock()
            .await
            .unsettled
            .insert(seq, submission.clone());

        let depth = {
            let mut pending = self.pending.lock().await;
            // Concurrent submits can finish out of order; keep sequence order.
            let at = pending
                .iter()
                .rposition(|d| d.seq < seq)
                .map_or(0, |i| i + 1);
            pending.insert(
                at,
                Delivery {
                    seq,
                    submission,
                    attempts: 0,
                },
            );
            pending.len()
        };

        metrics::counter!(observability::SUBMISSIONS_TOTAL).increment(1);
        metrics::gauge!(observability::QUEUE_DEPTH).set(depth as f64);
        self.available.notify_one();
        Ok(seq)
    }

    /// Pop the head of the queue, waiting until there is one.
    pub async fn dequeue(&self) -> Delivery {
        loop {
            {
                let mut pending = self.pending.lock().await;
                if let Some(delivery) = pending.pop_front() {
                    metrics::gauge!(observability::QUEUE_DEPTH).set(pending.len() as f64);
                    return delivery;
                }
            }
            self.available.notified().await;
        }
    }

    /// Put a delivery back at the head for another attempt, counting one
    /// more failed admission.
    pub async fn retry(&self, mut delivery: Delivery) {
        delivery.attempts += 1;
        metrics::counter!(observability::RETRIES_TOTAL).increment(1);
        self.requeue(delivery).await;
    }

    /// Put a delivery back at the head unchanged. Used when its outcome
    /// could not be journaled.
    pub async fn requeue(&self, delivery: Delivery) {
        let depth = {
            let mut pending = self.pending.lock().await;
            pending.push_front(delivery);
            pending.len()
        };
        metrics::gauge!(observability::QUEUE_DEPTH).set(depth as f64);
        self.available.notify_one();
    }

    /// Record the final outcome of a delivery and wake anyone waiting on it.
    pub async fn settle(&self, delivery: &Delivery, outcome: Outcome) -> Result<(), QueueError> {
        let id = delivery.submission.id;
        {
            let _gate = self.commit_gate.read().await;
            self.write(QueueEvent::Settled {
                seq: delivery.seq,
                id,
                outcome: outcome.clone(),
            })
            .await?;
            self.state.lock().await.unsettled.remove(&delivery.seq);
            self.entries.insert(
                id,
                Entry {
                    seq: delivery.seq,
                    status: SubmissionStatus::Settled(outcome.clone()),
                },
            );
        }
        metrics::counter!(observability::ADMISSION_OUTCOMES_TOTAL, "outcome" => outcome.label())
            .increment(1);
        self.hub.send(id, &outcome);
        Ok(())
    }

    /// Give up on a delivery. The submission stays in the journal for inspection.
    pub async fn dead_letter(&self, delivery: &Delivery, reason: String) -> Result<(), QueueError> {
        let id = delivery.submission.id;
        let outcome = Outcome::DeadLettered {
            reason: reason.clone(),
            attempts: delivery.attempts,
        };
        {
            let _gate = self.commit_gate.read().await;
            self.write(QueueEvent::DeadLettered {
                seq: delivery.seq,
                submission: delivery.submission.clone(),
                reason: reason.clone(),
                attempts: delivery.attempts,
            })
            .await?;
            self.state.lock().await.unsettled.remove(&delivery.seq);
            self.entries.insert(
                id,
                Entry {
                    seq: delivery.seq,
                    status: SubmissionStatus::Settled(outcome.clone()),
                },
            );
            self.dead.insert(
                id,
                DeadLetter {
                    submission: delivery.submission.clone(),
                    reason,
                    attempts: delivery.attempts,
                },
            );
        }
        metrics::counter!(observability::DEAD_LETTERS_TOTAL).increment(1);
        metrics::counter!(observability::ADMISSION_OUTCOMES_TOTAL, "outcome" => outcome.label())
            .increment(1);
        self.hub.send(id, &outcome);
        Ok(())
    }

    pub fn status(&self, id: &Ulid) -> Option<SubmissionStatus> {
        self.entries.get(id).map(|e| e.status.clone())
    }

    pub fn dead_letter_entry(&self, id: &Ulid) -> Option<DeadLetter> {
        self.dead.get(id).map(|d| d.value().clone())
    }

    /// `(queued, settled)` submission counts.
    pub fn status_counts(&self) -> (usize, usize) {
        self.entries
            .iter()
            .fold((0, 0), |(queued, settled), entry| match entry.status {
                SubmissionStatus::Queued => (queued + 1, settled),
                SubmissionStatus::Settled(_) => (queued, settled + 1),
            })
    }

    /// Wait until the submission settles. `None` for an unknown id.
    pub async fn wait_settled(&self, id: Ulid) -> Option<Outcome> {
        match self.status(&id)? {
            SubmissionStatus::Settled(outcome) => return Some(outcome),
            SubmissionStatus::Queued => {}
        }
        let mut rx = self.hub.subscribe(id);
        // Settled between the first look and subscribing.
        if let Some(SubmissionStatus::Settled(outcome)) = self.status(&id) {
            drop(rx);
            self.hub.remove_idle(&id);
            return Some(outcome);
        }
        match rx.recv().await {
            Ok(outcome) => Some(outcome),
            Err(_) => match self.status(&id)? {
                SubmissionStatus::Settled(outcome) => Some(outcome),
                SubmissionStatus::Queued => None,
            },
        }
    }

    pub async fn depth(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn appends_since_compact(&self) -> Result<u64, QueueError> {
        Ok(self.journal.appends_since_compact().await?)
    }

    /// Rewrite the journal as the unsettled submissions in order followed by
    /// every settled outcome.
    pub async fn compact(&self) -> Result<(), QueueError> {
        let _gate = self.commit_gate.write().await;
        let mut events: Vec<QueueEvent> = self
            .state
            .lock()
            .await
            .unsettled
            .iter()
            .map(|(seq, submission)| QueueEvent::Enqueued {
                seq: *seq,
                submission: submission.clone(),
            })
            .collect();

        let mut settled: Vec<QueueEvent> = Vec::new();
        for entry in self.entries.iter() {
            let id = *entry.key();
            let SubmissionStatus::Settled(outcome) = &entry.status else {
                continue;
            };
            match self.dead.get(&id) {
                Some(dl) => settled.push(QueueEvent::DeadLettered {
                    seq: entry.seq,
                    submission: dl.submission.clone(),
                    reason: dl.reason.clone(),
                    attempts: dl.attempts,
                }),
                None => settled.push(QueueEvent::Settled {
                    seq: entry.seq,
                    id,
                    outcome: outcome.clone(),
                }),
            }
        }
        settled.sort_by_key(|e| match e {
            QueueEvent::Enqueued { seq, .. }
            | QueueEvent::Settled { seq, .. }
            | QueueEvent::DeadLettered { seq, .. } => *seq,
        });
        events.extend(settled);

        let records = events.len();
        self.journal.compact(events).await?;
        tracing::debug!("queue journal compacted to {records} records");
        Ok(())
    }
}
