mod conflict;
mod error;
mod mutations;
mod queries;
mod txn;

pub use conflict::{check_lines_disjoint, find_conflict, has_conflict, now_ms, validate_span};
pub use error::EngineError;
pub use txn::CommitTxn;

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::{Wal, WalWriter};

pub type SharedLedger = Arc<RwLock<RoomLedger>>;

pub(crate) type LedgerGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<RoomLedger>>;

/// The booking store: committed bookings plus one ledger of active
/// reservations per room.
pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedLedger>,
    pub(super) bookings: DashMap<Ulid, Booking>,
    pub(super) wal: WalWriter<Event>,
    /// Shared by every WAL-append + apply, exclusive for compaction.
    pub(super) commit_gate: RwLock<()>,
}

/// Fold replayed events into the booking index.
fn apply_to_index(bookings: &mut HashMap<Ulid, Booking>, event: &Event) {
    match event {
        Event::BookingCommitted { booking } => {
            bookings.insert(booking.id(), booking.clone());
        }
        Event::StatusChanged {
            id,
            status,
            updated_at,
        } => {
            if let Some(b) = bookings.get_mut(id) {
                b.header.status = *status;
                b.header.updated_at = *updated_at;
            }
        }
    }
}

/// Apply an event to the room ledgers the caller has write-locked.
fn apply_to_ledgers(guards: &mut LedgerGuards, event: &Event) {
    match event {
        Event::BookingCommitted { booking } => {
            if booking.header.status == BookingStatus::Canceled {
                return;
            }
            for line in &booking.lines {
                if let Some(ledger) = guards.get_mut(&line.room_id) {
                    ledger.insert(Reservation {
                        line_id: line.id,
                        booking_id: line.booking_id,
                        span: line.span,
                    });
                }
            }
        }
        Event::StatusChanged { id, status, .. } => {
            if *status == BookingStatus::Canceled {
                for ledger in guards.values_mut() {
                    ledger.remove_booking(*id);
                }
            }
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::<Event>::recover(&wal_path)?;
        let wal = WalWriter::spawn(wal, "bookings");

        let mut bookings = HashMap::new();
        for event in &events {
            apply_to_index(&mut bookings, event);
        }

        let mut ledgers: HashMap<Ulid, RoomLedger> = HashMap::new();
        for booking in bookings.values() {
            if booking.header.status == BookingStatus::Canceled {
                continue;
            }
            for line in &booking.lines {
                ledgers
                    .entry(line.room_id)
                    .or_insert_with(|| RoomLedger::new(line.room_id))
                    .insert(Reservation {
                        line_id: line.id,
                        booking_id: line.booking_id,
                        span: line.span,
                    });
            }
        }

        tracing::info!(
            "booking store replayed {} events: {} bookings across {} rooms",
            events.len(),
            bookings.len(),
            ledgers.len()
        );

        Ok(Self {
            rooms: ledgers
                .into_iter()
                .map(|(id, ledger)| (id, Arc::new(RwLock::new(ledger))))
                .collect(),
            bookings: bookings.into_iter().collect(),
            wal,
            commit_gate: RwLock::new(()),
        })
    }

    /// Append through the group-commit writer and wait for the fsync.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal
            .append(event.clone())
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub(super) fn ledger(&self, room_id: Ulid) -> SharedLedger {
        self.rooms
            .entry(room_id)
            .or_insert_with(|| Arc::new(RwLock::new(RoomLedger::new(room_id))))
            .value()
            .clone()
    }

    /// Write-lock every listed room in ascending id order.
    pub(super) async fn lock_rooms(&self, room_ids: &[Ulid]) -> LedgerGuards {
        let mut ids = room_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = BTreeMap::new();
        for id in ids {
            let guard = self.ledger(id).write_owned().await;
            guards.insert(id, guard);
        }
        guards
    }

    /// WAL-append then apply, under the shared commit gate. The caller holds
    /// the write locks of every room the event touches.
    pub(super) async fn persist_and_apply(
        &self,
        guards: &mut LedgerGuards,
        event: &Event,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(event).await?;
        apply_to_ledgers(guards, event);
        match event {
            Event::BookingCommitted { booking } => {
                self.bookings.insert(booking.id(), booking.clone());
            }
            Event::StatusChanged {
                id,
                status,
                updated_at,
            } => {
                if let Some(mut b) = self.bookings.get_mut(id) {
                    b.header.status = *status;
                    b.header.updated_at = *updated_at;
                }
            }
        }
        Ok(())
    }
}
