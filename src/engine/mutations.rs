use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Insert a fully priced booking in one step: lock its rooms, check every
    /// line for overlap and commit.
    pub async fn insert_booking(
        &self,
        header: BookingHeader,
        lines: Vec<BookingLine>,
    ) -> Result<Ulid, EngineError> {
        let room_ids: Vec<Ulid> = lines.iter().map(|l| l.room_id).collect();
        let mut txn = self.begin(&room_ids).await?;
        txn.stage_header(header);
        for line in lines {
            txn.stage_line(line)?;
        }
        let booking = txn.commit().await?;
        Ok(booking.id())
    }

    /// Move a booking out of its initial state. Allowed exactly once: after
    /// `updated_at` diverges from `created_at` the record is final.
    pub async fn update_status(
        &self,
        id: Ulid,
        status: BookingStatus,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let room_ids = self
            .bookings
            .get(&id)
            .map(|b| b.room_ids())
            .ok_or(EngineError::NotFound(id))?;
        let mut guards = self.lock_rooms(&room_ids).await;

        // Re-read under the room locks; a concurrent update may have won.
        let current = self
            .bookings
            .get(&id)
            .map(|b| b.header.clone())
            .ok_or(EngineError::NotFound(id))?;
        if current.is_processed() {
            return Err(EngineError::AlreadyProcessed(id));
        }

        let updated_at = if now == current.created_at {
            now + 1
        } else {
            now
        };
        let event = Event::StatusChanged {
            id,
            status,
            updated_at,
        };
        self.persist_and_apply(&mut guards, &event).await?;
        self.bookings
            .get(&id)
            .map(|b| b.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    /// Rewrite the WAL as one `BookingCommitted` record per booking, carrying
    /// its current status.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut bookings: Vec<Booking> = self
            .bookings
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        bookings.sort_by_key(|b| b.id());
        let events: Vec<Event> = bookings
            .into_iter()
            .map(|booking| Event::BookingCommitted { booking })
            .collect();

        self.wal
            .compact(events)
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        self.wal
            .appends_since_compact()
            .await
            .map_err(|e| EngineError::WalError(e.to_string()))
    }
}
