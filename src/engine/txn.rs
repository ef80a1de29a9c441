use ulid::Ulid;

use crate::limits::MAX_LINES_PER_BOOKING;
use crate::model::*;

use super::conflict::{check_lines_disjoint, find_conflict, validate_span};
use super::{Engine, EngineError, LedgerGuards};

/// An open booking write. Holds the write lock of every room it may touch,
/// so nothing can be admitted onto those rooms until it commits or drops.
///
/// Nothing is visible to readers before `commit`. Dropping the transaction
/// is a rollback.
pub struct CommitTxn<'a> {
    engine: &'a Engine,
    guards: LedgerGuards,
    header: Option<BookingHeader>,
    lines: Vec<BookingLine>,
}

impl Engine {
    /// Open a commit transaction over `room_ids`. Locks are taken in room id
    /// order.
    pub async fn begin(&self, room_ids: &[Ulid]) -> Result<CommitTxn<'_>, EngineError> {
        if room_ids.is_empty() {
            return Err(EngineError::InvalidBooking("no rooms to lock".into()));
        }
        if room_ids.len() > MAX_LINES_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many rooms in one booking"));
        }
        let guards = self.lock_rooms(room_ids).await;
        Ok(CommitTxn {
            engine: self,
            guards,
            header: None,
            lines: Vec::new(),
        })
    }
}

impl CommitTxn<'_> {
    pub fn locked_rooms(&self) -> impl Iterator<Item = &Ulid> {
        self.guards.keys()
    }

    /// Active booking whose line on `room_id` overlaps `span`, looking at the
    /// committed ledger first and then at lines already staged here.
    pub fn conflicting(&self, room_id: Ulid, span: &Span) -> Result<Option<Ulid>, EngineError> {
        let ledger = self.guards.get(&room_id).ok_or_else(|| {
            EngineError::InvalidBooking(format!("room {room_id} is not locked by this transaction"))
        })?;
        if let Some(id) = find_conflict(ledger, span) {
            return Ok(Some(id));
        }
        Ok(self
            .lines
            .iter()
            .find(|l| l.room_id == room_id && l.span.overlaps(span))
            .map(|l| l.booking_id))
    }

    pub fn stage_header(&mut self, header: BookingHeader) {
        self.header = Some(header);
    }

    pub fn stage_line(&mut self, line: BookingLine) -> Result<(), EngineError> {
        if !self.guards.contains_key(&line.room_id) {
            return Err(EngineError::InvalidBooking(format!(
                "room {} is not locked by this transaction",
                line.room_id
            )));
        }
        if self.lines.len() >= MAX_LINES_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many lines in one booking"));
        }
        validate_span(&line.span)?;
        self.lines.push(line);
        Ok(())
    }

    /// Re-check every staged line against the ledgers, then write header and
    /// lines as one WAL record and apply it.
    pub async fn commit(mut self) -> Result<Booking, EngineError> {
        let header = self
            .header
            .take()
            .ok_or_else(|| EngineError::InvalidBooking("booking has no header".into()))?;
        if self.lines.is_empty() {
            return Err(EngineError::InvalidBooking("booking has no lines".into()));
        }
        if let Some(stray) = self.lines.iter().find(|l| l.booking_id != header.id) {
            return Err(EngineError::InvalidBooking(format!(
                "line {} belongs to booking {}",
                stray.id, stray.booking_id
            )));
        }
        if self.engine.bookings.contains_key(&header.id) {
            return Err(EngineError::AlreadyExists(header.id));
        }
        check_lines_disjoint(&self.lines)?;
        for line in &self.lines {
            if let Some(ledger) = self.guards.get(&line.room_id)
                && let Some(booking_id) = find_conflict(ledger, &line.span)
            {
                return Err(EngineError::Conflict {
                    room_id: line.room_id,
                    booking_id,
                });
            }
        }

        let booking = Booking {
            header,
            lines: std::mem::take(&mut self.lines),
        };
        let event = Event::BookingCommitted {
            booking: booking.clone(),
        };
        self.engine
            .persist_and_apply(&mut self.guards, &event)
            .await?;
        Ok(booking)
    }
}
