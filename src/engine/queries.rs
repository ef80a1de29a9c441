use std::cmp::Reverse;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::has_conflict;
use super::{Engine, EngineError};

impl Engine {
    pub fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id).map(|b| b.value().clone())
    }

    pub fn booking_count(&self) -> usize {
        self.bookings.len()
    }

    /// Read-only overlap probe against the committed ledger.
    pub async fn exists_overlap(&self, room_id: Ulid, span: &Span) -> bool {
        let Some(ledger) = self.rooms.get(&room_id).map(|e| e.value().clone()) else {
            return false;
        };
        let guard = ledger.read().await;
        has_conflict(&guard, span)
    }

    /// Active reservations on a room that overlap `window`, by start time.
    pub async fn room_schedule(
        &self,
        room_id: Ulid,
        window: &Span,
    ) -> Result<Vec<ScheduleEntry>, EngineError> {
        if window.start >= window.end {
            return Err(EngineError::InvalidBooking(
                "schedule window start must be before end".into(),
            ));
        }
        if window.duration_ms() > MAX_SCHEDULE_WINDOW_MS {
            return Err(EngineError::LimitExceeded("schedule window too wide"));
        }
        let Some(ledger) = self.rooms.get(&room_id).map(|e| e.value().clone()) else {
            return Ok(Vec::new());
        };
        let guard = ledger.read().await;
        Ok(guard
            .overlapping(window)
            .map(|r| ScheduleEntry {
                booking_id: r.booking_id,
                line_id: r.line_id,
                status: self
                    .bookings
                    .get(&r.booking_id)
                    .map(|b| b.header.status)
                    .unwrap_or(BookingStatus::Pending),
                start: r.span.start,
                end: r.span.end,
            })
            .collect())
    }

    /// Bookings matching `filter`, newest first.
    pub fn history(&self, filter: &HistoryFilter) -> Page<Booking> {
        let page = filter.page.max(1);
        let page_size = match filter.page_size {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };

        let mut matches: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|entry| {
                let b = entry.value();
                filter
                    .user_id
                    .as_ref()
                    .is_none_or(|u| &b.header.user_id == u)
                    && filter.status.is_none_or(|s| b.header.status == s)
                    && filter
                        .room_id
                        .is_none_or(|r| b.lines.iter().any(|l| l.room_id == r))
            })
            .map(|entry| entry.value().clone())
            .collect();
        matches.sort_by_key(|b| Reverse((b.header.created_at, b.header.id)));

        let total = matches.len();
        let items = matches
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();
        Page {
            items,
            page,
            page_size,
            total,
        }
    }
}
