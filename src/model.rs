use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type inside the engine.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Canceled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" | "booked" => Ok(BookingStatus::Pending),
            "confirmed" | "paid" => Ok(BookingStatus::Confirmed),
            "canceled" | "cancelled" => Ok(BookingStatus::Canceled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingHeader {
    pub id: Ulid,
    pub user_id: String,
    pub name: String,
    pub phone: String,
    pub company: String,
    pub notes: Option<String>,
    pub total: Decimal,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl BookingHeader {
    /// A booking whose timestamps diverged has had its one status change.
    pub fn is_processed(&self) -> bool {
        self.updated_at != self.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingLine {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub room_id: Ulid,
    pub snack_id: Option<Ulid>,
    pub span: Span,
    pub participants: u32,
    pub price_room_perhour: Decimal,
    pub price_snack_perpack: Decimal,
    pub subtotal_room: Decimal,
    pub subtotal_snack: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub header: BookingHeader,
    pub lines: Vec<BookingLine>,
}

impl Booking {
    pub fn id(&self) -> Ulid {
        self.header.id
    }

    /// Distinct room ids, sorted.
    pub fn room_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.lines.iter().map(|l| l.room_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

// ── Room ledger ──────────────────────────────────────────────────

/// One active (non-canceled) booking line occupying a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub line_id: Ulid,
    pub booking_id: Ulid,
    pub span: Span,
}

/// Active reservations of a single room, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct RoomLedger {
    pub room_id: Ulid,
    pub reservations: Vec<Reservation>,
}

impl RoomLedger {
    pub fn new(room_id: Ulid) -> Self {
        Self {
            room_id,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    /// Drop every reservation belonging to `booking_id`. Returns how many were removed.
    pub fn remove_booking(&mut self, booking_id: Ulid) -> usize {
        let before = self.reservations.len();
        self.reservations.retain(|r| r.booking_id != booking_id);
        before - self.reservations.len()
    }

    /// Return only reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }
}

/// The WAL record format of the booking store.
///
/// A booking is written as a single record carrying header and lines together,
/// so replay can never observe one without the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCommitted {
        booking: Booking,
    },
    StatusChanged {
        id: Ulid,
        status: BookingStatus,
        updated_at: Ms,
    },
}

// ── Catalog entries ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub capacity: u32,
    pub hourly_rate: Decimal,
    #[serde(default)]
    pub image_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnackInfo {
    pub id: Ulid,
    pub name: String,
    pub unit_price: Decimal,
    #[serde(default)]
    pub category: String,
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRequest {
    pub room_id: Ulid,
    pub snack_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub participants: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub user_id: String,
    pub name: String,
    pub phone: String,
    pub company: String,
    pub notes: Option<String>,
    pub lines: Vec<LineRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Admin,
}

/// Validated identity of whoever is calling, produced once at the auth boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
}

impl Caller {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::User,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub booking_id: Ulid,
    pub line_id: Ulid,
    pub status: BookingStatus,
    pub start: Ms,
    pub end: Ms,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    /// `None` lists every user's bookings.
    pub user_id: Option<String>,
    pub status: Option<BookingStatus>,
    pub room_id: Option<Ulid>,
    /// 1-based.
    pub page: usize,
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> usize {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(self.page_size)
    }
}

// ── Timestamps ───────────────────────────────────────────────────

/// Wire layout: `2025-08-14 09:00:00.000 +0700`. The fraction is optional on input.
const TIMESTAMP_PARSE_LAYOUT: &str = "%Y-%m-%d %H:%M:%S%.f %z";
const TIMESTAMP_FORMAT_LAYOUT: &str = "%Y-%m-%d %H:%M:%S%.3f %z";

/// Parse a wire timestamp with an explicit UTC offset into absolute Unix ms.
pub fn parse_timestamp(s: &str) -> Result<Ms, String> {
    DateTime::parse_from_str(s.trim(), TIMESTAMP_PARSE_LAYOUT)
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| format!("bad timestamp {s:?}: {e}"))
}

/// Format absolute Unix ms in UTC using the wire layout.
pub fn format_timestamp(ms: Ms) -> String {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(dt) => dt.format(TIMESTAMP_FORMAT_LAYOUT).to_string(),
        None => ms.to_string(),
    }
}
