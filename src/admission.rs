use std::sync::Arc;

use rust_decimal::Decimal;
use ulid::Ulid;

use crate::catalog::{CatalogError, RoomCatalog, SnackCatalog};
use crate::engine::{now_ms, validate_span, Engine, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::pricing::{price_span, PriceBreakdown};
use crate::queue::Submission;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmitError {
    Validation(String),
    Unauthorized(String),
    CapacityExceeded {
        room_id: Ulid,
        capacity: u32,
        participants: u32,
    },
    /// What was missing ("room", "snack", "booking") and its id.
    NotFound(&'static str, Ulid),
    SlotUnavailable {
        room_id: Ulid,
        conflicting: Ulid,
    },
    AlreadyProcessed(Ulid),
    Store(String),
}

impl AdmitError {
    /// Infrastructure failures worth retrying. Everything else is a final answer.
    pub fn is_transient(&self) -> bool {
        matches!(self, AdmitError::Store(_))
    }
}

impl std::fmt::Display for AdmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmitError::Validation(msg) => write!(f, "invalid request: {msg}"),
            AdmitError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            AdmitError::CapacityExceeded {
                room_id,
                capacity,
                participants,
            } => write!(
                f,
                "room {room_id} holds {capacity} participants, {participants} requested"
            ),
            AdmitError::NotFound(what, id) => write!(f, "{what} not found: {id}"),
            AdmitError::SlotUnavailable { room_id, .. } => {
                write!(f, "room {room_id} is already booked for that time")
            }
            AdmitError::AlreadyProcessed(id) => write!(f, "booking {id} already processed"),
            AdmitError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for AdmitError {}

impl From<EngineError> for AdmitError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(id) => AdmitError::NotFound("booking", id),
            EngineError::AlreadyExists(id) => {
                AdmitError::Validation(format!("booking {id} already exists"))
            }
            EngineError::Conflict {
                room_id,
                booking_id,
            } => AdmitError::SlotUnavailable {
                room_id,
                conflicting: booking_id,
            },
            EngineError::AlreadyProcessed(id) => AdmitError::AlreadyProcessed(id),
            EngineError::InvalidBooking(msg) => AdmitError::Validation(msg),
            EngineError::LimitExceeded(msg) => AdmitError::Validation(msg.to_string()),
            EngineError::WalError(e) => AdmitError::Store(e),
        }
    }
}

impl From<CatalogError> for AdmitError {
    fn from(e: CatalogError) -> Self {
        AdmitError::Store(e.to_string())
    }
}

/// A priced line of a preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteLine {
    pub room: RoomInfo,
    pub snack: Option<SnackInfo>,
    pub span: Span,
    pub participants: u32,
    pub price: PriceBreakdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub lines: Vec<QuoteLine>,
    pub total: Decimal,
}

struct Resolved<'r> {
    request: &'r LineRequest,
    room: RoomInfo,
    snack: Option<SnackInfo>,
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), AdmitError> {
    if value.len() > max {
        return Err(AdmitError::Validation(format!(
            "{field} longer than {max} bytes"
        )));
    }
    Ok(())
}

fn unchecked_span(line: &LineRequest) -> Span {
    Span {
        start: line.start,
        end: line.end,
    }
}

/// Structural checks that need neither the catalogs nor the store. Runs at
/// submit time and again when the worker admits the request.
pub fn check_request(caller: &Caller, request: &BookingRequest) -> Result<(), AdmitError> {
    if request.user_id.is_empty() {
        return Err(AdmitError::Validation("user id is required".into()));
    }
    check_len("user id", &request.user_id, MAX_USER_ID_LEN)?;
    if request.user_id != caller.user_id {
        return Err(AdmitError::Unauthorized(format!(
            "user {} cannot book on behalf of {}",
            caller.user_id, request.user_id
        )));
    }
    if request.name.trim().is_empty() {
        return Err(AdmitError::Validation("name is required".into()));
    }
    check_len("name", &request.name, MAX_NAME_LEN)?;
    check_len("phone", &request.phone, MAX_PHONE_LEN)?;
    check_len("company", &request.company, MAX_NAME_LEN)?;
    if let Some(notes) = &request.notes {
        check_len("notes", notes, MAX_NOTES_LEN)?;
    }
    check_lines(&request.lines)
}

fn check_lines(lines: &[LineRequest]) -> Result<(), AdmitError> {
    if lines.is_empty() {
        return Err(AdmitError::Validation("at least one room is required".into()));
    }
    if lines.len() > MAX_LINES_PER_BOOKING {
        return Err(AdmitError::Validation(format!(
            "at most {MAX_LINES_PER_BOOKING} rooms per booking"
        )));
    }
    for line in lines {
        if line.participants == 0 {
            return Err(AdmitError::Validation(
                "participants must be at least 1".into(),
            ));
        }
        validate_span(&unchecked_span(line))?;
    }
    for (i, a) in lines.iter().enumerate() {
        for b in &lines[i + 1..] {
            if a.room_id == b.room_id && unchecked_span(a).overlaps(&unchecked_span(b)) {
                return Err(AdmitError::Validation(format!(
                    "room {} is requested twice for overlapping times",
                    a.room_id
                )));
            }
        }
    }
    Ok(())
}

fn check_not_past(span: &Span, now: Ms) -> Result<(), AdmitError> {
    if span.start < now || span.end < now {
        return Err(AdmitError::Validation(
            "reservation time must be after current time".into(),
        ));
    }
    Ok(())
}

fn check_capacity(room: &RoomInfo, participants: u32) -> Result<(), AdmitError> {
    if participants > room.capacity {
        return Err(AdmitError::CapacityExceeded {
            room_id: room.id,
            capacity: room.capacity,
            participants,
        });
    }
    Ok(())
}

fn price_line(resolved: &Resolved<'_>, span: &Span) -> PriceBreakdown {
    let snack_price = resolved
        .snack
        .as_ref()
        .map(|s| s.unit_price)
        .unwrap_or(Decimal::ZERO);
    price_span(
        resolved.room.hourly_rate,
        span,
        snack_price,
        resolved.request.participants,
    )
}

/// The single write path into the booking store.
pub struct Admission {
    engine: Arc<Engine>,
    rooms: Arc<dyn RoomCatalog>,
    snacks: Arc<dyn SnackCatalog>,
}

impl Admission {
    pub fn new(
        engine: Arc<Engine>,
        rooms: Arc<dyn RoomCatalog>,
        snacks: Arc<dyn SnackCatalog>,
    ) -> Self {
        Self {
            engine,
            rooms,
            snacks,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    async fn resolve<'r>(&self, lines: &'r [LineRequest]) -> Result<Vec<Resolved<'r>>, AdmitError> {
        let mut resolved = Vec::with_capacity(lines.len());
        for request in lines {
            let room = self
                .rooms
                .get_room(request.room_id)
                .await?
                .ok_or(AdmitError::NotFound("room", request.room_id))?;
            let snack = match request.snack_id {
                Some(id) => Some(
                    self.snacks
                        .get_snack(id)
                        .await?
                        .ok_or(AdmitError::NotFound("snack", id))?,
                ),
                None => None,
            };
            resolved.push(Resolved {
                request,
                room,
                snack,
            });
        }
        Ok(resolved)
    }

    /// Validate, check for overlap and commit one submission. The overlap
    /// check and the insert run under the write locks of every target room.
    ///
    /// The booking id is the submission id, so a redelivered submission that
    /// already committed returns the existing booking.
    pub async fn admit(&self, submission: &Submission) -> Result<Booking, AdmitError> {
        if let Some(existing) = self.engine.get_booking(&submission.id) {
            tracing::debug!("submission {} already committed", submission.id);
            return Ok(existing);
        }

        let request = &submission.request;
        check_request(&submission.caller, request)?;
        let resolved = self.resolve(&request.lines).await?;

        let room_ids: Vec<Ulid> = resolved.iter().map(|r| r.room.id).collect();
        let mut txn = self.engine.begin(&room_ids).await?;
        let now = now_ms();

        let mut spans = Vec::with_capacity(resolved.len());
        for r in &resolved {
            let span = unchecked_span(r.request);
            check_not_past(&span, now)?;
            check_capacity(&r.room, r.request.participants)?;
            spans.push(span);
        }

        let mut total = Decimal::ZERO;
        for (r, span) in resolved.iter().zip(&spans) {
            if let Some(conflicting) = txn.conflicting(r.room.id, span)? {
                return Err(AdmitError::SlotUnavailable {
                    room_id: r.room.id,
                    conflicting,
                });
            }
            let price = price_line(r, span);
            total += price.total;
            txn.stage_line(BookingLine {
                id: Ulid::new(),
                booking_id: submission.id,
                room_id: r.room.id,
                snack_id: r.snack.as_ref().map(|s| s.id),
                span: *span,
                participants: r.request.participants,
                price_room_perhour: r.room.hourly_rate,
                price_snack_perpack: r.snack.as_ref().map(|s| s.unit_price).unwrap_or(Decimal::ZERO),
                subtotal_room: price.subtotal_room,
                subtotal_snack: price.subtotal_snack,
            })?;
        }

        txn.stage_header(BookingHeader {
            id: submission.id,
            user_id: request.user_id.clone(),
            name: request.name.clone(),
            phone: request.phone.clone(),
            company: request.company.clone(),
            notes: request.notes.clone(),
            total,
            status: BookingStatus::Pending,
            created_at: now,
            updated_at: now,
        });

        match txn.commit().await {
            Ok(booking) => Ok(booking),
            Err(EngineError::AlreadyExists(id)) => self
                .engine
                .get_booking(&id)
                .ok_or(AdmitError::NotFound("booking", id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Price the lines and probe for overlap without writing anything. Runs the
    /// same checks as `admit`, so a quote is only given for what would commit
    /// right now.
    pub async fn preview(&self, lines: &[LineRequest]) -> Result<Quote, AdmitError> {
        check_lines(lines)?;
        let resolved = self.resolve(lines).await?;
        let now = now_ms();

        let mut quoted = Vec::with_capacity(resolved.len());
        let mut total = Decimal::ZERO;
        for r in resolved {
            let span = unchecked_span(r.request);
            check_not_past(&span, now)?;
            check_capacity(&r.room, r.request.participants)?;
            if self.engine.exists_overlap(r.room.id, &span).await {
                let conflicting = self
                    .engine
                    .room_schedule(r.room.id, &span)
                    .await?
                    .first()
                    .map(|e| e.booking_id)
                    .unwrap_or(Ulid::nil());
                return Err(AdmitError::SlotUnavailable {
                    room_id: r.room.id,
                    conflicting,
                });
            }
            let price = price_line(&r, &span);
            total += price.total;
            quoted.push(QuoteLine {
                participants: r.request.participants,
                room: r.room,
                snack: r.snack,
                span,
                price,
            });
        }
        Ok(Quote {
            lines: quoted,
            total,
        })
    }

    /// Change a booking's status. Admins may confirm or cancel; the owner may
    /// only cancel.
    pub async fn update_status(
        &self,
        caller: &Caller,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, AdmitError> {
        if status == BookingStatus::Pending {
            return Err(AdmitError::Validation(
                "a booking cannot be moved back to pending".into(),
            ));
        }
        let booking = self
            .engine
            .get_booking(&id)
            .ok_or(AdmitError::NotFound("booking", id))?;
        if !caller.is_admin() {
            if booking.header.user_id != caller.user_id {
                return Err(AdmitError::Unauthorized(format!(
                    "booking {id} belongs to another user"
                )));
            }
            if status != BookingStatus::Canceled {
                return Err(AdmitError::Unauthorized(
                    "only an admin can confirm a booking".into(),
                ));
            }
        }
        let updated = self.engine.update_status(id, status, now_ms()).await?;
        tracing::info!("booking {id} is now {status} (by {})", caller.user_id);
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;

    const H: Ms = 3_600_000;

    fn tmp_wal(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("meetbook_test_admission");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    struct Fixture {
        admission: Admission,
        room: RoomInfo,
        snack: SnackInfo,
    }

    fn fixture(name: &str) -> Fixture {
        let catalog = Arc::new(InMemoryCatalog::new());
        let room = RoomInfo {
            id: Ulid::new(),
            name: "Orchid".into(),
            kind: "small".into(),
            capacity: 8,
            hourly_rate: Decimal::from(100_000),
            image_path: String::new(),
        };
        let snack = SnackInfo {
            id: Ulid::new(),
            name: "Lunch box".into(),
            unit_price: Decimal::from(50_000),
            category: "lunch".into(),
        };
        catalog.insert_room(room.clone());
        catalog.insert_snack(snack.clone());
        let engine = Arc::new(Engine::new(tmp_wal(name)).unwrap());
        Fixture {
            admission: Admission::new(engine, catalog.clone(), catalog),
            room,
            snack,
        }
    }

    /// Tomorrow-ish, aligned to the hour.
    fn future_hour(offset_hours: i64) -> Ms {
        (now_ms() / H + 24 + offset_hours) * H
    }

    fn request(user: &str, lines: Vec<LineRequest>) -> BookingRequest {
        BookingRequest {
            user_id: user.into(),
            name: "User Test".into(),
            phone: "081234567890".into(),
            company: "Test Company".into(),
            notes: None,
            lines,
        }
    }

    fn line(room_id: Ulid, snack_id: Option<Ulid>, start: Ms, hours: i64, participants: u32) -> LineRequest {
        LineRequest {
            room_id,
            snack_id,
            start,
            end: start + hours * H,
            participants,
        }
    }

    fn submission(user: &str, lines: Vec<LineRequest>) -> Submission {
        Submission::new(Caller::user(user), request(user, lines))
    }

    #[tokio::test]
    async fn admit_prices_with_catalog_rates() {
        let f = fixture("prices.wal");
        let start = future_hour(9);
        let sub = submission("25", vec![line(f.room.id, Some(f.snack.id), start, 2, 5)]);

        let booking = f.admission.admit(&sub).await.unwrap();
        assert_eq!(booking.id(), sub.id);
        assert_eq!(booking.header.status, BookingStatus::Pending);
        assert_eq!(booking.header.created_at, booking.header.updated_at);
        assert_eq!(booking.header.total, Decimal::from(450_000));
        let l = &booking.lines[0];
        assert_eq!(l.subtotal_room, Decimal::from(200_000));
        assert_eq!(l.subtotal_snack, Decimal::from(250_000));
        assert_eq!(l.price_room_perhour, Decimal::from(100_000));
        assert_eq!(l.price_snack_perpack, Decimal::from(50_000));
    }

    #[tokio::test]
    async fn redelivered_submission_is_idempotent() {
        let f = fixture("redeliver.wal");
        let sub = submission("25", vec![line(f.room.id, None, future_hour(9), 1, 2)]);
        let first = f.admission.admit(&sub).await.unwrap();
        let second = f.admission.admit(&sub).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.admission.engine().booking_count(), 1);
    }

    #[tokio::test]
    async fn touching_bookings_both_admitted() {
        let f = fixture("touching.wal");
        let start = future_hour(9);
        f.admission
            .admit(&submission("25", vec![line(f.room.id, None, start, 1, 2)]))
            .await
            .unwrap();
        f.admission
            .admit(&submission("26", vec![line(f.room.id, None, start + H, 1, 2)]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn overlap_is_slot_unavailable() {
        let f = fixture("overlap.wal");
        let start = future_hour(9);
        let first = f
            .admission
            .admit(&submission("25", vec![line(f.room.id, None, start, 2, 2)]))
            .await
            .unwrap();
        let second = submission("26", vec![line(f.room.id, None, start + H, 2, 2)]);
        let err = f.admission.admit(&second).await.unwrap_err();
        assert_eq!(
            err,
            AdmitError::SlotUnavailable {
                room_id: f.room.id,
                conflicting: first.id(),
            }
        );
        assert!(!err.is_transient());
        assert!(f.admission.engine().get_booking(&second.id).is_none());
    }

    #[tokio::test]
    async fn capacity_exceeded_never_reaches_store() {
        let f = fixture("capacity.wal");
        let sub = submission("25", vec![line(f.room.id, None, future_hour(9), 1, 9)]);
        let err = f.admission.admit(&sub).await.unwrap_err();
        assert_eq!(
            err,
            AdmitError::CapacityExceeded {
                room_id: f.room.id,
                capacity: 8,
                participants: 9,
            }
        );
        assert_eq!(f.admission.engine().booking_count(), 0);
    }

    #[tokio::test]
    async fn unknown_room_and_snack() {
        let f = fixture("unknown.wal");
        let missing = Ulid::new();
        let err = f
            .admission
            .admit(&submission("25", vec![line(missing, None, future_hour(9), 1, 2)]))
            .await
            .unwrap_err();
        assert_eq!(err, AdmitError::NotFound("room", missing));

        let err = f
            .admission
            .admit(&submission("25", vec![line(f.room.id, Some(missing), future_hour(9), 1, 2)]))
            .await
            .unwrap_err();
        assert_eq!(err, AdmitError::NotFound("snack", missing));
    }

    #[tokio::test]
    async fn past_and_inverted_times_rejected() {
        let f = fixture("past.wal");
        let past = (now_ms() / H - 48) * H;
        let err = f
            .admission
            .admit(&submission("25", vec![line(f.room.id, None, past, 1, 2)]))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmitError::Validation(_)));

        let start = future_hour(9);
        let inverted = LineRequest {
            room_id: f.room.id,
            snack_id: None,
            start,
            end: start - H,
            participants: 2,
        };
        let err = f
            .admission
            .admit(&submission("25", vec![inverted]))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmitError::Validation(_)));
    }

    #[test]
    fn check_request_structure() {
        let room = Ulid::new();
        let start = future_hour(9);
        let ok = request("25", vec![line(room, None, start, 1, 1)]);
        assert!(check_request(&Caller::user("25"), &ok).is_ok());

        assert!(matches!(
            check_request(&Caller::user("26"), &ok),
            Err(AdmitError::Unauthorized(_))
        ));
        assert!(matches!(
            check_request(&Caller::user("25"), &request("25", vec![])),
            Err(AdmitError::Validation(_))
        ));
        assert!(matches!(
            check_request(&Caller::user("25"), &request("25", vec![line(room, None, start, 1, 0)])),
            Err(AdmitError::Validation(_))
        ));
        let twice = request(
            "25",
            vec![line(room, None, start, 2, 1), line(room, None, start + H, 1, 1)],
        );
        assert!(matches!(
            check_request(&Caller::user("25"), &twice),
            Err(AdmitError::Validation(_))
        ));
        let mut long_name = ok.clone();
        long_name.name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(check_request(&Caller::user("25"), &long_name).is_err());
    }

    #[tokio::test]
    async fn preview_matches_commit() {
        let f = fixture("preview.wal");
        let start = future_hour(9);
        let lines = vec![line(f.room.id, Some(f.snack.id), start, 2, 5)];

        let quote = f.admission.preview(&lines).await.unwrap();
        assert_eq!(quote.total, Decimal::from(450_000));
        assert_eq!(quote.lines[0].room.name, "Orchid");
        assert_eq!(f.admission.engine().booking_count(), 0);

        let booking = f.admission.admit(&submission("25", lines.clone())).await.unwrap();
        assert_eq!(booking.header.total, quote.total);

        let err = f.admission.preview(&lines).await.unwrap_err();
        assert!(matches!(err, AdmitError::SlotUnavailable { conflicting, .. } if conflicting == booking.id()));
    }

    #[tokio::test]
    async fn status_update_rules() {
        let f = fixture("status.wal");
        let mk = |user: &str, offset| submission(user, vec![line(f.room.id, None, future_hour(offset), 1, 2)]);
        let owned = f.admission.admit(&mk("25", 0)).await.unwrap();

        assert!(matches!(
            f.admission.update_status(&Caller::user("25"), owned.id(), BookingStatus::Confirmed).await,
            Err(AdmitError::Unauthorized(_))
        ));
        assert!(matches!(
            f.admission.update_status(&Caller::user("26"), owned.id(), BookingStatus::Canceled).await,
            Err(AdmitError::Unauthorized(_))
        ));
        assert!(matches!(
            f.admission.update_status(&Caller::admin("admin"), owned.id(), BookingStatus::Pending).await,
            Err(AdmitError::Validation(_))
        ));

        let confirmed = f
            .admission
            .update_status(&Caller::admin("admin"), owned.id(), BookingStatus::Confirmed)
            .await
            .unwrap();
        assert_eq!(confirmed.header.status, BookingStatus::Confirmed);
        assert_eq!(
            f.admission
                .update_status(&Caller::admin("admin"), owned.id(), BookingStatus::Canceled)
                .await,
            Err(AdmitError::AlreadyProcessed(owned.id()))
        );

        let other = f.admission.admit(&mk("25", 3)).await.unwrap();
        let canceled = f
            .admission
            .update_status(&Caller::user("25"), other.id(), BookingStatus::Canceled)
            .await
            .unwrap();
        assert_eq!(canceled.header.status, BookingStatus::Canceled);

        assert_eq!(
            f.admission
                .update_status(&Caller::admin("admin"), Ulid::nil(), BookingStatus::Canceled)
                .await,
            Err(AdmitError::NotFound("booking", Ulid::nil()))
        );
    }

    #[test]
    fn only_store_errors_are_transient() {
        assert!(AdmitError::Store("disk".into()).is_transient());
        assert!(!AdmitError::Validation("bad".into()).is_transient());
        assert!(AdmitError::from(CatalogError::Unavailable("down".into())).is_transient());
        assert!(AdmitError::from(EngineError::WalError("io".into())).is_transient());
    }
}
