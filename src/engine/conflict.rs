use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if span.start >= span.end {
        return Err(EngineError::InvalidBooking(
            "start time must be before end time".into(),
        ));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// First active booking on the ledger whose line overlaps `span`.
pub fn find_conflict(ledger: &RoomLedger, span: &Span) -> Option<Ulid> {
    ledger.overlapping(span).next().map(|r| r.booking_id)
}

pub fn has_conflict(ledger: &RoomLedger, span: &Span) -> bool {
    find_conflict(ledger, span).is_some()
}

/// Two lines of one booking on the same room may not overlap each other.
pub fn check_lines_disjoint(lines: &[BookingLine]) -> Result<(), EngineError> {
    for (i, a) in lines.iter().enumerate() {
        for b in &lines[i + 1..] {
            if a.room_id == b.room_id && a.span.overlaps(&b.span) {
                return Err(EngineError::InvalidBooking(format!(
                    "lines overlap each other on room {}",
                    a.room_id
                )));
            }
        }
    }
    Ok(())
}
