use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// A line on `room_id` overlaps an active line of `booking_id`.
    Conflict {
        room_id: Ulid,
        booking_id: Ulid,
    },
    AlreadyProcessed(Ulid),
    InvalidBooking(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict {
                room_id,
                booking_id,
            } => write!(f, "room {room_id} is taken by booking {booking_id}"),
            EngineError::AlreadyProcessed(id) => write!(f, "booking {id} already processed"),
            EngineError::InvalidBooking(msg) => write!(f, "invalid booking: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
