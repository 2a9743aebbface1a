use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    CapacityExceeded {
        slot_id: Ulid,
        capacity: u32,
    },
    DuplicateBooking {
        requester_id: Ulid,
        slot_id: Ulid,
        existing: Ulid,
    },
    /// Optimistic retries exhausted. The only outcome a caller may blindly retry.
    Conflict(Ulid),
    InvalidStateTransition {
        booking_id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
    },
    Forbidden(&'static str),
    TaskInactive(Ulid),
    SlotNotEnded(Ulid),
    HasLiveBookings(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }

    /// Stable label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::DuplicateBooking { .. } => "duplicate_booking",
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidStateTransition { .. } => "invalid_state_transition",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::TaskInactive(_) => "task_inactive",
            EngineError::SlotNotEnded(_) => "slot_not_ended",
            EngineError::HasLiveBookings(_) => "has_live_bookings",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::CapacityExceeded { slot_id, capacity } => {
                write!(f, "slot {slot_id} is fully booked (capacity {capacity})")
            }
            EngineError::DuplicateBooking {
                requester_id,
                slot_id,
                existing,
            } => write!(
                f,
                "requester {requester_id} already holds booking {existing} on slot {slot_id}"
            ),
            EngineError::Conflict(id) => {
                write!(f, "concurrent update on {id}: retries exhausted, retry the request")
            }
            EngineError::InvalidStateTransition { booking_id, from, to } => {
                write!(f, "booking {booking_id} cannot move from {from} to {to}")
            }
            EngineError::Forbidden(reason) => write!(f, "forbidden: {reason}"),
            EngineError::TaskInactive(id) => write!(f, "task {id} is not active"),
            EngineError::SlotNotEnded(id) => write!(f, "slot {id} has not ended yet"),
            EngineError::HasLiveBookings(id) => {
                write!(f, "cannot delete task {id}: slots still hold live bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
