use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as Ms)
}

pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if start >= end {
        return Err(EngineError::LimitExceeded("slot must end after it starts"));
    }
    let span = Span::new(start, end);
    if !span.within_one_day() {
        return Err(EngineError::LimitExceeded("slot must start and end on the same day"));
    }
    Ok(span)
}

pub(crate) fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::LimitExceeded("capacity must be positive"));
    }
    if capacity > MAX_SLOT_CAPACITY {
        return Err(EngineError::LimitExceeded("capacity too large"));
    }
    Ok(())
}

pub(crate) fn validate_remark(remark: Option<&str>) -> Result<(), EngineError> {
    if remark.is_some_and(|r| r.chars().count() > MAX_REMARK_LEN) {
        return Err(EngineError::LimitExceeded("remark too long"));
    }
    Ok(())
}

/// Fails when the snapshot shows no room left.
pub(crate) fn check_capacity(snapshot: &SlotSnapshot) -> Result<(), EngineError> {
    if snapshot.booked_count >= snapshot.capacity {
        return Err(EngineError::CapacityExceeded {
            slot_id: snapshot.slot_id,
            capacity: snapshot.capacity,
        });
    }
    Ok(())
}

/// A user's cancellation is refused once `now` has reached the task's
/// deadline ahead of the slot start.
pub(crate) fn check_cancel_deadline(task: &TaskState, span: &Span, now: Ms) -> Result<(), EngineError> {
    if let Some(deadline) = task.cancel_deadline_ms
        && now >= span.start - deadline
    {
        return Err(EngineError::Forbidden("cancellation deadline has passed"));
    }
    Ok(())
}
