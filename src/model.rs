use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

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

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// True when both ends fall on the same UTC day. `end` is exclusive, so a
    /// slot ending exactly at midnight still belongs to the previous day.
    pub fn within_one_day(&self) -> bool {
        self.start.div_euclid(DAY_MS) == (self.end - 1).div_euclid(DAY_MS)
    }

    pub fn has_ended(&self, now: Ms) -> bool {
        self.end <= now
    }
}

/// Catalog status of a task. The capacity path reads it, never writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Active,
    Inactive,
}

/// A merchant offering on one date; owns its slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskState {
    pub id: Ulid,
    pub merchant_id: Ulid,
    pub status: TaskStatus,
    /// Users may cancel only while `now < slot.start - cancel_deadline_ms`.
    pub cancel_deadline_ms: Option<Ms>,
}

impl TaskState {
    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Pending and Confirmed bookings are live: they count against the
    /// (requester, slot) uniqueness rule and can still be cancelled.
    pub fn is_live(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed)
    }

    /// The complete transition table. Anything not listed is illegal.
    pub fn can_transition_to(self, to: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, to),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Cancelled) | (Confirmed, Completed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub slot_id: Ulid,
    pub requester_id: Ulid,
    pub status: BookingStatus,
    pub remark: Option<String>,
    /// Bumped on every status change; writers must present the value they read.
    pub version: u64,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub reminded_at: Option<Ms>,
    /// Set once the retention sweep handed the record to the archive.
    pub archived_at: Option<Ms>,
}

impl Booking {
    pub fn pending(id: Ulid, slot_id: Ulid, requester_id: Ulid, remark: Option<String>, now: Ms) -> Self {
        Self {
            id,
            slot_id,
            requester_id,
            status: BookingStatus::Pending,
            remark,
            version: 0,
            created_at: now,
            updated_at: now,
            reminded_at: None,
            archived_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlotState {
    pub id: Ulid,
    pub task_id: Ulid,
    pub span: Span,
    pub capacity: u32,
    /// Units of capacity taken: one per Pending, Confirmed or Completed booking.
    /// Only cancellation gives a unit back.
    pub booked_count: u32,
    /// Bumped on every `booked_count` change.
    pub version: u64,
    /// Every booking ever made against this slot (minus purged ones), in id order.
    pub bookings: Vec<Booking>,
    /// Set once the owning task is deleted; writers holding a stale handle must bail.
    pub retired: bool,
}

impl SlotState {
    pub fn new(id: Ulid, task_id: Ulid, span: Span, capacity: u32) -> Self {
        Self {
            id,
            task_id,
            span,
            capacity,
            booked_count: 0,
            version: 0,
            bookings: Vec::new(),
            retired: false,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.booked_count)
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            slot_id: self.id,
            task_id: self.task_id,
            span: self.span,
            capacity: self.capacity,
            booked_count: self.booked_count,
            version: self.version,
        }
    }

    /// Insert a booking keeping id order (ULIDs sort by creation time).
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.id, |b| b.id)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn find_booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings
            .binary_search_by_key(id, |b| b.id)
            .ok()
            .map(|pos| &self.bookings[pos])
    }

    pub fn find_booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        match self.bookings.binary_search_by_key(id, |b| b.id) {
            Ok(pos) => Some(&mut self.bookings[pos]),
            Err(_) => None,
        }
    }

    pub fn remove_booking(&mut self, id: &Ulid) -> Option<Booking> {
        match self.bookings.binary_search_by_key(id, |b| b.id) {
            Ok(pos) => Some(self.bookings.remove(pos)),
            Err(_) => None,
        }
    }

    pub fn live_bookings(&self) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(|b| b.status.is_live())
    }

    pub fn bookings_with_status(&self, status: BookingStatus) -> impl Iterator<Item = &Booking> {
        self.bookings.iter().filter(move |b| b.status == status)
    }
}

/// The capacity fields a reservation attempt read, including the version it
/// must present at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub slot_id: Ulid,
    pub task_id: Ulid,
    pub span: Span,
    pub capacity: u32,
    pub booked_count: u32,
    pub version: u64,
}

/// The event types — flat, no nesting beyond the booking row. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    TaskCreated {
        id: Ulid,
        merchant_id: Ulid,
        cancel_deadline_ms: Option<Ms>,
    },
    TaskStatusChanged {
        id: Ulid,
        status: TaskStatus,
    },
    TaskDeadlineChanged {
        id: Ulid,
        cancel_deadline_ms: Option<Ms>,
    },
    TaskDeleted {
        id: Ulid,
    },
    SlotCreated {
        id: Ulid,
        task_id: Ulid,
        span: Span,
        capacity: u32,
    },
    BookingReserved {
        booking: Booking,
    },
    BookingTransitioned {
        id: Ulid,
        slot_id: Ulid,
        status: BookingStatus,
        version: u64,
        at: Ms,
    },
    ReminderSent {
        id: Ulid,
        slot_id: Ulid,
        at: Ms,
    },
    BookingArchived {
        id: Ulid,
        slot_id: Ulid,
        at: Ms,
    },
    BookingPurged {
        id: Ulid,
        slot_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub id: Ulid,
    pub task_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub capacity: u32,
    pub booked_count: u32,
    pub available: u32,
    pub version: u64,
}

impl From<&SlotState> for SlotInfo {
    fn from(rs: &SlotState) -> Self {
        Self {
            id: rs.id,
            task_id: rs.task_id,
            start: rs.span.start,
            end: rs.span.end,
            capacity: rs.capacity,
            booked_count: rs.booked_count,
            available: rs.remaining(),
            version: rs.version,
        }
    }
}

/// Per-day aggregate handed to the statistics sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySummary {
    pub day_start: Ms,
    pub total: u64,
    pub pending: u64,
    pub confirmed: u64,
    pub cancelled: u64,
    pub completed: u64,
    /// Capacity and live bookings of slots starting that day.
    pub capacity: u64,
    pub booked: u64,
}

impl DailySummary {
    /// Booked share of capacity in percent; zero for a day without slots.
    pub fn utilization_pct(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.booked as f64 / self.capacity as f64 * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking_with_status(status: BookingStatus) -> Booking {
        let mut b = Booking::pending(Ulid::new(), Ulid::new(), Ulid::new(), None, 0);
        b.status = status;
        b
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(!s.contains_instant(200)); // half-open
        assert!(!s.has_ended(199));
        assert!(s.has_ended(200));
    }

    #[test]
    fn span_same_day() {
        let day = 20_000 * DAY_MS;
        assert!(Span::new(day + 9 * HOUR_MS, day + 10 * HOUR_MS).within_one_day());
        // Ending exactly at midnight stays on the same day.
        assert!(Span::new(day + 23 * HOUR_MS, day + DAY_MS).within_one_day());
        assert!(!Span::new(day + 23 * HOUR_MS, day + DAY_MS + 1).within_one_day());
    }

    #[test]
    fn transition_table_is_closed() {
        use BookingStatus::*;
        let all = [Pending, Confirmed, Cancelled, Completed];
        let legal = [
            (Pending, Confirmed),
            (Pending, Cancelled),
            (Confirmed, Cancelled),
            (Confirmed, Completed),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in [BookingStatus::Cancelled, BookingStatus::Completed] {
            assert!(from.is_terminal());
            assert!(!from.is_live());
        }
        assert!(BookingStatus::Pending.is_live());
        assert!(BookingStatus::Confirmed.is_live());
    }

    #[test]
    fn bookings_stay_in_id_order() {
        let mut rs = SlotState::new(Ulid::new(), Ulid::new(), Span::new(0, 100), 3);
        let ids: Vec<Ulid> = (0..3).map(|_| Ulid::new()).collect();
        for &id in ids.iter().rev() {
            rs.insert_booking(Booking::pending(id, rs.id, Ulid::new(), None, 0));
        }
        let stored: Vec<Ulid> = rs.bookings.iter().map(|b| b.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(stored, sorted);
        assert!(rs.find_booking(&ids[1]).is_some());
        assert!(rs.remove_booking(&ids[1]).is_some());
        assert!(rs.find_booking(&ids[1]).is_none());
        assert_eq!(rs.bookings.len(), 2);
    }

    #[test]
    fn live_and_status_filters() {
        let mut rs = SlotState::new(Ulid::new(), Ulid::new(), Span::new(0, 100), 5);
        for status in [
            BookingStatus::Pending,
            BookingStatus::Confirmed,
            BookingStatus::Cancelled,
            BookingStatus::Completed,
        ] {
            rs.insert_booking(booking_with_status(status));
        }
        assert_eq!(rs.live_bookings().count(), 2);
        assert_eq!(rs.bookings_with_status(BookingStatus::Cancelled).count(), 1);
    }

    #[test]
    fn remaining_never_underflows() {
        let mut rs = SlotState::new(Ulid::new(), Ulid::new(), Span::new(0, 100), 1);
        rs.booked_count = 1;
        assert_eq!(rs.remaining(), 0);
        let info = SlotInfo::from(&rs);
        assert_eq!(info.available, 0);
    }

    #[test]
    fn utilization_of_empty_day_is_zero() {
        let summary = DailySummary::default();
        assert_eq!(summary.utilization_pct(), 0.0);
        let busy = DailySummary { capacity: 4, booked: 3, ..Default::default() };
        assert!((busy.utilization_pct() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingReserved {
            booking: Booking::pending(Ulid::new(), Ulid::new(), Ulid::new(), Some("window seat".into()), 42),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
