use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedSlotState;

/// Slot store + booking store.
///
/// Bookings live inside their slot's state so that a slot's `booked_count` and
/// the statuses of its bookings always change under one write lock. The maps
/// here are indexes over that state:
/// - `booking_slot`: booking id → slot id
/// - `task_slots`: task id → slot ids (cascade + sweeps)
/// - `live`: (requester, slot) → live booking id, the uniqueness constraint
pub struct Store {
    tasks: DashMap<Ulid, TaskState>,
    slots: DashMap<Ulid, SharedSlotState>,
    task_slots: DashMap<Ulid, Vec<Ulid>>,
    booking_slot: DashMap<Ulid, Ulid>,
    live: DashMap<(Ulid, Ulid), Ulid>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            slots: DashMap::new(),
            task_slots: DashMap::new(),
            booking_slot: DashMap::new(),
            live: DashMap::new(),
        }
    }

    // ── Tasks ────────────────────────────────────────────────

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task(&self, id: &Ulid) -> Option<TaskState> {
        self.tasks.get(id).map(|e| e.value().clone())
    }

    pub fn contains_task(&self, id: &Ulid) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn task_ids(&self) -> Vec<Ulid> {
        self.tasks.iter().map(|e| *e.key()).collect()
    }

    // ── Slots ────────────────────────────────────────────────

    pub fn slot(&self, id: &Ulid) -> Option<SharedSlotState> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn contains_slot(&self, id: &Ulid) -> bool {
        self.slots.contains_key(id)
    }

    /// Clone out every slot handle. Callers lock them afterwards, never while
    /// a map shard is borrowed.
    pub fn all_slots(&self) -> Vec<SharedSlotState> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    pub fn slot_ids_for_task(&self, task_id: &Ulid) -> Vec<Ulid> {
        self.task_slots
            .get(task_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn slot_count_for_task(&self, task_id: &Ulid) -> usize {
        self.task_slots.get(task_id).map_or(0, |e| e.len())
    }

    // ── Booking index ────────────────────────────────────────

    pub fn slot_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_slot.get(booking_id).map(|e| *e.value())
    }

    pub fn live_booking(&self, requester_id: Ulid, slot_id: Ulid) -> Option<Ulid> {
        self.live.get(&(requester_id, slot_id)).map(|e| *e.value())
    }

    /// Claim the (requester, slot) key for `booking_id`. Fails with the current
    /// holder when the key is taken, whatever the caller checked beforehand.
    pub fn claim_live(&self, requester_id: Ulid, slot_id: Ulid, booking_id: Ulid) -> Result<(), Ulid> {
        match self.live.entry((requester_id, slot_id)) {
            Entry::Occupied(e) if *e.get() != booking_id => Err(*e.get()),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(e) => {
                e.insert(booking_id);
                Ok(())
            }
        }
    }

    /// Release the key only if it is still held by `booking_id`.
    pub fn release_live(&self, requester_id: Ulid, slot_id: Ulid, booking_id: Ulid) {
        self.live
            .remove_if(&(requester_id, slot_id), |_, held| *held == booking_id);
    }

    // ── Event application ────────────────────────────────────

    /// Apply catalog-level events (tasks, slot creation). Returns false for
    /// slot-level events, which go through [`Store::apply_to_slot`].
    pub fn apply_catalog(&self, event: &Event) -> bool {
        match event {
            Event::TaskCreated {
                id,
                merchant_id,
                cancel_deadline_ms,
            } => {
                self.tasks.insert(
                    *id,
                    TaskState {
                        id: *id,
                        merchant_id: *merchant_id,
                        status: TaskStatus::Active,
                        cancel_deadline_ms: *cancel_deadline_ms,
                    },
                );
            }
            Event::TaskStatusChanged { id, status } => {
                if let Some(mut task) = self.tasks.get_mut(id) {
                    task.status = *status;
                }
            }
            Event::TaskDeadlineChanged {
                id,
                cancel_deadline_ms,
            } => {
                if let Some(mut task) = self.tasks.get_mut(id) {
                    task.cancel_deadline_ms = *cancel_deadline_ms;
                }
            }
            Event::TaskDeleted { id } => {
                let slot_ids = self
                    .task_slots
                    .remove(id)
                    .map(|(_, ids)| ids)
                    .unwrap_or_default();
                for slot_id in slot_ids {
                    self.drop_slot(&slot_id);
                }
                self.tasks.remove(id);
            }
            Event::SlotCreated {
                id,
                task_id,
                span,
                capacity,
            } => {
                let rs = SlotState::new(*id, *task_id, *span, *capacity);
                self.slots.insert(*id, Arc::new(RwLock::new(rs)));
                self.task_slots.entry(*task_id).or_default().push(*id);
            }
            Event::BookingReserved { .. }
            | Event::BookingTransitioned { .. }
            | Event::ReminderSent { .. }
            | Event::BookingArchived { .. }
            | Event::BookingPurged { .. } => return false,
        }
        true
    }

    /// Apply a slot-level event to a slot the caller holds the write lock on.
    pub fn apply_to_slot(&self, rs: &mut SlotState, event: &Event) {
        match event {
            Event::BookingReserved { booking } => {
                // Live path always carries a Pending row; compacted logs carry
                // rows in whatever state they had reached.
                if booking.status != BookingStatus::Cancelled {
                    rs.booked_count += 1;
                }
                rs.version += 1;
                self.booking_slot.insert(booking.id, rs.id);
                if booking.status.is_live() {
                    self.live
                        .insert((booking.requester_id, booking.slot_id), booking.id);
                }
                rs.insert_booking(booking.clone());
            }
            Event::BookingTransitioned {
                id,
                status,
                version,
                at,
                ..
            } => {
                let Some(booking) = rs.find_booking_mut(id) else {
                    return;
                };
                let was_live = booking.status.is_live();
                booking.status = *status;
                booking.version = *version;
                booking.updated_at = *at;
                let requester_id = booking.requester_id;
                if was_live && !status.is_live() {
                    self.release_live(requester_id, rs.id, *id);
                    // Completion keeps its unit: the appointment consumed it.
                    if *status == BookingStatus::Cancelled {
                        rs.booked_count = rs.booked_count.saturating_sub(1);
                        rs.version += 1;
                    }
                }
            }
            Event::ReminderSent { id, at, .. } => {
                if let Some(booking) = rs.find_booking_mut(id) {
                    booking.reminded_at = Some(*at);
                }
            }
            Event::BookingArchived { id, at, .. } => {
                if let Some(booking) = rs.find_booking_mut(id) {
                    booking.archived_at = Some(*at);
                }
            }
            Event::BookingPurged { id, .. } => {
                if let Some(booking) = rs.find_booking(id)
                    && booking.status.is_terminal()
                {
                    // Purged Completed rows take their unit with them so the
                    // count keeps matching the rows on the slot.
                    if booking.status == BookingStatus::Completed {
                        rs.booked_count = rs.booked_count.saturating_sub(1);
                        rs.version += 1;
                    }
                    rs.remove_booking(id);
                    self.booking_slot.remove(id);
                }
            }
            _ => {}
        }
    }

    fn drop_slot(&self, slot_id: &Ulid) {
        if self.slots.remove(slot_id).is_none() {
            return;
        }
        // Index sweep instead of locking the slot: deletes are rare and the
        // caller may already hold the slot's write lock.
        self.booking_slot.retain(|_, s| *s != *slot_id);
        self.live.retain(|key, _| key.1 != *slot_id);
    }
}
