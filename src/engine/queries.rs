use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Consistency report for one slot, computed under its read lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAudit {
    pub slot_id: Ulid,
    pub capacity: u32,
    pub booked_count: u32,
    /// Pending + Confirmed + Completed rows actually present.
    pub counted: u32,
    pub live: u32,
}

impl SlotAudit {
    pub fn is_consistent(&self) -> bool {
        self.booked_count == self.counted && self.booked_count <= self.capacity
    }
}

impl Engine {
    pub fn task(&self, id: &Ulid) -> Option<TaskState> {
        self.store.task(id)
    }

    pub async fn slot(&self, id: &Ulid) -> Option<SlotInfo> {
        let rs = self.store.slot(id)?;
        let guard = rs.read().await;
        (!guard.retired).then(|| SlotInfo::from(&*guard))
    }

    /// All slots of a task, earliest first.
    pub async fn slots_for_task(&self, task_id: &Ulid) -> Result<Vec<SlotInfo>, EngineError> {
        if !self.store.contains_task(task_id) {
            return Err(EngineError::NotFound(*task_id));
        }
        let mut out = Vec::new();
        for slot_id in self.store.slot_ids_for_task(task_id) {
            if let Some(info) = self.slot(&slot_id).await {
                out.push(info);
            }
        }
        out.sort_by_key(|s| (s.start, s.id));
        Ok(out)
    }

    /// Slots of an active task that still have room and have not started.
    pub async fn available_slots(&self, task_id: &Ulid, now: Ms) -> Result<Vec<SlotInfo>, EngineError> {
        let task = self.store.task(task_id).ok_or(EngineError::NotFound(*task_id))?;
        if !task.is_active() {
            return Ok(Vec::new());
        }
        let mut slots = self.slots_for_task(task_id).await?;
        slots.retain(|s| s.available > 0 && s.start > now);
        Ok(slots)
    }

    pub async fn booking(&self, id: &Ulid) -> Option<Booking> {
        let slot_id = self.store.slot_for_booking(id)?;
        let rs = self.store.slot(&slot_id)?;
        let guard = rs.read().await;
        guard.find_booking(id).cloned()
    }

    pub async fn bookings_for_slot(&self, slot_id: &Ulid) -> Result<Vec<Booking>, EngineError> {
        let rs = self.store.slot(slot_id).ok_or(EngineError::NotFound(*slot_id))?;
        let guard = rs.read().await;
        Ok(guard.bookings.clone())
    }

    /// Every booking across a task's slots, oldest first.
    pub async fn bookings_for_task(&self, task_id: &Ulid) -> Result<Vec<Booking>, EngineError> {
        if !self.store.contains_task(task_id) {
            return Err(EngineError::NotFound(*task_id));
        }
        let mut out = Vec::new();
        for slot_id in self.store.slot_ids_for_task(task_id) {
            if let Some(rs) = self.store.slot(&slot_id) {
                out.extend(rs.read().await.bookings.iter().cloned());
            }
        }
        out.sort_by_key(|b| b.id);
        Ok(out)
    }

    /// A requester's bookings, newest first, optionally narrowed to one status.
    pub async fn bookings_for_requester(&self, requester_id: &Ulid, status: Option<BookingStatus>) -> Vec<Booking> {
        let mut out = Vec::new();
        for rs in self.store.all_slots() {
            let guard = rs.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.requester_id == *requester_id)
                    .filter(|b| status.is_none_or(|s| b.status == s))
                    .cloned(),
            );
        }
        out.sort_by_key(|b| std::cmp::Reverse(b.id));
        out
    }

    /// The requester's Pending or Confirmed booking on a slot, if any.
    pub async fn live_booking_for(&self, requester_id: Ulid, slot_id: Ulid) -> Option<Booking> {
        let id = self.store.live_booking(requester_id, slot_id)?;
        self.booking(&id).await
    }

    pub async fn audit_slot(&self, slot_id: &Ulid) -> Option<SlotAudit> {
        let rs = self.store.slot(slot_id)?;
        let guard = rs.read().await;
        let counted = guard
            .bookings
            .iter()
            .filter(|b| b.status != BookingStatus::Cancelled)
            .count() as u32;
        Some(SlotAudit {
            slot_id: guard.id,
            capacity: guard.capacity,
            booked_count: guard.booked_count,
            counted,
            live: guard.live_bookings().count() as u32,
        })
    }
}
