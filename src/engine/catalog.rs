use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{validate_capacity, validate_window};
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_task(
        &self,
        id: Ulid,
        merchant_id: Ulid,
        cancel_deadline_ms: Option<Ms>,
    ) -> Result<(), EngineError> {
        validate_deadline(cancel_deadline_ms)?;
        let _catalog = self.catalog_lock.lock().await;
        if self.store.contains_task(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.store.task_count() >= MAX_TASKS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many tasks"));
        }
        self.persist_catalog(&Event::TaskCreated {
            id,
            merchant_id,
            cancel_deadline_ms,
        })
        .await?;
        info!(task_id = %id, %merchant_id, "task created");
        Ok(())
    }

    /// Activate or deactivate a task. Deactivation stops new reservations;
    /// existing bookings are left alone.
    pub async fn set_task_status(&self, id: Ulid, status: TaskStatus) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let task = self.store.task(&id).ok_or(EngineError::NotFound(id))?;
        if task.status == status {
            return Ok(());
        }
        self.persist_catalog(&Event::TaskStatusChanged { id, status })
            .await
    }

    pub async fn set_cancel_deadline(&self, id: Ulid, cancel_deadline_ms: Option<Ms>) -> Result<(), EngineError> {
        validate_deadline(cancel_deadline_ms)?;
        let _catalog = self.catalog_lock.lock().await;
        if !self.store.contains_task(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_catalog(&Event::TaskDeadlineChanged {
            id,
            cancel_deadline_ms,
        })
        .await
    }

    /// Delete a task and every slot under it. Refused while any of those slots
    /// still carries a Pending or Confirmed booking.
    pub async fn delete_task(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if !self.store.contains_task(&id) {
            return Err(EngineError::NotFound(id));
        }

        // Write-lock every slot in id order so no reservation can slip in
        // between the live-booking check and the delete.
        let mut slot_ids = self.store.slot_ids_for_task(&id);
        slot_ids.sort();
        let mut guards = Vec::with_capacity(slot_ids.len());
        for slot_id in &slot_ids {
            if let Some(rs) = self.store.slot(slot_id) {
                guards.push(rs.write_owned().await);
            }
        }
        if guards.iter().any(|g| g.live_bookings().next().is_some()) {
            return Err(EngineError::HasLiveBookings(id));
        }

        self.persist_catalog(&Event::TaskDeleted { id }).await?;
        for guard in &mut guards {
            guard.retired = true;
        }
        info!(task_id = %id, slots = guards.len(), "task deleted");
        Ok(())
    }

    pub async fn create_slot(
        &self,
        id: Ulid,
        task_id: Ulid,
        start: Ms,
        end: Ms,
        capacity: u32,
    ) -> Result<(), EngineError> {
        let span = validate_window(start, end)?;
        validate_capacity(capacity)?;

        let _catalog = self.catalog_lock.lock().await;
        if !self.store.contains_task(&task_id) {
            return Err(EngineError::NotFound(task_id));
        }
        if self.store.contains_slot(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.store.slot_count_for_task(&task_id) >= MAX_SLOTS_PER_TASK {
            return Err(EngineError::LimitExceeded("too many slots for task"));
        }
        self.persist_catalog(&Event::SlotCreated {
            id,
            task_id,
            span,
            capacity,
        })
        .await
    }
}

fn validate_deadline(cancel_deadline_ms: Option<Ms>) -> Result<(), EngineError> {
    if cancel_deadline_ms.is_some_and(|d| !(0..=MAX_CANCEL_DEADLINE_MS).contains(&d)) {
        return Err(EngineError::LimitExceeded("cancel deadline out of range"));
    }
    Ok(())
}
