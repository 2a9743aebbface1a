use std::time::Instant;

use tracing::{debug, info};
use ulid::Ulid;

use crate::context::{RequestContext, Role};
use crate::limits::MAX_BOOKINGS_PER_SLOT;
use crate::model::*;
use crate::notify::{BookingNotice, NoticeKind};
use crate::observability::{OCC_RETRIES_TOTAL, REJECTIONS_TOTAL, RESERVATIONS_TOTAL, RESERVE_DURATION_SECONDS};

use super::conflict::{check_capacity, now_ms, validate_remark};
use super::{Commit, Engine, EngineError, SharedSlotState};

pub(super) fn build_notice(kind: NoticeKind, booking: &Booking, task: &TaskState, span: &Span, at: Ms) -> BookingNotice {
    BookingNotice {
        kind,
        booking_id: booking.id,
        slot_id: booking.slot_id,
        task_id: task.id,
        merchant_id: task.merchant_id,
        requester_id: booking.requester_id,
        slot_start: span.start,
        at,
    }
}

fn authorize_reserve(ctx: &RequestContext, task: &TaskState, requester_id: Ulid) -> Result<(), EngineError> {
    match ctx.actor.role {
        Role::System => Ok(()),
        Role::User if ctx.actor.id == requester_id => Ok(()),
        Role::User => Err(EngineError::Forbidden("users may only book for themselves")),
        Role::Merchant if ctx.actor.id == task.merchant_id => Ok(()),
        Role::Merchant => Err(EngineError::Forbidden("not the owning merchant")),
    }
}

impl Engine {
    /// Reserve one unit of a slot for `requester_id`.
    ///
    /// Read-check-conditional-write. The snapshot check rejects early without
    /// the write lock. Under the lock the capacity check is repeated against
    /// the live slot whenever its version moved, so concurrent winners never
    /// cost a requester the seat that is still free. The attempt restarts only
    /// when the task it was authorized against changed in between.
    pub async fn reserve(
        &self,
        ctx: &RequestContext,
        slot_id: Ulid,
        requester_id: Ulid,
        remark: Option<String>,
    ) -> Result<Booking, EngineError> {
        self.reserve_at(ctx, Ulid::new(), slot_id, requester_id, remark, now_ms())
            .await
    }

    pub async fn reserve_at(
        &self,
        ctx: &RequestContext,
        booking_id: Ulid,
        slot_id: Ulid,
        requester_id: Ulid,
        remark: Option<String>,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let started = Instant::now();
        let result = self
            .try_reserve(ctx, booking_id, slot_id, requester_id, remark, now)
            .await;
        metrics::histogram!(RESERVE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match &result {
            Ok(booking) => {
                metrics::counter!(RESERVATIONS_TOTAL).increment(1);
                info!(booking_id = %booking.id, %slot_id, %requester_id, "booking reserved");
            }
            Err(e) => {
                metrics::counter!(REJECTIONS_TOTAL, "op" => "reserve", "reason" => e.kind()).increment(1);
                debug!(%slot_id, %requester_id, "reserve rejected: {e}");
            }
        }
        result
    }

    async fn try_reserve(
        &self,
        ctx: &RequestContext,
        booking_id: Ulid,
        slot_id: Ulid,
        requester_id: Ulid,
        remark: Option<String>,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        validate_remark(remark.as_deref())?;
        if self.store.slot_for_booking(&booking_id).is_some() {
            return Err(EngineError::AlreadyExists(booking_id));
        }

        let attempts = self.settings.attempts();
        for attempt in 1..=attempts {
            let rs = self.store.slot(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
            let snapshot = {
                let guard = rs.read().await;
                if guard.retired {
                    return Err(EngineError::NotFound(slot_id));
                }
                guard.snapshot()
            };

            let task = self
                .store
                .task(&snapshot.task_id)
                .ok_or(EngineError::NotFound(snapshot.task_id))?;
            if !task.is_active() {
                return Err(EngineError::TaskInactive(task.id));
            }
            authorize_reserve(ctx, &task, requester_id)?;
            check_capacity(&snapshot)?;
            if let Some(existing) = self.store.live_booking(requester_id, slot_id) {
                return Err(EngineError::DuplicateBooking {
                    requester_id,
                    slot_id,
                    existing,
                });
            }

            let booking = Booking::pending(booking_id, slot_id, requester_id, remark.clone(), now);
            match self.commit_reservation(&rs, &snapshot, &task, booking).await? {
                Commit::Done(booking) => {
                    self.notify.emit(&build_notice(
                        NoticeKind::NewBooking,
                        &booking,
                        &task,
                        &snapshot.span,
                        now,
                    ));
                    return Ok(booking);
                }
                Commit::Stale => {
                    metrics::counter!(OCC_RETRIES_TOTAL, "op" => "reserve").increment(1);
                    debug!(%slot_id, attempt, "task changed under the attempt, retrying");
                    tokio::task::yield_now().await;
                }
            }
        }
        Err(EngineError::Conflict(slot_id))
    }

    /// Conditional write. Slot state is re-decided under the write lock; the
    /// task state the caller was authorized against must still be current.
    async fn commit_reservation(
        &self,
        rs: &SharedSlotState,
        snapshot: &SlotSnapshot,
        task: &TaskState,
        booking: Booking,
    ) -> Result<Commit<Booking>, EngineError> {
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(snapshot.slot_id));
        }
        if self.store.task(&guard.task_id).as_ref() != Some(task) {
            return Ok(Commit::Stale);
        }
        if guard.version != snapshot.version {
            check_capacity(&guard.snapshot())?;
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
            return Err(EngineError::LimitExceeded("too many bookings on slot"));
        }

        self.store
            .claim_live(booking.requester_id, booking.slot_id, booking.id)
            .map_err(|existing| EngineError::DuplicateBooking {
                requester_id: booking.requester_id,
                slot_id: booking.slot_id,
                existing,
            })?;

        let event = Event::BookingReserved {
            booking: booking.clone(),
        };
        if let Err(e) = self.persist_to_slot(&mut guard, &event).await {
            self.store
                .release_live(booking.requester_id, booking.slot_id, booking.id);
            return Err(e);
        }
        Ok(Commit::Done(booking))
    }

    /// Cancel a live booking and give its unit back to the slot.
    pub async fn cancel(&self, ctx: &RequestContext, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.transition(ctx, booking_id, BookingStatus::Cancelled, None)
            .await
    }
}
