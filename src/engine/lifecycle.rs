use tracing::{debug, info};
use ulid::Ulid;

use crate::context::{RequestContext, Role};
use crate::model::*;
use crate::notify::NoticeKind;
use crate::observability::{OCC_RETRIES_TOTAL, REJECTIONS_TOTAL, TRANSITIONS_TOTAL};

use super::capacity::build_notice;
use super::conflict::{check_cancel_deadline, now_ms};
use super::{Commit, Engine, EngineError, SharedSlotState};

/// A booking together with the slot and task it hangs off, as read at one moment.
#[derive(Debug, Clone)]
pub struct BookingView {
    pub booking: Booking,
    pub slot: SlotSnapshot,
    pub task: TaskState,
}

fn authorize(ctx: &RequestContext, view: &BookingView, to: BookingStatus) -> Result<(), EngineError> {
    match ctx.actor.role {
        Role::System => Ok(()),
        Role::Merchant if ctx.actor.id == view.task.merchant_id => Ok(()),
        Role::Merchant => Err(EngineError::Forbidden("not the owning merchant")),
        Role::User if to != BookingStatus::Cancelled => {
            Err(EngineError::Forbidden("users may only cancel"))
        }
        Role::User if ctx.actor.id != view.booking.requester_id => {
            Err(EngineError::Forbidden("not the requester"))
        }
        Role::User => Ok(()),
    }
}

fn check_timing(ctx: &RequestContext, view: &BookingView, to: BookingStatus, now: Ms) -> Result<(), EngineError> {
    match to {
        BookingStatus::Cancelled if ctx.actor.role == Role::User => {
            check_cancel_deadline(&view.task, &view.slot.span, now)
        }
        BookingStatus::Completed if !view.slot.span.has_ended(now) => {
            Err(EngineError::SlotNotEnded(view.slot.slot_id))
        }
        _ => Ok(()),
    }
}

impl Engine {
    pub(super) async fn booking_view(&self, booking_id: Ulid) -> Result<(SharedSlotState, BookingView), EngineError> {
        let slot_id = self
            .store
            .slot_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let rs = self.store.slot(&slot_id).ok_or(EngineError::NotFound(booking_id))?;
        let (booking, slot) = {
            let guard = rs.read().await;
            if guard.retired {
                return Err(EngineError::NotFound(booking_id));
            }
            let booking = guard
                .find_booking(&booking_id)
                .cloned()
                .ok_or(EngineError::NotFound(booking_id))?;
            (booking, guard.snapshot())
        };
        let task = self
            .store
            .task(&slot.task_id)
            .ok_or(EngineError::NotFound(slot.task_id))?;
        Ok((rs, BookingView { booking, slot, task }))
    }

    /// Merchant accepts a pending booking.
    pub async fn confirm(&self, ctx: &RequestContext, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.transition(ctx, booking_id, BookingStatus::Confirmed, None)
            .await
    }

    /// Mark a confirmed booking as served. Only once its slot has ended.
    pub async fn complete(&self, ctx: &RequestContext, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.transition(ctx, booking_id, BookingStatus::Completed, None)
            .await
    }

    pub async fn transition(
        &self,
        ctx: &RequestContext,
        booking_id: Ulid,
        to: BookingStatus,
        expect: Option<BookingStatus>,
    ) -> Result<Booking, EngineError> {
        self.transition_at(ctx, booking_id, to, expect, now_ms())
            .await
    }

    /// Move a booking to `to`. With `expect` set, the booking must still be in
    /// that status when it is read, which lets sweeps act only on the state
    /// they scanned.
    pub async fn transition_at(
        &self,
        ctx: &RequestContext,
        booking_id: Ulid,
        to: BookingStatus,
        expect: Option<BookingStatus>,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let result = self.try_transition(ctx, booking_id, to, expect, now).await;
        match &result {
            Ok(booking) => {
                let origin = ctx.origin.unwrap_or("request");
                metrics::counter!(TRANSITIONS_TOTAL, "to" => to.as_str(), "origin" => origin).increment(1);
                info!(%booking_id, slot_id = %booking.slot_id, to = to.as_str(), origin, "booking transitioned");
            }
            Err(e) => {
                metrics::counter!(REJECTIONS_TOTAL, "op" => to.as_str(), "reason" => e.kind()).increment(1);
                debug!(%booking_id, to = to.as_str(), "transition rejected: {e}");
            }
        }
        result
    }

    async fn try_transition(
        &self,
        ctx: &RequestContext,
        booking_id: Ulid,
        to: BookingStatus,
        expect: Option<BookingStatus>,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        for attempt in 1..=self.settings.attempts() {
            let (rs, view) = self.booking_view(booking_id).await?;
            let from = view.booking.status;

            authorize(ctx, &view, to)?;
            if expect.is_some_and(|expected| expected != from) || !from.can_transition_to(to) {
                return Err(EngineError::InvalidStateTransition { booking_id, from, to });
            }
            check_timing(ctx, &view, to, now)?;

            match self.commit_transition(&rs, &view, to, now).await? {
                Commit::Done(updated) => {
                    if let Some(kind) = NoticeKind::for_status(to) {
                        self.notify
                            .emit(&build_notice(kind, &updated, &view.task, &view.slot.span, now));
                    }
                    return Ok(updated);
                }
                Commit::Stale => {
                    metrics::counter!(OCC_RETRIES_TOTAL, "op" => to.as_str()).increment(1);
                    debug!(%booking_id, attempt, "booking or task moved, retrying");
                    tokio::task::yield_now().await;
                }
            }
        }
        Err(EngineError::Conflict(booking_id))
    }

    /// Conditional write guarded by the booking version the caller read and
    /// the task state its authorization and deadline checks ran against.
    async fn commit_transition(
        &self,
        rs: &SharedSlotState,
        view: &BookingView,
        to: BookingStatus,
        now: Ms,
    ) -> Result<Commit<Booking>, EngineError> {
        let read = &view.booking;
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(read.id));
        }
        if self.store.task(&view.task.id).as_ref() != Some(&view.task) {
            return Ok(Commit::Stale);
        }
        match guard.find_booking(&read.id) {
            None => return Err(EngineError::NotFound(read.id)),
            Some(current) if current.version != read.version => return Ok(Commit::Stale),
            Some(_) => {}
        }

        let event = Event::BookingTransitioned {
            id: read.id,
            slot_id: read.slot_id,
            status: to,
            version: read.version + 1,
            at: now,
        };
        self.persist_to_slot(&mut guard, &event).await?;
        let updated = guard
            .find_booking(&read.id)
            .cloned()
            .ok_or(EngineError::NotFound(read.id))?;
        Ok(Commit::Done(updated))
    }

    /// Record that a reminder went out. Only lands while the booking is still
    /// Confirmed and unreminded; `None` otherwise.
    pub(super) async fn mark_reminded(&self, booking_id: Ulid, now: Ms) -> Result<Option<BookingView>, EngineError> {
        let (rs, mut view) = self.booking_view(booking_id).await?;
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(booking_id));
        }
        match guard.find_booking(&booking_id) {
            Some(b) if b.status == BookingStatus::Confirmed && b.reminded_at.is_none() => {}
            Some(_) => return Ok(None),
            None => return Err(EngineError::NotFound(booking_id)),
        }
        let event = Event::ReminderSent {
            id: booking_id,
            slot_id: view.slot.slot_id,
            at: now,
        };
        self.persist_to_slot(&mut guard, &event).await?;
        view.booking.reminded_at = Some(now);
        Ok(Some(view))
    }
}
