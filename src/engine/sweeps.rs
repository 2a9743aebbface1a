use std::time::Instant;

use tracing::{Instrument, debug, info, warn};
use ulid::Ulid;

use crate::context::RequestContext;
use crate::model::*;
use crate::notify::NoticeKind;
use crate::observability::{SWEEP_CHANGED_TOTAL, SWEEP_DURATION_SECONDS, SWEEP_FAILURES_TOTAL};

use super::capacity::build_notice;
use super::{Engine, EngineError};

/// Outcome counts for one pass of a sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub changed: usize,
    /// Records that moved on between scan and commit.
    pub skipped: usize,
    pub failed: usize,
}

impl SweepReport {
    fn record(&mut self, sweep: &'static str, id: Ulid, outcome: Result<bool, EngineError>) {
        match outcome {
            Ok(true) => self.changed += 1,
            Ok(false)
            | Err(EngineError::InvalidStateTransition { .. })
            | Err(EngineError::NotFound(_)) => self.skipped += 1,
            Err(e) => {
                self.failed += 1;
                warn!(sweep, booking_id = %id, "sweep failed on record: {e}");
            }
        }
    }

    fn finish(self, sweep: &'static str, started: Instant) -> Self {
        metrics::histogram!(SWEEP_DURATION_SECONDS, "sweep" => sweep).record(started.elapsed().as_secs_f64());
        metrics::counter!(SWEEP_CHANGED_TOTAL, "sweep" => sweep).increment(self.changed as u64);
        metrics::counter!(SWEEP_FAILURES_TOTAL, "sweep" => sweep).increment(self.failed as u64);
        if self.changed > 0 || self.failed > 0 {
            info!(sweep, scanned = self.scanned, changed = self.changed, skipped = self.skipped, failed = self.failed, "sweep finished");
        } else {
            debug!(sweep, scanned = self.scanned, "sweep finished, nothing to do");
        }
        self
    }
}

impl Engine {
    /// Scan every slot, collecting bookings that match `pick`.
    async fn scan_bookings<T>(&self, mut pick: impl FnMut(&SlotState, &Booking) -> Option<T>) -> Vec<T> {
        let mut out = Vec::new();
        for rs in self.store.all_slots() {
            let guard = rs.read().await;
            if guard.retired {
                continue;
            }
            out.extend(guard.bookings.iter().filter_map(|b| pick(&guard, b)));
        }
        out
    }

    /// Pending bookings whose slot has already ended.
    pub async fn collect_timed_out(&self, now: Ms) -> Vec<Ulid> {
        self.scan_bookings(|rs, b| {
            (b.status == BookingStatus::Pending && rs.span.has_ended(now)).then_some(b.id)
        })
        .await
    }

    /// Cancel Pending bookings whose slot ended without the merchant confirming.
    pub async fn sweep_timeouts(&self, now: Ms) -> SweepReport {
        let ctx = RequestContext::system("timeout");
        let span = ctx.span("sweep_timeouts");
        async {
            let started = Instant::now();
            let ids = self.collect_timed_out(now).await;
            let mut report = SweepReport {
                scanned: ids.len(),
                ..Default::default()
            };
            for id in ids {
                let outcome = self
                    .transition_at(&ctx, id, BookingStatus::Cancelled, Some(BookingStatus::Pending), now)
                    .await
                    .map(|_| true);
                report.record("timeout", id, outcome);
            }
            report.finish("timeout", started)
        }
        .instrument(span)
        .await
    }

    /// Confirmed, not yet reminded, starting within `lookahead` of `now`.
    pub async fn collect_due_reminders(&self, now: Ms, lookahead: Ms) -> Vec<Ulid> {
        self.scan_bookings(|rs, b| {
            let due = b.status == BookingStatus::Confirmed
                && b.reminded_at.is_none()
                && rs.span.start > now
                && rs.span.start <= now + lookahead;
            due.then_some(b.id)
        })
        .await
    }

    /// Mark and announce upcoming appointments. Each booking is reminded once:
    /// the mark is durable before the notice goes out.
    pub async fn sweep_reminders(&self, now: Ms, lookahead: Ms) -> SweepReport {
        let ctx = RequestContext::system("reminder");
        async {
            let started = Instant::now();
            let ids = self.collect_due_reminders(now, lookahead).await;
            let mut report = SweepReport {
                scanned: ids.len(),
                ..Default::default()
            };
            for id in ids {
                let outcome = match self.mark_reminded(id, now).await {
                    Ok(Some(view)) => {
                        self.notify.emit(&build_notice(
                            NoticeKind::Reminder,
                            &view.booking,
                            &view.task,
                            &view.slot.span,
                            now,
                        ));
                        Ok(true)
                    }
                    Ok(None) => Ok(false),
                    Err(e) => Err(e),
                };
                report.record("reminder", id, outcome);
            }
            report.finish("reminder", started)
        }
        .instrument(ctx.span("sweep_reminders"))
        .await
    }

    /// Confirmed bookings whose slot ended at least `grace` ago.
    pub async fn collect_completable(&self, now: Ms, grace: Ms) -> Vec<Ulid> {
        self.scan_bookings(|rs, b| {
            (b.status == BookingStatus::Confirmed && rs.span.end + grace <= now).then_some(b.id)
        })
        .await
    }

    pub async fn sweep_completions(&self, now: Ms, grace: Ms) -> SweepReport {
        let ctx = RequestContext::system("auto_complete");
        async {
            let started = Instant::now();
            let ids = self.collect_completable(now, grace).await;
            let mut report = SweepReport {
                scanned: ids.len(),
                ..Default::default()
            };
            for id in ids {
                let outcome = self
                    .transition_at(&ctx, id, BookingStatus::Completed, Some(BookingStatus::Confirmed), now)
                    .await
                    .map(|_| true);
                report.record("auto_complete", id, outcome);
            }
            report.finish("auto_complete", started)
        }
        .instrument(ctx.span("sweep_completions"))
        .await
    }

    /// Terminal bookings last touched more than `retention` ago and not yet
    /// archived, oldest first.
    pub async fn collect_expired_records(&self, now: Ms, retention: Ms) -> Vec<Booking> {
        let cutoff = now.saturating_sub(retention);
        let mut out = self
            .scan_bookings(|_, b| {
                let due = b.status.is_terminal() && b.archived_at.is_none() && b.updated_at < cutoff;
                due.then(|| b.clone())
            })
            .await;
        out.sort_by_key(|b| b.id);
        out
    }

    /// Archived bookings past retention, ready to be purged.
    pub async fn collect_purgeable(&self, now: Ms, retention: Ms) -> Vec<Ulid> {
        let cutoff = now.saturating_sub(retention);
        let mut out = self
            .scan_bookings(|_, b| {
                let due = b.status.is_terminal() && b.archived_at.is_some() && b.updated_at < cutoff;
                due.then_some(b.id)
            })
            .await;
        out.sort();
        out
    }

    /// Record that these bookings reached the archive, so later retention
    /// passes leave them alone.
    pub async fn mark_archived(&self, ids: &[Ulid], now: Ms) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport {
            scanned: ids.len(),
            ..Default::default()
        };
        for &id in ids {
            let outcome = self.mark_archived_one(id, now).await;
            report.record("archive", id, outcome);
        }
        report.finish("archive", started)
    }

    async fn mark_archived_one(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let slot_id = self.store.slot_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.store.slot(&slot_id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(id));
        }
        match guard.find_booking(&id) {
            None => return Err(EngineError::NotFound(id)),
            Some(b) if b.archived_at.is_some() => return Ok(false),
            Some(_) => {}
        }
        let event = Event::BookingArchived { id, slot_id, at: now };
        self.persist_to_slot(&mut guard, &event).await?;
        Ok(true)
    }

    /// Remove terminal bookings from the store. Live ones are skipped.
    pub async fn purge_bookings(&self, ids: &[Ulid]) -> SweepReport {
        let started = Instant::now();
        let mut report = SweepReport {
            scanned: ids.len(),
            ..Default::default()
        };
        for &id in ids {
            let outcome = self.purge_booking(id).await;
            report.record("retention", id, outcome);
        }
        report.finish("retention", started)
    }

    async fn purge_booking(&self, id: Ulid) -> Result<bool, EngineError> {
        let slot_id = self.store.slot_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let rs = self.store.slot(&slot_id).ok_or(EngineError::NotFound(id))?;
        let mut guard = rs.write().await;
        if guard.retired {
            return Err(EngineError::NotFound(id));
        }
        match guard.find_booking(&id) {
            None => return Err(EngineError::NotFound(id)),
            Some(b) if !b.status.is_terminal() => return Ok(false),
            Some(_) => {}
        }
        self.persist_to_slot(&mut guard, &Event::BookingPurged { id, slot_id })
            .await?;
        Ok(true)
    }

    /// Aggregate the slots starting on the UTC day that begins at `day_start`.
    pub async fn daily_summary(&self, day_start: Ms) -> DailySummary {
        let day = Span::new(day_start, day_start + DAY_MS);
        let mut summary = DailySummary {
            day_start,
            ..Default::default()
        };
        for rs in self.store.all_slots() {
            let guard = rs.read().await;
            if guard.retired || !day.contains_instant(guard.span.start) {
                continue;
            }
            summary.capacity += u64::from(guard.capacity);
            summary.booked += u64::from(guard.booked_count);
            for b in &guard.bookings {
                summary.total += 1;
                match b.status {
                    BookingStatus::Pending => summary.pending += 1,
                    BookingStatus::Confirmed => summary.confirmed += 1,
                    BookingStatus::Cancelled => summary.cancelled += 1,
                    BookingStatus::Completed => summary.completed += 1,
                }
            }
        }
        summary
    }
}
