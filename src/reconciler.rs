use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{Instrument, debug, info, warn};

use crate::config::ReconcilerConfig;
use crate::engine::{Engine, EngineError, SweepReport, now_ms};
use crate::model::{DAY_MS, DailySummary, Ms};
use crate::sinks::{ArchiveSink, SinkError, StatisticsSink};

/// Time-driven maintenance for one tenant's engine.
///
/// Every sweep goes through the same engine operations as request traffic,
/// so racing a live request on the same booking is safe.
pub struct Reconciler {
    tenant: String,
    engine: Arc<Engine>,
    config: ReconcilerConfig,
    archive: Arc<dyn ArchiveSink>,
    stats: Arc<dyn StatisticsSink>,
}

/// Stops the sweep loops of one reconciler.
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ReconcilerHandle {
    /// Signal every loop and wait for it. A sweep in progress finishes its pass first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

impl Reconciler {
    pub fn new(
        tenant: impl Into<String>,
        engine: Arc<Engine>,
        config: ReconcilerConfig,
        archive: Arc<dyn ArchiveSink>,
        stats: Arc<dyn StatisticsSink>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            engine,
            config,
            archive,
            stats,
        }
    }

    pub async fn run_timeouts_once(&self, now: Ms) -> SweepReport {
        self.engine.sweep_timeouts(now).await
    }

    pub async fn run_reminders_once(&self, now: Ms) -> SweepReport {
        self.engine
            .sweep_reminders(now, self.config.reminder_lookahead_ms)
            .await
    }

    pub async fn run_completions_once(&self, now: Ms) -> SweepReport {
        self.engine
            .sweep_completions(now, self.config.completion_grace_ms)
            .await
    }

    /// Hand expired terminal bookings to the archive and mark them archived.
    /// Archived rows are purged only when purging is enabled; a failed
    /// archive leaves its rows unmarked for the next pass.
    pub async fn run_retention_once(&self, now: Ms) -> SweepReport {
        let retention = self.config.retention_ms;
        let expired = self.engine.collect_expired_records(now, retention).await;
        let mut report = SweepReport::default();
        if !expired.is_empty() {
            if let Err(e) = self.archive.archive(&expired).await {
                warn!(tenant = %self.tenant, records = expired.len(), "archiving failed, nothing purged: {e}");
                metrics::counter!(crate::observability::SWEEP_FAILURES_TOTAL, "sweep" => "retention")
                    .increment(expired.len() as u64);
                return SweepReport {
                    scanned: expired.len(),
                    failed: expired.len(),
                    ..Default::default()
                };
            }
            let ids: Vec<_> = expired.iter().map(|b| b.id).collect();
            report = self.engine.mark_archived(&ids, now).await;
            info!(tenant = %self.tenant, records = report.changed, "archived expired bookings");
        }
        if !self.config.purge_archived {
            return report;
        }
        let purgeable = self.engine.collect_purgeable(now, retention).await;
        if purgeable.is_empty() {
            return report;
        }
        self.engine.purge_bookings(&purgeable).await
    }

    /// Summarize the UTC day before `now` and append it to the statistics sink.
    pub async fn run_statistics_once(&self, now: Ms) -> Result<DailySummary, SinkError> {
        let day_start = (now.div_euclid(DAY_MS) - 1) * DAY_MS;
        let summary = self.engine.daily_summary(day_start).await;
        self.stats.append_daily(&summary).await?;
        debug!(tenant = %self.tenant, day_start, total = summary.total, "daily summary written");
        Ok(summary)
    }

    /// Compact once enough appends have piled up. Returns whether it ran.
    pub async fn run_compaction_once(&self) -> Result<bool, EngineError> {
        let appends = self.engine.wal_appends_since_compact().await;
        if appends < self.config.compact_threshold {
            return Ok(false);
        }
        self.engine.compact_wal().await?;
        info!(tenant = %self.tenant, appends, "WAL compacted");
        Ok(true)
    }

    /// Start every sweep on its own interval.
    pub fn spawn(self: Arc<Self>) -> ReconcilerHandle {
        let (shutdown, rx) = watch::channel(false);
        let c = self.config.clone();
        let span = tracing::info_span!("reconciler", tenant = %self.tenant);

        let mut tasks = Vec::new();
        let mut start = |name: &'static str, period: Duration, immediate: bool, sweep: Sweep| {
            let this = self.clone();
            let rx = rx.clone();
            tasks.push(tokio::spawn(
                run_every(name, period, immediate, rx, move || {
                    let this = this.clone();
                    async move { this.run_sweep(sweep).await }
                })
                .instrument(span.clone()),
            ));
        };
        start("timeout", c.timeout_every, true, Sweep::Timeouts);
        start("reminder", c.reminder_every, true, Sweep::Reminders);
        start("auto_complete", c.complete_every, true, Sweep::Completions);
        start("retention", c.retention_every, false, Sweep::Retention);
        start("statistics", c.stats_every, false, Sweep::Statistics);
        start("compaction", c.compact_every, false, Sweep::Compaction);

        ReconcilerHandle { shutdown, tasks }
    }

    async fn run_sweep(&self, sweep: Sweep) {
        let now = now_ms();
        match sweep {
            Sweep::Timeouts => {
                self.run_timeouts_once(now).await;
            }
            Sweep::Reminders => {
                self.run_reminders_once(now).await;
            }
            Sweep::Completions => {
                self.run_completions_once(now).await;
            }
            Sweep::Retention => {
                self.run_retention_once(now).await;
            }
            Sweep::Statistics => {
                if let Err(e) = self.run_statistics_once(now).await {
                    warn!(tenant = %self.tenant, "statistics sweep failed: {e}");
                }
            }
            Sweep::Compaction => {
                if let Err(e) = self.run_compaction_once().await {
                    warn!(tenant = %self.tenant, "compaction failed: {e}");
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Sweep {
    Timeouts,
    Reminders,
    Completions,
    Retention,
    Statistics,
    Compaction,
}

async fn run_every<F, Fut>(
    name: &'static str,
    period: Duration,
    immediate: bool,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let first = if immediate { Instant::now() } else { Instant::now() + period };
    let mut interval = tokio::time::interval_at(first, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => tick().await,
            _ = shutdown.changed() => break,
        }
    }
    debug!(sweep = name, "sweep loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Actor, RequestContext};
    use crate::engine::EngineSettings;
    use crate::model::{BookingStatus, HOUR_MS};
    use crate::notify::Discard;
    use crate::sinks::{JsonlSink, NullSink};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use ulid::Ulid;

    const DAY: Ms = 20_000 * DAY_MS;

    fn test_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotkeeper_test_reconciler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    struct FailingArchive;

    #[async_trait]
    impl ArchiveSink for FailingArchive {
        async fn archive(&self, _bookings: &[crate::model::Booking]) -> Result<(), SinkError> {
            Err(SinkError::Io(std::io::Error::other("archive offline")))
        }
    }

    async fn engine_with_history(name: &str) -> (Arc<Engine>, Ulid, Ulid) {
        let engine = Arc::new(
            Engine::new(test_path(name), Arc::new(Discard), EngineSettings::default()).unwrap(),
        );
        let merchant = Ulid::new();
        let task = Ulid::new();
        let slot = Ulid::new();
        engine.create_task(task, merchant, None).await.unwrap();
        engine
            .create_slot(slot, task, DAY + 9 * HOUR_MS, DAY + 10 * HOUR_MS, 4)
            .await
            .unwrap();
        let user = Ulid::new();
        let booking = engine
            .reserve(&RequestContext::new(Actor::user(user)), slot, user, None)
            .await
            .unwrap();
        engine
            .transition_at(
                &RequestContext::new(Actor::merchant(merchant)),
                booking.id,
                BookingStatus::Cancelled,
                None,
                DAY,
            )
            .await
            .unwrap();
        (engine, slot, booking.id)
    }

    fn config(purge: bool) -> ReconcilerConfig {
        ReconcilerConfig {
            purge_archived: purge,
            compact_threshold: 3,
            ..ReconcilerConfig::default()
        }
    }

    #[tokio::test]
    async fn retention_archives_then_purges() {
        let (engine, _, booking_id) = engine_with_history("retention_purge.wal").await;
        let archive = Arc::new(JsonlSink::new(test_path("retention_purge.jsonl")));
        let rec = Reconciler::new("t", engine.clone(), config(true), archive.clone(), Arc::new(NullSink));

        let now = DAY + 91 * DAY_MS;
        let report = rec.run_retention_once(now).await;
        assert_eq!(report.changed, 1);
        assert!(engine.booking(&booking_id).await.is_none());

        let text = tokio::fs::read_to_string(archive.path()).await.unwrap();
        assert!(text.contains(&booking_id.to_string()));
        assert_eq!(rec.run_retention_once(now).await, SweepReport::default());
    }

    #[tokio::test]
    async fn retention_without_purge_keeps_records() {
        let (engine, _, booking_id) = engine_with_history("retention_keep.wal").await;
        let rec = Reconciler::new("t", engine.clone(), config(false), Arc::new(NullSink), Arc::new(NullSink));

        let now = DAY + 91 * DAY_MS;
        let report = rec.run_retention_once(now).await;
        assert_eq!((report.scanned, report.changed), (1, 1));
        let kept = engine.booking(&booking_id).await.unwrap();
        assert_eq!(kept.archived_at, Some(now));
    }

    #[tokio::test]
    async fn archived_records_are_not_archived_again() {
        let (engine, _, booking_id) = engine_with_history("retention_once.wal").await;
        let path = test_path("retention_once.jsonl");
        let archive = Arc::new(JsonlSink::new(path.clone()));
        let rec = Reconciler::new("t", engine.clone(), config(false), archive, Arc::new(NullSink));

        for day in 91..94 {
            rec.run_retention_once(DAY + day * DAY_MS).await;
        }
        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(text.lines().count(), 1);

        // The mark is durable.
        drop(rec);
        drop(engine);
        let wal = std::env::temp_dir()
            .join("slotkeeper_test_reconciler")
            .join("retention_once.wal");
        let reopened = Engine::new(wal, Arc::new(Discard), EngineSettings::default()).unwrap();
        assert!(reopened.booking(&booking_id).await.unwrap().archived_at.is_some());
        assert!(reopened.collect_expired_records(DAY + 95 * DAY_MS, 90 * DAY_MS).await.is_empty());
    }

    #[tokio::test]
    async fn enabling_purge_later_removes_archived_records() {
        let (engine, _, booking_id) = engine_with_history("retention_late_purge.wal").await;
        let now = DAY + 91 * DAY_MS;
        let keep = Reconciler::new("t", engine.clone(), config(false), Arc::new(NullSink), Arc::new(NullSink));
        keep.run_retention_once(now).await;
        assert!(engine.booking(&booking_id).await.is_some());

        let purge = Reconciler::new("t", engine.clone(), config(true), Arc::new(FailingArchive), Arc::new(NullSink));
        let report = purge.run_retention_once(now + DAY_MS).await;
        assert_eq!((report.changed, report.failed), (1, 0));
        assert!(engine.booking(&booking_id).await.is_none());
    }

    #[tokio::test]
    async fn failed_archive_blocks_purge() {
        let (engine, _, booking_id) = engine_with_history("retention_fail.wal").await;
        let rec = Reconciler::new("t", engine.clone(), config(true), Arc::new(FailingArchive), Arc::new(NullSink));

        let report = rec.run_retention_once(DAY + 91 * DAY_MS).await;
        assert_eq!(report.failed, 1);
        assert!(engine.booking(&booking_id).await.is_some());
    }

    #[tokio::test]
    async fn statistics_cover_previous_day() {
        let (engine, _, _) = engine_with_history("statistics.wal").await;
        let stats = Arc::new(JsonlSink::new(test_path("statistics.jsonl")));
        let rec = Reconciler::new("t", engine, config(false), Arc::new(NullSink), stats.clone());

        let summary = rec.run_statistics_once(DAY + DAY_MS + HOUR_MS).await.unwrap();
        assert_eq!(summary.day_start, DAY);
        assert_eq!(summary.total, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.capacity, 4);

        let text = tokio::fs::read_to_string(stats.path()).await.unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    #[tokio::test]
    async fn compaction_waits_for_threshold() {
        let (engine, slot, _) = engine_with_history("compaction.wal").await;
        let rec = Reconciler::new("t", engine.clone(), config(false), Arc::new(NullSink), Arc::new(NullSink));

        // task + slot + reserve + cancel
        assert!(rec.run_compaction_once().await.unwrap());
        assert!(!rec.run_compaction_once().await.unwrap());
        assert_eq!(engine.slot(&slot).await.unwrap().booked_count, 0);
    }

    #[tokio::test]
    async fn spawned_loops_run_and_stop() {
        let (engine, _, _) = engine_with_history("spawned.wal").await;
        let cfg = ReconcilerConfig {
            timeout_every: Duration::from_millis(10),
            reminder_every: Duration::from_millis(10),
            complete_every: Duration::from_millis(10),
            retention_every: Duration::from_millis(10),
            stats_every: Duration::from_millis(10),
            compact_every: Duration::from_millis(10),
            // Keep retention from appending while compaction is measured.
            retention_ms: 100_000 * DAY_MS,
            ..config(false)
        };
        let rec = Arc::new(Reconciler::new("t", engine.clone(), cfg, Arc::new(NullSink), Arc::new(NullSink)));
        let handle = rec.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .expect("reconciler should stop promptly");
        // Compaction ran: the threshold of 3 was already met.
        assert_eq!(engine.wal_appends_since_compact().await, 0);
    }
}
