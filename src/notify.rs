use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// A requester reserved one of the merchant's slots.
    NewBooking,
    Confirmed,
    Cancelled,
    Completed,
    /// The appointment starts soon.
    Reminder,
}

impl NoticeKind {
    pub fn for_status(status: BookingStatus) -> Option<Self> {
        match status {
            BookingStatus::Pending => None,
            BookingStatus::Confirmed => Some(NoticeKind::Confirmed),
            BookingStatus::Cancelled => Some(NoticeKind::Cancelled),
            BookingStatus::Completed => Some(NoticeKind::Completed),
        }
    }
}

/// One notification about a booking. Produced after the state change is
/// durable; delivery is fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingNotice {
    pub kind: NoticeKind,
    pub booking_id: Ulid,
    pub slot_id: Ulid,
    pub task_id: Ulid,
    pub merchant_id: Ulid,
    pub requester_id: Ulid,
    pub slot_start: Ms,
    pub at: Ms,
}

/// Outbound notification trigger. Must not block: the engine calls it from
/// the request path once the write is committed.
pub trait NotificationSink: Send + Sync {
    fn emit(&self, notice: &BookingNotice);
}

/// Sink that drops everything.
pub struct Discard;

impl NotificationSink for Discard {
    fn emit(&self, _notice: &BookingNotice) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Merchant(Ulid),
    User(Ulid),
}

/// Routes notices to per-recipient broadcast channels.
///
/// New bookings go to the merchant, cancellations to both parties, and
/// everything else to the requester.
pub struct NotifyHub {
    channels: DashMap<Topic, broadcast::Sender<BookingNotice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a recipient's notices. Creates the channel if needed.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<BookingNotice> {
        let sender = self
            .channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, topic: Topic, notice: &BookingNotice) {
        if let Some(sender) = self.channels.get(&topic) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Drop channels whose receivers are all gone.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, tx| tx.receiver_count() > 0);
        before - self.channels.len()
    }

    pub fn recipients(notice: &BookingNotice) -> &'static [Recipient] {
        match notice.kind {
            NoticeKind::NewBooking => &[Recipient::Merchant],
            NoticeKind::Cancelled => &[Recipient::Merchant, Recipient::User],
            NoticeKind::Confirmed | NoticeKind::Completed | NoticeKind::Reminder => &[Recipient::User],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Merchant,
    User,
}

impl NotificationSink for NotifyHub {
    fn emit(&self, notice: &BookingNotice) {
        for recipient in Self::recipients(notice) {
            let topic = match recipient {
                Recipient::Merchant => Topic::Merchant(notice.merchant_id),
                Recipient::User => Topic::User(notice.requester_id),
            };
            self.send(topic, notice);
        }
        metrics::counter!(crate::observability::NOTICES_TOTAL, "kind" => notice_label(notice.kind))
            .increment(1);
    }
}

fn notice_label(kind: NoticeKind) -> &'static str {
    match kind {
        NoticeKind::NewBooking => "new_booking",
        NoticeKind::Confirmed => "confirmed",
        NoticeKind::Cancelled => "cancelled",
        NoticeKind::Completed => "completed",
        NoticeKind::Reminder => "reminder",
    }
}
