use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Booking, WaitlistEntry};

const CHANNEL_CAPACITY: usize = 256;

/// A waitlist entry whose slot overlaps a freed booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromotionCandidate {
    pub entry: WaitlistEntry,
    /// Same start and end as the freed slot.
    pub exact: bool,
}

/// Real-time booking events, one per affected row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookingEvent {
    Create { data: Booking },
    Update { data: Booking },
    Delete { id: Ulid },
    Waitlist { booking_id: Ulid, candidates: Vec<PromotionCandidate> },
}

impl BookingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            BookingEvent::Create { .. } => "create",
            BookingEvent::Update { .. } => "update",
            BookingEvent::Delete { .. } => "delete",
            BookingEvent::Waitlist { .. } => "waitlist",
        }
    }
}

/// Port the engine pushes lifecycle events through. Delivery is best effort:
/// a failed publish never rolls back the write that caused it.
pub trait BookingNotifier: Send + Sync {
    fn publish(&self, event: BookingEvent);
}

/// Broadcast hub for every connected client. There are no rooms; all
/// subscribers see all booking events.
pub struct NotifyHub {
    sender: broadcast::Sender<BookingEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BookingEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl BookingNotifier for NotifyHub {
    /// No-op if nobody is listening.
    fn publish(&self, event: BookingEvent) {
        let name = event.name();
        if self.sender.send(event).is_err() {
            tracing::trace!("no subscribers for {name} event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        let id = Ulid::new();
        hub.publish(BookingEvent::Delete { id });

        assert_eq!(rx.recv().await.unwrap(), BookingEvent::Delete { id });
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.publish(BookingEvent::Delete { id: Ulid::new() });

        // Late subscribers only see what comes after them.
        let mut rx = hub.subscribe();
        tokio_test::assert_err!(rx.try_recv());
        hub.publish(BookingEvent::Delete { id: Ulid::nil() });
        tokio_test::assert_ok!(rx.try_recv());
    }

    #[test]
    fn events_are_tagged_by_type() {
        let json = serde_json::to_value(BookingEvent::Delete { id: Ulid::nil() }).unwrap();
        assert_eq!(json["type"], "delete");
        assert_eq!(json["id"], Ulid::nil().to_string());
    }
}
