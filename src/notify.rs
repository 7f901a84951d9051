use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, Id};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for change notifications per timetable.
pub struct NotifyHub {
    channels: DashMap<Id, broadcast::Sender<Event>>,
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

    /// Subscribe to a timetable's events. Creates the channel if needed.
    pub fn subscribe(&self, time_table_id: Id) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(time_table_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, time_table_id: Id, event: &Event) {
        if let Some(sender) = self.channels.get(&time_table_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        before - self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(7);

        let event = Event::AllocationDeleted {
            id: 3,
            time_table_id: 7,
        };
        hub.send(7, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn other_timetables_are_not_delivered() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(1);
        hub.send(
            2,
            &Event::AllocationDeleted {
                id: 3,
                time_table_id: 2,
            },
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(
            1,
            &Event::AllocationDeleted {
                id: 3,
                time_table_id: 1,
            },
        );
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let rx = hub.subscribe(1);
        let _keep = hub.subscribe(2);
        drop(rx);
        assert_eq!(hub.prune(), 1);
        assert_eq!(hub.prune(), 0);
    }
}
