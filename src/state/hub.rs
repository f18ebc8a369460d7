use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::dto::sse::ServerEvent;

/// Per-battle broadcast topics. No history is retained: a subscriber only sees
/// events published after it subscribed.
pub struct BroadcastHub {
    topics: DashMap<Uuid, broadcast::Sender<ServerEvent>>,
    capacity: usize,
}

impl BroadcastHub {
    /// Create a hub whose topics buffer up to `capacity` events per slow receiver.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Register a new subscriber on the topic of `battle_id`, creating it if needed.
    pub fn subscribe(&self, battle_id: Uuid) -> broadcast::Receiver<ServerEvent> {
        self.topics
            .entry(battle_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Send an event to every current subscriber of `battle_id`, returning how many received it.
    pub fn publish(&self, battle_id: Uuid, event: ServerEvent) -> usize {
        let Some(sender) = self.topics.get(&battle_id).map(|entry| entry.clone()) else {
            return 0;
        };
        sender.send(event).unwrap_or(0)
    }

    /// Number of live subscribers on the topic of `battle_id`.
    pub fn subscriber_count(&self, battle_id: Uuid) -> usize {
        self.topics
            .get(&battle_id)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Drop the topic of `battle_id` when nobody listens anymore.
    pub fn prune(&self, battle_id: Uuid) -> bool {
        let removed = self
            .topics
            .remove_if(&battle_id, |_, sender| sender.receiver_count() == 0)
            .is_some();
        if removed {
            debug!(%battle_id, "pruned empty broadcast topic");
        }
        removed
    }

    /// Drop the topic of `battle_id` unconditionally; receivers observe a closed channel.
    pub fn close(&self, battle_id: Uuid) {
        self.topics.remove(&battle_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(name: &str) -> ServerEvent {
        ServerEvent::new(name, "{}".to_string())
    }

    #[tokio::test]
    async fn events_only_reach_their_topic() {
        let hub = BroadcastHub::new(8);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut rx_a = hub.subscribe(a);
        let mut rx_b = hub.subscribe(b);

        assert_eq!(hub.publish(a, event("battle.started")), 1);

        assert_eq!(rx_a.recv().await.unwrap().event, "battle.started");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_subscribers_get_no_history() {
        let hub = BroadcastHub::new(8);
        let battle = Uuid::new_v4();
        let _early = hub.subscribe(battle);
        hub.publish(battle, event("battle.started"));

        let mut late = hub.subscribe(battle);
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn publish_without_topic_is_dropped() {
        let hub = BroadcastHub::new(8);
        assert_eq!(hub.publish(Uuid::new_v4(), event("battle.state")), 0);
    }

    #[test]
    fn prune_keeps_topics_with_listeners() {
        let hub = BroadcastHub::new(8);
        let battle = Uuid::new_v4();
        let rx = hub.subscribe(battle);
        assert!(!hub.prune(battle));
        assert_eq!(hub.subscriber_count(battle), 1);
        drop(rx);
        assert!(hub.prune(battle));
        assert_eq!(hub.subscriber_count(battle), 0);
    }
}
