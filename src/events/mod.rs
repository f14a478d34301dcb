use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Domain events emitted by the services after a successful state change.
///
/// Consumed by the background event processor; a hook point for downstream
/// integrations (notifications, analytics, fulfillment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    CartUpdated { user_id: Uuid, cart_id: Uuid },
    OrderCreated(Uuid),
    OrderCancelled(Uuid),
    OrderPaid(Uuid),
    OrderRefunded(Uuid),
    PaymentIntentCreated { order_id: Uuid, intent_id: String },
    StockReserved { product_id: Uuid, quantity: i32 },
    StockReleased { product_id: Uuid, quantity: i32 },
    WebhookProcessed { event_id: String, event_type: String },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing the request path when the
    /// consumer has gone away.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("Dropping event: {}", e);
        }
    }
}

/// Background consumer draining the event channel.
pub async fn process_events(mut receiver: mpsc::Receiver<Event>) {
    while let Some(event) = receiver.recv().await {
        debug!(?event, "processing event");
    }
    debug!("event channel closed; processor exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_or_log_does_not_fail_when_receiver_dropped() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let sender = EventSender::new(tx);
        sender.send_or_log(Event::OrderCreated(Uuid::new_v4())).await;
    }

    #[tokio::test]
    async fn events_reach_the_consumer() {
        let (tx, mut rx) = mpsc::channel(4);
        let sender = EventSender::new(tx);
        let order_id = Uuid::new_v4();
        sender.send(Event::OrderCreated(order_id)).await.unwrap();

        match rx.recv().await {
            Some(Event::OrderCreated(id)) => assert_eq!(id, order_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
