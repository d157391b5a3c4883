//! Shared plumbing for watch subscriptions.
//!
//! Both backends instantiate the same per-subscription pattern: a
//! background task reads raw change records from the store, normalizes
//! them, and delivers them to a bounded channel while staying responsive
//! to cancellation. The task owns channel closure on every exit path, so
//! the subscriber-facing stream closes exactly once.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::discoverer::Events;
use crate::event::Event;

/// Capacity of the per-subscription event buffer.
///
/// When the buffer is full, delivery blocks the backend read loop rather
/// than dropping events: worst-case delay is traded for no event loss.
pub(crate) const EVENT_BUFFER: usize = 1024;

/// Create the producer/consumer pair for one subscription.
pub(crate) fn subscription() -> (mpsc::Sender<Event>, Events) {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    (tx, Events::new(rx))
}

/// Deliver one event, keeping the producer cancellable while blocked on a
/// full buffer.
///
/// Returns `false` once the subscription is cancelled or the consumer is
/// gone; the caller must then wind the watch down.
pub(crate) async fn deliver(
    tx: &mpsc::Sender<Event>,
    cancel: &CancellationToken,
    event: Event,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(event) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Action;

    fn event(name: &str) -> Event {
        Event {
            action: Action::Created,
            name: name.to_string(),
            addr: "127.0.0.1:9000".to_string(),
        }
    }

    #[tokio::test]
    async fn delivered_events_reach_the_subscriber() {
        let (tx, mut events) = subscription();
        let cancel = CancellationToken::new();

        assert!(deliver(&tx, &cancel, event("a")).await);
        drop(tx);

        assert_eq!(events.recv().await.unwrap().name, "a");
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_full_buffer() {
        let (tx, _events) = subscription();
        let cancel = CancellationToken::new();

        for i in 0..EVENT_BUFFER {
            assert!(deliver(&tx, &cancel, event(&i.to_string())).await);
        }

        // nobody is draining; the next delivery can only end via cancel
        cancel.cancel();
        assert!(!deliver(&tx, &cancel, event("overflow")).await);
    }

    #[tokio::test]
    async fn buffered_events_drain_after_cancellation() {
        let (tx, mut events) = subscription();
        let cancel = CancellationToken::new();

        assert!(deliver(&tx, &cancel, event("a")).await);
        assert!(deliver(&tx, &cancel, event("b")).await);
        cancel.cancel();
        drop(tx);

        assert_eq!(events.recv().await.unwrap().name, "a");
        assert_eq!(events.recv().await.unwrap().name, "b");
        assert!(events.recv().await.is_none());
    }
}
