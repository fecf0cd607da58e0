use crate::error::WatchError;
use crate::events::{MatchKind, TransferEvent, TransferNotice};
use crate::registry::{ConnectionHandle, SubscriptionRegistry};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Fans a matched transfer out to every connection subscribed to its sender
/// or receiver. Send failures never reach the scanner: the offending
/// connection is logged and unsubscribed, siblings are unaffected.
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    explorer_base: String,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        explorer_base: String,
        send_timeout: Duration,
    ) -> Self {
        Dispatcher {
            registry,
            explorer_base,
            send_timeout,
        }
    }

    pub async fn dispatch(&self, event: &TransferEvent, kind: MatchKind) {
        let notice = TransferNotice::from_event(event, kind, &self.explorer_base);

        // One message per connection per event, even when a connection's
        // address appears on both sides of the transfer.
        let mut seen = HashSet::new();
        let mut targets: Vec<ConnectionHandle> = Vec::new();
        for address in [event.from, event.to] {
            for handle in self.registry.subscribers_of(address) {
                if seen.insert(handle.id()) {
                    targets.push(handle);
                }
            }
        }

        if targets.is_empty() {
            return;
        }

        debug!(
            "Dispatching {:?} transfer in block {} to {} connection(s)",
            kind,
            event.block_number,
            targets.len()
        );

        let sends = targets
            .iter()
            .map(|handle| self.send_one(handle, notice.clone()));
        for (handle, result) in targets.iter().zip(futures::future::join_all(sends).await) {
            if let Err(e) = result {
                warn!("{}", e);
                self.registry.unsubscribe(handle.id());
            }
        }
    }

    async fn send_one(
        &self,
        handle: &ConnectionHandle,
        notice: TransferNotice,
    ) -> Result<(), WatchError> {
        match timeout(self.send_timeout, handle.send(notice)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(WatchError::Delivery {
                connection_id: handle.id(),
                reason: "channel closed".to_string(),
            }),
            Err(_) => Err(WatchError::Delivery {
                connection_id: handle.id(),
                reason: format!("no capacity after {:?}", self.send_timeout),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256, U256, address};
    use tokio::sync::mpsc;

    fn event(from: Address, to: Address) -> TransferEvent {
        TransferEvent {
            block_number: 100,
            log_index: 0,
            tx_hash: B256::ZERO,
            from,
            to,
            raw_value: U256::from(5_000_000u64),
            token_decimals: 6,
        }
    }

    fn dispatcher(registry: Arc<SubscriptionRegistry>) -> Dispatcher {
        Dispatcher::new(
            registry,
            "https://etherscan.io/tx/".to_string(),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn sends_one_message_when_both_sides_match_one_connection() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let addr = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let (tx, mut rx) = mpsc::channel(8);
        registry.subscribe(addr, tx);

        dispatcher(registry)
            .dispatch(&event(addr, addr), MatchKind::Internal)
            .await;

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.kind, MatchKind::Internal);
        assert_eq!(notice.amount, "5.0");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn notifies_subscribers_of_both_sides() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let from = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let to = address!("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        let (from_tx, mut from_rx) = mpsc::channel(8);
        let (to_tx, mut to_rx) = mpsc::channel(8);
        registry.subscribe(from, from_tx);
        registry.subscribe(to, to_tx);

        dispatcher(registry)
            .dispatch(&event(from, to), MatchKind::Outgoing)
            .await;

        assert_eq!(from_rx.recv().await.unwrap().block, 100);
        assert_eq!(to_rx.recv().await.unwrap().block, 100);
    }

    #[tokio::test]
    async fn a_closed_connection_is_dropped_and_siblings_still_receive() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let addr = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");

        let (dead_tx, dead_rx) = mpsc::channel(1);
        drop(dead_rx);
        registry.subscribe(addr, dead_tx);
        let (live_tx, mut live_rx) = mpsc::channel(8);
        let live_id = registry.subscribe(addr, live_tx);

        let dispatcher = dispatcher(registry.clone());
        dispatcher.dispatch(&event(addr, Address::ZERO), MatchKind::Outgoing).await;

        assert_eq!(live_rx.recv().await.unwrap().kind, MatchKind::Outgoing);
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.subscribers_of(addr)[0].id(), live_id);
    }

    #[tokio::test]
    async fn a_full_connection_times_out_and_is_dropped() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let addr = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");

        let (slow_tx, _slow_rx) = mpsc::channel(1);
        slow_tx
            .send(TransferNotice::from_event(
                &event(addr, Address::ZERO),
                MatchKind::Outgoing,
                "https://etherscan.io/tx/",
            ))
            .await
            .unwrap();
        registry.subscribe(addr, slow_tx);

        let dispatcher = dispatcher(registry.clone());
        dispatcher.dispatch(&event(addr, Address::ZERO), MatchKind::Outgoing).await;

        assert_eq!(registry.connection_count(), 0);
    }
}
