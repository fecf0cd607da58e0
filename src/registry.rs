use crate::events::TransferNotice;
use alloy_primitives::Address;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

pub type ConnectionId = u64;

/// Outbound side of one subscriber connection. The transport task owns the
/// socket and the receiving half; the registry only holds this handle.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    sender: mpsc::Sender<TransferNotice>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn send(
        &self,
        notice: TransferNotice,
    ) -> Result<(), mpsc::error::SendError<TransferNotice>> {
        self.sender.send(notice).await
    }
}

/// Address → live connections fan-out table. All subscriber state lives
/// here; nothing else mutates subscriber lists. Reads taken while another
/// task unsubscribes may still see the departing connection, which is fine:
/// its send just fails and the dispatcher drops it.
pub struct SubscriptionRegistry {
    by_address: DashMap<Address, HashMap<ConnectionId, ConnectionHandle>>,
    by_connection: DashMap<ConnectionId, Address>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        SubscriptionRegistry {
            by_address: DashMap::new(),
            by_connection: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection under one watched address and hands back its id.
    pub fn subscribe(&self, address: Address, sender: mpsc::Sender<TransferNotice>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ConnectionHandle { id, sender };

        self.by_address.entry(address).or_default().insert(id, handle);
        self.by_connection.insert(id, address);

        debug!("Connection {} subscribed to {}", id, address);
        id
    }

    /// Removes a connection. Unknown or already-removed ids are a no-op.
    pub fn unsubscribe(&self, id: ConnectionId) {
        let Some((_, address)) = self.by_connection.remove(&id) else {
            return;
        };

        if let Some(mut connections) = self.by_address.get_mut(&address) {
            connections.remove(&id);
        }
        self.by_address.remove_if(&address, |_, connections| connections.is_empty());

        debug!("Connection {} unsubscribed from {}", id, address);
    }

    /// Snapshot of the connections currently subscribed to an address.
    pub fn subscribers_of(&self, address: Address) -> Vec<ConnectionHandle> {
        self.by_address
            .get(&address)
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.by_connection.len()
    }

    pub fn address_count(&self) -> usize {
        self.by_address.len()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        SubscriptionRegistry::new()
    }
}
