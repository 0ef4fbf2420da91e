//! The store-and-notify relay used to exchange session descriptions and
//! candidates. The engine only sees the [`SignalingChannel`] trait; the relay
//! itself lives outside this crate (an in-memory one is provided for tests and
//! loopback runs).

pub mod memory;
pub mod records;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::SignalingError;

pub use memory::MemoryChannel;
pub use records::{
    CallRecord, IceCandidate, OfferRecord, SdpType, SessionDescription, SessionId, SessionKeys,
};

/// Value observed at a key; `None` when nothing is stored there.
pub type Snapshot = Option<Value>;

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Create or overwrite the record at `key`.
    async fn write(&self, key: &str, value: Value) -> Result<(), SignalingError>;

    /// Merge the fields of `fields` into the record at `key`.
    async fn patch(&self, key: &str, fields: Value) -> Result<(), SignalingError>;

    /// Push `item` onto the ordered list at `key`.
    async fn append_to_list(&self, key: &str, item: Value) -> Result<(), SignalingError>;

    /// Observe `key`: the current value is delivered immediately, then again
    /// on every change. Dropping the subscription unsubscribes.
    async fn subscribe(&self, key: &str) -> Result<Subscription, SignalingError>;

    /// Remove the record or subtree at `key`. Absence is not an error.
    async fn delete(&self, key: &str) -> Result<(), SignalingError>;
}

/// A live subscription yielding snapshots in change order.
pub struct Subscription {
    key: String,
    rx: mpsc::UnboundedReceiver<Snapshot>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        key: impl Into<String>,
        rx: mpsc::UnboundedReceiver<Snapshot>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Next snapshot, or `None` once the relay has dropped the subscription.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}
