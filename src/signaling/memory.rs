use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::{SignalingChannel, Snapshot, Subscription};
use crate::error::SignalingError;

/// In-process relay: one JSON tree addressed by `/`-separated keys.
///
/// Subscribers are notified whenever a mutation touches their key, one of its
/// ancestors, or one of its descendants, and only when the value they observe
/// actually changed.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    root: Map<String, Value>,
    subscribers: HashMap<u64, Subscriber>,
    next_id: u64,
    unavailable: bool,
}

struct Subscriber {
    path: Vec<String>,
    tx: mpsc::UnboundedSender<Snapshot>,
    last: Snapshot,
}

fn split(key: &str) -> Vec<String> {
    key.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_related(a: &[String], b: &[String]) -> bool {
    let n = a.len().min(b.len());
    a[..n] == b[..n]
}

impl Inner {
    fn get(&self, path: &[String]) -> Snapshot {
        let Some((first, rest)) = path.split_first() else {
            return (!self.root.is_empty()).then(|| Value::Object(self.root.clone()));
        };
        let mut node = self.root.get(first)?;
        for segment in rest {
            node = match node {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(node.clone())
    }

    /// Mutable slot at `path`, creating missing intermediate objects. A
    /// scalar or list in the middle of the path is never overwritten.
    fn slot(&mut self, path: &[String]) -> Result<&mut Value, &'static str> {
        let Some((last, parents)) = path.split_last() else {
            return Err("cannot address the root");
        };
        let mut map = &mut self.root;
        for segment in parents {
            map = map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .ok_or("an ancestor is not an object")?;
        }
        Ok(map.entry(last.clone()).or_insert(Value::Null))
    }

    fn set(&mut self, path: &[String], value: Value) -> Result<(), &'static str> {
        if value.is_null() {
            self.remove(path);
        } else {
            *self.slot(path)? = value;
        }
        Ok(())
    }

    fn remove(&mut self, path: &[String]) {
        fn remove_in(map: &mut Map<String, Value>, path: &[String]) {
            let Some((first, rest)) = path.split_first() else {
                return;
            };
            if rest.is_empty() {
                map.remove(first);
                return;
            }
            if let Some(Value::Object(child)) = map.get_mut(first) {
                remove_in(child, rest);
                if child.is_empty() {
                    map.remove(first);
                }
            }
        }
        if path.is_empty() {
            self.root.clear();
        } else {
            remove_in(&mut self.root, path);
        }
    }

    fn notify(&mut self, changed: &[String]) {
        let ids: Vec<u64> = self
            .subscribers
            .iter()
            .filter(|(_, s)| is_related(&s.path, changed))
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let current = self.subscribers.get(&id).map(|s| self.get(&s.path));
            let Some(current) = current else { continue };
            let Some(sub) = self.subscribers.get_mut(&id) else { continue };
            if sub.last == current {
                continue;
            }
            sub.last = current.clone();
            if sub.tx.send(current).is_err() {
                self.subscribers.remove(&id);
            }
        }
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate the relay going away (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Current value at `key`, read without subscribing.
    pub fn get(&self, key: &str) -> Snapshot {
        self.lock().get(&split(key))
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn mutate<F>(&self, key: &str, op: F) -> Result<(), SignalingError>
    where
        F: FnOnce(&mut Inner, &[String]) -> Result<(), SignalingError>,
    {
        let path = split(key);
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(SignalingError::Unavailable);
        }
        op(&mut inner, &path)?;
        inner.notify(&path);
        Ok(())
    }
}

fn rejected(key: &str, reason: &str) -> SignalingError {
    SignalingError::Rejected {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    async fn write(&self, key: &str, value: Value) -> Result<(), SignalingError> {
        self.mutate(key, |inner, path| {
            if path.is_empty() {
                return Err(rejected(key, "cannot overwrite the root"));
            }
            inner.set(path, value).map_err(|reason| rejected(key, reason))
        })
    }

    async fn patch(&self, key: &str, fields: Value) -> Result<(), SignalingError> {
        let Value::Object(fields) = fields else {
            return Err(rejected(key, "patch requires an object"));
        };
        self.mutate(key, |inner, path| {
            if path.is_empty() {
                return Err(rejected(key, "cannot patch the root"));
            }
            for (field, value) in fields {
                let mut child = path.to_vec();
                child.push(field);
                inner.set(&child, value).map_err(|reason| rejected(key, reason))?;
            }
            Ok(())
        })
    }

    async fn append_to_list(&self, key: &str, item: Value) -> Result<(), SignalingError> {
        self.mutate(key, |inner, path| {
            let slot = inner.slot(path).map_err(|reason| rejected(key, reason))?;
            if slot.is_null() {
                *slot = Value::Array(vec![item]);
                return Ok(());
            }
            match slot.as_array_mut() {
                Some(items) => items.push(item),
                None => return Err(rejected(key, "not a list")),
            }
            Ok(())
        })
    }

    async fn subscribe(&self, key: &str) -> Result<Subscription, SignalingError> {
        let path = split(key);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(SignalingError::Unavailable);
        }
        let current = inner.get(&path);
        let _ = tx.send(current.clone());

        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, Subscriber { path, tx, last: current });
        debug!("Subscribed to {} (id {})", key, id);

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(key, rx, move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
                inner.subscribers.remove(&id);
            }
        }))
    }

    async fn delete(&self, key: &str) -> Result<(), SignalingError> {
        self.mutate(key, |inner, path| {
            inner.remove(path);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribe_delivers_current_value_first() {
        let relay = MemoryChannel::new();
        relay.write("calls/a-b", json!({ "offer": 1 })).await.unwrap();

        let mut sub = relay.subscribe("calls/a-b").await.unwrap();
        assert_eq!(sub.next().await, Some(Some(json!({ "offer": 1 }))));
    }

    #[tokio::test]
    async fn absent_key_snapshots_as_none() {
        let relay = MemoryChannel::new();
        let mut sub = relay.subscribe("calls/nobody").await.unwrap();
        assert_eq!(sub.next().await, Some(None));
    }

    #[tokio::test]
    async fn patch_merges_without_dropping_siblings() {
        let relay = MemoryChannel::new();
        relay.write("calls/a-b", json!({ "offer": 1 })).await.unwrap();
        relay.append_to_list("calls/a-b/candidates/a", json!("c1")).await.unwrap();
        relay.patch("calls/a-b", json!({ "answer": 2 })).await.unwrap();

        assert_eq!(
            relay.get("calls/a-b"),
            Some(json!({ "offer": 1, "answer": 2, "candidates": { "a": ["c1"] } }))
        );
    }

    #[tokio::test]
    async fn descendant_and_ancestor_changes_reach_subscribers() {
        let relay = MemoryChannel::new();
        let mut root = relay.subscribe("calls").await.unwrap();
        let mut list = relay.subscribe("calls/a-b/candidates/a").await.unwrap();
        assert_eq!(root.next().await, Some(None));
        assert_eq!(list.next().await, Some(None));

        relay.append_to_list("calls/a-b/candidates/a", json!("c1")).await.unwrap();
        assert_eq!(list.next().await, Some(Some(json!(["c1"]))));
        assert_eq!(root.next().await, Some(Some(json!({ "a-b": { "candidates": { "a": ["c1"] } } }))));

        relay.delete("calls/a-b").await.unwrap();
        assert_eq!(list.next().await, Some(None));
        assert_eq!(root.next().await, Some(None));
    }

    #[tokio::test]
    async fn unrelated_writes_do_not_notify() {
        let relay = MemoryChannel::new();
        let mut sub = relay.subscribe("calls/a-b").await.unwrap();
        sub.next().await;

        relay.write("calls/c-d", json!(1)).await.unwrap();
        relay.write("calls/a-b", json!(2)).await.unwrap();
        assert_eq!(sub.next().await, Some(Some(json!(2))));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let relay = MemoryChannel::new();
        relay.delete("calls/missing").await.unwrap();
        relay.write("calls/a-b", json!(1)).await.unwrap();
        relay.delete("calls/a-b").await.unwrap();
        relay.delete("calls/a-b").await.unwrap();
        assert_eq!(relay.get("calls"), None);
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let relay = MemoryChannel::new();
        let sub = relay.subscribe("calls").await.unwrap();
        assert_eq!(relay.subscriber_count(), 1);
        drop(sub);
        assert_eq!(relay.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unavailable_relay_rejects_everything() {
        let relay = MemoryChannel::new();
        relay.set_unavailable(true);
        assert_eq!(relay.write("calls/a-b", json!(1)).await, Err(SignalingError::Unavailable));
        assert_eq!(relay.delete("calls/a-b").await, Err(SignalingError::Unavailable));
        assert!(relay.subscribe("calls").await.is_err());

        relay.set_unavailable(false);
        relay.write("calls/a-b", json!(1)).await.unwrap();
    }

    #[tokio::test]
    async fn writes_through_a_scalar_are_rejected() {
        let relay = MemoryChannel::new();
        relay.write("calls/x", json!(5)).await.unwrap();

        let err = relay.append_to_list("calls/x/candidates/a", json!(1)).await.unwrap_err();
        assert!(matches!(err, SignalingError::Rejected { .. }));
        let err = relay.write("calls/x/offer", json!({ "sdp": "v=0" })).await.unwrap_err();
        assert!(matches!(err, SignalingError::Rejected { .. }));
        let err = relay.patch("calls/x", json!({ "answer": 1 })).await.unwrap_err();
        assert!(matches!(err, SignalingError::Rejected { .. }));
        assert_eq!(relay.get("calls/x"), Some(json!(5)));
    }

    #[tokio::test]
    async fn append_to_scalar_is_rejected() {
        let relay = MemoryChannel::new();
        relay.write("calls/x", json!(5)).await.unwrap();
        let err = relay.append_to_list("calls/x", json!(1)).await.unwrap_err();
        assert!(matches!(err, SignalingError::Rejected { .. }));
    }
}
