//! In-process signaling store
//!
//! Behaves like a hosted realtime database: values are JSON, writes notify
//! every subscriber of the written path, and each subscription delivers on
//! its own task so callbacks arrive from a different execution context than
//! the writer. Also supports fault injection for exercising transport
//! failure handling.

use crate::{
    channel::{OnError, OnValue, SignalingChannel, SignalingStore, SubscriptionHandle},
    error::{SignalingError, SignalingResult},
    path::{CallPath, SessionPath},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Item queued to a subscription's delivery task
enum Delivery {
    Value(Value),
    Error(SignalingError),
}

struct Subscriber {
    handle: SubscriptionHandle,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct StoreInner {
    /// Rendered path → value
    values: HashMap<String, Value>,

    /// Rendered path → live subscribers
    subscribers: HashMap<String, Vec<Subscriber>>,

    /// Rendered path → number of upcoming writes that must fail
    failing_writes: HashMap<String, u32>,

    next_subscription: u64,
    next_push: u64,
    offline: bool,
}

impl StoreInner {
    fn check_write(&mut self, key: &str) -> SignalingResult<()> {
        if self.offline {
            return Err(SignalingError::Offline);
        }
        if let Some(remaining) = self.failing_writes.get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SignalingError::transport(key, "injected write failure"));
            }
        }
        Ok(())
    }

    fn notify(&mut self, key: &str, value: &Value) {
        if let Some(subscribers) = self.subscribers.get_mut(key) {
            subscribers.retain(|sub| {
                sub.handle.is_active() && sub.tx.send(Delivery::Value(value.clone())).is_ok()
            });
        }
    }

    fn remove_key(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            self.notify(key, &Value::Null);
        }
    }
}

/// Process-local signaling store
///
/// Cloning shares the same underlying data, so two orchestrators holding
/// clones talk to each other exactly as they would through a hosted store.
#[derive(Clone)]
pub struct MemoryStore {
    root: String,
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    /// Create an empty store whose call nodes live under `root`
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            inner: Arc::new(Mutex::new(StoreInner::default())),
        }
    }

    fn session(&self, conversation_id: &str) -> SessionPath {
        SessionPath::new(self.root.clone(), conversation_id)
    }

    /// Current value at a sub-path, read synchronously
    pub fn value(&self, conversation_id: &str, path: CallPath) -> Option<Value> {
        let key = self.session(conversation_id).child(path);
        self.inner.lock().values.get(&key).cloned()
    }

    /// Number of live subscriptions on a sub-path
    pub fn subscriber_count(&self, conversation_id: &str, path: CallPath) -> usize {
        let key = self.session(conversation_id).child(path);
        self.inner
            .lock()
            .subscribers
            .get(&key)
            .map(|subs| subs.iter().filter(|s| s.handle.is_active()).count())
            .unwrap_or(0)
    }

    /// Make the next `count` writes (publish or push) to a sub-path fail
    /// with a transport error
    pub fn fail_next_writes(&self, conversation_id: &str, path: CallPath, count: u32) {
        let key = self.session(conversation_id).child(path);
        self.inner.lock().failing_writes.insert(key, count);
    }

    /// Terminate every subscription on a sub-path with a transport error
    pub fn break_subscriptions(&self, conversation_id: &str, path: CallPath, message: &str) {
        let key = self.session(conversation_id).child(path);
        let mut inner = self.inner.lock();
        if let Some(subscribers) = inner.subscribers.remove(&key) {
            tracing::debug!(path = %key, count = subscribers.len(), "Breaking subscriptions");
            for sub in subscribers {
                let _ = sub
                    .tx
                    .send(Delivery::Error(SignalingError::transport(key.clone(), message)));
            }
        }
    }

    /// Toggle whether the store rejects every operation as offline
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }
}

impl SignalingStore for MemoryStore {
    fn channel(&self, conversation_id: &str) -> Arc<dyn SignalingChannel> {
        Arc::new(MemoryChannel {
            session: self.session(conversation_id),
            inner: self.inner.clone(),
        })
    }
}

/// Channel bound to one session node of a [`MemoryStore`]
struct MemoryChannel {
    session: SessionPath,
    inner: Arc<Mutex<StoreInner>>,
}

#[async_trait]
impl SignalingChannel for MemoryChannel {
    fn conversation_id(&self) -> &str {
        self.session.conversation_id()
    }

    async fn publish(&self, path: CallPath, value: Value) -> SignalingResult<()> {
        let key = self.session.child(path);
        let mut inner = self.inner.lock();
        inner.check_write(&key)?;

        tracing::debug!(path = %key, "Publishing value");
        inner.values.insert(key.clone(), value.clone());
        inner.notify(&key, &value);
        Ok(())
    }

    async fn push(&self, path: CallPath, value: Value) -> SignalingResult<String> {
        let key = self.session.child(path);
        let mut inner = self.inner.lock();
        inner.check_write(&key)?;

        let push_key = format!("{:020}", inner.next_push);
        inner.next_push += 1;

        let list = inner
            .values
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !list.is_object() {
            // An overwrite replaced the push-list with a scalar
            *list = Value::Object(Map::new());
        }
        if let Value::Object(entries) = &mut *list {
            entries.insert(push_key.clone(), value);
        }
        let snapshot = list.clone();

        tracing::debug!(path = %key, key = %push_key, "Pushed list entry");
        inner.notify(&key, &snapshot);
        Ok(push_key)
    }

    async fn fetch(&self, path: CallPath) -> SignalingResult<Option<Value>> {
        let key = self.session.child(path);
        let inner = self.inner.lock();
        if inner.offline {
            return Err(SignalingError::Offline);
        }
        Ok(inner.values.get(&key).cloned())
    }

    async fn remove(&self, path: CallPath) -> SignalingResult<()> {
        let key = self.session.child(path);
        let mut inner = self.inner.lock();
        if inner.offline {
            return Err(SignalingError::Offline);
        }
        inner.remove_key(&key);
        Ok(())
    }

    async fn clear(&self) -> SignalingResult<()> {
        let node = self.session.node();
        let mut inner = self.inner.lock();
        inner.check_write(&node)?;

        tracing::debug!(path = %node, "Clearing session node");
        for path in CallPath::ALL {
            inner.remove_key(&self.session.child(path));
        }
        Ok(())
    }

    fn subscribe(
        &self,
        path: CallPath,
        on_value: OnValue,
        on_error: OnError,
    ) -> SignalingResult<SubscriptionHandle> {
        let key = self.session.child(path);
        let mut inner = self.inner.lock();
        if inner.offline {
            return Err(SignalingError::Offline);
        }

        let handle = SubscriptionHandle::new(inner.next_subscription, path);
        inner.next_subscription += 1;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(current) = inner.values.get(&key) {
            // Queued before registration so it precedes every later change
            let _ = tx.send(Delivery::Value(current.clone()));
        }

        let task_handle = handle.clone();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                if !task_handle.is_active() {
                    break;
                }
                match delivery {
                    Delivery::Value(value) => on_value(value),
                    Delivery::Error(err) => {
                        task_handle.deactivate();
                        on_error(err);
                        break;
                    }
                }
            }
        });

        inner.subscribers.entry(key.clone()).or_default().push(Subscriber {
            handle: handle.clone(),
            tx,
        });

        tracing::debug!(path = %key, id = handle.id(), "Subscribed");
        Ok(handle)
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        handle.deactivate();

        let key = self.session.child(handle.path());
        let mut inner = self.inner.lock();
        if let Some(subscribers) = inner.subscribers.get_mut(&key) {
            subscribers.retain(|sub| sub.handle.id() != handle.id());
            if subscribers.is_empty() {
                inner.subscribers.remove(&key);
            }
        }
    }
}
