//! Signaling channel and store traits

use crate::{
    error::{SignalingError, SignalingResult},
    path::CallPath,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Callback receiving the value of a sub-path (`null` once it is removed)
pub type OnValue = Box<dyn Fn(Value) + Send + Sync>;

/// Callback receiving the error that terminated a subscription
pub type OnError = Box<dyn Fn(SignalingError) + Send + Sync>;

/// Handle returned by [`SignalingChannel::subscribe`]
///
/// Cloning the handle shares the same subscription. Once inactive it never
/// becomes active again.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    id: u64,
    path: CallPath,
    active: Arc<AtomicBool>,
}

impl SubscriptionHandle {
    /// Create a new active handle
    pub fn new(id: u64, path: CallPath) -> Self {
        Self {
            id,
            path,
            active: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Store-assigned subscription id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sub-path this subscription observes
    pub fn path(&self) -> CallPath {
        self.path
    }

    /// Whether values are still delivered
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery. Returns `true` only for the call that deactivated it.
    pub fn deactivate(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

/// Transport for one call session node
///
/// Delivery within one sub-path preserves write order. Nothing is promised
/// about ordering across sub-paths.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Conversation the channel is bound to
    fn conversation_id(&self) -> &str;

    /// Overwrite the value at `path` (last write wins)
    async fn publish(&self, path: CallPath, value: Value) -> SignalingResult<()>;

    /// Append `value` to the push-list at `path`, returning its key.
    /// Keys sort in write order.
    async fn push(&self, path: CallPath, value: Value) -> SignalingResult<String>;

    /// Read the current value at `path` once
    async fn fetch(&self, path: CallPath) -> SignalingResult<Option<Value>>;

    /// Delete `path` and everything beneath it
    async fn remove(&self, path: CallPath) -> SignalingResult<()>;

    /// Delete the whole session node
    async fn clear(&self) -> SignalingResult<()>;

    /// Observe `path`.
    ///
    /// `on_value` fires once with the current value if one exists, then on
    /// every change. `on_error` fires at most once, after which delivery
    /// stops and the caller must subscribe again.
    fn subscribe(
        &self,
        path: CallPath,
        on_value: OnValue,
        on_error: OnError,
    ) -> SignalingResult<SubscriptionHandle>;

    /// Stop delivery for `handle`. Safe to repeat and to call after the
    /// node has been removed.
    fn unsubscribe(&self, handle: &SubscriptionHandle);
}

/// Shared store that hands out per-session channels
pub trait SignalingStore: Send + Sync {
    /// Channel bound to the call node of `conversation_id`
    fn channel(&self, conversation_id: &str) -> Arc<dyn SignalingChannel>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_deactivates_once() {
        let handle = SubscriptionHandle::new(7, CallPath::Status);
        let shared = handle.clone();

        assert!(handle.is_active());
        assert!(shared.deactivate());
        assert!(!handle.deactivate());
        assert!(!handle.is_active());
        assert_eq!(handle.id(), 7);
        assert_eq!(handle.path(), CallPath::Status);
    }
}
