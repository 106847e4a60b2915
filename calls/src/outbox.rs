//! Ordered writer for the signaling store
//!
//! The orchestrator worker never awaits the network. It hands writes to the
//! outbox, which executes them one at a time in submission order on its own
//! task and reports each result back through a completion callback.

use crate::config::CallConfig;
use callrtc_signaling::{CallPath, SignalingChannel, SignalingError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One store write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Overwrite a sub-path
    Publish(CallPath, Value),
    /// Append to a push-list
    Push(CallPath, Value),
    /// Remove the whole session node
    Clear,
}

impl WriteOp {
    /// Sub-path written, `None` for [`WriteOp::Clear`]
    pub fn path(&self) -> Option<CallPath> {
        match self {
            Self::Publish(path, _) | Self::Push(path, _) => Some(*path),
            Self::Clear => None,
        }
    }

    /// Overwrites and removals can be repeated safely; appends cannot
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Self::Push(..))
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Publish(..) => "publish",
            Self::Push(..) => "push",
            Self::Clear => "clear",
        }
    }
}

/// Result of one write, reported after retries are exhausted
#[derive(Debug, Clone)]
pub struct WriteCompletion {
    /// The write that ran (values are dropped to keep completions small)
    pub kind: WriteKind,
    /// Sub-path written, `None` for a clear
    pub path: Option<CallPath>,
    /// Attempts made
    pub attempts: u32,
    /// Final outcome
    pub result: Result<(), SignalingError>,
}

/// Kind of write a completion refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Overwrite
    Publish,
    /// Append
    Push,
    /// Node removal
    Clear,
}

impl From<&WriteOp> for WriteKind {
    fn from(op: &WriteOp) -> Self {
        match op {
            WriteOp::Publish(..) => Self::Publish,
            WriteOp::Push(..) => Self::Push,
            WriteOp::Clear => Self::Clear,
        }
    }
}

/// Callback receiving every [`WriteCompletion`]
pub type OnWritten = Box<dyn Fn(WriteCompletion) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    retries: u32,
    backoff_ms: u64,
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// FIFO write queue bound to one session channel
pub struct Outbox {
    tx: Option<mpsc::UnboundedSender<WriteOp>>,
}

impl Outbox {
    /// Start the writer task. It exits once the outbox is closed and the
    /// queue is drained.
    pub fn spawn(
        channel: Arc<dyn SignalingChannel>,
        config: &CallConfig,
        on_written: OnWritten,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let policy = RetryPolicy {
            retries: config.publish_retries,
            backoff_ms: config.publish_retry_backoff_ms,
        };
        tokio::spawn(run_writer(channel, policy, rx, on_written));
        Self { tx: Some(tx) }
    }

    /// Queue a write. Returns `false` once the outbox is closed.
    pub fn submit(&self, op: WriteOp) -> bool {
        match &self.tx {
            Some(tx) => tx.send(op).is_ok(),
            None => false,
        }
    }

    /// Stop accepting writes. Already queued writes still run.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

async fn run_writer(
    channel: Arc<dyn SignalingChannel>,
    policy: RetryPolicy,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
    on_written: OnWritten,
) {
    while let Some(op) = rx.recv().await {
        let max_attempts = if op.is_idempotent() {
            policy.retries + 1
        } else {
            1
        };

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            let result = execute(channel.as_ref(), &op).await;
            match result {
                Err(ref e) if e.is_retryable() && attempts < max_attempts => {
                    tracing::debug!(
                        conversation = %channel.conversation_id(),
                        op = op.label(),
                        attempt = attempts,
                        "Store write failed, retrying: {}",
                        e
                    );
                    tokio::time::sleep(policy.backoff(attempts)).await;
                }
                other => break other,
            }
        };

        on_written(WriteCompletion {
            kind: WriteKind::from(&op),
            path: op.path(),
            attempts,
            result,
        });
    }
    tracing::debug!(conversation = %channel.conversation_id(), "Outbox drained");
}

async fn execute(channel: &dyn SignalingChannel, op: &WriteOp) -> Result<(), SignalingError> {
    match op {
        WriteOp::Publish(path, value) => channel.publish(*path, value.clone()).await,
        WriteOp::Push(path, value) => channel.push(*path, value.clone()).await.map(|_| ()),
        WriteOp::Clear => channel.clear().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callrtc_signaling::{MemoryStore, SignalingStore};
    use serde_json::json;

    fn fast_config() -> CallConfig {
        CallConfig {
            publish_retries: 2,
            publish_retry_backoff_ms: 1,
            ..CallConfig::default()
        }
    }

    fn collect() -> (OnWritten, mpsc::UnboundedReceiver<WriteCompletion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Box::new(move |c| {
                let _ = tx.send(c);
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn test_writes_run_in_order() {
        let store = MemoryStore::new("sessions");
        let (on_written, mut done) = collect();
        let outbox = Outbox::spawn(store.channel("A_B"), &fast_config(), on_written);

        assert!(outbox.submit(WriteOp::Publish(CallPath::Status, json!("PENDING"))));
        assert!(outbox.submit(WriteOp::Publish(CallPath::Status, json!("ENDED"))));

        let first = done.recv().await.unwrap();
        let second = done.recv().await.unwrap();
        assert!(first.result.is_ok() && second.result.is_ok());
        assert_eq!(store.value("A_B", CallPath::Status), Some(json!("ENDED")));
    }

    #[tokio::test]
    async fn test_publish_retries_transient_failures() {
        let store = MemoryStore::new("sessions");
        store.fail_next_writes("A_B", CallPath::Sdp, 2);
        let (on_written, mut done) = collect();
        let outbox = Outbox::spawn(store.channel("A_B"), &fast_config(), on_written);

        outbox.submit(WriteOp::Publish(CallPath::Sdp, json!({"type": "offer", "description": "d1"})));

        let completion = done.recv().await.unwrap();
        assert!(completion.result.is_ok());
        assert_eq!(completion.attempts, 3);
        assert!(store.value("A_B", CallPath::Sdp).is_some());
    }

    #[tokio::test]
    async fn test_push_is_not_retried() {
        let store = MemoryStore::new("sessions");
        store.fail_next_writes("A_B", CallPath::IceCandidates, 1);
        let (on_written, mut done) = collect();
        let outbox = Outbox::spawn(store.channel("A_B"), &fast_config(), on_written);

        outbox.submit(WriteOp::Push(CallPath::IceCandidates, json!({"sdp": "candidate:1"})));

        let completion = done.recv().await.unwrap();
        assert_eq!(completion.kind, WriteKind::Push);
        assert_eq!(completion.attempts, 1);
        assert!(completion.result.is_err());
        assert!(store.value("A_B", CallPath::IceCandidates).is_none());
    }

    #[tokio::test]
    async fn test_close_drains_queued_writes() {
        let store = MemoryStore::new("sessions");
        let (on_written, mut done) = collect();
        let mut outbox = Outbox::spawn(store.channel("A_B"), &fast_config(), on_written);

        outbox.submit(WriteOp::Publish(CallPath::Status, json!("ENDED")));
        outbox.submit(WriteOp::Clear);
        outbox.close();
        assert!(!outbox.submit(WriteOp::Clear));

        let publish = done.recv().await.unwrap();
        let clear = done.recv().await.unwrap();
        assert_eq!(publish.kind, WriteKind::Publish);
        assert_eq!(clear.kind, WriteKind::Clear);
        assert!(done.recv().await.is_none());
        assert!(store.value("A_B", CallPath::Status).is_none());
    }
}
