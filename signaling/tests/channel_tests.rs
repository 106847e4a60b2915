//! Integration tests for channels sharing one store

use callrtc_signaling::{CallPath, MemoryStore, SignalingChannel, SignalingStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn subscribe(
    channel: &Arc<dyn SignalingChannel>,
    path: CallPath,
) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel
        .subscribe(
            path,
            Box::new(move |value| {
                let _ = tx.send(value);
            }),
            Box::new(|_| {}),
        )
        .unwrap();
    rx
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("delivery timed out")
        .expect("delivery channel closed")
}

#[tokio::test]
async fn test_participants_see_each_other() {
    let store = MemoryStore::new("/sessions/");
    let alice = store.channel("alice_bob");
    let bob = store.channel("alice_bob");
    assert_eq!(bob.conversation_id(), "alice_bob");

    let mut bob_sdp = subscribe(&bob, CallPath::Sdp);
    alice
        .publish(CallPath::Sdp, json!({ "type": "offer", "description": "d1" }))
        .await
        .unwrap();

    assert_eq!(
        next(&mut bob_sdp).await,
        json!({ "type": "offer", "description": "d1" })
    );
}

#[tokio::test]
async fn test_conversations_are_isolated() {
    let store = MemoryStore::new("sessions");
    let first = store.channel("alice_bob");
    let second = store.channel("alice_carol");

    let mut second_status = subscribe(&second, CallPath::Status);
    first.publish(CallPath::Status, json!("PENDING")).await.unwrap();
    first.clear().await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(second_status.try_recv().is_err());
    assert_eq!(second.fetch(CallPath::Status).await.unwrap(), None);
}

#[tokio::test]
async fn test_push_list_accumulates_entries() {
    let store = MemoryStore::new("sessions");
    let alice = store.channel("alice_bob");
    let bob = store.channel("alice_bob");

    let mut candidates = subscribe(&bob, CallPath::IceCandidates);
    let first = alice
        .push(CallPath::IceCandidates, json!({ "sdp": "candidate:1" }))
        .await
        .unwrap();
    let second = bob
        .push(CallPath::IceCandidates, json!({ "sdp": "candidate:2" }))
        .await
        .unwrap();
    assert!(first < second);

    let one = next(&mut candidates).await;
    assert_eq!(one.as_object().unwrap().len(), 1);
    let two = next(&mut candidates).await;
    assert_eq!(two[&first], json!({ "sdp": "candidate:1" }));
    assert_eq!(two[&second], json!({ "sdp": "candidate:2" }));
}

#[tokio::test]
async fn test_clear_removes_every_sub_path() {
    let store = MemoryStore::new("sessions");
    let channel = store.channel("alice_bob");
    channel.publish(CallPath::Status, json!("ENDED")).await.unwrap();
    channel.publish(CallPath::CallerId, json!("alice")).await.unwrap();
    channel.publish(CallPath::Error, json!("No answer")).await.unwrap();

    let mut caller_id = subscribe(&channel, CallPath::CallerId);
    assert_eq!(next(&mut caller_id).await, json!("alice"));

    channel.clear().await.unwrap();
    assert_eq!(next(&mut caller_id).await, Value::Null);
    for path in CallPath::ALL {
        assert!(store.value("alice_bob", path).is_none(), "{} survived clear", path);
    }

    // Removing what is already gone is fine
    channel.remove(CallPath::Status).await.unwrap();
    channel.clear().await.unwrap();
}
