//! CallRTC Signaling Crate
//!
//! Transport layer for call negotiation. A call session lives under one node
//! of a shared, path-addressed key-value store:
//!
//! ```text
//! /<sessionRoot>/<conversationId>/calls/
//!     sdp            { type, description }
//!     iceCandidates/ push-list of candidates
//!     status         "PENDING" | "CONNECTING" | "CONNECTED" | "ENDED" | "ERROR"
//!     error          present only when status == "ERROR"
//!     callerId       caller user id
//! ```
//!
//! This crate knows nothing about calls. It moves JSON values in and out of
//! those sub-paths and delivers change notifications.
//!
//! # Usage
//!
//! ```rust,no_run
//! use callrtc_signaling::{CallPath, MemoryStore, SignalingStore};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new("sessions");
//!     let channel = store.channel("alice_bob");
//!
//!     let handle = channel
//!         .subscribe(
//!             CallPath::Status,
//!             Box::new(|value| println!("status is now {}", value)),
//!             Box::new(|err| eprintln!("subscription failed: {}", err)),
//!         )
//!         .unwrap();
//!
//!     channel.publish(CallPath::Status, json!("PENDING")).await.unwrap();
//!     channel.unsubscribe(&handle);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

mod channel;
mod error;
mod memory;
mod path;

pub use channel::{OnError, OnValue, SignalingChannel, SignalingStore, SubscriptionHandle};
pub use error::{SignalingError, SignalingResult};
pub use memory::MemoryStore;
pub use path::{CallPath, SessionPath};
