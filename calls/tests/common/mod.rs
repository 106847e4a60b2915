//! Scripted peer backend for orchestrator tests
#![allow(dead_code)]

use async_trait::async_trait;
use callrtc_calls::{
    CallConfig, CallContext, CallError, CallOrchestrator, CallResult, IceCandidate,
    IceConnectionState, PeerBackend, PeerBackendFactory, PeerEvent, PeerEventSink,
    SessionDescription, TrackHandle, TrackKind,
};
use callrtc_signaling::MemoryStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(5);

/// Config with short backoffs so retry paths finish quickly
pub fn test_config() -> CallConfig {
    CallConfig {
        answer_timeout_ms: Some(10_000),
        publish_retry_backoff_ms: 2,
        resubscribe_backoff_ms: 5,
        ..CallConfig::default()
    }
}

/// Poll `cond` until it holds, panicking after [`WAIT`]
pub async fn eventually(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// How a fake backend behaves
#[derive(Debug, Clone, Copy)]
pub struct FakeOptions {
    /// `start_media` fails as if permission was denied
    pub fail_media: bool,
    /// Local candidates gathered after each local description
    pub local_candidates: usize,
    /// Report Checking then Connected once both descriptions are set and a
    /// remote candidate was applied
    pub auto_connect: bool,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            fail_media: false,
            local_candidates: 2,
            auto_connect: true,
        }
    }
}

#[derive(Default)]
struct FakeState {
    sink: Option<PeerEventSink>,
    media_started: bool,
    local_description: Option<SessionDescription>,
    remote_descriptions: Vec<SessionDescription>,
    applied: Vec<IceCandidate>,
    gathered: Vec<IceCandidate>,
    stop_count: usize,
    close_count: usize,
    connected_reported: bool,
}

/// Test-side view of one fake backend
#[derive(Clone)]
pub struct FakeHandle {
    label: String,
    options: FakeOptions,
    state: Arc<Mutex<FakeState>>,
}

impl FakeHandle {
    /// Raise a native event as the peer connection would
    pub fn emit(&self, event: PeerEvent) {
        let sink = self.state.lock().sink.clone();
        if let Some(sink) = sink {
            sink.emit(event);
        }
    }

    /// Remote candidates handed to the native connection, in order
    pub fn applied(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    /// Candidates this backend gathered
    pub fn gathered(&self) -> Vec<IceCandidate> {
        self.state.lock().gathered.clone()
    }

    /// Every remote description applied
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.state.lock().remote_descriptions.clone()
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().stop_count
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    fn gather(&self, round: &str) {
        let candidates: Vec<IceCandidate> = (0..self.options.local_candidates)
            .map(|i| {
                IceCandidate::new(
                    "0",
                    0,
                    format!(
                        "candidate:{}-{}-{} 1 udp 2130706431 10.0.0.{} {} typ host",
                        self.label,
                        round,
                        i,
                        i + 1,
                        5000 + i
                    ),
                )
            })
            .collect();
        self.state.lock().gathered.extend(candidates.iter().cloned());
        for candidate in candidates {
            self.emit(PeerEvent::LocalIceCandidate(candidate));
        }
    }

    fn maybe_connect(&self) {
        if !self.options.auto_connect {
            return;
        }
        let ready = {
            let mut state = self.state.lock();
            let ready = !state.connected_reported
                && state.local_description.is_some()
                && !state.remote_descriptions.is_empty()
                && !state.applied.is_empty();
            if ready {
                state.connected_reported = true;
            }
            ready
        };
        if ready {
            self.emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Checking));
            self.emit(PeerEvent::IceConnectionStateChanged(IceConnectionState::Connected));
        }
    }
}

struct FakeBackend {
    handle: FakeHandle,
}

#[async_trait]
impl PeerBackend for FakeBackend {
    async fn start_media(&self) -> CallResult<()> {
        if self.handle.options.fail_media {
            return Err(CallError::Media("permission denied".to_string()));
        }
        self.handle.state.lock().media_started = true;
        Ok(())
    }

    async fn attach_media(&self) -> CallResult<()> {
        Ok(())
    }

    async fn create_offer(&self) -> CallResult<SessionDescription> {
        let offer = SessionDescription::offer(format!("v=0 offer-from-{}", self.handle.label));
        self.handle.state.lock().local_description = Some(offer.clone());
        self.handle.gather("offer");
        Ok(offer)
    }

    async fn create_answer(&self) -> CallResult<SessionDescription> {
        let answer = SessionDescription::answer(format!("v=0 answer-from-{}", self.handle.label));
        self.handle.state.lock().local_description = Some(answer.clone());
        self.handle.gather("answer");
        self.handle.maybe_connect();
        Ok(answer)
    }

    async fn set_remote_description(&self, sdp: &SessionDescription) -> CallResult<()> {
        self.handle.state.lock().remote_descriptions.push(sdp.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> CallResult<()> {
        self.handle.state.lock().applied.push(candidate.clone());
        self.handle.maybe_connect();
        Ok(())
    }

    async fn stop_media(&self) {
        let mut state = self.handle.state.lock();
        state.stop_count += 1;
        state.media_started = false;
    }

    async fn close(&self) -> CallResult<()> {
        self.handle.state.lock().close_count += 1;
        Ok(())
    }

    fn local_video_track(&self) -> Option<TrackHandle> {
        self.handle.state.lock().media_started.then(|| TrackHandle {
            id: "video".to_string(),
            stream_id: self.handle.label.clone(),
            kind: TrackKind::Video,
        })
    }

    fn remote_video_track(&self) -> Option<TrackHandle> {
        None
    }
}

/// Factory producing [`FakeBackend`]s and keeping their handles
pub struct FakeFactory {
    label: String,
    options: FakeOptions,
    created: Mutex<Vec<FakeHandle>>,
}

impl FakeFactory {
    pub fn new(label: &str, options: FakeOptions) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            options,
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    /// Handle of the most recently created backend
    pub fn last(&self) -> Option<FakeHandle> {
        self.created.lock().last().cloned()
    }

    /// Wait for the first backend and return its handle
    pub async fn backend(&self) -> FakeHandle {
        eventually(|| self.created_count() > 0, "peer backend creation").await;
        self.last().expect("backend created")
    }
}

#[async_trait]
impl PeerBackendFactory for FakeFactory {
    async fn create(
        &self,
        _config: &CallConfig,
        events: PeerEventSink,
    ) -> CallResult<Box<dyn PeerBackend>> {
        let handle = FakeHandle {
            label: self.label.clone(),
            options: self.options,
            state: Arc::new(Mutex::new(FakeState {
                sink: Some(events),
                ..FakeState::default()
            })),
        };
        self.created.lock().push(handle.clone());
        Ok(Box::new(FakeBackend { handle }))
    }
}

/// Orchestrator for `user` on a shared store
pub fn orchestrator(
    user: &str,
    config: CallConfig,
    store: &MemoryStore,
    peers: Arc<FakeFactory>,
) -> CallOrchestrator {
    CallOrchestrator::new(CallContext::new(
        user,
        config,
        Arc::new(store.clone()),
        peers,
    ))
    .expect("valid call context")
}
