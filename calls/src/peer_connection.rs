//! Peer connection management
//!
//! [`PeerConnectionManager`] owns the native peer connection (behind the
//! [`PeerBackend`] seam) and the negotiation bookkeeping that must not depend
//! on the native stack: whether media is ready, whether a local offer is
//! outstanding, and the buffer of remote ICE candidates that arrived before
//! the remote description.

use crate::{
    config::CallConfig,
    error::{CallError, CallResult},
    types::{IceCandidate, IceConnectionState, SdpType, SessionDescription, TrackHandle},
};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Event raised by a native peer connection callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be published
    LocalIceCandidate(IceCandidate),
    /// The ICE connection state changed
    IceConnectionStateChanged(IceConnectionState),
    /// The remote side started sending a track
    RemoteTrackAdded(TrackHandle),
}

/// Where a backend delivers [`PeerEvent`]s
///
/// Native callbacks fire on arbitrary threads; the sink only forwards, it
/// never touches call state.
#[derive(Clone)]
pub struct PeerEventSink(Arc<dyn Fn(PeerEvent) + Send + Sync>);

impl PeerEventSink {
    /// Sink calling `f` for every event
    pub fn new(f: impl Fn(PeerEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Forward one event
    pub fn emit(&self, event: PeerEvent) {
        (self.0)(event)
    }
}

impl fmt::Debug for PeerEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PeerEventSink")
    }
}

/// Native peer connection operations
///
/// Implementations own the native objects. Every method is called from the
/// orchestrator worker only, one at a time.
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Acquire camera and microphone and create local tracks
    async fn start_media(&self) -> CallResult<()>;

    /// Add the local tracks to the peer connection
    async fn attach_media(&self) -> CallResult<()>;

    /// Create an offer and set it as the local description
    async fn create_offer(&self) -> CallResult<SessionDescription>;

    /// Create an answer and set it as the local description
    async fn create_answer(&self) -> CallResult<SessionDescription>;

    /// Apply a remote offer or answer
    async fn set_remote_description(&self, sdp: &SessionDescription) -> CallResult<()>;

    /// Apply one remote candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> CallResult<()>;

    /// Stop media capture
    async fn stop_media(&self);

    /// Close the peer connection and release native handles
    async fn close(&self) -> CallResult<()>;

    /// Local camera track, if media is running
    fn local_video_track(&self) -> Option<TrackHandle>;

    /// Remote video track, once received
    fn remote_video_track(&self) -> Option<TrackHandle>;
}

/// Creates one backend per call
#[async_trait]
pub trait PeerBackendFactory: Send + Sync {
    /// Build a backend that reports native events to `events`
    async fn create(
        &self,
        config: &CallConfig,
        events: PeerEventSink,
    ) -> CallResult<Box<dyn PeerBackend>>;
}

/// What happened to a remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Held until the remote description is applied
    Buffered,
    /// Handed to the native peer connection
    Applied,
}

/// Negotiation-aware wrapper around a [`PeerBackend`]
pub struct PeerConnectionManager {
    backend: Option<Box<dyn PeerBackend>>,
    media_ready: bool,
    media_attached: bool,
    offer_outstanding: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    applied_candidates: usize,
}

impl PeerConnectionManager {
    /// Wrap a freshly created backend
    pub fn new(backend: Box<dyn PeerBackend>) -> Self {
        Self {
            backend: Some(backend),
            media_ready: false,
            media_attached: false,
            offer_outstanding: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            applied_candidates: 0,
        }
    }

    fn backend(&self) -> CallResult<&dyn PeerBackend> {
        self.backend.as_deref().ok_or(CallError::Disposed)
    }

    /// Whether [`PeerConnectionManager::dispose`] ran
    pub fn is_disposed(&self) -> bool {
        self.backend.is_none()
    }

    /// Whether a local offer is waiting for its answer
    pub fn has_outstanding_offer(&self) -> bool {
        self.offer_outstanding
    }

    /// Whether a remote description has been applied
    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// Remote candidates waiting for the remote description
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Remote candidates handed to the native connection so far
    pub fn applied_candidate_count(&self) -> usize {
        self.applied_candidates
    }

    /// Acquire camera and microphone. Idempotent.
    pub async fn initialize_media(&mut self) -> CallResult<()> {
        if self.media_ready {
            return Ok(());
        }
        self.backend()?.start_media().await.map_err(|e| match e {
            CallError::Media(msg) => CallError::Media(msg),
            other => CallError::Media(other.to_string()),
        })?;
        self.media_ready = true;
        tracing::debug!("Local media initialized");
        Ok(())
    }

    async fn ensure_media_attached(&mut self) -> CallResult<()> {
        if !self.media_attached {
            self.backend()?.attach_media().await?;
            self.media_attached = true;
        }
        Ok(())
    }

    /// Generate an offer and set it as the local description
    pub async fn create_offer(&mut self) -> CallResult<SessionDescription> {
        self.backend()?;
        if !self.media_ready {
            return Err(CallError::Negotiation(
                "cannot create an offer before media is initialized".to_string(),
            ));
        }
        if self.offer_outstanding {
            return Err(CallError::Negotiation(
                "an offer is already outstanding".to_string(),
            ));
        }

        self.ensure_media_attached().await?;
        let offer = self.backend()?.create_offer().await?;
        self.offer_outstanding = true;

        tracing::info!("Created local offer");
        Ok(offer)
    }

    /// Apply a remote offer and answer it
    pub async fn create_answer(&mut self, offer: &SessionDescription) -> CallResult<SessionDescription> {
        self.backend()?;
        if offer.kind != SdpType::Offer {
            return Err(CallError::Negotiation(
                "create_answer needs a remote offer".to_string(),
            ));
        }
        if self.remote_description_set {
            return Err(CallError::Negotiation(
                "remote offer already applied".to_string(),
            ));
        }
        if !self.media_ready {
            return Err(CallError::Negotiation(
                "cannot answer before media is initialized".to_string(),
            ));
        }

        self.backend()?.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.flush_pending_candidates().await;

        self.ensure_media_attached().await?;
        let answer = self.backend()?.create_answer().await?;

        tracing::info!("Created local answer");
        Ok(answer)
    }

    /// Apply the remote answer to our outstanding offer
    pub async fn apply_remote_answer(&mut self, answer: &SessionDescription) -> CallResult<()> {
        self.backend()?;
        if answer.kind != SdpType::Answer {
            return Err(CallError::Negotiation(
                "apply_remote_answer needs an answer".to_string(),
            ));
        }
        if !self.offer_outstanding {
            return Err(CallError::Negotiation(
                "received an answer without an outstanding offer".to_string(),
            ));
        }

        self.backend()?.set_remote_description(answer).await?;
        self.offer_outstanding = false;
        self.remote_description_set = true;
        self.flush_pending_candidates().await;

        tracing::info!("Applied remote answer");
        Ok(())
    }

    /// Apply a remote candidate, or buffer it until the remote description
    /// is set
    pub async fn add_remote_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> CallResult<CandidateDisposition> {
        self.backend()?;
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            tracing::debug!(
                pending = self.pending_candidates.len(),
                "Buffered remote ICE candidate"
            );
            return Ok(CandidateDisposition::Buffered);
        }

        self.backend()?.add_ice_candidate(&candidate).await?;
        self.applied_candidates += 1;
        Ok(CandidateDisposition::Applied)
    }

    /// Replay buffered candidates in arrival order. A candidate the native
    /// stack rejects is logged; the rest still apply.
    async fn flush_pending_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_candidates);
        let total = pending.len();

        let Some(backend) = self.backend.as_deref() else {
            return;
        };
        for candidate in &pending {
            match backend.add_ice_candidate(candidate).await {
                Ok(()) => self.applied_candidates += 1,
                Err(e) => tracing::warn!("Dropping buffered ICE candidate: {}", e),
            }
        }
        tracing::debug!(count = total, "Flushed buffered ICE candidates");
    }

    /// Local camera track, if media is running
    pub fn local_video_track(&self) -> Option<TrackHandle> {
        self.backend.as_ref().and_then(|b| b.local_video_track())
    }

    /// Remote video track, once received
    pub fn remote_video_track(&self) -> Option<TrackHandle> {
        self.backend.as_ref().and_then(|b| b.remote_video_track())
    }

    /// Stop capture and release the native connection. Idempotent.
    pub async fn dispose(&mut self) {
        let Some(backend) = self.backend.take() else {
            return;
        };
        backend.stop_media().await;
        if let Err(e) = backend.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
        self.pending_candidates.clear();
        self.media_ready = false;
        self.media_attached = false;
        self.offer_outstanding = false;
        tracing::info!("Peer connection disposed");
    }
}
