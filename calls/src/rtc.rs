//! webrtc-rs peer connection backend

use crate::{
    config::{CallConfig, IceTransportPolicy},
    error::{CallError, CallResult},
    peer_connection::{PeerBackend, PeerBackendFactory, PeerEvent, PeerEventSink},
    types::{IceCandidate, IceConnectionState, SdpType, SessionDescription, TrackHandle, TrackKind},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors,
        media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8},
        APIBuilder,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_connection_state::RTCIceConnectionState,
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    media::Sample,
    peer_connection::{
        configuration::RTCConfiguration,
        policy::ice_transport_policy::RTCIceTransportPolicy,
        sdp::session_description::RTCSessionDescription,
        RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTPCodecType},
        rtp_receiver::RTCRtpReceiver,
        RTCRtpTransceiver,
    },
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

/// Opus frame encoding 20 ms of silence
const OPUS_SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Duration of one audio frame
const AUDIO_FRAME: Duration = Duration::from_millis(20);

/// Local camera and microphone tracks
pub struct LocalMedia {
    /// Microphone track (opus)
    pub audio: Arc<TrackLocalStaticSample>,
    /// Camera track (VP8)
    pub video: Arc<TrackLocalStaticSample>,
    /// Task writing captured samples into the tracks, if any
    pub capture: Option<JoinHandle<()>>,
}

/// Acquires local media for a call
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Open camera and microphone. Fails with [`CallError::Media`] when
    /// devices are missing or permission was not granted.
    async fn acquire(&self) -> CallResult<LocalMedia>;
}

/// Media source backed by sample tracks the application writes into
///
/// The presentation layer asks the user for camera/microphone permission and
/// reports the outcome here. Optionally feeds opus silence so the audio
/// track carries packets before real capture is wired in.
#[derive(Debug, Clone)]
pub struct SampleTrackSource {
    permission_granted: bool,
    feed_silence: bool,
}

impl SampleTrackSource {
    /// Source whose permission state is `permission_granted`
    pub fn new(permission_granted: bool) -> Self {
        Self {
            permission_granted,
            feed_silence: false,
        }
    }

    /// Write opus silence into the audio track while media is running
    pub fn with_silence(mut self) -> Self {
        self.feed_silence = true;
        self
    }
}

#[async_trait]
impl MediaSource for SampleTrackSource {
    async fn acquire(&self) -> CallResult<LocalMedia> {
        if !self.permission_granted {
            return Err(CallError::Media(
                "camera/microphone permission not granted".to_string(),
            ));
        }

        let stream_id = format!("callrtc-{}", uuid::Uuid::new_v4());
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            stream_id.clone(),
        ));
        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            stream_id,
        ));

        let capture = self.feed_silence.then(|| {
            let track = audio.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(AUDIO_FRAME);
                loop {
                    ticker.tick().await;
                    let sample = Sample {
                        data: bytes::Bytes::from_static(&OPUS_SILENCE_FRAME),
                        duration: AUDIO_FRAME,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        tracing::debug!("Silence feed stopped: {}", e);
                        break;
                    }
                }
            })
        });

        Ok(LocalMedia {
            audio,
            video,
            capture,
        })
    }
}

/// Creates [`RtcPeerBackend`]s sharing one media source
pub struct RtcBackendFactory {
    media: Arc<dyn MediaSource>,
}

impl RtcBackendFactory {
    /// Factory acquiring media from `media`
    pub fn new(media: Arc<dyn MediaSource>) -> Self {
        Self { media }
    }
}

#[async_trait]
impl PeerBackendFactory for RtcBackendFactory {
    async fn create(
        &self,
        config: &CallConfig,
        events: PeerEventSink,
    ) -> CallResult<Box<dyn PeerBackend>> {
        let backend = RtcPeerBackend::new(config, self.media.clone(), events).await?;
        Ok(Box::new(backend))
    }
}

/// Real WebRTC peer connection wrapper
pub struct RtcPeerBackend {
    /// Underlying WebRTC peer connection
    peer_connection: Arc<RTCPeerConnection>,

    /// Where camera and microphone come from
    media_source: Arc<dyn MediaSource>,

    /// Tracks and capture task while media runs
    local_media: Mutex<Option<LocalMedia>>,

    /// Remote video track, filled by the `on_track` callback
    remote_video: Arc<Mutex<Option<TrackHandle>>>,
}

impl RtcPeerBackend {
    /// Create a peer connection configured from `config`
    pub async fn new(
        config: &CallConfig,
        media_source: Arc<dyn MediaSource>,
        events: PeerEventSink,
    ) -> CallResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(|e| {
            CallError::Internal(format!("Failed to register codecs: {}", e))
        })?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| CallError::Internal(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ice_transport_policy: match config.ice_transport_policy {
                IceTransportPolicy::All => RTCIceTransportPolicy::All,
                IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
            },
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            CallError::Internal(format!("Failed to create peer connection: {}", e))
        })?);

        let remote_video = Arc::new(Mutex::new(None));
        install_callbacks(&peer_connection, events, remote_video.clone());

        Ok(Self {
            peer_connection,
            media_source,
            local_media: Mutex::new(None),
            remote_video,
        })
    }
}

fn ice_servers(config: &CallConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();

    for stun_url in &config.stun_servers {
        servers.push(RTCIceServer {
            urls: vec![stun_url.clone()],
            ..Default::default()
        });
    }

    for turn_server in &config.turn_servers {
        servers.push(RTCIceServer {
            urls: turn_server.urls.clone(),
            username: turn_server.username.clone(),
            credential: turn_server.credential.clone(),
            ..Default::default()
        });
    }

    servers
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(IceConnectionState::New),
        RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(IceConnectionState::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
        _ => None,
    }
}

fn install_callbacks(
    peer_connection: &RTCPeerConnection,
    events: PeerEventSink,
    remote_video: Arc<Mutex<Option<TrackHandle>>>,
) {
    let candidate_events = events.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            // None marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => events.emit(PeerEvent::LocalIceCandidate(IceCandidate::new(
                    init.sdp_mid.unwrap_or_default(),
                    init.sdp_mline_index.unwrap_or(0),
                    init.candidate,
                ))),
                Err(e) => tracing::warn!("Failed to serialize local ICE candidate: {}", e),
            }
        })
    }));

    let state_events = events.clone();
    peer_connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        tracing::debug!("ICE connection state: {}", state);
        if let Some(mapped) = map_ice_state(state) {
            state_events.emit(PeerEvent::IceConnectionStateChanged(mapped));
        }
        Box::pin(async {})
    }));

    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let handle = TrackHandle {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
            };
            tracing::info!(id = %handle.id, kind = ?kind, "Remote track added");
            if kind == TrackKind::Video {
                *remote_video.lock() = Some(handle.clone());
            }
            events.emit(PeerEvent::RemoteTrackAdded(handle));
            Box::pin(async {})
        },
    ));
}

fn native_description(sdp: &SessionDescription) -> CallResult<RTCSessionDescription> {
    let result = match sdp.kind {
        SdpType::Offer => RTCSessionDescription::offer(sdp.description.clone()),
        SdpType::Answer => RTCSessionDescription::answer(sdp.description.clone()),
    };
    result.map_err(|e| CallError::Negotiation(format!("Invalid SDP {:?}: {}", sdp.kind, e)))
}

#[async_trait]
impl PeerBackend for RtcPeerBackend {
    async fn start_media(&self) -> CallResult<()> {
        if self.local_media.lock().is_some() {
            return Ok(());
        }
        let media = self.media_source.acquire().await?;
        *self.local_media.lock() = Some(media);
        Ok(())
    }

    async fn attach_media(&self) -> CallResult<()> {
        let tracks = self
            .local_media
            .lock()
            .as_ref()
            .map(|m| (m.audio.clone(), m.video.clone()));
        let Some((audio, video)) = tracks else {
            return Err(CallError::Media("local media not started".to_string()));
        };

        for track in [audio, video] {
            let sender = self
                .peer_connection
                .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| CallError::Internal(format!("Failed to add track: {}", e)))?;

            // Drain RTCP so interceptors keep working
            tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while sender.read(&mut rtcp_buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn create_offer(&self) -> CallResult<SessionDescription> {
        let offer = self.peer_connection.create_offer(None).await.map_err(|e| {
            CallError::Internal(format!("Failed to create offer: {}", e))
        })?;

        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| CallError::Internal(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> CallResult<SessionDescription> {
        let answer = self.peer_connection.create_answer(None).await.map_err(|e| {
            CallError::Internal(format!("Failed to create answer: {}", e))
        })?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| CallError::Internal(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, sdp: &SessionDescription) -> CallResult<()> {
        let description = native_description(sdp)?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| CallError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> CallResult<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.sdp.clone(),
            sdp_mid: Some(candidate.sdp_mid.clone()),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| CallError::Negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn stop_media(&self) {
        let media = self.local_media.lock().take();
        if let Some(media) = media {
            if let Some(capture) = media.capture {
                capture.abort();
            }
        }
    }

    async fn close(&self) -> CallResult<()> {
        self.peer_connection.close().await.map_err(|e| {
            CallError::Internal(format!("Failed to close peer connection: {}", e))
        })
    }

    fn local_video_track(&self) -> Option<TrackHandle> {
        self.local_media.lock().as_ref().map(|m| TrackHandle {
            id: m.video.id().to_string(),
            stream_id: m.video.stream_id().to_string(),
            kind: TrackKind::Video,
        })
    }

    fn remote_video_track(&self) -> Option<TrackHandle> {
        self.remote_video.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServer;

    #[test]
    fn test_ice_servers_include_turn_fallbacks() {
        let mut config = CallConfig::default();
        config.turn_servers.push(TurnServer {
            urls: vec![
                "turn:relay.example.com:3478".into(),
                "turn:relay.example.com:443?transport=tcp".into(),
                "turns:relay.example.com:443?transport=tcp".into(),
            ],
            username: "user".into(),
            credential: "secret".into(),
        });

        let servers = ice_servers(&config);
        assert_eq!(servers.len(), 3);
        assert_eq!(servers[2].urls.len(), 3);
        assert_eq!(servers[2].username, "user");
        assert!(servers[0].username.is_empty());
    }

    #[test]
    fn test_ice_state_mapping() {
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Completed),
            Some(IceConnectionState::Connected)
        );
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Checking),
            Some(IceConnectionState::Checking)
        );
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Failed),
            Some(IceConnectionState::Failed)
        );
        assert_eq!(map_ice_state(RTCIceConnectionState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_permission_denied_is_media_error() {
        let source = SampleTrackSource::new(false);
        let err = source.acquire().await.err().unwrap();
        assert!(matches!(err, CallError::Media(_)));
    }

    #[tokio::test]
    async fn test_silence_feed_stops_with_media() {
        let media = SampleTrackSource::new(true).with_silence().acquire().await.unwrap();
        let capture = media.capture.expect("silence feed running");
        capture.abort();
        assert!(capture.await.unwrap_err().is_cancelled());
    }
}
