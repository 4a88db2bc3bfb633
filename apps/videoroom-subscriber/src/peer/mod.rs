//! Receive-only peer connection built around a single remote offer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpHeaderExtensionCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use crate::config::PeerConfig;
use crate::subscription::{Answer, Offer};
use crate::supervisor::PeerTeardown;

pub mod feedback;

use feedback::{CCFB_FEEDBACK_PARAMETER, CCFB_FEEDBACK_TYPE, CcfbGeneratorBuilder};

pub const SDES_MID_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
pub const DTLS_RETRANSMISSION_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("failed to register default codecs: {0}")]
    Codecs(String),
    #[error("failed to register default interceptors: {0}")]
    Interceptors(String),
    #[error("failed to register header extension {uri}: {reason}")]
    HeaderExtension { uri: &'static str, reason: String },
    #[error("failed to create peer connection: {0}")]
    Connection(String),
    #[error("failed to add {kind} transceiver: {reason}")]
    Transceiver { kind: RTPCodecType, reason: String },
    #[error("remote offer rejected: {0}")]
    RemoteDescription(String),
    #[error("failed to create answer: {0}")]
    Answer(String),
    #[error("failed to apply local answer: {0}")]
    LocalDescription(String),
    #[error("ice gathering did not complete within {0:?}")]
    GatheringTimeout(Duration),
    #[error("peer connection has no local description after gathering")]
    MissingLocalDescription,
    #[error("failed to close peer connection: {0}")]
    Close(String),
}

/// Connection callbacks, delivered in the order the engine fires them.
#[derive(Clone)]
pub enum PeerEvent {
    IceConnectionStateChanged(RTCIceConnectionState),
    ConnectionStateChanged(RTCPeerConnectionState),
    TrackArrived(Arc<TrackRemote>),
    GatheringComplete,
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::IceConnectionStateChanged(state) => {
                f.debug_tuple("IceConnectionStateChanged").field(state).finish()
            }
            PeerEvent::ConnectionStateChanged(state) => {
                f.debug_tuple("ConnectionStateChanged").field(state).finish()
            }
            PeerEvent::TrackArrived(track) => f
                .debug_struct("TrackArrived")
                .field("ssrc", &track.ssrc())
                .field("id", &track.id())
                .finish(),
            PeerEvent::GatheringComplete => f.write_str("GatheringComplete"),
        }
    }
}

/// How media sections are laid out in the SDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpSemantics {
    UnifiedPlan,
}

impl std::fmt::Display for SdpSemantics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpSemantics::UnifiedPlan => f.write_str("unified-plan"),
        }
    }
}

/// DTLS, ECN and SDP-semantics settings the subscriber asks of the transport.
///
/// webrtc-rs has no knob for any of them: its `SettingEngine` exposes no DTLS
/// retransmission interval or ECN parsing, and it only speaks unified plan.
/// They are recorded and logged alongside the API they describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTiming {
    pub dtls_retransmission_interval: Duration,
    pub ecn_parsing: bool,
    pub sdp_semantics: SdpSemantics,
}

impl TransportTiming {
    pub fn for_config(config: &PeerConfig) -> Self {
        Self {
            dtls_retransmission_interval: DTLS_RETRANSMISSION_INTERVAL,
            ecn_parsing: config.feedback_enabled(),
            sdp_semantics: SdpSemantics::UnifiedPlan,
        }
    }
}

/// Whether the offer negotiates the MID header extension.
pub fn offer_uses_mid_extension(offer_sdp: &str) -> bool {
    offer_sdp.contains(SDES_MID_URI)
}

/// Media engine and interceptor registry for this offer and configuration.
pub fn build_media_engine(
    config: &PeerConfig,
    offer_sdp: &str,
) -> Result<(MediaEngine, Registry), PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|err| PeerError::Codecs(err.to_string()))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|err| PeerError::Interceptors(err.to_string()))?;

    if offer_uses_mid_extension(offer_sdp) {
        media_engine
            .register_header_extension(
                RTCRtpHeaderExtensionCapability {
                    uri: SDES_MID_URI.to_string(),
                },
                RTPCodecType::Audio,
                None,
            )
            .map_err(|err| PeerError::HeaderExtension {
                uri: SDES_MID_URI,
                reason: err.to_string(),
            })?;
        trace!(target = "peer", uri = SDES_MID_URI, "registered audio header extension");
    }

    if let Some(feedback) = config.feedback {
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            media_engine.register_feedback(
                RTCPFeedback {
                    typ: CCFB_FEEDBACK_TYPE.to_string(),
                    parameter: CCFB_FEEDBACK_PARAMETER.to_string(),
                },
                kind,
            );
        }
        registry.add(Box::new(CcfbGeneratorBuilder::new(feedback.report_interval)));
        debug!(
            target = "peer",
            interval_ms = feedback.report_interval.as_millis() as u64,
            "registered rfc8888 feedback"
        );
    }

    Ok((media_engine, registry))
}

fn build_api(config: &PeerConfig, offer_sdp: &str) -> Result<API, PeerError> {
    let (media_engine, registry) = build_media_engine(config, offer_sdp)?;
    let timing = TransportTiming::for_config(config);
    debug!(
        target = "peer",
        dtls_retransmission_ms = timing.dtls_retransmission_interval.as_millis() as u64,
        ecn_parsing = timing.ecn_parsing,
        sdp_semantics = %timing.sdp_semantics,
        "transport timing"
    );

    Ok(APIBuilder::new()
        .with_setting_engine(SettingEngine::default())
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_configuration(config: &PeerConfig) -> RTCConfiguration {
    let urls = config.ice_server_urls();
    let ice_servers = if urls.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls,
            ..Default::default()
        }]
    };
    RTCConfiguration {
        ice_servers,
        ice_transport_policy: RTCIceTransportPolicy::All,
        ..Default::default()
    }
}

/// The local end of the subscription's media transport.
pub struct PeerSession {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerSession {
    /// Build the connection for `offer` with callbacks and both
    /// receive-only transceivers in place. The offer is not applied yet.
    pub async fn build(
        config: &PeerConfig,
        offer: &Offer,
    ) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        let api = build_api(config, &offer.sdp)?;
        let pc = Arc::new(
            api.new_peer_connection(rtc_configuration(config))
                .await
                .map_err(|err| PeerError::Connection(err.to_string()))?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let ice_tx = events_tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            info!(target = "peer", %state, "ice connection state changed");
            let _ = ice_tx.send(PeerEvent::IceConnectionStateChanged(state));
            Box::pin(async {})
        }));

        let state_tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            info!(target = "peer", %state, "peer connection state changed");
            let _ = state_tx.send(PeerEvent::ConnectionStateChanged(state));
            Box::pin(async {})
        }));

        let track_tx = events_tx.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            info!(
                target = "peer",
                ssrc = track.ssrc(),
                payload_type = track.payload_type(),
                mime_type = %track.codec().capability.mime_type,
                "track arrived"
            );
            let _ = track_tx.send(PeerEvent::TrackArrived(track));
            Box::pin(async {})
        }));

        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .map_err(|err| PeerError::Transceiver {
                kind,
                reason: err.to_string(),
            })?;
        }

        Ok((
            Self {
                pc,
                events: events_tx,
            },
            events_rx,
        ))
    }

    /// Apply the offer and return the answer once ICE gathering finished.
    ///
    /// The returned SDP already carries every local candidate.
    pub async fn answer(
        &self,
        offer: &Offer,
        gather_timeout: Option<Duration>,
    ) -> Result<Answer, PeerError> {
        let remote = RTCSessionDescription::offer(offer.sdp.clone())
            .map_err(|err| PeerError::RemoteDescription(err.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|err| PeerError::RemoteDescription(err.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| PeerError::Answer(err.to_string()))?;
        let mut gather = self.pc.gathering_complete_promise().await;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|err| PeerError::LocalDescription(err.to_string()))?;

        trace!(target = "peer", awaiting = "gather.recv", state = "start");
        match gather_timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, gather.recv()).await.is_err() {
                    return Err(PeerError::GatheringTimeout(limit));
                }
            }
            None => {
                let _ = gather.recv().await;
            }
        }
        trace!(target = "peer", awaiting = "gather.recv", state = "end");
        let _ = self.events.send(PeerEvent::GatheringComplete);

        let local = self
            .pc
            .local_description()
            .await
            .ok_or(PeerError::MissingLocalDescription)?;
        Ok(Answer { sdp: local.sdp })
    }

    pub async fn local_description(&self) -> Option<String> {
        self.pc.local_description().await.map(|desc| desc.sdp)
    }

    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    pub async fn close(&self) -> Result<(), PeerError> {
        self.pc
            .close()
            .await
            .map_err(|err| PeerError::Close(err.to_string()))
    }
}

#[async_trait]
impl PeerTeardown for PeerSession {
    async fn teardown(&self) {
        if let Err(err) = self.close().await {
            debug!(target = "peer", error = %err, "peer connection close reported an error");
        }
    }
}
