//! Join/start exchange with the videoroom plugin.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::signaling::{
    JoinRequest, Jsep, PluginMessenger, PluginResponse, SignalingError, StartRequest,
};
use crate::telemetry::printable_sdp;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("join response carried no session description")]
    MissingOffer,
    #[error("join response session description has no string sdp field")]
    SdpNotString,
    #[error("failed to encode {request} body: {source}")]
    Encode {
        request: &'static str,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Offer {
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub sdp: String,
}

/// The part of a join response the subscriber needs.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinResponse {
    pub offer: Offer,
    pub plugin_data: Value,
}

impl JoinResponse {
    pub fn from_response(response: PluginResponse) -> Result<Self, NegotiationError> {
        let jsep = response.jsep.ok_or(NegotiationError::MissingOffer)?;
        let sdp = jsep
            .get("sdp")
            .and_then(Value::as_str)
            .ok_or(NegotiationError::SdpNotString)?;
        Ok(Self {
            offer: Offer {
                sdp: sdp.to_string(),
            },
            plugin_data: response.plugin_data.map(|p| p.data).unwrap_or(Value::Null),
        })
    }
}

/// Ask the plugin to subscribe to `feed` in `room` and return its offer.
pub async fn join(
    messenger: &dyn PluginMessenger,
    room: u64,
    feed: u64,
) -> Result<JoinResponse, NegotiationError> {
    let body = serde_json::to_value(JoinRequest::subscriber(room, feed))
        .map_err(|source| NegotiationError::Encode {
            request: "join",
            source,
        })?;
    let response = messenger.send_message(body, None).await?;
    let joined = JoinResponse::from_response(response)?;
    info!(room, feed, "joined videoroom as subscriber");
    debug!(sdp = %printable_sdp(&joined.offer.sdp), "received offer");
    Ok(joined)
}

/// Hand the complete, non-trickled answer to the plugin.
pub async fn start(
    messenger: &dyn PluginMessenger,
    room: u64,
    answer: &Answer,
) -> Result<PluginResponse, NegotiationError> {
    let body = serde_json::to_value(StartRequest::new(room)).map_err(|source| {
        NegotiationError::Encode {
            request: "start",
            source,
        }
    })?;
    debug!(sdp = %printable_sdp(&answer.sdp), "sending answer");
    let response = messenger
        .send_message(body, Some(Jsep::answer(answer.sdp.clone())))
        .await?;
    info!(room, "subscription started");
    Ok(response)
}

/// Whether RFC 8888 feedback survived into the local answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackStatus {
    Disabled,
    Negotiated,
    NotNegotiated,
}

impl FeedbackStatus {
    pub fn observe(enabled: bool, answer_sdp: &str) -> Self {
        if !enabled {
            return FeedbackStatus::Disabled;
        }
        let negotiated = answer_sdp
            .lines()
            .any(|line| line.starts_with("a=rtcp-fb:") && line.contains("ack ccfb"));
        if negotiated {
            FeedbackStatus::Negotiated
        } else {
            FeedbackStatus::NotNegotiated
        }
    }

    pub fn enabled(self) -> bool {
        self != FeedbackStatus::Disabled
    }

    pub fn negotiated(self) -> bool {
        self == FeedbackStatus::Negotiated
    }

    /// One status line per run, whether or not feedback was requested.
    pub fn log(self, interval: Option<Duration>) {
        info!(
            enabled = self.enabled(),
            interval_ms = interval.map(|interval| interval.as_millis() as u64),
            negotiated = self.negotiated(),
            "RFC 8888 status"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::PluginData;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recorder {
        reply: Mutex<Option<Result<PluginResponse, SignalingError>>>,
        sent: Mutex<Vec<(Value, Option<Jsep>)>>,
    }

    impl Recorder {
        fn replying(reply: Result<PluginResponse, SignalingError>) -> Self {
            Self {
                reply: Mutex::new(Some(reply)),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PluginMessenger for Recorder {
        async fn send_message(
            &self,
            body: Value,
            jsep: Option<Jsep>,
        ) -> Result<PluginResponse, SignalingError> {
            self.sent.lock().push((body, jsep));
            self.reply
                .lock()
                .take()
                .unwrap_or(Err(SignalingError::Closed))
        }
    }

    fn attached(jsep: Option<Value>) -> PluginResponse {
        PluginResponse {
            plugin_data: Some(PluginData {
                plugin: "janus.plugin.videoroom".into(),
                data: json!({"videoroom": "attached", "room": 1234}),
            }),
            jsep,
        }
    }

    #[tokio::test]
    async fn join_sends_subscriber_body_and_returns_offer() {
        let recorder = Recorder::replying(Ok(attached(Some(
            json!({"type": "offer", "sdp": "v=0\r\n"}),
        ))));
        let joined = join(&recorder, 1234, 1000).await.unwrap();
        assert_eq!(joined.offer.sdp, "v=0\r\n");
        assert_eq!(joined.plugin_data["videoroom"], "attached");

        let sent = recorder.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].0,
            json!({"request": "join", "ptype": "subscriber", "room": 1234, "feed": 1000})
        );
        assert!(sent[0].1.is_none());
    }

    #[tokio::test]
    async fn join_without_jsep_is_missing_offer() {
        let recorder = Recorder::replying(Ok(attached(None)));
        assert!(matches!(
            join(&recorder, 1, 2).await,
            Err(NegotiationError::MissingOffer)
        ));
    }

    #[tokio::test]
    async fn join_with_non_string_sdp_is_distinguished() {
        for jsep in [json!({"type": "offer", "sdp": 42}), json!({"type": "offer"})] {
            let recorder = Recorder::replying(Ok(attached(Some(jsep))));
            assert!(matches!(
                join(&recorder, 1, 2).await,
                Err(NegotiationError::SdpNotString)
            ));
        }
    }

    #[tokio::test]
    async fn join_propagates_signaling_errors() {
        let recorder = Recorder::replying(Err(SignalingError::Plugin {
            code: 428,
            reason: "No such feed".into(),
        }));
        assert!(matches!(
            join(&recorder, 1, 2).await,
            Err(NegotiationError::Signaling(SignalingError::Plugin { code: 428, .. }))
        ));
    }

    #[tokio::test]
    async fn start_sends_answer_without_trickle() {
        let recorder = Recorder::replying(Ok(PluginResponse::default()));
        let answer = Answer {
            sdp: "v=0\r\na=end-of-candidates\r\n".into(),
        };
        start(&recorder, 1234, &answer).await.unwrap();

        let sent = recorder.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, json!({"request": "start", "room": 1234}));
        let jsep = sent[0].1.as_ref().unwrap();
        assert_eq!(jsep.kind, "answer");
        assert_eq!(jsep.sdp, answer.sdp);
        assert!(!jsep.trickle);
    }

    #[test]
    fn feedback_status_reads_rtcp_fb_lines() {
        let with = "v=0\r\na=rtcp-fb:111 ack ccfb\r\n";
        let wildcard = "v=0\r\na=rtcp-fb:* ack ccfb\r\n";
        let without = "v=0\r\na=rtcp-fb:96 nack\r\n";
        assert_eq!(FeedbackStatus::observe(false, with), FeedbackStatus::Disabled);
        assert_eq!(FeedbackStatus::observe(true, with), FeedbackStatus::Negotiated);
        assert_eq!(FeedbackStatus::observe(true, wildcard), FeedbackStatus::Negotiated);
        assert_eq!(
            FeedbackStatus::observe(true, without),
            FeedbackStatus::NotNegotiated
        );
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn logged(status: FeedbackStatus, interval: Option<Duration>) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, || status.log(interval));
        let bytes = captured.0.lock().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn feedback_status_is_always_logged() {
        let disabled = logged(FeedbackStatus::Disabled, None);
        assert!(disabled.contains("RFC 8888 status"), "{disabled}");
        assert!(disabled.contains("enabled=false"), "{disabled}");
        assert!(disabled.contains("negotiated=false"), "{disabled}");

        let negotiated = logged(FeedbackStatus::Negotiated, Some(Duration::from_millis(250)));
        assert!(negotiated.contains("enabled=true"), "{negotiated}");
        assert!(negotiated.contains("interval_ms=250"), "{negotiated}");
        assert!(negotiated.contains("negotiated=true"), "{negotiated}");

        let missing = logged(FeedbackStatus::NotNegotiated, Some(Duration::from_millis(100)));
        assert!(missing.contains("enabled=true"), "{missing}");
        assert!(missing.contains("interval_ms=100"), "{missing}");
        assert!(missing.contains("negotiated=false"), "{missing}");
    }
}
