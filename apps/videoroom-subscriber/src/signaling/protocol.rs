use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Subprotocol the gateway expects on the websocket upgrade.
pub const JANUS_SUBPROTOCOL: &str = "janus-protocol";

pub fn new_transaction() -> String {
    Uuid::new_v4().to_string()
}

/// Outgoing envelope: a transaction id plus the request kind.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    pub transaction: String,
    #[serde(flatten)]
    pub request: Request,
}

impl OutgoingMessage {
    pub fn new(request: Request) -> Self {
        Self {
            transaction: new_transaction(),
            request,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum Request {
    Create,
    Attach {
        session_id: u64,
        plugin: String,
    },
    Message {
        session_id: u64,
        handle_id: u64,
        body: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        jsep: Option<Jsep>,
    },
    Keepalive {
        session_id: u64,
    },
    Detach {
        session_id: u64,
        handle_id: u64,
    },
    Destroy {
        session_id: u64,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Create => "create",
            Request::Attach { .. } => "attach",
            Request::Message { .. } => "message",
            Request::Keepalive { .. } => "keepalive",
            Request::Detach { .. } => "detach",
            Request::Destroy { .. } => "destroy",
        }
    }

    /// Which reply finishes the transaction.
    pub fn completion(&self) -> Completion {
        match self {
            Request::Keepalive { .. } => Completion::Ack,
            Request::Message { .. } => Completion::Event,
            _ => Completion::Success,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// An `ack` is the final reply.
    Ack,
    /// A `success` is the final reply.
    Success,
    /// `ack` only acknowledges receipt; the asynchronous `event` (or a
    /// synchronous `success`) is the final reply.
    Event,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
    pub trickle: bool,
}

impl Jsep {
    /// A complete answer: every candidate is already in the SDP.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp: sdp.into(),
            trickle: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JoinRequest {
    request: &'static str,
    ptype: &'static str,
    pub room: u64,
    pub feed: u64,
}

impl JoinRequest {
    pub fn subscriber(room: u64, feed: u64) -> Self {
        Self {
            request: "join",
            ptype: "subscriber",
            room,
            feed,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StartRequest {
    request: &'static str,
    pub room: u64,
}

impl StartRequest {
    pub fn new(room: u64) -> Self {
        Self {
            request: "start",
            room,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PluginData {
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub data: Value,
}

impl PluginData {
    /// Plugins report request failures inside their data rather than as a
    /// gateway `error`.
    pub fn error(&self) -> Option<(i64, String)> {
        let reason = self.data.get("error")?.as_str()?.to_string();
        let code = self
            .data
            .get("error_code")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        Some((code, reason))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct IdData {
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum Incoming {
    Success {
        transaction: Option<String>,
        sender: Option<u64>,
        data: Option<IdData>,
        plugindata: Option<PluginData>,
    },
    Ack {
        transaction: Option<String>,
    },
    Event {
        transaction: Option<String>,
        sender: Option<u64>,
        plugindata: Option<PluginData>,
        jsep: Option<Value>,
    },
    Error {
        transaction: Option<String>,
        error: ErrorBody,
    },
    Webrtcup {
        sender: Option<u64>,
    },
    Media {
        sender: Option<u64>,
        #[serde(rename = "type")]
        media: String,
        #[serde(default)]
        receiving: bool,
    },
    Slowlink {
        sender: Option<u64>,
        #[serde(default)]
        uplink: bool,
        #[serde(default)]
        lost: u64,
    },
    Hangup {
        sender: Option<u64>,
        reason: Option<String>,
    },
    Detached {
        sender: Option<u64>,
    },
    Timeout {
        session_id: Option<u64>,
    },
    Trickle {
        sender: Option<u64>,
    },
    #[serde(other)]
    Unknown,
}

impl Incoming {
    pub fn transaction(&self) -> Option<&str> {
        match self {
            Incoming::Success { transaction, .. }
            | Incoming::Ack { transaction }
            | Incoming::Event { transaction, .. }
            | Incoming::Error { transaction, .. } => transaction.as_deref(),
            _ => None,
        }
    }

    pub fn sender(&self) -> Option<u64> {
        match self {
            Incoming::Success { sender, .. }
            | Incoming::Event { sender, .. }
            | Incoming::Webrtcup { sender }
            | Incoming::Media { sender, .. }
            | Incoming::Slowlink { sender, .. }
            | Incoming::Hangup { sender, .. }
            | Incoming::Detached { sender }
            | Incoming::Trickle { sender } => *sender,
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Incoming::Success { .. } => "success",
            Incoming::Ack { .. } => "ack",
            Incoming::Event { .. } => "event",
            Incoming::Error { .. } => "error",
            Incoming::Webrtcup { .. } => "webrtcup",
            Incoming::Media { .. } => "media",
            Incoming::Slowlink { .. } => "slowlink",
            Incoming::Hangup { .. } => "hangup",
            Incoming::Detached { .. } => "detached",
            Incoming::Timeout { .. } => "timeout",
            Incoming::Trickle { .. } => "trickle",
            Incoming::Unknown => "unknown",
        }
    }
}

/// Asynchronous notification delivered to a plugin handle.
#[derive(Debug, Clone, PartialEq)]
pub enum HandleEvent {
    SlowLink { uplink: bool, lost: u64 },
    Media { kind: String, receiving: bool },
    WebRtcUp,
    Hangup { reason: Option<String> },
    Detached,
    Plugin(Value),
}

impl HandleEvent {
    pub fn from_incoming(message: Incoming) -> Option<Self> {
        match message {
            Incoming::Slowlink { uplink, lost, .. } => Some(HandleEvent::SlowLink { uplink, lost }),
            Incoming::Media {
                media, receiving, ..
            } => Some(HandleEvent::Media {
                kind: media,
                receiving,
            }),
            Incoming::Webrtcup { .. } => Some(HandleEvent::WebRtcUp),
            Incoming::Hangup { reason, .. } => Some(HandleEvent::Hangup { reason }),
            Incoming::Detached { .. } => Some(HandleEvent::Detached),
            Incoming::Event { plugindata, .. } => Some(HandleEvent::Plugin(
                plugindata.map(|p| p.data).unwrap_or(Value::Null),
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_message_carries_subscriber_body() {
        let message = OutgoingMessage {
            transaction: "tx-1".into(),
            request: Request::Message {
                session_id: 11,
                handle_id: 22,
                body: serde_json::to_value(JoinRequest::subscriber(1234, 1000)).unwrap(),
                jsep: None,
            },
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "janus": "message",
                "transaction": "tx-1",
                "session_id": 11,
                "handle_id": 22,
                "body": {"request": "join", "ptype": "subscriber", "room": 1234, "feed": 1000}
            })
        );
    }

    #[test]
    fn start_message_carries_non_trickle_answer() {
        let message = OutgoingMessage {
            transaction: "tx-2".into(),
            request: Request::Message {
                session_id: 11,
                handle_id: 22,
                body: serde_json::to_value(StartRequest::new(1234)).unwrap(),
                jsep: Some(Jsep::answer("v=0\r\n")),
            },
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["body"], json!({"request": "start", "room": 1234}));
        assert_eq!(
            value["jsep"],
            json!({"type": "answer", "sdp": "v=0\r\n", "trickle": false})
        );
    }

    #[test]
    fn create_and_keepalive_envelopes() {
        let create = serde_json::to_value(OutgoingMessage {
            transaction: "a".into(),
            request: Request::Create,
        })
        .unwrap();
        assert_eq!(create, json!({"janus": "create", "transaction": "a"}));

        let keepalive = OutgoingMessage::new(Request::Keepalive { session_id: 9 });
        assert_eq!(keepalive.request.completion(), Completion::Ack);
        let value = serde_json::to_value(&keepalive).unwrap();
        assert_eq!(value["janus"], "keepalive");
        assert_eq!(value["session_id"], 9);
        assert_eq!(value["transaction"].as_str().unwrap().len(), 36);
    }

    #[test]
    fn parses_success_with_id() {
        let parsed: Incoming = serde_json::from_value(json!({
            "janus": "success",
            "transaction": "abc",
            "data": {"id": 4242}
        }))
        .unwrap();
        assert_eq!(parsed.transaction(), Some("abc"));
        assert!(matches!(
            parsed,
            Incoming::Success { data: Some(IdData { id: 4242 }), .. }
        ));
    }

    #[test]
    fn parses_event_with_jsep_and_sender() {
        let parsed: Incoming = serde_json::from_value(json!({
            "janus": "event",
            "session_id": 1,
            "sender": 77,
            "transaction": "t",
            "plugindata": {"plugin": "janus.plugin.videoroom", "data": {"videoroom": "attached"}},
            "jsep": {"type": "offer", "sdp": "v=0"}
        }))
        .unwrap();
        assert_eq!(parsed.sender(), Some(77));
        match parsed {
            Incoming::Event { jsep, plugindata, .. } => {
                assert_eq!(jsep.unwrap()["sdp"], "v=0");
                assert_eq!(plugindata.unwrap().data["videoroom"], "attached");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn parses_gateway_error() {
        let parsed: Incoming = serde_json::from_value(json!({
            "janus": "error",
            "transaction": "t",
            "error": {"code": 458, "reason": "No such session"}
        }))
        .unwrap();
        assert_eq!(
            parsed,
            Incoming::Error {
                transaction: Some("t".into()),
                error: ErrorBody {
                    code: 458,
                    reason: "No such session".into()
                }
            }
        );
    }

    #[test]
    fn unknown_kinds_are_tolerated() {
        let parsed: Incoming =
            serde_json::from_value(json!({"janus": "server_info", "transaction": "x"})).unwrap();
        assert_eq!(parsed, Incoming::Unknown);
    }

    #[test]
    fn handle_events_map_from_notifications() {
        let media: Incoming = serde_json::from_value(json!({
            "janus": "media", "sender": 5, "type": "video", "receiving": true
        }))
        .unwrap();
        assert_eq!(
            HandleEvent::from_incoming(media),
            Some(HandleEvent::Media {
                kind: "video".into(),
                receiving: true
            })
        );

        let slowlink: Incoming = serde_json::from_value(json!({
            "janus": "slowlink", "sender": 5, "uplink": false, "lost": 12
        }))
        .unwrap();
        assert_eq!(
            HandleEvent::from_incoming(slowlink),
            Some(HandleEvent::SlowLink {
                uplink: false,
                lost: 12
            })
        );

        let ack: Incoming = serde_json::from_value(json!({"janus": "ack"})).unwrap();
        assert_eq!(HandleEvent::from_incoming(ack), None);
    }

    #[test]
    fn plugin_errors_are_detected() {
        let data = PluginData {
            plugin: "janus.plugin.videoroom".into(),
            data: json!({"videoroom": "event", "error_code": 428, "error": "No such feed (1000)"}),
        };
        assert_eq!(data.error(), Some((428, "No such feed (1000)".to_string())));

        let ok = PluginData {
            plugin: "janus.plugin.videoroom".into(),
            data: json!({"videoroom": "attached", "room": 1234}),
        };
        assert_eq!(ok.error(), None);
    }
}
