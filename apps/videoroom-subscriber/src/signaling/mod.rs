//! Janus control plane: websocket transport, sessions, plugin handles and
//! their asynchronous event feeds.

use thiserror::Error;

pub mod client;
pub mod protocol;
pub mod session;

pub use client::GatewayClient;
pub use protocol::{HandleEvent, Jsep, JoinRequest, StartRequest};
pub use session::{Handle, PluginMessenger, PluginResponse, Session, spawn_event_drain};

/// Plugin every subscription attaches to.
pub const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("failed to connect to janus at {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("janus rejected {request}: {reason} (code {code})")]
    Rejected {
        request: &'static str,
        code: i64,
        reason: String,
    },
    #[error("plugin error: {reason} (code {code})")]
    Plugin { code: i64, reason: String },
    #[error("signaling connection closed")]
    Closed,
    #[error("unexpected {received} reply to {request}")]
    UnexpectedResponse {
        request: &'static str,
        received: &'static str,
    },
    #[error("failed to encode {request}: {source}")]
    Encode {
        request: &'static str,
        source: serde_json::Error,
    },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}
