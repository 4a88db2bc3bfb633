use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::SignalingError;
use super::client::GatewayClient;
use super::protocol::{HandleEvent, Incoming, Jsep, PluginData, Request};

/// A Janus session: the container for plugin handles.
pub struct Session {
    client: Arc<GatewayClient>,
    id: u64,
}

impl Session {
    pub async fn create(client: Arc<GatewayClient>) -> Result<Self, SignalingError> {
        let reply = client.transact(Request::Create).await?;
        let id = success_id("create", reply)?;
        debug!(target = "signaling", session_id = id, "janus session created");
        Ok(Self { client, id })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> &Arc<GatewayClient> {
        &self.client
    }

    pub async fn attach(&self, plugin: &str) -> Result<Handle, SignalingError> {
        let reply = self
            .client
            .transact(Request::Attach {
                session_id: self.id,
                plugin: plugin.to_string(),
            })
            .await?;
        let handle_id = success_id("attach", reply)?;
        let events = self.client.register_handle(handle_id)?;
        debug!(
            target = "signaling",
            session_id = self.id,
            handle_id,
            plugin,
            "plugin handle attached"
        );
        Ok(Handle {
            client: Arc::clone(&self.client),
            session_id: self.id,
            id: handle_id,
            events: Mutex::new(Some(events)),
        })
    }

    pub async fn keepalive(&self) -> Result<(), SignalingError> {
        self.client
            .transact(Request::Keepalive {
                session_id: self.id,
            })
            .await
            .map(|_| ())
    }

    /// Refresh the session now and then every `period` until a keepalive fails.
    pub fn spawn_keepalive(&self, period: Duration) -> JoinHandle<()> {
        let client = Arc::clone(&self.client);
        let session_id = self.id;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match client.transact(Request::Keepalive { session_id }).await {
                    Ok(_) => trace!(target = "signaling", session_id, "keepalive acknowledged"),
                    Err(err) => {
                        warn!(
                            target = "signaling",
                            session_id,
                            error = %err,
                            "keepalive failed; stopping keepalive loop"
                        );
                        return;
                    }
                }
            }
        })
    }

    pub async fn destroy(&self) -> Result<(), SignalingError> {
        self.client
            .transact(Request::Destroy {
                session_id: self.id,
            })
            .await?;
        debug!(target = "signaling", session_id = self.id, "janus session destroyed");
        Ok(())
    }
}

/// A plugin handle inside a session.
pub struct Handle {
    client: Arc<GatewayClient>,
    session_id: u64,
    id: u64,
    events: Mutex<Option<mpsc::UnboundedReceiver<HandleEvent>>>,
}

impl Handle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// The asynchronous event feed. Yields `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<HandleEvent>> {
        self.events.lock().take()
    }

    pub async fn message(
        &self,
        body: Value,
        jsep: Option<Jsep>,
    ) -> Result<PluginResponse, SignalingError> {
        let reply = self
            .client
            .transact(Request::Message {
                session_id: self.session_id,
                handle_id: self.id,
                body,
                jsep,
            })
            .await?;
        PluginResponse::from_incoming(reply)
    }

    pub async fn detach(&self) -> Result<(), SignalingError> {
        self.client
            .transact(Request::Detach {
                session_id: self.session_id,
                handle_id: self.id,
            })
            .await?;
        self.client.unregister_handle(self.id);
        Ok(())
    }
}

/// Reply to a plugin message: the plugin's data plus any attached JSEP.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginResponse {
    pub plugin_data: Option<PluginData>,
    pub jsep: Option<Value>,
}

impl PluginResponse {
    fn from_incoming(reply: Incoming) -> Result<Self, SignalingError> {
        let response = match reply {
            Incoming::Event {
                plugindata, jsep, ..
            } => Self {
                plugin_data: plugindata,
                jsep,
            },
            Incoming::Success { plugindata, .. } => Self {
                plugin_data: plugindata,
                jsep: None,
            },
            other => {
                return Err(SignalingError::UnexpectedResponse {
                    request: "message",
                    received: other.kind(),
                });
            }
        };
        if let Some((code, reason)) = response.plugin_data.as_ref().and_then(PluginData::error) {
            return Err(SignalingError::Plugin { code, reason });
        }
        Ok(response)
    }
}

/// Synchronous request/response exchange with a plugin.
#[async_trait]
pub trait PluginMessenger: Send + Sync {
    async fn send_message(
        &self,
        body: Value,
        jsep: Option<Jsep>,
    ) -> Result<PluginResponse, SignalingError>;
}

#[async_trait]
impl PluginMessenger for Handle {
    async fn send_message(
        &self,
        body: Value,
        jsep: Option<Jsep>,
    ) -> Result<PluginResponse, SignalingError> {
        self.message(body, jsep).await
    }
}

/// Log every asynchronous handle event until the feed closes.
pub fn spawn_event_drain(
    handle_id: u64,
    mut events: mpsc::UnboundedReceiver<HandleEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                HandleEvent::SlowLink { uplink, lost } => {
                    warn!(target = "signaling", handle_id, uplink, lost, "slow link reported")
                }
                HandleEvent::Media { kind, receiving } => {
                    info!(target = "signaling", handle_id, kind = %kind, receiving, "media state changed")
                }
                HandleEvent::WebRtcUp => info!(target = "signaling", handle_id, "webrtc is up"),
                HandleEvent::Hangup { reason } => info!(
                    target = "signaling",
                    handle_id,
                    reason = reason.as_deref().unwrap_or("unspecified"),
                    "peer connection hung up"
                ),
                HandleEvent::Detached => info!(target = "signaling", handle_id, "handle detached"),
                HandleEvent::Plugin(data) => {
                    debug!(target = "signaling", handle_id, data = %data, "plugin event")
                }
            }
        }
        trace!(target = "signaling", handle_id, "handle event feed closed");
    })
}

fn success_id(request: &'static str, reply: Incoming) -> Result<u64, SignalingError> {
    match reply {
        Incoming::Success {
            data: Some(data), ..
        } => Ok(data.id),
        other => Err(SignalingError::UnexpectedResponse {
            request,
            received: other.kind(),
        }),
    }
}
