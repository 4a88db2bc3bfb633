use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use tracing::{debug, trace, warn};
use url::Url;

use super::SignalingError;
use super::protocol::{
    Completion, HandleEvent, Incoming, JANUS_SUBPROTOCOL, OutgoingMessage, Request,
};

#[derive(Default)]
struct Routes {
    pending: HashMap<String, mpsc::UnboundedSender<Incoming>>,
    handles: HashMap<u64, mpsc::UnboundedSender<HandleEvent>>,
    closed: bool,
}

/// Websocket connection to a Janus gateway.
///
/// Replies are matched to requests by transaction; notifications without a
/// waiting transaction are routed to the handle named by their `sender`.
/// When the connection dies the fatal signal fires once, every in-flight
/// request fails with [`SignalingError::Closed`] and every handle's event
/// stream ends.
pub struct GatewayClient {
    url: Url,
    outbound: mpsc::UnboundedSender<String>,
    routes: Arc<Mutex<Routes>>,
    fatal: Arc<watch::Sender<Option<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayClient {
    pub async fn connect(url: &Url) -> Result<Arc<Self>, SignalingError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| connect_error(url, err))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(JANUS_SUBPROTOCOL),
        );
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|err| connect_error(url, err))?;
        debug!(target = "signaling", url = %url, "janus websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let routes = Arc::new(Mutex::new(Routes::default()));
        let (fatal_tx, _) = watch::channel(None);
        let fatal = Arc::new(fatal_tx);

        let writer_handle = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_write.send(Message::Text(text)).await {
                    debug!(target = "signaling", error = %err, "janus websocket write failed");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_routes = Arc::clone(&routes);
        let reader_fatal = Arc::clone(&fatal);
        let reader_handle = tokio::spawn(async move {
            let reason = loop {
                match ws_read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reason) = dispatch_text(&reader_routes, &text) {
                            break reason;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => {
                            if let Some(reason) = dispatch_text(&reader_routes, &text) {
                                break reason;
                            }
                        }
                        Err(_) => warn!(target = "signaling", "ignoring non-utf8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) => break "closed by gateway".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(target = "signaling", "janus websocket closed: {err}");
                            }
                            _ => warn!(target = "signaling", "janus websocket error: {err}"),
                        }
                        break err.to_string();
                    }
                    None => break "websocket stream ended".to_string(),
                }
            };
            fail_all(&reader_routes, &reader_fatal, reason);
        });

        Ok(Arc::new(Self {
            url: url.clone(),
            outbound,
            routes,
            fatal,
            tasks: Mutex::new(vec![writer_handle, reader_handle]),
        }))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Send a request and wait for the reply that completes it.
    pub async fn transact(&self, request: Request) -> Result<Incoming, SignalingError> {
        let name = request.name();
        let completion = request.completion();
        let message = OutgoingMessage::new(request);
        let text = serde_json::to_string(&message).map_err(|source| SignalingError::Encode {
            request: name,
            source,
        })?;

        let mut replies = self.register_transaction(&message.transaction)?;
        let _pending = PendingGuard {
            routes: &self.routes,
            transaction: &message.transaction,
        };
        trace!(
            target = "signaling",
            request = name,
            transaction = %message.transaction,
            "sending janus request"
        );
        self.outbound
            .send(text)
            .map_err(|_| SignalingError::Closed)?;

        while let Some(reply) = replies.recv().await {
            match reply {
                Incoming::Ack { .. } if completion == Completion::Ack => return Ok(reply),
                Incoming::Ack { .. } => {
                    trace!(target = "signaling", request = name, "request acknowledged");
                }
                Incoming::Error { error, .. } => {
                    return Err(SignalingError::Rejected {
                        request: name,
                        code: error.code,
                        reason: error.reason,
                    });
                }
                Incoming::Success { .. } if completion != Completion::Ack => return Ok(reply),
                Incoming::Event { .. } if completion == Completion::Event => return Ok(reply),
                other => {
                    return Err(SignalingError::UnexpectedResponse {
                        request: name,
                        received: other.kind(),
                    });
                }
            }
        }
        Err(SignalingError::Closed)
    }

    pub(crate) fn register_handle(
        &self,
        handle_id: u64,
    ) -> Result<mpsc::UnboundedReceiver<HandleEvent>, SignalingError> {
        let mut routes = self.routes.lock();
        if routes.closed {
            return Err(SignalingError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.handles.insert(handle_id, tx);
        Ok(rx)
    }

    pub(crate) fn unregister_handle(&self, handle_id: u64) {
        self.routes.lock().handles.remove(&handle_id);
    }

    fn register_transaction(
        &self,
        transaction: &str,
    ) -> Result<mpsc::UnboundedReceiver<Incoming>, SignalingError> {
        let mut routes = self.routes.lock();
        if routes.closed {
            return Err(SignalingError::Closed);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        routes.pending.insert(transaction.to_string(), tx);
        Ok(rx)
    }

    pub fn is_closed(&self) -> bool {
        self.fatal.borrow().is_some()
    }

    /// Resolves once the connection is unrecoverable, with the reason.
    pub async fn closed(&self) -> String {
        let mut rx = self.fatal.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "signaling client dropped".to_string(),
        }
    }

    /// Stop the websocket tasks. Pending requests fail with `Closed`.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        fail_all(&self.routes, &self.fatal, "client shut down".to_string());
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

struct PendingGuard<'a> {
    routes: &'a Mutex<Routes>,
    transaction: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.routes.lock().pending.remove(self.transaction);
    }
}

/// Route one text frame. Returns a reason when the frame ends the session.
fn dispatch_text(routes: &Mutex<Routes>, text: &str) -> Option<String> {
    let message: Incoming = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(err) => {
            warn!(target = "signaling", error = %err, "ignoring malformed janus message");
            return None;
        }
    };
    trace!(target = "signaling", kind = message.kind(), "janus message received");

    if let Incoming::Timeout { session_id } = &message {
        return Some(match session_id {
            Some(id) => format!("janus session {id} timed out"),
            None => "janus session timed out".to_string(),
        });
    }

    let routes = routes.lock();
    let transaction = message.transaction().map(str::to_owned);
    if let Some(tx) = transaction.as_deref().and_then(|t| routes.pending.get(t)) {
        let _ = tx.send(message);
        return None;
    }
    if let Some(tx) = message.sender().and_then(|id| routes.handles.get(&id)) {
        let kind = message.kind();
        match HandleEvent::from_incoming(message) {
            Some(event) => {
                let _ = tx.send(event);
            }
            None => debug!(target = "signaling", kind, "dropping handle message"),
        }
        return None;
    }
    debug!(
        target = "signaling",
        kind = message.kind(),
        transaction = ?transaction,
        "unrouted janus message"
    );
    None
}

fn fail_all(routes: &Mutex<Routes>, fatal: &watch::Sender<Option<String>>, reason: String) {
    {
        let mut routes = routes.lock();
        routes.closed = true;
        routes.pending.clear();
        routes.handles.clear();
    }
    let fired = fatal.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason.clone());
            true
        } else {
            false
        }
    });
    if fired {
        debug!(target = "signaling", reason = %reason, "signaling fatal signal fired");
    }
}

fn connect_error(url: &Url, err: impl std::fmt::Display) -> SignalingError {
    SignalingError::Connect {
        url: url.to_string(),
        reason: err.to_string(),
    }
}
