//! One subscription from connect to drained shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SubscriberConfig;
use crate::peer::{PeerError, PeerSession};
use crate::relay::sink::SinkFactory;
use crate::relay::{RelayRegistry, RelayReport, dispatch_peer_events};
use crate::signaling::{
    GatewayClient, Handle, Session, SignalingError, VIDEOROOM_PLUGIN, spawn_event_drain,
};
use crate::subscription::{self, Answer, FeedbackStatus, NegotiationError};
use crate::supervisor::{PeerTeardown, ShutdownReason, ShutdownSignal, Supervisor};

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub reason: ShutdownReason,
    pub answer: Answer,
    pub feedback: FeedbackStatus,
    pub reports: Vec<RelayReport>,
}

/// Background tasks that must not outlive the run, whichever way it ends.
#[derive(Default)]
struct Background(Vec<JoinHandle<()>>);

impl Background {
    fn push(&mut self, task: JoinHandle<()>) {
        self.0.push(task);
    }
}

impl Drop for Background {
    fn drop(&mut self) {
        for task in self.0.drain(..) {
            task.abort();
        }
    }
}

/// Subscribe, relay media until `shutdown` fires, then drain.
///
/// Setup failures are returned as errors. Losing the signaling link after
/// the subscription started is a normal end of the run.
pub async fn run(
    config: SubscriberConfig,
    sinks: Arc<dyn SinkFactory>,
    shutdown: ShutdownSignal,
) -> Result<RunSummary, AppError> {
    let mut background = Background::default();

    let client = GatewayClient::connect(&config.gateway_url).await?;
    info!(url = %config.gateway_url, "connected to janus");
    background.push(watch_signaling(Arc::clone(&client), shutdown.clone()));

    let session = Session::create(Arc::clone(&client)).await?;
    background.push(session.spawn_keepalive(KEEPALIVE_INTERVAL));
    let handle = session.attach(VIDEOROOM_PLUGIN).await?;
    info!(
        session_id = session.id(),
        handle_id = handle.id(),
        "attached to videoroom plugin"
    );
    if let Some(events) = handle.take_events() {
        background.push(spawn_event_drain(handle.id(), events));
    }

    let joined = bounded(
        config.negotiation_timeout,
        "join",
        subscription::join(&handle, config.room, config.feed),
    )
    .await?;

    let (peer, peer_events) = PeerSession::build(&config.peer, &joined.offer).await?;
    let registry = Arc::new(RelayRegistry::new(sinks));
    background.push(tokio::spawn(dispatch_peer_events(
        peer_events,
        Arc::clone(&registry),
    )));

    let answer = match peer.answer(&joined.offer, config.negotiation_timeout).await {
        Ok(answer) => answer,
        Err(err) => {
            peer.teardown().await;
            return Err(err.into());
        }
    };
    let feedback = FeedbackStatus::observe(config.peer.feedback_enabled(), &answer.sdp);
    feedback.log(config.peer.feedback.map(|feedback| feedback.report_interval));

    if let Err(err) = bounded(
        config.negotiation_timeout,
        "start",
        subscription::start(&handle, config.room, &answer),
    )
    .await
    {
        peer.teardown().await;
        return Err(err);
    }

    let supervisor = Supervisor::new(shutdown.clone());
    let drained = supervisor.run(&peer, &registry).await;
    let (reason, reports) = match drained {
        Some(summary) => (summary.reason, summary.reports),
        None => (
            shutdown.reason().unwrap_or(ShutdownReason::Interrupted),
            Vec::new(),
        ),
    };

    if reason == ShutdownReason::Interrupted && !client.is_closed() {
        leave(&session, &handle).await;
    }
    drop(background);
    client.shutdown();

    Ok(RunSummary {
        reason,
        answer,
        feedback,
        reports,
    })
}

fn watch_signaling(client: Arc<GatewayClient>, shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reason = client.closed().await;
        if shutdown.trigger(ShutdownReason::SignalingLost) {
            warn!(reason = %reason, "signaling connection lost");
        }
    })
}

/// Detach and destroy while the gateway is still reachable.
async fn leave(session: &Session, handle: &Handle) {
    let goodbye = async {
        handle.detach().await?;
        session.destroy().await
    };
    match tokio::time::timeout(TEARDOWN_TIMEOUT, goodbye).await {
        Ok(Ok(())) => debug!(session_id = session.id(), "left janus session"),
        Ok(Err(err)) => debug!(error = %err, "janus session teardown failed"),
        Err(_) => debug!("janus session teardown timed out"),
    }
}

async fn bounded<T, E>(
    limit: Option<Duration>,
    step: &'static str,
    future: impl Future<Output = Result<T, E>>,
) -> Result<T, AppError>
where
    AppError: From<E>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, future).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SignalingError::Timeout(step).into()),
        },
        None => Ok(future.await?),
    }
}
