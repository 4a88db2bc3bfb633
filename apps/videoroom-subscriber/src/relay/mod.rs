//! Per-track workers that pump inbound RTP into media sinks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use webrtc::track::track_remote::TrackRemote;
use webrtc::util::Marshal;

use crate::peer::PeerEvent;

pub mod sink;

use sink::{MediaSink, SinkError, SinkFactory};

/// Read size per packet; stays under a typical MTU after headers.
pub const RELAY_BUFFER_SIZE: usize = 1400;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("track read failed: {0}")]
    Read(String),
    #[error("failed to serialize rtp packet: {0}")]
    Marshal(String),
}

/// Identity of an inbound track.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub ssrc: u32,
    pub id: String,
}

impl std::fmt::Display for TrackKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.id, self.ssrc)
    }
}

/// An inbound RTP stream.
#[async_trait]
pub trait RtpSource: Send + Sync {
    fn key(&self) -> TrackKey;
    fn payload_type(&self) -> u8;
    fn mime_type(&self) -> String;
    /// Read one RTP packet into `buf` and return its length.
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, RelayError>;
}

pub struct RemoteTrack(pub Arc<TrackRemote>);

#[async_trait]
impl RtpSource for RemoteTrack {
    fn key(&self) -> TrackKey {
        TrackKey {
            ssrc: self.0.ssrc(),
            id: self.0.id(),
        }
    }

    fn payload_type(&self) -> u8 {
        self.0.payload_type()
    }

    fn mime_type(&self) -> String {
        self.0.codec().capability.mime_type
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize, RelayError> {
        let (packet, _) = self
            .0
            .read(buf)
            .await
            .map_err(|err| RelayError::Read(err.to_string()))?;
        packet
            .marshal_to(buf)
            .map_err(|err| RelayError::Marshal(err.to_string()))
    }
}

/// `video/VP8` -> `vp8`.
pub fn codec_name(mime_type: &str) -> String {
    mime_type
        .split_once('/')
        .map_or(mime_type, |(_, codec)| codec)
        .to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The track stopped producing packets; the normal way a relay ends.
    SourceEnded(String),
    StartFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub key: TrackKey,
    pub payload_type: u8,
    pub codec: String,
    /// Packets the sink accepted.
    pub packets: u64,
    pub bytes: u64,
    /// Packets the sink rejected; the relay keeps reading past them.
    pub dropped: u64,
    pub end: EndReason,
}

/// Owns a sink and stops it when dropped, unwinding included.
struct SinkGuard {
    sink: Box<dyn MediaSink>,
}

impl SinkGuard {
    fn start(&mut self) -> Result<(), SinkError> {
        self.sink.start()
    }

    fn push(&mut self, packet: &[u8]) -> Result<(), SinkError> {
        self.sink.push(packet)
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.sink.stop();
    }
}

/// Relay one track until it stops producing packets.
pub async fn relay_track(source: Arc<dyn RtpSource>, factory: Arc<dyn SinkFactory>) -> RelayReport {
    let key = source.key();
    let payload_type = source.payload_type();
    let codec = codec_name(&source.mime_type());
    let mut report = RelayReport {
        key,
        payload_type,
        codec,
        packets: 0,
        bytes: 0,
        dropped: 0,
        end: EndReason::SourceEnded(String::new()),
    };

    let mut sink = SinkGuard {
        sink: factory.create(payload_type, &report.codec),
    };
    if let Err(err) = sink.start() {
        warn!(target = "relay", track = %report.key, error = %err, "sink failed to start");
        report.end = EndReason::StartFailed(err.to_string());
        return report;
    }
    info!(
        target = "relay",
        track = %report.key,
        payload_type,
        codec = %report.codec,
        "relay started"
    );

    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    report.end = loop {
        let len = match source.read_packet(&mut buf).await {
            Ok(len) => len,
            Err(err) => break EndReason::SourceEnded(err.to_string()),
        };
        match sink.push(&buf[..len]) {
            Ok(()) => {
                report.packets += 1;
                report.bytes += len as u64;
            }
            Err(err) => {
                report.dropped += 1;
                if report.dropped == 1 {
                    warn!(target = "relay", track = %report.key, error = %err, "sink rejected packet; dropping");
                } else {
                    debug!(
                        target = "relay",
                        track = %report.key,
                        dropped = report.dropped,
                        error = %err,
                        "sink rejected packet; dropping"
                    );
                }
            }
        }
    };
    drop(sink);

    info!(
        target = "relay",
        track = %report.key,
        packets = report.packets,
        bytes = report.bytes,
        dropped = report.dropped,
        end = ?report.end,
        "relay finished"
    );
    report
}

/// One relay worker per track identity, joined on drain.
pub struct RelayRegistry {
    factory: Arc<dyn SinkFactory>,
    workers: Mutex<HashMap<TrackKey, JoinHandle<RelayReport>>>,
    draining: AtomicBool,
}

impl RelayRegistry {
    pub fn new(factory: Arc<dyn SinkFactory>) -> Self {
        Self {
            factory,
            workers: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
        }
    }

    /// Start a worker for `source`. Refuses duplicates and late arrivals.
    pub fn spawn(&self, source: Arc<dyn RtpSource>) -> bool {
        let key = source.key();
        let mut workers = self.workers.lock();
        if self.draining.load(Ordering::SeqCst) {
            warn!(target = "relay", track = %key, "track arrived during shutdown; ignoring");
            return false;
        }
        if workers.contains_key(&key) {
            warn!(target = "relay", track = %key, "duplicate track delivery; ignoring");
            return false;
        }
        let worker = tokio::spawn(relay_track(source, Arc::clone(&self.factory)));
        workers.insert(key, worker);
        true
    }

    pub fn active(&self) -> usize {
        self.workers
            .lock()
            .values()
            .filter(|worker| !worker.is_finished())
            .count()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Refuse new workers and wait for every existing one to finish.
    pub async fn drain(&self) -> Vec<RelayReport> {
        let workers: Vec<(TrackKey, JoinHandle<RelayReport>)> = {
            let mut workers = self.workers.lock();
            self.draining.store(true, Ordering::SeqCst);
            workers.drain().collect()
        };
        debug!(target = "relay", workers = workers.len(), "draining relay workers");

        let mut reports = Vec::with_capacity(workers.len());
        for (key, worker) in workers {
            match worker.await {
                Ok(report) => reports.push(report),
                Err(err) => warn!(target = "relay", track = %key, error = %err, "relay worker failed"),
            }
        }
        reports
    }
}

/// Feed connection events into the registry until the event stream closes.
pub async fn dispatch_peer_events(
    events: mpsc::UnboundedReceiver<PeerEvent>,
    registry: Arc<RelayRegistry>,
) {
    forward_tracks(events, registry, |event| match event {
        PeerEvent::TrackArrived(track) => Ok(Arc::new(RemoteTrack(track)) as Arc<dyn RtpSource>),
        other => Err(other),
    })
    .await;
}

/// Spawn a worker for every event that carries a track; trace the rest.
async fn forward_tracks<E, F>(
    mut events: mpsc::UnboundedReceiver<E>,
    registry: Arc<RelayRegistry>,
    into_source: F,
) where
    E: std::fmt::Debug,
    F: Fn(E) -> Result<Arc<dyn RtpSource>, E>,
{
    while let Some(event) = events.recv().await {
        match into_source(event) {
            Ok(source) => {
                registry.spawn(source);
            }
            Err(other) => trace!(target = "relay", event = ?other, "peer event"),
        }
    }
}
