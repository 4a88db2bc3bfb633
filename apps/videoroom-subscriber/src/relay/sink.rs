//! Destinations for relayed RTP packets.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};
use webrtc::media::io::Writer;
use webrtc::media::io::h264_writer::H264Writer;
use webrtc::media::io::ivf_reader::IVFFileHeader;
use webrtc::media::io::ivf_writer::IVFWriter;
use webrtc::media::io::ogg_writer::OggWriter;
use webrtc::rtp::packet::Packet;
use webrtc::util::Unmarshal;

const OPUS_SAMPLE_RATE: u32 = 48_000;
const OPUS_CHANNELS: u8 = 2;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to create {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to open {container} container: {reason}")]
    Container {
        container: &'static str,
        reason: String,
    },
    #[error("malformed rtp packet: {0}")]
    Rtp(String),
    #[error("failed to write rtp packet: {0}")]
    Write(String),
    #[error("sink used before start")]
    NotStarted,
}

/// A per-track media pipeline: started once, fed raw RTP packets in arrival
/// order, stopped once.
pub trait MediaSink: Send {
    fn start(&mut self) -> Result<(), SinkError>;
    fn push(&mut self, packet: &[u8]) -> Result<(), SinkError>;
    fn stop(&mut self);
}

/// Builds the sink for a track from its payload type and codec name.
pub trait SinkFactory: Send + Sync {
    fn create(&self, payload_type: u8, codec: &str) -> Box<dyn MediaSink>;
}

/// Counts what arrives and logs a summary on stop.
#[derive(Debug)]
pub struct StatsSink {
    payload_type: u8,
    codec: String,
    packets: u64,
    bytes: u64,
    started: Option<Instant>,
}

impl StatsSink {
    pub fn new(payload_type: u8, codec: &str) -> Self {
        Self {
            payload_type,
            codec: codec.to_string(),
            packets: 0,
            bytes: 0,
            started: None,
        }
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl MediaSink for StatsSink {
    fn start(&mut self) -> Result<(), SinkError> {
        self.started = Some(Instant::now());
        debug!(
            target = "relay::sink",
            payload_type = self.payload_type,
            codec = %self.codec,
            "stats sink started"
        );
        Ok(())
    }

    fn push(&mut self, packet: &[u8]) -> Result<(), SinkError> {
        if self.started.is_none() {
            return Err(SinkError::NotStarted);
        }
        self.packets += 1;
        self.bytes += packet.len() as u64;
        Ok(())
    }

    fn stop(&mut self) {
        let Some(started) = self.started.take() else {
            return;
        };
        info!(
            target = "relay::sink",
            payload_type = self.payload_type,
            codec = %self.codec,
            packets = self.packets,
            bytes = self.bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sink stopped"
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Ivf,
    Ogg,
    AnnexB,
}

impl Container {
    pub fn for_codec(codec: &str) -> Option<Self> {
        match codec {
            "vp8" => Some(Container::Ivf),
            "opus" => Some(Container::Ogg),
            "h264" => Some(Container::AnnexB),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Container::Ivf => "ivf",
            Container::Ogg => "ogg",
            Container::AnnexB => "h264",
        }
    }

    fn name(self) -> &'static str {
        match self {
            Container::Ivf => "ivf",
            Container::Ogg => "ogg",
            Container::AnnexB => "annex-b",
        }
    }

    fn open(self, file: File) -> Result<Box<dyn Writer + Send>, SinkError> {
        let container_error = |err: webrtc::media::Error| SinkError::Container {
            container: self.name(),
            reason: err.to_string(),
        };
        Ok(match self {
            Container::Ivf => {
                let header = IVFFileHeader {
                    signature: *b"DKIF",
                    version: 0,
                    header_size: 32,
                    four_cc: *b"VP80",
                    width: 640,
                    height: 480,
                    timebase_denominator: 30,
                    timebase_numerator: 1,
                    num_frames: 900,
                    unused: 0,
                };
                Box::new(IVFWriter::new(file, &header).map_err(container_error)?)
            }
            Container::Ogg => Box::new(
                OggWriter::new(file, OPUS_SAMPLE_RATE, OPUS_CHANNELS).map_err(container_error)?,
            ),
            Container::AnnexB => Box::new(H264Writer::new(file)),
        })
    }
}

/// Writes depacketized media into a codec container file.
pub struct ContainerSink {
    path: PathBuf,
    container: Container,
    writer: Option<Box<dyn Writer + Send>>,
    stats: StatsSink,
}

impl ContainerSink {
    pub fn new(path: PathBuf, container: Container, payload_type: u8, codec: &str) -> Self {
        Self {
            path,
            container,
            writer: None,
            stats: StatsSink::new(payload_type, codec),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MediaSink for ContainerSink {
    fn start(&mut self) -> Result<(), SinkError> {
        let file = File::create(&self.path).map_err(|source| SinkError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.writer = Some(self.container.open(file)?);
        self.stats.start()?;
        info!(target = "relay::sink", path = %self.path.display(), "writing track");
        Ok(())
    }

    fn push(&mut self, packet: &[u8]) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::NotStarted)?;
        let mut raw = packet;
        let rtp = Packet::unmarshal(&mut raw).map_err(|err| SinkError::Rtp(err.to_string()))?;
        writer
            .write_rtp(&rtp)
            .map_err(|err| SinkError::Write(err.to_string()))?;
        self.stats.push(packet)
    }

    fn stop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.close() {
                warn!(
                    target = "relay::sink",
                    path = %self.path.display(),
                    error = %err,
                    "failed to finalize container"
                );
            }
        }
        self.stats.stop();
    }
}

/// The shipped [`SinkFactory`]: statistics only, or container files when an
/// output directory is configured.
#[derive(Debug, Clone, Default)]
pub struct SinkCatalog {
    output_dir: Option<PathBuf>,
}

impl SinkCatalog {
    pub fn new(output_dir: Option<PathBuf>) -> Self {
        Self { output_dir }
    }

    pub fn file_name(payload_type: u8, codec: &str, container: Container) -> String {
        format!("feed-{payload_type}-{codec}.{}", container.extension())
    }
}

impl SinkFactory for SinkCatalog {
    fn create(&self, payload_type: u8, codec: &str) -> Box<dyn MediaSink> {
        let Some(dir) = &self.output_dir else {
            return Box::new(StatsSink::new(payload_type, codec));
        };
        match Container::for_codec(codec) {
            Some(container) => {
                let path = dir.join(Self::file_name(payload_type, codec, container));
                Box::new(ContainerSink::new(path, container, payload_type, codec))
            }
            None => {
                warn!(
                    target = "relay::sink",
                    payload_type,
                    codec,
                    "no container for codec; counting packets only"
                );
                Box::new(StatsSink::new(payload_type, codec))
            }
        }
    }
}
