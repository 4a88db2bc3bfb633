use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};
use thiserror::Error;
use url::Url;

use crate::telemetry::logging::{LogConfig, LogLevel};

pub const DEFAULT_GATEWAY_URL: &str = "ws://localhost:8188/janus";
pub const DEFAULT_REPORT_INTERVAL_MS: u64 = 100;
pub const PUBLIC_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "videoroom-subscriber",
    about = "Subscribe to a Janus videoroom feed over WebRTC (receive only)",
    override_usage = "videoroom-subscriber --room=1234 --feed=1000 [OPTIONS]",
    version
)]
pub struct Cli {
    #[arg(
        long = "ws",
        env = "VIDEOROOM_WS",
        default_value = DEFAULT_GATEWAY_URL,
        help = "Janus websocket endpoint"
    )]
    pub gateway: String,

    #[arg(
        long,
        env = "VIDEOROOM_ROOM",
        default_value_t = 0,
        help = "Room number the client joins"
    )]
    pub room: u64,

    #[arg(
        long,
        env = "VIDEOROOM_FEED",
        default_value_t = 0,
        help = "Feed number the client subscribes to"
    )]
    pub feed: u64,

    #[arg(
        long = "enable-stun",
        env = "VIDEOROOM_ENABLE_STUN",
        help = "Use the public Google STUN server to discover srflx candidates"
    )]
    pub enable_stun: bool,

    #[arg(
        long = "enable-rfc8888",
        env = "VIDEOROOM_ENABLE_RFC8888",
        help = "Negotiate and generate RFC 8888 congestion control feedback"
    )]
    pub enable_rfc8888: bool,

    #[arg(
        long = "rfc8888-interval",
        value_name = "MS",
        env = "VIDEOROOM_RFC8888_INTERVAL",
        default_value_t = DEFAULT_REPORT_INTERVAL_MS,
        help = "Interval in milliseconds between RFC 8888 reports"
    )]
    pub rfc8888_interval_ms: u64,

    #[arg(
        long = "output-dir",
        value_name = "DIR",
        env = "VIDEOROOM_OUTPUT_DIR",
        help = "Write received media into codec containers under DIR"
    )]
    pub output_dir: Option<PathBuf>,

    #[arg(
        long = "negotiation-timeout",
        value_name = "SECS",
        env = "VIDEOROOM_NEGOTIATION_TIMEOUT",
        help = "Bound join, start and ICE gathering (waits indefinitely when unset)"
    )]
    pub negotiation_timeout_secs: Option<u64>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "VIDEOROOM_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "VIDEOROOM_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing room or feed identifier (both must be greater than zero)")]
    MissingIdentifier,
    #[error("rfc8888 report interval must be a positive number of milliseconds")]
    InvalidReportInterval,
    #[error("invalid janus websocket endpoint '{url}': {reason}")]
    InvalidGatewayUrl { url: String, reason: String },
    #[error("negotiation timeout must be at least one second")]
    InvalidNegotiationTimeout,
}

/// Congestion feedback settings; present only when RFC 8888 is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackConfig {
    pub report_interval: Duration,
}

/// Everything the media engine needs to know before the connection is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    pub enable_stun: bool,
    pub feedback: Option<FeedbackConfig>,
}

impl PeerConfig {
    pub fn feedback_enabled(&self) -> bool {
        self.feedback.is_some()
    }

    pub fn ice_server_urls(&self) -> Vec<String> {
        if self.enable_stun {
            vec![PUBLIC_STUN_SERVER.to_string()]
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub gateway_url: Url,
    pub room: u64,
    pub feed: u64,
    pub peer: PeerConfig,
    pub output_dir: Option<PathBuf>,
    pub negotiation_timeout: Option<Duration>,
}

impl SubscriberConfig {
    pub fn new(gateway_url: Url, room: u64, feed: u64) -> Result<Self, ConfigError> {
        if room == 0 || feed == 0 {
            return Err(ConfigError::MissingIdentifier);
        }
        Ok(Self {
            gateway_url,
            room,
            feed,
            peer: PeerConfig::default(),
            output_dir: None,
            negotiation_timeout: None,
        })
    }
}

impl Cli {
    /// Validate the parsed arguments. Performs no I/O.
    pub fn into_config(self) -> Result<SubscriberConfig, ConfigError> {
        if self.room == 0 || self.feed == 0 {
            return Err(ConfigError::MissingIdentifier);
        }
        if self.rfc8888_interval_ms < 1 {
            return Err(ConfigError::InvalidReportInterval);
        }
        let gateway_url = parse_gateway_url(&self.gateway)?;
        let negotiation_timeout = match self.negotiation_timeout_secs {
            Some(0) => return Err(ConfigError::InvalidNegotiationTimeout),
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };
        let feedback = self.enable_rfc8888.then(|| FeedbackConfig {
            report_interval: Duration::from_millis(self.rfc8888_interval_ms),
        });

        Ok(SubscriberConfig {
            gateway_url,
            room: self.room,
            feed: self.feed,
            peer: PeerConfig {
                enable_stun: self.enable_stun,
                feedback,
            },
            output_dir: self.output_dir,
            negotiation_timeout,
        })
    }
}

fn parse_gateway_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|err| ConfigError::InvalidGatewayUrl {
        url: raw.to_string(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::InvalidGatewayUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}
