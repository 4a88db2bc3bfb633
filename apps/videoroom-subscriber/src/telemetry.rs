fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

/// Janus escapes line breaks inside SDP when it is echoed through some
/// proxies; expand them so logged descriptions stay readable.
pub fn printable_sdp(sdp: &str) -> String {
    sdp.replace("\\r\\n", "\n")
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Replaces the computed filter verbatim.
    const FILTER_ENV: &str = "VIDEOROOM_LOG_FILTER";
    /// Lets webrtc and websocket internals log at trace too.
    const TRACE_DEPS_ENV: &str = "VIDEOROOM_TRACE_DEPS";
    const CRATE_TARGET: &str = "videoroom_subscriber";

    /// Crates that flood the log at trace level: one line per packet or
    /// per STUN check.
    const NOISY_TARGETS: &[&str] = &[
        "webrtc",
        "webrtc_ice",
        "webrtc_dtls",
        "webrtc_srtp",
        "webrtc_sctp",
        "webrtc_mdns",
        "interceptor",
        "tokio_tungstenite",
        "tungstenite",
    ];

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        Warn,
        #[default]
        Info,
        Debug,
        Trace,
    }

    impl From<LogLevel> for LevelFilter {
        fn from(level: LogLevel) -> Self {
            match level {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    /// Filter directives for a level, and whether noisy crates were clamped.
    #[derive(Debug, PartialEq, Eq)]
    pub(crate) struct Directives {
        pub filter: String,
        pub clamped: bool,
    }

    impl Directives {
        pub(crate) fn for_level(level: LogLevel, trace_deps: bool) -> Self {
            let mut filter = match level {
                LogLevel::Debug | LogLevel::Trace => {
                    format!("info,{CRATE_TARGET}={}", LevelFilter::from(level))
                }
                other => LevelFilter::from(other).to_string(),
            };
            let clamped = level == LogLevel::Trace && !trace_deps;
            if clamped {
                for target in NOISY_TARGETS {
                    filter.push_str(&format!(",{target}=info"));
                }
            }
            Self {
                filter: filter.to_ascii_lowercase(),
                clamped,
            }
        }
    }

    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Install the global subscriber. Later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let (env_filter, clamped) = match std::env::var(FILTER_ENV) {
            Ok(custom) => (EnvFilter::new(custom), false),
            Err(_) => {
                let trace_deps = super::env_truthy(TRACE_DEPS_ENV).unwrap_or(false);
                let directives = Directives::for_level(config.level, trace_deps);
                (EnvFilter::new(directives.filter), directives.clamped)
            }
        };

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .try_init()
            .map_err(|err| InitError::Configure(err.to_string()))?;
        let _ = GUARD.set(guard);

        if clamped {
            tracing::info!(
                "webrtc and websocket traces clamped to info; set {TRACE_DEPS_ENV}=1 or {FILTER_ENV} to see them"
            );
        }
        Ok(())
    }
}
