use thiserror::Error;

/// Broad classes of [`LinkError`], used by callers deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Timing,
    State,
    Transport,
}

/// Failure reported by a transport implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("broker url is unresolved or empty: {0:?}")]
    InvalidBrokerUrl(String),

    #[error("unsupported log profile {0:?} (expected production or development)")]
    UnsupportedLogProfile(String),

    #[error("failed to open log sink {path}: {source}")]
    LogSink {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install log subscriber: {0}")]
    LoggerInit(String),

    #[error("timed out after {waited_ms}ms waiting for broker connection")]
    ConnectTimeout { waited_ms: u64 },

    #[error("timed out after {waited_ms}ms waiting to publish")]
    PublishTimeout { waited_ms: u64 },

    #[error("publish to {topic} failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: Box<LinkError>,
    },

    #[error("subscribe to {topic} failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: TransportError,
    },

    #[error("no active connection")]
    NotConnected,

    #[error("client not initialized")]
    NotInitialized,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidBrokerUrl(_)
            | Self::UnsupportedLogProfile(_)
            | Self::LogSink { .. }
            | Self::LoggerInit(_) => ErrorKind::Configuration,
            Self::ConnectTimeout { .. } | Self::PublishTimeout { .. } => ErrorKind::Timing,
            Self::NotConnected | Self::NotInitialized => ErrorKind::State,
            Self::Subscribe { .. } | Self::Transport(_) => ErrorKind::Transport,
            Self::Publish { source, .. } => source.kind(),
        }
    }
}
