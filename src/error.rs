use std::fmt;

/// Error kinds raised by the proxy core, per the error model in the design
/// doc: configuration problems are synchronous, network problems surface
/// through the `error`/`econnreset` events, and abort/timeout conditions
/// tear down the affected connection without necessarily producing an event.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("failed to connect to upstream {target}: {source}")]
    UpstreamConnect {
        #[source]
        source: std::io::Error,
        target: String,
    },

    #[error("upstream connection reset")]
    UpstreamReset {
        #[source]
        source: Option<Box<hyper::Error>>,
    },

    #[error("client aborted the request")]
    ClientAbort,

    #[error("operation timed out")]
    Timeout,

    #[error("malformed upgrade request")]
    MalformedUpgrade,

    #[error("no such pass: {0}")]
    NoSuchPass(String),

    #[error(transparent)]
    Hyper(#[from] hyper::Error),

    #[error(transparent)]
    Http(#[from] http::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// True for the subset of errors that should be reported via the
    /// `econnreset` event rather than `error` when the client has already
    /// gone away.
    pub fn is_econnreset(&self) -> bool {
        match self {
            ProxyError::UpstreamReset { .. } => true,
            ProxyError::Io(e) => e.kind() == std::io::ErrorKind::ConnectionReset,
            ProxyError::Hyper(e) => e.is_incomplete_message() || e.is_closed(),
            _ => false,
        }
    }

    pub fn configuration(msg: impl fmt::Display) -> Self {
        ProxyError::Configuration(msg.to_string())
    }
}
