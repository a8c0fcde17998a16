use thiserror::Error;

/// Returned by `TcpForwarder::start`/`UdpForwarder::start` when a listen or
/// datagram bind fails. The instance is never registered when this is
/// returned; any listener already bound for a sibling protocol is closed
/// first (see `Instance::start`).
#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to bind {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Per-flow dial failure. Logged once and swallowed; no Flow is recorded
/// since it never carried bytes.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("dial {addr} timed out")]
    Timeout { addr: String },
    #[error("dial {addr} failed: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Raised by `Manager::start`.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("rule {0} is already running")]
    AlreadyRunning(String),
    #[error(transparent)]
    Bind(#[from] BindError),
}

/// Per-flow copy failure. The flow is finalized and reported as
/// disconnected; it is never retried since byte streams aren't replayable.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
