//! Pool error taxonomy.

/// Errors surfaced by the connection and session pools.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connect URL could not be parsed.
    #[error("invalid connect url: {0}")]
    InvalidConnectUrl(String),

    /// A dial attempt against the broker failed. Recoverable.
    #[error("connection failed")]
    ConnectionFailed(#[source] anyhow::Error),

    /// An asynchronous close event was observed, or the underlying handle is
    /// closed. Recoverable via `recover`.
    #[error("connection closed")]
    ConnectionClosed,

    /// A broker operation (opening a session, publishing) failed.
    #[error("broker operation failed")]
    Broker(#[source] anyhow::Error),

    /// Eager pool initialization failed. Non-recoverable for this pool instance.
    #[error("pool initialization failed")]
    PoolInitializationFailed(#[source] Box<Error>),

    /// The pool's shutdown token has been triggered. Callers must stop.
    #[error("pool closed")]
    Closed,

    /// The caller-supplied cancellation token fired before the operation completed.
    #[error("operation cancelled by caller")]
    Cancelled,

    /// A pool was configured with an unusable size.
    #[error("invalid pool size: {0}")]
    InvalidPoolSize(usize),
}

impl Error {
    /// Whether this error belongs to the cancellation class: the pool is
    /// shutting down or the caller's own token fired. Cancellation unwinds
    /// callers; it never marks a connection as broken.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Closed | Error::Cancelled => true,
            Error::PoolInitializationFailed(source) => source.is_cancellation(),
            _ => false,
        }
    }
}

/// Whether an error observed while a connection was on loan marks it broken.
///
/// Broker/transport classes (`ConnectionFailed`, `ConnectionClosed`, `Broker`,
/// and anything else surfaced by the client library) flag the connection so it
/// is recovered before its next use. Cancellation classes (`Closed`,
/// `Cancelled`, and initialization failures wrapping them) never flag: a pool
/// tearing down must not corrupt the health state of connections on the way out.
pub(crate) fn flaggable(err: Option<&Error>) -> bool {
    err.map_or(false, |e| !e.is_cancellation())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_errors_flag_the_connection() {
        assert!(flaggable(Some(&Error::ConnectionClosed)));
        assert!(flaggable(Some(&Error::ConnectionFailed(anyhow::anyhow!(
            "dial refused"
        )))));
        assert!(flaggable(Some(&Error::Broker(anyhow::anyhow!(
            "channel error"
        )))));
    }

    #[test]
    fn cancellation_never_flags() {
        assert!(!flaggable(None));
        assert!(!flaggable(Some(&Error::Closed)));
        assert!(!flaggable(Some(&Error::Cancelled)));
        assert!(!flaggable(Some(&Error::PoolInitializationFailed(Box::new(
            Error::Closed
        )))));
    }

    #[test]
    fn initialization_failures_inherit_the_class_of_their_cause() {
        let cancelled = Error::PoolInitializationFailed(Box::new(Error::Closed));
        assert!(cancelled.is_cancellation());

        let broker = Error::PoolInitializationFailed(Box::new(Error::ConnectionClosed));
        assert!(!broker.is_cancellation());
    }
}
