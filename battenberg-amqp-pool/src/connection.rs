//! A self-healing wrapper around one broker connection.

use std::sync::Arc;
use std::time::Duration;

use battenberg_amqp::rabbit_mq::TlsConfig;
use battenberg_amqp::transport::{
    BlockedEvent, BrokerClient, CloseEvent, ConnectionHandle, DialOptions,
};
use lapin::uri::{AMQPScheme, AMQPUri};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::{default_backoff, BackoffPolicy};
use crate::error::Error;

/// Capacity of the close and flow-control notification channels.
const NOTIFY_BUFFER: usize = 10;

/// Sleep between polls while the broker has flow control active.
const FLOW_CONTROL_POLL: Duration = Duration::from_secs(1);

/// Invoked before every reconnection sleep with the connection name, the
/// 0-based attempt number and the error that failed the attempt.
pub type RecoverCallback = Arc<dyn Fn(&str, usize, &Error) + Send + Sync>;

/// Per-connection configuration.
pub struct ConnectionOptions {
    pub heartbeat_interval: Duration,
    pub connection_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub tls: Option<Arc<TlsConfig>>,
    /// Whether the connection lives in a pool's cache or is caller-owned.
    pub cached: bool,
    /// The owner's shutdown token; the connection derives a child from it.
    pub parent_token: CancellationToken,
    pub recover_callback: Option<RecoverCallback>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            // https://www.rabbitmq.com/heartbeats.html#false-positives
            heartbeat_interval: Duration::from_secs(15),
            connection_timeout: Duration::from_secs(30),
            backoff: default_backoff(),
            tls: None,
            cached: false,
            parent_token: CancellationToken::new(),
            recover_callback: None,
        }
    }
}

/// One broker connection plus the state needed to keep it usable: a sticky
/// health flag, the asynchronous close and flow-control notification channels,
/// and a shutdown token derived from its owner's.
///
/// All mutating operations are serialized by a single internal mutex, so at
/// most one connect/recover/pause/error-drain runs at a time per connection.
pub struct Connection<C: BrokerClient> {
    id: u64,
    name: String,
    cached: bool,
    uri: AMQPUri,
    client: Arc<C>,
    dial: DialOptions,
    backoff: BackoffPolicy,
    recover_callback: Option<RecoverCallback>,
    shutdown: CancellationToken,
    inner: Mutex<Inner<C>>,
}

struct Inner<C: BrokerClient> {
    /// Sticky: set on observed or reported errors, cleared only by a
    /// successful recovery.
    flagged: bool,
    handle: Option<C::Handle>,
    close_events: mpsc::Receiver<CloseEvent>,
    blocked_events: mpsc::Receiver<BlockedEvent>,
}

impl<C: BrokerClient> Connection<C> {
    /// Build a connection wrapper without dialing.
    ///
    /// The URL scheme is forced to `amqps` when a TLS configuration is present.
    /// Call [`connect`][Self::connect] (or let the pool recover it) to actually
    /// reach the broker.
    pub fn new(
        client: Arc<C>,
        url: &str,
        name: impl Into<String>,
        id: u64,
        options: ConnectionOptions,
    ) -> Result<Self, Error> {
        let mut uri: AMQPUri = url.parse().map_err(Error::InvalidConnectUrl)?;
        if options.tls.is_some() {
            uri.scheme = AMQPScheme::AMQPS;
        }

        let name = name.into();
        let dial = DialOptions {
            connection_name: name.clone(),
            heartbeat_interval: options.heartbeat_interval,
            connection_timeout: options.connection_timeout,
            tls: options.tls,
        };

        // Start with closed notification channels; `connect` re-creates and
        // subscribes them once a handle exists.
        let (_closed_tx, close_events) = mpsc::channel(NOTIFY_BUFFER);
        let (_blocked_tx, blocked_events) = mpsc::channel(NOTIFY_BUFFER);

        Ok(Self {
            id,
            name,
            cached: options.cached,
            uri,
            client,
            dial,
            backoff: options.backoff,
            recover_callback: options.recover_callback,
            shutdown: options.parent_token.child_token(),
            inner: Mutex::new(Inner {
                flagged: false,
                handle: None,
                close_events,
                blocked_events,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Mark the connection as broken. Sticky: only a successful
    /// [`recover`][Self::recover] clears the flag.
    pub async fn flag(&self, erred: bool) {
        let mut inner = self.inner.lock().await;
        if erred && !inner.flagged {
            inner.flagged = true;
        }
    }

    pub async fn is_flagged(&self) -> bool {
        self.inner.lock().await.flagged
    }

    pub async fn is_closed(&self) -> bool {
        let inner = self.inner.lock().await;
        self.is_closed_locked(&inner)
    }

    fn is_closed_locked(&self, inner: &Inner<C>) -> bool {
        inner.flagged
            || self.shutdown.is_cancelled()
            || inner.handle.as_ref().map_or(true, |h| h.is_closed())
    }

    /// Dial the broker if the connection is closed; a no-op otherwise.
    ///
    /// On success the handle is rebound and both notification channels are
    /// re-created and subscribed. Does not clear the sticky flag.
    pub async fn connect(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        self.connect_locked(&mut inner).await
    }

    async fn connect_locked(&self, inner: &mut Inner<C>) -> Result<(), Error> {
        if !self.is_closed_locked(inner) {
            return Ok(());
        }

        if let Some(old) = inner.handle.take() {
            if !old.is_closed() {
                if let Err(error) = old.close().await {
                    debug!(connection = %self.name, %error, "discarding stale handle");
                }
            }
        }

        let handle = self
            .client
            .dial(&self.uri, &self.dial)
            .await
            .map_err(Error::ConnectionFailed)?;

        let (close_tx, close_events) = mpsc::channel(NOTIFY_BUFFER);
        let (blocked_tx, blocked_events) = mpsc::channel(NOTIFY_BUFFER);
        handle.notify_close(close_tx);
        handle.notify_blocked(blocked_tx);

        inner.handle = Some(handle);
        inner.close_events = close_events;
        inner.blocked_events = blocked_events;
        Ok(())
    }

    /// Return the first pending asynchronous close error and discard the rest.
    ///
    /// Yields `ConnectionClosed` when the shutdown token has fired or when the
    /// client library dropped the notification channel, `None` when nothing is
    /// pending.
    pub async fn error(&self) -> Option<Error> {
        let mut inner = self.inner.lock().await;
        self.error_locked(&mut inner)
    }

    fn error_locked(&self, inner: &mut Inner<C>) -> Option<Error> {
        if self.shutdown.is_cancelled() {
            return Some(Error::ConnectionClosed);
        }
        let mut first = None;
        loop {
            match inner.close_events.try_recv() {
                Ok(event) => {
                    if first.is_none() {
                        warn!(connection = %self.name, reason = %event.reason, "connection closed by broker");
                        first = Some(Error::ConnectionClosed);
                    }
                    // flush everything after the first error
                }
                Err(TryRecvError::Empty) => return first,
                // The client library dropped the notifier; assume it did so
                // because the connection died.
                Err(TryRecvError::Disconnected) => return Some(Error::ConnectionClosed),
            }
        }
    }

    /// Wait while the broker has flow control active.
    ///
    /// Yields immediately when no blocking notification is pending; otherwise
    /// polls with a 1s period until an unblocking notification arrives, the
    /// connection closes or the shutdown token fires.
    pub async fn pause_on_flow_control(&self) {
        let mut inner = self.inner.lock().await;
        self.pause_on_flow_control_locked(&mut inner).await;
    }

    async fn pause_on_flow_control_locked(&self, inner: &mut Inner<C>) {
        let mut blocked = false;
        while !self.is_closed_locked(inner) {
            while let Ok(event) = inner.blocked_events.try_recv() {
                if event.active && !blocked {
                    warn!(connection = %self.name, reason = %event.reason, "broker flow control active, pausing");
                }
                blocked = event.active;
            }
            if !blocked {
                return;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(FLOW_CONTROL_POLL) => {}
            }
        }
    }

    /// Bring the connection back to a healthy state.
    ///
    /// Drains pending close errors first; when none are pending and the
    /// connection is open, only waits out broker flow control. Otherwise
    /// re-dials with the configured backoff until a dial succeeds or a
    /// cancellation fires: the shutdown token yields [`Error::Closed`], the
    /// caller's `ctx` yields [`Error::Cancelled`]. The sticky flag is cleared
    /// on success and on no other path.
    pub async fn recover(&self, ctx: &CancellationToken) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        self.recover_locked(&mut inner, ctx).await
    }

    async fn recover_locked(
        &self,
        inner: &mut Inner<C>,
        ctx: &CancellationToken,
    ) -> Result<(), Error> {
        let healthy = self.error_locked(inner).is_none();
        if healthy && !self.is_closed_locked(inner) {
            self.pause_on_flow_control_locked(inner).await;
            return Ok(());
        }

        for attempt in 0usize.. {
            match self.connect_locked(inner).await {
                Ok(()) => break,
                Err(error) => {
                    let delay = (self.backoff)(attempt);
                    debug!(
                        connection = %self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "reconnect attempt failed, backing off"
                    );
                    if let Some(callback) = &self.recover_callback {
                        callback(&self.name, attempt, &error);
                    }
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(Error::Closed),
                        _ = ctx.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        inner.flagged = false;
        debug!(connection = %self.name, "recovered");
        Ok(())
    }

    /// Open a new session multiplexed over this connection.
    pub(crate) async fn open_session(&self, confirmable: bool) -> Result<C::Session, Error> {
        let inner = self.inner.lock().await;
        let handle = inner.handle.as_ref().ok_or(Error::ConnectionClosed)?;
        handle.open_session(confirmable).await.map_err(Error::Broker)
    }

    /// Trigger the connection's shutdown token, then close the underlying
    /// handle if still open. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.handle.take() {
            if !handle.is_closed() {
                if let Err(error) = handle.close().await {
                    debug!(connection = %self.name, %error, "connection close reported an error");
                }
            }
        }
    }
}
