//! A bounded pool of cached broker sessions layered over a [`ConnectionPool`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use battenberg_amqp::transport::BrokerClient;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection_pool::ConnectionPool;
use crate::error::Error;
use crate::session::{Session, SessionOptions};

/// Configuration for a [`SessionPool`], applied with builder-style setters.
pub struct SessionPoolOptions {
    buffer_size: usize,
    confirmable: bool,
}

impl Default for SessionPoolOptions {
    fn default() -> Self {
        Self {
            // Favors fault tolerance over throughput: at most one unobserved
            // confirmation per session.
            buffer_size: 1,
            confirmable: false,
        }
    }
}

impl SessionPoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capacity of each session's pending-confirmation queue.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Enable publisher confirms on every session the pool creates.
    #[must_use]
    pub fn confirmable(mut self, confirmable: bool) -> Self {
        self.confirmable = confirmable;
        self
    }
}

/// A fixed-size cache of broker sessions held in a FIFO queue, each
/// multiplexed over a connection borrowed from the [`ConnectionPool`].
///
/// The pool's shutdown token is a child of the connection pool's: closing the
/// connection pool cascades here.
pub struct SessionPool<C: BrokerClient> {
    pool: Arc<ConnectionPool<C>>,
    size: usize,
    buffer_size: usize,
    confirmable: bool,

    sessions_tx: async_channel::Sender<Arc<Session<C>>>,
    sessions_rx: async_channel::Receiver<Arc<Session<C>>>,

    shutdown: CancellationToken,
    transient_id: AtomicU64,
    closed: AtomicBool,
}

impl<C: BrokerClient> SessionPool<C> {
    /// Create a pool of `size` eagerly-derived cached sessions.
    pub async fn new(
        pool: Arc<ConnectionPool<C>>,
        size: usize,
        options: SessionPoolOptions,
    ) -> Result<Self, Error> {
        if size == 0 {
            return Err(Error::InvalidPoolSize(size));
        }
        let (sessions_tx, sessions_rx) = async_channel::bounded(size);
        let session_pool = Self {
            shutdown: pool.shutdown_token().child_token(),
            pool,
            size,
            buffer_size: options.buffer_size,
            confirmable: options.confirmable,
            sessions_tx,
            sessions_rx,
            transient_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };
        session_pool.init_cached_sessions().await?;
        info!(pool = %session_pool.pool.name(), size, "session pool initialized");
        Ok(session_pool)
    }

    async fn init_cached_sessions(&self) -> Result<(), Error> {
        for id in 0..self.size as u64 {
            let session = match self.init_cached_session(id).await {
                Ok(session) => session,
                Err(cause) => {
                    self.abort_initialization().await;
                    return Err(Error::PoolInitializationFailed(Box::new(cause)));
                }
            };
            if self.sessions_tx.try_send(session).is_err() {
                unreachable!("session queue sized to the pool cannot fill during initialization");
            }
        }
        Ok(())
    }

    /// Derive one cached session, retrying on fresh connections until it
    /// works or a shutdown unwinds the loop.
    ///
    /// A connection that failed to host the session is returned flagged, so
    /// the next borrower recovers it.
    async fn init_cached_session(&self, id: u64) -> Result<Arc<Session<C>>, Error> {
        loop {
            let connection = self.pool.get_connection(&self.shutdown).await?;
            match Session::open(
                Arc::clone(&connection),
                id,
                SessionOptions {
                    buffer_size: self.buffer_size,
                    confirmable: self.confirmable,
                    cached: true,
                    auto_close_connection: false,
                    parent_token: self.shutdown.clone(),
                },
            )
            .await
            {
                Ok(session) => {
                    self.pool.return_connection(connection, None).await;
                    return Ok(Arc::new(session));
                }
                Err(error) => {
                    warn!(session = id, %error, "failed to derive session, retrying");
                    self.pool.return_connection(connection, Some(&error)).await;
                }
            }
        }
    }

    async fn abort_initialization(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        while let Ok(session) = self.sessions_rx.try_recv() {
            session.close().await;
        }
    }

    /// Acquire a cached session, blocking until one is available.
    /// Returns [`Error::Closed`] on shutdown.
    pub async fn get_session(&self) -> Result<Arc<Session<C>>, Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::Closed),
            result = self.sessions_rx.recv() => result.map_err(|_| Error::Closed),
        }
    }

    /// Create a caller-owned session over a fresh transient connection.
    ///
    /// Returning it closes the whole stack, session and connection both.
    pub async fn get_transient_session(
        &self,
        ctx: &CancellationToken,
    ) -> Result<Arc<Session<C>>, Error> {
        let connection = self.pool.get_transient_connection(ctx).await?;
        let id = self.transient_id.fetch_add(1, Ordering::Relaxed);
        match Session::open(
            Arc::clone(&connection),
            id,
            SessionOptions {
                buffer_size: self.buffer_size,
                confirmable: self.confirmable,
                cached: false,
                auto_close_connection: true,
                parent_token: self.shutdown.clone(),
            },
        )
        .await
        {
            Ok(session) => Ok(Arc::new(session)),
            Err(error) => {
                // Returning the transient connection closes it and settles
                // the live-transient counter.
                self.pool.return_connection(connection, Some(&error)).await;
                Err(error)
            }
        }
    }

    /// Return a session acquired from this pool.
    ///
    /// Transient sessions are closed. A cached session that erred is
    /// recovered before re-entering the rotation; a clean one has leftover
    /// confirmations flushed. When a shutdown races the re-enqueue, the
    /// session is closed instead.
    pub async fn return_session(&self, session: Arc<Session<C>>, erred: bool) {
        if !session.is_cached() {
            session.close().await;
            if session.owns_connection() {
                // Settle the live-transient counter; the connection is already
                // closed, so this is purely bookkeeping.
                self.pool
                    .return_connection(Arc::clone(session.connection()), None)
                    .await;
            }
            return;
        }
        if erred {
            if let Err(error) = session.recover().await {
                // Recovery aborts only on shutdown; drop the session instead
                // of re-enqueueing it.
                debug!(session = session.id(), %error, "discarding session, recovery aborted");
                session.close().await;
                return;
            }
        } else {
            session.flush_confirms().await;
        }
        if self.shutdown.is_cancelled() {
            session.close().await;
            return;
        }
        match self.sessions_tx.try_send(session) {
            Ok(()) => {}
            Err(async_channel::TrySendError::Closed(session)) => session.close().await,
            Err(async_channel::TrySendError::Full(_)) => {
                // Every return matches a prior acquire on a queue sized to
                // the pool; a full queue means the discipline was violated.
                panic!("session pool queue full on return");
            }
        }
    }

    /// Shut the pool down: cancels the shutdown token, then drains the queue
    /// and closes the drained sessions concurrently. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(pool = %self.pool.name(), "closing session pool");
        self.shutdown.cancel();
        let mut closers = Vec::new();
        while let Ok(session) = self.sessions_rx.try_recv() {
            closers.push(async move { session.close().await });
        }
        futures::future::join_all(closers).await;
        info!(pool = %self.pool.name(), "session pool closed");
    }

    /// The number of cached sessions.
    pub fn size(&self) -> usize {
        self.size
    }
}
