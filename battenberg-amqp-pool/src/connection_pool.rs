//! A bounded pool of cached broker connections, plus on-demand transients.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use battenberg_amqp::configuration::BrokerSettings;
use battenberg_amqp::rabbit_mq::TlsConfig;
use battenberg_amqp::transport::BrokerClient;
use lapin::uri::AMQPUri;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{default_backoff, BackoffPolicy};
use crate::connection::{Connection, ConnectionOptions, RecoverCallback};
use crate::error::{flaggable, Error};

/// Configuration for a [`ConnectionPool`], applied with builder-style setters.
pub struct ConnectionPoolOptions {
    name: String,
    heartbeat_interval: Duration,
    connection_timeout: Duration,
    backoff: BackoffPolicy,
    tls: Option<Arc<TlsConfig>>,
    parent_token: CancellationToken,
    recover_callback: Option<RecoverCallback>,
}

impl Default for ConnectionPoolOptions {
    fn default() -> Self {
        Self {
            name: "battenberg".into(),
            heartbeat_interval: Duration::from_secs(15),
            connection_timeout: Duration::from_secs(30),
            backoff: default_backoff(),
            tls: None,
            parent_token: CancellationToken::new(),
            recover_callback: None,
        }
    }
}

impl ConnectionPoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool name; prefixed to the name of every connection the pool creates.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Connections are established over `amqps` when a TLS configuration is set.
    #[must_use]
    pub fn tls(mut self, tls: Option<Arc<TlsConfig>>) -> Self {
        self.tls = tls;
        self
    }

    /// Apply [`BrokerSettings`]: the dial timeout and, when configured, the
    /// prepared TLS configuration (connections then dial over `amqps`).
    ///
    /// Fails when the settings carry a CA certificate chain that cannot be
    /// parsed. Pair with [`BrokerSettings::url`] for the pool's connect URL.
    pub fn broker_settings(self, settings: &BrokerSettings) -> Result<Self, Error> {
        let tls = TlsConfig::from_settings(settings).map_err(Error::Broker)?;
        let mut options = self.tls(tls);
        if let Some(timeout) = settings.connection_timeout() {
            options = options.connection_timeout(timeout);
        }
        Ok(options)
    }

    /// Closing the parent token cascades into the pool and all of its connections.
    #[must_use]
    pub fn parent_token(mut self, token: CancellationToken) -> Self {
        self.parent_token = token;
        self
    }

    #[must_use]
    pub fn recover_callback(mut self, callback: RecoverCallback) -> Self {
        self.recover_callback = Some(callback);
        self
    }
}

/// A fixed-size cache of broker connections held in a FIFO queue, with
/// unbounded caller-owned transient connections layered on top.
///
/// Acquiring removes a connection from the queue; returning puts it back,
/// flagged when the caller observed a broker error. The queue capacity equals
/// the pool size, so at any quiescent moment `idle + in-use = size`.
pub struct ConnectionPool<C: BrokerClient> {
    name: String,
    url: String,
    size: usize,
    client: Arc<C>,

    heartbeat_interval: Duration,
    connection_timeout: Duration,
    backoff: BackoffPolicy,
    tls: Option<Arc<TlsConfig>>,
    recover_callback: Option<RecoverCallback>,

    connections_tx: async_channel::Sender<Arc<Connection<C>>>,
    connections_rx: async_channel::Receiver<Arc<Connection<C>>>,

    shutdown: CancellationToken,
    transient_id: AtomicU64,
    transient_active: AtomicUsize,
    closed: AtomicBool,
}

impl<C: BrokerClient> ConnectionPool<C> {
    /// Create a pool of `size` eagerly-dialed cached connections.
    ///
    /// If any connection fails to initialize, the ones already established are
    /// closed and [`Error::PoolInitializationFailed`] is returned.
    pub async fn new(
        client: C,
        url: &str,
        size: usize,
        options: ConnectionPoolOptions,
    ) -> Result<Self, Error> {
        if size == 0 {
            return Err(Error::InvalidPoolSize(size));
        }
        // Validate up front; every connection re-parses and normalizes the URL
        // when it dials.
        let _: AMQPUri = url.parse().map_err(Error::InvalidConnectUrl)?;

        let (connections_tx, connections_rx) = async_channel::bounded(size);
        let pool = Self {
            name: options.name,
            url: url.to_owned(),
            size,
            client: Arc::new(client),
            heartbeat_interval: options.heartbeat_interval,
            connection_timeout: options.connection_timeout,
            backoff: options.backoff,
            tls: options.tls,
            recover_callback: options.recover_callback,
            connections_tx,
            connections_rx,
            shutdown: options.parent_token.child_token(),
            transient_id: AtomicU64::new(0),
            transient_active: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        };

        debug!(pool = %pool.name, size, "initializing pool connections");
        match pool.init_cached_connections().await {
            Ok(()) => {
                info!(pool = %pool.name, size, "connection pool initialized");
                Ok(pool)
            }
            Err(error) => {
                warn!(pool = %pool.name, %error, "failed to initialize pool connections");
                Err(error)
            }
        }
    }

    async fn init_cached_connections(&self) -> Result<(), Error> {
        for id in 0..self.size as u64 {
            let connection = match self.init_cached_connection(id).await {
                Ok(connection) => connection,
                Err(cause) => {
                    self.abort_initialization().await;
                    return Err(Error::PoolInitializationFailed(Box::new(cause)));
                }
            };
            if self.connections_tx.try_send(connection).is_err() {
                unreachable!("pool queue sized to the pool cannot fill during initialization");
            }
        }
        Ok(())
    }

    async fn init_cached_connection(&self, id: u64) -> Result<Arc<Connection<C>>, Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let connection = Arc::new(self.derive_connection(id, true)?);
        connection.connect().await?;
        Ok(connection)
    }

    /// Cancel and close whatever was established before initialization failed.
    async fn abort_initialization(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
        while let Ok(connection) = self.connections_rx.try_recv() {
            connection.close().await;
        }
    }

    fn derive_connection(&self, id: u64, cached: bool) -> Result<Connection<C>, Error> {
        let name = if cached {
            format!("{}-cached-connection-{}", self.name, id)
        } else {
            format!("{}-transient-connection-{}", self.name, id)
        };
        Connection::new(
            Arc::clone(&self.client),
            &self.url,
            name,
            id,
            ConnectionOptions {
                heartbeat_interval: self.heartbeat_interval,
                connection_timeout: self.connection_timeout,
                backoff: Arc::clone(&self.backoff),
                tls: self.tls.clone(),
                cached,
                parent_token: self.shutdown.clone(),
                recover_callback: self.recover_callback.clone(),
            },
        )
    }

    /// Acquire a cached connection, blocking until one is available.
    ///
    /// A flagged connection is recovered before it is handed out. Returns
    /// [`Error::Cancelled`] when `ctx` fires first and [`Error::Closed`] when
    /// the pool shuts down.
    pub async fn get_connection(
        &self,
        ctx: &CancellationToken,
    ) -> Result<Arc<Connection<C>>, Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let connection = tokio::select! {
            result = self.connections_rx.recv() => result.map_err(|_| Error::Closed)?,
            _ = ctx.cancelled() => return Err(Error::Cancelled),
            _ = self.shutdown.cancelled() => return Err(Error::Closed),
        };
        if connection.is_flagged().await {
            if let Err(error) = connection.recover(ctx).await {
                // Recovery aborts only on cancellation. Keep the connection in
                // rotation so close() can still account for all of them.
                let _ = self.connections_tx.try_send(connection);
                return Err(error);
            }
        }
        Ok(connection)
    }

    /// Create a caller-owned transient connection outside the cache.
    ///
    /// When the initial dial fails, the half-built connection is recovered
    /// with backoff, honoring `ctx`.
    pub async fn get_transient_connection(
        &self,
        ctx: &CancellationToken,
    ) -> Result<Arc<Connection<C>>, Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let id = self.transient_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(self.derive_connection(id, false)?);
        if let Err(error) = connection.connect().await {
            debug!(
                pool = %self.name,
                connection = %connection.name(),
                %error,
                "transient connection failed to dial, entering recovery"
            );
            connection.recover(ctx).await?;
        }
        self.transient_active.fetch_add(1, Ordering::Relaxed);
        Ok(connection)
    }

    /// Return a connection acquired from this pool.
    ///
    /// Transient connections are closed. Cached connections are flagged when
    /// `err` carries a broker error (cancellation never flags) and put back in
    /// the rotation.
    pub async fn return_connection(&self, connection: Arc<Connection<C>>, err: Option<&Error>) {
        if !connection.is_cached() {
            self.transient_active.fetch_sub(1, Ordering::Relaxed);
            connection.close().await;
            return;
        }
        connection.flag(flaggable(err)).await;
        if self.connections_tx.try_send(connection).is_err() {
            // The queue is sized to the pool and every return matches a prior
            // acquire; a full queue means the discipline was violated.
            panic!("connection pool queue full on return");
        }
    }

    /// Shut the pool down: cancels the shutdown token (cascading into every
    /// connection and derived session pool), then closes all cached
    /// connections as they come back. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(pool = %self.name, "closing connection pool");
        self.shutdown.cancel();
        let closers = (0..self.size).map(|_| {
            let connections = self.connections_rx.clone();
            async move {
                if let Ok(connection) = connections.recv().await {
                    connection.close().await;
                }
            }
        });
        futures::future::join_all(closers).await;
        info!(pool = %self.name, "connection pool closed");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The number of cached connections, excluding transients.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The number of live transient connections.
    pub fn stat_transient_active(&self) -> usize {
        self.transient_active.load(Ordering::Relaxed)
    }

    /// The number of idle cached connections.
    pub fn stat_cached_idle(&self) -> usize {
        self.connections_rx.len()
    }

    /// The number of cached connections currently on loan.
    pub fn stat_cached_active(&self) -> usize {
        self.size - self.connections_rx.len()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}
