//! A broker session bound to a pooled connection.

use std::sync::Arc;

use battenberg_amqp::transport::{BrokerClient, Confirm, SessionHandle};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::Error;

pub(crate) struct SessionOptions {
    pub buffer_size: usize,
    pub confirmable: bool,
    pub cached: bool,
    /// Closing the session also closes its connection. Set for transient
    /// sessions, which own their whole connection stack.
    pub auto_close_connection: bool,
    pub parent_token: CancellationToken,
}

/// A lightweight broker session multiplexed over one [`Connection`] for its
/// whole lifetime.
///
/// Confirmable sessions receive publisher confirmations into a bounded queue
/// sized by the pool's buffer size; pending confirmations are flushed before
/// a cached session is handed out again.
pub struct Session<C: BrokerClient> {
    id: u64,
    cached: bool,
    confirmable: bool,
    buffer_size: usize,
    auto_close_connection: bool,
    connection: Arc<Connection<C>>,
    shutdown: CancellationToken,
    inner: Mutex<SessionInner<C>>,
}

struct SessionInner<C: BrokerClient> {
    handle: Option<C::Session>,
    confirms: mpsc::Receiver<Confirm>,
}

impl<C: BrokerClient> Session<C> {
    pub(crate) async fn open(
        connection: Arc<Connection<C>>,
        id: u64,
        options: SessionOptions,
    ) -> Result<Self, Error> {
        let buffer_size = options.buffer_size.max(1);
        // Placeholder channel; `open_handle_locked` subscribes a live one.
        let (_confirms_tx, confirms) = mpsc::channel(buffer_size);
        let session = Self {
            id,
            cached: options.cached,
            confirmable: options.confirmable,
            buffer_size,
            auto_close_connection: options.auto_close_connection,
            connection,
            shutdown: options.parent_token.child_token(),
            inner: Mutex::new(SessionInner {
                handle: None,
                confirms,
            }),
        };
        {
            let mut inner = session.inner.lock().await;
            session.open_handle_locked(&mut inner).await?;
        }
        Ok(session)
    }

    async fn open_handle_locked(&self, inner: &mut SessionInner<C>) -> Result<(), Error> {
        let handle = self.connection.open_session(self.confirmable).await?;
        let (confirms_tx, confirms) = mpsc::channel(self.buffer_size);
        handle.notify_confirms(confirms_tx);
        inner.handle = Some(handle);
        inner.confirms = confirms;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub fn is_confirmable(&self) -> bool {
        self.confirmable
    }

    /// Whether closing this session also closes its connection (the transient
    /// session stack).
    pub(crate) fn owns_connection(&self) -> bool {
        self.auto_close_connection
    }

    pub(crate) fn connection(&self) -> &Arc<Connection<C>> {
        &self.connection
    }

    /// Publish a payload on this session, returning its delivery tag.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<u64, Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }
        let inner = self.inner.lock().await;
        let handle = inner.handle.as_ref().ok_or(Error::ConnectionClosed)?;
        handle
            .publish(exchange, routing_key, payload)
            .await
            .map_err(Error::Broker)
    }

    /// Wait for the next publisher confirmation.
    ///
    /// Only meaningful on confirmable sessions. Races the shutdown token.
    pub async fn await_confirm(&self) -> Result<Confirm, Error> {
        let mut inner = self.inner.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::Closed),
            confirm = inner.confirms.recv() => confirm.ok_or(Error::ConnectionClosed),
        }
    }

    /// Discard confirmations left over from previous usage, so the next
    /// borrower observes an empty confirmation stream.
    pub async fn flush_confirms(&self) {
        let mut inner = self.inner.lock().await;
        while inner.confirms.try_recv().is_ok() {}
    }

    /// Re-establish the session after a fault.
    ///
    /// Recovers the underlying connection (re-dialing with backoff if it is
    /// broken), then opens a fresh session handle on it. Retries until it
    /// succeeds; only a cancellation aborts, surfacing a cancellation-class
    /// error.
    pub async fn recover(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.handle.take() {
            if !handle.is_closed() {
                if let Err(error) = handle.close().await {
                    debug!(session = self.id, %error, "discarding broken session handle");
                }
            }
        }
        loop {
            self.connection.recover(&self.shutdown).await?;
            match self.open_handle_locked(&mut inner).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(
                        session = self.id,
                        connection = %self.connection.name(),
                        %error,
                        "failed to reopen session after connection recovery"
                    );
                    // Force the next pass through a full reconnect with
                    // backoff instead of spinning on a healthy-looking
                    // connection that cannot host sessions.
                    self.connection.flag(true).await;
                }
            }
        }
    }

    /// Close the session handle; also closes the underlying connection when
    /// the session owns it. Idempotent.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.handle.take() {
            if !handle.is_closed() {
                if let Err(error) = handle.close().await {
                    debug!(session = self.id, %error, "session close reported an error");
                }
            }
        }
        if self.auto_close_connection {
            self.connection.close().await;
        }
    }
}
