//! The broker capability consumed by `battenberg-amqp-pool`.
//!
//! The pool never talks to [`lapin`] directly: it is generic over a [`BrokerClient`]
//! that can dial connections, and the handles that connection yields. Notifications
//! (asynchronous closes, broker flow control, publisher confirms) follow the
//! subscription model of the AMQP client libraries: the caller owns a bounded
//! channel and hands the sender to the handle, which pushes events into it for as
//! long as the handle lives.
//!
//! The production implementation is [`AmqpBroker`][crate::rabbit_mq::AmqpBroker];
//! tests substitute scripted in-memory brokers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::uri::AMQPUri;
use tokio::sync::mpsc;

use crate::rabbit_mq::TlsConfig;

/// An asynchronous close notification observed on a connection.
///
/// At most one meaningful event is delivered per established connection.
#[derive(Debug, Clone)]
pub struct CloseEvent {
    /// Human-readable close cause, as reported by the client library.
    pub reason: String,
}

/// A broker flow-control notification.
///
/// `active: true` means the broker asked the client to pause publishing
/// (e.g. it hit a memory or disk alarm); `active: false` lifts the pause.
#[derive(Debug, Clone)]
pub struct BlockedEvent {
    pub active: bool,
    pub reason: String,
}

/// A publisher confirmation for a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirm {
    pub delivery_tag: u64,
    pub ack: bool,
}

/// Per-dial parameters, owned by the connection that dials.
#[derive(Clone)]
pub struct DialOptions {
    /// Reported to the broker as the `connection_name` property; shows up in
    /// the management UI and in server logs.
    pub connection_name: String,
    pub heartbeat_interval: Duration,
    /// Upper bound on a single dial attempt.
    pub connection_timeout: Duration,
    /// Prepared TLS configuration. When present, connections are established
    /// over the `amqps` scheme.
    pub tls: Option<Arc<TlsConfig>>,
}

/// A client capable of dialing broker connections.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    type Handle: ConnectionHandle<Session = Self::Session>;
    type Session: SessionHandle;

    /// Establish a new connection to the broker.
    ///
    /// Must not wait longer than `options.connection_timeout`.
    async fn dial(
        &self,
        uri: &AMQPUri,
        options: &DialOptions,
    ) -> Result<Self::Handle, anyhow::Error>;
}

/// One established broker connection.
#[async_trait]
pub trait ConnectionHandle: Send + Sync + 'static {
    type Session: SessionHandle;

    /// Subscribe to asynchronous close notifications.
    ///
    /// The handle keeps the sender until it is closed; events beyond the
    /// channel capacity are dropped.
    fn notify_close(&self, tx: mpsc::Sender<CloseEvent>);

    /// Subscribe to broker flow-control notifications.
    fn notify_blocked(&self, tx: mpsc::Sender<BlockedEvent>);

    fn is_closed(&self) -> bool;

    /// Close the connection. Idempotent.
    async fn close(&self) -> Result<(), anyhow::Error>;

    /// Open a new multiplexed session on this connection.
    ///
    /// A confirmable session has publisher confirms enabled: every publish is
    /// acknowledged by the broker.
    async fn open_session(&self, confirmable: bool) -> Result<Self::Session, anyhow::Error>;
}

/// One lightweight session multiplexed over a connection.
#[async_trait]
pub trait SessionHandle: Send + Sync + 'static {
    /// Subscribe to publisher confirmations for deliveries published on this session.
    fn notify_confirms(&self, tx: mpsc::Sender<Confirm>);

    /// Publish a payload, returning the delivery tag assigned to it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<u64, anyhow::Error>;

    fn is_closed(&self) -> bool;

    /// Close the session. Idempotent.
    async fn close(&self) -> Result<(), anyhow::Error>;
}
