//! A scriptable in-memory broker implementing the transport capability.
//!
//! Dial and open-session attempts can be made to fail on demand, and every
//! handle records its notification subscriptions so tests can inject close
//! and flow-control events as the broker would.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use battenberg_amqp::transport::{
    BlockedEvent, BrokerClient, CloseEvent, Confirm, ConnectionHandle, DialOptions, SessionHandle,
};
use lapin::uri::{AMQPScheme, AMQPUri};
use tokio::sync::mpsc;

#[derive(Clone, Default)]
pub struct ScriptedBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    dial_attempts: AtomicUsize,
    session_attempts: AtomicUsize,
    fail_dials: AtomicUsize,
    fail_sessions: AtomicUsize,
    failing_dial_attempts: Mutex<HashSet<usize>>,
    dial_profiles: Mutex<Vec<DialProfile>>,
    handles: Mutex<Vec<ScriptedHandle>>,
    sessions: Mutex<Vec<ScriptedSession>>,
}

/// How one dial attempt was configured.
#[derive(Clone)]
pub struct DialProfile {
    /// The dial used the `amqps` scheme and carried a TLS configuration.
    pub secured: bool,
    pub connection_timeout: Duration,
}

/// Consume one scripted failure, if any are left.
fn take_scripted_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl ScriptedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` dial attempts.
    pub fn fail_next_dials(&self, n: usize) {
        self.state.fail_dials.store(n, Ordering::SeqCst);
    }

    /// Fail one specific dial attempt (1-based, counted across the broker).
    pub fn fail_dial_attempt(&self, attempt: usize) {
        self.state
            .failing_dial_attempts
            .lock()
            .unwrap()
            .insert(attempt);
    }

    /// Fail the next `n` open-session attempts, across all handles.
    pub fn fail_next_sessions(&self, n: usize) {
        self.state.fail_sessions.store(n, Ordering::SeqCst);
    }

    pub fn dial_attempts(&self) -> usize {
        self.state.dial_attempts.load(Ordering::SeqCst)
    }

    pub fn session_attempts(&self) -> usize {
        self.state.session_attempts.load(Ordering::SeqCst)
    }

    /// How the `index`-th dial attempt was configured.
    pub fn dial_profile(&self, index: usize) -> DialProfile {
        self.state.dial_profiles.lock().unwrap()[index].clone()
    }

    /// The `index`-th handle ever dialed.
    pub fn handle(&self, index: usize) -> ScriptedHandle {
        self.state.handles.lock().unwrap()[index].clone()
    }

    pub fn last_session(&self) -> ScriptedSession {
        self.state
            .sessions
            .lock()
            .unwrap()
            .last()
            .expect("no session has been opened")
            .clone()
    }

    /// Connection names, in dial order.
    pub fn dialed_names(&self) -> Vec<String> {
        self.state
            .handles
            .lock()
            .unwrap()
            .iter()
            .map(|h| h.inner.name.clone())
            .collect()
    }
}

#[async_trait]
impl BrokerClient for ScriptedBroker {
    type Handle = ScriptedHandle;
    type Session = ScriptedSession;

    async fn dial(
        &self,
        uri: &AMQPUri,
        options: &DialOptions,
    ) -> Result<ScriptedHandle, anyhow::Error> {
        self.state.dial_profiles.lock().unwrap().push(DialProfile {
            secured: uri.scheme == AMQPScheme::AMQPS && options.tls.is_some(),
            connection_timeout: options.connection_timeout,
        });
        let attempt = self.state.dial_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self
            .state
            .failing_dial_attempts
            .lock()
            .unwrap()
            .remove(&attempt);
        if scripted || take_scripted_failure(&self.state.fail_dials) {
            anyhow::bail!("scripted dial failure (attempt {attempt})");
        }
        let handle = ScriptedHandle {
            inner: Arc::new(HandleState {
                name: options.connection_name.clone(),
                closed: AtomicBool::new(false),
                broker: Arc::clone(&self.state),
                close_tx: Mutex::new(None),
                blocked_tx: Mutex::new(None),
            }),
        };
        self.state.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }
}

#[derive(Clone)]
pub struct ScriptedHandle {
    inner: Arc<HandleState>,
}

struct HandleState {
    name: String,
    closed: AtomicBool,
    broker: Arc<BrokerState>,
    close_tx: Mutex<Option<mpsc::Sender<CloseEvent>>>,
    blocked_tx: Mutex<Option<mpsc::Sender<BlockedEvent>>>,
}

impl ScriptedHandle {
    /// Close the connection from the broker side and deliver the
    /// asynchronous close notification, as a real broker failure would.
    pub fn inject_close(&self, reason: &str) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(tx) = self.inner.close_tx.lock().unwrap().clone() {
            let _ = tx.try_send(CloseEvent {
                reason: reason.into(),
            });
        }
    }

    /// Inject a flow-control notification.
    pub fn inject_blocked(&self, active: bool) {
        if let Some(tx) = self.inner.blocked_tx.lock().unwrap().clone() {
            let _ = tx.try_send(BlockedEvent {
                active,
                reason: "scripted resource alarm".into(),
            });
        }
    }
}

#[async_trait]
impl ConnectionHandle for ScriptedHandle {
    type Session = ScriptedSession;

    fn notify_close(&self, tx: mpsc::Sender<CloseEvent>) {
        *self.inner.close_tx.lock().unwrap() = Some(tx);
    }

    fn notify_blocked(&self, tx: mpsc::Sender<BlockedEvent>) {
        *self.inner.blocked_tx.lock().unwrap() = Some(tx);
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn open_session(&self, confirmable: bool) -> Result<ScriptedSession, anyhow::Error> {
        self.inner.broker.session_attempts.fetch_add(1, Ordering::SeqCst);
        if take_scripted_failure(&self.inner.broker.fail_sessions) {
            anyhow::bail!("scripted session failure");
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            anyhow::bail!("connection is closed");
        }
        let session = ScriptedSession {
            inner: Arc::new(SessionState {
                confirmable,
                closed: AtomicBool::new(false),
                publish_seq: AtomicU64::new(0),
                confirms_tx: Mutex::new(None),
            }),
        };
        self.inner.broker.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

#[derive(Clone)]
pub struct ScriptedSession {
    inner: Arc<SessionState>,
}

struct SessionState {
    confirmable: bool,
    closed: AtomicBool,
    publish_seq: AtomicU64,
    confirms_tx: Mutex<Option<mpsc::Sender<Confirm>>>,
}

#[async_trait]
impl SessionHandle for ScriptedSession {
    fn notify_confirms(&self, tx: mpsc::Sender<Confirm>) {
        *self.inner.confirms_tx.lock().unwrap() = Some(tx);
    }

    async fn publish(
        &self,
        _exchange: &str,
        _routing_key: &str,
        _payload: &[u8],
    ) -> Result<u64, anyhow::Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            anyhow::bail!("session is closed");
        }
        let delivery_tag = self.inner.publish_seq.fetch_add(1, Ordering::SeqCst) + 1;
        if self.inner.confirmable {
            // Acks are delivered immediately; overflow beyond the buffer is
            // dropped, like a slow consumer would experience.
            if let Some(tx) = self.inner.confirms_tx.lock().unwrap().clone() {
                let _ = tx.try_send(Confirm {
                    delivery_tag,
                    ack: true,
                });
            }
        }
        Ok(delivery_tag)
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
