use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::engine::Connection;
use crate::error::Result;

pub mod memory;
pub mod security;

pub use self::memory::{MemoryDriver, MemoryNetwork};
pub use self::security::{ClientSecurity, ClientTls, PeerVerification, Sasl, ServerSecurity, TlsCredentials};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectorId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// Why a wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Ready,
    TimedOut,
    Interrupted,
}

/// Thread-safe handle that breaks a driver out of `wait`
///
/// Carries no data; the waiting side only re-checks its exit condition.
#[derive(Debug, Clone)]
pub struct Waker {
    notify: Arc<Notify>,
    interrupted: Arc<AtomicBool>,
}

impl Waker {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self {
            notify,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn wake(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Consume a pending wakeup
    pub fn take(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }
}

/// I/O multiplexer over connectors (connections) and listeners
///
/// Readiness is collected by [`Driver::wait`] and then drained with
/// [`Driver::ready_listener`] and [`Driver::ready_connector`].
pub trait Driver {
    /// Open an outbound connector
    fn connect(&mut self, host: &str, port: &str, security: &ClientSecurity) -> Result<ConnectorId>;

    /// Bind a listener
    fn listen(&mut self, host: &str, port: &str, security: &ServerSecurity) -> Result<ListenerId>;

    fn close_listener(&mut self, listener: ListenerId);

    fn listeners(&self) -> Vec<ListenerId>;

    fn connectors(&self) -> Vec<ConnectorId>;

    /// Block until something is ready, the timeout passes or a waker fires
    ///
    /// `None` waits forever.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Wakeup>;

    fn ready_listener(&mut self) -> Option<ListenerId>;

    /// Take one pending inbound connection from a listener
    fn accept(&mut self, listener: ListenerId) -> Result<Option<ConnectorId>>;

    fn ready_connector(&mut self) -> Option<ConnectorId>;

    /// Move bytes between the connector and its connection in both directions
    fn process(&mut self, connector: ConnectorId, connection: &mut Connection) -> Result<()>;

    /// The connector is finished: closed locally or hung up by the peer
    fn closed(&self, connector: ConnectorId) -> bool;

    /// Close and forget a connector
    fn close(&mut self, connector: ConnectorId);

    /// Listener that accepted this connector, if any
    fn listener_of(&self, connector: ConnectorId) -> Option<ListenerId>;

    fn waker(&self) -> Waker;
}
