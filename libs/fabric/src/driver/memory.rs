use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::driver::{
    ClientSecurity, ConnectorId, Driver, ListenerId, ServerSecurity, Waker, Wakeup,
};
use crate::engine::Connection;
use crate::error::{Error, Result};

/// Host that accepts connections addressed to any host on its port
pub const WILDCARD_HOST: &str = "0.0.0.0";

/// One direction of an in-memory byte stream
#[derive(Debug)]
struct Pipe {
    buf: Mutex<VecDeque<u8>>,
    closed: AtomicBool,
    reader: Arc<Notify>,
}

impl Pipe {
    fn new(reader: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            buf: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            reader,
        })
    }

    fn write(&self, bytes: &[u8]) {
        if self.is_closed() {
            return;
        }
        self.buf.lock().extend(bytes.iter().copied());
        self.reader.notify_one();
    }

    fn read_all(&self) -> Vec<u8> {
        self.buf.lock().drain(..).collect()
    }

    fn has_data(&self) -> bool {
        !self.buf.lock().is_empty()
    }

    fn hang_up(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reader.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closed by the writer and fully read
    fn at_eof(&self) -> bool {
        self.is_closed() && !self.has_data()
    }
}

/// Server-side end of a connection waiting to be accepted
#[derive(Debug)]
struct Incoming {
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
}

#[derive(Debug)]
struct ListenerSlot {
    backlog: VecDeque<Incoming>,
    notify: Arc<Notify>,
}

/// Shared in-process address space that [`MemoryDriver`]s listen and connect on
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<(String, String), ListenerSlot>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn bind(&self, host: &str, port: &str, notify: Arc<Notify>) -> Result<()> {
        let mut listeners = self.listeners.lock();
        let key = (host.to_string(), port.to_string());
        if listeners.contains_key(&key) {
            return Err(Error::Bind(format!("{}:{} (address in use)", host, port)));
        }
        listeners.insert(
            key,
            ListenerSlot {
                backlog: VecDeque::new(),
                notify,
            },
        );
        Ok(())
    }

    fn unbind(&self, host: &str, port: &str) {
        let removed = self
            .listeners
            .lock()
            .remove(&(host.to_string(), port.to_string()));
        if let Some(slot) = removed {
            for pending in slot.backlog {
                pending.inbound.hang_up();
                pending.outbound.hang_up();
            }
        }
    }

    /// Returns the client's (inbound, outbound) pipes, or `None` when refused
    fn connect(&self, host: &str, port: &str, client: Arc<Notify>) -> Option<(Arc<Pipe>, Arc<Pipe>)> {
        let mut listeners = self.listeners.lock();
        let exact = (host.to_string(), port.to_string());
        let wildcard = (WILDCARD_HOST.to_string(), port.to_string());
        let key = if listeners.contains_key(&exact) {
            exact
        } else {
            wildcard
        };
        let slot = listeners.get_mut(&key)?;

        let to_server = Pipe::new(slot.notify.clone());
        let to_client = Pipe::new(client);
        slot.backlog.push_back(Incoming {
            inbound: to_server.clone(),
            outbound: to_client.clone(),
        });
        slot.notify.notify_one();
        Some((to_client, to_server))
    }

    fn take_incoming(&self, host: &str, port: &str) -> Option<Incoming> {
        self.listeners
            .lock()
            .get_mut(&(host.to_string(), port.to_string()))
            .and_then(|slot| slot.backlog.pop_front())
    }

    fn has_incoming(&self, host: &str, port: &str) -> bool {
        self.listeners
            .lock()
            .get(&(host.to_string(), port.to_string()))
            .map(|slot| !slot.backlog.is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug)]
struct Connector {
    inbound: Arc<Pipe>,
    outbound: Arc<Pipe>,
    listener: Option<ListenerId>,
    closed: bool,
    // last process wrote output; give the owner another pass
    shipped: bool,
}

impl Connector {
    fn hang_up(&mut self) {
        self.closed = true;
        self.inbound.hang_up();
        self.outbound.hang_up();
    }

    fn is_ready(&self) -> bool {
        !self.closed && (self.shipped || self.inbound.has_data() || self.inbound.is_closed())
    }
}

/// [`Driver`] over a [`MemoryNetwork`]
///
/// Waits park on a current-thread runtime, so no threads are spawned.
pub struct MemoryDriver {
    network: MemoryNetwork,
    runtime: Runtime,
    notify: Arc<Notify>,
    waker: Waker,
    next_id: u64,
    listeners: BTreeMap<ListenerId, (String, String)>,
    connectors: BTreeMap<ConnectorId, Connector>,
    ready_listeners: VecDeque<ListenerId>,
    ready_connectors: VecDeque<ConnectorId>,
}

impl MemoryDriver {
    pub fn new(network: MemoryNetwork) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let notify = Arc::new(Notify::new());
        Ok(Self {
            network,
            runtime,
            waker: Waker::new(notify.clone()),
            notify,
            next_id: 0,
            listeners: BTreeMap::new(),
            connectors: BTreeMap::new(),
            ready_listeners: VecDeque::new(),
            ready_connectors: VecDeque::new(),
        })
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn collect_ready(&mut self) {
        self.ready_listeners = self
            .listeners
            .iter()
            .filter(|(_, (host, port))| self.network.has_incoming(host, port))
            .map(|(id, _)| *id)
            .collect();
        self.ready_connectors = self
            .connectors
            .iter()
            .filter(|(_, c)| c.is_ready())
            .map(|(id, _)| *id)
            .collect();
    }
}

impl Driver for MemoryDriver {
    fn connect(&mut self, host: &str, port: &str, security: &ClientSecurity) -> Result<ConnectorId> {
        security.validate()?;
        if host.is_empty() {
            return Err(Error::Connect(format!(":{} (empty host)", port)));
        }

        let id = ConnectorId(self.next_id());
        let (inbound, outbound) = match self.network.connect(host, port, self.notify.clone()) {
            Some(pipes) => {
                debug!(host, port, connector = id.0, "connected");
                pipes
            }
            None => {
                warn!(host, port, "connection refused");
                let inbound = Pipe::new(self.notify.clone());
                let outbound = Pipe::new(self.notify.clone());
                inbound.hang_up();
                outbound.hang_up();
                (inbound, outbound)
            }
        };
        self.connectors.insert(
            id,
            Connector {
                inbound,
                outbound,
                listener: None,
                closed: false,
                shipped: false,
            },
        );
        Ok(id)
    }

    fn listen(&mut self, host: &str, port: &str, security: &ServerSecurity) -> Result<ListenerId> {
        security.validate()?;
        self.network.bind(host, port, self.notify.clone())?;
        let id = ListenerId(self.next_id());
        debug!(host, port, listener = id.0, "listening");
        self.listeners
            .insert(id, (host.to_string(), port.to_string()));
        Ok(id)
    }

    fn close_listener(&mut self, listener: ListenerId) {
        if let Some((host, port)) = self.listeners.remove(&listener) {
            self.network.unbind(&host, &port);
        }
    }

    fn listeners(&self) -> Vec<ListenerId> {
        self.listeners.keys().copied().collect()
    }

    fn connectors(&self) -> Vec<ConnectorId> {
        self.connectors.keys().copied().collect()
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Wakeup> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.waker.take() {
                return Ok(Wakeup::Interrupted);
            }
            self.collect_ready();
            if !self.ready_listeners.is_empty() || !self.ready_connectors.is_empty() {
                return Ok(Wakeup::Ready);
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Wakeup::TimedOut);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            let notify = self.notify.clone();
            self.runtime.block_on(async move {
                match remaining {
                    Some(remaining) => {
                        let _ = tokio::time::timeout(remaining, notify.notified()).await;
                    }
                    None => notify.notified().await,
                }
            });
        }
    }

    fn ready_listener(&mut self) -> Option<ListenerId> {
        self.ready_listeners.pop_front()
    }

    fn accept(&mut self, listener: ListenerId) -> Result<Option<ConnectorId>> {
        let Some((host, port)) = self.listeners.get(&listener).cloned() else {
            return Ok(None);
        };
        let Some(incoming) = self.network.take_incoming(&host, &port) else {
            return Ok(None);
        };
        let id = ConnectorId(self.next_id());
        debug!(host = %host, port = %port, connector = id.0, "accepted");
        self.connectors.insert(
            id,
            Connector {
                inbound: incoming.inbound,
                outbound: incoming.outbound,
                listener: Some(listener),
                closed: false,
                shipped: false,
            },
        );
        Ok(Some(id))
    }

    fn ready_connector(&mut self) -> Option<ConnectorId> {
        self.ready_connectors.pop_front()
    }

    fn process(&mut self, connector: ConnectorId, connection: &mut Connection) -> Result<()> {
        let Some(c) = self.connectors.get_mut(&connector) else {
            return Ok(());
        };
        if c.closed {
            return Ok(());
        }

        let input = c.inbound.read_all();
        if !input.is_empty() {
            if let Err(e) = connection.input(&input) {
                c.hang_up();
                return Err(e);
            }
        }

        let output = connection.output()?;
        c.shipped = !output.is_empty();
        if c.shipped {
            c.outbound.write(&output);
        }

        if connection.transport_closed() || c.inbound.at_eof() {
            debug!(connector = connector.0, "hanging up");
            c.hang_up();
        }
        Ok(())
    }

    fn closed(&self, connector: ConnectorId) -> bool {
        self.connectors
            .get(&connector)
            .map(|c| c.closed)
            .unwrap_or(true)
    }

    fn close(&mut self, connector: ConnectorId) {
        if let Some(mut c) = self.connectors.remove(&connector) {
            c.hang_up();
        }
    }

    fn listener_of(&self, connector: ConnectorId) -> Option<ListenerId> {
        self.connectors.get(&connector).and_then(|c| c.listener)
    }

    fn waker(&self) -> Waker {
        self.waker.clone()
    }
}

impl Drop for MemoryDriver {
    fn drop(&mut self) {
        for (host, port) in self.listeners.values() {
            self.network.unbind(host, port);
        }
        for connector in self.connectors.values_mut() {
            connector.hang_up();
        }
    }
}
