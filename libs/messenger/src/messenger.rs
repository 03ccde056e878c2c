use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use courier_core::{Direction, Error, Progress, Result, Status, Tracker, UpdateFlags};
use courier_fabric::{
    driver::{ConnectorId, ListenerId, Waker},
    error::Error as FabricError,
    ConnectionId, Disposition, Driver, Message, Rules, State, Store, Transform,
};
use tracing::debug;

use crate::config::MessengerConfig;
use crate::context::{Endpoint, LinkKey, ListenerContext};
use crate::rewrite;
use crate::scheduler::CreditScheduler;
use crate::subscription::Subscription;

/// Initial encode buffer; doubled until the message fits
const ENCODE_BUFFER: usize = 1024;

/// Application-facing messaging endpoint
///
/// Multiplexes any number of addresses over a few connections opened
/// through a [`Driver`]. All work happens on the calling thread inside
/// `put`, `send`, `recv`, `get`, `work` and `stop`; only
/// [`interrupt`](Self::interrupt) may be used from elsewhere, through an
/// [`interrupter`](Self::interrupter).
pub struct Messenger<D: Driver> {
    pub(crate) config: MessengerConfig,
    pub(crate) driver: D,
    pub(crate) waker: Waker,

    pub(crate) connections: BTreeMap<ConnectionId, Endpoint>,
    pub(crate) by_connector: BTreeMap<ConnectorId, ConnectionId>,
    pub(crate) listeners: BTreeMap<ListenerId, ListenerContext>,
    pub(crate) subscriptions: Vec<Subscription>,

    pub(crate) scheduler: CreditScheduler<LinkKey>,
    pub(crate) outgoing: Store<()>,
    pub(crate) incoming: Store<Subscription>,
    pub(crate) routes: Rules,
    pub(crate) rewrites: Rules,

    pub(crate) outgoing_tracker: Option<Tracker>,
    pub(crate) incoming_tracker: Option<Tracker>,
    pub(crate) incoming_subscription: Option<Subscription>,

    pub(crate) next_tag: u64,
    pub(crate) next_connection: u64,
    pub(crate) next_link: u64,
    pub(crate) connection_error: bool,
    pub(crate) worked: bool,
    pub(crate) send_threshold: usize,
}

impl<D: Driver> Messenger<D> {
    /// Create a messenger with a generated name and default settings
    pub fn new(driver: D) -> Self {
        Self::with_config(driver, MessengerConfig::default())
    }

    pub fn with_config(driver: D, config: MessengerConfig) -> Self {
        let mut outgoing = Store::new();
        outgoing.set_window(config.outgoing_window);
        let mut incoming = Store::new();
        incoming.set_window(config.incoming_window);

        Self {
            waker: driver.waker(),
            driver,
            connections: BTreeMap::new(),
            by_connector: BTreeMap::new(),
            listeners: BTreeMap::new(),
            subscriptions: Vec::new(),
            scheduler: CreditScheduler::new(config.credit.drain_grace, config.credit.top_up_ratio),
            outgoing,
            incoming,
            routes: Rules::new(),
            rewrites: Rules::new(),
            outgoing_tracker: None,
            incoming_tracker: None,
            incoming_subscription: None,
            next_tag: 0,
            next_connection: 0,
            next_link: 0,
            connection_error: false,
            worked: false,
            send_threshold: 0,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.config.timeout
    }

    /// Deadline for blocking operations, `None` waits forever
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.config.timeout = timeout;
    }

    pub fn is_blocking(&self) -> bool {
        self.config.blocking
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        self.config.blocking = blocking;
    }

    pub fn set_certificate(&mut self, path: Option<PathBuf>) {
        self.config.credentials.certificate = path;
    }

    pub fn set_private_key(&mut self, path: Option<PathBuf>) {
        self.config.credentials.private_key = path;
    }

    pub fn set_password(&mut self, password: Option<String>) {
        self.config.credentials.password = password;
    }

    pub fn set_trusted_certificates(&mut self, path: Option<PathBuf>) {
        self.config.credentials.trusted_certificates = path;
    }

    pub fn outgoing_window(&self) -> u32 {
        self.outgoing.window()
    }

    /// Number of sent messages whose status stays queryable
    ///
    /// A non-zero window also makes new sender links wait for the peer's
    /// disposition instead of sending pre-settled.
    pub fn set_outgoing_window(&mut self, window: u32) {
        self.config.outgoing_window = window;
        self.outgoing.set_window(window);
        self.apply_actions();
    }

    pub fn incoming_window(&self) -> u32 {
        self.incoming.window()
    }

    pub fn set_incoming_window(&mut self, window: u32) {
        self.config.incoming_window = window;
        self.incoming.set_window(window);
        self.apply_actions();
    }

    /// Nothing to do before the first operation; kept for symmetry with `stop`
    pub fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close every link, connection and listener and wait for the
    /// connections to go away
    pub fn stop(&mut self) -> Result<Progress> {
        for endpoint in self.connections.values_mut() {
            let connection = &mut endpoint.connection;
            for link in connection.link_ids() {
                let active = connection
                    .link(link)
                    .map(|l| l.local_state() == State::Active)
                    .unwrap_or(false);
                if active {
                    connection.close_link(link);
                }
            }
            connection.close();
        }

        let listeners: Vec<ListenerId> = self.listeners.keys().copied().collect();
        for listener in listeners {
            self.driver.close_listener(listener);
            self.listeners.remove(&listener);
        }

        self.sync(|m| m.stopped())
    }

    /// No connections remain
    pub fn stopped(&self) -> bool {
        self.driver.connectors().is_empty()
    }

    /// Route matching addresses to a different peer before connecting
    pub fn route(&mut self, pattern: &str, address: &str) {
        self.routes.rule(pattern, address);
    }

    /// Rewrite the address carried by matching outgoing messages
    pub fn rewrite(&mut self, pattern: &str, address: &str) {
        self.rewrites.rule(pattern, address);
    }

    /// Queue a message for its address
    ///
    /// The message itself is left untouched: reply-to expansion and
    /// rewriting only apply to the encoded copy.
    pub fn put(&mut self, message: &Message) -> Result<Tracker> {
        let mut msg = message.clone();
        rewrite::munge_reply_to(&self.config.name, &mut msg);

        let address = msg.address().unwrap_or_default().to_string();
        if msg.address().is_some() {
            let rewritten = rewrite::rewrite(&self.rewrites, &address)?;
            msg.set_address(Some(rewritten));
        }
        let bytes = encode(&msg)?;

        let entry = self.outgoing.put(&address, bytes);
        let sequence = self
            .outgoing
            .track(entry)
            .ok_or_else(|| Error::generic("store error"))?;
        let tracker = Tracker::outgoing(sequence);
        self.outgoing_tracker = Some(tracker);
        self.apply_actions();

        let sender = match self.resolve_link(&address, true) {
            Ok(sender) => sender,
            Err(e) => {
                self.outgoing.free(entry);
                self.apply_actions();
                return Err(e);
            }
        };

        match sender {
            Some(key) => {
                let ready = self
                    .connections
                    .get(&key.connection)
                    .and_then(|e| e.connection.link(key.link))
                    .map(|l| l.remote_state() == State::Active)
                    .unwrap_or(false);
                if ready {
                    self.pump_out(key)?;
                }
            }
            None if self.connection_error => {
                debug!(%tracker, "aborting message, connection failed");
                self.outgoing.set_status(entry, Status::Aborted);
                self.outgoing.free(entry);
                self.apply_actions();
            }
            None => {}
        }
        Ok(tracker)
    }

    /// Send queued messages until at most `outgoing_count - n` remain
    /// unacknowledged, or all of them for `None`
    pub fn send(&mut self, n: Option<usize>) -> Result<Progress> {
        self.send_threshold = match n {
            None => 0,
            Some(n) => self.outgoing_count().saturating_sub(n),
        };
        self.sync(Self::sent)
    }

    /// Wait for incoming messages
    ///
    /// `Some(n)` asks for `n` messages in total; `None` keeps receiving
    /// with automatic credit.
    pub fn recv(&mut self, n: Option<u32>) -> Result<Progress> {
        if self.config.blocking && self.no_sources() {
            return Err(Error::state("no valid sources"));
        }

        match n {
            None => self.scheduler.set_auto(self.config.credit.batch),
            Some(n) => self.scheduler.set_explicit(n),
        }
        self.flow();

        let progress = self.sync(Self::received)?;
        if self.incoming_count() == 0 && self.config.blocking && self.no_sources() {
            return Err(Error::state("no valid sources"));
        }
        Ok(progress)
    }

    /// Take the oldest received message, `None` when there is none
    pub fn get(&mut self) -> Result<Option<Message>> {
        let Some(entry) = self.incoming.get(None) else {
            return Ok(None);
        };

        self.incoming_tracker = self.incoming.track(entry).map(Tracker::incoming);
        let (bytes, subscription) = match self.incoming.entry(entry) {
            Some(e) => (e.bytes().to_vec(), e.context().cloned()),
            None => (Vec::new(), None),
        };
        self.incoming_subscription = subscription;
        self.incoming.free(entry);
        self.apply_actions();

        Message::decode(&bytes)
            .map(Some)
            .map_err(|e| Error::generic(format!("error decoding message: {}", e)))
    }

    /// Drive I/O until something happens or the timeout passes
    ///
    /// Returns whether any work was done; `None` waits forever.
    pub fn work(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.worked = false;
        match self.tsync(Self::has_worked, timeout) {
            Ok(()) => Ok(self.worked),
            Err(Error::Timeout) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Break a blocking call out of its wait
    pub fn interrupt(&self) {
        self.waker.wake();
    }

    /// Handle for interrupting this messenger from another thread
    pub fn interrupter(&self) -> Waker {
        self.waker.clone()
    }

    pub fn outgoing_tracker(&self) -> Option<Tracker> {
        self.outgoing_tracker
    }

    pub fn incoming_tracker(&self) -> Option<Tracker> {
        self.incoming_tracker
    }

    /// Subscription the last message taken by `get` arrived on
    pub fn incoming_subscription(&self) -> Option<&Subscription> {
        self.incoming_subscription.as_ref()
    }

    pub fn status(&self, tracker: Tracker) -> Status {
        let entry = match tracker.direction() {
            Direction::Outgoing => self
                .outgoing
                .lookup(tracker.sequence())
                .and_then(|id| self.outgoing.entry(id))
                .map(|e| e.status()),
            Direction::Incoming => self
                .incoming
                .lookup(tracker.sequence())
                .and_then(|id| self.incoming.entry(id))
                .map(|e| e.status()),
        };
        entry.unwrap_or(Status::Unknown)
    }

    /// Whether the tracked message is still held locally, not yet on the wire
    pub fn buffered(&self, tracker: Tracker) -> bool {
        let delivery = match tracker.direction() {
            Direction::Outgoing => self
                .outgoing
                .lookup(tracker.sequence())
                .and_then(|id| self.outgoing.entry(id))
                .map(|e| e.delivery()),
            Direction::Incoming => self
                .incoming
                .lookup(tracker.sequence())
                .and_then(|id| self.incoming.entry(id))
                .map(|e| e.delivery()),
        };
        match delivery {
            None => false,
            Some(None) => true,
            Some(Some(delivery)) => self
                .connections
                .get(&delivery.connection)
                .map(|e| e.connection.buffered(delivery.delivery))
                .unwrap_or(false),
        }
    }

    /// Settle the tracked message, and earlier ones with [`UpdateFlags::CUMULATIVE`]
    pub fn settle(&mut self, tracker: Tracker, flags: UpdateFlags) {
        match tracker.direction() {
            Direction::Outgoing => {
                self.outgoing
                    .update(tracker.sequence(), None, flags, true, true);
            }
            Direction::Incoming => {
                self.incoming
                    .update(tracker.sequence(), None, flags, true, true);
            }
        }
        self.apply_actions();
    }

    pub fn accept(&mut self, tracker: Tracker, flags: UpdateFlags) -> Result<()> {
        self.dispose(tracker, flags, Disposition::Accepted)
    }

    pub fn reject(&mut self, tracker: Tracker, flags: UpdateFlags) -> Result<()> {
        self.dispose(tracker, flags, Disposition::Rejected)
    }

    /// Messages queued for sending: in the store and on sender links
    pub fn outgoing_count(&self) -> usize {
        self.outgoing.size() + self.queued(true)
    }

    /// Messages received and not yet taken by `get`
    pub fn incoming_count(&self) -> usize {
        self.incoming.size() + self.queued(false)
    }

    /// Credit the messenger is prepared to hand out: ungranted plus outstanding
    pub fn receiving(&self) -> u32 {
        self.scheduler.receiving()
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    fn dispose(&mut self, tracker: Tracker, flags: UpdateFlags, outcome: Disposition) -> Result<()> {
        if tracker.direction() != Direction::Incoming {
            return Err(Error::argument(
                "invalid tracker, incoming tracker required",
            ));
        }
        self.incoming
            .update(tracker.sequence(), Some(outcome), flags, false, false);
        self.apply_actions();
        Ok(())
    }

    fn queued(&self, sender: bool) -> usize {
        self.connections
            .values()
            .map(|endpoint| {
                let connection = &endpoint.connection;
                connection
                    .link_ids()
                    .into_iter()
                    .filter(|id| {
                        connection
                            .link(*id)
                            .map(|l| l.local_state() == State::Active && l.is_sender() == sender)
                            .unwrap_or(false)
                    })
                    .map(|id| connection.queued(id) as usize)
                    .sum::<usize>()
            })
            .sum()
    }

    pub(crate) fn no_sources(&self) -> bool {
        self.driver.listeners().is_empty() && self.driver.connectors().is_empty()
    }

    pub(crate) fn next_connection_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        id
    }
}

fn encode(msg: &Message) -> Result<Vec<u8>> {
    let mut capacity = ENCODE_BUFFER;
    loop {
        let mut buf = vec![0u8; capacity];
        match msg.encode(&mut buf) {
            Ok(len) => {
                buf.truncate(len);
                return Ok(buf);
            }
            Err(FabricError::Overflow) => {
                capacity = capacity
                    .checked_mul(2)
                    .ok_or_else(|| Error::generic("put: error growing buffer"))?;
            }
            Err(e) => return Err(Error::generic(format!("encode error: {}", e))),
        }
    }
}
