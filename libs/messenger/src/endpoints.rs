//! Per-connection endpoint processing
//!
//! Reconciles the engine's view of a connection with the messenger: moves
//! received deliveries into the incoming store, feeds queued messages to
//! senders, accepts endpoints opened by the peer and tears down the ones it
//! closed.

use std::collections::BTreeMap;
use std::time::Instant;

use courier_core::{Error, Result, Status};
use courier_fabric::{
    driver::{ConnectorId, Sasl}, Condition, Connection, ConnectionId, DeliveryAction, DeliveryId,
    DeliveryRef, Disposition, Driver, LinkId, State, Store,
};
use tracing::{debug, error, info, warn};

use crate::context::{Endpoint, LinkContext, LinkKey};
use crate::messenger::Messenger;
use crate::scheduler::LinkCredit;

/// Receiver links as seen by the credit scheduler
pub(crate) struct EngineLinks<'a, D> {
    pub connections: &'a mut BTreeMap<ConnectionId, Endpoint>,
    pub driver: &'a mut D,
}

impl<D: Driver> EngineLinks<'_, D> {
    fn connection(&self, key: &LinkKey) -> Option<&Connection> {
        self.connections.get(&key.connection).map(|e| &e.connection)
    }

    fn connection_mut(&mut self, key: &LinkKey) -> Option<&mut Connection> {
        self.connections
            .get_mut(&key.connection)
            .map(|e| &mut e.connection)
    }
}

impl<D: Driver> LinkCredit<LinkKey> for EngineLinks<'_, D> {
    fn remote_credit(&self, key: &LinkKey) -> u32 {
        self.connection(key)
            .map(|c| c.remote_credit(key.link))
            .unwrap_or(0)
    }

    fn credit(&self, key: &LinkKey) -> u32 {
        self.connection(key).map(|c| c.credit(key.link)).unwrap_or(0)
    }

    fn flow(&mut self, key: &LinkKey, credit: u32) {
        if let Some(connection) = self.connection_mut(key) {
            connection.flow(key.link, credit);
        }
    }

    fn drain(&self, key: &LinkKey) -> bool {
        self.connection(key)
            .map(|c| c.drain(key.link))
            .unwrap_or(false)
    }

    fn set_drain(&mut self, key: &LinkKey, drain: bool) {
        if let Some(connection) = self.connection_mut(key) {
            connection.set_drain(key.link, drain);
        }
    }

    fn draining(&self, key: &LinkKey) -> bool {
        self.connection(key)
            .map(|c| c.draining(key.link))
            .unwrap_or(false)
    }

    fn drained(&mut self, key: &LinkKey) -> u32 {
        self.connection_mut(key)
            .map(|c| c.drained(key.link))
            .unwrap_or(0)
    }

    fn process(&mut self, key: &LinkKey) {
        let Some(endpoint) = self.connections.get_mut(&key.connection) else {
            return;
        };
        let connector = endpoint.context.connector;
        if let Err(e) = self.driver.process(connector, &mut endpoint.connection) {
            warn!(connector = connector.0, error = %e, "process failed");
        }
    }
}

/// Status an entry takes from its delivery
fn delivery_status(connection: &Connection, delivery: DeliveryId) -> Status {
    connection
        .remote_disposition(delivery)
        .or_else(|| connection.local_disposition(delivery))
        .map(disposition_status)
        .unwrap_or(Status::Pending)
}

fn disposition_status(disposition: Disposition) -> Status {
    match disposition {
        Disposition::Accepted => Status::Accepted,
        Disposition::Rejected => Status::Rejected,
        Disposition::Released => Status::Released,
        Disposition::Modified => Status::Modified,
    }
}

/// Carry out the delivery work a store produced
fn apply_store_actions<C>(connections: &mut BTreeMap<ConnectionId, Endpoint>, store: &mut Store<C>) {
    loop {
        let actions = store.take_actions();
        if actions.is_empty() {
            return;
        }
        for action in actions {
            match action {
                DeliveryAction::Update {
                    entry,
                    delivery,
                    outcome,
                } => {
                    let Some(endpoint) = connections.get_mut(&delivery.connection) else {
                        continue;
                    };
                    let connection = &mut endpoint.connection;
                    let id = delivery.delivery;
                    if connection.local_disposition(id).is_none() {
                        if let Some(outcome) = outcome.or_else(|| connection.remote_disposition(id)) {
                            connection.update(id, outcome);
                        }
                    }
                    store.set_status(entry, delivery_status(connection, id));
                }
                DeliveryAction::Settle { delivery } => {
                    if let Some(endpoint) = connections.get_mut(&delivery.connection) {
                        endpoint.connection.settle(delivery.delivery);
                    }
                }
            }
        }
    }
}

fn report(kind: &str, condition: Option<&Condition>) {
    let Some(condition) = condition else {
        return;
    };
    match &condition.redirect {
        Some(redirect) => info!(
            kind,
            condition = %condition.name,
            host = ?redirect.host,
            port = ?redirect.port,
            "redirecting"
        ),
        None => warn!(
            kind,
            condition = %condition.name,
            description = %condition.description,
            "remote error"
        ),
    }
}

impl<D: Driver> Messenger<D> {
    /// Bring one connection up to date
    pub(crate) fn endpoints(&mut self, id: ConnectionId) {
        let Some(endpoint) = self.connections.get_mut(&id) else {
            return;
        };
        if endpoint.connection.local_state() == State::Uninit {
            endpoint.connection.open();
        }

        let mut cursor = endpoint.connection.work_head();
        while let Some(delivery) = cursor {
            self.work_delivery(id, delivery);
            cursor = self
                .connections
                .get(&id)
                .and_then(|e| e.connection.work_next(delivery));
        }

        let Some(endpoint) = self.connections.get_mut(&id) else {
            return;
        };
        if endpoint.connection.work_head().is_some() {
            return;
        }

        self.open_remote_endpoints(id);
        self.service_links(id);
        self.close_remote_endpoints(id);
        self.close_remote_connection(id);
        self.flow();
    }

    fn work_delivery(&mut self, id: ConnectionId, delivery: DeliveryId) {
        let Some(endpoint) = self.connections.get_mut(&id) else {
            return;
        };
        let connection = &mut endpoint.connection;
        let Some(link) = connection.delivery_link(delivery) else {
            return;
        };
        let sender = connection.link(link).map(|l| l.is_sender()).unwrap_or(false);

        if connection.updated(delivery) {
            if sender {
                if let Some(remote) = connection.remote_disposition(delivery) {
                    connection.update(delivery, remote);
                }
            }
            let status = delivery_status(connection, delivery);
            let reference = DeliveryRef {
                connection: id,
                delivery,
            };
            if sender {
                if let Some(entry) = self.outgoing.entry_for(reference) {
                    self.outgoing.set_status(entry, status);
                }
            } else if let Some(entry) = self.incoming.entry_for(reference) {
                self.incoming.set_status(entry, status);
            }
        }
        connection.clear(delivery);

        if connection.readable(delivery) {
            if let Err(e) = self.pump_in(LinkKey { connection: id, link }) {
                error!(connection = id.0, error = %e, "receive failed");
            }
        }
    }

    // Sessions and links the peer opened are accepted with mirrored termini
    fn open_remote_endpoints(&mut self, id: ConnectionId) {
        let Some(endpoint) = self.connections.get_mut(&id) else {
            return;
        };
        let connection = &mut endpoint.connection;

        for session in connection.session_ids() {
            let uninit = connection
                .session(session)
                .map(|s| s.local_state() == State::Uninit)
                .unwrap_or(false);
            if uninit {
                connection.open_session(session);
            }
        }

        let listener = self.driver.listener_of(endpoint.context.connector);
        let listener_subscription = listener
            .and_then(|l| self.listeners.get(&l))
            .map(|ctx| ctx.subscription.clone());

        let mut receivers = Vec::new();
        for link in connection.link_ids() {
            let Some(l) = connection.link(link) else {
                continue;
            };
            if l.local_state() != State::Uninit {
                continue;
            }
            let source = l.remote_source().clone();
            let target = l.remote_target().clone();
            let is_sender = l.is_sender();
            connection.set_source(link, source.clone());
            connection.set_target(link, target.clone());

            let mut context = LinkContext::default();
            if is_sender {
                if let Some(address) = target.address.or(source.address) {
                    context.serve(&address);
                }
            } else {
                context.subscription = listener_subscription.clone();
                receivers.push(LinkKey { connection: id, link });
            }
            endpoint.links.insert(link, context);
            connection.open_link(link);
        }

        for key in receivers {
            self.scheduler.add_receiver(key);
        }
    }

    // Active links: senders take their queued messages, receivers publish their source
    fn service_links(&mut self, id: ConnectionId) {
        let Some(endpoint) = self.connections.get(&id) else {
            return;
        };
        let mut senders = Vec::new();
        for link in endpoint.connection.link_ids() {
            let Some(l) = endpoint.connection.link(link) else {
                continue;
            };
            if l.local_state() != State::Active || l.remote_state() != State::Active {
                continue;
            }
            if l.is_sender() {
                senders.push(link);
            } else if let Some(subscription) = endpoint
                .links
                .get(&link)
                .and_then(|c| c.subscription.as_ref())
            {
                subscription.set_address(l.remote_source().address.as_deref());
            }
        }

        for link in senders {
            let key = LinkKey { connection: id, link };
            loop {
                match self.pump_out(key) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        error!(connection = id.0, error = %e, "send failed");
                        break;
                    }
                }
            }
        }
    }

    fn close_remote_endpoints(&mut self, id: ConnectionId) {
        let Some(endpoint) = self.connections.get_mut(&id) else {
            return;
        };
        let connection = &mut endpoint.connection;

        for session in connection.session_ids() {
            let Some(s) = connection.session(session) else {
                continue;
            };
            if s.local_state() == State::Active && s.remote_state() == State::Closed {
                report("session", s.remote_condition());
                connection.close_session(session);
            }
        }

        let mut closed = Vec::new();
        for link in connection.link_ids() {
            let Some(l) = connection.link(link) else {
                continue;
            };
            if l.remote_state() == State::Closed && l.local_state() == State::Active {
                report("link", l.remote_condition());
                connection.close_link(link);
                closed.push(link);
            }
        }

        for link in closed {
            self.reclaim_link(id, link);
            if let Some(endpoint) = self.connections.get_mut(&id) {
                endpoint.connection.free_link(link);
            }
        }
    }

    fn close_remote_connection(&mut self, id: ConnectionId) {
        let Some(endpoint) = self.connections.get_mut(&id) else {
            return;
        };
        let connection = &mut endpoint.connection;
        let connector = endpoint.context.connector;

        if connection.local_state() == State::Active && connection.remote_state() == State::Closed {
            let condition = connection.remote_condition().cloned();
            report("connection", condition.as_ref());
            connection.close();

            if let Some(redirect) = condition.and_then(|c| c.redirect) {
                let host = redirect.host.unwrap_or_default();
                let port = redirect.port.unwrap_or_default();
                self.redirect(id, connector, &host, &port);
            }
        } else if self.driver.closed(connector) && connection.remote_state() != State::Closed {
            error!(connection = id.0, "connection aborted");
        }
    }

    /// Move a connection onto a new connector, keeping its sessions and links
    fn redirect(&mut self, id: ConnectionId, old: ConnectorId, host: &str, port: &str) {
        let Some(endpoint) = self.connections.get(&id) else {
            return;
        };
        let user = endpoint.context.user.clone();
        let pass = endpoint.context.pass.clone();
        let secure = endpoint.context.scheme.as_deref() == Some("amqps");
        let sasl = match user {
            Some(user) => Sasl::Plain {
                user,
                password: pass.unwrap_or_default(),
            },
            None => Sasl::Anonymous,
        };
        let security = self.connection_security(secure, sasl);

        let connector = match self.driver.connect(host, port, &security) {
            Ok(connector) => connector,
            Err(e) => {
                error!(host, port, error = %e, "redirect failed");
                return;
            }
        };

        let Some(endpoint) = self.connections.get_mut(&id) else {
            return;
        };
        if let Err(e) = self.driver.process(old, &mut endpoint.connection) {
            warn!(connector = old.0, error = %e, "process failed");
        }
        self.driver.close(old);
        self.by_connector.remove(&old);

        endpoint.connection.reset();
        endpoint.connection.open();
        endpoint.context.connector = connector;
        self.by_connector.insert(connector, id);
        if let Err(e) = self.driver.process(connector, &mut endpoint.connection) {
            warn!(connector = connector.0, error = %e, "process failed");
        }
    }

    /// Move the current delivery of a receiver into the incoming store
    pub(crate) fn pump_in(&mut self, key: LinkKey) -> Result<()> {
        let Some(endpoint) = self.connections.get_mut(&key.connection) else {
            return Ok(());
        };
        let connection = &mut endpoint.connection;
        let Some(delivery) = connection.current(key.link) else {
            return Ok(());
        };
        if !connection.readable(delivery) {
            return Ok(());
        }

        let address = connection
            .link(key.link)
            .and_then(|l| l.source().address.clone())
            .unwrap_or_default();
        let pending = connection
            .delivery_ref(delivery)
            .map(|d| d.pending())
            .unwrap_or(0);

        let mut bytes = vec![0u8; pending];
        let read = connection.recv(key.link, &mut bytes).unwrap_or(0);
        if read != pending {
            return Err(Error::generic(format!(
                "didn't receive pending bytes: {} {}",
                read, pending
            )));
        }
        let end_of_stream = connection.recv(key.link, &mut [0u8; 1]).is_none();
        connection.advance(key.link);

        let subscription = endpoint
            .links
            .get(&key.link)
            .and_then(|c| c.subscription.clone());
        let entry = self.incoming.put(&address, bytes);
        self.incoming.bind(
            entry,
            DeliveryRef {
                connection: key.connection,
                delivery,
            },
        );
        if let Some(subscription) = subscription {
            self.incoming.set_context(entry, subscription);
        }

        let mut links = EngineLinks {
            connections: &mut self.connections,
            driver: &mut self.driver,
        };
        self.scheduler.consumed(&mut links, &key);

        if !end_of_stream {
            self.incoming.free(entry);
            self.apply_actions();
            return Err(Error::generic("end of stream expected"));
        }
        Ok(())
    }

    /// Hand the next queued message for a sender to the engine
    ///
    /// Returns whether a message was handed over. The store entry is
    /// released either way: once handed over, the transport owns the
    /// message.
    pub(crate) fn pump_out(&mut self, key: LinkKey) -> Result<bool> {
        let Some(endpoint) = self.connections.get_mut(&key.connection) else {
            return Ok(false);
        };
        let entry = endpoint
            .links
            .get(&key.link)
            .and_then(|c| {
                c.addresses
                    .iter()
                    .find_map(|address| self.outgoing.get(Some(address)))
            });
        let connection = &mut endpoint.connection;
        let Some(entry) = entry else {
            connection.drained(key.link);
            return Ok(false);
        };

        let bytes = self
            .outgoing
            .entry(entry)
            .map(|e| e.bytes().to_vec())
            .unwrap_or_default();
        let tag = self.next_tag.to_le_bytes().to_vec();
        self.next_tag += 1;

        let delivery = match connection.delivery(key.link, tag) {
            Ok(delivery) => delivery,
            Err(e) => {
                self.outgoing.free(entry);
                self.apply_actions();
                return Err(Error::generic(format!("send error: {}", e)));
            }
        };
        self.outgoing.bind(
            entry,
            DeliveryRef {
                connection: key.connection,
                delivery,
            },
        );

        let sent = connection.send(key.link, &bytes);
        if sent.is_ok() {
            connection.advance(key.link);
        }
        self.outgoing.free(entry);
        self.apply_actions();
        sent.map(|_| true)
            .map_err(|e| Error::generic(format!("send error: {}", e)))
    }

    /// Detach a link from the messenger before it is freed
    ///
    /// Unused receiver credit goes back to the pool. Store entries lose
    /// their binding; ones never written to the wire are aborted.
    pub(crate) fn reclaim_link(&mut self, id: ConnectionId, link: LinkId) {
        let Some(endpoint) = self.connections.get_mut(&id) else {
            return;
        };
        let connection = &endpoint.connection;
        let sender = connection.link(link).map(|l| l.is_sender()).unwrap_or(false);

        for delivery in connection.unsettled(link) {
            let reference = DeliveryRef {
                connection: id,
                delivery,
            };
            let buffered = connection.buffered(delivery);
            if sender {
                if let Some(entry) = self.outgoing.entry_for(reference) {
                    self.outgoing.unbind(entry);
                    if buffered {
                        self.outgoing.set_status(entry, Status::Aborted);
                    }
                }
            } else if let Some(entry) = self.incoming.entry_for(reference) {
                self.incoming.unbind(entry);
            }
        }

        if endpoint.links.contains_key(&link) && !sender {
            let key = LinkKey { connection: id, link };
            let mut links = EngineLinks {
                connections: &mut self.connections,
                driver: &mut self.driver,
            };
            self.scheduler.remove_receiver(&mut links, &key);
        }
        if let Some(endpoint) = self.connections.get_mut(&id) {
            endpoint.links.remove(&link);
        }
    }

    /// Forget a connection whose connector is gone
    ///
    /// Messages still queued for the addresses its senders served can no
    /// longer leave and are aborted, unless another connection serves them.
    pub(crate) fn reclaim(&mut self, id: ConnectionId) {
        let (links, mut addresses) = match self.connections.get(&id) {
            Some(endpoint) => (
                endpoint.connection.link_ids(),
                endpoint
                    .links
                    .values()
                    .flat_map(|c| c.addresses.iter().cloned())
                    .collect::<Vec<_>>(),
            ),
            None => return,
        };
        for link in links {
            self.reclaim_link(id, link);
        }
        self.connections.remove(&id);

        addresses.retain(|address| {
            !self
                .connections
                .values()
                .flat_map(|e| e.links.values())
                .any(|c| c.addresses.iter().any(|a| a == address))
        });
        for address in addresses {
            self.abort_queued(&address);
        }
    }

    /// Abort and drop every message queued for `address`
    fn abort_queued(&mut self, address: &str) {
        while let Some(entry) = self.outgoing.get(Some(address)) {
            debug!(address, "aborting queued message");
            self.outgoing.set_status(entry, Status::Aborted);
            self.outgoing.free(entry);
        }
        self.apply_actions();
    }

    /// Run the credit scheduler over every receiver
    pub(crate) fn flow(&mut self) -> bool {
        let buffered = self.incoming_count() as u32;
        let mut links = EngineLinks {
            connections: &mut self.connections,
            driver: &mut self.driver,
        };
        self.scheduler.flow(&mut links, buffered, Instant::now())
    }

    /// Apply settlements and outcomes queued by the stores
    pub(crate) fn apply_actions(&mut self) {
        apply_store_actions(&mut self.connections, &mut self.outgoing);
        apply_store_actions(&mut self.connections, &mut self.incoming);
    }
}
